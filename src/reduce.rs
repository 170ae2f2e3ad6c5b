// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The measured operations: sum-of-squares reductions parameterized over
//! container layout, execution mode and accumulator representation.
//!
//! All variants compute the same reduction: square each element with
//! wrapping multiplication, then fold with identity `0` and wrapping
//! addition. The wrapping behavior matters: the sum of the first million
//! squares exceeds `i32::MAX`, and the silent two's-complement wraparound
//! is the documented behavior of the benchmark. Addition is associative
//! modulo 2³², so parallel and serial variants of an operation return
//! bit-identical results.

use crate::fixture::{ChainSlice, Fixtures};
use crate::thread_pool::{TaskReducer, ThreadPool, ThreadPoolBuilder};
use std::num::NonZeroUsize;

/// Which fixture container an operation reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    /// The contiguous array sequence.
    Array,
    /// The linked chain sequence.
    Chain,
}

/// Whether an operation traverses the sequence on the invoking thread or
/// fans it out to the worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    /// The whole reduction runs on the invoking thread.
    Serial,
    /// The reduction is split into contiguous sub-ranges reduced on worker
    /// threads, whose partial sums are folded on the invoking thread.
    Parallel,
}

/// How intermediate values are represented during the reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumKind {
    /// Squared values and the running sum stay in primitive registers.
    Primitive,
    /// Every squared value and every fold step allocates a fresh
    /// [`Box<i32>`], reproducing the cost profile of a boxed-integer
    /// pipeline.
    Boxed,
}

/// One cell of the benchmark matrix.
#[derive(Clone, Copy)]
pub struct BenchCase {
    /// Name of the operation, used in reports, logs and benchmark IDs.
    pub name: &'static str,
    /// Which fixture container this case reads.
    pub container: Container,
    /// Whether this case runs serially or on the worker pool.
    pub mode: ExecMode,
    /// Accumulator representation used by this case.
    pub accum: AccumKind,
}

/// The six measured operations.
///
/// The chain×primitive combinations are representable but not part of the
/// matrix; the benchmark only measures the chain through the boxed
/// pipeline.
pub const CASES: [BenchCase; 6] = [
    BenchCase {
        name: "fast_sum_of_squares",
        container: Container::Array,
        mode: ExecMode::Parallel,
        accum: AccumKind::Primitive,
    },
    BenchCase {
        name: "serial_fast_sum_of_squares",
        container: Container::Array,
        mode: ExecMode::Serial,
        accum: AccumKind::Primitive,
    },
    BenchCase {
        name: "intermediate_sum_of_squares",
        container: Container::Array,
        mode: ExecMode::Parallel,
        accum: AccumKind::Boxed,
    },
    BenchCase {
        name: "serial_intermediate_sum_of_squares",
        container: Container::Array,
        mode: ExecMode::Serial,
        accum: AccumKind::Boxed,
    },
    BenchCase {
        name: "slow_sum_of_squares",
        container: Container::Chain,
        mode: ExecMode::Parallel,
        accum: AccumKind::Boxed,
    },
    BenchCase {
        name: "serial_slow_sum_of_squares",
        container: Container::Chain,
        mode: ExecMode::Serial,
        accum: AccumKind::Boxed,
    },
];

impl BenchCase {
    /// Runs this case once against the given fixtures, spinning up a scoped
    /// worker pool for the parallel variants.
    ///
    /// This is the convenience entry for one-shot invocations; measurement
    /// loops should keep a pool alive across invocations instead (see
    /// [`Runner`](crate::Runner)).
    pub fn run(&self, fixtures: &Fixtures, num_threads: NonZeroUsize) -> i32 {
        match self.mode {
            ExecMode::Serial => sum_of_squares_serial(self.container, self.accum, fixtures),
            ExecMode::Parallel => ThreadPoolBuilder { num_threads }.scope(
                || SumOfSquaresReducer::new(self.accum),
                |thread_pool| sum_of_squares_parallel(self.container, fixtures, &thread_pool),
            ),
        }
    }
}

/// A contiguous sub-range of one fixture container, handed to a worker
/// thread as one fan-out task.
pub enum SubRange<'a> {
    /// A window into the array sequence.
    Array(&'a [i32]),
    /// A window into the chain sequence.
    Chain(ChainSlice<'a>),
}

/// Per-worker reducer computing the sum of squares of one [`SubRange`].
pub struct SumOfSquaresReducer {
    accum: AccumKind,
}

impl SumOfSquaresReducer {
    /// Creates a reducer using the given accumulator representation.
    pub fn new(accum: AccumKind) -> Self {
        Self { accum }
    }
}

impl<'a> TaskReducer<SubRange<'a>, i32> for SumOfSquaresReducer {
    fn process(&self, task: SubRange<'a>) -> i32 {
        match task {
            SubRange::Array(values) => reduce_values(self.accum, values.iter().copied()),
            SubRange::Chain(slice) => reduce_values(self.accum, slice.values()),
        }
    }
}

/// Reduces the whole container on the invoking thread.
pub fn sum_of_squares_serial(container: Container, accum: AccumKind, fixtures: &Fixtures) -> i32 {
    match container {
        Container::Array => reduce_values(accum, fixtures.array.iter().copied()),
        Container::Chain => reduce_values(accum, fixtures.chain.iter()),
    }
}

/// Reduces the container on the given worker pool: fans out into at most
/// one contiguous sub-range per worker, reduces each sub-range
/// independently with the same identity and operator, and folds the partial
/// sums pairwise on the invoking thread.
///
/// The pool's reducer must use the accumulator representation the caller
/// wants to measure; see [`SumOfSquaresReducer`].
pub fn sum_of_squares_parallel<'f>(
    container: Container,
    fixtures: &'f Fixtures,
    thread_pool: &ThreadPool<'_, SubRange<'f>, i32>,
) -> i32 {
    let tasks = fan_out(container, fixtures, thread_pool.num_threads().get());
    thread_pool.process_tasks(tasks).fold(0i32, i32::wrapping_add)
}

/// Splits one container into at most `max_chunks` contiguous sub-ranges.
///
/// Splitting the array is O(1) per chunk; splitting the chain walks the
/// whole chain once, which is part of the measured cost of the parallel
/// chain variant. An empty container produces no tasks.
fn fan_out<'f>(container: Container, fixtures: &'f Fixtures, max_chunks: usize) -> Vec<SubRange<'f>> {
    match container {
        Container::Array => {
            let values = fixtures.array.as_slice();
            if values.is_empty() {
                return Vec::new();
            }
            values
                .chunks(values.len().div_ceil(max_chunks))
                .map(SubRange::Array)
                .collect()
        }
        Container::Chain => fixtures
            .chain
            .slices(max_chunks)
            .into_iter()
            .map(SubRange::Chain)
            .collect(),
    }
}

/// The reduction kernel shared by all variants: square each value, fold
/// with identity `0` and wrapping addition.
fn reduce_values(accum: AccumKind, values: impl Iterator<Item = i32>) -> i32 {
    match accum {
        AccumKind::Primitive => values.fold(0i32, |acc, x| acc.wrapping_add(x.wrapping_mul(x))),
        AccumKind::Boxed => *values
            .map(|x| Box::new(x.wrapping_mul(x)))
            .fold(Box::new(0i32), |acc, x| Box::new(acc.wrapping_add(*x))),
    }
}
