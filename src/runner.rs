// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The measurement lifecycle: an explicit phase sequence per benchmark case
//! (build fixtures, run warm-up invocations discarding results, run
//! measured invocations recording timings) instead of annotation-driven
//! discovery.

use crate::fixture::{Fixtures, FIXTURE_LEN};
use crate::reduce::{
    sum_of_squares_parallel, sum_of_squares_serial, BenchCase, ExecMode, SumOfSquaresReducer,
    CASES,
};
use crate::thread_pool::ThreadPoolBuilder;
use std::fmt;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Number of worker threads to spawn in the benchmark pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Parameters of one benchmark run.
pub struct RunnerOptions {
    /// Number of elements in each fixture sequence.
    pub fixture_len: usize,
    /// Number of warm-up invocations per case, whose results are discarded.
    pub warmup_iterations: usize,
    /// Number of measured invocations per case. Must be at least 1.
    pub measured_iterations: usize,
    /// Number of worker threads serving the parallel variants.
    pub num_threads: ThreadCount,
}

impl Default for RunnerOptions {
    /// The canonical configuration: one million elements, 5 warm-up and 5
    /// measured iterations, one worker per available CPU.
    fn default() -> Self {
        Self {
            fixture_len: FIXTURE_LEN,
            warmup_iterations: 5,
            measured_iterations: 5,
            num_threads: ThreadCount::AvailableParallelism,
        }
    }
}

/// The error raised when the harness cannot start or a run must be failed.
///
/// This is the only checked failure: it propagates out of `main` and
/// terminates the process. Everything else (worker panics, out-of-memory)
/// aborts the run by panicking.
#[derive(Debug)]
pub enum HarnessError {
    /// The options are inconsistent.
    InvalidOptions(&'static str),
    /// The available parallelism could not be determined.
    AvailableParallelism(std::io::Error),
    /// A measured invocation returned a different value than an earlier
    /// invocation of the same case against the same fixture.
    ResultMismatch {
        /// Name of the offending case.
        case: &'static str,
        /// Value returned by the first measured invocation.
        expected: i32,
        /// Value returned by the mismatching invocation.
        actual: i32,
    },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::InvalidOptions(msg) => write!(f, "invalid runner options: {msg}"),
            HarnessError::AvailableParallelism(e) => {
                write!(f, "failed to determine the available parallelism: {e}")
            }
            HarnessError::ResultMismatch {
                case,
                expected,
                actual,
            } => write!(
                f,
                "case {case} returned {actual}, but an earlier invocation returned {expected}"
            ),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::AvailableParallelism(e) => Some(e),
            _ => None,
        }
    }
}

/// Drives the full benchmark matrix through the measurement lifecycle.
pub struct Runner {
    options: RunnerOptions,
    num_threads: NonZeroUsize,
}

impl Runner {
    /// Validates the options and resolves the worker thread count.
    pub fn new(options: RunnerOptions) -> Result<Self, HarnessError> {
        if options.measured_iterations == 0 {
            return Err(HarnessError::InvalidOptions(
                "at least one measured iteration is required",
            ));
        }
        let num_threads = match options.num_threads {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .map_err(HarnessError::AvailableParallelism)?,
            ThreadCount::Count(count) => count,
        };
        Ok(Self {
            options,
            num_threads,
        })
    }

    /// Runs every case of the benchmark matrix and collects the report.
    ///
    /// Each case gets a fresh measurement lifecycle: fixtures are built
    /// before its warm-up phase and dropped before the next case starts,
    /// so no lifecycle ever reuses a previous lifecycle's fixtures.
    pub fn run(&self) -> Result<Report, HarnessError> {
        log::info!(
            "starting run: {} elements, {} warm-up + {} measured iterations, {} worker threads",
            self.options.fixture_len,
            self.options.warmup_iterations,
            self.options.measured_iterations,
            self.num_threads
        );
        let mut results = Vec::with_capacity(CASES.len());
        for case in &CASES {
            results.push(self.run_case(case)?);
        }
        log::info!("run finished");
        Ok(Report {
            fixture_len: self.options.fixture_len,
            results,
        })
    }

    /// Runs one case through its whole lifecycle.
    fn run_case(&self, case: &BenchCase) -> Result<CaseResult, HarnessError> {
        log::info!(
            "[{}] building fixtures of {} elements",
            case.name,
            self.options.fixture_len
        );
        let fixtures = Fixtures::build(self.options.fixture_len);
        match case.mode {
            ExecMode::Serial => self.measure(case, || {
                sum_of_squares_serial(case.container, case.accum, &fixtures)
            }),
            // The pool outlives all iterations of the case, so the measured
            // cost is the fan-out/fan-in round, not thread spawning.
            ExecMode::Parallel => ThreadPoolBuilder {
                num_threads: self.num_threads,
            }
            .scope(
                || SumOfSquaresReducer::new(case.accum),
                |thread_pool| {
                    self.measure(case, || {
                        sum_of_squares_parallel(case.container, &fixtures, &thread_pool)
                    })
                },
            ),
        }
    }

    /// Runs the warm-up and measured phases of one case.
    ///
    /// Every measured invocation must return the same value against the
    /// immutable fixture; a mismatch fails the whole run.
    fn measure(
        &self,
        case: &BenchCase,
        mut invoke: impl FnMut() -> i32,
    ) -> Result<CaseResult, HarnessError> {
        log::info!(
            "[{}] running {} warm-up iterations",
            case.name,
            self.options.warmup_iterations
        );
        for _ in 0..self.options.warmup_iterations {
            black_box(invoke());
        }

        log::info!(
            "[{}] running {} measured iterations",
            case.name,
            self.options.measured_iterations
        );
        let mut timings = Vec::with_capacity(self.options.measured_iterations);
        let mut value = 0i32;
        for iteration in 0..self.options.measured_iterations {
            let start = Instant::now();
            let result = black_box(invoke());
            let elapsed = start.elapsed();
            if iteration == 0 {
                value = result;
            } else if result != value {
                return Err(HarnessError::ResultMismatch {
                    case: case.name,
                    expected: value,
                    actual: result,
                });
            }
            timings.push(elapsed);
            log::debug!("[{}] iteration {iteration}: {elapsed:?}", case.name);
        }

        Ok(CaseResult {
            name: case.name,
            value,
            timings,
        })
    }
}

/// Timings recorded for one case.
pub struct CaseResult {
    /// Name of the case.
    pub name: &'static str,
    /// Value returned by every measured invocation.
    pub value: i32,
    /// Wall-clock duration of each measured invocation.
    pub timings: Vec<Duration>,
}

impl CaseResult {
    /// Shortest measured iteration.
    pub fn min(&self) -> Duration {
        self.timings.iter().min().copied().unwrap_or_default()
    }

    /// Longest measured iteration.
    pub fn max(&self) -> Duration {
        self.timings.iter().max().copied().unwrap_or_default()
    }

    /// Mean measured iteration.
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.timings.len()) {
            Ok(n) if n > 0 => self.timings.iter().sum::<Duration>() / n,
            _ => Duration::ZERO,
        }
    }

    /// Throughput of the mean iteration, in elements per second.
    pub fn throughput(&self, elements: usize) -> f64 {
        let mean = self.mean().as_secs_f64();
        if mean == 0.0 {
            return 0.0;
        }
        elements as f64 / mean
    }
}

/// The aggregated results of one benchmark run.
pub struct Report {
    /// Number of elements in each fixture sequence.
    pub fixture_len: usize,
    /// Per-case results, in matrix order.
    pub results: Vec<CaseResult>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<36} {:>6} {:>12} {:>12} {:>12} {:>12} {:>12}",
            "benchmark", "iters", "value", "min", "mean", "max", "Melem/s"
        )?;
        for result in &self.results {
            writeln!(
                f,
                "{:<36} {:>6} {:>12} {:>12.3?} {:>12.3?} {:>12.3?} {:>12.2}",
                result.name,
                result.timings.len(),
                result.value,
                result.min(),
                result.mean(),
                result.max(),
                result.throughput(self.fixture_len) / 1e6,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_options() -> RunnerOptions {
        RunnerOptions {
            fixture_len: 10,
            warmup_iterations: 1,
            measured_iterations: 2,
            num_threads: ThreadCount::try_from(2).unwrap(),
        }
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_default_options_encode_the_canonical_run() {
        let options = RunnerOptions::default();
        assert_eq!(options.fixture_len, FIXTURE_LEN);
        assert_eq!(options.warmup_iterations, 5);
        assert_eq!(options.measured_iterations, 5);
        assert_eq!(options.num_threads, ThreadCount::AvailableParallelism);
    }

    #[test]
    fn test_runner_rejects_zero_measured_iterations() {
        let options = RunnerOptions {
            measured_iterations: 0,
            ..small_options()
        };
        assert!(matches!(
            Runner::new(options),
            Err(HarnessError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_small_run_covers_the_whole_matrix() {
        let runner = Runner::new(small_options()).unwrap();
        let report = runner.run().unwrap();
        assert_eq!(report.results.len(), CASES.len());
        for (result, case) in report.results.iter().zip(&CASES) {
            assert_eq!(result.name, case.name);
            // Sum of squares of 0..10.
            assert_eq!(result.value, 285);
            assert_eq!(result.timings.len(), 2);
        }
    }

    #[test]
    fn test_report_is_printable() {
        let runner = Runner::new(small_options()).unwrap();
        let report = runner.run().unwrap();
        let rendered = format!("{report}");
        assert!(rendered.contains("benchmark"));
        for case in &CASES {
            assert!(rendered.contains(case.name), "{}", case.name);
        }
        assert!(rendered.contains("285"));
    }

    #[test]
    fn test_case_result_statistics() {
        let result = CaseResult {
            name: "stats",
            value: 0,
            timings: vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
            ],
        };
        assert_eq!(result.min(), Duration::from_millis(10));
        assert_eq!(result.mean(), Duration::from_millis(20));
        assert_eq!(result.max(), Duration::from_millis(30));
        assert_eq!(result.throughput(1000), 50_000.0);
    }

    #[test]
    fn test_empty_case_result_statistics() {
        let result = CaseResult {
            name: "empty",
            value: 0,
            timings: Vec::new(),
        };
        assert_eq!(result.min(), Duration::ZERO);
        assert_eq!(result.mean(), Duration::ZERO);
        assert_eq!(result.max(), Duration::ZERO);
        assert_eq!(result.throughput(1000), 0.0);
    }
}
