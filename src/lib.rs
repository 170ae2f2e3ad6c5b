// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod fixture;
mod reduce;
mod runner;
mod thread_pool;

pub use fixture::{ChainSequence, ChainSlice, ChainValues, Fixtures, FIXTURE_LEN};
pub use reduce::{
    sum_of_squares_parallel, sum_of_squares_serial, AccumKind, BenchCase, Container, ExecMode,
    SubRange, SumOfSquaresReducer, CASES,
};
pub use runner::{CaseResult, HarnessError, Report, Runner, RunnerOptions, ThreadCount};
pub use thread_pool::{TaskReducer, ThreadPool, ThreadPoolBuilder};
