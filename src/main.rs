// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Entry point running the full benchmark matrix with the canonical
//! hard-coded configuration. No command-line flags are parsed; the exit
//! code reflects whether the harness could start and complete the run.

use squarebench::{HarnessError, Runner, RunnerOptions};

fn main() -> Result<(), HarnessError> {
    env_logger::init();
    let runner = Runner::new(RunnerOptions::default())?;
    let report = runner.run()?;
    print!("{report}");
    Ok(())
}
