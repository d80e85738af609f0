//! stageplan - plan the initialize task of a CI stage
//!
//! ## Commands
//!
//! - `stageplan plan` - Build the initialize plan of a stage request
//! - `stageplan resources` - Print the peak CPU or memory of a stage
//! - `stageplan validate` - Validate a stage request without planning it
//! - `stageplan completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Plan a stage with fixed tokens and print the task as YAML
//! stageplan plan --request stage.yaml --format yaml
//!
//! # Keep sweeping outputs between attempts of the same stage
//! stageplan plan --request stage.yaml --state outputs.json
//!
//! # Peak memory in MiB
//! stageplan resources --request stage.yaml --kind memory
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if std::env::var("STAGEPLAN_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
