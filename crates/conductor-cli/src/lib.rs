//! Conductor CLI Library
//!
//! Command-line front end over the runner: single runs and resume, parallel
//! batches, chains, comparisons and session maintenance.

pub mod backends_cmd;
pub mod batch_cmd;
pub mod cli;
pub mod report_fmt;
pub mod run_cmd;
pub mod session_cmd;
pub mod setup;
