//! Subprocess execution for backend CLIs.
//!
//! The executor runs one external command under a pseudo-terminal or plain
//! pipes, forwards termination signals while it runs, and normalizes the
//! result into an [`ExecOutcome`].

mod executor;
mod pty;
mod signals;

pub use executor::{
    CommandSpec, EXIT_CANCELED, EXIT_FAILURE, EXIT_TIMEOUT, ExecError, ExecOutcome, ExecRequest,
    OutputMode, ProcessExecutor, TerminalMode,
};
pub use signals::{Interrupt, SignalForwarder};
