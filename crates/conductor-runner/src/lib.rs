//! Conductor Runner Library
//!
//! Everything needed to drive AI coding CLIs as subprocesses:
//! - Process execution under a PTY or pipes, with signal forwarding
//! - Backend command construction and output parsing
//! - Per-backend circuit breakers
//! - Cross-process advisory file locks
//! - A lock-guarded JSON session store
//! - Parallel, chained and comparison task orchestration

pub mod backend;
pub mod breaker;
pub mod lock;
pub mod orchestration;
pub mod session;
pub mod subprocess;
