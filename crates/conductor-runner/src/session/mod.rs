//! Durable per-run session records.

mod store;
mod types;

pub use store::{SessionStore, StoreError};
pub use types::{NewSession, Session, SessionFilter, SessionStatus};
