//! Circuit breakers for backend fault isolation.
//!
//! A [`CircuitBreaker`] tracks consecutive failures of one backend and
//! rejects calls while the backend looks unhealthy. [`BreakerRegistry`]
//! hands out one breaker per backend name.

mod registry;
mod state;

pub use registry::BreakerRegistry;
pub use state::{
    BreakerConfig, BreakerError, BreakerState, BreakerStats, CircuitBreaker, StateChangeCallback,
};
