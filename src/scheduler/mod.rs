//! Retry timing shared by the Convergence Engine, Pool Maintainer, and
//! Provider Adapter.

pub mod backoff;

pub use backoff::{backoff_sleep, next_backoff, BackoffConfig};
