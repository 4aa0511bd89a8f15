//! Context validation and compression.
//!
//! The gate is a pure function over text: no network, no filesystem. Failure
//! here is always fatal to the current attempt.

mod bundle;
mod gate;

pub use bundle::ContextBundle;
pub use gate::{ContextGate, ContextMetrics};
