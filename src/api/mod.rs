//! Outbound integration with the external order layer.

mod execution;
mod types;

#[cfg(test)]
pub(crate) use execution::testing;
pub use execution::{DryRunDelegate, ExecutionDelegate, WebhookDelegate};
pub use types::{ExecutionAction, ExecutionRequest};
