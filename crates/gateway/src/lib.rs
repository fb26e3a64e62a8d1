//! Tool Execution Gateway: owns the connection to the external browser
//! automation process and forwards tool calls to it over newline-delimited
//! JSON-RPC on the child's stdio.

pub mod client;

use async_trait::async_trait;
use serde_json::Value;
use webpilot_core::types::{ToolResult, ToolSpec};
use webpilot_core::Result;

pub use client::AutomationGateway;

/// The seam the agent loop depends on. Implemented by [`AutomationGateway`];
/// tests substitute their own executor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult>;

    /// Cached catalog; no network round-trip.
    fn list_tools(&self) -> Vec<ToolSpec>;
}
