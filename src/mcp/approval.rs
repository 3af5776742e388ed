//! Tool-execution approval policy.
//!
//! Tools outside a server's auto-approve set go through this hook before
//! execution. The default implementation grants everything — it is an
//! extension point for a real confirmation channel (e.g. an operator
//! prompt), **not** a security boundary. Deployments that need one must
//! inject their own policy.

use async_trait::async_trait;
use serde_json::Value;

/// Decides whether a non-auto-approved tool call may execute.
#[async_trait]
pub trait ToolApprovalPolicy: Send + Sync {
    async fn approve(
        &self,
        device_id: &str,
        server_name: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> bool;
}

/// Grants every request. See the module docs for why this exists.
pub struct AlwaysApprove;

#[async_trait]
impl ToolApprovalPolicy for AlwaysApprove {
    async fn approve(&self, _: &str, _: &str, _: &str, _: &Value) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct DenyAll;

    #[async_trait]
    impl ToolApprovalPolicy for DenyAll {
        async fn approve(&self, _: &str, _: &str, _: &str, _: &Value) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn policies_are_object_safe_and_answer() {
        let grant: Box<dyn ToolApprovalPolicy> = Box::new(AlwaysApprove);
        let deny: Box<dyn ToolApprovalPolicy> = Box::new(DenyAll);
        assert!(grant.approve("dev", "srv", "tool", &json!({})).await);
        assert!(!deny.approve("dev", "srv", "tool", &json!({})).await);
    }
}
