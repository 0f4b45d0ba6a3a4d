//! An upstream that fails every attempt with a server-directed retry hint
//! exhausts the proxy's retry budget: four total attempts, each delay
//! honoring the hint, and the final error wraps the last failure message.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use zoea_nova::tool_proxy::{CallerContext, ToolError, ToolMetadata, ToolProxy, ToolResult, UpstreamClient};

struct AlwaysFailsUpstream {
    attempts: AtomicUsize,
}

#[async_trait]
impl UpstreamClient for AlwaysFailsUpstream {
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(vec![])
    }

    async fn call_tool(
        &self,
        _name: &str,
        _args: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn std::error::Error + Send + Sync>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err("HTTP 500: Try again in 1 second".into())
    }
}

#[tokio::test]
async fn retry_budget_exhausts_after_four_attempts() {
    let upstream = Arc::new(AlwaysFailsUpstream {
        attempts: AtomicUsize::new(0),
    });
    let proxy = ToolProxy::new(Some(upstream.clone()));
    let caller = CallerContext {
        mysis_id: Uuid::new_v4(),
        mysis_name: "scout".to_string(),
    };

    let started = Instant::now();
    let err = proxy
        .call_tool(&caller, "move", serde_json::json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(upstream.attempts.load(Ordering::SeqCst), 4, "one initial attempt plus three retries");
    assert!(
        elapsed >= Duration::from_secs(3),
        "three retry delays honoring the 1-second hint should have elapsed, got {:?}",
        elapsed
    );
    match err {
        ToolError::RetryExhausted(message) => assert!(message.contains("500"), "error should wrap the last failure: {}", message),
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
}
