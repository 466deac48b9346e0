//! Engine implementation that forwards every call over the bridge

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{Call, Correlator};
use crate::core::{BrowseError, ContextId, FrameId, PageId, PageInfo, Result, Scope};
use crate::dom::{Document, NodeId, SerializedDocument};
use crate::engine::{Condition, CookieOp, Engine, HistoryStep, Interaction, StorageOp, Target};
use crate::protocol::command::{FrameLocator, PaperFormat, WaitUntil};

/// Slack past an operation's own duration before the bridge gives up on it
pub const BRIDGE_HEADROOM: Duration = Duration::from_secs(5);

/// Engine whose browser lives behind an attached bridge peer
#[derive(Debug, Clone)]
pub struct BridgeEngine {
    correlator: Correlator,
}

impl BridgeEngine {
    pub fn new(correlator: Correlator) -> Self {
        Self { correlator }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    async fn call<T: DeserializeOwned>(&self, call: Call) -> Result<T> {
        self.call_lasting(call, Duration::ZERO).await
    }

    /// Call an operation that may itself run for `lasting`; the peer's own
    /// timeout must fire before the bridge deadline does.
    async fn call_lasting<T: DeserializeOwned>(&self, call: Call, lasting: Duration) -> Result<T> {
        let message = serde_json::to_value(&call)?;
        let deadline = self
            .correlator
            .timeout()
            .max(lasting.saturating_add(BRIDGE_HEADROOM));
        let result = self.correlator.request_within(message, deadline).await?;
        serde_json::from_value(result)
            .map_err(|e| BrowseError::engine(format!("unexpected bridge reply: {}", e)))
    }

    async fn bytes(&self, call: Call) -> Result<Vec<u8>> {
        let encoded: String = self.call(call).await?;
        STANDARD
            .decode(encoded)
            .map_err(|e| BrowseError::engine(format!("invalid base64 from bridge: {}", e)))
    }
}

#[async_trait]
impl Engine for BridgeEngine {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn launch(&self) -> Result<()> {
        self.call(Call::Launch).await
    }

    async fn new_context(&self) -> Result<ContextId> {
        self.call(Call::NewContext).await
    }

    async fn close_context(&self, context: ContextId) -> Result<()> {
        self.call(Call::CloseContext { context }).await
    }

    async fn new_page(&self, context: ContextId) -> Result<PageId> {
        self.call(Call::NewPage { context }).await
    }

    async fn close_page(&self, page: PageId) -> Result<()> {
        self.call(Call::ClosePage { page }).await
    }

    async fn navigate(&self, page: PageId, url: &str, wait_until: WaitUntil) -> Result<PageInfo> {
        self.call(Call::Navigate {
            page,
            url: url.to_string(),
            wait_until,
        })
        .await
    }

    async fn history(&self, page: PageId, step: HistoryStep) -> Result<PageInfo> {
        self.call(Call::History { page, step }).await
    }

    async fn page_info(&self, page: PageId) -> Result<PageInfo> {
        self.call(Call::PageInfo { page }).await
    }

    async fn find_frame(&self, page: PageId, locator: &FrameLocator) -> Result<FrameId> {
        self.call(Call::FindFrame {
            page,
            locator: locator.clone(),
        })
        .await
    }

    async fn document(&self, scope: Scope) -> Result<Document> {
        let remote: SerializedDocument = self.call(Call::Document { scope }).await?;
        Document::from_remote(&remote)
    }

    async fn node_attached(&self, scope: Scope, node: NodeId) -> Result<bool> {
        self.call(Call::NodeAttached { scope, node }).await
    }

    async fn interact(&self, scope: Scope, target: &Target, interaction: &Interaction) -> Result<Value> {
        let lasting = match interaction {
            Interaction::Type {
                text,
                delay_ms: Some(delay),
            } => Duration::from_millis(delay.saturating_mul(text.chars().count() as u64)),
            _ => Duration::ZERO,
        };
        self.call_lasting(
            Call::Interact {
                scope,
                target: target.clone(),
                interaction: interaction.clone(),
            },
            lasting,
        )
        .await
    }

    async fn wait_for(&self, scope: Scope, condition: &Condition, timeout_ms: u64) -> Result<()> {
        self.call_lasting(
            Call::WaitFor {
                scope,
                condition: condition.clone(),
                timeout_ms,
            },
            Duration::from_millis(timeout_ms),
        )
        .await
    }

    async fn screenshot(&self, scope: Scope, target: Option<&Target>, full_page: bool) -> Result<Vec<u8>> {
        self.bytes(Call::Screenshot {
            scope,
            target: target.cloned(),
            full_page,
        })
        .await
    }

    async fn evaluate(&self, scope: Scope, script: &str, args: &[Value]) -> Result<Value> {
        self.call(Call::Evaluate {
            scope,
            script: script.to_string(),
            args: args.to_vec(),
        })
        .await
    }

    async fn cookies(&self, context: ContextId, op: &CookieOp) -> Result<Value> {
        self.call(Call::Cookies {
            context,
            op: op.clone(),
        })
        .await
    }

    async fn storage(&self, scope: Scope, op: &StorageOp) -> Result<Value> {
        self.call(Call::Storage {
            scope,
            op: op.clone(),
        })
        .await
    }

    async fn pdf(&self, page: PageId, format: PaperFormat) -> Result<Vec<u8>> {
        self.bytes(Call::Pdf { page, format }).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.call(Call::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decoded, FrameCodec};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn test_wait_outlasting_default_deadline_still_settles() {
        // Default deadline is shorter than the wait the peer is allowed
        let correlator = Correlator::new(Duration::from_millis(50));
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        correlator.attach(ours).await;
        let mut peer = Framed::new(theirs, FrameCodec);
        let engine = BridgeEngine::new(correlator.clone());

        let waiting = tokio::spawn(async move {
            engine
                .wait_for(Scope::main(PageId(1)), &Condition::Text("Done".into()), 300)
                .await
        });
        let request = match peer.next().await {
            Some(Ok(Decoded::Message(value))) => value,
            other => panic!("expected a request, got {:?}", other),
        };
        assert_eq!(request["method"], "wait_for");
        assert_eq!(request["params"]["timeout_ms"], 300);

        // The peer reports its own timeout after the full wait
        tokio::time::sleep(Duration::from_millis(300)).await;
        peer.send(json!({
            "id": request["id"],
            "error": {"kind": "timeout", "message": "text Done", "ms": 300}
        }))
        .await
        .unwrap();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, BrowseError::Timeout { ms: 300, .. }), "{:?}", err);
        assert_eq!(correlator.pending().await, 0);
    }
}
