//! Peer end of the bridge: answers engine calls from a local engine

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use super::{Call, WireError};
use crate::core::{BrowseError, Result};
use crate::engine::Engine;
use crate::protocol::{Decoded, FrameCodec};

/// Serve bridge requests from `engine` until the stream closes.
///
/// Calls are answered one at a time in arrival order.
pub async fn serve<S>(stream: S, engine: Arc<dyn Engine>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec);
    while let Some(frame) = framed.next().await {
        let mut request = match frame? {
            Decoded::Message(value) => value,
            Decoded::Malformed(reason) => {
                tracing::warn!(reason = %reason, "dropping malformed bridge request");
                continue;
            }
        };
        let id = request
            .as_object_mut()
            .and_then(|map| map.remove("id"))
            .unwrap_or(Value::Null);

        let outcome = match serde_json::from_value::<Call>(request) {
            Ok(call) => {
                tracing::debug!(id = %id, call = ?call, "bridge call");
                dispatch(engine.as_ref(), call).await
            }
            Err(e) => Err(BrowseError::engine(format!("invalid bridge call: {}", e))),
        };
        let reply = match outcome {
            Ok(result) => json!({ "id": id, "result": result }),
            Err(e) => json!({ "id": id, "error": WireError::from(&e) }),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

/// Run one call against the engine and encode its result
pub async fn dispatch(engine: &dyn Engine, call: Call) -> Result<Value> {
    let value = match call {
        Call::Launch => {
            engine.launch().await?;
            Value::Null
        }
        Call::Shutdown => {
            engine.shutdown().await?;
            Value::Null
        }
        Call::NewContext => json!(engine.new_context().await?),
        Call::CloseContext { context } => {
            engine.close_context(context).await?;
            Value::Null
        }
        Call::NewPage { context } => json!(engine.new_page(context).await?),
        Call::ClosePage { page } => {
            engine.close_page(page).await?;
            Value::Null
        }
        Call::Navigate {
            page,
            url,
            wait_until,
        } => serde_json::to_value(engine.navigate(page, &url, wait_until).await?)?,
        Call::History { page, step } => serde_json::to_value(engine.history(page, step).await?)?,
        Call::PageInfo { page } => serde_json::to_value(engine.page_info(page).await?)?,
        Call::FindFrame { page, locator } => json!(engine.find_frame(page, &locator).await?),
        Call::Document { scope } => serde_json::to_value(engine.document(scope).await?.to_remote())?,
        Call::NodeAttached { scope, node } => json!(engine.node_attached(scope, node).await?),
        Call::Interact {
            scope,
            target,
            interaction,
        } => engine.interact(scope, &target, &interaction).await?,
        Call::WaitFor {
            scope,
            condition,
            timeout_ms,
        } => {
            engine.wait_for(scope, &condition, timeout_ms).await?;
            Value::Null
        }
        Call::Screenshot {
            scope,
            target,
            full_page,
        } => json!(STANDARD.encode(engine.screenshot(scope, target.as_ref(), full_page).await?)),
        Call::Evaluate { scope, script, args } => engine.evaluate(scope, &script, &args).await?,
        Call::Cookies { context, op } => engine.cookies(context, &op).await?,
        Call::Storage { scope, op } => engine.storage(scope, &op).await?,
        Call::Pdf { page, format } => json!(STANDARD.encode(engine.pdf(page, format).await?)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bridge::{BridgeEngine, Correlator};
    use crate::engine::MemoryEngine;
    use crate::executor::Executor;

    async fn bridged() -> (MemoryEngine, Executor) {
        let memory = MemoryEngine::new();
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ours, theirs) = tokio::io::duplex(1024 * 1024);
        correlator.attach(ours).await;
        let served: Arc<dyn Engine> = Arc::new(memory.clone());
        tokio::spawn(async move { serve(theirs, served).await });
        (memory, Executor::new(Arc::new(BridgeEngine::new(correlator))))
    }

    #[tokio::test]
    async fn test_executor_over_bridge() {
        let (memory, mut exec) = bridged().await;
        let resp = exec
            .handle_value(&json!({"id": "1", "action": "navigate", "url": "https://example.test/login"}))
            .await;
        assert_eq!(resp.data.unwrap()["title"], "Login");

        let resp = exec
            .handle_value(&json!({"id": "2", "action": "snapshot", "interactive": true}))
            .await;
        assert!(resp.data.unwrap()["snapshot"]
            .as_str()
            .unwrap()
            .contains("textbox \"Email\" [ref=e1]"));

        let resp = exec
            .handle_value(&json!({"id": "3", "action": "fill", "selector": "@e1", "value": "a@b.test"}))
            .await;
        assert!(resp.success, "{:?}", resp.error);
        assert!(memory
            .events()
            .await
            .iter()
            .any(|e| e.contains("fill textbox \"Email\" with \"a@b.test\"")));
    }

    #[tokio::test]
    async fn test_engine_errors_cross_the_bridge() {
        let (_, mut exec) = bridged().await;
        let resp = exec
            .handle_value(&json!({"id": "1", "action": "click", "selector": "#nope"}))
            .await;
        assert_eq!(resp.error.as_deref(), Some("Element not found: #nope"));

        let resp = exec
            .handle_value(&json!({"id": "2", "action": "screenshot"}))
            .await;
        assert!(resp.data.unwrap()["base64"].is_string());
    }
}
