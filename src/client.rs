//! Framed control-socket client used by the CLI and the tests

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::codec::Framed;

use crate::core::{BrowseError, Response, Result};
use crate::protocol::{Decoded, FrameCodec};
use crate::session::{BoxStream, Endpoint};

/// One connection to a session daemon
pub struct Client {
    framed: Framed<BoxStream, FrameCodec>,
    next_id: u64,
}

impl Client {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = endpoint.connect().await?;
        Ok(Self::new(stream))
    }

    pub fn new(stream: BoxStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec),
            next_id: 0,
        }
    }

    /// Send a raw command frame and wait for its response
    pub async fn send_value(&mut self, command: &Value) -> Result<Response> {
        self.framed.send(command).await?;
        match self.framed.next().await {
            Some(Ok(Decoded::Message(value))) => Ok(serde_json::from_value(value)?),
            Some(Ok(Decoded::Malformed(reason))) => Err(BrowseError::MalformedFrame(reason)),
            Some(Err(e)) => Err(e),
            None => Err(BrowseError::ConnectionClosed),
        }
    }

    /// Send `action` with extra fields under a fresh id
    pub async fn request(&mut self, action: &str, fields: Value) -> Result<Response> {
        self.next_id += 1;
        let mut command = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(BrowseError::Other(format!(
                    "command fields must be a JSON object, got {}",
                    other
                )))
            }
        };
        command.insert("id".to_string(), json!(self.next_id.to_string()));
        command.insert("action".to_string(), json!(action));
        self.send_value(&Value::Object(command)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode;

    #[tokio::test]
    async fn test_request_assigns_ids() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(&json!({"action": "url", "id": "1"})).unwrap())
            .read(&encode(&json!({"id": "1", "success": true, "data": {"url": "about:blank"}})).unwrap())
            .write(&encode(&json!({"action": "title", "id": "2"})).unwrap())
            .read(&encode(&json!({"id": "2", "success": false, "error": "boom"})).unwrap())
            .build();
        let mut client = Client::new(Box::new(mock));

        let resp = client.request("url", Value::Null).await.unwrap();
        assert_eq!(resp, Response::ok("1", json!({"url": "about:blank"})));
        let resp = client.request("title", json!({})).await.unwrap();
        assert_eq!(resp, Response::err("2", "boom"));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(&json!({"action": "url", "id": "1"})).unwrap())
            .build();
        let mut client = Client::new(Box::new(mock));
        let err = client.request("url", Value::Null).await.unwrap_err();
        assert!(matches!(err, BrowseError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_fields_must_be_an_object() {
        let mock = tokio_test::io::Builder::new().build();
        let mut client = Client::new(Box::new(mock));
        assert!(client.request("navigate", json!("https://x.test")).await.is_err());
    }
}
