//! Stdio host: relays a framed stdin/stdout peer onto a session's bridge
//!
//! The launching process (for example a browser extension's native host
//! runner) speaks the bridge protocol on our stdin and stdout. Stdout
//! carries frames only; all logging goes to stderr.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Framed;

use crate::core::{BrowseError, Result};
use crate::protocol::{codec, Decoded, FrameCodec, FrameDecoder};
use crate::session::Endpoint;

const READ_CHUNK: usize = 16 * 1024;

/// Pump frames between stdio and the bridge endpoint until either side closes
pub async fn relay_stdio(endpoint: &Endpoint) -> Result<()> {
    let stream = endpoint.connect().await.map_err(|e| {
        BrowseError::Other(format!("cannot reach bridge at {}: {}", endpoint, e))
    })?;
    tracing::info!(endpoint = %endpoint, "bridge host attached");
    relay(tokio::io::stdin(), tokio::io::stdout(), stream).await
}

/// Relay between a byte reader/writer pair and a framed bridge stream
pub async fn relay<R, W, S>(mut input: R, mut output: W, bridge: S) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut to_bridge, mut from_bridge) = Framed::new(bridge, FrameCodec).split();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = input.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    if decoder.has_partial() {
                        tracing::warn!(buffered = decoder.buffered(), "input closed mid-frame");
                    }
                    break;
                }
                for frame in decoder.feed(&buf[..n])? {
                    match frame {
                        Decoded::Message(value) => to_bridge.send(value).await?,
                        Decoded::Malformed(reason) => {
                            tracing::warn!(reason = %reason, "dropping malformed frame from host");
                        }
                    }
                }
            }
            frame = from_bridge.next() => match frame {
                Some(Ok(Decoded::Message(value))) => {
                    output.write_all(&codec::encode(&value)?).await?;
                    output.flush().await?;
                }
                Some(Ok(Decoded::Malformed(reason))) => {
                    tracing::warn!(reason = %reason, "dropping malformed frame from daemon");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    tracing::info!("bridge closed by daemon");
                    break;
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    use crate::bridge::Correlator;

    #[tokio::test]
    async fn test_relay_carries_requests_and_replies() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (daemon_side, host_side) = tokio::io::duplex(64 * 1024);
        correlator.attach(daemon_side).await;

        // The "extension" talks raw frames on the host's stdio
        let (ext, host_stdio) = tokio::io::duplex(64 * 1024);
        let (host_in, host_out) = tokio::io::split(host_stdio);
        tokio::spawn(relay(host_in, host_out, host_side));

        let request = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "launch"})).await }
        });

        let mut ext = Framed::new(ext, FrameCodec);
        let incoming = match ext.next().await {
            Some(Ok(Decoded::Message(value))) => value,
            other => panic!("expected a request, got {:?}", other),
        };
        assert_eq!(incoming["method"], "launch");

        // Reply split across two writes to exercise the chunked decoder
        let frame = codec::encode(&json!({"id": incoming["id"], "result": "ok"})).unwrap();
        let (head, tail) = frame.split_at(3);
        ext.get_mut().write_all(head).await.unwrap();
        ext.get_mut().flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        ext.get_mut().write_all(tail).await.unwrap();

        assert_eq!(request.await.unwrap().unwrap(), json!("ok"));
    }
}
