//! Out-of-band exchange of the remote offer and the local answer.

pub mod msgs;
pub mod stdio;
pub mod ws;

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::{SignalingConfig, SignalingMode};
use crate::shutdown::ShutdownSignal;
use crate::{debug, info, warn};

pub use stdio::StdioSignaling;
pub use ws::WsSignaling;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed signaling payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("offer is neither json nor base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("websocket failure: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),

    #[error("expected an offer, got {0}")]
    UnexpectedDescription(String),

    #[error("signaling channel closed while waiting for {0}")]
    Closed(&'static str),

    #[error("no peer to answer, an offer must be received first")]
    NoPeer,

    #[error("signaling server error {code}: {message}")]
    Server { code: i32, message: String },
}

#[async_trait]
pub trait Signaling: Send {
    /// Waits for the remote peer's offer.
    async fn recv_offer(&mut self) -> Result<RTCSessionDescription, SignalingError>;

    /// Delivers the local answer to whoever sent the offer.
    async fn send_answer(&mut self, answer: &RTCSessionDescription) -> Result<(), SignalingError>;
}

/// Opens the signaling channel selected by `cfg`. Returns `None` when
/// `shutdown` fires first.
pub async fn connect(
    cfg: &SignalingConfig,
    shutdown: &mut ShutdownSignal,
) -> Result<Option<Box<dyn Signaling>>, SignalingError> {
    let channel: Box<dyn Signaling> = match cfg.mode {
        SignalingMode::Stdio => Box::new(StdioSignaling::new(cfg.stdio_encoding)),
        SignalingMode::Websocket => {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    info!("shutdown while connecting to {}", cfg.url);
                    return Ok(None);
                }
                ws = WsSignaling::connect(&cfg.url) => Box::new(ws?) as Box<dyn Signaling>,
            }
        }
    };
    Ok(Some(channel))
}

fn decode_offer(json: &[u8]) -> Result<RTCSessionDescription, SignalingError> {
    let desc: RTCSessionDescription = serde_json::from_slice(json)?;
    match desc.sdp_type {
        webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Offer => Ok(desc),
        other => Err(SignalingError::UnexpectedDescription(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn decodes_an_offer() {
        let desc = decode_offer(b"  {\"type\":\"offer\",\"sdp\":\"v=0\\r\\n\"}\n").unwrap();
        assert_eq!(desc.sdp, "v=0\r\n");
    }

    #[test]
    fn rejects_an_answer_where_an_offer_belongs() {
        let err = decode_offer(br#"{"type":"answer","sdp":"v=0\r\n"}"#).err().unwrap();
        assert!(matches!(err, SignalingError::UnexpectedDescription(t) if t == "answer"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode_offer(b"hello"), Err(SignalingError::Decode(_))));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_websocket_connect() {
        // accepts tcp but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = SignalingConfig {
            mode: SignalingMode::Websocket,
            url: format!("ws://{}/ws", listener.local_addr().unwrap()),
            ..Default::default()
        };
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger();
            shutdown
        });
        let channel = timeout(Duration::from_secs(5), connect(&cfg, &mut signal))
            .await
            .unwrap()
            .unwrap();
        assert!(channel.is_none());
        drop(trigger.await.unwrap());
        drop(listener);
    }
}
