use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;
use url::Url;

use super::msgs::SignalingMessage;
use super::*;

/// Client of a websocket signaling server. Registers under a fresh server id,
/// takes the first offer addressed to it and answers its sender.
pub struct WsSignaling {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    server_id: String,
    peer_id: Option<String>,
}

impl WsSignaling {
    pub async fn connect(ws_url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(ws_url)?;
        let request = url.as_str().into_client_request()?;
        let (ws_stream, resp) = connect_async(request).await?;
        debug!("connect to ws server success, resp: {:?}", resp.status());

        let mut client = Self {
            ws_stream,
            server_id: xid::new().to_string(),
            peer_id: None,
        };
        client
            .send(&SignalingMessage::ServerRegister {
                server_id: client.server_id.clone(),
            })
            .await?;
        info!("registered at {} as {}", url, client.server_id);
        Ok(client)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn send(&mut self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        let text = serde_json::to_string(msg)?;
        self.ws_stream.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    async fn recv_offer(&mut self) -> Result<RTCSessionDescription, SignalingError> {
        while let Some(msg) = self.ws_stream.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    debug!("signaling server closed: {:?}", frame);
                    break;
                }
                _ => continue,
            };

            let msg = match serde_json::from_str::<SignalingMessage>(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("ignoring unparsable signaling message: {}", e);
                    continue;
                }
            };

            match msg {
                SignalingMessage::Offer { from, to, sdp } => {
                    if to != self.server_id {
                        debug!("offer for {} is not ours, skipping", to);
                        continue;
                    }
                    let offer = decode_offer(sdp.as_bytes())?;
                    info!("offer received from {}", from);
                    self.peer_id = Some(from);
                    return Ok(offer);
                }
                SignalingMessage::ServerRegistered { server_id } => {
                    debug!("server acknowledged registration of {}", server_id);
                }
                SignalingMessage::IceCandidate { from, .. } => {
                    // answers are sent with every candidate gathered
                    debug!("ignoring trickled candidate from {}", from);
                }
                SignalingMessage::Error { code, message } => {
                    return Err(SignalingError::Server { code, message });
                }
                other => debug!("ignoring signaling message: {:?}", other),
            }
        }
        Err(SignalingError::Closed("offer"))
    }

    async fn send_answer(&mut self, answer: &RTCSessionDescription) -> Result<(), SignalingError> {
        let to = self.peer_id.clone().ok_or(SignalingError::NoPeer)?;
        let msg = SignalingMessage::Answer {
            from: self.server_id.clone(),
            to: to.clone(),
            sdp: serde_json::to_string(answer)?,
        };
        self.send(&msg).await?;
        info!("answer sent to {}", to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    const OFFER: &str = r#"{"type":"offer","sdp":"v=0\r\n"}"#;

    async fn next_msg(ws: &mut WebSocketStream<TcpStream>) -> SignalingMessage {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn reply(ws: &mut WebSocketStream<TcpStream>, msg: SignalingMessage) {
        let text = serde_json::to_string(&msg).unwrap();
        ws.send(Message::Text(text)).await.unwrap();
    }

    /// Accepts one client, plays `script` against its registration and
    /// returns whatever the client sends next.
    async fn fake_server<F>(script: F) -> (String, JoinHandle<Option<SignalingMessage>>)
    where
        F: FnOnce(String) -> Vec<SignalingMessage> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let server_id = match next_msg(&mut ws).await {
                SignalingMessage::ServerRegister { server_id } => server_id,
                other => panic!("expected registration, got {:?}", other),
            };
            for msg in script(server_id) {
                reply(&mut ws, msg).await;
            }
            match ws.next().await {
                Some(Ok(Message::Text(text))) => Some(serde_json::from_str(&text).unwrap()),
                _ => None,
            }
        });
        (url, handle)
    }

    #[tokio::test]
    async fn answers_the_peer_that_sent_the_offer() {
        let (url, server) = fake_server(|server_id| {
            vec![
                SignalingMessage::ServerRegistered {
                    server_id: server_id.clone(),
                },
                SignalingMessage::Offer {
                    from: "someone".to_string(),
                    to: "somebody_else".to_string(),
                    sdp: OFFER.to_string(),
                },
                SignalingMessage::Offer {
                    from: "client_1".to_string(),
                    to: server_id,
                    sdp: OFFER.to_string(),
                },
            ]
        })
        .await;

        let mut signaling = WsSignaling::connect(&url).await.unwrap();
        let offer = signaling.recv_offer().await.unwrap();
        assert_eq!(offer.sdp, "v=0\r\n");

        let answer: RTCSessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        signaling.send_answer(&answer).await.unwrap();

        match server.await.unwrap() {
            Some(SignalingMessage::Answer { from, to, sdp }) => {
                assert_eq!(from, signaling.server_id());
                assert_eq!(to, "client_1");
                let echoed: RTCSessionDescription = serde_json::from_str(&sdp).unwrap();
                assert_eq!(echoed.sdp, "v=0\r\n");
            }
            other => panic!("expected an answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_error_fails_the_wait() {
        let (url, _server) = fake_server(|_| {
            vec![SignalingMessage::Error {
                code: 503,
                message: "busy".to_string(),
            }]
        })
        .await;

        let mut signaling = WsSignaling::connect(&url).await.unwrap();
        let err = signaling.recv_offer().await.err().unwrap();
        assert!(matches!(err, SignalingError::Server { code: 503, .. }));
    }

    #[tokio::test]
    async fn answer_without_offer_has_no_peer() {
        let (url, _server) = fake_server(|_| vec![]).await;
        let mut signaling = WsSignaling::connect(&url).await.unwrap();
        let answer: RTCSessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        let err = signaling.send_answer(&answer).await.err().unwrap();
        assert!(matches!(err, SignalingError::NoPeer));
    }
}
