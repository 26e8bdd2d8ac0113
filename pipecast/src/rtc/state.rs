use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl From<RTCIceConnectionState> for ConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => ConnectionState::New,
            RTCIceConnectionState::Checking => ConnectionState::Checking,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                ConnectionState::Connected
            }
            RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCIceConnectionState::Failed => ConnectionState::Failed,
            RTCIceConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub type ConnectionStateStream = mpsc::UnboundedReceiver<ConnectionState>;

/// Fans connection-state transitions out to every subscriber.
///
/// Each subscriber has its own unbounded queue, so a slow observer never
/// loses a transition and sees them in publish order. Subscribers only see
/// transitions published after they subscribed.
#[derive(Clone, Default)]
pub struct ConnectionStateFeed {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ConnectionState>>>>,
}

impl ConnectionStateFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ConnectionStateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, state: ConnectionState) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(state).is_ok());
        }
    }

    /// Drops every subscriber queue so streams end once drained.
    pub fn close(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}
