use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Envelope exchanged with the signaling server. `sdp` carries the JSON form
/// of a session description (`{"type": ..., "sdp": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingMessage {
    // 服务器管理
    ServerRegister { server_id: String },
    ServerRegistered { server_id: String },

    // WebRTC 信令
    Offer { from: String, to: String, sdp: String },
    Answer { from: String, to: String, sdp: String },
    IceCandidate { from: String, to: String, candidate: String },

    // 错误处理
    Error { code: i32, message: String },
}
