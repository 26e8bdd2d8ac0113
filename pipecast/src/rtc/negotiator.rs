use std::collections::HashSet;

use thiserror::Error;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::*;

pub const VP8_CODEC_NAME: &str = "VP8";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("remote peer does not support VP8 (offered video codecs: {offered:?})")]
    UnsupportedCodec { offered: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    fn from_media_line(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecDescriptor {
    pub name: String,
    pub payload_id: u8,
    pub clock_rate: u32,
    pub kind: MediaKind,
}

/// The codec chosen for the outbound video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCodec(CodecDescriptor);

impl NegotiatedCodec {
    pub fn payload_id(&self) -> u8 {
        self.0.payload_id
    }

    pub fn clock_rate(&self) -> u32 {
        self.0.clock_rate
    }

    pub fn descriptor(&self) -> &CodecDescriptor {
        &self.0
    }
}

/// Codecs the remote party offered, in the order it listed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityAnnouncement {
    codecs: Vec<CodecDescriptor>,
}

// Static payload types that may appear without an rtpmap line (RFC 3551).
const STATIC_PAYLOAD_TYPES: &[(u8, &str, u32, MediaKind)] = &[
    (0, "PCMU", 8000, MediaKind::Audio),
    (8, "PCMA", 8000, MediaKind::Audio),
    (9, "G722", 8000, MediaKind::Audio),
];

impl CapabilityAnnouncement {
    /// Builds an announcement, dropping any payload id already seen for the
    /// same kind.
    pub fn new(codecs: impl IntoIterator<Item = CodecDescriptor>) -> Self {
        let mut seen = HashSet::new();
        let codecs = codecs
            .into_iter()
            .filter(|c| seen.insert((c.kind, c.payload_id)))
            .collect();
        Self { codecs }
    }

    pub fn from_description(desc: &RTCSessionDescription) -> Result<Self, SessionError> {
        let parsed = desc
            .unmarshal()
            .map_err(|e| SessionError::RemoteDescription(e.to_string()))?;

        let mut codecs = Vec::new();
        for media in &parsed.media_descriptions {
            let Some(kind) = MediaKind::from_media_line(&media.media_name.media) else {
                continue;
            };

            let rtpmaps: Vec<(u8, &str, u32)> = media
                .attributes
                .iter()
                .filter(|a| a.key == "rtpmap")
                .filter_map(|a| a.value.as_deref().and_then(parse_rtpmap))
                .collect();

            for format in &media.media_name.formats {
                let Ok(payload_id) = format.parse::<u8>() else {
                    continue;
                };
                if let Some((_, name, clock_rate)) =
                    rtpmaps.iter().find(|(pt, _, _)| *pt == payload_id)
                {
                    codecs.push(CodecDescriptor {
                        name: name.to_string(),
                        payload_id,
                        clock_rate: *clock_rate,
                        kind,
                    });
                } else if let Some((_, name, clock_rate, _)) = STATIC_PAYLOAD_TYPES
                    .iter()
                    .find(|(pt, _, _, k)| *pt == payload_id && *k == kind)
                {
                    codecs.push(CodecDescriptor {
                        name: name.to_string(),
                        payload_id,
                        clock_rate: *clock_rate,
                        kind,
                    });
                }
            }
        }

        Ok(Self::new(codecs))
    }

    pub fn codecs(&self) -> &[CodecDescriptor] {
        &self.codecs
    }

    pub fn by_kind(&self, kind: MediaKind) -> impl Iterator<Item = &CodecDescriptor> {
        self.codecs.iter().filter(move |c| c.kind == kind)
    }
}

// "96 VP8/90000" or "111 opus/48000/2"
fn parse_rtpmap(value: &str) -> Option<(u8, &str, u32)> {
    let (pt, encoding) = value.trim().split_once(' ')?;
    let mut parts = encoding.trim().split('/');
    let name = parts.next()?;
    let clock_rate = parts.next()?.parse::<u32>().ok()?;
    if name.is_empty() || clock_rate == 0 {
        return None;
    }
    Some((pt.parse().ok()?, name, clock_rate))
}

/// Picks the first VP8 video codec the remote offered. The payload id is
/// assigned by the remote side and has to be echoed back in the answer.
pub fn select_video_codec(
    announcement: &CapabilityAnnouncement,
) -> Result<NegotiatedCodec, NegotiationError> {
    let mut offered = Vec::new();
    for codec in announcement.by_kind(MediaKind::Video) {
        debug!("found video codec {} (payload {})", codec.name, codec.payload_id);
        if codec.name.eq_ignore_ascii_case(VP8_CODEC_NAME) {
            info!(
                "negotiated {} payload {} clock rate {}",
                codec.name, codec.payload_id, codec.clock_rate
            );
            return Ok(NegotiatedCodec(codec.clone()));
        }
        offered.push(codec.name.clone());
    }
    Err(NegotiationError::UnsupportedCodec { offered })
}
