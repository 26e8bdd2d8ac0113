use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("track {track} rejected sample: {source}")]
    Rejected {
        track: String,
        #[source]
        source: webrtc::Error,
    },

    #[error("sink closed")]
    Closed,
}

/// A chunk of encoded media and how long it spans, in clock ticks of the
/// sink it is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedSample {
    pub payload: Bytes,
    pub duration_ticks: u32,
}

/// Converts an elapsed wall-clock span into clock ticks: floored, saturated
/// to `u32`.
pub fn ticks_for(clock_rate: u32, elapsed: Duration) -> u32 {
    let ticks = u128::from(clock_rate) * elapsed.as_nanos() / 1_000_000_000;
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

pub fn duration_for(clock_rate: u32, ticks: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(clock_rate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Outbound, write-only media channel.
#[async_trait]
pub trait MediaSink: Send + Sync {
    fn clock_rate(&self) -> u32;

    async fn write_sample(&self, sample: TimedSample) -> Result<(), SinkError>;
}

/// [`MediaSink`] backed by a webrtc-rs sample track; the track handles RTP
/// packetization and pacing onto the wire.
pub struct TrackSink {
    track: Arc<TrackLocalStaticSample>,
    clock_rate: u32,
    closed: AtomicBool,
}

impl TrackSink {
    pub fn new(track: Arc<TrackLocalStaticSample>, clock_rate: u32) -> Self {
        Self {
            track,
            clock_rate,
            closed: AtomicBool::new(false),
        }
    }

    pub fn track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    /// Every later write fails with [`SinkError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSink for TrackSink {
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    async fn write_sample(&self, sample: TimedSample) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        let sample = Sample {
            data: sample.payload,
            duration: duration_for(self.clock_rate, sample.duration_ticks),
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|source| SinkError::Rejected {
                track: self.track.id().to_owned(),
                source,
            })
    }
}
