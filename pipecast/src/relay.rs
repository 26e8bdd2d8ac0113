//! Startup sequence and steady state of one streaming session.

use std::sync::Arc;

use thiserror::Error;

use crate::config::{AppConfig, ProducerConfig};
use crate::media::MediaSink;
use crate::monitor::{LifecycleMonitor, MonitorSummary};
use crate::producer::{CommandLauncher, ProducerLauncher};
use crate::rtc::{
    select_video_codec, CapabilityAnnouncement, NegotiationError, Session, SessionBootstrapper,
    SessionError,
};
use crate::shutdown::ShutdownSignal;
use crate::signaling::{Signaling, SignalingError};
use crate::{debug, info};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("codec negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("session setup failed: {0}")]
    Session(#[from] SessionError),
}

pub struct Relay {
    session_id: String,
    bootstrapper: SessionBootstrapper,
    launcher: Arc<dyn ProducerLauncher>,
    producer_cfg: ProducerConfig,
}

impl Relay {
    pub fn new(cfg: &AppConfig) -> Self {
        Self::with_launcher(cfg, Arc::new(CommandLauncher::new(cfg.producer.clone())))
    }

    pub fn with_launcher(cfg: &AppConfig, launcher: Arc<dyn ProducerLauncher>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            bootstrapper: SessionBootstrapper::new(&cfg.rtc),
            launcher,
            producer_cfg: cfg.producer.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Offer in, answer out. Nothing is sent back when negotiation fails.
    pub async fn start(&self, signaling: &mut dyn Signaling) -> Result<Session, StartupError> {
        let offer = signaling.recv_offer().await?;
        let announcement = CapabilityAnnouncement::from_description(&offer)?;
        debug!(
            "session {}: remote announced {} codecs",
            self.session_id,
            announcement.codecs().len()
        );

        let video = select_video_codec(&announcement)?;
        let session = self.bootstrapper.bootstrap(offer, &video).await?;

        if let Err(e) = signaling.send_answer(&session.local_description).await {
            session.close().await;
            return Err(e.into());
        }
        info!(
            "session {}: answered with {} on payload {}",
            self.session_id,
            video.descriptor().name,
            video.payload_id()
        );
        Ok(session)
    }

    /// Runs the session until `shutdown` fires. The pacer is stopped before
    /// the session is closed.
    pub async fn run(
        self,
        signaling: &mut dyn Signaling,
        mut shutdown: ShutdownSignal,
    ) -> Result<MonitorSummary, StartupError> {
        let mut session = tokio::select! {
            biased;
            _ = shutdown.triggered() => {
                info!("session {}: shutdown before the session started", self.session_id);
                return Ok(MonitorSummary::default());
            }
            session = self.start(signaling) => session?,
        };

        let states = match session.take_states() {
            Some(states) => states,
            None => session.subscribe_states(),
        };
        let sink: Arc<dyn MediaSink> = session.video_sink.clone();
        let monitor = LifecycleMonitor::new(Arc::clone(&self.launcher), sink, self.producer_cfg.clone());

        let summary = monitor.run(states, shutdown).await;
        session.close().await;
        info!(
            "session {}: done, {} pacer(s) started",
            self.session_id, summary.pacers_started
        );
        Ok(summary)
    }
}
