use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ProducerConfig;
use crate::media::MediaSink;
use crate::pacer::{PacerReport, SamplePacer};
use crate::producer::ProducerLauncher;
use crate::rtc::{ConnectionState, ConnectionStateStream};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::{debug, error, info, warn};

const PACER_STOP_GRACE: Duration = Duration::from_secs(5);

enum Phase {
    /// Waiting for the first `connected`.
    Idle,
    Running {
        shutdown: Shutdown,
        handle: JoinHandle<PacerReport>,
    },
    /// A pacer ran (or failed to start); nothing is restarted.
    Stopped,
}

enum Event {
    State(ConnectionState),
    PacerFinished(Option<PacerReport>),
    Shutdown,
    StreamEnded,
}

#[derive(Debug, Default)]
pub struct MonitorSummary {
    pub pacers_started: usize,
    pub last_report: Option<PacerReport>,
}

/// Starts the video pacer on the first `connected` and stops it when the
/// connection goes away. At most one pacer runs per session.
pub struct LifecycleMonitor {
    launcher: Arc<dyn ProducerLauncher>,
    sink: Arc<dyn MediaSink>,
    producer_cfg: ProducerConfig,
    phase: Phase,
    summary: MonitorSummary,
}

impl LifecycleMonitor {
    pub fn new(
        launcher: Arc<dyn ProducerLauncher>,
        sink: Arc<dyn MediaSink>,
        producer_cfg: ProducerConfig,
    ) -> Self {
        Self {
            launcher,
            sink,
            producer_cfg,
            phase: Phase::Idle,
            summary: MonitorSummary::default(),
        }
    }

    /// Runs until `shutdown` fires or `states` ends, stopping any running
    /// pacer before returning.
    pub async fn run(
        mut self,
        mut states: ConnectionStateStream,
        mut shutdown: ShutdownSignal,
    ) -> MonitorSummary {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.triggered() => Event::Shutdown,
                report = pacer_finished(&mut self.phase) => Event::PacerFinished(report),
                state = states.recv() => match state {
                    Some(state) => Event::State(state),
                    None => Event::StreamEnded,
                },
            };

            match event {
                Event::State(state) => self.on_state(state, &shutdown).await,
                Event::PacerFinished(report) => {
                    self.phase = Phase::Stopped;
                    if let Some(report) = report {
                        match &report.error {
                            Some(e) => warn!("video pacer ended: {}", e),
                            None => info!("video pacer ended"),
                        }
                        self.summary.last_report = Some(report);
                    }
                }
                Event::Shutdown => {
                    info!("lifecycle monitor shutting down");
                    self.stop_pacer().await;
                    break;
                }
                Event::StreamEnded => {
                    debug!("connection state stream ended");
                    self.stop_pacer().await;
                    break;
                }
            }
        }
        self.summary
    }

    async fn on_state(&mut self, state: ConnectionState, shutdown: &ShutdownSignal) {
        match state {
            ConnectionState::Connected => match self.phase {
                Phase::Idle => self.start_pacer(shutdown).await,
                Phase::Running { .. } => debug!("duplicate connected, pacer already running"),
                Phase::Stopped => debug!("connected again after stop, not restarting"),
            },
            state if state.is_terminal() => {
                info!("connection {}, stopping video pacer", state);
                self.stop_pacer().await;
            }
            state => debug!("connection {}", state),
        }
    }

    async fn start_pacer(&mut self, parent: &ShutdownSignal) {
        if parent.is_triggered() {
            debug!("shutting down, not starting the video pacer");
            self.phase = Phase::Stopped;
            return;
        }
        let producer = match self.launcher.start().await {
            Ok(producer) => producer,
            Err(e) => {
                error!("video producer failed to start: {}", e);
                self.phase = Phase::Stopped;
                return;
            }
        };

        let shutdown = Shutdown::child_of(parent);
        let pacer = SamplePacer::new(Arc::clone(&self.sink), producer, &self.producer_cfg);
        let handle = tokio::spawn(pacer.run(shutdown.signal()));
        self.summary.pacers_started += 1;
        self.phase = Phase::Running { shutdown, handle };
        info!("video pacer started");
    }

    async fn stop_pacer(&mut self) {
        let Phase::Running { shutdown, mut handle } =
            std::mem::replace(&mut self.phase, Phase::Stopped)
        else {
            return;
        };

        shutdown.trigger();
        match timeout(PACER_STOP_GRACE, &mut handle).await {
            Ok(Ok(report)) => self.summary.last_report = Some(report),
            Ok(Err(e)) => error!("video pacer task failed: {}", e),
            Err(_) => {
                // dropping the pacer kills the producer via kill_on_drop
                warn!("video pacer did not stop in {:?}, aborting", PACER_STOP_GRACE);
                handle.abort();
            }
        }
    }
}

async fn pacer_finished(phase: &mut Phase) -> Option<PacerReport> {
    match phase {
        Phase::Running { handle, .. } => match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("video pacer task failed: {}", e);
                None
            }
        },
        _ => std::future::pending().await,
    }
}
