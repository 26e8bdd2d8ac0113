//! Bridges the encoder's byte stream onto an outbound media sink.
//!
//! The pacer does not parse the producer's container. Each read becomes one
//! sample whose duration is the wall time the read took, expressed in sink
//! clock ticks. That is only an approximation of real frame timing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::config::ProducerConfig;
use crate::media::{ticks_for, MediaSink, SinkError, TimedSample};
use crate::producer::ProducerStream;
use crate::shutdown::ShutdownSignal;
use crate::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PacerError {
    #[error("producer stream closed")]
    ProducerStreamClosed,

    #[error("sink stopped accepting samples: {0}")]
    SinkWrite(#[source] SinkError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacerStats {
    pub samples_written: u64,
    pub bytes_written: u64,
    pub empty_reads: u64,
    pub read_errors: u64,
}

/// How a pacer run ended. `error` is `None` when it was cancelled.
#[derive(Debug)]
pub struct PacerReport {
    pub stats: PacerStats,
    pub error: Option<PacerError>,
}

pub struct SamplePacer {
    sink: Arc<dyn MediaSink>,
    producer: Box<dyn ProducerStream>,
    clock_rate: u32,
    max_chunk_size: usize,
    idle_backoff: Duration,
    last_read_timestamp: Instant,
    stats: PacerStats,
}

enum Step {
    Continue,
    Stop,
}

impl SamplePacer {
    pub fn new(
        sink: Arc<dyn MediaSink>,
        producer: Box<dyn ProducerStream>,
        cfg: &ProducerConfig,
    ) -> Self {
        let clock_rate = sink.clock_rate();
        Self {
            sink,
            producer,
            clock_rate,
            max_chunk_size: cfg.max_chunk_size.max(1),
            idle_backoff: Duration::from_millis(cfg.idle_backoff_ms),
            last_read_timestamp: Instant::now(),
            stats: PacerStats::default(),
        }
    }

    /// Pumps samples until cancelled, the producer closes, or the sink fails.
    /// The producer is terminated on every exit path.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> PacerReport {
        info!("pacer started at clock rate {}", self.clock_rate);
        let mut buf = vec![0u8; self.max_chunk_size];

        let error = loop {
            match self.step(&mut buf, &mut shutdown).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break None,
                Err(e) => break Some(e),
            }
        };

        self.producer.terminate().await;
        info!(
            "pacer stopped: {} samples, {} bytes, {} empty reads, {} read errors",
            self.stats.samples_written,
            self.stats.bytes_written,
            self.stats.empty_reads,
            self.stats.read_errors
        );
        PacerReport {
            stats: self.stats,
            error,
        }
    }

    async fn step(
        &mut self,
        buf: &mut [u8],
        shutdown: &mut ShutdownSignal,
    ) -> Result<Step, PacerError> {
        self.last_read_timestamp = Instant::now();

        let read = tokio::select! {
            biased;
            _ = shutdown.triggered() => return Ok(Step::Stop),
            read = self.producer.read(buf) => read,
        };

        let n = match read {
            Ok(0) => {
                if self.producer.is_closed() {
                    return Err(PacerError::ProducerStreamClosed);
                }
                self.stats.empty_reads += 1;
                return idle(self.idle_backoff, shutdown).await;
            }
            Ok(n) => n,
            Err(e) => {
                self.stats.read_errors += 1;
                warn!("producer read failed: {}", e);
                if self.producer.is_closed() {
                    return Err(PacerError::ProducerStreamClosed);
                }
                return idle(self.idle_backoff, shutdown).await;
            }
        };

        let elapsed = self.last_read_timestamp.elapsed();
        let sample = TimedSample {
            payload: Bytes::copy_from_slice(&buf[..n]),
            duration_ticks: ticks_for(self.clock_rate, elapsed),
        };
        debug!("read {} bytes in {:?} -> {} ticks", n, elapsed, sample.duration_ticks);

        tokio::select! {
            biased;
            _ = shutdown.triggered() => return Ok(Step::Stop),
            written = self.sink.write_sample(sample) => written.map_err(PacerError::SinkWrite)?,
        }
        self.stats.samples_written += 1;
        self.stats.bytes_written += n as u64;
        Ok(Step::Continue)
    }
}

async fn idle(backoff: Duration, shutdown: &mut ShutdownSignal) -> Result<Step, PacerError> {
    tokio::select! {
        biased;
        _ = shutdown.triggered() => Ok(Step::Stop),
        _ = sleep(backoff) => Ok(Step::Continue),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    pub(crate) enum Read {
        Data(usize, Duration),
        Empty,
        Fail,
        Block,
    }

    /// Replays a script of reads; once it runs dry it reads empty and
    /// reports itself closed.
    pub(crate) struct ScriptedProducer {
        script: VecDeque<Read>,
        exhausted: bool,
        pub(crate) terminated: Arc<AtomicBool>,
    }

    impl ScriptedProducer {
        pub(crate) fn new(script: Vec<Read>) -> Self {
            Self {
                script: script.into(),
                exhausted: false,
                terminated: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ProducerStream for ScriptedProducer {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                Some(Read::Data(n, delay)) => {
                    sleep(delay).await;
                    buf[..n].fill(0xAB);
                    Ok(n)
                }
                Some(Read::Empty) => Ok(0),
                None => {
                    self.exhausted = true;
                    Ok(0)
                }
                Some(Read::Fail) => Err(io::Error::new(io::ErrorKind::Other, "pipe hiccup")),
                Some(Read::Block) => std::future::pending().await,
            }
        }

        fn is_closed(&mut self) -> bool {
            self.exhausted
        }

        async fn terminate(&mut self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct RecordingSink {
        pub(crate) samples: Mutex<Vec<TimedSample>>,
        clock_rate: u32,
        fail: bool,
    }

    impl RecordingSink {
        pub(crate) fn new(clock_rate: u32) -> Self {
            Self {
                samples: Mutex::new(Vec::new()),
                clock_rate,
                fail: false,
            }
        }

        fn failing(clock_rate: u32) -> Self {
            Self {
                fail: true,
                ..Self::new(clock_rate)
            }
        }

        pub(crate) fn shape(&self) -> Vec<(usize, u32)> {
            self.samples
                .lock()
                .unwrap()
                .iter()
                .map(|s| (s.payload.len(), s.duration_ticks))
                .collect()
        }
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        fn clock_rate(&self) -> u32 {
            self.clock_rate
        }

        async fn write_sample(&self, sample: TimedSample) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Closed);
            }
            self.samples.lock().unwrap().push(sample);
            Ok(())
        }
    }

    fn pacer(sink: &Arc<RecordingSink>, producer: ScriptedProducer) -> SamplePacer {
        let sink: Arc<dyn MediaSink> = sink.clone();
        SamplePacer::new(sink, Box::new(producer), &ProducerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn durations_follow_elapsed_read_time() {
        let sink = Arc::new(RecordingSink::new(90_000));
        let producer = ScriptedProducer::new(vec![
            Read::Data(100, Duration::from_millis(40)),
            Read::Data(50, Duration::ZERO),
            Read::Data(10, Duration::from_millis(20)),
        ]);
        let terminated = producer.terminated.clone();

        let report = pacer(&sink, producer).run(Shutdown::new().signal()).await;

        assert_eq!(sink.shape(), vec![(100, 3600), (50, 0), (10, 1800)]);
        assert!(matches!(report.error, Some(PacerError::ProducerStreamClosed)));
        assert_eq!(report.stats.samples_written, 3);
        assert_eq!(report.stats.bytes_written, 160);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reads_are_never_forwarded() {
        let sink = Arc::new(RecordingSink::new(90_000));
        let producer = ScriptedProducer::new(vec![
            Read::Empty,
            Read::Empty,
            Read::Data(5, Duration::from_millis(1)),
            Read::Empty,
        ]);

        let report = pacer(&sink, producer).run(Shutdown::new().signal()).await;

        assert_eq!(sink.shape(), vec![(5, 90)]);
        assert_eq!(report.stats.empty_reads, 3);
        assert!(matches!(report.error, Some(PacerError::ProducerStreamClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_do_not_stop_the_pacer() {
        let sink = Arc::new(RecordingSink::new(48_000));
        let producer = ScriptedProducer::new(vec![
            Read::Fail,
            Read::Data(3, Duration::from_millis(20)),
        ]);

        let report = pacer(&sink, producer).run(Shutdown::new().signal()).await;

        assert_eq!(sink.shape(), vec![(3, 960)]);
        assert_eq!(report.stats.read_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_is_terminal() {
        let sink = Arc::new(RecordingSink::failing(90_000));
        let producer = ScriptedProducer::new(vec![
            Read::Data(8, Duration::from_millis(5)),
            Read::Data(8, Duration::from_millis(5)),
        ]);
        let terminated = producer.terminated.clone();

        let report = pacer(&sink, producer).run(Shutdown::new().signal()).await;

        assert!(matches!(report.error, Some(PacerError::SinkWrite(SinkError::Closed))));
        assert_eq!(report.stats.samples_written, 0);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_unblocks_a_pending_read() {
        let sink = Arc::new(RecordingSink::new(90_000));
        let producer = ScriptedProducer::new(vec![Read::Block]);
        let terminated = producer.terminated.clone();
        let shutdown = Shutdown::new();

        let handle = tokio::spawn(pacer(&sink, producer).run(shutdown.signal()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(report.error.is_none());
        assert!(terminated.load(Ordering::SeqCst));
        assert!(sink.shape().is_empty());
    }
}
