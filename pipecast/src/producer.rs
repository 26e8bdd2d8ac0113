use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::config::ProducerConfig;
use crate::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to spawn producer `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("producer `{0}` has no stdout pipe")]
    MissingStdout(String),
}

/// Byte stream coming out of the external encoder.
#[async_trait]
pub trait ProducerStream: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// True once the stream can never yield more data.
    fn is_closed(&mut self) -> bool;

    /// Stops the producer. Safe to call more than once.
    async fn terminate(&mut self);
}

/// Starts a fresh producer each time a pacer needs one.
#[async_trait]
pub trait ProducerLauncher: Send + Sync {
    async fn start(&self) -> Result<Box<dyn ProducerStream>, ProducerError>;
}

pub struct CommandLauncher {
    cfg: ProducerConfig,
}

impl CommandLauncher {
    pub fn new(cfg: ProducerConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ProducerLauncher for CommandLauncher {
    async fn start(&self) -> Result<Box<dyn ProducerStream>, ProducerError> {
        Ok(Box::new(ChildProducer::spawn(&self.cfg)?))
    }
}

/// Producer backed by a child process writing to its stdout.
pub struct ChildProducer {
    command: String,
    child: Child,
    stdout: ChildStdout,
    stdout_eof: bool,
    exited: bool,
}

impl ChildProducer {
    pub fn spawn(cfg: &ProducerConfig) -> Result<Self, ProducerError> {
        let args = cfg.resolved_args();
        info!("starting producer: {} {}", cfg.command, args.join(" "));

        let mut child = Command::new(&cfg.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProducerError::Spawn {
                command: cfg.command.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProducerError::MissingStdout(cfg.command.clone()))?;

        Ok(Self {
            command: cfg.command.clone(),
            child,
            stdout,
            stdout_eof: false,
            exited: false,
        })
    }

    fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!("producer {} exited: {}", self.command, status);
                self.exited = true;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("producer {} status unavailable: {}", self.command, e);
                self.exited = true;
            }
        }
        self.exited
    }
}

#[async_trait]
impl ProducerStream for ChildProducer {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf).await?;
        if n == 0 && !buf.is_empty() && !self.stdout_eof {
            debug!("producer {} closed its stdout", self.command);
            self.stdout_eof = true;
        }
        Ok(n)
    }

    /// End of stdout is final even while the process lingers.
    fn is_closed(&mut self) -> bool {
        self.stdout_eof || self.has_exited()
    }

    async fn terminate(&mut self) {
        if self.has_exited() {
            return;
        }
        match self.child.kill().await {
            Ok(()) => debug!("producer {} terminated", self.command),
            Err(e) => warn!("failed to terminate producer {}: {}", self.command, e),
        }
        self.exited = true;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn shell(script: &str) -> ProducerConfig {
        ProducerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reads_stdout_until_exit() {
        let mut producer = ChildProducer::spawn(&shell("printf hello")).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = producer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello");

        timeout(Duration::from_secs(5), async {
            while !producer.is_closed() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn terminate_kills_a_running_producer() {
        let mut producer = ChildProducer::spawn(&shell("sleep 30")).unwrap();
        assert!(!producer.is_closed());

        timeout(Duration::from_secs(5), producer.terminate()).await.unwrap();
        assert!(producer.is_closed());
        // second call is a no-op
        producer.terminate().await;
    }

    #[tokio::test]
    async fn closed_stdout_ends_the_stream_while_the_process_lives() {
        let mut producer =
            ChildProducer::spawn(&shell("printf abc; exec 1>&-; sleep 30")).unwrap();
        let mut buf = [0u8; 16];
        let mut out = Vec::new();
        let eof = timeout(Duration::from_secs(5), async {
            loop {
                let n = producer.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
        })
        .await;
        assert!(eof.is_ok());
        assert_eq!(out, b"abc");
        assert!(producer.is_closed());
        assert!(!producer.has_exited());

        // the lingering process still gets killed
        timeout(Duration::from_secs(5), producer.terminate()).await.unwrap();
        assert!(producer.has_exited());
    }

    #[tokio::test]
    async fn pacer_stops_when_stdout_closes_early() {
        use crate::media::{MediaSink, SinkError, TimedSample};
        use crate::pacer::{PacerError, SamplePacer};
        use crate::shutdown::Shutdown;
        use std::sync::Arc;

        struct Discard;

        #[async_trait]
        impl MediaSink for Discard {
            fn clock_rate(&self) -> u32 {
                90000
            }

            async fn write_sample(&self, _sample: TimedSample) -> Result<(), SinkError> {
                Ok(())
            }
        }

        let cfg = shell("printf abc; exec 1>&-; sleep 30");
        let producer = ChildProducer::spawn(&cfg).unwrap();
        let shutdown = Shutdown::new();
        let pacer = SamplePacer::new(Arc::new(Discard), Box::new(producer), &cfg);

        let report = timeout(Duration::from_secs(5), pacer.run(shutdown.signal()))
            .await
            .unwrap();
        assert!(matches!(report.error, Some(PacerError::ProducerStreamClosed)));
        assert_eq!(report.stats.bytes_written, 3);
        assert_eq!(report.stats.empty_reads, 0);
    }

    #[tokio::test]
    async fn device_is_substituted_into_arguments() {
        let cfg = ProducerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "printf '%s' '{device}'".to_string()],
            device: "cam0".to_string(),
            ..Default::default()
        };
        let mut producer = ChildProducer::spawn(&cfg).unwrap();
        let mut buf = [0u8; 16];
        let mut out = Vec::new();
        loop {
            let n = producer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"cam0");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cfg = ProducerConfig {
            command: "pipecast-no-such-encoder".to_string(),
            args: vec![],
            ..Default::default()
        };
        let err = CommandLauncher::new(cfg).start().await.err().unwrap();
        assert!(matches!(err, ProducerError::Spawn { .. }));
    }
}
