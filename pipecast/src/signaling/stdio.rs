use base64::prelude::*;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};

use super::*;
use crate::config::StdioEncoding;

/// Reads the offer as one line from a reader and writes the answer as one
/// line to a writer. Blank lines are skipped.
///
/// The offer line is session-description JSON, either raw or base64
/// encoded the way browser copy-paste demos produce it. The answer is
/// written in the configured [`StdioEncoding`].
pub struct StdioSignaling<R, W> {
    lines: Lines<BufReader<R>>,
    out: W,
    encoding: StdioEncoding,
}

impl StdioSignaling<Stdin, Stdout> {
    pub fn new(encoding: StdioEncoding) -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout(), encoding)
    }
}

impl<R, W> StdioSignaling<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn with_io(input: R, out: W, encoding: StdioEncoding) -> Self {
        Self {
            lines: BufReader::new(input).lines(),
            out,
            encoding,
        }
    }

    pub fn into_writer(self) -> W {
        self.out
    }
}

fn decode_line(line: &str) -> Result<RTCSessionDescription, SignalingError> {
    let line = line.trim();
    if line.starts_with('{') {
        return decode_offer(line.as_bytes());
    }
    let json = BASE64_STANDARD.decode(line)?;
    decode_offer(&json)
}

#[async_trait]
impl<R, W> Signaling for StdioSignaling<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv_offer(&mut self) -> Result<RTCSessionDescription, SignalingError> {
        info!("waiting for the remote offer on stdin");
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let offer = decode_line(&line)?;
            debug!("offer received ({} bytes of sdp)", offer.sdp.len());
            return Ok(offer);
        }
        warn!("stdin closed before an offer arrived");
        Err(SignalingError::Closed("offer"))
    }

    async fn send_answer(&mut self, answer: &RTCSessionDescription) -> Result<(), SignalingError> {
        let json = serde_json::to_string(answer)?;
        let mut line = match self.encoding {
            StdioEncoding::Json => json,
            StdioEncoding::Base64 => BASE64_STANDARD.encode(json),
        };
        line.push('\n');
        self.out.write_all(line.as_bytes()).await?;
        self.out.flush().await?;
        info!("answer written to stdout ({:?})", self.encoding);
        Ok(())
    }
}
