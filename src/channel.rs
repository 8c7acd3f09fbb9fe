//! SSH channel framing for the SCP byte protocol
// (c) 2024 Ross Younger

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::error;

use crate::error::ScpError;
use crate::protocol::{ERR, NEWLINE, OK, WARN};

/// The SSH channel as this engine needs it: the raw byte stream plus the
/// two channel-level operations SCP uses (exit status and close).
///
/// The host's SSH server implements this for its channel type; see the
/// crate documentation for a sketch.
#[async_trait]
pub trait SessionChannel: AsyncRead + AsyncWrite + Unpin + Send {
    /// Sends the SSH `exit-status` reply for the command.
    async fn send_exit_status(&mut self, status: u32) -> std::io::Result<()>;
    /// Closes the channel.
    async fn close(&mut self) -> std::io::Result<()>;
}

/// The framer: byte-oriented reads and writes against one SSH channel.
///
/// SCP interleaves single ack bytes with newline-terminated text lines
/// and raw file payload on the same stream, so reads here use a one-byte
/// scratch and nothing ever buffers ahead: a buffered reader would
/// swallow bytes belonging to the file-content phase.
///
/// Error discipline: any I/O failure closes the channel before the error
/// is returned, and once closed the framer refuses further writes. The
/// one exception is end-of-stream, which is reported as [`ScpError::Eof`]
/// without closing so the upload loop can finish cleanly.
pub struct ScpChannel<C> {
    chan: C,
    closed: bool,
}

impl<C: SessionChannel> ScpChannel<C> {
    pub fn new(chan: C) -> Self {
        Self {
            chan,
            closed: false,
        }
    }

    /// Reads one acknowledgement byte. WARN and ERR collect the
    /// diagnostic text up to the newline; both close the channel and
    /// surface as [`ScpError::Peer`]. Any other byte counts as OK.
    pub async fn read_ack(&mut self) -> Result<(), ScpError> {
        let mut scratch = [0u8; 1];
        let n = match self.chan.read(&mut scratch).await {
            Ok(n) => n,
            Err(e) => {
                self.close().await;
                return Err(ScpError::Transport(e));
            }
        };
        if n == 0 {
            self.close().await;
            return Err(ScpError::Eof);
        }
        if scratch[0] == WARN || scratch[0] == ERR {
            let mut msg = Vec::new();
            loop {
                match self.chan.read(&mut scratch).await {
                    Ok(1) if scratch[0] != NEWLINE => msg.push(scratch[0]),
                    // Newline, EOF or error all end the diagnostic.
                    _ => break,
                }
            }
            let msg = String::from_utf8_lossy(&msg).into_owned();
            self.close().await;
            return Err(ScpError::Peer(msg));
        }
        Ok(())
    }

    /// Sends the OK ack byte.
    pub async fn send_ok(&mut self) -> Result<(), ScpError> {
        self.write_bytes(&[OK]).await
    }

    /// Sends an ERR ack with diagnostic text, then closes the channel.
    /// Write errors are ignored; the channel is going away anyway.
    pub async fn send_err(&mut self, text: &str) {
        if !self.closed {
            let _ = self.chan.write_all(&[ERR]).await;
            let _ = self.chan.write_all(text.as_bytes()).await;
            let _ = self.chan.write_all(&[NEWLINE]).await;
            let _ = self.chan.flush().await;
        }
        self.close().await;
    }

    /// Reads bytes up to (not including) the next newline.
    pub async fn read_line(&mut self) -> Result<String, ScpError> {
        let mut line = Vec::new();
        let mut scratch = [0u8; 1];
        loop {
            match self.chan.read(&mut scratch).await {
                Ok(0) => return Err(ScpError::Eof),
                Ok(_) => {
                    if scratch[0] == NEWLINE {
                        break;
                    }
                    line.push(scratch[0]);
                }
                Err(e) => {
                    self.close().await;
                    return Err(ScpError::Transport(e));
                }
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Writes a control line followed by the newline terminator.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ScpError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(NEWLINE);
        self.write_bytes(&buf).await.map_err(|e| {
            error!("error sending protocol message {line:?}: {e}");
            e
        })
    }

    /// Reads some payload bytes into `buf`, returning the count.
    /// End-of-stream mid-payload is an error for every caller.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ScpError> {
        match self.chan.read(buf).await {
            Ok(0) => Err(ScpError::Eof),
            Ok(n) => Ok(n),
            Err(e) => {
                self.close().await;
                Err(ScpError::Transport(e))
            }
        }
    }

    /// Writes payload bytes.
    pub async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), ScpError> {
        if self.closed {
            return Err(ScpError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel already closed",
            )));
        }
        let result = async {
            self.chan.write_all(buf).await?;
            self.chan.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close().await;
                Err(ScpError::Transport(e))
            }
        }
    }

    /// Sends the SSH exit-status reply. Failures are ignored: on the
    /// error paths the channel may already be gone.
    pub async fn send_exit_status(&mut self, status: u32) {
        let _ = self.chan.send_exit_status(status).await;
    }

    /// Closes the channel. Idempotent.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.chan.close().await;
        }
    }

    /// Whether the channel has been closed by this framer.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
