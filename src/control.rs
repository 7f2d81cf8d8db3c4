//! Control channel for runlevel and shutdown requests.
//!
//! Requests arrive on a named pipe as fixed 12-byte little-endian frames:
//!
//! ```text
//! [ "INIT" ][ i32 command ][ i32 argument ]
//! ```
//!
//! Command `0` changes to the runlevel in the argument, command `1` shuts
//! down. The pipe is one-way and unauthenticated: anything able to write to
//! it (owner only, mode `0600`) controls the supervisor. Malformed frames
//! are dropped without a reply, and stray bytes are skipped up to the next
//! magic so one bad write cannot misalign later frames.

use crate::definition::Runlevel;
use crate::error::{Error, Result};
use crate::signals::ControlEvent;
use nix::sys::stat::Mode;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default path for the control FIFO.
pub const DEFAULT_CONTROL_FIFO: &str = "/run/initctl";

/// Frame tag.
pub const MAGIC: [u8; 4] = *b"INIT";

/// Size of one frame in bytes.
pub const FRAME_LEN: usize = 12;

/// Command code: change runlevel.
pub const CMD_CHANGE_RUNLEVEL: i32 = 0;

/// Command code: shutdown.
pub const CMD_SHUTDOWN: i32 = 1;

/// Largest read from the FIFO; writes up to `PIPE_BUF` are atomic.
const READ_CHUNK: usize = 4096;

/// Delay before reopening the FIFO after a read error.
const REOPEN_DELAY: Duration = Duration::from_millis(100);

/// Why a frame was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is {0} bytes, expected 12")]
    Length(usize),
    #[error("bad magic {0:?}")]
    Magic([u8; 4]),
    #[error("unknown command {0}")]
    UnknownCommand(i32),
    #[error("invalid runlevel {0}")]
    Runlevel(i32),
}

/// A raw control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub magic: [u8; 4],
    pub command: i32,
    pub argument: i32,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    ChangeRunlevel(Runlevel),
    Shutdown,
}

impl ControlRequest {
    pub fn change_runlevel(level: i32) -> Self {
        Self {
            magic: MAGIC,
            command: CMD_CHANGE_RUNLEVEL,
            argument: level,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            magic: MAGIC,
            command: CMD_SHUTDOWN,
            argument: 0,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.command.to_le_bytes());
        buf[8..12].copy_from_slice(&self.argument.to_le_bytes());
        buf
    }

    /// Decode one frame, checking its length and magic.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, DecodeError> {
        let frame: &[u8; FRAME_LEN] = buf
            .try_into()
            .map_err(|_| DecodeError::Length(buf.len()))?;

        let magic = [frame[0], frame[1], frame[2], frame[3]];
        if magic != MAGIC {
            return Err(DecodeError::Magic(magic));
        }

        Ok(Self {
            magic,
            command: i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            argument: i32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]),
        })
    }

    /// Interpret the command code and argument.
    pub fn command(&self) -> std::result::Result<ControlCommand, DecodeError> {
        match self.command {
            CMD_CHANGE_RUNLEVEL => Runlevel::from_payload(self.argument)
                .map(ControlCommand::ChangeRunlevel)
                .map_err(|_| DecodeError::Runlevel(self.argument)),
            CMD_SHUTDOWN => Ok(ControlCommand::Shutdown),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

impl From<ControlCommand> for ControlEvent {
    fn from(command: ControlCommand) -> Self {
        match command {
            ControlCommand::ChangeRunlevel(level) => ControlEvent::ChangeRunlevel(level),
            ControlCommand::Shutdown => ControlEvent::Shutdown,
        }
    }
}

/// Decode a frame all the way to an event.
pub fn decode_event(buf: &[u8]) -> Result<ControlEvent> {
    let request = ControlRequest::decode(buf)?;
    Ok(request.command()?.into())
}

/// Control FIFO server (runs in the init process).
pub struct ControlServer {
    path: PathBuf,
    events: mpsc::Sender<ControlEvent>,
}

impl ControlServer {
    pub fn new(path: impl AsRef<Path>, events: mpsc::Sender<ControlEvent>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-create the FIFO, removing any stale instance first.
    pub fn bind(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if std::fs::symlink_metadata(&self.path).is_ok() {
            std::fs::remove_file(&self.path)?;
        }

        nix::unistd::mkfifo(self.path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
            Error::ControlChannel {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;

        // mkfifo honours the umask; make the mode exact
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;

        info!(path = %self.path.display(), "Control channel listening");
        Ok(())
    }

    /// Create the FIFO and serve frames until the event channel closes.
    ///
    /// Read errors reopen the FIFO; decode errors drop the frame.
    pub async fn run(self) -> Result<()> {
        self.bind()?;

        loop {
            let mut receiver = match pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(&self.path)
            {
                Ok(receiver) => receiver,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Failed to open control channel");
                    tokio::time::sleep(REOPEN_DELAY).await;
                    if !is_fifo(&self.path) {
                        if let Err(e) = self.bind() {
                            error!(error = %e, "Failed to re-create control channel");
                        }
                    }
                    continue;
                }
            };

            let mut buf = [0u8; READ_CHUNK];
            loop {
                match receiver.read(&mut buf).await {
                    Ok(0) => {
                        warn!("Control channel closed, reopening");
                        break;
                    }
                    Ok(n) => self.dispatch_chunk(&buf[..n]).await?,
                    Err(e) => {
                        warn!(error = %e, "Control channel read failed, reopening");
                        tokio::time::sleep(REOPEN_DELAY).await;
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch every frame found in one read.
    ///
    /// Each write of a frame arrives whole, so a chunk never carries part of
    /// a frame written by a well-behaved client. Bytes that do not start a
    /// frame are skipped until the next magic.
    pub async fn dispatch_chunk(&self, chunk: &[u8]) -> Result<()> {
        let (frames, skipped) = split_frames(chunk);
        if skipped > 0 {
            debug!(bytes = skipped, "Skipping unframed control bytes");
        }
        for frame in frames {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    /// Decode one frame and post the resulting event.
    ///
    /// Only a closed event channel is an error.
    pub async fn dispatch(&self, frame: &[u8]) -> Result<()> {
        let event = match decode_event(frame) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Dropping control frame");
                return Ok(());
            }
        };

        info!(event = ?event, "Control request");
        self.events
            .send(event)
            .await
            .map_err(|_| Error::EventChannelClosed)
    }
}

/// Split a chunk into frame-sized pieces that start with [`MAGIC`].
///
/// Returns the pieces and the number of bytes skipped. A trailing piece
/// shorter than a frame is skipped.
pub fn split_frames(chunk: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut frames = Vec::new();
    let mut skipped = 0;
    let mut rest = chunk;

    while !rest.is_empty() {
        if rest.len() >= FRAME_LEN && rest.starts_with(&MAGIC) {
            frames.push(&rest[..FRAME_LEN]);
            rest = &rest[FRAME_LEN..];
            continue;
        }
        let next = rest[1..]
            .windows(MAGIC.len())
            .position(|w| w == MAGIC)
            .map_or(rest.len(), |i| i + 1);
        skipped += next;
        rest = &rest[next..];
    }

    (frames, skipped)
}

fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

/// Control FIFO client (used by the `telinit` and `shutdown` subcommands).
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Write one frame. Fails when no supervisor holds the FIFO open.
    pub fn send(&self, request: &ControlRequest) -> Result<()> {
        let mut fifo = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| Error::ControlChannel {
                path: self.path.clone(),
                reason: format!("{}. Is the supervisor running?", e),
            })?;

        fifo.write_all(&request.encode())?;
        Ok(())
    }

    pub fn change_runlevel(&self, level: i32) -> Result<()> {
        self.send(&ControlRequest::change_runlevel(level))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(&ControlRequest::shutdown())
    }
}
