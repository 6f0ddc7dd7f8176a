//! Host-supplied callbacks: the byte transport, file storage and status
//! reporting the engine is embedded against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A host callback failed. Carries no detail; the host already knows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostError;

/// Receiver host's verdict on an announced file.
pub enum FileOpen<F> {
    /// Write into `file`, starting (resuming) at `offset`.
    Accept { file: F, offset: u32 },
    /// Not wanted; the sender is told to skip it.
    Skip,
}

/// Status events surfaced while a transfer runs.
#[derive(Debug, PartialEq)]
pub enum Event<'a> {
    /// Nothing heard from the remote receiver.
    RecvTimeout(u32),
    /// Nothing heard from the remote sender.
    SendTimeout(u32),
    /// Unexpected header (type byte attached) in the current state.
    ProtocolErr(u8),
    /// Remote cancelled the session.
    RemoteCancel,
    /// Remote pushed text at us via ZSTDERR.
    RemoteMessage(&'a [u8]),
    FileBegin { name: &'a str, size: u32 },
    /// Transfer position after the last write.
    FileProgress(u32),
    FileEnd { name: &'a str },
    Skip { name: &'a str },
    Done,
}

/// The narrow interface the engine drives its surroundings through. All
/// methods are called from `feed`/`tick` on the host's own thread and must
/// not re-enter the session.
pub trait Host {
    /// Opaque transfer-file handle, borrowed back on every file callback.
    type File;

    /// Writes bytes to the transport, preserving order. Must not block
    /// indefinitely.
    fn xmit(&mut self, data: &[u8]) -> Result<(), HostError>;

    /// Discards queued, unread transport input.
    fn iflush(&mut self) {}

    /// Discards queued, unsent transport output.
    fn oflush(&mut self) {}

    /// Opens a local file for sending; returns the handle and its size.
    fn file_open_read(&mut self, _name: &str) -> Result<(Self::File, u32), HostError> {
        Err(HostError)
    }

    /// Opens (or resumes) a local file for an announced incoming transfer.
    fn file_open_write(&mut self, _name: &str, _size: u32) -> Result<FileOpen<Self::File>, HostError> {
        Err(HostError)
    }

    /// Fills `buf` from the file, returning the byte count. A short count
    /// means end of file; anything else fills the whole buffer.
    fn file_read(&mut self, _file: &mut Self::File, _buf: &mut [u8]) -> Result<usize, HostError> {
        Err(HostError)
    }

    fn file_write(&mut self, _file: &mut Self::File, _data: &[u8]) -> Result<(), HostError> {
        Err(HostError)
    }

    fn file_seek(&mut self, _file: &mut Self::File, _offset: u32) -> Result<(), HostError> {
        Err(HostError)
    }

    /// CRC-32 over the first `len` bytes of the file, for ZCRC exchanges.
    fn file_crc32(&mut self, _file: &mut Self::File, _len: u32) -> Result<u32, HostError> {
        Err(HostError)
    }

    fn file_close(&mut self, file: Self::File) {
        drop(file);
    }

    fn status(&mut self, event: Event);

    /// Non-protocol bytes seen while idle, e.g. remote chatter worth
    /// displaying.
    fn idle_bytes(&mut self, _data: &[u8]) {}
}

/// Session configuration handed to `start_send`/`start_recv`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Data subpacket payload size; clamped to 64..=1024.
    pub packet_len: usize,
    pub windowing: Windowing,
    /// Escape the whole C0/C1 range outbound, even unasked.
    pub escape_ctl: bool,
    /// Verify a resume offset against the sender with a ZCRC exchange
    /// before asking for data.
    pub verify_resume: bool,
    /// Attention string announced to the receiver in a ZSINIT frame.
    pub attn: Option<Vec<u8>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_len: crate::consts::MAX_PACKET_LEN,
            windowing: Windowing::Streaming { window: None },
            escape_ctl: false,
            verify_resume: false,
            attn: None,
        }
    }
}

/// Sender throttling policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Windowing {
    /// Stream ZCRCG subpackets, soliciting an ack every tenth packet with
    /// ZCRCQ; optionally cap the unacknowledged span at `window` bytes.
    Streaming { window: Option<u32> },
    /// One ZCRCW subpacket per round trip; wait for each ZACK.
    FullAck,
}

/// Raises the attention flag of a session from another thread or a signal
/// context. Only performs atomic stores.
#[derive(Clone, Debug, Default)]
pub struct AttentionHandle(Arc<AtomicBool>);

impl AttentionHandle {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
