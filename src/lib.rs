// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZMODEM file transfer protocol engine, push style.
//!
//! The engine never touches a serial port or the file system itself: the
//! host owns the byte pipe and hands every received byte to
//! [`Session::feed`], delivers timer expiries to [`Session::tick`], and
//! supplies transport, file and status callbacks through the [`Host`]
//! trait. Outgoing protocol bytes leave through `Host::xmit` in the order
//! the engine produced them.
//!
//! A transfer runs until an entry point returns [`Control::Done`] or an
//! [`Error`]; either way the session is finished and the host disposes of
//! it (the transport stays the host's to close).
//!
//! When the far end turns out to speak YMODEM instead (a bare `C`, `G` or
//! NAK where a ZMODEM header was expected, or silence met by our receiver),
//! the session downshifts and keeps going over the same callbacks.

use std::fmt::{self, Display};

pub mod consts;
pub mod crc;
pub mod escape;
mod frame;
mod host;
mod proto;
mod recv;
mod send;
mod session;
mod ymodem;

pub use frame::{Encoding, Frame, Header, Packet, Zrinit};
pub use host::{AttentionHandle, Config, Event, FileOpen, Host, HostError, Windowing};
pub use proto::State;
pub use session::Session;

/// A byte could not be decoded as the wire element it should have been.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InvalidData;

/// What an entry point wants from the host next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    /// Keep the session: feed more bytes, deliver ticks.
    Continue,
    /// The session completed; dispose of it.
    Done,
}

/// Terminal session errors. Recoverable trouble (bad CRCs, unexpected
/// headers) is handled on the wire with ZNAK/ZRPOS and never surfaces here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Remote cancelled (five CAN bytes) or sent ZCAN.
    Cancel,
    /// Gave up waiting for the remote end.
    RecvTimeout,
    /// Gave up waiting while the remote end should have been consuming.
    SendTimeout,
    /// Remote command handling timed out.
    CmdTimeout,
    /// A host callback failed (file I/O or transport).
    SysFile,
    /// Nothing to send.
    NoFile,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::Cancel => "cancelled by remote",
            Error::RecvTimeout => "timed out waiting for remote",
            Error::SendTimeout => "timed out sending to remote",
            Error::CmdTimeout => "timed out waiting for command",
            Error::SysFile => "host system call failed",
            Error::NoFile => "no file to transfer",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<HostError> for Error {
    fn from(_: HostError) -> Self {
        Error::SysFile
    }
}
