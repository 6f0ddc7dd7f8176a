// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session state and the byte-level lexer.
//!
//! `chr_count` is effectively the lexer's state variable: it counts pads
//! while idling, collected bytes inside a header, and the two `O`s of the
//! session trailer.

use crate::consts::*;
use crate::frame::{Encoding, Frame, Header, HeaderError, Packet, Zrinit};
use crate::host::{AttentionHandle, Config, Event, Host};
use crate::proto::State;
use crate::{Control, Error};
use std::collections::VecDeque;
use tinyvec::ArrayVec;

/// Which driver the lexer feeds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Protocol {
    Zmodem,
    Ymodem,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Role {
    Sender,
    Receiver,
}

/// Lexer state: what the next inbound byte belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum InputState {
    Idle,
    Header,
    Data,
    Finish,
    Ysend,
    Yrcv,
}

/// A ZMODEM (or downshifted YMODEM) transfer in progress. Created with
/// [`Session::start_send`] or [`Session::start_recv`], driven by the host
/// with [`Session::feed`] and [`Session::tick`].
pub struct Session<H: Host> {
    pub(crate) host: H,
    pub(crate) cfg: Config,
    pub(crate) role: Role,
    pub(crate) protocol: Protocol,
    pub(crate) state: State,
    pub(crate) input: InputState,

    // Lexer scratch.
    pub(crate) escape: bool,
    pub(crate) framing: Encoding,
    pub(crate) chr_count: usize,
    pub(crate) crc_count: usize,
    pub(crate) packet_type: Packet,
    pub(crate) hdr: [u8; HEADER_SIZE],
    pub(crate) buffer: ArrayVec<[u8; BUFFER_SIZE]>,
    pub(crate) trailer: ArrayVec<[u8; 4]>,
    pub(crate) overrun: bool,
    can_count: u32,
    pub(crate) noise_count: u32,
    iflush_pending: bool,

    // Protocol counters and flags.
    pub(crate) timeout_count: u32,
    pub(crate) waitflag: bool,
    attention: AttentionHandle,

    // Transfer context.
    pub(crate) file: Option<H::File>,
    pub(crate) file_name: String,
    pub(crate) file_size: u32,
    pub(crate) count: u32,
    pub(crate) acked: u32,
    pub(crate) frame_open: bool,
    pub(crate) pending: VecDeque<String>,
    pub(crate) peer: Zrinit,
    pub(crate) peer_attn: Option<Vec<u8>>,
    pub(crate) sinit_sent: bool,
    pub(crate) escape_ctl: bool,
    pub(crate) txbuf: ArrayVec<[u8; MAX_PACKET_LEN]>,

    // YMODEM context.
    pub(crate) crc_mode: bool,
    pub(crate) streaming: bool,
    pub(crate) block_num: u8,
    pub(crate) next_is_block0: bool,
    pub(crate) remaining: u32,
    pub(crate) retries: u32,
    pub(crate) pkt_len: usize,
    pub(crate) txseq: u8,
    pub(crate) txlen: usize,
}

impl<H: Host> Session<H> {
    fn new(host: H, cfg: Config, role: Role, state: State) -> Self {
        let mut cfg = cfg;
        cfg.packet_len = cfg.packet_len.clamp(64, MAX_PACKET_LEN);
        let escape_ctl = cfg.escape_ctl;
        Self {
            host,
            cfg,
            role,
            protocol: Protocol::Zmodem,
            state,
            input: InputState::Idle,
            escape: false,
            framing: Encoding::ZHEX,
            chr_count: 0,
            crc_count: 0,
            packet_type: Packet::ZCRCE,
            hdr: [0; HEADER_SIZE],
            buffer: ArrayVec::new(),
            trailer: ArrayVec::new(),
            overrun: false,
            can_count: 0,
            noise_count: 0,
            iflush_pending: false,
            timeout_count: 0,
            waitflag: false,
            attention: AttentionHandle::default(),
            file: None,
            file_name: String::new(),
            file_size: 0,
            count: 0,
            acked: 0,
            frame_open: false,
            pending: VecDeque::new(),
            peer: Zrinit::empty(),
            peer_attn: None,
            sinit_sent: false,
            escape_ctl,
            txbuf: ArrayVec::new(),
            crc_mode: false,
            streaming: false,
            block_num: 0,
            next_is_block0: true,
            remaining: 0,
            retries: 0,
            pkt_len: 0,
            txseq: 0,
            txlen: 0,
        }
    }

    /// Starts a sending session for the named files and emits the opening
    /// ZRQINIT. Fails with [`Error::NoFile`] when `files` is empty.
    pub fn start_send(host: H, files: Vec<String>, cfg: Config) -> Result<Self, Error> {
        if files.is_empty() {
            return Err(Error::NoFile);
        }
        let mut session = Self::new(host, cfg, Role::Sender, State::TStart);
        session.pending = files.into();
        session.write_header(Header::new(Encoding::ZHEX, Frame::ZRQINIT))?;
        Ok(session)
    }

    /// Starts a receiving session and emits the opening ZRINIT.
    pub fn start_recv(host: H, cfg: Config) -> Result<Self, Error> {
        let mut session = Self::new(host, cfg, Role::Receiver, State::RStart);
        session.send_rinit()?;
        Ok(session)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// True once the session has fallen back to YMODEM.
    pub fn downshifted(&self) -> bool {
        self.protocol == Protocol::Ymodem
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// A handle for raising the attention flag from a signal handler or
    /// another thread; the flag is applied on the next `feed`/`tick`.
    pub fn attention_handle(&self) -> AttentionHandle {
        self.attention.clone()
    }

    /// Raises the attention flag. Safe to call concurrently with `feed`
    /// through [`Session::attention_handle`]; this convenience form needs
    /// the session itself.
    pub fn attention(&self) {
        self.attention.raise();
    }

    /// Hands received transport bytes to the engine, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Control, Error> {
        log::trace!("feed: {} bytes, state {:?}", bytes.len(), self.state);
        self.apply_attention();
        for &c in bytes {
            if c == CAN {
                self.can_count += 1;
                if self.can_count >= 5 {
                    log::debug!("five CANs in a row, remote cancelled");
                    self.close_file();
                    self.host.status(Event::RemoteCancel);
                    return Err(Error::Cancel);
                }
            } else {
                self.can_count = 0;
            }

            let control = match self.input {
                InputState::Ysend => self.ysend_char(c)?,
                InputState::Yrcv => self.yrcv_char(c)?,
                _ if c == XON || c == XOFF => Control::Continue,
                InputState::Idle => self.idle_char(c)?,
                InputState::Header => self.hdr_char(c)?,
                InputState::Data => self.data_char(c)?,
                InputState::Finish => self.finish_char(c),
            };
            if control == Control::Done {
                return Ok(Control::Done);
            }
            if std::mem::take(&mut self.iflush_pending) {
                // A transition asked for an input flush; the rest of this
                // chunk is part of what gets dropped.
                break;
            }
        }
        Ok(Control::Continue)
    }

    /// Call when the receive timeout elapses without input.
    pub fn tick(&mut self) -> Result<Control, Error> {
        self.apply_attention();
        self.timeout_count += 1;
        log::debug!("timeout {} in {:?}", self.timeout_count, self.state);
        match self.state {
            State::RStart
            | State::RSinitWait
            | State::RFileName
            | State::RCrc
            | State::RFile
            | State::RData
            | State::RDataErr
            | State::RFinish => self.rcv_timeout(),
            State::TStart
            | State::TInit
            | State::FileWait
            | State::CrcWait
            | State::Sending
            | State::SendWait
            | State::SendDone
            | State::SendEof
            | State::TFinish => self.snd_timeout(),
            State::YTStart
            | State::YTFile
            | State::YTDataWait
            | State::YTData
            | State::YTEof
            | State::YTFin => {
                self.host.status(Event::RecvTimeout(self.timeout_count));
                Err(Error::RecvTimeout)
            }
            State::YRStart | State::YRDataWait | State::YRData | State::YREof => {
                self.yrcv_timeout()
            }
            State::CommandData | State::StderrData => Err(Error::SendTimeout),
            State::CommandWait => Err(Error::CmdTimeout),
            State::Done => Ok(Control::Done),
        }
    }

    /// Aborts the transfer: flushes both directions and emits the canonical
    /// cancel sequence (eight CANs, then backspaces to rub them out of the
    /// remote's line buffer).
    pub fn abort(&mut self) -> Result<(), Error> {
        const CANISTR: [u8; 18] = [
            CAN, CAN, CAN, CAN, CAN, CAN, CAN, CAN, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
        ];
        log::debug!("abort in {:?}", self.state);
        self.state = State::Done;
        self.input = InputState::Idle;
        self.close_file();
        self.host.iflush();
        self.host.oflush();
        self.host.xmit(&CANISTR)?;
        Ok(())
    }

    /// Ends a sending batch early: remaining files are dropped and the
    /// session proceeds to ZFIN.
    pub fn finish_send(&mut self) -> Result<(), Error> {
        if self.role != Role::Sender || self.state == State::Done {
            return Ok(());
        }
        self.pending.clear();
        self.close_file();
        self.write_header(Header::new(Encoding::ZHEX, Frame::ZFIN))?;
        self.state = State::TFinish;
        Ok(())
    }

    /// Applies a pending attention request: when streaming, drop queued
    /// output and hold off until the receiver repositions us.
    fn apply_attention(&mut self) {
        if self.attention.take() && self.state == State::Sending {
            log::debug!("attention: pausing transmission");
            self.host.oflush();
            self.waitflag = true;
        }
    }

    pub(crate) fn close_file(&mut self) {
        if let Some(file) = self.file.take() {
            self.host.file_close(file);
        }
    }

    pub(crate) fn write_header(&mut self, header: Header) -> Result<(), Error> {
        log::debug!("send header {:?} {:?}", header.kind(), header.flags());
        header.write(&mut self.host, self.escape_ctl)?;
        Ok(())
    }

    pub(crate) fn send_hex(&mut self, kind: Frame, flags: [u8; 4]) -> Result<(), Error> {
        self.write_header(Header::new(Encoding::ZHEX, kind).with_flags(&flags))
    }

    pub(crate) fn send_hex_count(&mut self, kind: Frame, count: u32) -> Result<(), Error> {
        self.write_header(Header::new(Encoding::ZHEX, kind).with_count(count))
    }

    /// Frame encoding for data-bearing frames, per the negotiated CRC-32
    /// capability.
    pub(crate) fn data_encoding(&self) -> Encoding {
        if self.peer.contains(Zrinit::CANFC32) {
            Encoding::ZBIN32
        } else {
            Encoding::ZBIN
        }
    }

    /// Arms the lexer for a data subpacket in the current framing.
    pub(crate) fn data_setup(&mut self) {
        self.input = InputState::Data;
        self.escape = false;
        self.chr_count = 0;
        self.crc_count = 0;
        self.buffer.clear();
        self.trailer.clear();
        self.overrun = false;
    }

    /// Requests an input flush once the lexer returns to the feed loop.
    pub(crate) fn flush_input(&mut self) {
        self.iflush_pending = true;
        self.host.iflush();
    }

    /// Idle bytes: hunting for the ZPAD-ZDLE prelude of a header.
    fn idle_char(&mut self, c: u8) -> Result<Control, Error> {
        if self.chr_count == 0 {
            if c == ZPAD {
                self.chr_count = 1;
            } else if self.state == State::Sending {
                self.noise_count += 1;
                if self.noise_count > MAX_NOISE {
                    self.waitflag = true;
                }
            } else if self.state == State::TStart && (c == YMODEM_CRC || c == YMODEM_G || c == NAK)
            {
                log::debug!("receiver speaks YMODEM, downshifting");
                self.protocol = Protocol::Ymodem;
                self.input = InputState::Ysend;
                self.state = State::YTStart;
                return self.ysend_char(c);
            } else {
                self.host.idle_bytes(&[c]);
            }
            return Ok(Control::Continue);
        }
        match c {
            ZPAD => {
                self.chr_count += 1;
                Ok(Control::Continue)
            }
            ZDLE => {
                self.input = InputState::Header;
                self.escape = false;
                self.chr_count = 0;
                self.hdr = [0; HEADER_SIZE];
                Ok(Control::Continue)
            }
            _ => {
                // False prelude: surface the swallowed pads, then look at
                // this byte again from scratch.
                for _ in 0..self.chr_count {
                    self.host.idle_bytes(b"*");
                }
                self.chr_count = 0;
                self.idle_char(c)
            }
        }
    }

    /// Header bytes, all three framings.
    fn hdr_char(&mut self, c: u8) -> Result<Control, Error> {
        if c == ZDLE {
            self.escape = true;
            return Ok(Control::Continue);
        }
        let c = if self.escape {
            self.escape = false;
            match c {
                ZRUB0 => 0x7f,
                ZRUB1 => 0xff,
                _ => c ^ 0x40,
            }
        } else {
            c
        };

        if self.chr_count == 0 {
            // Waiting for the framing byte.
            return match Encoding::try_from(c) {
                Ok(encoding) => {
                    self.framing = encoding;
                    self.chr_count = 1;
                    self.hdr = [0; HEADER_SIZE];
                    Ok(Control::Continue)
                }
                Err(_) => self.hdr_nak(),
            };
        }

        match self.framing {
            // A hex header is 14 hex digits, then CR LF. The optional XON
            // after it is swallowed by the feed loop.
            Encoding::ZHEX => {
                if self.chr_count <= 14 && !c.is_ascii_hexdigit() {
                    return self.hdr_nak();
                }
                if self.chr_count <= 14 {
                    let i = (self.chr_count - 1) / 2;
                    self.hdr[i] = rcv_hex(self.hdr[i], c);
                }
                if self.chr_count == 16 {
                    return self.hdr_done();
                }
                self.chr_count += 1;
            }
            // A binary header is the type, 4 data bytes and the CRC.
            Encoding::ZBIN | Encoding::ZBIN32 => {
                self.hdr[self.chr_count - 1] = c;
                self.chr_count += 1;
                if self.chr_count > Header::collected_size(self.framing) {
                    return self.hdr_done();
                }
            }
        }
        Ok(Control::Continue)
    }

    fn hdr_done(&mut self) -> Result<Control, Error> {
        self.input = InputState::Idle;
        self.chr_count = 0;
        let raw = &self.hdr[..Header::collected_size(self.framing)];
        match Header::decode(self.framing, raw) {
            Ok(header) => self.dispatch_header(header),
            Err(HeaderError::Crc) => {
                log::debug!("header CRC mismatch in {:?}", self.state);
                self.send_hex(Frame::ZNAK, [0; 4])?;
                Ok(Control::Continue)
            }
            Err(HeaderError::Kind(kind)) => self.protocol_failure(kind),
        }
    }

    fn hdr_nak(&mut self) -> Result<Control, Error> {
        self.input = InputState::Idle;
        self.chr_count = 0;
        log::debug!("garbled header in {:?}, sending ZNAK", self.state);
        self.send_hex(Frame::ZNAK, [0; 4])?;
        Ok(Control::Continue)
    }

    /// Data subpacket bytes: payload, ZDLE-marked terminator, CRC trailer.
    fn data_char(&mut self, c: u8) -> Result<Control, Error> {
        if c == ZDLE {
            self.escape = true;
            return Ok(Control::Continue);
        }
        let c = if self.escape {
            self.escape = false;
            if self.crc_count == 0 {
                if let Ok(kind) = Packet::try_from(c) {
                    // Terminator: note it and start collecting the CRC.
                    self.packet_type = kind;
                    self.crc_count = self.framing.crc_len();
                    self.trailer.clear();
                    return Ok(Control::Continue);
                }
            }
            match c {
                ZRUB0 => 0x7f,
                ZRUB1 => 0xff,
                _ => c ^ 0x40,
            }
        } else {
            c
        };

        if self.crc_count == 0 {
            if self.buffer.len() == self.buffer.capacity() {
                // Oversized subpacket; keep consuming so the stream stays
                // parseable, but the packet is already condemned.
                self.overrun = true;
            } else {
                self.buffer.push(c);
            }
            return Ok(Control::Continue);
        }

        self.trailer.push(c);
        self.crc_count -= 1;
        if self.crc_count > 0 {
            return Ok(Control::Continue);
        }

        self.input = InputState::Idle;
        let good = !self.overrun
            && match self.framing {
                Encoding::ZBIN32 => crate::crc::check_crc32(
                    &self.buffer,
                    Some(self.packet_type as u8),
                    &self.trailer,
                ),
                _ => crate::crc::check_crc16(
                    &self.buffer,
                    Some(self.packet_type as u8),
                    &self.trailer,
                ),
            };
        self.data_received(good)
    }

    /// Session trailer: two consecutive `O`s.
    fn finish_char(&mut self, c: u8) -> Control {
        if c == b'O' {
            self.chr_count += 1;
            if self.chr_count >= 2 {
                self.state = State::Done;
                self.host.status(Event::Done);
                return Control::Done;
            }
        } else {
            self.chr_count = 0;
        }
        Control::Continue
    }
}

fn rcv_hex(acc: u8, c: u8) -> u8 {
    let nibble = match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        _ => c - b'a' + 10,
    };
    (acc << 4) | nibble
}
