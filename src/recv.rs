// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receiver-side actions: file intake, resume, data streaming, completion.

use binread::{io::Cursor, BinRead, BinReaderExt, NullString};

use crate::frame::{Frame, Header, Packet, Zrinit};
use crate::host::{Event, FileOpen, Host};
use crate::proto::State;
use crate::session::{InputState, Session};
use crate::{Control, Error};

/// ZFILE (and YMODEM block 0) metadata: the file name, then a blank-
/// separated attribute string `size mtime mode serial files_left bytes_left`
/// of which everything past the size is advisory.
#[derive(BinRead)]
#[br(assert(!file_name.is_empty()))]
struct FileMeta {
    file_name: NullString,
    #[br(try)]
    attrs: Option<NullString>,
}

pub(crate) struct ParsedMeta {
    pub name: String,
    pub size: u32,
}

pub(crate) fn parse_file_meta(raw: &[u8]) -> Option<ParsedMeta> {
    let meta: FileMeta = Cursor::new(raw).read_ne().ok()?;
    let name = std::str::from_utf8(&meta.file_name).ok()?.to_string();
    let mut size = 0;
    if let Some(attrs) = meta.attrs {
        if let Ok(attrs) = std::str::from_utf8(&attrs) {
            if let Some(field) = attrs.split_ascii_whitespace().next() {
                size = field.parse().unwrap_or(0);
            }
        }
    }
    Some(ParsedMeta { name, size })
}

impl<H: Host> Session<H> {
    /// Announces our capabilities: full-duplex, overlapped I/O, CRC-32.
    pub(crate) fn send_rinit(&mut self) -> Result<(), Error> {
        let mut caps = Zrinit::CANFDX | Zrinit::CANOVIO | Zrinit::CANFC32;
        if self.cfg.escape_ctl {
            caps |= Zrinit::ESCCTL;
        }
        self.send_hex(Frame::ZRINIT, [0, 0, 0, caps.bits()])
    }

    pub(crate) fn send_rinit_action(&mut self) -> Result<Control, Error> {
        self.send_rinit()?;
        Ok(Control::Continue)
    }

    /// ZFILE header: the name subpacket follows in the same framing.
    pub(crate) fn got_file(&mut self, _header: &Header) -> Result<Control, Error> {
        self.data_setup();
        Ok(Control::Continue)
    }

    /// ZSINIT header: attention-string subpacket follows.
    pub(crate) fn got_sinit(&mut self) -> Result<Control, Error> {
        self.data_setup();
        Ok(Control::Continue)
    }

    pub(crate) fn got_sinit_data(&mut self, crc_good: bool) -> Result<Control, Error> {
        self.state = State::RStart;
        if !crc_good {
            self.send_hex(Frame::ZNAK, [0; 4])?;
            return Ok(Control::Continue);
        }
        let attn: Vec<u8> = self.buffer.iter().copied().take_while(|b| *b != 0).collect();
        log::debug!("sender attention string: {:02x?}", attn);
        self.peer_attn = Some(attn);
        self.send_hex_count(Frame::ZACK, 0)?;
        Ok(Control::Continue)
    }

    /// The ZFILE subpacket arrived: open or refuse the announced file.
    pub(crate) fn got_file_name(&mut self, crc_good: bool) -> Result<Control, Error> {
        if !crc_good {
            log::debug!("ZFILE data failed CRC");
            self.send_hex(Frame::ZNAK, [0; 4])?;
            self.state = State::RStart;
            return Ok(Control::Continue);
        }
        let meta = match parse_file_meta(&self.buffer) {
            Some(meta) => meta,
            None => {
                log::warn!("unparseable ZFILE metadata");
                self.send_hex(Frame::ZNAK, [0; 4])?;
                self.state = State::RStart;
                return Ok(Control::Continue);
            }
        };
        self.file_name = meta.name;
        self.file_size = meta.size;
        log::debug!("incoming file {:?}, {} bytes", self.file_name, self.file_size);

        match self.host.file_open_write(&self.file_name, self.file_size) {
            Ok(FileOpen::Accept { file, offset }) => {
                self.file = Some(file);
                self.count = offset;
                self.host.status(Event::FileBegin {
                    name: &self.file_name,
                    size: self.file_size,
                });
                if offset > 0 && self.cfg.verify_resume {
                    self.send_hex_count(Frame::ZCRC, offset)?;
                    self.state = State::RCrc;
                } else {
                    self.send_hex_count(Frame::ZRPOS, offset)?;
                    self.state = State::RFile;
                }
            }
            _ => {
                log::debug!("refusing {:?}", self.file_name);
                self.host.status(Event::Skip {
                    name: &self.file_name,
                });
                self.send_hex(Frame::ZSKIP, [0; 4])?;
                self.state = State::RStart;
            }
        }
        Ok(Control::Continue)
    }

    /// The sender's CRC over the part we already have. Match: resume.
    /// Mismatch: the local copy is something else, restart from zero.
    pub(crate) fn got_file_crc(&mut self, header: &Header) -> Result<Control, Error> {
        let local = match self.file.as_mut() {
            Some(file) => match self.host.file_crc32(file, self.count) {
                Ok(crc) => crc,
                Err(_) => return self.recv_file_error(),
            },
            None => 0,
        };
        if header.count() != local {
            log::debug!("resume check failed, restarting from zero");
            self.count = 0;
            if let Some(file) = self.file.as_mut() {
                if self.host.file_seek(file, 0).is_err() {
                    return self.recv_file_error();
                }
            }
        }
        self.send_hex_count(Frame::ZRPOS, self.count)?;
        self.state = State::RFile;
        Ok(Control::Continue)
    }

    /// ZDATA: the sender will stream subpackets from `header.count()`.
    pub(crate) fn got_data(&mut self, header: &Header) -> Result<Control, Error> {
        if header.count() != self.count {
            log::debug!("ZDATA at {}, expected {}", header.count(), self.count);
            self.flush_input();
            self.send_hex_count(Frame::ZRPOS, self.count)?;
            self.state = State::RFile;
            return Ok(Control::Continue);
        }
        if let Some(file) = self.file.as_mut() {
            if self.host.file_seek(file, self.count).is_err() {
                return self.recv_file_error();
            }
        }
        self.data_setup();
        Ok(Control::Continue)
    }

    /// One data subpacket, good or bad.
    pub(crate) fn got_file_data(&mut self, crc_good: bool) -> Result<Control, Error> {
        if !crc_good {
            log::debug!("bad subpacket at {}, repositioning", self.count);
            self.flush_input();
            self.send_hex_count(Frame::ZRPOS, self.count)?;
            self.state = State::RDataErr;
            return Ok(Control::Continue);
        }
        if let Some(file) = self.file.as_mut() {
            if self.host.file_write(file, &self.buffer).is_err() {
                return self.recv_file_error();
            }
        }
        self.count += self.buffer.len() as u32;
        self.host.status(Event::FileProgress(self.count));
        match self.packet_type {
            Packet::ZCRCW => self.send_hex_count(Frame::ZACK, self.count)?,
            Packet::ZCRCQ => {
                self.send_hex_count(Frame::ZACK, self.count)?;
                self.data_setup();
            }
            Packet::ZCRCG => self.data_setup(),
            Packet::ZCRCE => {}
        }
        Ok(Control::Continue)
    }

    /// ZEOF whose offset matches what we wrote completes the file; anything
    /// else asks the sender to come back to where we actually are.
    pub(crate) fn got_eof(&mut self, header: &Header) -> Result<Control, Error> {
        if header.count() != self.count {
            log::error!(
                "ZEOF offset mismatch: frame({}) != recv({})",
                header.count(),
                self.count
            );
            self.send_hex_count(Frame::ZRPOS, self.count)?;
            self.state = State::RFile;
            return Ok(Control::Continue);
        }
        self.close_file();
        self.host.status(Event::FileEnd {
            name: &self.file_name,
        });
        self.send_rinit()?;
        Ok(Control::Continue)
    }

    /// ZFIN: answer in kind and wait for the "OO" trailer.
    pub(crate) fn got_fin(&mut self) -> Result<Control, Error> {
        self.send_hex(Frame::ZFIN, [0; 4])?;
        self.input = InputState::Finish;
        self.chr_count = 0;
        Ok(Control::Continue)
    }

    pub(crate) fn resend_rpos(&mut self) -> Result<Control, Error> {
        self.send_hex_count(Frame::ZRPOS, self.count)?;
        Ok(Control::Continue)
    }

    pub(crate) fn resend_crc_req(&mut self) -> Result<Control, Error> {
        self.send_hex_count(Frame::ZCRC, self.count)?;
        Ok(Control::Continue)
    }

    /// Local file trouble mid-transfer is terminal: tell the sender and
    /// unwind.
    fn recv_file_error(&mut self) -> Result<Control, Error> {
        let _ = self.send_hex(Frame::ZFERR, [0; 4]);
        self.close_file();
        Err(Error::SysFile)
    }

    /// Receive-side timeout ladder.
    pub(crate) fn rcv_timeout(&mut self) -> Result<Control, Error> {
        match self.state {
            State::RStart => {
                if self.timeout_count > 4 {
                    // The sender may be a plain YMODEM program that is
                    // waiting for us to speak first.
                    return self.ymodem_rinit();
                }
                self.host.status(Event::SendTimeout(self.timeout_count));
                self.send_rinit()?;
                Ok(Control::Continue)
            }
            State::RSinitWait | State::RFileName => {
                self.host.status(Event::SendTimeout(self.timeout_count));
                if self.timeout_count > 4 {
                    return Err(Error::RecvTimeout);
                }
                self.state = State::RStart;
                self.input = InputState::Idle;
                self.send_rinit()?;
                Ok(Control::Continue)
            }
            State::RCrc | State::RFile | State::RData | State::RDataErr => {
                self.host.status(Event::SendTimeout(self.timeout_count));
                if self.timeout_count > 2 {
                    self.timeout_count = 0;
                    self.state = State::RStart;
                    self.input = InputState::Idle;
                    self.send_rinit()?;
                    return Ok(Control::Continue);
                }
                if self.state == State::RCrc {
                    self.resend_crc_req()
                } else {
                    self.resend_rpos()
                }
            }
            State::RFinish => {
                self.host.status(Event::SendTimeout(self.timeout_count));
                self.host.status(Event::Done);
                Ok(Control::Done)
            }
            _ => Ok(Control::Continue),
        }
    }
}
