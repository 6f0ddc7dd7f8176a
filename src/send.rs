// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sender-side actions: session open, file announcement, data streaming,
//! rewind on ZRPOS, batch advance, finish.

use tinyvec::ArrayVec;

use crate::consts::{MAX_PACKET_LEN, SUBPACKET_PER_ACK};
use crate::frame::{self, Frame, Header, Packet, Zrinit};
use crate::host::{Event, Host, Windowing};
use crate::proto::State;
use crate::session::Session;
use crate::{Control, Error};

impl<H: Host> Session<H> {
    /// The receiver answered: note its capabilities and start the batch,
    /// optionally announcing our attention string first.
    pub(crate) fn got_rinit(&mut self, header: &Header) -> Result<Control, Error> {
        self.peer = Zrinit::from_bits_truncate(header.flags()[3]);
        if self.peer.contains(Zrinit::ESCCTL) {
            self.escape_ctl = true;
        }
        log::debug!("receiver capabilities: {:?}", self.peer);
        if self.cfg.attn.is_some() && !self.sinit_sent {
            self.state = State::TInit;
            return self.send_sinit();
        }
        self.advance_file()
    }

    /// ZSINIT header plus the attention string as a wait-acked subpacket.
    pub(crate) fn send_sinit(&mut self) -> Result<Control, Error> {
        self.sinit_sent = true;
        let encoding = self.data_encoding();
        self.write_header(Header::new(encoding, Frame::ZSINIT))?;
        let mut payload: ArrayVec<[u8; 32]> = ArrayVec::new();
        if let Some(attn) = &self.cfg.attn {
            // The classic attention buffer is 32 bytes, terminator included.
            for b in attn.iter().take(31) {
                payload.push(*b);
            }
        }
        payload.push(0);
        frame::write_subpacket(&mut self.host, encoding, Packet::ZCRCW, &payload, self.escape_ctl)?;
        Ok(Control::Continue)
    }

    /// Opens the next file of the batch and announces it; ends the session
    /// with ZFIN when the batch is exhausted.
    pub(crate) fn advance_file(&mut self) -> Result<Control, Error> {
        while let Some(name) = self.pending.pop_front() {
            match self.host.file_open_read(&name) {
                Ok((file, size)) => {
                    self.file = Some(file);
                    self.file_name = name;
                    self.file_size = size;
                    self.count = 0;
                    self.acked = 0;
                    self.frame_open = false;
                    self.host.status(Event::FileBegin {
                        name: &self.file_name,
                        size,
                    });
                    return self.send_zfile();
                }
                Err(_) => {
                    log::warn!("cannot open {name:?}, skipping");
                    self.host.status(Event::Skip { name: &name });
                }
            }
        }
        self.send_hex(Frame::ZFIN, [0; 4])?;
        self.state = State::TFinish;
        Ok(Control::Continue)
    }

    /// ZFILE header plus the `name NUL size mtime mode serial files bytes
    /// NUL` metadata subpacket.
    pub(crate) fn send_zfile(&mut self) -> Result<Control, Error> {
        let encoding = self.data_encoding();
        self.write_header(Header::new(encoding, Frame::ZFILE))?;
        let mut itoa_buf = itoa::Buffer::new();
        let mut payload: ArrayVec<[u8; MAX_PACKET_LEN]> = ArrayVec::new();
        payload.extend_from_slice(self.file_name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(itoa_buf.format(self.file_size).as_bytes());
        // No mtime, mode or serial to report.
        payload.extend_from_slice(b" 0 0 0 ");
        payload.extend_from_slice(itoa_buf.format(self.pending.len() as u32 + 1).as_bytes());
        payload.push(b' ');
        payload.extend_from_slice(itoa_buf.format(self.file_size).as_bytes());
        payload.push(0);
        frame::write_subpacket(&mut self.host, encoding, Packet::ZCRCW, &payload, self.escape_ctl)?;
        self.state = State::FileWait;
        Ok(Control::Continue)
    }

    /// ZRPOS while announcing: the receiver wants data from here.
    pub(crate) fn start_data(&mut self, header: &Header) -> Result<Control, Error> {
        log::debug!("receiver asks for data from {}", header.count());
        self.rewind(header.count())
    }

    /// Reposition and restart the stream; queued output was already
    /// flushed by the transition.
    pub(crate) fn rewind(&mut self, offset: u32) -> Result<Control, Error> {
        if let Some(file) = self.file.as_mut() {
            if self.host.file_seek(file, offset).is_err() {
                return self.send_file_error();
            }
        }
        self.count = offset;
        self.acked = offset;
        self.frame_open = false;
        self.send_more_data()
    }

    pub(crate) fn got_ack(&mut self, header: &Header) -> Result<Control, Error> {
        let offset = header.count();
        if offset > self.acked {
            self.acked = offset;
        }
        self.send_more_data()
    }

    /// The receiver does not want this file.
    pub(crate) fn got_skip(&mut self) -> Result<Control, Error> {
        self.close_file();
        self.host.status(Event::Skip {
            name: &self.file_name,
        });
        self.advance_file()
    }

    /// ZCRC: answer with the CRC-32 of the requested prefix (count zero
    /// means the whole file).
    pub(crate) fn got_crc_req(&mut self, header: &Header) -> Result<Control, Error> {
        let len = if header.count() == 0 {
            self.file_size
        } else {
            header.count()
        };
        let crc = match self.file.as_mut() {
            Some(file) => match self.host.file_crc32(file, len) {
                Ok(crc) => crc,
                Err(_) => return self.send_file_error(),
            },
            None => 0,
        };
        self.send_hex_count(Frame::ZCRC, crc)?;
        self.state = State::CrcWait;
        Ok(Control::Continue)
    }

    /// Streams data subpackets until the window, the windowing policy or
    /// the file itself says stop.
    pub(crate) fn send_more_data(&mut self) -> Result<Control, Error> {
        if self.waitflag || self.file.is_none() {
            return Ok(Control::Continue);
        }
        let full_ack = self.cfg.windowing == Windowing::FullAck;
        let encoding = self.data_encoding();
        let plen = self.cfg.packet_len;
        let mut burst = 0;
        loop {
            if let Windowing::Streaming { window: Some(window) } = self.cfg.windowing {
                if self.count.saturating_sub(self.acked) >= window {
                    log::trace!("window full at {}", self.count);
                    return Ok(Control::Continue);
                }
            }
            self.txbuf.set_len(plen);
            let n = {
                let file = match self.file.as_mut() {
                    Some(file) => file,
                    None => return Ok(Control::Continue),
                };
                match self.host.file_read(file, &mut self.txbuf[..plen]) {
                    Ok(n) => n,
                    Err(_) => return self.send_file_error(),
                }
            };
            let at_eof = n < plen;
            if n == 0 {
                if self.frame_open {
                    // The burst left the frame open; close it empty.
                    frame::write_subpacket(
                        &mut self.host,
                        encoding,
                        Packet::ZCRCE,
                        &[],
                        self.escape_ctl,
                    )?;
                    self.frame_open = false;
                }
                return self.send_eof_now();
            }
            if !self.frame_open {
                self.write_header(Header::new(encoding, Frame::ZDATA).with_count(self.count))?;
                self.frame_open = true;
            }
            let kind = if full_ack {
                Packet::ZCRCW
            } else if at_eof {
                Packet::ZCRCE
            } else if burst + 1 >= SUBPACKET_PER_ACK {
                Packet::ZCRCQ
            } else {
                Packet::ZCRCG
            };
            frame::write_subpacket(&mut self.host, encoding, kind, &self.txbuf[..n], self.escape_ctl)?;
            self.count += n as u32;
            self.host.status(Event::FileProgress(self.count));
            match kind {
                Packet::ZCRCE => {
                    self.frame_open = false;
                    return self.send_eof_now();
                }
                Packet::ZCRCW => {
                    self.frame_open = false;
                    self.state = if at_eof {
                        State::SendDone
                    } else {
                        State::SendWait
                    };
                    return Ok(Control::Continue);
                }
                Packet::ZCRCQ => {
                    // Ack solicited; the ZACK (or a tick) resumes us.
                    return Ok(Control::Continue);
                }
                Packet::ZCRCG => burst += 1,
            }
        }
    }

    pub(crate) fn send_eof_now(&mut self) -> Result<Control, Error> {
        self.write_header(Header::new(self.data_encoding(), Frame::ZEOF).with_count(self.count))?;
        self.state = State::SendEof;
        Ok(Control::Continue)
    }

    pub(crate) fn resend_eof(&mut self) -> Result<Control, Error> {
        self.send_eof_now()
    }

    /// The receiver confirmed our ZEOF with a fresh ZRINIT.
    pub(crate) fn next_file(&mut self) -> Result<Control, Error> {
        self.close_file();
        self.host.status(Event::FileEnd {
            name: &self.file_name,
        });
        self.advance_file()
    }

    pub(crate) fn resend_rqinit(&mut self) -> Result<Control, Error> {
        self.send_hex(Frame::ZRQINIT, [0; 4])?;
        Ok(Control::Continue)
    }

    pub(crate) fn resend_fin(&mut self) -> Result<Control, Error> {
        self.send_hex(Frame::ZFIN, [0; 4])?;
        Ok(Control::Continue)
    }

    /// Local file trouble is terminal; warn the receiver on the way out.
    fn send_file_error(&mut self) -> Result<Control, Error> {
        let _ = self.send_hex(Frame::ZFERR, [0; 4]);
        self.close_file();
        Err(Error::SysFile)
    }

    /// Transmit-side timeout policy: while streaming, a tick is the cue to
    /// push more data; in every waiting state it means the receiver died.
    pub(crate) fn snd_timeout(&mut self) -> Result<Control, Error> {
        match self.state {
            State::Sending => self.send_more_data(),
            _ => {
                self.host.status(Event::RecvTimeout(self.timeout_count));
                Err(Error::RecvTimeout)
            }
        }
    }
}
