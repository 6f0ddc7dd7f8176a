// SPDX-License-Identifier: MIT OR Apache-2.0
//! YMODEM batch fallback, engaged when the far end turns out not to speak
//! ZMODEM: a receiver that opens with `C`/`G`/NAK, or a sender that stays
//! silent until our receiver gives up and solicits blocks itself.
//!
//! Blocks are SOH/STX, sequence byte and its complement, 128 or 1024
//! payload bytes and a CRC-16 (or arithmetic checksum) trailer. Block 0
//! carries the file name and size; an empty block 0 ends the batch.

use crate::consts::*;
use crate::host::{Event, FileOpen, Host};
use crate::proto::State;
use crate::recv::parse_file_meta;
use crate::session::{InputState, Protocol, Session};
use crate::{Control, Error};

const YMODEM_RETRY_LIMIT: u32 = 10;

impl<H: Host> Session<H> {
    /// Downshifts a receiving session: give up on ZMODEM headers and start
    /// soliciting YMODEM blocks.
    pub(crate) fn ymodem_rinit(&mut self) -> Result<Control, Error> {
        log::debug!("no ZMODEM sender, trying YMODEM");
        self.protocol = Protocol::Ymodem;
        self.input = InputState::Yrcv;
        self.state = State::YRStart;
        self.crc_mode = true;
        self.next_is_block0 = true;
        self.block_num = 0;
        self.timeout_count = 0;
        self.buffer.clear();
        self.host.xmit(&[self.ycrc_char()])?;
        Ok(Control::Continue)
    }

    fn ycrc_char(&self) -> u8 {
        if self.crc_mode {
            YMODEM_CRC
        } else {
            NAK
        }
    }

    fn ytrailer_len(&self) -> usize {
        if self.crc_mode {
            2
        } else {
            1
        }
    }

    /// Sender-side byte handling. The session lands here from `TStart`
    /// when the receiver's first byte is a YMODEM solicitation.
    pub(crate) fn ysend_char(&mut self, c: u8) -> Result<Control, Error> {
        match self.state {
            State::YTStart => match c {
                YMODEM_CRC | YMODEM_G | NAK => {
                    self.crc_mode = c != NAK;
                    self.streaming = c == YMODEM_G;
                    self.retries = 0;
                    self.ysend_block0()
                }
                _ => Ok(Control::Continue),
            },
            State::YTFile => match c {
                ACK => {
                    self.state = State::YTDataWait;
                    Ok(Control::Continue)
                }
                YMODEM_G if self.streaming => {
                    // YMODEM-G: the G doubles as the go-ahead; stream the
                    // whole file without per-block acks.
                    self.block_num = 0;
                    self.ystream_all()
                }
                NAK => self.yresend_block(),
                _ => Ok(Control::Continue),
            },
            State::YTDataWait => match c {
                YMODEM_CRC | YMODEM_G => {
                    self.block_num = 0;
                    if self.streaming {
                        self.ystream_all()
                    } else {
                        self.ysend_next_block()
                    }
                }
                NAK => self.yresend_block(),
                _ => Ok(Control::Continue),
            },
            State::YTData => match c {
                ACK => self.ysend_next_block(),
                NAK => self.yresend_block(),
                _ => Ok(Control::Continue),
            },
            State::YTEof => match c {
                // First EOT draws a NAK; answer it with the second EOT.
                NAK => {
                    self.host.xmit(&[EOT])?;
                    Ok(Control::Continue)
                }
                ACK => {
                    self.close_file();
                    self.host.status(Event::FileEnd {
                        name: &self.file_name,
                    });
                    self.state = State::YTStart;
                    Ok(Control::Continue)
                }
                _ => Ok(Control::Continue),
            },
            State::YTFin => match c {
                ACK => {
                    self.state = State::Done;
                    self.host.status(Event::Done);
                    Ok(Control::Done)
                }
                NAK => self.yresend_block(),
                _ => Ok(Control::Continue),
            },
            _ => Ok(Control::Continue),
        }
    }

    /// Announces the next file of the batch in block 0, or closes the
    /// batch with an empty block 0.
    fn ysend_block0(&mut self) -> Result<Control, Error> {
        while let Some(name) = self.pending.pop_front() {
            match self.host.file_open_read(&name) {
                Ok((file, size)) => {
                    self.file = Some(file);
                    self.file_name = name;
                    self.file_size = size;
                    self.count = 0;
                    self.host.status(Event::FileBegin {
                        name: &self.file_name,
                        size,
                    });
                    self.txbuf.clear();
                    self.txbuf.extend_from_slice(self.file_name.as_bytes());
                    self.txbuf.push(0);
                    let mut itoa_buf = itoa::Buffer::new();
                    self.txbuf
                        .extend_from_slice(itoa_buf.format(size).as_bytes());
                    self.txbuf.push(0);
                    let len = if self.txbuf.len() > 128 { 1024 } else { 128 };
                    while self.txbuf.len() < len {
                        self.txbuf.push(0);
                    }
                    self.block_num = 0;
                    self.ysend_block(0, len)?;
                    self.state = State::YTFile;
                    return Ok(Control::Continue);
                }
                Err(_) => {
                    log::warn!("cannot open {name:?}, skipping");
                    self.host.status(Event::Skip { name: &name });
                }
            }
        }
        // Empty block 0: end of batch.
        self.txbuf.clear();
        while self.txbuf.len() < 128 {
            self.txbuf.push(0);
        }
        self.ysend_block(0, 128)?;
        self.state = State::YTFin;
        Ok(Control::Continue)
    }

    /// Reads and transmits the next data block, padding the tail with the
    /// CP/M EOF byte; at end of file sends the first EOT instead.
    fn ysend_next_block(&mut self) -> Result<Control, Error> {
        self.retries = 0;
        self.txbuf.set_len(MAX_PACKET_LEN);
        let n = {
            let file = match self.file.as_mut() {
                Some(file) => file,
                None => return Ok(Control::Continue),
            };
            match self.host.file_read(file, &mut self.txbuf[..MAX_PACKET_LEN]) {
                Ok(n) => n,
                Err(_) => {
                    self.close_file();
                    return Err(Error::SysFile);
                }
            }
        };
        if n == 0 {
            self.host.xmit(&[EOT])?;
            self.state = State::YTEof;
            return Ok(Control::Continue);
        }
        let len = if n <= 128 { 128 } else { 1024 };
        self.txbuf.set_len(len);
        for b in &mut self.txbuf[n..] {
            *b = CPMEOF;
        }
        self.block_num = self.block_num.wrapping_add(1);
        self.count += n as u32;
        self.ysend_block(self.block_num, len)?;
        self.host.status(Event::FileProgress(self.count));
        self.state = State::YTData;
        Ok(Control::Continue)
    }

    /// Streams every remaining block plus the EOT in one go (YMODEM-G).
    fn ystream_all(&mut self) -> Result<Control, Error> {
        loop {
            self.ysend_next_block()?;
            if self.state != State::YTData {
                return Ok(Control::Continue);
            }
        }
    }

    /// Emits the block currently staged in `txbuf`.
    fn ysend_block(&mut self, seq: u8, len: usize) -> Result<(), Error> {
        self.txseq = seq;
        self.txlen = len;
        let start = if len == 128 { SOH } else { STX };
        self.host.xmit(&[start, seq, !seq])?;
        self.host.xmit(&self.txbuf[..len])?;
        if self.crc_mode {
            let crc = crate::crc::get_crc16(&self.txbuf[..len], None);
            self.host.xmit(&crc)?;
        } else {
            let sum = self.txbuf[..len]
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b));
            self.host.xmit(&[sum])?;
        }
        Ok(())
    }

    fn yresend_block(&mut self) -> Result<Control, Error> {
        self.retries += 1;
        if self.retries > YMODEM_RETRY_LIMIT {
            self.host.status(Event::RecvTimeout(self.retries));
            return Err(Error::RecvTimeout);
        }
        self.ysend_block(self.txseq, self.txlen)?;
        Ok(Control::Continue)
    }

    /// Receiver-side byte handling.
    pub(crate) fn yrcv_char(&mut self, c: u8) -> Result<Control, Error> {
        match self.state {
            State::YRStart | State::YRDataWait => match c {
                SOH => self.ybegin_packet(128),
                STX => self.ybegin_packet(1024),
                EOT if self.state == State::YRDataWait => {
                    // First EOT is NAKed to make the sender prove it.
                    self.host.xmit(&[NAK])?;
                    self.state = State::YREof;
                    Ok(Control::Continue)
                }
                _ => Ok(Control::Continue),
            },
            State::YRData => {
                self.buffer.push(c);
                if self.buffer.len() == 2 + self.pkt_len + self.ytrailer_len() {
                    return self.yend_packet();
                }
                Ok(Control::Continue)
            }
            State::YREof => match c {
                EOT => {
                    self.host.xmit(&[ACK])?;
                    self.close_file();
                    self.host.status(Event::FileEnd {
                        name: &self.file_name,
                    });
                    self.next_is_block0 = true;
                    self.block_num = 0;
                    self.state = State::YRStart;
                    self.host.xmit(&[self.ycrc_char()])?;
                    Ok(Control::Continue)
                }
                SOH => self.ybegin_packet(128),
                STX => self.ybegin_packet(1024),
                _ => Ok(Control::Continue),
            },
            _ => Ok(Control::Continue),
        }
    }

    fn ybegin_packet(&mut self, len: usize) -> Result<Control, Error> {
        self.pkt_len = len;
        self.buffer.clear();
        self.state = State::YRData;
        Ok(Control::Continue)
    }

    fn ywait_state(&self) -> State {
        if self.next_is_block0 {
            State::YRStart
        } else {
            State::YRDataWait
        }
    }

    /// A whole block is buffered: validate and act on it.
    fn yend_packet(&mut self) -> Result<Control, Error> {
        self.state = self.ywait_state();
        let seq = self.buffer[0];
        let complement = self.buffer[1];
        let data_end = 2 + self.pkt_len;
        let good = complement == !seq
            && if self.crc_mode {
                crate::crc::check_crc16(&self.buffer[2..data_end], None, &self.buffer[data_end..])
            } else {
                let sum = self.buffer[2..data_end]
                    .iter()
                    .fold(0u8, |acc, b| acc.wrapping_add(*b));
                self.buffer[data_end] == sum
            };
        if !good {
            log::debug!("bad YMODEM block {seq}");
            self.retries += 1;
            if self.retries > YMODEM_RETRY_LIMIT {
                self.host.status(Event::SendTimeout(self.retries));
                return Err(Error::RecvTimeout);
            }
            self.host.xmit(&[NAK])?;
            return Ok(Control::Continue);
        }
        self.retries = 0;

        if self.next_is_block0 {
            if seq != 0 {
                self.host.xmit(&[NAK])?;
                return Ok(Control::Continue);
            }
            if self.buffer[2] == 0 {
                // Empty block 0: the batch is over.
                self.host.xmit(&[ACK])?;
                self.state = State::Done;
                self.host.status(Event::Done);
                return Ok(Control::Done);
            }
            let meta = match parse_file_meta(&self.buffer[2..data_end]) {
                Some(meta) => meta,
                None => {
                    self.host.xmit(&[NAK])?;
                    return Ok(Control::Continue);
                }
            };
            self.file_name = meta.name;
            self.file_size = meta.size;
            self.remaining = if meta.size == 0 { u32::MAX } else { meta.size };
            self.count = 0;
            match self.host.file_open_write(&self.file_name, self.file_size) {
                Ok(FileOpen::Accept { file, .. }) => {
                    self.file = Some(file);
                    // YMODEM knows no resume; write from the top.
                    if let Some(file) = self.file.as_mut() {
                        if self.host.file_seek(file, 0).is_err() {
                            self.close_file();
                            return Err(Error::SysFile);
                        }
                    }
                    self.host.status(Event::FileBegin {
                        name: &self.file_name,
                        size: self.file_size,
                    });
                }
                _ => {
                    // No way to skip inside a YMODEM batch; swallow the
                    // stream and drop the bytes.
                    self.host.status(Event::Skip {
                        name: &self.file_name,
                    });
                }
            }
            self.next_is_block0 = false;
            self.block_num = 1;
            self.host.xmit(&[ACK])?;
            self.host.xmit(&[self.ycrc_char()])?;
            return Ok(Control::Continue);
        }

        if seq == self.block_num {
            let take = (self.pkt_len).min(self.remaining as usize);
            if let Some(file) = self.file.as_mut() {
                if self
                    .host
                    .file_write(file, &self.buffer[2..2 + take])
                    .is_err()
                {
                    self.close_file();
                    return Err(Error::SysFile);
                }
            }
            self.count += take as u32;
            self.remaining = self.remaining.saturating_sub(take as u32);
            self.host.status(Event::FileProgress(self.count));
            self.block_num = self.block_num.wrapping_add(1);
            self.host.xmit(&[ACK])?;
        } else if seq == self.block_num.wrapping_sub(1) {
            // Duplicate of the block we already have; our ACK got lost.
            self.host.xmit(&[ACK])?;
        } else {
            log::warn!("block {seq} out of order, expected {}", self.block_num);
            self.host.status(Event::ProtocolErr(seq));
            self.host.xmit(&[NAK])?;
        }
        Ok(Control::Continue)
    }

    /// Receiver timeouts: re-solicit, falling back from CRC to checksum
    /// mode if nobody answers the `C`s.
    pub(crate) fn yrcv_timeout(&mut self) -> Result<Control, Error> {
        if self.timeout_count > YMODEM_RETRY_LIMIT {
            self.host.status(Event::SendTimeout(self.timeout_count));
            return Err(Error::RecvTimeout);
        }
        match self.state {
            State::YRStart => {
                if self.timeout_count > 3 {
                    self.crc_mode = false;
                }
                self.host.xmit(&[self.ycrc_char()])?;
            }
            State::YRDataWait | State::YRData => {
                self.buffer.clear();
                self.state = self.ywait_state();
                self.host.xmit(&[NAK])?;
            }
            State::YREof => {
                self.host.xmit(&[NAK])?;
            }
            _ => {}
        }
        Ok(Control::Continue)
    }
}
