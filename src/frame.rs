// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZMODEM transfer protocol frame

use crate::consts::*;
use crate::crc;
use crate::escape;
use crate::host::{Host, HostError};
use bitflags::bitflags;
use core::convert::TryFrom;
use std::fmt::{self, Display};
use tinyvec::{array_vec, ArrayVec};

#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq)]
/// Frame encodings
pub enum Encoding {
    ZBIN = 0x41,
    ZHEX = 0x42,
    ZBIN32 = 0x43,
}

const ENCODINGS: &[Encoding] = &[Encoding::ZBIN, Encoding::ZHEX, Encoding::ZBIN32];

impl Encoding {
    /// Trailing CRC bytes of a frame in this encoding.
    pub const fn crc_len(self) -> usize {
        match self {
            Encoding::ZBIN32 => 4,
            _ => 2,
        }
    }
}

impl TryFrom<u8> for Encoding {
    type Error = crate::InvalidData;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ENCODINGS
            .iter()
            .find(|e| value == **e as u8)
            .map_or(Err(crate::InvalidData), |e| Ok(*e))
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq)]
/// Frame types
pub enum Frame {
    /// Request receive init
    ZRQINIT = 0,
    /// Receiver capabilities and packet size
    ZRINIT = 1,
    /// Send init sequence (optional)
    ZSINIT = 2,
    /// ACK to above
    ZACK = 3,
    /// File name from sender
    ZFILE = 4,
    /// To sender: skip this file
    ZSKIP = 5,
    /// Last packet was garbled
    ZNAK = 6,
    /// Abort batch transfers
    ZABORT = 7,
    /// Finish session
    ZFIN = 8,
    /// Resume data trans at this position
    ZRPOS = 9,
    /// Data packet(s) follow
    ZDATA = 10,
    /// End of file
    ZEOF = 11,
    /// Fatal Read or Write error Detected
    ZFERR = 12,
    /// Request for file CRC and response
    ZCRC = 13,
    /// Receiver's Challenge
    ZCHALLENGE = 14,
    /// Request is complete
    ZCOMPL = 15,
    /// Other end canned session with CAN*5
    ZCAN = 16,
    /// Request for free bytes on filesystem
    ZFREECNT = 17,
    /// Command from sending program
    ZCOMMAND = 18,
    ///  Output to standard error, data follows
    ZSTDERR = 19,
}

const FRAMES: &[Frame] = &[
    Frame::ZRQINIT,
    Frame::ZRINIT,
    Frame::ZSINIT,
    Frame::ZACK,
    Frame::ZFILE,
    Frame::ZSKIP,
    Frame::ZNAK,
    Frame::ZABORT,
    Frame::ZFIN,
    Frame::ZRPOS,
    Frame::ZDATA,
    Frame::ZEOF,
    Frame::ZFERR,
    Frame::ZCRC,
    Frame::ZCHALLENGE,
    Frame::ZCOMPL,
    Frame::ZCAN,
    Frame::ZFREECNT,
    Frame::ZCOMMAND,
    Frame::ZSTDERR,
];

impl TryFrom<u8> for Frame {
    type Error = crate::InvalidData;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        FRAMES
            .iter()
            .find(|t| value == **t as u8)
            .map_or(Err(crate::InvalidData), |t| Ok(*t))
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq)]
/// The ZMODEM subpacket terminator
pub enum Packet {
    ZCRCE = 0x68,
    ZCRCG = 0x69,
    ZCRCQ = 0x6a,
    ZCRCW = 0x6b,
}

const PACKETS: &[Packet] = &[Packet::ZCRCE, Packet::ZCRCG, Packet::ZCRCQ, Packet::ZCRCW];

impl TryFrom<u8> for Packet {
    type Error = crate::InvalidData;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PACKETS
            .iter()
            .find(|e| value == **e as u8)
            .map_or(Err(crate::InvalidData), |e| Ok(*e))
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

bitflags! {
   /// `ZRINIT` flags
   #[derive(Clone, Copy, Debug, PartialEq)]
   pub struct Zrinit: u8 {
        /// Can send and receive in full-duplex
        const CANFDX = 0x01;
        /// Can receive data in parallel with disk I/O
        const CANOVIO = 0x02;
        /// Can send a break signal
        const CANBRK = 0x04;
        /// Can decrypt
        const CANCRY = 0x08;
        /// Can uncompress
        const CANLZW = 0x10;
        /// Can use 32-bit frame check
        const CANFC32 = 0x20;
        /// Expects control character to be escaped
        const ESCCTL = 0x40;
        /// Expects 8th bit to be escaped
        const ESC8 = 0x80;
    }
}

/// Why a collected header failed to decode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum HeaderError {
    /// The CRC trailer did not match.
    Crc,
    /// CRC was fine but the type byte is not a known frame.
    Kind(u8),
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    encoding: Encoding,
    kind: Frame,
    flags: [u8; 4],
}

impl Header {
    pub const fn new(encoding: Encoding, kind: Frame) -> Self {
        Self {
            encoding,
            kind,
            flags: [0; 4],
        }
    }

    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub const fn kind(&self) -> Frame {
        self.kind
    }

    /// Position (or other little-endian count) carried in the data bytes.
    pub const fn count(&self) -> u32 {
        u32::from_le_bytes(self.flags)
    }

    pub const fn flags(&self) -> &[u8; 4] {
        &self.flags
    }

    pub const fn with_count(&self, count: u32) -> Self {
        Header {
            encoding: self.encoding,
            kind: self.kind,
            flags: count.to_le_bytes(),
        }
    }

    pub const fn with_flags(&self, flags: &[u8; 4]) -> Self {
        Header {
            encoding: self.encoding,
            kind: self.kind,
            flags: *flags,
        }
    }

    /// Serializes the header into its wire form and hands it to the host
    /// transport in one piece.
    pub(crate) fn write<H: Host>(&self, host: &mut H, escape_ctl: bool) -> Result<(), HostError> {
        let mut out = array_vec!([u8; 32]);
        out.push(ZPAD);
        if self.encoding == Encoding::ZHEX {
            out.push(ZPAD);
        }
        out.push(ZDLE);
        out.push(self.encoding as u8);

        let mut payload = array_vec!([u8; HEADER_SIZE]);
        payload.push(self.kind as u8);
        payload.extend_from_slice(&self.flags);
        match self.encoding {
            Encoding::ZBIN32 => {
                payload.extend_from_slice(&crc::get_crc32(&payload, None));
            }
            _ => {
                payload.extend_from_slice(&crc::get_crc16(&payload, None));
            }
        }

        if self.encoding == Encoding::ZHEX {
            let mut hex = [0u8; HEADER_SIZE];
            let hex = &mut hex[..payload.len() * 2];
            // 7 payload bytes always fit; encode_to_slice cannot fail here.
            hex::encode_to_slice(payload.as_slice(), hex).or(Err(HostError))?;
            out.extend_from_slice(hex);
            // Trailing CRLF for ZHEX transfer:
            out.extend_from_slice(b"\r\n");
            if self.kind != Frame::ZACK && self.kind != Frame::ZFIN {
                out.push(XON);
            }
        } else {
            let mut escaped = [0u8; HEADER_SIZE * 2];
            let n = escape::escape_mem(&payload, &mut escaped, escape_ctl);
            out.extend_from_slice(&escaped[..n]);
        }
        host.xmit(&out)
    }

    /// Decodes a header from the payload bytes the lexer collected: the
    /// type byte, four data bytes and the CRC trailer, already de-escaped
    /// and hex-decoded.
    pub(crate) fn decode(encoding: Encoding, raw: &[u8]) -> Result<Header, HeaderError> {
        let good = match encoding {
            Encoding::ZBIN32 => crc::check_crc32(&raw[..5], None, &raw[5..]),
            _ => crc::check_crc16(&raw[..5], None, &raw[5..]),
        };
        if !good {
            return Err(HeaderError::Crc);
        }
        let kind = Frame::try_from(raw[0]).or(Err(HeaderError::Kind(raw[0])))?;
        let mut header = Header::new(encoding, kind);
        header.flags.copy_from_slice(&raw[1..=4]);
        Ok(header)
    }

    /// Payload bytes the lexer must collect for this framing, CRC included.
    pub(crate) const fn collected_size(encoding: Encoding) -> usize {
        match encoding {
            Encoding::ZBIN => 7,
            Encoding::ZBIN32 => 9,
            // Hex headers collect nibble pairs into the same 7 bytes.
            Encoding::ZHEX => 7,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:8} {}", self.encoding, self.kind)
    }
}

/// Escapes and transmits one data subpacket: payload, ZDLE-marked
/// terminator, CRC trailer covering both.
pub(crate) fn write_subpacket<H: Host>(
    host: &mut H,
    encoding: Encoding,
    kind: Packet,
    data: &[u8],
    escape_ctl: bool,
) -> Result<(), HostError> {
    let kind = kind as u8;
    let mut buf = [0u8; MAX_PACKET_LEN * 2];
    let n = escape::escape_mem(data, &mut buf, escape_ctl);
    host.xmit(&buf[..n])?;
    host.xmit(&[ZDLE, kind])?;
    let crc: ArrayVec<[u8; 4]> = match encoding {
        Encoding::ZBIN32 => crc::get_crc32(data, Some(kind)).into_iter().collect(),
        _ => crc::get_crc16(data, Some(kind)).into_iter().collect(),
    };
    let mut escaped = [0u8; 8];
    let n = escape::escape_mem(&crc, &mut escaped, escape_ctl);
    host.xmit(&escaped[..n])
}
