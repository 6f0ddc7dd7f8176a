// SPDX-License-Identifier: MIT OR Apache-2.0
//! Protocol constants

/// Padding byte preceding the ZDLE of every header.
pub const ZPAD: u8 = b'*';
/// The escape byte. Also the cancel byte; five in a row end the session.
pub const ZDLE: u8 = 0x18;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const CAN: u8 = 0x18;

/// Escaped forms of 0x7f and 0xff.
pub const ZRUB0: u8 = 0x6c;
pub const ZRUB1: u8 = 0x6d;

// XMODEM/YMODEM framing bytes.
pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
/// CRC mode request from a YMODEM receiver.
pub const YMODEM_CRC: u8 = b'C';
/// Streaming (YMODEM-G) request from a YMODEM receiver.
pub const YMODEM_G: u8 = b'G';
/// CP/M end-of-file byte, pads the tail of the last YMODEM block.
pub const CPMEOF: u8 = 0x1a;

/// Largest subpacket payload, per the original 1988 ZMODEM specification.
pub const MAX_PACKET_LEN: usize = 1024;
/// Subpackets streamed between ZCRCQ ack requests.
pub const SUBPACKET_PER_ACK: usize = 10;
/// Idle garbage tolerated by a sending session before it pauses output.
pub const MAX_NOISE: u32 = 64;
/// EPERM, answered to ZCOMMAND requests.
pub const EPERM: u8 = 1;

/// Staging buffer for an unescaped header (hex digits included).
pub const HEADER_SIZE: usize = 16;
/// Staging buffer for inbound frames; a YMODEM packet with its sequence and
/// CRC trailer is the largest thing parked here.
pub const BUFFER_SIZE: usize = 2048;
