// SPDX-License-Identifier: MIT OR Apache-2.0
//! Protocol state machine: per-state transition tables and header dispatch.
//!
//! Tables are scanned linearly and are ordered by approximate frequency;
//! the final entry of every table is the catch-all "protocol failure"
//! fallback, which logs the stray header and stays in the current state.

use crate::consts::EPERM;
use crate::frame::{Frame, Header};
use crate::host::{Event, Host};
use crate::session::Session;
use crate::{Control, Error};

/// Protocol states. `R*` receive, `T*`/`Send*` transmit, `Y*` the YMODEM
/// mirrors of both roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for the sender to open the session.
    RStart,
    /// ZSINIT seen, its data subpacket pending.
    RSinitWait,
    /// ZFILE seen, the name/attributes subpacket pending.
    RFileName,
    /// ZCRC sent to verify a resume offset, answer pending.
    RCrc,
    /// ZRPOS sent, ZDATA pending.
    RFile,
    /// Streaming file data.
    RData,
    /// Data stream broken, waiting for the sender to reposition.
    RDataErr,
    /// ZFIN exchanged, session trailer pending.
    RFinish,

    /// Waiting for the receiver's ZRINIT.
    TStart,
    /// ZSINIT sent, ZACK pending.
    TInit,
    /// ZFILE sent, waiting for ZRPOS or ZSKIP.
    FileWait,
    /// ZCRC answer sent, waiting for the receiver's verdict.
    CrcWait,
    /// Streaming data subpackets.
    Sending,
    /// ZCRCW sent, ZACK pending before more data.
    SendWait,
    /// Final ZCRCW sent, ZACK pending before ZEOF.
    SendDone,
    /// ZEOF sent, waiting for ZRINIT (next file) or complaint.
    SendEof,
    /// ZFIN sent, waiting for the echo.
    TFinish,

    /// Remote command data pending (commands are refused).
    CommandData,
    /// Remote command executing (never entered; commands are refused).
    CommandWait,
    /// ZSTDERR text pending.
    StderrData,
    Done,

    YTStart,
    YTFile,
    YTDataWait,
    YTData,
    YTEof,
    YTFin,
    YRStart,
    YRDataWait,
    YRData,
    YREof,
}

/// Action tags, dispatched by `Session::run_action`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Action {
    Ignore,
    Zpf,
    GotCancel,
    GotAbort,
    AnswerChallenge,
    GotCommand,
    GotStderr,
    GotFreecnt,

    SendRinit,
    GotFile,
    GotSinit,
    GotFin,
    GotData,
    GotEof,
    GotFileCrc,
    ResendCrcReq,
    ResendRpos,

    GotRinit,
    SinitAck,
    ResendSinit,
    ResendRqinit,
    ResendZfile,
    StartData,
    Rewind,
    RewindAcked,
    GotAck,
    GotSkip,
    GotCrcReq,
    SendEofNow,
    NextFile,
    ResendEof,
    ResendFin,
    OverAndOut,
}

pub(crate) struct Transition {
    /// `None` marks the table's fallback entry.
    frame: Option<Frame>,
    action: Action,
    iflush: bool,
    oflush: bool,
    next: State,
}

const fn t(frame: Frame, action: Action, next: State) -> Transition {
    Transition {
        frame: Some(frame),
        action,
        iflush: false,
        oflush: false,
        next,
    }
}

const fn tf(frame: Frame, action: Action, iflush: bool, oflush: bool, next: State) -> Transition {
    Transition {
        frame: Some(frame),
        action,
        iflush,
        oflush,
        next,
    }
}

/// Fallback: report a protocol failure and stay put.
const fn zpf() -> Transition {
    Transition {
        frame: None,
        action: Action::Zpf,
        iflush: false,
        oflush: false,
        next: State::Done, // unused; fallback never changes state
    }
}

static R_START_OPS: &[Transition] = &[
    t(Frame::ZFILE, Action::GotFile, State::RFileName),
    t(Frame::ZRQINIT, Action::SendRinit, State::RStart),
    t(Frame::ZSINIT, Action::GotSinit, State::RSinitWait),
    t(Frame::ZFIN, Action::GotFin, State::RFinish),
    t(Frame::ZNAK, Action::SendRinit, State::RStart),
    t(Frame::ZEOF, Action::SendRinit, State::RStart),
    t(Frame::ZDATA, Action::Ignore, State::RStart),
    t(Frame::ZFREECNT, Action::GotFreecnt, State::RStart),
    t(Frame::ZCOMMAND, Action::GotCommand, State::CommandData),
    t(Frame::ZSTDERR, Action::GotStderr, State::StderrData),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static R_SINIT_WAIT_OPS: &[Transition] = &[
    t(Frame::ZSINIT, Action::GotSinit, State::RSinitWait),
    t(Frame::ZRQINIT, Action::SendRinit, State::RStart),
    t(Frame::ZNAK, Action::SendRinit, State::RStart),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static R_FILE_NAME_OPS: &[Transition] = &[
    t(Frame::ZFILE, Action::GotFile, State::RFileName),
    t(Frame::ZRQINIT, Action::SendRinit, State::RStart),
    t(Frame::ZFIN, Action::GotFin, State::RFinish),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static R_CRC_OPS: &[Transition] = &[
    t(Frame::ZCRC, Action::GotFileCrc, State::RCrc),
    t(Frame::ZNAK, Action::ResendCrcReq, State::RCrc),
    t(Frame::ZFILE, Action::Ignore, State::RCrc),
    t(Frame::ZRQINIT, Action::SendRinit, State::RStart),
    t(Frame::ZFIN, Action::GotFin, State::RFinish),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static R_FILE_OPS: &[Transition] = &[
    t(Frame::ZDATA, Action::GotData, State::RData),
    t(Frame::ZEOF, Action::GotEof, State::RStart),
    t(Frame::ZFILE, Action::ResendRpos, State::RFile),
    t(Frame::ZNAK, Action::ResendRpos, State::RFile),
    t(Frame::ZRQINIT, Action::SendRinit, State::RStart),
    t(Frame::ZFIN, Action::GotFin, State::RFinish),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

/// Shared by `RData` and `RDataErr`.
static R_DATA_OPS: &[Transition] = &[
    t(Frame::ZDATA, Action::GotData, State::RData),
    t(Frame::ZEOF, Action::GotEof, State::RStart),
    t(Frame::ZNAK, Action::ResendRpos, State::RFile),
    t(Frame::ZFILE, Action::ResendRpos, State::RFile),
    t(Frame::ZRQINIT, Action::SendRinit, State::RStart),
    t(Frame::ZFIN, Action::GotFin, State::RFinish),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static R_FINISH_OPS: &[Transition] = &[
    t(Frame::ZFIN, Action::GotFin, State::RFinish),
    t(Frame::ZNAK, Action::GotFin, State::RFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static T_START_OPS: &[Transition] = &[
    t(Frame::ZRINIT, Action::GotRinit, State::FileWait),
    t(Frame::ZCHALLENGE, Action::AnswerChallenge, State::TStart),
    t(Frame::ZNAK, Action::ResendRqinit, State::TStart),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static T_INIT_OPS: &[Transition] = &[
    t(Frame::ZACK, Action::SinitAck, State::FileWait),
    t(Frame::ZNAK, Action::ResendSinit, State::TInit),
    t(Frame::ZRINIT, Action::ResendSinit, State::TInit),
    t(Frame::ZCHALLENGE, Action::AnswerChallenge, State::TInit),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static FILE_WAIT_OPS: &[Transition] = &[
    t(Frame::ZRPOS, Action::StartData, State::Sending),
    t(Frame::ZSKIP, Action::GotSkip, State::FileWait),
    t(Frame::ZCRC, Action::GotCrcReq, State::CrcWait),
    t(Frame::ZRINIT, Action::ResendZfile, State::FileWait),
    t(Frame::ZNAK, Action::ResendZfile, State::FileWait),
    t(Frame::ZACK, Action::Ignore, State::FileWait),
    t(Frame::ZCHALLENGE, Action::AnswerChallenge, State::FileWait),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static CRC_WAIT_OPS: &[Transition] = &[
    t(Frame::ZRPOS, Action::StartData, State::Sending),
    t(Frame::ZSKIP, Action::GotSkip, State::CrcWait),
    t(Frame::ZCRC, Action::GotCrcReq, State::CrcWait),
    t(Frame::ZNAK, Action::GotCrcReq, State::CrcWait),
    t(Frame::ZRINIT, Action::ResendZfile, State::FileWait),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static SENDING_OPS: &[Transition] = &[
    tf(Frame::ZRPOS, Action::Rewind, false, true, State::Sending),
    t(Frame::ZACK, Action::GotAck, State::Sending),
    tf(Frame::ZSKIP, Action::GotSkip, false, true, State::Sending),
    tf(Frame::ZNAK, Action::RewindAcked, false, true, State::Sending),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static SEND_WAIT_OPS: &[Transition] = &[
    t(Frame::ZACK, Action::GotAck, State::Sending),
    tf(Frame::ZRPOS, Action::Rewind, false, true, State::Sending),
    t(Frame::ZSKIP, Action::GotSkip, State::SendWait),
    tf(Frame::ZNAK, Action::RewindAcked, false, true, State::Sending),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static SEND_DONE_OPS: &[Transition] = &[
    t(Frame::ZACK, Action::SendEofNow, State::SendEof),
    tf(Frame::ZRPOS, Action::Rewind, false, true, State::Sending),
    t(Frame::ZSKIP, Action::GotSkip, State::SendDone),
    tf(Frame::ZNAK, Action::RewindAcked, false, true, State::Sending),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static SEND_EOF_OPS: &[Transition] = &[
    t(Frame::ZRINIT, Action::NextFile, State::FileWait),
    t(Frame::ZACK, Action::Ignore, State::SendEof),
    tf(Frame::ZRPOS, Action::Rewind, false, true, State::Sending),
    t(Frame::ZNAK, Action::ResendEof, State::SendEof),
    t(Frame::ZSKIP, Action::GotSkip, State::SendEof),
    tf(Frame::ZABORT, Action::GotAbort, false, true, State::TFinish),
    tf(Frame::ZFERR, Action::GotAbort, false, true, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

static T_FINISH_OPS: &[Transition] = &[
    t(Frame::ZFIN, Action::OverAndOut, State::Done),
    t(Frame::ZNAK, Action::ResendFin, State::TFinish),
    t(Frame::ZRINIT, Action::ResendFin, State::TFinish),
    t(Frame::ZCAN, Action::GotCancel, State::Done),
    zpf(),
];

// Command and stderr modes never had live entries; every header lands on
// the fallback until the timer gives up. Commands are refused up front, so
// nothing is lost, but this is where real entries would go.
static COMMAND_DATA_OPS: &[Transition] = &[zpf()];
static COMMAND_WAIT_OPS: &[Transition] = &[zpf()];
static STDERR_DATA_OPS: &[Transition] = &[zpf()];
static DONE_OPS: &[Transition] = &[zpf()];

fn table_for(state: State) -> &'static [Transition] {
    match state {
        State::RStart => R_START_OPS,
        State::RSinitWait => R_SINIT_WAIT_OPS,
        State::RFileName => R_FILE_NAME_OPS,
        State::RCrc => R_CRC_OPS,
        State::RFile => R_FILE_OPS,
        State::RData | State::RDataErr => R_DATA_OPS,
        State::RFinish => R_FINISH_OPS,
        State::TStart => T_START_OPS,
        State::TInit => T_INIT_OPS,
        State::FileWait => FILE_WAIT_OPS,
        State::CrcWait => CRC_WAIT_OPS,
        State::Sending => SENDING_OPS,
        State::SendWait => SEND_WAIT_OPS,
        State::SendDone => SEND_DONE_OPS,
        State::SendEof => SEND_EOF_OPS,
        State::TFinish => T_FINISH_OPS,
        State::CommandData => COMMAND_DATA_OPS,
        State::CommandWait => COMMAND_WAIT_OPS,
        State::StderrData => STDERR_DATA_OPS,
        // Headers cannot reach the YMODEM states; the lexer forwards their
        // bytes before header parsing. Treat like Done if they ever do.
        State::Done
        | State::YTStart
        | State::YTFile
        | State::YTDataWait
        | State::YTData
        | State::YTEof
        | State::YTFin
        | State::YRStart
        | State::YRDataWait
        | State::YRData
        | State::YREof => DONE_OPS,
    }
}

impl<H: Host> Session<H> {
    /// Called by the lexer for every CRC-good header.
    pub(crate) fn dispatch_header(&mut self, header: Header) -> Result<Control, Error> {
        log::debug!(
            "dispatch {:?} flags {:02x?} in {:?}",
            header.kind(),
            header.flags(),
            self.state
        );
        self.timeout_count = 0;
        self.noise_count = 0;
        // A parseable header means the line is alive again.
        self.waitflag = false;

        let table = table_for(self.state);
        let entry = match table
            .iter()
            .find(|e| e.frame.map_or(true, |f| f == header.kind()))
        {
            Some(entry) => entry,
            None => return self.protocol_failure(header.kind() as u8),
        };
        if entry.frame.is_some() {
            self.state = entry.next;
        }
        if entry.iflush {
            self.flush_input();
        }
        if entry.oflush {
            self.host.oflush();
        }
        self.run_action(entry.action, header)
    }

    fn run_action(&mut self, action: Action, header: Header) -> Result<Control, Error> {
        match action {
            Action::Ignore => Ok(Control::Continue),
            Action::Zpf => self.protocol_failure(header.kind() as u8),
            Action::GotCancel => self.got_cancel(),
            Action::GotAbort => self.got_abort(),
            Action::AnswerChallenge => self.answer_challenge(&header),
            Action::GotCommand => self.got_command(),
            Action::GotStderr => self.got_stderr(),
            Action::GotFreecnt => self.got_freecnt(),

            Action::SendRinit => self.send_rinit_action(),
            Action::GotFile => self.got_file(&header),
            Action::GotSinit => self.got_sinit(),
            Action::GotFin => self.got_fin(),
            Action::GotData => self.got_data(&header),
            Action::GotEof => self.got_eof(&header),
            Action::GotFileCrc => self.got_file_crc(&header),
            Action::ResendCrcReq => self.resend_crc_req(),
            Action::ResendRpos => self.resend_rpos(),

            Action::GotRinit => self.got_rinit(&header),
            Action::SinitAck => self.advance_file(),
            Action::ResendSinit => self.send_sinit(),
            Action::ResendRqinit => self.resend_rqinit(),
            Action::ResendZfile => self.send_zfile(),
            Action::StartData => self.start_data(&header),
            Action::Rewind => self.rewind(header.count()),
            Action::RewindAcked => self.rewind(self.acked),
            Action::GotAck => self.got_ack(&header),
            Action::GotSkip => self.got_skip(),
            Action::GotCrcReq => self.got_crc_req(&header),
            Action::SendEofNow => self.send_eof_now(),
            Action::NextFile => self.next_file(),
            Action::ResendEof => self.resend_eof(),
            Action::ResendFin => self.resend_fin(),
            Action::OverAndOut => self.over_and_out(),
        }
    }

    /// Called by the lexer when a complete data subpacket is in the buffer.
    pub(crate) fn data_received(&mut self, crc_good: bool) -> Result<Control, Error> {
        log::debug!(
            "subpacket {:?} len {} crc_good {} in {:?}",
            self.packet_type,
            self.buffer.len(),
            crc_good,
            self.state
        );
        match self.state {
            State::RSinitWait => self.got_sinit_data(crc_good),
            State::RFileName => self.got_file_name(crc_good),
            State::RData | State::RDataErr => self.got_file_data(crc_good),
            State::CommandData => self.got_command_data(crc_good),
            State::StderrData => self.got_stderr_data(crc_good),
            _ => self.protocol_failure(self.packet_type as u8),
        }
    }

    /// An unexpected header arrived. Could be old pipelined data finally
    /// showing up, or a line with echo enabled. Report it, pause any
    /// in-progress transmission, and carry on.
    pub(crate) fn protocol_failure(&mut self, kind: u8) -> Result<Control, Error> {
        self.waitflag = true;
        log::warn!("protocol failure: header {kind:#04x} in {:?}", self.state);
        self.host.status(Event::ProtocolErr(kind));
        Ok(Control::Continue)
    }

    fn got_cancel(&mut self) -> Result<Control, Error> {
        self.close_file();
        Err(Error::Cancel)
    }

    fn got_abort(&mut self) -> Result<Control, Error> {
        self.close_file();
        self.host.status(Event::RemoteCancel);
        self.send_hex(Frame::ZFIN, [0; 4])?;
        Ok(Control::Continue)
    }

    /// Echo the challenge bytes back in a ZACK.
    fn answer_challenge(&mut self, header: &Header) -> Result<Control, Error> {
        self.send_hex(Frame::ZACK, *header.flags())?;
        Ok(Control::Continue)
    }

    /// Remote command execution is refused outright: permission denied.
    fn got_command(&mut self) -> Result<Control, Error> {
        self.send_hex(Frame::ZCOMPL, [EPERM, 0, 0, 0])?;
        Ok(Control::Continue)
    }

    fn got_command_data(&mut self, crc_good: bool) -> Result<Control, Error> {
        log::debug!("discarding command data, crc_good {crc_good}");
        Ok(Control::Continue)
    }

    fn got_stderr(&mut self) -> Result<Control, Error> {
        self.data_setup();
        Ok(Control::Continue)
    }

    fn got_stderr_data(&mut self, crc_good: bool) -> Result<Control, Error> {
        if crc_good {
            self.host.status(Event::RemoteMessage(&self.buffer));
        }
        Ok(Control::Continue)
    }

    /// We report no quota; zero means "as much as you like".
    fn got_freecnt(&mut self) -> Result<Control, Error> {
        self.send_hex_count(Frame::ZACK, 0)?;
        Ok(Control::Continue)
    }

    fn over_and_out(&mut self) -> Result<Control, Error> {
        self.host.xmit(b"OO")?;
        self.state = State::Done;
        self.host.status(Event::Done);
        Ok(Control::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{ZDLE, EPERM};
    use crate::frame::{Encoding, Packet, Zrinit};
    use crate::host::tests::MockHost;
    use crate::host::{Config, Windowing};
    use crate::session::Session;

    fn wire_header(header: &Header) -> Vec<u8> {
        let mut host = MockHost::new();
        header.write(&mut host, false).unwrap();
        host.out
    }

    fn wire_subpacket(encoding: Encoding, kind: Packet, data: &[u8]) -> Vec<u8> {
        let mut host = MockHost::new();
        crate::frame::write_subpacket(&mut host, encoding, kind, data, false).unwrap();
        host.out
    }

    fn hex(kind: Frame, flags: [u8; 4]) -> Vec<u8> {
        wire_header(&Header::new(Encoding::ZHEX, kind).with_flags(&flags))
    }

    fn hex_count(kind: Frame, count: u32) -> Vec<u8> {
        wire_header(&Header::new(Encoding::ZHEX, kind).with_count(count))
    }

    fn rinit_flags() -> [u8; 4] {
        [0, 0, 0, (Zrinit::CANFDX | Zrinit::CANOVIO | Zrinit::CANFC32).bits()]
    }

    fn recv_session() -> Session<MockHost> {
        let mut session = Session::start_recv(MockHost::new(), Config::default()).unwrap();
        session.host.take_out();
        session
    }

    fn count_zcrcw(out: &[u8]) -> usize {
        out.windows(2)
            .filter(|w| w[0] == ZDLE && w[1] == Packet::ZCRCW as u8)
            .count()
    }

    /// The canonical exchange: one 10-byte file end to end, driven from
    /// hand-built sender frames.
    #[test]
    fn test_receive_single_file() {
        let mut session = recv_session();

        session.feed(&hex(Frame::ZRQINIT, [0; 4])).unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZRINIT, rinit_flags()));

        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(
            Encoding::ZBIN,
            Packet::ZCRCW,
            b"hi.txt\x0010 0 0 0 1 10\x00",
        ));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZRPOS, 0));
        assert_eq!(session.state(), State::RFile);
        assert!(session
            .host
            .events
            .iter()
            .any(|e| e.contains("FileBegin") && e.contains("hi.txt")));

        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZDATA).with_count(0));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCE, b"helloworld"));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.file_data("hi.txt"), b"helloworld");
        assert_eq!(session.state(), State::RData);

        session
            .feed(&wire_header(
                &Header::new(Encoding::ZBIN, Frame::ZEOF).with_count(10),
            ))
            .unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZRINIT, rinit_flags()));
        assert!(session.host.events.iter().any(|e| e.contains("FileEnd")));

        session.feed(&hex(Frame::ZFIN, [0; 4])).unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZFIN, [0; 4]));

        assert_eq!(session.feed(b"OO"), Ok(Control::Done));
        assert_eq!(session.host.events.last().unwrap(), "Done");
    }

    /// A file that partially exists locally resumes at its current length.
    #[test]
    fn test_resume_offset_announced() {
        let mut session =
            Session::start_recv(MockHost::with_file("x", &[7u8; 100]), Config::default()).unwrap();
        session.host.take_out();

        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"x\x00300\x00"));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZRPOS, 100));
        assert_eq!(session.count, 100);
    }

    /// ZCRCW data is acknowledged with the new offset before more data is
    /// accepted.
    #[test]
    fn test_zcrcw_data_is_acked() {
        let mut session = recv_session();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"a\x0020\x00"));
        session.feed(&bytes).unwrap();
        session.host.take_out();

        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZDATA).with_count(0));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, &[9u8; 20]));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZACK, 20));
    }

    /// A subpacket with a broken CRC rolls the stream back to the last
    /// good offset and the file does not grow past it.
    #[test]
    fn test_bad_data_crc_triggers_zrpos() {
        let mut session = recv_session();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"b\x0040\x00"));
        session.feed(&bytes).unwrap();
        session.host.take_out();

        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZDATA).with_count(0));
        let mut packet = wire_subpacket(Encoding::ZBIN, Packet::ZCRCG, &[b'A'; 40]);
        packet[10] = b'B';
        bytes.extend(packet);
        session.feed(&bytes).unwrap();

        assert_eq!(session.host.take_out(), hex_count(Frame::ZRPOS, 0));
        assert_eq!(session.state(), State::RDataErr);
        assert!(session.host.file_data("b").is_empty());

        // The sender repositions and the transfer carries on.
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZDATA).with_count(0));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCE, &[b'A'; 40]));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.file_data("b"), &[b'A'; 40]);
    }

    /// ZEOF at the wrong offset is answered with ZRPOS, not completion.
    #[test]
    fn test_zeof_mismatch_triggers_zrpos() {
        let mut session = recv_session();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"c\x0030\x00"));
        session.feed(&bytes).unwrap();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZDATA).with_count(0));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCE, &[1u8; 10]));
        session.feed(&bytes).unwrap();
        session.host.take_out();

        session
            .feed(&wire_header(
                &Header::new(Encoding::ZBIN, Frame::ZEOF).with_count(30),
            ))
            .unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZRPOS, 10));
        assert_eq!(session.state(), State::RFile);
        assert!(!session.host.events.iter().any(|e| e.contains("FileEnd")));
    }

    /// The host can refuse an announced file; the sender is told to skip.
    #[test]
    fn test_host_refusal_sends_zskip() {
        let mut session = recv_session();
        session.host.refuse_files = true;
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"no\x005\x00"));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZSKIP, [0; 4]));
        assert_eq!(session.state(), State::RStart);
        assert!(session.host.events.iter().any(|e| e.contains("Skip")));
    }

    /// Full-ack windowing: exactly one data subpacket in flight per ZACK.
    #[test]
    fn test_sender_full_ack_windowing() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 64 + 32) as u8).collect();
        let cfg = Config {
            windowing: Windowing::FullAck,
            ..Config::default()
        };
        let host = MockHost::with_file("w.bin", &data);
        let mut session = Session::start_send(host, vec!["w.bin".into()], cfg).unwrap();
        session.host.take_out();

        session.feed(&hex(Frame::ZRINIT, rinit_flags())).unwrap();
        assert_eq!(session.state(), State::FileWait);
        session.host.take_out();

        session.feed(&hex_count(Frame::ZRPOS, 0)).unwrap();
        let out = session.host.take_out();
        assert_eq!(count_zcrcw(&out), 1, "one ZCRCW subpacket, then wait");
        assert_eq!(session.state(), State::SendWait);

        session.feed(&hex_count(Frame::ZACK, 1024)).unwrap();
        assert_eq!(count_zcrcw(&session.host.take_out()), 1);
        assert_eq!(session.state(), State::SendWait);

        session.feed(&hex_count(Frame::ZACK, 2048)).unwrap();
        assert_eq!(count_zcrcw(&session.host.take_out()), 1);
        assert_eq!(session.state(), State::SendDone);

        session.feed(&hex_count(Frame::ZACK, 2500)).unwrap();
        assert_eq!(session.state(), State::SendEof);
        session.host.take_out();

        session.feed(&hex(Frame::ZRINIT, rinit_flags())).unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZFIN, [0; 4]));
        assert_eq!(session.state(), State::TFinish);

        assert_eq!(session.feed(&hex(Frame::ZFIN, [0; 4])), Ok(Control::Done));
        assert_eq!(session.host.take_out(), b"OO");
    }

    /// ZCHALLENGE is answered by echoing the challenge bytes in a ZACK.
    #[test]
    fn test_challenge_echoed() {
        let host = MockHost::with_file("f", b"x");
        let mut session = Session::start_send(host, vec!["f".into()], Config::default()).unwrap();
        session.host.take_out();
        session
            .feed(&hex(Frame::ZCHALLENGE, [0xde, 0xad, 0xbe, 0xef]))
            .unwrap();
        assert_eq!(
            session.host.take_out(),
            hex(Frame::ZACK, [0xde, 0xad, 0xbe, 0xef])
        );
        assert_eq!(session.state(), State::TStart);
    }

    /// Remote commands are refused with EPERM and never executed; once in
    /// command mode every header is a protocol failure until the timer
    /// expires.
    #[test]
    fn test_command_refused() {
        let mut session = recv_session();
        session.feed(&hex(Frame::ZCOMMAND, [0; 4])).unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZCOMPL, [EPERM, 0, 0, 0]));
        assert_eq!(session.state(), State::CommandData);

        session.feed(&hex(Frame::ZRQINIT, [0; 4])).unwrap();
        assert!(session
            .host
            .events
            .iter()
            .any(|e| e.starts_with("ProtocolErr")));
        assert_eq!(session.state(), State::CommandData);
        assert_eq!(session.tick(), Err(Error::SendTimeout));
    }

    /// ZSTDERR text is collected and surfaced as a remote message.
    #[test]
    fn test_stderr_message_surfaced() {
        let mut session = recv_session();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZSTDERR));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCE, b"Boo!"));
        session.feed(&bytes).unwrap();
        assert!(session
            .host
            .events
            .iter()
            .any(|e| e.starts_with("RemoteMessage")));
    }

    #[test]
    fn test_freecnt_answered_with_zero() {
        let mut session = recv_session();
        session.feed(&hex(Frame::ZFREECNT, [0; 4])).unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZACK, 0));
    }

    /// ZSINIT delivers the sender's attention string; we ACK it.
    #[test]
    fn test_sinit_attn_stored() {
        let mut session = recv_session();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZSINIT));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"+++\x00"));
        session.feed(&bytes).unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZACK, 0));
        assert_eq!(session.peer_attn.as_deref(), Some(&b"+++"[..]));
        assert_eq!(session.state(), State::RStart);
    }

    /// A configured attention string goes out as ZSINIT before the first
    /// file, and the batch waits for its ZACK.
    #[test]
    fn test_sender_announces_attn() {
        let cfg = Config {
            attn: Some(b"+++".to_vec()),
            ..Config::default()
        };
        let host = MockHost::with_file("f", b"data");
        let mut session = Session::start_send(host, vec!["f".into()], cfg).unwrap();
        session.host.take_out();

        session.feed(&hex(Frame::ZRINIT, rinit_flags())).unwrap();
        assert_eq!(session.state(), State::TInit);
        assert!(!session.host.take_out().is_empty());

        session.feed(&hex_count(Frame::ZACK, 0)).unwrap();
        assert_eq!(session.state(), State::FileWait);
    }

    /// ZSKIP mid-batch closes the current file and moves on (here: to the
    /// end of the batch).
    #[test]
    fn test_sender_handles_zskip() {
        let host = MockHost::with_file("s", b"abcdef");
        let mut session = Session::start_send(host, vec!["s".into()], Config::default()).unwrap();
        session.feed(&hex(Frame::ZRINIT, rinit_flags())).unwrap();
        session.host.take_out();

        session.feed(&hex(Frame::ZSKIP, [0; 4])).unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZFIN, [0; 4]));
        assert_eq!(session.state(), State::TFinish);
        assert!(session.host.events.iter().any(|e| e.contains("Skip")));
    }

    /// Attention pauses a streaming sender until the receiver repositions.
    #[test]
    fn test_attention_pauses_streaming() {
        let data = vec![0x42u8; 50_000];
        let host = MockHost::with_file("big", &data);
        let mut session =
            Session::start_send(host, vec!["big".into()], Config::default()).unwrap();
        session.feed(&hex(Frame::ZRINIT, rinit_flags())).unwrap();
        session.host.take_out();
        session.feed(&hex_count(Frame::ZRPOS, 0)).unwrap();
        assert_eq!(session.state(), State::Sending);
        session.host.take_out();

        session.attention();
        session.tick().unwrap();
        assert!(session.host.take_out().is_empty(), "paused after attention");

        session.feed(&hex_count(Frame::ZRPOS, 1024)).unwrap();
        assert!(!session.host.take_out().is_empty(), "ZRPOS resumes");
    }

    /// The receiver keeps its last-ditch ZRINIT retries and then gives up.
    #[test]
    fn test_receiver_timeout_ladder() {
        let mut session = recv_session();
        let mut bytes = wire_header(&Header::new(Encoding::ZBIN, Frame::ZFILE));
        bytes.extend(wire_subpacket(Encoding::ZBIN, Packet::ZCRCW, b"t\x009\x00"));
        session.feed(&bytes).unwrap();
        session.host.take_out();
        assert_eq!(session.state(), State::RFile);

        // Two retries resend ZRPOS, the third falls back to ZRINIT.
        session.tick().unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZRPOS, 0));
        session.tick().unwrap();
        assert_eq!(session.host.take_out(), hex_count(Frame::ZRPOS, 0));
        session.tick().unwrap();
        assert_eq!(session.host.take_out(), hex(Frame::ZRINIT, rinit_flags()));
        assert_eq!(session.state(), State::RStart);
    }
}
