use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use log::{trace, warn};

use nom::{
    bytes::complete::{tag, take},
    combinator::{map, map_res, rest, verify},
    number::complete::be_u8,
    sequence::tuple,
    IResult,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::*;
use crate::error::*;
use crate::linkdb::LinkRecord;
use crate::message::{Address, Message, MessageFlags};

/// Represents the various link modes available.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AllLinkMode {
    /// In this mode, the modem is linked as a responder or receiver of events.
    Responder,
    /// In this mode, the modem is linked as a controller.
    Controller,
    /// In this mode, the effective link mode depends on the ordering in which
    /// the modem and device are entered into link mode.
    Auto,
    /// Causes a link to be deleted.
    Delete,
    /// A mode byte the modem reported that has no name here.
    Unknown(u8),
}

impl fmt::Display for AllLinkMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<u8> for AllLinkMode {
    fn from(mode: u8) -> Self {
        match mode {
            LINK_MODE_RESPONDER => AllLinkMode::Responder,
            LINK_MODE_CONTROLLER => AllLinkMode::Controller,
            LINK_MODE_AUTO => AllLinkMode::Auto,
            LINK_MODE_DELETE => AllLinkMode::Delete,
            other => AllLinkMode::Unknown(other),
        }
    }
}

impl From<AllLinkMode> for u8 {
    fn from(mode: AllLinkMode) -> Self {
        match mode {
            AllLinkMode::Responder => LINK_MODE_RESPONDER,
            AllLinkMode::Controller => LINK_MODE_CONTROLLER,
            AllLinkMode::Auto => LINK_MODE_AUTO,
            AllLinkMode::Delete => LINK_MODE_DELETE,
            AllLinkMode::Unknown(other) => other,
        }
    }
}

/// Information about the attached modem.
#[derive(Debug, Clone, PartialEq)]
pub struct ModemInfo {
    /// The [Address] for the modem.
    pub address: Address,
    /// The device category for the modem.
    pub category: u8,
    /// The sub-category for the modem.
    pub sub_category: u8,
    /// The firmware version present in the modem.
    pub firmware_version: u8,
}

/// This represents the result of a completed link.
#[derive(Debug, Clone, PartialEq)]
pub struct AllLinkComplete {
    pub mode: AllLinkMode,
    pub group: u8,
    pub address: Address,
    pub category: u8,
    pub sub_category: u8,
    pub firmware_version: u8,
}

/// This represents a single command or response to and from the modem.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Fetches the info for the current modem. The response will be in
    /// as `ModemInfo` frame.
    GetModemInfo,
    /// The response to `GetModemInfo`, containing the info for the current modem.
    ModemInfo(ModemInfo),
    /// Send an INSTEON message. The modem echoes it back once it has been
    /// queued for transmission.
    InsteonSend(Message),
    /// Produced when an INSTEON message, standard or extended, is received.
    InsteonReceive(Message),
    /// Puts the modem into linking mode
    StartAllLink { mode: AllLinkMode, group: u8 },
    /// Exits linking mode
    CancelAllLink,
    AllLinkComplete(AllLinkComplete),
    GetFirstAllLinkRecord,
    GetNextAllLinkRecord,
    AllLinkRecord(LinkRecord),
    Reset,
    /// The modem echoed a command back with a NAK, usually because it was busy.
    Nak(Box<Frame>),
    /// A frame with a known length that is not otherwise understood.
    Unknown { command: u8, buf: Vec<u8> },
}

fn address(input: &[u8]) -> IResult<&[u8], Address> {
    map(take(3usize), |b: &[u8]| Address::from([b[0], b[1], b[2]]))(input)
}

/// The fields of a received message: from, to, flags, cmd1, cmd2 and, when
/// the flags say so, 14 bytes of payload.
fn received_message(input: &[u8]) -> IResult<&[u8], Message> {
    let (input, (from, to)) = tuple((address, address))(input)?;
    message_tail(from, to, input)
}

/// A send echo carries no source address.
fn sent_message(input: &[u8]) -> IResult<&[u8], Message> {
    let (input, to) = address(input)?;
    message_tail(Address::default(), to, input)
}

fn message_tail(from: Address, to: Address, input: &[u8]) -> IResult<&[u8], Message> {
    let (input, (flags, cmd1, cmd2)) = tuple((be_u8, be_u8, be_u8))(input)?;
    let (input, payload) = if MessageFlags::from_bits_truncate(flags).is_extended() {
        take(EXTENDED_PAYLOAD_LEN)(input)?
    } else {
        (input, &input[..0])
    };
    Ok((
        input,
        Message::from_parts(from, to, flags, cmd1, cmd2, payload),
    ))
}

/// Frames the modem sends on its own initiative.
fn event(command: u8, input: &[u8]) -> IResult<&[u8], Frame> {
    match command {
        STANDARD_INSTEON_RECV | EXTENDED_INSTEON_RECV => {
            map(received_message, Frame::InsteonReceive)(input)
        }
        ALL_LINK_COMPLETE => map(
            tuple((be_u8, be_u8, address, be_u8, be_u8, be_u8)),
            |(mode, group, address, category, sub_category, firmware_version)| {
                Frame::AllLinkComplete(AllLinkComplete {
                    mode: mode.into(),
                    group,
                    address,
                    category,
                    sub_category,
                    firmware_version,
                })
            },
        )(input),
        ALL_LINK_RECORD => map(
            map_res(take(LINK_RECORD_LEN), LinkRecord::from_bytes),
            Frame::AllLinkRecord,
        )(input),
        _ => map(rest, |buf: &[u8]| Frame::Unknown {
            command,
            buf: buf.to_vec(),
        })(input),
    }
}

/// Host commands echoed back by the modem, followed by ACK or NAK.
fn echo(command: u8, input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, frame) = match command {
        GETIMINFO => map(
            tuple((address, be_u8, be_u8, be_u8)),
            |(address, category, sub_category, firmware_version)| {
                Frame::ModemInfo(ModemInfo {
                    address,
                    category,
                    sub_category,
                    firmware_version,
                })
            },
        )(input)?,
        INSTEON_SEND => map(sent_message, Frame::InsteonSend)(input)?,
        START_ALL_LINK => map(tuple((be_u8, be_u8)), |(mode, group)| Frame::StartAllLink {
            mode: mode.into(),
            group,
        })(input)?,
        CANCEL_ALL_LINK => (input, Frame::CancelAllLink),
        GET_FIRST_ALL_LINK_RECORD => (input, Frame::GetFirstAllLinkRecord),
        GET_NEXT_ALL_LINK_RECORD => (input, Frame::GetNextAllLinkRecord),
        RESET => (input, Frame::Reset),
        _ => {
            let (body, ack) = input.split_at(input.len().saturating_sub(1));
            (
                ack,
                Frame::Unknown {
                    command,
                    buf: body.to_vec(),
                },
            )
        }
    };

    let (input, ack) = verify(be_u8, |b: &u8| *b == ACK || *b == NAK)(input)?;
    if ack == NAK {
        Ok((input, Frame::Nak(Box::new(frame))))
    } else {
        Ok((input, frame))
    }
}

fn frame(input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, (_, command)) = tuple((tag(&[START][..]), be_u8))(input)?;
    if command < GETIMINFO {
        event(command, input)
    } else {
        echo(command, input)
    }
}

impl Frame {
    /// Returns true if `other` is a response to self.
    pub fn is_response(&self, other: &Frame) -> bool {
        match (self, other) {
            (Frame::GetModemInfo, Frame::ModemInfo { .. }) => true,
            (_, Frame::Nak(inner)) => self.is_response(inner),
            _ => ::std::mem::discriminant(self) == ::std::mem::discriminant(other),
        }
    }

    /// Parses one complete frame, starting with `START`. The buffer must
    /// hold exactly the bytes the [FrameCodec] split off.
    pub fn parse(raw: &[u8]) -> Result<Frame, Error> {
        let (_, frame) = frame(raw)?;
        Ok(frame)
    }

    /// Serializes the `Frame` onto the end of `bytes`. Frames that only the
    /// modem produces are refused with [Error::Unencodable].
    pub fn to_bytes(&self, bytes: &mut BytesMut) -> Result<(), Error> {
        let mut body = Vec::with_capacity(EXTENDED_MSG_LEN);
        match self {
            Frame::GetModemInfo => body.put_u8(GETIMINFO),
            Frame::InsteonSend(message) => {
                body.put_u8(INSTEON_SEND);

                // The modem fills in the source address itself.
                let mut raw = message.to_bytes();
                let raw = &mut raw[3..];
                if message.flags.is_extended() {
                    // Two's complement of the sum of cmd1 through the 13th
                    // data byte goes into the last data byte.
                    let last = raw.len() - 1;
                    let sum = raw[4..last].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
                    raw[last] = sum.wrapping_neg();
                }
                body.put_slice(raw);
            }
            Frame::StartAllLink { mode, group } => {
                body.put_u8(START_ALL_LINK);
                body.put_u8((*mode).into());
                body.put_u8(*group);
            }
            Frame::CancelAllLink => body.put_u8(CANCEL_ALL_LINK),
            Frame::GetFirstAllLinkRecord => body.put_u8(GET_FIRST_ALL_LINK_RECORD),
            Frame::GetNextAllLinkRecord => body.put_u8(GET_NEXT_ALL_LINK_RECORD),
            Frame::Reset => body.put_u8(RESET),
            _ => return Err(Error::Unencodable),
        }

        bytes.put_u8(START);
        bytes.put_slice(&body);
        Ok(())
    }
}

/// Splits the modem's byte stream into [Frame]s.
///
/// Bytes before a `START` marker are dropped. A marker followed by a selector
/// missing from the length table is treated as noise and scanning resumes at
/// the selector byte. Parse failures are not fatal to the stream; they yield
/// [Frame::Unknown] so the connection stays up.
#[derive(Debug, Default)]
pub struct FrameCodec();

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.iter().position(|b| *b == START) {
                Some(0) => (),
                Some(skip) => {
                    trace!("Skipping {:02x?}", &src[..skip]);
                    src.advance(skip);
                }
                None => {
                    if !src.is_empty() {
                        trace!("Skipping {:02x?}", &src[..]);
                    }
                    src.clear();
                    return Ok(None);
                }
            }

            if src.len() < 2 {
                return Ok(None);
            }

            let command = src[1];
            let mut len = match body_len(command) {
                Some(len) => len + 2,
                None => {
                    warn!("Unknown frame type {:02x}, resynchronizing", command);
                    src.advance(1);
                    continue;
                }
            };

            if command == INSTEON_SEND {
                // The flags byte follows the 3 byte destination.
                if src.len() < 6 {
                    return Ok(None);
                }
                if MessageFlags::from_bits_truncate(src[5]).is_extended() {
                    len += EXTENDED_PAYLOAD_LEN;
                }
            }

            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }

            let raw = src.split_to(len);
            trace!("Frame bytes {:02x?}", &raw[..]);
            return Ok(Some(Frame::parse(&raw).unwrap_or_else(|e| {
                warn!("Unable to parse frame {:02x?}: {}", &raw[..], e);
                Frame::Unknown {
                    command,
                    buf: raw[2..].to_vec(),
                }
            })));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.to_bytes(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linkdb::Group;
    use crate::message::{Command, MessageType};
    use std::str::FromStr;

    fn decode_all(buf: &[u8]) -> Vec<Frame> {
        let mut codec = FrameCodec();
        let mut src = BytesMut::from(buf);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    #[test]
    fn no_command() {
        assert!(decode_all(&[START]).is_empty());
    }

    #[test]
    fn no_terminator() {
        let mut codec = FrameCodec();
        let mut src = BytesMut::from(&[START, GETIMINFO, 0x01, 0x02][..]);
        assert_eq!(codec.decode(&mut src), Ok(None));
        assert_eq!(src.len(), 4);
    }

    #[test]
    fn garbage() {
        let mut codec = FrameCodec();
        let mut src = BytesMut::from(&[0x1u8; 128][..]);
        assert_eq!(codec.decode(&mut src), Ok(None));
        assert!(src.is_empty());
    }

    #[test]
    fn valid() {
        assert_eq!(
            decode_all(&[START, CANCEL_ALL_LINK, ACK]),
            vec![Frame::CancelAllLink]
        );
    }

    #[test]
    fn skips_to_start() {
        assert_eq!(
            decode_all(&[0xff, ACK, 0x00, START, RESET, ACK]),
            vec![Frame::Reset]
        );
    }

    #[test]
    fn unknown_command_resyncs() {
        // 0x95 is not a frame type, so the first START is noise; the
        // selector byte is rescanned and the real frame follows.
        assert_eq!(
            decode_all(&[START, 0x95, START, CANCEL_ALL_LINK, ACK]),
            vec![Frame::CancelAllLink]
        );
        assert_eq!(
            decode_all(&[START, START, CANCEL_ALL_LINK, ACK]),
            vec![Frame::CancelAllLink]
        );
    }

    #[test]
    fn modem_info() {
        assert_eq!(
            decode_all(&[START, GETIMINFO, 0x11, 0x22, 0x33, 0x03, 0x15, 0x9b, ACK]),
            vec![Frame::ModemInfo(ModemInfo {
                address: addr("11.22.33"),
                category: 0x03,
                sub_category: 0x15,
                firmware_version: 0x9b,
            })]
        );
    }

    #[test]
    fn standard_receive() {
        let frames = decode_all(&[
            START,
            STANDARD_INSTEON_RECV,
            0x01,
            0x02,
            0x03,
            0x04,
            0x05,
            0x06,
            0x2b,
            0x0f,
            0x00,
        ]);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::InsteonReceive(message) => {
                assert_eq!(message.from, addr("01.02.03"));
                assert_eq!(message.to, addr("04.05.06"));
                assert_eq!(message.flags.message_type(), MessageType::DirectAck);
                assert_eq!(message.command.cmd1(), 0x0f);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn extended_receive() {
        let mut buf = vec![
            START,
            EXTENDED_INSTEON_RECV,
            0x01,
            0x02,
            0x03,
            0x04,
            0x05,
            0x06,
            0x1b,
            0x2f,
            0x00,
        ];
        buf.extend_from_slice(&[0xaa; 14]);
        match &decode_all(&buf)[..] {
            [Frame::InsteonReceive(message)] => {
                assert_eq!(message.command, Command::READ_WRITE_ALDB);
                assert_eq!(message.payload, vec![0xaa; 14]);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn standard_send_echo() {
        let frames = decode_all(&[START, INSTEON_SEND, 0x01, 0x02, 0x03, 0x0f, 0x0d, 0x00, ACK]);
        match &frames[..] {
            [Frame::InsteonSend(message)] => {
                assert_eq!(message.to, addr("01.02.03"));
                assert_eq!(message.command, Command::GET_ENGINE_VERSION);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn extended_send_echo_waits_for_payload() {
        let mut buf = vec![START, INSTEON_SEND, 0x01, 0x02, 0x03, 0x1f, 0x2f, 0x00];
        buf.extend_from_slice(&[0u8; 14]);

        let mut codec = FrameCodec();
        let mut src = BytesMut::from(&buf[..]);
        // everything but the trailing ACK
        assert_eq!(codec.decode(&mut src), Ok(None));

        src.put_u8(ACK);
        match codec.decode(&mut src) {
            Ok(Some(Frame::InsteonSend(message))) => {
                assert!(message.flags.is_extended());
                assert_eq!(message.payload.len(), 14);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(src.is_empty());
    }

    #[test]
    fn nak_echo() {
        assert_eq!(
            decode_all(&[START, START_ALL_LINK, 0x01, 0x00, NAK]),
            vec![Frame::Nak(Box::new(Frame::StartAllLink {
                mode: AllLinkMode::Controller,
                group: 0
            }))]
        );
    }

    #[test]
    fn bad_terminator_is_unknown() {
        assert_eq!(
            decode_all(&[START, RESET, 0x42]),
            vec![Frame::Unknown {
                command: RESET,
                buf: vec![0x42]
            }]
        );
    }

    #[test]
    fn link_record_frame() {
        assert_eq!(
            decode_all(&[START, ALL_LINK_RECORD, 0xe2, 0x01, 0x11, 0x22, 0x33, 0x01, 0x20, 0x41]),
            vec![Frame::AllLinkRecord(LinkRecord::controller(
                Group(1),
                addr("11.22.33"),
                [0x01, 0x20, 0x41]
            ))]
        );
    }

    #[test]
    fn all_link_complete() {
        let frames = decode_all(&[
            START,
            ALL_LINK_COMPLETE,
            0x01,
            0x00,
            0x11,
            0x22,
            0x33,
            0x02,
            0x2a,
            0x41,
        ]);
        assert_eq!(
            frames,
            vec![Frame::AllLinkComplete(AllLinkComplete {
                mode: AllLinkMode::Controller,
                group: 0,
                address: addr("11.22.33"),
                category: 0x02,
                sub_category: 0x2a,
                firmware_version: 0x41,
            })]
        );
    }

    #[test]
    fn several_frames() {
        let frames = decode_all(&[
            START,
            CANCEL_ALL_LINK,
            ACK,
            ACK,
            START,
            BUTTON_EVENT,
            0x02,
            START,
            RESET,
        ]);
        assert_eq!(
            frames,
            vec![
                Frame::CancelAllLink,
                Frame::Unknown {
                    command: BUTTON_EVENT,
                    buf: vec![0x02]
                }
            ]
        );
    }

    #[test]
    fn encode_standard_send() {
        let message = Message::direct(addr("01.02.03"), Command::PING, Vec::new());
        let mut dst = BytesMut::new();
        FrameCodec()
            .encode(Frame::InsteonSend(message), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &[START, INSTEON_SEND, 0x01, 0x02, 0x03, 0x00, 0x0f, 0x00]);
    }

    #[test]
    fn encode_extended_checksum() {
        let message = Message::direct(addr("01.02.03"), Command::READ_WRITE_ALDB, vec![0x00; 14]);
        let mut dst = BytesMut::new();
        FrameCodec()
            .encode(Frame::InsteonSend(message), &mut dst)
            .unwrap();
        assert_eq!(dst.len(), 22);
        // 0x2f + 0x00 + ... = 0x2f, negated
        assert_eq!(dst[21], 0xd1);
        let sum = dst[6..].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn encode_host_commands() {
        let mut dst = BytesMut::new();
        Frame::StartAllLink {
            mode: AllLinkMode::Auto,
            group: 1,
        }
        .to_bytes(&mut dst)
        .unwrap();
        Frame::GetNextAllLinkRecord.to_bytes(&mut dst).unwrap();
        assert_eq!(
            &dst[..],
            &[START, START_ALL_LINK, 0x03, 0x01, START, GET_NEXT_ALL_LINK_RECORD]
        );
    }

    #[test]
    fn nak_is_a_response() {
        let nak = Frame::Nak(Box::new(Frame::CancelAllLink));
        assert!(Frame::CancelAllLink.is_response(&nak));
        assert!(!Frame::Reset.is_response(&nak));
        assert!(Frame::GetModemInfo.is_response(&Frame::ModemInfo(ModemInfo {
            address: Address::default(),
            category: 0,
            sub_category: 0,
            firmware_version: 0,
        })));
    }

    #[test]
    fn encode_modem_only_frame() {
        let mut dst = BytesMut::new();
        assert_eq!(
            Frame::AllLinkRecord(LinkRecord::default()).to_bytes(&mut dst),
            Err(Error::Unencodable)
        );
        assert!(dst.is_empty());
    }

    #[test]
    fn extended_send_echo_round_trip() {
        let mut message = Message::direct(
            addr("01.02.03"),
            Command::EXTENDED_GET_SET,
            (1..=14).collect(),
        );
        message.flags = message.flags.with_hops(3);

        let mut codec = FrameCodec();
        let mut src = BytesMut::new();
        codec
            .encode(Frame::InsteonSend(message.clone()), &mut src)
            .unwrap();
        src.put_u8(ACK);

        let echoed = match codec.decode(&mut src).unwrap() {
            Some(Frame::InsteonSend(echoed)) => echoed,
            other => panic!("unexpected {:?}", other),
        };
        assert!(src.is_empty());
        assert_eq!(echoed.to, message.to);
        assert_eq!(echoed.flags, message.flags);
        assert_eq!(echoed.command, message.command);
        assert_eq!(&echoed.payload[..13], &message.payload[..13]);

        let sum = [message.command.cmd1(), message.command.cmd2()]
            .iter()
            .chain(&message.payload[..13])
            .fold(0u8, |sum, b| sum.wrapping_add(*b));
        assert_eq!(echoed.payload[13], sum.wrapping_neg());
    }

    #[test]
    fn all_link_send_echo_is_unknown() {
        assert_eq!(
            decode_all(&[START, ALL_LINK_SEND, 0x01, 0x11, 0xff, ACK]),
            vec![Frame::Unknown {
                command: ALL_LINK_SEND,
                buf: vec![0x01, 0x11, 0xff]
            }]
        );
    }
}
