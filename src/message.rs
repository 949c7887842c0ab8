use std::{convert::TryFrom, fmt, str::FromStr};

use bitflags::bitflags;
use bytes::BufMut;

use crate::constants::*;
use crate::error::*;

/// An [Address] Represents an INSTEON device address. These are 3 bytes
/// and are commonly represented as hex numbers separated
/// by '.', e.g. '2b.a1.11'.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Address([u8; 3]);

impl Address {
    /// The raw address bytes.
    pub fn bytes(&self) -> [u8; 3] {
        self.0
    }
}

impl From<[u8; 3]> for Address {
    fn from(b: [u8; 3]) -> Self {
        Address(b)
    }
}

impl<'a> TryFrom<&'a [u8]> for Address {
    type Error = Error;

    fn try_from(b: &'a [u8]) -> Result<Self, Self::Error> {
        if b.len() < 3 {
            return Err(Error::FrameTooShort {
                expected: 3,
                got: b.len(),
            });
        }

        let mut address = [0u8; 3];
        address.copy_from_slice(&b[..3]);
        Ok(Address(address))
    }
}

impl FromStr for Address {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, <Self as FromStr>::Err> {
        let mut buf = [0u8; 3];

        let pieces: Vec<&str> = s.split('.').collect();
        if pieces.len() != buf.len() {
            return Err(Error::InvalidAddress);
        }

        for (idx, piece) in pieces.iter().enumerate() {
            buf[idx] = u8::from_str_radix(piece, 16).map_err(|_| Error::InvalidAddress)?;
        }

        Ok(Address(buf))
    }
}

impl From<Address> for [u8; 3] {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}.{:02x}.{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Device category and sub-category, as reported in a set-button or
/// ID request broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DevCat {
    pub category: u8,
    pub sub_category: u8,
}

impl fmt::Display for DevCat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}.{:02x}", self.category, self.sub_category)
    }
}

/// Firmware revision reported by a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirmwareVersion(pub u8);

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// A [Command] is carried in every [Message]. The `class` is not sent on the
/// wire; it is recovered from the message flags and separates, for instance,
/// a standard direct command from an extended one with the same `cmd1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Command {
    class: u8,
    cmd1: u8,
    cmd2: u8,
}

impl Command {
    pub const ASSIGN_TO_ALL_LINK_GROUP: Command = Command::standard(0x01, 0x00);
    pub const DELETE_FROM_ALL_LINK_GROUP: Command = Command::standard(0x02, 0x00);
    pub const PRODUCT_DATA_REQUEST: Command = Command::standard(0x03, 0x00);
    pub const EXIT_LINKING_MODE: Command = Command::standard(0x08, 0x00);
    pub const ENTER_LINKING_MODE: Command = Command::standard(0x09, 0x00);
    pub const ENTER_LINKING_MODE_EXT: Command = Command::extended(0x09, 0x00);
    pub const ENTER_UNLINKING_MODE: Command = Command::standard(0x0a, 0x00);
    pub const GET_ENGINE_VERSION: Command = Command::standard(0x0d, 0x00);
    pub const PING: Command = Command::standard(0x0f, 0x00);
    pub const ID_REQUEST: Command = Command::standard(0x10, 0x00);
    pub const LIGHT_ON: Command = Command::standard(0x11, 0x00);
    pub const LIGHT_ON_FAST: Command = Command::standard(0x12, 0x00);
    pub const LIGHT_OFF: Command = Command::standard(0x13, 0x00);
    pub const LIGHT_OFF_FAST: Command = Command::standard(0x14, 0x00);
    pub const LIGHT_STATUS_REQUEST: Command = Command::standard(0x19, 0x00);
    pub const BEEP: Command = Command::standard(0x30, 0x00);
    pub const EXTENDED_GET_SET: Command = Command::extended(0x2e, 0x00);
    pub const READ_WRITE_ALDB: Command = Command::extended(0x2f, 0x00);
    pub const SET_BUTTON_PRESSED_RESPONDER: Command = Command::new(0x08, 0x01, 0x00);
    pub const SET_BUTTON_PRESSED_CONTROLLER: Command = Command::new(0x08, 0x02, 0x00);

    pub const fn new(class: u8, cmd1: u8, cmd2: u8) -> Command {
        Command { class, cmd1, cmd2 }
    }

    /// A command sent in a standard-length direct message.
    pub const fn standard(cmd1: u8, cmd2: u8) -> Command {
        Command::new(0x00, cmd1, cmd2)
    }

    /// A command sent in an extended-length direct message.
    pub const fn extended(cmd1: u8, cmd2: u8) -> Command {
        Command::new(0x01, cmd1, cmd2)
    }

    pub fn class(&self) -> u8 {
        self.class
    }

    pub fn cmd1(&self) -> u8 {
        self.cmd1
    }

    pub fn cmd2(&self) -> u8 {
        self.cmd2
    }

    /// The same command with a different second byte. Replies usually carry
    /// the request's `cmd1` and a result in `cmd2`.
    pub const fn sub_command(self, cmd2: u8) -> Command {
        Command::new(self.class, self.cmd1, cmd2)
    }

    /// Whether `other` is an instance of this command. A zero `cmd2` here
    /// matches any `cmd2`. The class is not compared.
    pub fn matches(&self, other: &Command) -> bool {
        self.cmd1 == other.cmd1 && (self.cmd2 == 0 || self.cmd2 == other.cmd2)
    }

    /// Looks the command up in the name table.
    pub fn name(&self) -> Option<&'static str> {
        COMMAND_NAMES
            .iter()
            .find(|(c, _)| c.class == self.class && c.cmd1 == self.cmd1 && c.cmd2 == self.cmd2)
            .or_else(|| {
                COMMAND_NAMES.iter().find(|(c, _)| {
                    c.class == self.class && c.cmd1 == self.cmd1 && c.cmd2 == 0
                })
            })
            .map(|(_, name)| *name)
    }
}

const COMMAND_NAMES: &[(Command, &str)] = &[
    (Command::ASSIGN_TO_ALL_LINK_GROUP, "Assign to All-Link Group"),
    (Command::DELETE_FROM_ALL_LINK_GROUP, "Delete from All-Link Group"),
    (Command::PRODUCT_DATA_REQUEST, "Product Data Request"),
    (Command::standard(0x03, 0x01), "FX Username Request"),
    (Command::standard(0x03, 0x02), "Device Text String Request"),
    (Command::EXIT_LINKING_MODE, "Exit Linking Mode"),
    (Command::ENTER_LINKING_MODE, "Enter Linking Mode"),
    (Command::ENTER_LINKING_MODE_EXT, "Enter Linking Mode"),
    (Command::ENTER_UNLINKING_MODE, "Enter Unlinking Mode"),
    (Command::GET_ENGINE_VERSION, "Get INSTEON Engine Version"),
    (Command::PING, "Ping"),
    (Command::ID_REQUEST, "ID Request"),
    (Command::LIGHT_ON, "Light On"),
    (Command::LIGHT_ON_FAST, "Light On Fast"),
    (Command::LIGHT_OFF, "Light Off"),
    (Command::LIGHT_OFF_FAST, "Light Off Fast"),
    (Command::standard(0x15, 0x00), "Brighten"),
    (Command::standard(0x16, 0x00), "Dim"),
    (Command::LIGHT_STATUS_REQUEST, "Light Status Request"),
    (Command::BEEP, "Beep"),
    (Command::EXTENDED_GET_SET, "Extended Get/Set"),
    (Command::READ_WRITE_ALDB, "Read/Write ALDB"),
    (Command::SET_BUTTON_PRESSED_RESPONDER, "Set-button Pressed Responder"),
    (Command::SET_BUTTON_PRESSED_CONTROLLER, "Set-button Pressed Controller"),
];

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({:02x})", name, self.cmd2),
            None => write!(f, "Command({:02x} {:02x} {:02x})", self.class, self.cmd1, self.cmd2),
        }
    }
}

/// The kind of a [Message], taken from the top three bits of its flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Direct,
    DirectAck,
    DirectNak,
    Broadcast,
    AllLinkBroadcast,
    AllLinkCleanup,
    AllLinkCleanupAck,
    AllLinkCleanupNak,
}

impl MessageType {
    fn bits(self) -> u8 {
        use MessageType::*;
        match self {
            Direct => 0x00,
            DirectAck => 0x20,
            AllLinkCleanup => 0x40,
            AllLinkCleanupAck => 0x60,
            Broadcast => 0x80,
            DirectNak => 0xa0,
            AllLinkBroadcast => 0xc0,
            AllLinkCleanupNak => 0xe0,
        }
    }

    fn from_bits(bits: u8) -> MessageType {
        use MessageType::*;
        match bits & 0xe0 {
            0x00 => Direct,
            0x20 => DirectAck,
            0x40 => AllLinkCleanup,
            0x60 => AllLinkCleanupAck,
            0x80 => Broadcast,
            0xa0 => DirectNak,
            0xc0 => AllLinkBroadcast,
            _ => AllLinkCleanupNak,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use MessageType::*;
        let s = match self {
            Direct => "D",
            DirectAck => "D Ack",
            DirectNak => "D NAK",
            Broadcast => "B",
            AllLinkBroadcast => "A",
            AllLinkCleanup => "C",
            AllLinkCleanupAck => "C Ack",
            AllLinkCleanupNak => "C NAK",
        };
        f.pad(s)
    }
}

bitflags! {
    /// Represents details about a [Message].
    pub struct MessageFlags: u8 {
        /// When present along with the [MessageFlags::GROUP] flag below, this message is being
        /// broadcast to a group. If [MessageFlags::ACK] is also present, this is a NAK.
        const BROADCAST_OR_NAK = (1 << 7);
        /// The message is part of an all-link conversation.
        const GROUP            = (1 << 6);
        /// The message is an acknowledgement of a prior one.
        const ACK              = (1 << 5);
        /// The message is an extended message.
        const EXTENDED         = (1 << 4);
        /// Hops remaining before repeaters stop forwarding the message.
        const HOPS_LEFT        = 0b1100;
        /// Hops the message was allowed when it was first sent.
        const MAX_HOPS         = 0b0011;
        const NONE             = 0;
    }
}

impl Default for MessageFlags {
    fn default() -> Self {
        MessageFlags::NONE
    }
}

impl MessageFlags {
    /// Builds flags from their component parts. Hop counts are masked to two bits.
    pub fn new(message_type: MessageType, extended: bool, hops_left: u8, max_hops: u8) -> Self {
        let mut bits = message_type.bits() | (hops_left & 0b11) << 2 | (max_hops & 0b11);
        if extended {
            bits |= MessageFlags::EXTENDED.bits();
        }
        MessageFlags::from_bits_truncate(bits)
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_bits(self.bits())
    }

    pub fn is_extended(&self) -> bool {
        self.contains(MessageFlags::EXTENDED)
    }

    pub fn hops_left(&self) -> u8 {
        (self.bits() & MessageFlags::HOPS_LEFT.bits()) >> 2
    }

    pub fn max_hops(&self) -> u8 {
        self.bits() & MessageFlags::MAX_HOPS.bits()
    }

    /// Returns a copy with both hop counts set to `ttl`.
    pub fn with_hops(self, ttl: u8) -> Self {
        let bits = self.bits() & !(MessageFlags::HOPS_LEFT | MessageFlags::MAX_HOPS).bits();
        MessageFlags::from_bits_truncate(bits | (ttl & 0b11) << 2 | (ttl & 0b11))
    }

    pub fn is_ack(&self) -> bool {
        matches!(
            self.message_type(),
            MessageType::DirectAck | MessageType::AllLinkCleanupAck
        )
    }

    pub fn is_nak(&self) -> bool {
        matches!(
            self.message_type(),
            MessageType::DirectNak | MessageType::AllLinkCleanupNak
        )
    }

    pub fn is_broadcast(&self) -> bool {
        self.contains(MessageFlags::BROADCAST_OR_NAK) && !self.contains(MessageFlags::ACK)
    }
}

impl From<MessageType> for MessageFlags {
    fn from(message_type: MessageType) -> Self {
        MessageFlags::new(message_type, false, 0, 0)
    }
}

impl fmt::Display for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let length = if self.is_extended() { "E" } else { "S" };
        write!(
            f,
            "{}{:<5} {}:{}",
            length,
            self.message_type(),
            self.max_hops(),
            self.hops_left()
        )
    }
}

/// A single INSTEON message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// The address of the device that sent the `Message`.
    pub from: Address,

    /// The address of the receipient of the `Message`. For broadcasts this
    /// carries a group number or device category instead.
    pub to: Address,

    /// Flags describing various attributes of the `Message`.
    pub flags: MessageFlags,

    /// The `Command` contained in the `Message`.
    pub command: Command,

    /// Device specific data, only present in an extended `Message`.
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a direct message. It is extended when `payload` is not empty.
    pub fn direct(to: Address, command: Command, payload: Vec<u8>) -> Message {
        let extended = !payload.is_empty();
        Message {
            from: Address::default(),
            to,
            flags: MessageFlags::new(MessageType::Direct, extended, 0, 0),
            command: if extended {
                Command::extended(command.cmd1, command.cmd2)
            } else {
                command
            },
            payload,
        }
    }

    /// Assembles a message from its wire fields, recovering the command class
    /// from the flags.
    pub fn from_parts(
        from: Address,
        to: Address,
        flags: u8,
        cmd1: u8,
        cmd2: u8,
        payload: &[u8],
    ) -> Message {
        // NAK patterns reuse the broadcast bit, so it is not part of the class
        let class = if flags & 0xe0 == 0xa0 || flags & 0xe0 == 0xe0 {
            (flags & 0x70) >> 4
        } else {
            flags >> 4
        };
        let flags = MessageFlags::from_bits_truncate(flags);
        let payload = if flags.is_extended() {
            payload.to_vec()
        } else {
            Vec::new()
        };

        Message {
            from,
            to,
            flags,
            command: Command::new(class, cmd1, cmd2),
            payload,
        }
    }

    /// Serializes the message: 9 bytes, or 23 when extended.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_slice(&self.from.0);
        dst.put_slice(&self.to.0);
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.command.cmd1);
        dst.put_u8(self.command.cmd2);

        if self.flags.is_extended() {
            let mut payload = [0u8; EXTENDED_PAYLOAD_LEN];
            let len = self.payload.len().min(EXTENDED_PAYLOAD_LEN);
            payload[..len].copy_from_slice(&self.payload[..len]);
            dst.put_slice(&payload);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EXTENDED_MSG_LEN);
        self.encode(&mut buf);
        buf
    }

    /// Parses a message from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Message, Error> {
        if buf.len() < STANDARD_MSG_LEN {
            return Err(Error::FrameTooShort {
                expected: STANDARD_MSG_LEN,
                got: buf.len(),
            });
        }

        let flags = buf[6];
        if MessageFlags::from_bits_truncate(flags).is_extended() && buf.len() < EXTENDED_MSG_LEN {
            return Err(Error::FrameTooShort {
                expected: EXTENDED_MSG_LEN,
                got: buf.len(),
            });
        }

        Ok(Message::from_parts(
            Address::try_from(&buf[0..3])?,
            Address::try_from(&buf[3..6])?,
            flags,
            buf[7],
            buf[8],
            &buf[STANDARD_MSG_LEN..buf.len().min(EXTENDED_MSG_LEN)],
        ))
    }

    pub fn is_ack(&self) -> bool {
        self.flags.is_ack()
    }

    pub fn is_nak(&self) -> bool {
        self.flags.is_nak()
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.is_broadcast()
    }

    /// Returns true if `self` acknowledges (positively or not) `request`. The
    /// reply carries the request's command or a sub-command of it.
    pub fn is_reply_to(&self, request: &Message) -> bool {
        self.from == request.to
            && (self.is_ack() || self.is_nak())
            && self.command.cmd1 == request.command.cmd1
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_broadcast() {
            if self.flags.message_type() == MessageType::AllLinkBroadcast {
                write!(
                    f,
                    "{} {} -> ff.ff.ff Group({})",
                    self.flags, self.from, self.to.0[2]
                )?;
            } else {
                let devcat = DevCat {
                    category: self.to.0[0],
                    sub_category: self.to.0[1],
                };
                write!(
                    f,
                    "{} {} -> ff.ff.ff DevCat {} Firmware {}",
                    self.flags,
                    self.from,
                    devcat,
                    FirmwareVersion(self.to.0[2])
                )?;
            }
        } else {
            write!(f, "{} {} -> {}", self.flags, self.from, self.to)?;
        }

        // The cmd2 of an ack is a result, not part of the command, so a
        // name lookup would be misleading.
        if !self.is_ack() {
            write!(f, " {}", self.command)?;
        }

        if self.flags.is_extended() {
            let payload: Vec<String> = self.payload.iter().map(|b| format!("{:02x}", b)).collect();
            write!(f, " [{}]", payload.join(" "))?;
        }
        Ok(())
    }
}
