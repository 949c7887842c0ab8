//! Test doubles shared by the unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::Transport;
use crate::error::Error;
use crate::linkdb::{LinkRecord, MemAddress};
use crate::listener::Listeners;
use crate::message::*;

/// Address the mock modem sends from.
pub const MODEM: [u8; 3] = [0xaa, 0xbb, 0xcc];

type Responder = Box<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

/// A [Transport] that records what is written and answers synchronously.
pub struct MockTransport {
    listeners: Arc<Listeners>,
    sent: Mutex<Vec<Message>>,
    responder: Responder,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&Message) -> Vec<Message> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(MockTransport {
            listeners: Listeners::new(),
            sent: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    /// A network where nobody answers.
    pub fn silent() -> Arc<Self> {
        MockTransport::new(|_| Vec::new())
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, message: Message) -> Result<(), Error> {
        let replies = (self.responder)(&message);
        self.sent.lock().push(message);
        for reply in replies {
            self.listeners.deliver(&reply);
        }
        Ok(())
    }

    fn listeners(&self) -> &Arc<Listeners> {
        &self.listeners
    }
}

fn reply(from: Address, request: &Message, message_type: MessageType, cmd2: u8) -> Message {
    let flags = MessageFlags::new(message_type, false, 3, 3);
    Message::from_parts(
        from,
        Address::from(MODEM),
        flags.bits(),
        request.command.cmd1(),
        cmd2,
        &[],
    )
}

/// The device's ACK to `request`.
pub fn ack(request: &Message, cmd2: u8) -> Message {
    reply(request.to, request, MessageType::DirectAck, cmd2)
}

/// An ACK to `request` sent by some other device.
pub fn ack_from(from: Address, request: &Message, cmd2: u8) -> Message {
    reply(from, request, MessageType::DirectAck, cmd2)
}

/// The device's NAK to `request`.
pub fn nak(request: &Message, cmd2: u8) -> Message {
    reply(request.to, request, MessageType::DirectNak, cmd2)
}

/// An unsolicited standard message.
pub fn message_from(from: Address, message_type: MessageType, command: Command) -> Message {
    let flags = MessageFlags::new(message_type, false, 3, 3);
    Message::from_parts(
        from,
        Address::from(MODEM),
        flags.bits(),
        command.cmd1(),
        command.cmd2(),
        &[],
    )
}

/// A read-ALDB record response as sent by a device.
pub fn aldb_record(from: Address, address: MemAddress, record: &LinkRecord) -> Message {
    let mut payload = vec![0x00, 0x01, address.high(), address.low(), 0x00];
    payload.extend_from_slice(&record.to_bytes());
    payload.push(0x00);

    let flags = MessageFlags::new(MessageType::Direct, true, 3, 3);
    Message::from_parts(
        from,
        Address::from(MODEM),
        flags.bits(),
        Command::READ_WRITE_ALDB.cmd1(),
        0x00,
        &payload,
    )
}
