use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future::FutureExt, lock::Mutex, select_biased, stream::StreamExt};
use futures_timer::Delay;
use log::{debug, trace};

use crate::constants::*;
use crate::error::*;
use crate::linkdb::{LinkRecord, LinkStorage, MemAddress};
use crate::listener::{Filter, Listener, Listeners};
use crate::message::*;

/// The default duration to wait for [Message] replies. 10 seconds.
pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);

/// Messages a connection can hold for itself before new ones are dropped.
const INBOUND_QUEUE_LEN: usize = 64;

/// Something that puts [Message]s on the INSTEON network and reports the
/// ones that come back through its [Listeners].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message`. Returns once the message has been handed to the
    /// network, not when the device answers.
    async fn write(&self, message: Message) -> Result<(), Error>;

    /// The registry every received message is offered to.
    fn listeners(&self) -> &Arc<Listeners>;
}

/// Settings for a [Connection].
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    /// How long to wait for a reply.
    pub timeout: Duration,
    /// Hop count stamped into every outgoing message, 0 to 3.
    pub ttl: u8,
    /// Commands [Connection::receive] passes to its handler. Empty means all.
    pub filter: Vec<Command>,
    /// Queue length of listeners added with [Connection::add_listener].
    pub queue_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            timeout: DEFAULT_TIMEOUT_DURATION,
            ttl: 3,
            filter: Vec::new(),
            queue_len: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_filter(mut self, filter: Vec<Command>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }
}

/// The generation of INSTEON engine a device runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineVersion {
    I1,
    I2,
    /// I2 with checksummed extended messages. These devices only talk to
    /// modems they are linked to.
    I2Cs,
}

impl TryFrom<u8> for EngineVersion {
    type Error = Error;

    fn try_from(version: u8) -> Result<Self, Self::Error> {
        match version {
            0x00 => Ok(EngineVersion::I1),
            0x01 => Ok(EngineVersion::I2),
            0x02 => Ok(EngineVersion::I2Cs),
            _ => Err(Error::UnexpectedResponse),
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EngineVersion::I1 => "I1",
            EngineVersion::I2 => "I2",
            EngineVersion::I2Cs => "I2Cs",
        };
        f.pad(s)
    }
}

/// What a [Connection::receive] handler wants next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// A session with a single device over a shared [Transport].
///
/// Sends are serialized per connection: a second [Connection::send] waits
/// until the first one has its reply or has timed out. Nothing is retried
/// here; timeouts and NAKs go back to the caller.
pub struct Connection {
    address: Address,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    inbound: Mutex<Listener>,
    engine: parking_lot::Mutex<Option<EngineVersion>>,
}

impl Connection {
    /// Opens a connection to the device at `address`. Fails with
    /// [Error::InvalidTtl] unless the configured ttl is 0 to 3.
    pub fn new(
        transport: Arc<dyn Transport>,
        address: Address,
        config: ConnectionConfig,
    ) -> Result<Connection, Error> {
        if config.ttl > 3 {
            return Err(Error::InvalidTtl(config.ttl));
        }

        let inbound = transport.listeners().add(
            Filter {
                from: Some(address),
                ..Default::default()
            },
            INBOUND_QUEUE_LEN,
        );

        Ok(Connection {
            address,
            config,
            transport,
            inbound: Mutex::new(inbound),
            engine: parking_lot::Mutex::new(None),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Sends `message` to the device and waits for its acknowledgement.
    /// Returns [Error::Nak] if the device refused it and
    /// [Error::AckTimeout] if nothing came back in time.
    pub async fn send(&self, message: Message) -> Result<Message, Error> {
        let mut inbound = self.inbound.lock().await;
        let reply = self
            .exchange(&mut inbound, message, &mut VecDeque::new())
            .await?;
        if reply.is_nak() {
            debug!("{} refused {}", self.address, reply.command);
            return Err(Error::Nak);
        }
        Ok(reply)
    }

    /// Sends `command`, extended when `payload` is not empty, and returns
    /// the command of the acknowledgement.
    pub async fn send_command(&self, command: Command, payload: Vec<u8>) -> Result<Command, Error> {
        let reply = self
            .send(Message::direct(self.address, command, payload))
            .await?;
        Ok(reply.command)
    }

    /// Passes messages from the device to `handler` until it returns
    /// [Flow::Done] or an error. Only commands in the configured filter are
    /// passed. Each handled message restarts the `timeout`; running out of
    /// time is [Error::ReadTimeout].
    pub async fn receive<F>(&self, timeout: Duration, handler: F) -> Result<(), Error>
    where
        F: FnMut(&Message) -> Result<Flow, Error> + Send,
    {
        let filter = &self.config.filter;
        let mut inbound = self.inbound.lock().await;
        self.receive_matching(
            &mut inbound,
            VecDeque::new(),
            timeout,
            |message| {
                filter.is_empty()
                    || filter
                        .iter()
                        .any(|command| command.matches(&message.command))
            },
            handler,
        )
        .await
    }

    /// Subscribes to messages of `message_type` from this device. An empty
    /// `commands` slice means any command.
    pub fn add_listener(&self, message_type: MessageType, commands: &[Command]) -> Listener {
        self.transport.listeners().add(
            Filter {
                from: Some(self.address),
                message_type: Some(message_type),
                commands: commands.to_vec(),
            },
            self.config.queue_len,
        )
    }

    /// Unsubscribes `listener`. Returns false if it was already removed.
    pub fn remove_listener(&self, listener: &Listener) -> bool {
        self.transport.listeners().remove(listener.id())
    }

    /// Asks the device to identify itself. The answer is a set-button
    /// broadcast whose destination bytes hold the device category and the
    /// firmware version.
    pub async fn id_request(&self) -> Result<(FirmwareVersion, DevCat), Error> {
        let mut inbound = self.inbound.lock().await;
        let request = Message::direct(self.address, Command::ID_REQUEST, Vec::new());
        let mut early = VecDeque::new();
        if self.exchange(&mut inbound, request, &mut early).await?.is_nak() {
            return Err(Error::Nak);
        }

        let mut id = None;
        self.receive_matching(
            &mut inbound,
            early,
            self.config.timeout,
            |message| {
                message.is_broadcast()
                    && (Command::SET_BUTTON_PRESSED_RESPONDER.matches(&message.command)
                        || Command::SET_BUTTON_PRESSED_CONTROLLER.matches(&message.command))
            },
            |message| {
                let to = message.to.bytes();
                id = Some((
                    FirmwareVersion(to[2]),
                    DevCat {
                        category: to[0],
                        sub_category: to[1],
                    },
                ));
                Ok(Flow::Done)
            },
        )
        .await?;

        id.ok_or(Error::UnexpectedResponse)
    }

    /// Queries the device's engine version.
    ///
    /// I2Cs devices that are not linked to the modem refuse the query with a
    /// `0xff` NAK. That is reported as [Error::NotLinked] and the connection
    /// remembers the device as I2Cs, see [Connection::cached_engine_version].
    pub async fn engine_version(&self) -> Result<EngineVersion, Error> {
        let reply = {
            let mut inbound = self.inbound.lock().await;
            let request = Message::direct(self.address, Command::GET_ENGINE_VERSION, Vec::new());
            self.exchange(&mut inbound, request, &mut VecDeque::new())
                .await?
        };

        if reply.is_nak() {
            if reply.command.cmd2() == ENGINE_NOT_LINKED {
                debug!("{} is an unlinked I2Cs device", self.address);
                *self.engine.lock() = Some(EngineVersion::I2Cs);
                return Err(Error::NotLinked);
            }
            return Err(Error::Nak);
        }

        let version = EngineVersion::try_from(reply.command.cmd2())?;
        *self.engine.lock() = Some(version);
        Ok(version)
    }

    /// The engine version learned by the last [Connection::engine_version].
    pub fn cached_engine_version(&self) -> Option<EngineVersion> {
        *self.engine.lock()
    }

    /// Sends `message` and waits for the device's ACK or NAK. Anything else
    /// the device says in the meantime is kept in `early`, oldest first, for
    /// a follow-up [Connection::receive_matching].
    async fn exchange(
        &self,
        inbound: &mut Listener,
        mut message: Message,
        early: &mut VecDeque<Message>,
    ) -> Result<Message, Error> {
        while let Ok(Some(stale)) = inbound.try_next() {
            trace!("Discarding {}", stale);
        }

        message.to = self.address;
        message.flags = message.flags.with_hops(self.config.ttl);
        debug!("Sending {}", message);
        self.transport.write(message.clone()).await?;

        let mut timeout = Delay::new(self.config.timeout).fuse();
        loop {
            let reply = select_biased! {
                reply = inbound.next() => reply.ok_or(Error::Disconnected)?,
                _ = timeout => return Err(Error::AckTimeout),
            };

            if reply.is_reply_to(&message) {
                debug!("Received {}", reply);
                return Ok(reply);
            }

            trace!("Holding {}", reply);
            if early.len() == INBOUND_QUEUE_LEN {
                early.pop_front();
            }
            early.push_back(reply);
        }
    }

    async fn receive_matching<A, F>(
        &self,
        inbound: &mut Listener,
        mut early: VecDeque<Message>,
        timeout: Duration,
        accept: A,
        mut handler: F,
    ) -> Result<(), Error>
    where
        A: Fn(&Message) -> bool + Send,
        F: FnMut(&Message) -> Result<Flow, Error> + Send,
    {
        let mut deadline = Delay::new(timeout).fuse();
        loop {
            let message = match early.pop_front() {
                Some(message) => message,
                None => select_biased! {
                    message = inbound.next() => message.ok_or(Error::Disconnected)?,
                    _ = deadline => return Err(Error::ReadTimeout),
                },
            };

            if !accept(&message) {
                trace!("Ignoring {}", message);
                continue;
            }

            debug!("Received {}", message);
            if handler(&message)? == Flow::Done {
                return Ok(());
            }
            deadline = Delay::new(timeout).fuse();
        }
    }
}

fn is_aldb_record(message: &Message) -> bool {
    message.flags.is_extended()
        && message.command.cmd1() == Command::READ_WRITE_ALDB.cmd1()
        && message.payload.len() >= 5 + LINK_RECORD_LEN
        && message.payload[1] == ALDB_RECORD_RESPONSE
}

#[async_trait]
impl LinkStorage for Connection {
    async fn read_links(&self) -> Result<Vec<LinkRecord>, Error> {
        let mut inbound = self.inbound.lock().await;

        let mut request = vec![0u8; EXTENDED_PAYLOAD_LEN];
        request[1] = ALDB_READ;
        let request = Message::direct(self.address, Command::READ_WRITE_ALDB, request);
        let mut early = VecDeque::new();
        if self.exchange(&mut inbound, request, &mut early).await?.is_nak() {
            return Err(Error::Nak);
        }

        let mut links = Vec::new();
        let mut last_address = None;
        self.receive_matching(
            &mut inbound,
            early,
            self.config.timeout,
            is_aldb_record,
            |message| {
                // payload: unused, 0x01, address high, address low, unused, record
                let address = (message.payload[2], message.payload[3]);
                if last_address == Some(address) {
                    trace!("Duplicate record response at {:02x?}", address);
                    return Ok(Flow::Continue);
                }
                last_address = Some(address);

                let record = LinkRecord::from_bytes(&message.payload[5..])?;
                if record.is_end_marker() {
                    return Ok(Flow::Done);
                }
                links.push(record);
                Ok(Flow::Continue)
            },
        )
        .await?;

        Ok(links)
    }

    async fn write_link(&self, address: MemAddress, link: &LinkRecord) -> Result<(), Error> {
        let mut payload = vec![
            0x00,
            ALDB_WRITE,
            address.high(),
            address.low(),
            LINK_RECORD_LEN as u8,
        ];
        payload.extend_from_slice(&link.to_bytes());
        payload.resize(EXTENDED_PAYLOAD_LEN, 0);

        self.send(Message::direct(self.address, Command::READ_WRITE_ALDB, payload))
            .await?;
        Ok(())
    }
}
