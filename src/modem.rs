use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};

use futures::{
    channel::mpsc::UnboundedReceiver, future::FutureExt, select_biased, stream::StreamExt,
};

use futures_timer::Delay;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::broker::*;
use crate::connection::{Connection, ConnectionConfig, Transport};
use crate::constants::EXTENDED_PAYLOAD_LEN;
use crate::device::{self, Device};
use crate::error::*;
use crate::frame::*;
use crate::linkdb::LinkRecord;
use crate::listener::{Filter, Listener, Listeners};
use crate::message::*;

const NUM_RETRIES: u8 = 20;
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// How long to wait for the modem to report a link record.
const LINK_RECORD_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the modem stays in linking mode waiting for a device.
const LINK_TIMEOUT: Duration = Duration::from_secs(240);

/// Messages [Modem::listen] can hold before new ones are dropped.
const LISTEN_QUEUE_LEN: usize = 256;

/// A [Modem] is a connection to an INSTEON Modem. It carries [Connection]s
/// to devices and manages the modem's own links (e.g. [Modem::link_device]).
///
/// Clones share the same underlying port.
#[derive(Clone)]
pub struct Modem {
    broker: Broker,
}

/// Waits on `frames` until `pick` accepts one.
async fn wait_for<T>(
    frames: &mut UnboundedReceiver<Frame>,
    timeout: Duration,
    mut pick: impl FnMut(Frame) -> Option<T>,
) -> Result<T, Error> {
    let mut delay = Delay::new(timeout).fuse();
    let mut waiting = Box::pin(
        async {
            while let Some(frame) = frames.next().await {
                if let Some(found) = pick(frame) {
                    return Ok(found);
                }
            }
            Err(Error::Disconnected)
        }
        .fuse(),
    );

    select_biased! {
        found = waiting => found,
        _ = delay => Err(Error::Timeout),
    }
}

impl Modem {
    /// Constructs a new `Modem` given a path to a serial port
    ///
    /// # Arguments
    /// * `path` - The path to a serial port with an INSTEON modem attached.
    pub fn from_path(path: impl AsRef<Path> + Send + 'static) -> io::Result<Self> {
        debug!("Creating Modem with path {}", path.as_ref().display());

        let broker = Broker::from_path(path)?;

        Ok(Self { broker })
    }

    /// Constructs a new `Modem` from an arbitrary I/O modem
    ///
    /// # Arguments
    /// * `handle` - An async readable, writable modem
    pub fn new(handle: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) -> Modem {
        Self {
            broker: Broker::new(handle),
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<Frame, Error> {
        let mut retries = NUM_RETRIES;
        loop {
            retries -= 1;
            debug!(
                "Sending Frame (attempt {}) {:02x?}",
                NUM_RETRIES - retries,
                frame
            );

            match self.broker.send(frame.clone()).await {
                Ok(response) => return Ok(response),
                Err(Error::NotAcknowledged) if retries > 0 => {
                    warn!("Frame not acknowledged, retrying after {:?}", RETRY_DELAY);
                    Delay::new(RETRY_DELAY).await;
                    continue;
                }
                e => {
                    error!("Failed to send frame, {:02x?}", e);
                    return e;
                }
            }
        }
    }

    /// Retrieve information about the attached modem.
    pub async fn get_info(&self) -> Result<ModemInfo, Error> {
        match self.send_frame(Frame::GetModemInfo).await? {
            Frame::ModemInfo(info) => Ok(info),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Return the link database stored in the modem.
    pub async fn get_links(&self) -> Result<Vec<LinkRecord>, Error> {
        let mut records = Vec::new();
        let mut frames = self.broker.listen()?;

        let mut request = Frame::GetFirstAllLinkRecord;
        loop {
            // The modem NAKs the request once there are no more records.
            match self.broker.send(request).await {
                Ok(_) => {}
                Err(Error::NotAcknowledged) => break,
                Err(e) => return Err(e),
            }

            let record = wait_for(&mut frames, LINK_RECORD_TIMEOUT, |frame| match frame {
                Frame::AllLinkRecord(record) => Some(record),
                _ => None,
            })
            .await?;

            debug!("Got All Link {}", record);
            records.push(record);
            request = Frame::GetNextAllLinkRecord;
        }

        Ok(records)
    }

    /// Listens for every incoming [Message].
    pub fn listen(&self) -> Listener {
        self.broker
            .listeners()
            .add(Filter::default(), LISTEN_QUEUE_LEN)
    }

    /// Link a new device to the modem.
    pub async fn link_device(
        &self,
        address: Option<Address>,
        mode: AllLinkMode,
        group: u8,
    ) -> Result<AllLinkComplete, Error> {
        // Ensure we're not in some prior linking mode
        self.send_frame(Frame::CancelAllLink).await?;

        // We need to listen for some frames
        let mut frames = self.broker.listen()?;

        // If we have an address, ask the device to enter linking mode
        let connection = match address {
            Some(address) => {
                let connection = self.connect(address, ConnectionConfig::default())?;
                connection
                    .send_command(
                        Command::ENTER_LINKING_MODE_EXT.sub_command(group),
                        vec![0u8; EXTENDED_PAYLOAD_LEN],
                    )
                    .await?;
                Some(connection)
            }
            None => None,
        };

        self.send_frame(Frame::StartAllLink { mode, group }).await?;

        let result = wait_for(&mut frames, LINK_TIMEOUT, |frame| match frame {
            Frame::AllLinkComplete(info) => Some(info),
            _ => None,
        })
        .await;

        // We don't need to listen anymore
        drop(frames);

        if let Some(connection) = connection {
            // We don't really care if it worked or not
            let _ = connection
                .send_command(Command::EXIT_LINKING_MODE, Vec::new())
                .await;
        }

        // Ensure we exit linking mode
        let _ = self.send_frame(Frame::CancelAllLink).await;
        result
    }

    /// Opens a [Connection] to the device at `address`.
    pub fn connect(&self, address: Address, config: ConnectionConfig) -> Result<Connection, Error> {
        Connection::new(Arc::new(self.clone()), address, config)
    }

    /// Connects to `address` and asks for its engine version to pick the
    /// right [Device]. Unlinked I2Cs devices fail with [Error::NotLinked].
    pub async fn open(
        &self,
        address: Address,
        config: ConnectionConfig,
    ) -> Result<Box<dyn Device>, Error> {
        let connection = Arc::new(self.connect(address, config)?);
        let engine = connection.engine_version().await?;
        Ok(device::from_engine(connection, engine))
    }
}

#[async_trait]
impl Transport for Modem {
    async fn write(&self, message: Message) -> Result<(), Error> {
        self.send_frame(Frame::InsteonSend(message)).await?;
        Ok(())
    }

    fn listeners(&self) -> &Arc<Listeners> {
        self.broker.listeners()
    }
}
