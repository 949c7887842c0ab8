//! Devices on the INSTEON network and the capabilities they offer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::lock::Mutex;
use log::debug;

use crate::connection::{Connection, EngineVersion};
use crate::constants::*;
use crate::error::*;
use crate::linkdb::{Group, LinkDb, LinkRecord, MemAddress};
use crate::message::{Address, Command};

/// A device reachable through a [Connection].
pub trait Device: fmt::Display + Send + Sync {
    fn address(&self) -> Address;

    fn engine_version(&self) -> EngineVersion;

    fn connection(&self) -> &Connection;

    /// The device's linking capability, if it keeps an all-link database.
    fn as_linkable(&self) -> Option<&dyn Linkable> {
        None
    }
}

/// A device that keeps an all-link database and can be put into linking
/// mode remotely, as if its set button was held.
#[async_trait]
pub trait Linkable: Send + Sync {
    fn address(&self) -> Address;

    async fn enter_linking_mode(&self, group: Group) -> Result<(), Error>;

    async fn enter_unlinking_mode(&self, group: Group) -> Result<(), Error>;

    async fn exit_linking_mode(&self) -> Result<(), Error>;

    /// Reads the link database from the device.
    async fn links(&self) -> Result<Vec<LinkRecord>, Error>;

    async fn add_link(&self, link: LinkRecord) -> Result<MemAddress, Error>;

    async fn remove_link(&self, link: &LinkRecord) -> Result<MemAddress, Error>;
}

/// An I1 device. It predates remote linking and has no readable database.
pub struct I1Device {
    connection: Arc<Connection>,
}

impl I1Device {
    pub fn new(connection: Arc<Connection>) -> I1Device {
        I1Device { connection }
    }
}

impl Device for I1Device {
    fn address(&self) -> Address {
        self.connection.address()
    }

    fn engine_version(&self) -> EngineVersion {
        EngineVersion::I1
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl fmt::Display for I1Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "I1 Device ({})", self.connection.address())
    }
}

/// An I2 or I2Cs device.
pub struct I2Device {
    connection: Arc<Connection>,
    engine: EngineVersion,
    db: Mutex<LinkDb>,
}

impl I2Device {
    pub fn new(connection: Arc<Connection>, engine: EngineVersion) -> I2Device {
        let db = LinkDb::new(connection.clone());
        I2Device {
            connection,
            engine,
            db: Mutex::new(db),
        }
    }
}

impl Device for I2Device {
    fn address(&self) -> Address {
        self.connection.address()
    }

    fn engine_version(&self) -> EngineVersion {
        self.engine
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn as_linkable(&self) -> Option<&dyn Linkable> {
        Some(self)
    }
}

#[async_trait]
impl Linkable for I2Device {
    fn address(&self) -> Address {
        self.connection.address()
    }

    async fn enter_linking_mode(&self, group: Group) -> Result<(), Error> {
        debug!("{} entering linking mode for group {}", self, group);
        match self.engine {
            EngineVersion::I2Cs => {
                // I2Cs devices only accept the extended form.
                self.connection
                    .send_command(
                        Command::ENTER_LINKING_MODE_EXT.sub_command(group.0),
                        vec![0u8; EXTENDED_PAYLOAD_LEN],
                    )
                    .await?;
            }
            _ => {
                self.connection
                    .send_command(Command::ENTER_LINKING_MODE.sub_command(group.0), Vec::new())
                    .await?;
            }
        }
        Ok(())
    }

    async fn enter_unlinking_mode(&self, group: Group) -> Result<(), Error> {
        debug!("{} entering unlinking mode for group {}", self, group);
        self.connection
            .send_command(Command::ENTER_UNLINKING_MODE.sub_command(group.0), Vec::new())
            .await?;
        Ok(())
    }

    async fn exit_linking_mode(&self) -> Result<(), Error> {
        debug!("{} exiting linking mode", self);
        self.connection
            .send_command(Command::EXIT_LINKING_MODE, Vec::new())
            .await?;
        Ok(())
    }

    async fn links(&self) -> Result<Vec<LinkRecord>, Error> {
        let mut db = self.db.lock().await;
        db.refresh().await?;
        Ok(db.links().to_vec())
    }

    async fn add_link(&self, link: LinkRecord) -> Result<MemAddress, Error> {
        let mut db = self.db.lock().await;
        if !db.is_loaded() {
            db.refresh().await?;
        }
        db.add_link(link).await
    }

    async fn remove_link(&self, link: &LinkRecord) -> Result<MemAddress, Error> {
        let mut db = self.db.lock().await;
        if !db.is_loaded() {
            db.refresh().await?;
        }
        db.remove_link(link).await
    }
}

impl fmt::Display for I2Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.engine {
            EngineVersion::I2Cs => "I2Cs",
            _ => "I2",
        };
        write!(f, "{} Device ({})", name, self.connection.address())
    }
}

/// Builds the device type matching `engine`.
pub fn from_engine(connection: Arc<Connection>, engine: EngineVersion) -> Box<dyn Device> {
    match engine {
        EngineVersion::I1 => Box::new(I1Device::new(connection)),
        _ => Box::new(I2Device::new(connection, engine)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::testing::*;
    use std::str::FromStr;

    fn connection(transport: Arc<MockTransport>) -> Arc<Connection> {
        Arc::new(
            Connection::new(
                transport,
                Address::from_str("01.02.03").unwrap(),
                ConnectionConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn capabilities() {
        let transport = MockTransport::silent();
        let i1 = from_engine(connection(transport.clone()), EngineVersion::I1);
        assert!(i1.as_linkable().is_none());
        assert_eq!(i1.to_string(), "I1 Device (01.02.03)");

        let i2 = from_engine(connection(transport), EngineVersion::I2);
        assert!(i2.as_linkable().is_some());
        assert_eq!(i2.to_string(), "I2 Device (01.02.03)");
        assert_eq!(i2.engine_version(), EngineVersion::I2);
    }

    #[async_std::test]
    async fn linking_mode_commands() {
        let transport = MockTransport::new(|request| vec![ack(request, request.command.cmd2())]);

        let i2 = I2Device::new(connection(transport.clone()), EngineVersion::I2);
        i2.enter_linking_mode(Group(3)).await.unwrap();
        let i2cs = I2Device::new(connection(transport.clone()), EngineVersion::I2Cs);
        i2cs.enter_linking_mode(Group(3)).await.unwrap();
        i2cs.enter_unlinking_mode(Group(4)).await.unwrap();
        i2cs.exit_linking_mode().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);

        assert!(!sent[0].flags.is_extended());
        assert_eq!(sent[0].command, Command::standard(0x09, 0x03));

        assert!(sent[1].flags.is_extended());
        assert_eq!(sent[1].command, Command::extended(0x09, 0x03));
        assert_eq!(sent[1].payload.len(), EXTENDED_PAYLOAD_LEN);

        assert_eq!(sent[2].command, Command::standard(0x0a, 0x04));
        assert_eq!(sent[3].command, Command::EXIT_LINKING_MODE);
    }

    #[async_std::test]
    async fn add_link_reads_database_first() {
        let transport = MockTransport::new(|request| {
            let mut replies = vec![ack(request, 0x00)];
            if request.payload.get(1) == Some(&ALDB_READ) {
                replies.push(aldb_record(
                    request.to,
                    MemAddress(0x0fff),
                    &LinkRecord::default(),
                ));
            }
            replies
        });
        let device = I2Device::new(connection(transport.clone()), EngineVersion::I2Cs);

        let responder = Address::from_str("0a.0b.0c").unwrap();
        let record = LinkRecord::controller(Group(1), responder, [0; 3]);
        assert_eq!(device.add_link(record).await, Ok(MemAddress(0x0fff)));
        assert_eq!(device.remove_link(&record).await, Ok(MemAddress(0x0fff)));

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].payload[1], ALDB_READ);
        assert_eq!(sent[1].payload[1], ALDB_WRITE);
        assert_eq!(sent[2].payload[5], 0x42);
    }
}
