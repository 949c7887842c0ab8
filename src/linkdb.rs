//! The all-link database: a device's table of 8 byte link records.
//!
//! Records live at fixed memory addresses counting down from `0x0fff` in steps
//! of 8. A record is deleted by clearing its in-use bit in place, so slots are
//! never compacted and no other record ever moves.

use std::{convert::TryFrom, fmt, sync::Arc};

use async_trait::async_trait;
use bitflags::bitflags;
use log::debug;

use crate::constants::*;
use crate::error::*;
use crate::message::Address;

bitflags! {
    /// Control flags of a link record.
    pub struct RecordControlFlags: u8 {
        /// Cleared when the record has been deleted and the slot is available.
        const IN_USE         = (1 << 7);
        /// When present, the device is the controller of the link. If absent,
        /// it is a responder.
        const IS_CONTROLLER  = (1 << 6);
        /// Bits 5 to 2 are product specific. They are carried through
        /// unchanged.
        const PRODUCT        = 0b0011_1100;
        /// Cleared only on the record that marks the end of the table.
        const HAS_BEEN_USED  = (1 << 1);
        const UNUSED         = (1 << 0);
        const NONE           = 0u8;
    }
}

impl Default for RecordControlFlags {
    fn default() -> Self {
        RecordControlFlags::NONE
    }
}

impl RecordControlFlags {
    pub fn in_use(&self) -> bool {
        self.contains(RecordControlFlags::IN_USE)
    }

    pub fn available(&self) -> bool {
        !self.in_use()
    }

    pub fn controller(&self) -> bool {
        self.contains(RecordControlFlags::IS_CONTROLLER)
    }

    pub fn responder(&self) -> bool {
        !self.controller()
    }

    pub fn set_available(&mut self) {
        self.remove(RecordControlFlags::IN_USE);
    }
}

impl fmt::Display for RecordControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let usage = if self.in_use() { "U" } else { "A" };
        let role = if self.controller() { "C" } else { "R" };
        write!(f, "{}{}", usage, role)
    }
}

/// An all-link group number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Group(pub u8);

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Group {
    fn from(group: u8) -> Self {
        Group(group)
    }
}

/// The memory address of a record inside a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemAddress(pub u16);

impl MemAddress {
    /// The address of the `index`th record of a table.
    pub fn for_slot(index: usize) -> Result<MemAddress, Error> {
        if index >= MAX_LINK_RECORDS {
            return Err(Error::LinkDbFull);
        }
        Ok(MemAddress(
            FIRST_RECORD_ADDRESS - (index * LINK_RECORD_LEN) as u16,
        ))
    }

    pub fn high(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn low(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Display for MemAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}.{:02x}", self.high(), self.low())
    }
}

/// A single record in a link database.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinkRecord {
    pub flags: RecordControlFlags,
    pub group: Group,
    pub address: Address,
    /// Device specific data, e.g. the on-level for a responder.
    pub data: [u8; 3],
}

impl LinkRecord {
    /// An in-use record making the owner a controller of `address` for `group`.
    pub fn controller(group: Group, address: Address, data: [u8; 3]) -> LinkRecord {
        LinkRecord {
            flags: RecordControlFlags::IN_USE
                | RecordControlFlags::IS_CONTROLLER
                | RecordControlFlags::HAS_BEEN_USED,
            group,
            address,
            data,
        }
    }

    /// An in-use record making the owner a responder to `address` for `group`.
    pub fn responder(group: Group, address: Address, data: [u8; 3]) -> LinkRecord {
        LinkRecord {
            flags: RecordControlFlags::IN_USE | RecordControlFlags::HAS_BEEN_USED,
            group,
            address,
            data,
        }
    }

    /// Two records are equivalent when usage, role, group and address agree.
    /// The data bytes are ignored.
    pub fn equivalent(&self, other: &LinkRecord) -> bool {
        self.flags.in_use() == other.flags.in_use()
            && self.flags.controller() == other.flags.controller()
            && self.group == other.group
            && self.address == other.address
    }

    /// True for the record that terminates a device's table: its flags
    /// byte is zero.
    pub fn is_end_marker(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn to_bytes(&self) -> [u8; LINK_RECORD_LEN] {
        let address = self.address.bytes();
        [
            self.flags.bits(),
            self.group.0,
            address[0],
            address[1],
            address[2],
            self.data[0],
            self.data[1],
            self.data[2],
        ]
    }

    pub fn from_bytes(buf: &[u8]) -> Result<LinkRecord, Error> {
        if buf.len() < LINK_RECORD_LEN {
            return Err(Error::FrameTooShort {
                expected: LINK_RECORD_LEN,
                got: buf.len(),
            });
        }

        Ok(LinkRecord {
            flags: RecordControlFlags::from_bits_truncate(buf[0]),
            group: Group(buf[1]),
            address: Address::try_from(&buf[2..5])?,
            data: [buf[5], buf[6], buf[7]],
        })
    }
}

impl fmt::Display for LinkRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} 0x{:02x} 0x{:02x} 0x{:02x}",
            self.flags, self.group, self.address, self.data[0], self.data[1], self.data[2]
        )
    }
}

/// Finds the first in-use record with the given role, address and group.
pub fn find_link(
    links: &[LinkRecord],
    controller: bool,
    address: Address,
    group: Group,
) -> Option<&LinkRecord> {
    let wanted = if controller {
        LinkRecord::controller(group, address, [0; 3])
    } else {
        LinkRecord::responder(group, address, [0; 3])
    };
    links.iter().find(|link| link.equivalent(&wanted))
}

/// Reads and writes the link table stored in a device.
#[async_trait]
pub trait LinkStorage: Send + Sync {
    /// Reads the whole table, in memory order, without the end marker.
    async fn read_links(&self) -> Result<Vec<LinkRecord>, Error>;

    /// Writes one record at `address`.
    async fn write_link(&self, address: MemAddress, link: &LinkRecord) -> Result<(), Error>;
}

/// The in-memory mirror of a device's link table. Each change is written to
/// the device as it happens.
pub struct LinkDb {
    storage: Arc<dyn LinkStorage>,
    links: Vec<LinkRecord>,
    loaded: bool,
}

impl LinkDb {
    pub fn new(storage: Arc<dyn LinkStorage>) -> LinkDb {
        LinkDb {
            storage,
            links: Vec::new(),
            loaded: false,
        }
    }

    /// The records in memory order. Empty until [LinkDb::refresh] has run.
    pub fn links(&self) -> &[LinkRecord] {
        &self.links
    }

    /// Whether the table has been read from the device.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Replaces the in-memory table with a full read from the device.
    pub async fn refresh(&mut self) -> Result<(), Error> {
        let links = self.storage.read_links().await?;
        debug!("Read {} link records", links.len());
        self.links = links;
        self.loaded = true;
        Ok(())
    }

    /// Adds `link`, reusing the first available slot or appending a new one.
    /// Returns the memory address the record was written to. Memory is only
    /// updated once the device accepted the write; on error the device may
    /// or may not hold the record.
    pub async fn add_link(&mut self, link: LinkRecord) -> Result<MemAddress, Error> {
        let index = self
            .links
            .iter()
            .position(|l| l.flags.available())
            .unwrap_or_else(|| self.links.len());
        let address = MemAddress::for_slot(index)?;

        debug!("Writing link {} at {}", link, address);
        self.storage.write_link(address, &link).await?;

        if index < self.links.len() {
            self.links[index] = link;
        } else {
            self.links.push(link);
        }
        Ok(address)
    }

    /// Marks the first record equivalent to `link` as available and writes it
    /// back in place.
    pub async fn remove_link(&mut self, link: &LinkRecord) -> Result<MemAddress, Error> {
        let index = self
            .links
            .iter()
            .position(|l| l.equivalent(link))
            .ok_or(Error::LinkNotFound)?;
        let address = MemAddress::for_slot(index)?;

        let mut removed = self.links[index];
        removed.flags.set_available();

        debug!("Removing link {} at {}", removed, address);
        self.storage.write_link(address, &removed).await?;
        self.links[index] = removed;
        Ok(address)
    }

    /// Finds the first in-use record with the given role, address and group.
    pub fn find(
        &self,
        controller: bool,
        address: Address,
        group: Group,
    ) -> Result<&LinkRecord, Error> {
        find_link(&self.links, controller, address, group).ok_or(Error::LinkNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    #[derive(Default)]
    struct MemoryStorage {
        records: Mutex<BTreeMap<MemAddress, LinkRecord>>,
        writes: Mutex<Vec<MemAddress>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl LinkStorage for MemoryStorage {
        async fn read_links(&self) -> Result<Vec<LinkRecord>, Error> {
            // highest address first
            Ok(self.records.lock().values().rev().cloned().collect())
        }

        async fn write_link(&self, address: MemAddress, link: &LinkRecord) -> Result<(), Error> {
            if self.fail_writes {
                return Err(Error::AckTimeout);
            }
            self.writes.lock().push(address);
            self.records.lock().insert(address, *link);
            Ok(())
        }
    }

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    fn link_db() -> (Arc<MemoryStorage>, LinkDb) {
        let storage = Arc::new(MemoryStorage::default());
        let db = LinkDb::new(storage.clone());
        (storage, db)
    }

    #[test]
    fn record_bytes() {
        let record = LinkRecord::controller(Group(1), addr("01.02.03"), [0x04, 0x05, 0x06]);
        let bytes = record.to_bytes();
        assert_eq!(bytes, [0xc2, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(LinkRecord::from_bytes(&bytes), Ok(record));
    }

    #[test]
    fn end_marker_needs_a_zero_flags_byte() {
        let end = LinkRecord::from_bytes(&[0x00; 8]).unwrap();
        assert!(end.is_end_marker());

        for &flags in [0x01u8, 0x02, 0x20, 0x3c].iter() {
            let record = LinkRecord::from_bytes(&[flags, 0, 0, 0, 0, 0, 0, 0]).unwrap();
            assert!(!record.is_end_marker(), "{:02x}", flags);
            assert_eq!(record.to_bytes()[0], flags);
        }
    }

    #[test]
    fn record_too_short() {
        assert_eq!(
            LinkRecord::from_bytes(&[0u8; 7]),
            Err(Error::FrameTooShort {
                expected: 8,
                got: 7
            })
        );
    }

    #[test]
    fn record_display() {
        let mut record = LinkRecord::responder(Group(1), addr("01.02.03"), [0xff, 0x1c, 0x01]);
        assert_eq!(record.to_string(), "UR 1 01.02.03 0xff 0x1c 0x01");
        record.flags.set_available();
        record.flags.insert(RecordControlFlags::IS_CONTROLLER);
        assert_eq!(record.flags.to_string(), "AC");
    }

    #[test]
    fn equivalence_ignores_data() {
        let a = LinkRecord::controller(Group(1), addr("01.02.03"), [1, 2, 3]);
        let b = LinkRecord::controller(Group(1), addr("01.02.03"), [4, 5, 6]);
        assert!(a.equivalent(&b));
        assert_ne!(a, b);

        let responder = LinkRecord::responder(Group(1), addr("01.02.03"), [1, 2, 3]);
        assert!(!a.equivalent(&responder));

        let other_group = LinkRecord::controller(Group(2), addr("01.02.03"), [1, 2, 3]);
        assert!(!a.equivalent(&other_group));
    }

    #[test]
    fn mem_address() {
        assert_eq!(MemAddress::for_slot(0), Ok(MemAddress(0x0fff)));
        assert_eq!(MemAddress::for_slot(2), Ok(MemAddress(0x0fef)));
        assert_eq!(MemAddress(0x0fef).to_string(), "0f.ef");
        assert_eq!(MemAddress::for_slot(MAX_LINK_RECORDS), Err(Error::LinkDbFull));
    }

    #[async_std::test]
    async fn add_appends_at_descending_addresses() {
        let (storage, mut db) = link_db();
        let first = db
            .add_link(LinkRecord::controller(Group(1), addr("01.02.03"), [0; 3]))
            .await
            .unwrap();
        let second = db
            .add_link(LinkRecord::responder(Group(1), addr("04.05.06"), [0; 3]))
            .await
            .unwrap();

        assert_eq!(first, MemAddress(0x0fff));
        assert_eq!(second, MemAddress(0x0ff7));
        assert_eq!(db.links().len(), 2);
        assert_eq!(*storage.writes.lock(), vec![first, second]);
    }

    #[async_std::test]
    async fn add_reuses_available_slot() {
        let (storage, mut db) = link_db();
        let first = LinkRecord::controller(Group(1), addr("01.02.03"), [0; 3]);
        let second = LinkRecord::responder(Group(1), addr("04.05.06"), [0; 3]);
        db.add_link(first).await.unwrap();
        db.add_link(second).await.unwrap();

        let removed = db.remove_link(&first).await.unwrap();
        assert_eq!(removed, MemAddress(0x0fff));
        assert!(db.links()[0].flags.available());
        assert!(db.links()[1].flags.in_use());

        let third = LinkRecord::controller(Group(2), addr("07.08.09"), [0; 3]);
        let address = db.add_link(third).await.unwrap();
        assert_eq!(address, MemAddress(0x0fff));
        assert_eq!(db.links(), &[third, second]);
        assert_eq!(storage.records.lock().get(&MemAddress(0x0fff)), Some(&third));
    }

    #[async_std::test]
    async fn remove_keeps_other_addresses() {
        let (storage, mut db) = link_db();
        let records: Vec<LinkRecord> = (1..=3)
            .map(|g| LinkRecord::responder(Group(g), addr("01.02.03"), [0; 3]))
            .collect();
        for record in &records {
            db.add_link(*record).await.unwrap();
        }

        let address = db.remove_link(&records[1]).await.unwrap();
        assert_eq!(address, MemAddress(0x0ff7));
        assert_eq!(db.links().len(), 3);
        assert_eq!(db.links()[2], records[2]);

        db.refresh().await.unwrap();
        assert_eq!(db.links().len(), 3);
        assert!(db.links()[1].flags.available());
        assert_eq!(storage.writes.lock().len(), 4);
    }

    #[async_std::test]
    async fn remove_missing_link() {
        let (_, mut db) = link_db();
        let record = LinkRecord::responder(Group(1), addr("01.02.03"), [0; 3]);
        assert_eq!(db.remove_link(&record).await, Err(Error::LinkNotFound));
    }

    #[async_std::test]
    async fn failed_write_leaves_memory_alone() {
        let storage = Arc::new(MemoryStorage {
            fail_writes: true,
            ..Default::default()
        });
        let mut db = LinkDb::new(storage);
        let record = LinkRecord::responder(Group(1), addr("01.02.03"), [0; 3]);
        assert_eq!(db.add_link(record).await, Err(Error::AckTimeout));
        assert!(db.links().is_empty());
    }

    #[async_std::test]
    async fn find_skips_deleted_records() {
        let (_, mut db) = link_db();
        let record = LinkRecord::controller(Group(1), addr("01.02.03"), [0; 3]);
        db.add_link(record).await.unwrap();
        assert_eq!(db.find(true, addr("01.02.03"), Group(1)), Ok(&record));
        assert_eq!(
            db.find(false, addr("01.02.03"), Group(1)),
            Err(Error::LinkNotFound)
        );

        db.remove_link(&record).await.unwrap();
        assert_eq!(
            db.find(true, addr("01.02.03"), Group(1)),
            Err(Error::LinkNotFound)
        );
    }
}
