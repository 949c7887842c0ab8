#![recursion_limit = "256"]

//! A crate for interacting with INSTEON™ home automation devices via
//! an attached PowerLinc Modem.
//!
//! A [Modem] owns the serial port. Devices are reached through
//! [Connection]s opened on it; devices that keep a link database are
//! [Linkable] and can be linked to each other with a [Linker].
//!
//! # Example
//! ```no_run
//! # use std::str::FromStr;
//! # use insteon::{Address, Command, ConnectionConfig, Group, Linker, Modem};
//! # use insteon::Error;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error>  {
//! let modem = Modem::from_path("/dev/ttyUSB0")?;
//!
//! // Turn on the switch with address 11.22.33.
//! let switch = modem.connect(Address::from_str("11.22.33")?, ConnectionConfig::default())?;
//! switch.send_command(Command::LIGHT_ON.sub_command(0xff), Vec::new()).await?;
//!
//! // Make the switch control the lamp module at 44.55.66 on group 1.
//! let switch = modem.open(switch.address(), ConnectionConfig::default()).await?;
//! let lamp = modem.open(Address::from_str("44.55.66")?, ConnectionConfig::default()).await?;
//! if let (Some(switch), Some(lamp)) = (switch.as_linkable(), lamp.as_linkable()) {
//!     Linker::new().link(Group(1), switch, lamp).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod broker;
mod connection;
mod constants;
mod device;
mod error;
mod frame;
mod link;
mod linkdb;
mod listener;
mod message;
mod modem;

#[cfg(test)]
mod testing;

pub use connection::*;
pub use device::*;
pub use error::*;
pub use link::*;
pub use linkdb::*;
pub use listener::{Filter, Listener, ListenerId, Listeners};
pub use message::*;
pub use modem::*;

pub use frame::{AllLinkComplete, AllLinkMode, Frame, FrameCodec, ModemInfo};
