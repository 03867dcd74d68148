//! Firmware upgrade driver for a BL654-class Bluetooth module bootloader.
//!
//! This crate implements the UWF (Upgrade Wireless Firmware) record
//! interpreter and the small ASCII/binary bootloader protocol it drives:
//! parse the next record, translate it to one or more bootloader
//! transactions, validate the responses, advance session state. See
//! [`session::UpgradeSession`] for the entry point.

pub mod bootmode;
pub mod error;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod uwf;

pub use error::{Error, Result};
pub use profile::{Bl654Profile, DeviceProfile, ErasePlan, GenericProfile};
pub use session::{SessionState, UpgradeSession};
pub use transport::{SerialTransport, Transport};
pub use uwf::{CommandId, UwfReader};
