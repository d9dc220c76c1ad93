//! Chip-abstraction and protocol core for the PN53x family of NFC
//! controllers: transport drivers, frame codec, command layer, bit-frame
//! codec and device facade for initiator and target roles over
//! ISO/IEC 14443-A/B, FeliCa, Jewel/Topaz and NFCIP-1 D.E.P.
//!
//! Layering, leaf to root: [`transport`] (L0) → [`frame`] (L1) →
//! [`command`] (L2) / [`bits`] (L3) → [`device`] (L4), with [`registry`]
//! holding the static list of available transports. [`config`] and
//! [`error`] are used throughout.

pub mod bits;
pub mod chip;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
#[cfg(test)]
pub mod mock_transport;
pub mod registry;
pub mod transport;
pub mod types;

pub use device::{AbortToken, ConfigureOption, Device, TimeoutKind};
pub use error::{ErrorKind, Result};
pub use registry::Registry;
pub use types::{
    BaudRate, ChipGeneration, ConnString, Modulation, ModulationType, Target, TargetInfo, Uid,
};
