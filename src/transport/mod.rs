//! Transport driver trait (L0) and the three concrete drivers.
//!
//! Grounded on the teacher's `MfrcDriver` trait (`peripheral/mfrc522/mod.rs`):
//! a narrow capability set a concrete bus implements, used here as a trait
//! object instead of a generic parameter since the registry (`registry.rs`)
//! needs to hold heterogeneous drivers in one list. Drivers are wire-level
//! dumb: they forward bytes and know nothing about PN53x framing.

#[cfg(feature = "pcsc")]
pub mod pcsc;
#[cfg(feature = "uart")]
pub mod uart;
#[cfg(feature = "usb")]
pub mod usb;

use std::time::Duration;

use crate::error::Result;

/// A driver that can enumerate and open devices on one physical bus.
pub trait Driver: Send + Sync {
    /// Short name matching the connection-string grammar, e.g. `"pn53x_usb"`.
    fn name(&self) -> &'static str;

    /// Best-effort enumeration of connection strings this driver could open.
    /// May return an empty list; never fails the process.
    fn probe(&self) -> Vec<String>;

    /// Open a device. `port` is the connection string's tail (everything
    /// after `driver:`), opaque to everyone but this driver.
    fn open(&self, port: &str) -> Result<Box<dyn Transport>>;
}

/// An opened, exclusively-held connection to one chip.
pub trait Transport: Send {
    /// Fire-and-forget write of one opaque byte sequence.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Block up to `timeout` for one reply, writing it into `out` and
    /// returning its length. `Timeout` is a legitimate, non-fatal result.
    fn receive(&mut self, out: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Unblock an in-flight `receive` from another thread without closing.
    fn abort(&self);

    /// Idempotent close; releases bus resources.
    fn close(&mut self);
}
