//! Driver registry: a read-only list of transport drivers, the only truly
//! global state in the core (per spec §9's "Global state" design note).
//!
//! Grounded on the teacher's driver-selection shape in `main.rs` (a fixed
//! set of peripherals wired up once at startup), generalized from one
//! concrete peripheral to a trait-object list so new drivers plug in without
//! touching the device facade.

use crate::error::{ErrorKind, Result};
#[cfg(feature = "pcsc")]
use crate::transport::pcsc::PcscDriver;
#[cfg(feature = "uart")]
use crate::transport::uart::UartDriver;
#[cfg(feature = "usb")]
use crate::transport::usb::UsbDriver;
use crate::transport::{Driver, Transport};
use crate::types::ConnString;

/// The static, read-only set of drivers this build was compiled with.
pub struct Registry {
    drivers: Vec<Box<dyn Driver>>,
}

impl Registry {
    /// Build the registry with every driver enabled at compile time.
    pub fn new() -> Self {
        let mut drivers: Vec<Box<dyn Driver>> = Vec::new();
        #[cfg(feature = "usb")]
        drivers.push(Box::new(UsbDriver));
        #[cfg(feature = "pcsc")]
        drivers.push(Box::new(PcscDriver));
        #[cfg(feature = "uart")]
        drivers.push(Box::new(UartDriver));
        Self { drivers }
    }

    /// Best-effort enumeration across every registered driver, as
    /// `driver:port` connection strings.
    pub fn list(&self) -> Vec<String> {
        self.drivers
            .iter()
            .flat_map(|d| {
                d.probe()
                    .into_iter()
                    .map(move |port| format!("{}:{}", d.name(), port))
            })
            .collect()
    }

    /// Open the first connection string that resolves to a live device,
    /// trying every registered driver's probe results in order.
    pub fn pick_first(&self) -> Result<Box<dyn Transport>> {
        for driver in &self.drivers {
            for port in driver.probe() {
                match driver.open(&port) {
                    Ok(transport) => {
                        log::info!("opened {}:{port}", driver.name());
                        return Ok(transport);
                    }
                    Err(e) => log::debug!("{}:{port} failed to open: {e}", driver.name()),
                }
            }
        }
        Err(ErrorKind::NoDevice)
    }

    /// Open a specific connection string, dispatching on its driver prefix.
    pub fn open(&self, conn: &ConnString) -> Result<Box<dyn Transport>> {
        let driver = self
            .drivers
            .iter()
            .find(|d| d.name() == conn.driver())
            .ok_or(ErrorKind::NoDevice)?;
        driver.open(conn.rest())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
