//! Serial UART transport driver, for PN532 breakout boards and Arygon
//! readers.
//!
//! Grounded on spec §4.1's wake-up-pulse and post-transmit-delay
//! requirements. `serialport` is the standard real crate for cross-platform
//! serial I/O; nothing in the pack uses it (see DESIGN.md).

use std::thread;
use std::time::Duration;

use serialport::SerialPort;

use crate::error::{ErrorKind, Result};
use crate::transport::{Driver, Transport};

const DEFAULT_BAUD: u32 = 115_200;
/// Fixed short delay the chip needs to start responding at serial line
/// rates; tunable per `ArygonDelay` callers that need it longer.
const POST_TRANSMIT_DELAY: Duration = Duration::from_millis(10);

/// A wake-up GetFirmwareVersion frame (TFI `D4`, command `02`), preceded by
/// a short all-zeros pad, per spec §4.1.
const WAKE_UP_PULSE: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0xff, 0x02, 0xfe, 0xd4];

pub struct UartDriver;

impl Driver for UartDriver {
    fn name(&self) -> &'static str {
        "pn532_uart"
    }

    fn probe(&self) -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }

    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        let (path, baud) = split_port_speed(port)?;

        let mut handle = serialport::new(path, baud)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => ErrorKind::NoDevice,
                _ => ErrorKind::Io,
            })?;

        let _ = handle.write(&WAKE_UP_PULSE);
        thread::sleep(POST_TRANSMIT_DELAY);
        let mut discard = [0u8; 64];
        let _ = handle.read(&mut discard);

        Ok(Box::new(UartTransport { port: handle }))
    }
}

fn split_port_speed(port: &str) -> Result<(&str, u32)> {
    if port.is_empty() {
        return Err(ErrorKind::InvalidArgument);
    }
    match port.split_once(':') {
        Some((path, speed)) => {
            let baud = speed.parse().map_err(|_| ErrorKind::InvalidArgument)?;
            Ok((path, baud))
        }
        None => Ok((port, DEFAULT_BAUD)),
    }
}

pub struct UartTransport {
    port: Box<dyn SerialPort>,
}

impl Transport for UartTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes).map_err(|_| ErrorKind::Io)?;
        thread::sleep(POST_TRANSMIT_DELAY);
        Ok(())
    }

    fn receive(&mut self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port.set_timeout(timeout).map_err(|_| ErrorKind::Io)?;
        match self.port.read(out) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(ErrorKind::Timeout),
            Err(_) => Err(ErrorKind::Io),
        }
    }

    fn abort(&self) {
        // Blocking reads on a serial port cannot be interrupted from another
        // thread without a platform-specific ioctl; the caller's configured
        // `receive` timeout bounds how long this can block.
    }

    fn close(&mut self) {
        // Dropping the boxed port closes the file descriptor.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_port_speed_defaults_baud() {
        assert_eq!(split_port_speed("/dev/ttyUSB0").unwrap(), ("/dev/ttyUSB0", DEFAULT_BAUD));
    }

    #[test]
    fn split_port_speed_parses_explicit_baud() {
        assert_eq!(
            split_port_speed("/dev/ttyUSB0:9600").unwrap(),
            ("/dev/ttyUSB0", 9600)
        );
    }

    #[test]
    fn split_port_speed_rejects_empty() {
        assert!(matches!(split_port_speed(""), Err(ErrorKind::InvalidArgument)));
    }
}
