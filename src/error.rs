//! Error kinds returned by every layer of the core.
//!
//! Mirrors the PCD error enum the chip-register layer of the teacher codebase
//! returns (`PCDErrorCode`): no `anyhow`, one flat enum, callers match on it.

use core::fmt;

/// Stable error kind for every fallible operation in the crate.
#[derive(Debug)]
pub enum ErrorKind {
    /// No device matched the connection string or bus probe.
    NoDevice,
    /// The transport exists but access was refused (permissions, exclusive lock held elsewhere).
    AccessDenied,
    /// The transport is already claimed by another session.
    Busy,
    /// Caller passed a value the core rejects before touching the wire.
    InvalidArgument,
    /// Transport-level I/O failure (short read, broken pipe, bus reset, ...).
    Io,
    /// The transport did not respond within the requested time.
    Timeout,
    /// A blocking call was unblocked by `abort_command`.
    Aborted,
    /// A frame failed its checksum (LCS or DCS).
    ChecksumError,
    /// Bytes were received that do not parse as a PN53x frame, or a response
    /// arrived with an unexpected TFI / response code.
    ProtocolError,
    /// The chip answered with a non-zero status byte. The code is the raw
    /// PN53x status value (low nibble of the status byte); see GLOSSARY.
    ChipError(u8),
    /// This chip generation does not implement the requested feature.
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no device found"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Busy => write!(f, "device busy"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Io => write!(f, "I/O error"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Aborted => write!(f, "operation aborted"),
            Self::ChecksumError => write!(f, "frame checksum mismatch"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::ChipError(code) => write!(f, "chip error: {}", chip_error_text(*code)),
            Self::NotSupported => write!(f, "not supported by this chip generation"),
        }
    }
}

/// Textual decoder for a PN53x status byte's low nibble.
///
/// Non-exhaustive: unrecognized codes still print, they just fall back to a
/// generic "unknown chip error" message instead of a name.
pub fn chip_error_text(code: u8) -> &'static str {
    match code & 0x3f {
        0x00 => "no error",
        0x01 => "time out, the target has not answered",
        0x02 => "a CRC error has been detected by the CIU",
        0x03 => "a parity error has been detected by the CIU",
        0x04 => "erroneous bit count during anti-collision",
        0x05 => "framing error during MIFARE operation",
        0x06 => "abnormal bit-collision during 106 kbps anti-collision",
        0x07 => "communication buffer size insufficient",
        0x09 => "RF buffer overflow detected by the CIU",
        0x0a => "RF field not switched on in time by the counterpart",
        0x0b => "RF protocol error",
        0x0d => "internal temperature sensor detected overheating",
        0x0e => "internal buffer overflow",
        0x10 => "invalid parameter",
        0x12 => "DEP protocol: unsupported command received from the initiator",
        0x13 => "invalid received frame",
        0x14 => "MIFARE authentication error",
        0x18 => "target or initiator does not support NFC secure",
        0x19 => "I2C bus busy",
        0x23 => "invalid deselect",
        0x25 => "DEP protocol: invalid device state",
        0x26 => "operation not allowed in this configuration",
        0x27 => "command not acceptable in the current context",
        0x29 => "target released",
        0x2a => "ISO14443-3B card ID does not match",
        0x2b => "ISO14443-3B card previously activated has disappeared",
        0x2c => "NFCID3 mismatch in DEP 212/424 kbps passive",
        0x2d => "over-current detected",
        0x2e => "NAD missing in DEP frame",
        0x31 => "not applicable",
        _ => "unknown chip error",
    }
}

impl std::error::Error for ErrorKind {}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, ErrorKind>;
