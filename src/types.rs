//! Wire-independent data model: modulations, target descriptors, connection
//! strings and the fixed-size frame buffer every layer bounds its I/O against.

use crate::error::{ErrorKind, Result};

/// Maximum PN53x extended-information-frame payload in initiator mode.
/// Drives every bounds check in the codec and command layers.
pub const MAX_FRAME_PAYLOAD: usize = 264;

/// Stack-allocatable raw frame buffer, sized to the chip's hard limit.
pub type RawFrameBuffer = [u8; MAX_FRAME_PAYLOAD];

/// Chip generation, discovered from `GetFirmwareVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipGeneration {
    Pn531,
    Pn532,
    Pn533,
}

impl ChipGeneration {
    /// True if this generation implements ISO/IEC 14443-B (PN531 does not).
    pub fn supports_iso14443b(self) -> bool {
        !matches!(self, Self::Pn531)
    }
}

/// Modulation type, independent of baud rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulationType {
    Iso14443A,
    Iso14443B,
    Iso14443BI,
    Iso14443B2SR,
    Iso14443B2CT,
    FeliCa,
    Jewel,
    Dep,
}

/// Baud rate, kbps. `Undefined` is used for DEP active-mode polling where the
/// chip picks the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    Undefined,
    B106,
    B212,
    B424,
    B847,
}

/// A `(modulation, baud)` pair, validated against the legal combinations the
/// PN53x supports before anything reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modulation {
    pub modulation_type: ModulationType,
    pub baud_rate: BaudRate,
}

impl Modulation {
    pub fn new(modulation_type: ModulationType, baud_rate: BaudRate) -> Result<Self> {
        use BaudRate::*;
        use ModulationType::*;
        let legal = match modulation_type {
            Iso14443A => matches!(baud_rate, B106),
            Iso14443B | Iso14443BI | Iso14443B2SR | Iso14443B2CT => matches!(baud_rate, B106),
            FeliCa => matches!(baud_rate, B212 | B424),
            Jewel => matches!(baud_rate, B106),
            Dep => matches!(baud_rate, B106 | B212 | B424 | Undefined),
        };
        if legal {
            Ok(Self {
                modulation_type,
                baud_rate,
            })
        } else {
            Err(ErrorKind::InvalidArgument)
        }
    }
}

/// PN53x in-chip modulation/baud code, as used by `InListPassiveTarget` and
/// `InJumpForDEP`'s `BrTy` byte.
pub fn modulation_wire_code(m: Modulation) -> Result<u8> {
    use BaudRate::*;
    use ModulationType::*;
    let code = match (m.modulation_type, m.baud_rate) {
        (Iso14443A, B106) => 0x00,
        (FeliCa, B212) => 0x01,
        (FeliCa, B424) => 0x02,
        (Iso14443B, B106) => 0x03,
        (Jewel, B106) => 0x04,
        (Iso14443BI, B106) => 0x05,
        (Iso14443B2CT, B106) => 0x06,
        (Iso14443B2SR, B106) => 0x07,
        (Dep, B106) => 0x00,
        (Dep, B212) => 0x01,
        (Dep, B424) => 0x02,
        _ => return Err(ErrorKind::InvalidArgument),
    };
    Ok(code)
}

/// UID cascade level, 4/7/10 bytes.
#[derive(Debug, Clone)]
pub enum Uid {
    Single([u8; 4]),
    Double([u8; 7]),
    Triple([u8; 10]),
}

impl Uid {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Single(b) => b,
            Self::Double(b) => b,
            Self::Triple(b) => b,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            4 => Ok(Self::Single(bytes.try_into().unwrap())),
            7 => Ok(Self::Double(bytes.try_into().unwrap())),
            10 => Ok(Self::Triple(bytes.try_into().unwrap())),
            _ => Err(ErrorKind::ProtocolError),
        }
    }
}

/// ISO/IEC 14443-A target info.
#[derive(Debug, Clone)]
pub struct Iso14443A {
    pub atqa: [u8; 2],
    pub sak: u8,
    pub uid: Uid,
    pub ats: Option<Vec<u8>>,
}

/// ISO/IEC 14443-B target info.
#[derive(Debug, Clone)]
pub struct Iso14443B {
    pub pupi: [u8; 4],
    pub application_data: [u8; 4],
    pub protocol_info: [u8; 3],
    pub cid: u8,
}

/// ISO/IEC 14443-B' (type B') target info.
#[derive(Debug, Clone)]
pub struct Iso14443BI {
    pub div: [u8; 4],
    pub ver_log: u8,
    pub config: u8,
    pub atr: Option<Vec<u8>>,
}

/// ISO/IEC 14443-2B SRx target info.
#[derive(Debug, Clone)]
pub struct Iso14443B2SR {
    pub uid: [u8; 8],
}

/// ISO/IEC 14443-2B CTx target info.
#[derive(Debug, Clone)]
pub struct Iso14443B2CT {
    pub uid: [u8; 4],
    pub product_code: u8,
    pub fab_code: u8,
}

/// FeliCa target info.
#[derive(Debug, Clone)]
pub struct Felica {
    pub length: u8,
    pub response_code: u8,
    pub nfcid2: [u8; 8],
    pub pad: [u8; 8],
    pub system_code: [u8; 2],
}

/// Jewel/Topaz target info.
#[derive(Debug, Clone)]
pub struct Jewel {
    pub sens_res: [u8; 2],
    pub id: [u8; 4],
}

/// NFCIP-1 D.E.P. target info.
#[derive(Debug, Clone)]
pub struct Dep {
    pub nfcid3: [u8; 10],
    pub did: u8,
    pub bs: u8,
    pub br: u8,
    pub to: u8,
    pub pp: u8,
    pub general_bytes: Vec<u8>,
}

/// Tagged union over per-modulation target descriptors. The tag is the
/// modulation type; downstream code cannot read a variant that was never set.
#[derive(Debug, Clone)]
pub enum TargetInfo {
    Iso14443A(Iso14443A),
    Iso14443B(Iso14443B),
    Iso14443BI(Iso14443BI),
    Iso14443B2SR(Iso14443B2SR),
    Iso14443B2CT(Iso14443B2CT),
    FeliCa(Felica),
    Jewel(Jewel),
    Dep(Dep),
}

/// A fully decoded target, tagged by the index the chip assigned it
/// (`InListPassiveTarget`'s `Tg` byte).
#[derive(Debug, Clone)]
pub struct Target {
    pub index: u8,
    pub info: TargetInfo,
}

/// A bounded ASCII connection identifier of the form `driver:port[:speed]`.
#[derive(Debug, Clone)]
pub struct ConnString(String);

impl ConnString {
    pub const MAX_LEN: usize = 1024;

    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > Self::MAX_LEN || !s.is_ascii() {
            return Err(ErrorKind::InvalidArgument);
        }
        Ok(Self(s.to_string()))
    }

    pub fn driver(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn rest(&self) -> &str {
        self.0.splitn(2, ':').nth(1).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulation_rejects_illegal_pair() {
        assert!(Modulation::new(ModulationType::Iso14443A, BaudRate::B424).is_err());
        assert!(Modulation::new(ModulationType::FeliCa, BaudRate::B106).is_err());
    }

    #[test]
    fn modulation_accepts_legal_pair() {
        assert!(Modulation::new(ModulationType::Iso14443A, BaudRate::B106).is_ok());
        assert!(Modulation::new(ModulationType::FeliCa, BaudRate::B212).is_ok());
    }

    #[test]
    fn uid_from_bytes_rejects_bad_length() {
        assert!(Uid::from_bytes(&[1, 2, 3]).is_err());
        assert!(Uid::from_bytes(&[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn connstring_splits_driver_and_rest() {
        let cs = ConnString::parse("pn532_uart:/dev/ttyUSB0:115200").unwrap();
        assert_eq!(cs.driver(), "pn532_uart");
        assert_eq!(cs.rest(), "/dev/ttyUSB0:115200");
    }
}
