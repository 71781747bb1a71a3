//! MODIS instrument secondary header and payload checksum.
//!
//! Every MODIS packet payload starts with a 12-byte secondary header carrying the
//! packet time and classification, and ends with a 12-bit checksum computed over the
//! 12-bit samples between them.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::spacepacket::{Apid, Packet};
use crate::timecode::Timestamp;
use crate::{Error, Result};

/// Lowest MODIS APID.
pub const APID_MIN: Apid = 64;
/// Highest MODIS APID.
pub const APID_MAX: Apid = 127;

/// Returns true if `apid` is in the MODIS APID range.
#[must_use]
pub fn is_modis_apid(apid: Apid) -> bool {
    (APID_MIN..=APID_MAX).contains(&apid)
}

/// Packet classification from the secondary header.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    Day,
    Night,
    Engineering1,
    Engineering2,
    /// Any code not assigned by the instrument.
    Other(u8),
}

impl PacketType {
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Day,
            1 => Self::Night,
            2 => Self::Engineering1,
            4 => Self::Engineering2,
            x => Self::Other(x),
        }
    }

    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Day => 0,
            Self::Night => 1,
            Self::Engineering1 => 2,
            Self::Engineering2 => 4,
            Self::Other(x) => *x,
        }
    }

    #[must_use]
    pub fn is_engineering(&self) -> bool {
        matches!(self, Self::Engineering1 | Self::Engineering2)
    }
}

/// Source of the data in a packet.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    EarthView,
    Calibration,
}

/// MODIS secondary header.
///
/// Decoded from the first 12 and the last 2 bytes of a packet payload.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SecondaryHeader {
    /// Days since 1958-01-01.
    pub day: u16,
    /// Milliseconds of day.
    pub millis: u32,
    /// Microseconds of millisecond.
    pub micros: u16,
    pub quicklook: bool,
    pub packet_type: PacketType,
    pub scan_count: u8,
    pub mirror_side: u8,
    pub source: Source,
    /// 0 for engineering data, otherwise the sample count (1 to 1354).
    pub sample_id: u16,
    /// FPA/AEM configuration bits.
    pub config: u16,
    pub state: bool,
    pub abnormal: bool,
    /// Checksum value stored in the last 12 bits of the payload.
    pub checksum: u16,
}

impl SecondaryHeader {
    /// Size of the header at the start of the payload.
    pub const LEN: usize = 12;
    /// Smallest payload that holds both the header and the trailing checksum.
    pub const MIN_PAYLOAD_LEN: usize = Self::LEN + 2;

    /// Decode from packet payload bytes.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `payload` is shorter than
    /// [SecondaryHeader::MIN_PAYLOAD_LEN].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::MIN_PAYLOAD_LEN {
            return Err(Error::NotEnoughData {
                actual: payload.len(),
                minimum: Self::MIN_PAYLOAD_LEN,
            });
        }
        let buf = payload;
        let len = payload.len();

        Ok(SecondaryHeader {
            day: u16::from_be_bytes([buf[0], buf[1]]),
            millis: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            micros: u16::from_be_bytes([buf[6], buf[7]]),
            quicklook: buf[8] >> 7 & 0x1 == 1,
            packet_type: PacketType::from_code(buf[8] >> 4 & 0x7),
            scan_count: buf[8] >> 1 & 0x7,
            mirror_side: buf[8] & 0x1,
            source: if buf[9] >> 7 & 0x1 == 0 {
                Source::EarthView
            } else {
                Source::Calibration
            },
            sample_id: u16::from(buf[9] & 0x7f) << 4 | u16::from(buf[10] >> 4),
            config: u16::from(buf[10] & 0x0f) << 6 | u16::from(buf[11] >> 2),
            state: buf[11] >> 1 & 0x1 == 1,
            abnormal: buf[11] & 0x1 == 1,
            checksum: u16::from(buf[len - 2] & 0x0f) << 8 | u16::from(buf[len - 1]),
        })
    }

    /// Encode the 12 header bytes. The checksum lives at the end of the payload and is
    /// not included, see [set_checksum].
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..2].copy_from_slice(&self.day.to_be_bytes());
        buf[2..6].copy_from_slice(&self.millis.to_be_bytes());
        buf[6..8].copy_from_slice(&self.micros.to_be_bytes());
        buf[8] = u8::from(self.quicklook) << 7
            | (self.packet_type.code() & 0x7) << 4
            | (self.scan_count & 0x7) << 1
            | (self.mirror_side & 0x1);
        let source = match self.source {
            Source::EarthView => 0,
            Source::Calibration => 1,
        };
        buf[9] = source << 7 | ((self.sample_id >> 4) & 0x7f) as u8;
        buf[10] = ((self.sample_id & 0x0f) as u8) << 4 | ((self.config >> 6) & 0x0f) as u8;
        buf[11] = ((self.config & 0x3f) as u8) << 2
            | u8::from(self.state) << 1
            | u8::from(self.abnormal);
        buf
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.day, self.millis, self.micros)
    }
}

/// Number of 12-bit samples covered by the checksum of a payload of `payload_len`
/// bytes.
///
/// This is `floor((payload_len - 12) / 1.5) - 1`, where the `- 1` excludes the
/// checksum field itself. Returns 0 for payloads too short to hold any samples.
#[must_use]
pub fn sample_count(payload_len: usize) -> usize {
    (payload_len.saturating_sub(SecondaryHeader::LEN) * 2 / 3).saturating_sub(1)
}

/// Compute the 12-bit checksum of `n` 12-bit samples packed 2 per 3 bytes in `buf`.
///
/// The samples are summed, then the sum is shifted right by 4 and masked to 12 bits.
///
/// # Panics
/// If `buf` holds fewer than `n` samples.
#[must_use]
pub fn checksum12(buf: &[u8], n: usize) -> u16 {
    let mut sum: u64 = 0;
    for idx in 0..n {
        let b = 3 * (idx / 2);
        let sample = if idx % 2 == 0 {
            u64::from(buf[b]) << 4 | u64::from(buf[b + 1] >> 4)
        } else {
            u64::from(buf[b + 1] & 0x0f) << 8 | u64::from(buf[b + 2])
        };
        sum += sample;
    }
    ((sum >> 4) & 0xfff) as u16
}

/// Compute the checksum of `payload` and write it to the last 12 bits of the payload,
/// leaving the upper nibble of the second to last byte untouched.
///
/// # Errors
/// [Error::NotEnoughData] if `payload` is shorter than
/// [SecondaryHeader::MIN_PAYLOAD_LEN].
pub fn set_checksum(payload: &mut [u8]) -> Result<u16> {
    let len = payload.len();
    if len < SecondaryHeader::MIN_PAYLOAD_LEN {
        return Err(Error::NotEnoughData {
            actual: len,
            minimum: SecondaryHeader::MIN_PAYLOAD_LEN,
        });
    }
    let checksum = checksum12(&payload[SecondaryHeader::LEN..], sample_count(len));
    payload[len - 2] = (payload[len - 2] & 0xf0) | (checksum >> 8) as u8;
    payload[len - 1] = (checksum & 0xff) as u8;
    Ok(checksum)
}

/// A MODIS [Packet] with its decoded [SecondaryHeader] and checksum verdict.
#[derive(Debug, Clone)]
pub struct ModisPacket {
    pub packet: Packet,
    pub header: SecondaryHeader,
    /// Checksum computed over the packet samples.
    pub computed_checksum: u16,
}

impl ModisPacket {
    /// Decode the secondary header of `packet` and verify its checksum.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if the payload is too short for the secondary header. Such
    /// a packet cannot be valid; callers are expected to count or discard it.
    pub fn decode(packet: Packet) -> Result<Self> {
        let payload = packet.payload();
        let header = SecondaryHeader::decode(payload)?;
        let computed_checksum = checksum12(
            &payload[SecondaryHeader::LEN..],
            sample_count(payload.len()),
        );
        Ok(ModisPacket {
            packet,
            header,
            computed_checksum,
        })
    }

    /// True if the computed checksum matches the one stored in the packet.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.computed_checksum == self.header.checksum
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.header.timestamp()
    }
}
