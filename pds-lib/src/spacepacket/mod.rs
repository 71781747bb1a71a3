mod merge;
mod source;
mod summary;

use std::cmp::Ordering;
use std::fmt::Display;
use std::io::{self, ErrorKind, Read};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

pub use merge::{Candidate, Cursor, MergeSummary, Merger};
pub use source::{CandidateFilter, PacketSource, ReaderSource, SourceStats, ThreadedSource};
pub use summary::{summarize, ChannelStats, PacketTypeCounts, Summarized, Summary};

pub type Apid = u16;

/// Packet represents a single space packet as read from a PDS file.
///
/// `data` holds the complete frame, i.e., the primary header bytes followed by the
/// payload, exactly as read. Packets are never modified, so writing `data` reproduces
/// the original frame.
///
/// # Example
/// Decode a packet from the minimum number of bytes.
/// ```
/// use pds::Packet;
///
/// let dat: &[u8] = &[
///     // primary header bytes
///     0x08, 0x40, 0xc0, 0x05, 0x0, 0x0,
///     // single byte of payload
///     0xff,
/// ];
/// let packet = Packet::decode(dat).unwrap();
/// assert_eq!(packet.header.apid, 64);
/// assert_eq!(packet.payload(), &[0xff]);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// All packets have a primary header
    pub header: PrimaryHeader,
    /// All packet bytes, including header and payload
    pub data: Vec<u8>,
    /// Byte offset of the start of this packet in its source.
    pub offset: usize,
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{header: {:?}, data:[len={}], offset={}}}",
            self.header,
            self.data.len(),
            self.offset
        )
    }
}

impl Packet {
    /// Decode from bytes. Returns `None` if the header cannot be decoded or if there are
    /// not enough bytes for the payload length indicated by the header. Bytes beyond the
    /// declared length are ignored.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Packet> {
        let header = PrimaryHeader::decode(dat).ok()?;
        if dat.len() < header.frame_len() {
            return None;
        }
        Some(Packet {
            header,
            data: dat[..header.frame_len()].to_vec(),
            offset: 0,
        })
    }

    /// The packet bytes following the primary header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[PrimaryHeader::LEN..]
    }
}

/// CCSDS Primary Header
///
/// The primary header format is common to all CCSDS space packets.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    pub sequence_flags: u8,
    pub sequence_id: u16,
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of a ``PrimaryHeader``
    pub const LEN: usize = 6;
    pub const SEQ_MAX: u16 = 16383;
    /// Sequence counts wrap at this value.
    pub const SEQ_MODULUS: u16 = 16384;

    /// Read header from `r`.
    ///
    /// # Errors
    /// [Error::Io] reading, or any error from [PrimaryHeader::decode].
    pub fn read<R>(mut r: R) -> Result<PrimaryHeader>
    where
        R: Read,
    {
        let mut buf = [0u8; Self::LEN];
        r.read_exact(&mut buf)?;
        Self::decode(&buf)
    }

    /// Decode from bytes.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if there are fewer than [PrimaryHeader::LEN] bytes, and
    /// [Error::UnsupportedVersion] if the version is not 0. The latter indicates stream
    /// corruption rather than the end of input.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: Self::LEN,
            });
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        let version = (d1 >> 13 & 0x7) as u8;
        if version != 0 {
            return Err(Error::UnsupportedVersion {
                version,
                len_minus1: d3,
            });
        }

        Ok(PrimaryHeader {
            version,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Encode to bytes. Fields wider than their wire width are masked.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let d1 = (u16::from(self.version) & 0x7) << 13
            | (u16::from(self.type_flag) & 0x1) << 12
            | u16::from(self.has_secondary_header) << 11
            | (self.apid & 0x7ff);
        let d2 = (u16::from(self.sequence_flags) & 0x3) << 14 | (self.sequence_id & 0x3fff);
        let [a, b] = d1.to_be_bytes();
        let [c, d] = d2.to_be_bytes();
        let [e, f] = self.len_minus1.to_be_bytes();
        [a, b, c, d, e, f]
    }

    /// Number of payload bytes following the header.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.len_minus1 as usize + 1
    }

    /// Total number of bytes in the packet, header included.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        Self::LEN + self.payload_len()
    }
}

/// Calculate the number of missing sequence ids.
///
/// `cur` is the current sequence id. `last` is the sequence id seen before `cur`. The
/// result is `(cur - last - 1) mod 16384`, so [PrimaryHeader::SEQ_MAX] means `cur == last`,
/// which is most likely a duplicate packet rather than a full wrap of missing packets.
#[must_use]
pub fn missing_packets(cur: u16, last: u16) -> u16 {
    let modulus = u32::from(PrimaryHeader::SEQ_MODULUS);
    let cur = u32::from(cur) % modulus;
    let last = u32::from(last) % modulus;
    ((cur + 2 * modulus - last - 1) % modulus) as u16
}

/// Signed forward distance from sequence id `from` to `to`, modulo 16384.
///
/// The result is in `-8192..=8191`; negative means `to` comes before `from`.
#[must_use]
pub fn sequence_distance(from: u16, to: u16) -> i16 {
    let modulus = i32::from(PrimaryHeader::SEQ_MODULUS);
    let half = modulus / 2;
    let d = (i32::from(to) - i32::from(from)).rem_euclid(modulus);
    if d >= half {
        (d - modulus) as i16
    } else {
        d as i16
    }
}

/// Order two sequence ids by their modulo 16384 forward distance.
#[must_use]
pub fn compare_sequence(a: u16, b: u16) -> Ordering {
    sequence_distance(b, a).cmp(&0)
}

/// Reads [Packet]s one at a time from a byte stream.
///
/// Frames with an unsupported version are skipped using their declared length, which
/// is a best-effort resynchronization that assumes the corrupted frame's length field is
/// still trustworthy. Each skip is logged and counted, see [PacketReader::resyncs].
///
/// A clean end of input, including a partial header at the very end, ends iteration.
/// If a frame cannot be read in full an [Error::Truncated] is produced and iteration
/// ends.
pub struct PacketReader<R> {
    reader: R,
    offset: usize,
    resyncs: usize,
    done: bool,
}

impl<R> PacketReader<R>
where
    R: Read,
{
    pub fn new(reader: R) -> Self {
        PacketReader {
            reader,
            offset: 0,
            resyncs: 0,
            done: false,
        }
    }

    /// Number of frames skipped due to an unsupported version.
    #[must_use]
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    // Read as many bytes as are available, up to buf.len()
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.offset += total;
        Ok(total)
    }

    fn skip(&mut self, num: usize) -> Result<usize> {
        let skipped = io::copy(&mut (&mut self.reader).take(num as u64), &mut io::sink())?;
        let skipped = skipped as usize;
        self.offset += skipped;
        Ok(skipped)
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let start = self.offset;
            let mut buf = [0u8; PrimaryHeader::LEN];
            let num = self.fill(&mut buf)?;
            if num == 0 {
                return Ok(None);
            }
            if num < PrimaryHeader::LEN {
                debug!(offset = start, trailing = num, "ignoring partial header at end of input");
                return Ok(None);
            }

            let header = match PrimaryHeader::decode(&buf) {
                Ok(header) => header,
                Err(Error::UnsupportedVersion {
                    version,
                    len_minus1,
                }) => {
                    warn!(
                        offset = start,
                        version,
                        "unsupported packet version; file might be corrupted, trying to resynchronize"
                    );
                    self.resyncs += 1;
                    let want = len_minus1 as usize + 1;
                    let got = self.skip(want)?;
                    if got < want {
                        return Err(Error::Truncated {
                            offset: start,
                            expected: want,
                            actual: got,
                        });
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut data = vec![0u8; header.frame_len()];
            data[..PrimaryHeader::LEN].copy_from_slice(&buf);
            let got = self.fill(&mut data[PrimaryHeader::LEN..])?;
            if got < header.payload_len() {
                return Err(Error::Truncated {
                    offset: start,
                    expected: header.payload_len(),
                    actual: got,
                });
            }

            return Ok(Some(Packet {
                header,
                data,
                offset: start,
            }));
        }
    }
}

impl<R> Iterator for PacketReader<R>
where
    R: Read,
{
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_packet() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Return a [PacketReader] providing [Packet]s read from a PDS byte stream.
///
/// # Examples
/// ```
/// use pds::spacepacket::read_packets;
///
/// let dat: &[u8] = &[
///     // version 1 frame, skipped
///     0x20, 0x40, 0xc0, 0x01, 0x0, 0x1, 0xaa, 0xbb,
///     // valid frame
///     0x08, 0x40, 0xc0, 0x02, 0x0, 0x1, 0xaa, 0xbb,
/// ];
///
/// let mut packets = read_packets(dat);
/// let packet = packets.next().unwrap().unwrap();
/// assert_eq!(packet.header.sequence_id, 2);
/// assert!(packets.next().is_none());
/// assert_eq!(packets.resyncs(), 1);
/// ```
pub fn read_packets<R>(reader: R) -> PacketReader<R>
where
    R: Read,
{
    PacketReader::new(reader)
}
