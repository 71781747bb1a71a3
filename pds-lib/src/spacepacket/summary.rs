use std::collections::BTreeMap;
use std::io::Read;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{missing_packets, read_packets, Apid, Packet, PrimaryHeader};
use crate::modis::{is_modis_apid, ModisPacket, PacketType, SecondaryHeader, Source};
use crate::timecode::Timestamp;
use crate::Error;

/// Per-APID packet statistics.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub count: usize,
    /// Packets failing the checksum, or too short to hold a secondary header.
    pub invalid: usize,
    pub missing: usize,
    /// Packets repeating the previous sequence id.
    pub duplicates: usize,
    /// Last sequence id seen, `None` if no packets yet.
    pub last_sequence: Option<u16>,
}

impl ChannelStats {
    /// Track the sequence id of the next packet for this APID, returning the number of
    /// missing packets before it. A repeated sequence id is counted as a duplicate and
    /// contributes no missing packets.
    pub fn track(&mut self, sequence_id: u16) -> usize {
        self.count += 1;
        let missing = match self.last_sequence {
            None => 0,
            Some(last) => match missing_packets(sequence_id, last) {
                PrimaryHeader::SEQ_MAX => {
                    self.duplicates += 1;
                    0
                }
                x => x as usize,
            },
        };
        self.missing += missing;
        self.last_sequence = Some(sequence_id);
        missing
    }
}

/// Day, night and engineering packet counts.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PacketTypeCounts {
    pub day: usize,
    pub night: usize,
    pub engineering: usize,
}

impl PacketTypeCounts {
    fn add(&mut self, packet_type: PacketType) {
        match packet_type {
            PacketType::Day => self.day += 1,
            PacketType::Night => self.night += 1,
            PacketType::Engineering1 | PacketType::Engineering2 => self.engineering += 1,
            PacketType::Other(_) => {}
        }
    }
}

/// Statistics over a single PDS capture.
///
/// Every packet with a supported primary header counts toward its APID. Packets with a
/// MODIS APID additionally have their secondary header decoded and checksum verified,
/// and contribute to the time coverage.
///
/// # Example
/// ```
/// use pds::spacepacket::{read_packets, Summary};
///
/// let dat: &[u8] = &[
///     0x08, 0x10, 0xc0, 0x05, 0x0, 0x0, 0xff,
///     0x08, 0x10, 0xc0, 0x07, 0x0, 0x0, 0xff,
/// ];
///
/// let mut summary = Summary::default();
/// for packet in read_packets(dat) {
///     summary.add(&packet.unwrap());
/// }
/// assert_eq!(summary.apids[&16].missing, 1);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone)]
pub struct Summary {
    pub count: usize,
    pub invalid: usize,
    pub missing: usize,
    pub duplicates: usize,
    /// Sum over consecutive MODIS packets of whole seconds between them.
    pub missing_seconds: i64,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
    /// Packet type counts for earth view packets.
    pub earth_view: PacketTypeCounts,
    /// Packet type counts for calibration packets.
    pub calibration: PacketTypeCounts,
    /// Frames skipped because of an unsupported version.
    pub resyncs: usize,
    pub apids: BTreeMap<Apid, ChannelStats>,

    #[cfg_attr(feature = "serde", serde(skip))]
    previous: Option<SecondaryHeader>,
}

impl Summary {
    /// Add the statistics for a single packet.
    pub fn add(&mut self, packet: &Packet) {
        let hdr = packet.header;
        self.count += 1;

        let stats = self.apids.entry(hdr.apid).or_default();
        let before = stats.duplicates;
        let missing = stats.track(hdr.sequence_id);
        let duplicate = stats.duplicates > before;
        self.missing += missing;
        if duplicate {
            self.duplicates += 1;
            warn!(apid = hdr.apid, sequence_id = hdr.sequence_id, offset = packet.offset, "duplicated packet");
        }

        if !is_modis_apid(hdr.apid) {
            return;
        }

        let modis = match ModisPacket::decode(packet.clone()) {
            Ok(modis) => modis,
            Err(err) => {
                debug!(apid = hdr.apid, offset = packet.offset, "counting packet as invalid: {err}");
                stats.invalid += 1;
                self.invalid += 1;
                return;
            }
        };
        if !modis.is_valid() {
            stats.invalid += 1;
            self.invalid += 1;
        }

        let sec = modis.header;
        if duplicate {
            if let Some(prev) = &self.previous {
                warn!(
                    apid = hdr.apid,
                    time = %sec.timestamp(),
                    previous_time = %prev.timestamp(),
                    sample_id = sec.sample_id,
                    previous_sample_id = prev.sample_id,
                    "duplicated MODIS packet"
                );
            }
        }
        self.add_time(&sec);

        let counts = match sec.source {
            Source::EarthView => &mut self.earth_view,
            Source::Calibration => &mut self.calibration,
        };
        counts.add(sec.packet_type);
    }

    fn add_time(&mut self, sec: &SecondaryHeader) {
        let ts = sec.timestamp();
        self.first = Some(self.first.map_or(ts, |cur| cur.min(ts)));
        self.last = Some(self.last.map_or(ts, |cur| cur.max(ts)));

        if let Some(prev) = &self.previous {
            self.missing_seconds += ts.millis_since(&prev.timestamp()).div_euclid(1000);
        }
        self.previous = Some(*sec);
    }
}

/// Result of [summarize]: the statistics gathered and the error that ended the capture
/// early, if any.
#[derive(Debug)]
pub struct Summarized {
    pub summary: Summary,
    pub error: Option<Error>,
}

/// Gather [Summary] statistics over all packets in `reader`.
///
/// A truncated frame or read error stops summarizing; the statistics gathered up to that
/// point are returned along with the error.
pub fn summarize<R>(reader: R) -> Summarized
where
    R: Read,
{
    let mut summary = Summary::default();
    let mut packets = read_packets(reader);
    let mut error = None;
    for zult in packets.by_ref() {
        match zult {
            Ok(packet) => summary.add(&packet),
            Err(err) => {
                warn!("error reading input; file might be corrupted: {err}");
                error = Some(err);
                break;
            }
        }
    }
    summary.resyncs = packets.resyncs();
    Summarized { summary, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modis::set_checksum;

    fn modis_packet(apid: Apid, seqid: u16, ts: Timestamp, packet_type: PacketType) -> Vec<u8> {
        let sec = SecondaryHeader {
            day: ts.day,
            millis: ts.millis,
            micros: ts.micros,
            quicklook: false,
            packet_type,
            scan_count: 0,
            mirror_side: 0,
            source: Source::EarthView,
            sample_id: 1,
            config: 0,
            state: false,
            abnormal: false,
            checksum: 0,
        };
        let mut payload = sec.encode().to_vec();
        payload.extend((0..18u8).map(|x| x.wrapping_mul(17)));
        set_checksum(&mut payload).unwrap();
        let hdr = PrimaryHeader {
            version: 0,
            type_flag: 0,
            has_secondary_header: true,
            apid,
            sequence_flags: 3,
            sequence_id: seqid,
            len_minus1: (payload.len() - 1) as u16,
        };
        let mut dat = hdr.encode().to_vec();
        dat.extend(payload);
        dat
    }

    fn summary_of(dat: &[u8]) -> Summary {
        let zult = summarize(dat);
        assert!(zult.error.is_none(), "{:?}", zult.error);
        zult.summary
    }

    #[test]
    fn test_track() {
        let mut stats = ChannelStats::default();
        assert_eq!(stats.track(5), 0);
        assert_eq!(stats.track(7), 1);
        assert_eq!(stats.track(7), 0);
        assert_eq!(stats.track(8), 0);

        assert_eq!(stats.count, 4);
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.last_sequence, Some(8));
    }

    #[test]
    fn test_track_full_cycle() {
        let mut stats = ChannelStats::default();
        for seqid in (0..=PrimaryHeader::SEQ_MAX).chain([0, 1]) {
            stats.track(seqid);
        }
        assert_eq!(stats.missing, 0);
        assert_eq!(stats.duplicates, 0);
    }

    #[test]
    fn test_missing_one() {
        let ts = Timestamp::new(100, 0, 0);
        let mut dat = modis_packet(64, 5, ts, PacketType::Day);
        dat.extend(modis_packet(64, 7, ts, PacketType::Day));

        let summary = summary_of(&dat);
        assert_eq!(summary.apids[&64].missing, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.apids[&64].count, 2);
    }

    #[test]
    fn test_channels_are_ordered() {
        let ts = Timestamp::new(100, 0, 0);
        let mut dat = Vec::new();
        for apid in [100, 64, 1000, 65] {
            dat.extend(modis_packet(apid, 0, ts, PacketType::Day));
        }

        let summary = summary_of(&dat);
        let apids: Vec<Apid> = summary.apids.keys().copied().collect();
        assert_eq!(apids, vec![64, 65, 100, 1000]);
        // non-MODIS APIDs are counted but not decoded
        assert_eq!(summary.earth_view.day, 3);
    }

    #[test]
    fn test_invalid_checksum() {
        let ts = Timestamp::new(100, 0, 0);
        let mut dat = modis_packet(64, 0, ts, PacketType::Day);
        let mut bad = modis_packet(64, 1, ts, PacketType::Day);
        bad[PrimaryHeader::LEN + SecondaryHeader::LEN] ^= 0xf0;
        dat.extend(bad);

        let summary = summary_of(&dat);
        assert_eq!(summary.apids[&64].count, 2);
        assert_eq!(summary.apids[&64].invalid, 1);
        assert_eq!(summary.invalid, 1);
    }

    #[test]
    fn test_short_payload_is_invalid() {
        // 4 byte payload cannot hold a secondary header
        let dat: &[u8] = &[0x08, 0x40, 0xc0, 0x00, 0x0, 0x3, 0x1, 0x2, 0x3, 0x4];
        let summary = summary_of(dat);
        assert_eq!(summary.apids[&64].invalid, 1);
        assert_eq!(summary.first, None);
    }

    #[test]
    fn test_missing_seconds_and_coverage() {
        let t0 = Timestamp::new(100, 86_399_500, 0);
        let t1 = Timestamp::new(101, 2_600, 10);
        let t2 = Timestamp::new(101, 4_000, 0);
        let mut dat = modis_packet(64, 0, t0, PacketType::Day);
        dat.extend(modis_packet(64, 1, t1, PacketType::Night));
        dat.extend(modis_packet(64, 2, t2, PacketType::Engineering1));

        let summary = summary_of(&dat);
        // 3100ms -> 3s, 1400ms -> 1s
        assert_eq!(summary.missing_seconds, 4);
        assert_eq!(summary.first, Some(t0));
        assert_eq!(summary.last, Some(t2));
        assert_eq!(
            summary.earth_view,
            PacketTypeCounts {
                day: 1,
                night: 1,
                engineering: 1
            }
        );
        assert_eq!(summary.calibration, PacketTypeCounts::default());
    }

    #[test]
    fn test_out_of_order_time() {
        let t0 = Timestamp::new(100, 10_000, 0);
        let t1 = Timestamp::new(100, 5_000, 0);
        let mut dat = modis_packet(64, 0, t0, PacketType::Day);
        dat.extend(modis_packet(64, 1, t1, PacketType::Day));

        let summary = summary_of(&dat);
        assert_eq!(summary.missing_seconds, -5);
        assert_eq!(summary.first, Some(t1));
        assert_eq!(summary.last, Some(t0));
    }

    #[test]
    fn test_duplicate() {
        let ts = Timestamp::new(100, 0, 0);
        let mut dat = modis_packet(64, 9, ts, PacketType::Day);
        dat.extend(modis_packet(64, 9, ts, PacketType::Day));

        let summary = summary_of(&dat);
        assert_eq!(summary.apids[&64].duplicates, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.missing, 0);
    }

    #[test]
    fn test_resync_continues() {
        let ts = Timestamp::new(100, 0, 0);
        let mut dat = modis_packet(64, 0, ts, PacketType::Day);
        let mut corrupt = modis_packet(64, 1, ts, PacketType::Day);
        corrupt[0] = 0x20;
        dat.extend(corrupt);
        dat.extend(modis_packet(64, 2, ts, PacketType::Day));

        let summary = summary_of(&dat);
        assert_eq!(summary.resyncs, 1);
        assert_eq!(summary.apids[&64].count, 2);
        assert_eq!(summary.apids[&64].missing, 1);
    }

    #[test]
    fn test_truncated_keeps_partial_summary() {
        let ts = Timestamp::new(100, 0, 0);
        let mut dat = modis_packet(64, 0, ts, PacketType::Day);
        let second = modis_packet(64, 1, ts, PacketType::Day);
        dat.extend(&second[..second.len() - 3]);

        let zult = summarize(&dat[..]);
        assert!(matches!(zult.error, Some(Error::Truncated { .. })));
        assert_eq!(zult.summary.count, 1);
    }

    #[test]
    fn test_empty() {
        let summary = summary_of(&[]);
        assert_eq!(summary.count, 0);
        assert!(summary.apids.is_empty());
    }
}
