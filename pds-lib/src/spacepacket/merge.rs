use std::cmp::Ordering;
use std::io::{Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use super::{
    compare_sequence, Apid, CandidateFilter, Packet, PacketSource, ReaderSource, SourceStats,
    ThreadedSource,
};
use crate::modis::is_modis_apid;
use crate::timecode::{TimeWindow, Timestamp};
use crate::{Error, Result};

/// A packet that passed source filtering along with the keys it is merged by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub packet: Packet,
    pub timestamp: Timestamp,
    pub sequence: u16,
}

impl Candidate {
    #[must_use]
    pub fn new(packet: Packet, timestamp: Timestamp) -> Self {
        let sequence = packet.header.sequence_id;
        Candidate {
            packet,
            timestamp,
            sequence,
        }
    }

    /// Merge order: by timestamp, then by sequence id accounting for rollover.
    #[must_use]
    pub fn merge_order(&self, other: &Candidate) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| compare_sequence(self.sequence, other.sequence))
    }
}

/// Merge state of a single source.
#[derive(Debug, Clone, Default)]
pub enum Cursor {
    /// Needs a candidate from its source.
    #[default]
    Empty,
    Holding(Candidate),
    /// Source has no more candidates.
    Exhausted,
}

impl Cursor {
    fn candidate(&self) -> Option<&Candidate> {
        match self {
            Cursor::Holding(candidate) => Some(candidate),
            _ => None,
        }
    }

    fn take(&mut self) -> Option<Candidate> {
        match std::mem::take(self) {
            Cursor::Holding(candidate) => Some(candidate),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Results of a merge.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    /// Packets written to the output.
    pub emitted: usize,
    /// Candidates dropped because another source provided the same packet.
    pub duplicates: usize,
    /// Candidates dropped because they were not after the last packet written.
    pub stale: usize,
    /// Statistics for each source, in input order.
    pub sources: Vec<SourceStats>,
}

/// Merge MODIS packets for a single APID from multiple PDS sources into a single time
/// ordered stream without duplicates.
///
/// Each source is expected to be mostly time ordered. Sources are read in lock step, each
/// holding at most one candidate, and the earliest candidate is written. Candidates
/// with the same time and sequence id in multiple sources are written once, from the
/// first such source. A candidate that is not strictly after the last packet written is
/// dropped, so the output is always strictly increasing.
///
/// Packets are written exactly as read.
///
/// # Example
/// ```no_run
/// use std::fs::File;
/// use pds::spacepacket::Merger;
///
/// let readers = vec![
///     ("a.pds".to_string(), File::open("a.pds").unwrap()),
///     ("b.pds".to_string(), File::open("b.pds").unwrap()),
/// ];
/// let summary = Merger::builder()
///     .apid(64)
///     .build()
///     .merge_readers(readers, File::create("merged.pds").unwrap())
///     .unwrap();
/// println!("wrote {} packets", summary.emitted);
/// ```
#[derive(TypedBuilder, Debug, Clone)]
pub struct Merger {
    /// APID to merge. Must be a MODIS APID.
    apid: Apid,
    /// Only packets within this window are merged.
    #[builder(default)]
    window: TimeWindow,
    /// Read each source on its own thread.
    #[builder(default = false)]
    threaded: bool,
    /// Number of candidates buffered per source when `threaded`.
    #[builder(default = Merger::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
}

impl Merger {
    const DEFAULT_BUFFER_SIZE: usize = 1024;

    /// Filter applied to the packets of every source.
    #[must_use]
    pub fn filter(&self) -> CandidateFilter {
        CandidateFilter {
            apid: self.apid,
            window: self.window,
        }
    }

    /// Merge packets from named readers, see [Merger::merge].
    ///
    /// # Errors
    /// See [Merger::merge].
    pub fn merge_readers<R, W>(
        &self,
        readers: Vec<(String, R)>,
        writer: W,
    ) -> Result<MergeSummary>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        let filter = self.filter();
        let sources = readers
            .into_iter()
            .map(|(name, reader)| {
                Box::new(ReaderSource::new(name, reader, filter)) as Box<dyn PacketSource + Send>
            })
            .collect();
        self.merge(sources, writer)
    }

    /// Merge candidates from `sources`, writing the merged packets to `writer`.
    ///
    /// # Errors
    /// [Error::InvalidApid] if the configured APID is not a MODIS APID. Any error from a
    /// source or from writing ends the merge; output already written is not removed.
    pub fn merge<W>(
        &self,
        sources: Vec<Box<dyn PacketSource + Send>>,
        mut writer: W,
    ) -> Result<MergeSummary>
    where
        W: Write,
    {
        if !is_modis_apid(self.apid) {
            return Err(Error::InvalidApid(self.apid));
        }

        let mut sources = if self.threaded {
            sources
                .into_iter()
                .map(|s| {
                    ThreadedSource::spawn(s, self.buffer_size)
                        .map(|t| Box::new(t) as Box<dyn PacketSource + Send>)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            sources
        };

        let mut cursors = vec![Cursor::Empty; sources.len()];
        let mut summary = MergeSummary::default();
        let mut last: Option<(Timestamp, u16)> = None;

        loop {
            for (source, cursor) in sources.iter_mut().zip(cursors.iter_mut()) {
                if !matches!(cursor, Cursor::Empty) {
                    continue;
                }
                *cursor = match source.next_candidate() {
                    Ok(Some(candidate)) => Cursor::Holding(candidate),
                    Ok(None) => {
                        debug!(source = source.name(), "source exhausted");
                        Cursor::Exhausted
                    }
                    Err(err) => {
                        error!(source = source.name(), "failed to read source: {err}");
                        return Err(err);
                    }
                };
            }

            let Some(idx) = earliest(&cursors) else {
                break;
            };
            let Some(candidate) = cursors[idx].take() else {
                break;
            };

            // Same packet from later sources
            for (source, cursor) in sources.iter().zip(cursors.iter_mut()).skip(idx + 1) {
                if let Some(other) = cursor.candidate() {
                    if other.merge_order(&candidate) == Ordering::Equal {
                        debug!(
                            source = source.name(),
                            time = %other.timestamp,
                            sequence_id = other.sequence,
                            "dropping duplicate"
                        );
                        summary.duplicates += 1;
                        *cursor = Cursor::Empty;
                    }
                }
            }

            if let Some((time, sequence)) = last {
                let after = candidate
                    .timestamp
                    .cmp(&time)
                    .then_with(|| compare_sequence(candidate.sequence, sequence));
                if after != Ordering::Greater {
                    warn!(
                        source = sources[idx].name(),
                        time = %candidate.timestamp,
                        sequence_id = candidate.sequence,
                        last_time = %time,
                        last_sequence_id = sequence,
                        "dropping packet not after the last packet written"
                    );
                    summary.stale += 1;
                    continue;
                }
            }

            writer.write_all(&candidate.packet.data)?;
            summary.emitted += 1;
            last = Some((candidate.timestamp, candidate.sequence));
        }
        writer.flush()?;

        summary.sources = sources.iter().map(|s| s.stats()).collect();
        info!(
            emitted = summary.emitted,
            duplicates = summary.duplicates,
            stale = summary.stale,
            "merge complete"
        );
        Ok(summary)
    }
}

// Index of the earliest held candidate, preferring the lowest index on ties.
fn earliest(cursors: &[Cursor]) -> Option<usize> {
    let mut best: Option<(usize, &Candidate)> = None;
    for (idx, cursor) in cursors.iter().enumerate() {
        let Some(candidate) = cursor.candidate() else {
            continue;
        };
        match best {
            Some((_, cur)) if candidate.merge_order(cur) != Ordering::Less => {}
            _ => best = Some((idx, candidate)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor as IoCursor;

    use super::*;
    use crate::modis::{set_checksum, PacketType, SecondaryHeader, Source};
    use crate::spacepacket::{read_packets, PrimaryHeader};

    fn packet(apid: Apid, seqid: u16, day: u16, millis: u32) -> Vec<u8> {
        let sec = SecondaryHeader {
            day,
            millis,
            micros: 0,
            quicklook: false,
            packet_type: PacketType::Night,
            scan_count: 3,
            mirror_side: 1,
            source: Source::EarthView,
            sample_id: 7,
            config: 0,
            state: false,
            abnormal: false,
            checksum: 0,
        };
        let mut payload = sec.encode().to_vec();
        payload.extend((0..30u8).map(|x| x ^ (seqid as u8)));
        set_checksum(&mut payload).unwrap();
        let mut dat = PrimaryHeader {
            version: 0,
            type_flag: 0,
            has_secondary_header: true,
            apid,
            sequence_flags: 3,
            sequence_id: seqid,
            len_minus1: (payload.len() - 1) as u16,
        }
        .encode()
        .to_vec();
        dat.extend(payload);
        dat
    }

    fn stream(packets: &[(u16, u32)]) -> Vec<u8> {
        packets
            .iter()
            .flat_map(|(seqid, millis)| packet(70, *seqid, 100, *millis))
            .collect()
    }

    fn run(merger: &Merger, inputs: Vec<Vec<u8>>) -> (MergeSummary, Vec<u8>) {
        let readers = inputs
            .into_iter()
            .enumerate()
            .map(|(i, dat)| (format!("input{i}"), IoCursor::new(dat)))
            .collect();
        let mut out = Vec::new();
        let summary = merger.merge_readers(readers, &mut out).unwrap();
        (summary, out)
    }

    fn merger() -> Merger {
        Merger::builder().apid(70).build()
    }

    fn sequence_ids(dat: &[u8]) -> Vec<u16> {
        read_packets(dat)
            .map(|p| p.unwrap().header.sequence_id)
            .collect()
    }

    #[test]
    fn test_duplicate_across_sources() {
        let dat = packet(70, 1, 100, 0);
        let (summary, out) = run(&merger(), vec![dat.clone(), dat.clone()]);

        assert_eq!(out, dat);
        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.stale, 0);
        assert_eq!(summary.sources.len(), 2);
    }

    #[test]
    fn test_merge_with_self() {
        let dat = stream(&[(0, 0), (1, 100), (2, 200), (3, 300)]);
        let (summary, out) = run(&merger(), vec![dat.clone(), dat.clone()]);

        assert_eq!(out, dat);
        assert_eq!(summary.emitted, 4);
        assert_eq!(summary.duplicates, 4);
    }

    #[test]
    fn test_interleave() {
        let a = stream(&[(0, 0), (2, 200), (4, 400)]);
        let b = stream(&[(1, 100), (3, 300), (5, 500)]);
        let (summary, out) = run(&merger(), vec![a, b]);

        assert_eq!(sequence_ids(&out), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(summary.emitted, 6);
        assert_eq!(summary.duplicates, 0);
    }

    #[test]
    fn test_fills_gaps() {
        let a = stream(&[(0, 0), (1, 100), (4, 400)]);
        let b = stream(&[(1, 100), (2, 200), (3, 300), (4, 400), (5, 500)]);
        let (summary, out) = run(&merger(), vec![a, b]);

        assert_eq!(sequence_ids(&out), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(summary.duplicates, 2);
    }

    #[test]
    fn test_same_time_ordered_by_sequence() {
        let a = stream(&[(10, 0)]);
        let b = stream(&[(9, 0)]);
        let (_, out) = run(&merger(), vec![a, b]);
        assert_eq!(sequence_ids(&out), vec![9, 10]);
    }

    #[test]
    fn test_same_time_sequence_rollover() {
        let a = stream(&[(0, 0)]);
        let b = stream(&[(PrimaryHeader::SEQ_MAX, 0)]);
        let (_, out) = run(&merger(), vec![a, b]);
        assert_eq!(sequence_ids(&out), vec![PrimaryHeader::SEQ_MAX, 0]);
    }

    #[test]
    fn test_drops_stale() {
        let a = stream(&[(0, 500), (1, 100)]);
        let b = stream(&[(2, 300)]);
        let (summary, out) = run(&merger(), vec![a, b]);

        assert_eq!(sequence_ids(&out), vec![2, 0]);
        assert_eq!(summary.emitted, 2);
        assert_eq!(summary.stale, 1);
    }

    #[test]
    fn test_output_strictly_increasing() {
        let a = stream(&[(0, 0), (3, 300), (1, 100), (6, 600), (5, 500)]);
        let b = stream(&[(2, 200), (2, 200), (4, 400), (7, 700)]);
        let (_, out) = run(&merger(), vec![a, b]);

        let times: Vec<Timestamp> = read_packets(&out[..])
            .map(|p| SecondaryHeader::decode(p.unwrap().payload()).unwrap().timestamp())
            .collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]), "{times:?}");
    }

    #[test]
    fn test_filters() {
        let mut a = stream(&[(0, 0), (1, 1000), (2, 2000), (3, 3000)]);
        a.extend(packet(71, 0, 100, 1500));
        let window = TimeWindow::new(
            Some(Timestamp::new(100, 1000, 0)),
            Some(Timestamp::new(100, 3000, 0)),
        )
        .unwrap();
        let merger = Merger::builder().apid(70).window(window).build();
        let (summary, out) = run(&merger, vec![a]);

        assert_eq!(sequence_ids(&out), vec![1, 2]);
        let stats = summary.sources[0];
        assert_eq!(stats.read, 5);
        assert_eq!(stats.wrong_apid, 1);
        assert_eq!(stats.outside_window, 2);
    }

    #[test]
    fn test_truncated_source_is_fatal() {
        let a = stream(&[(0, 0), (1, 100)]);
        let mut b = stream(&[(2, 200)]);
        b.truncate(b.len() - 5);
        let readers = vec![
            ("a".to_string(), IoCursor::new(a)),
            ("b".to_string(), IoCursor::new(b)),
        ];

        let mut out = Vec::new();
        let zult = merger().merge_readers(readers, &mut out);
        assert!(matches!(zult, Err(Error::Truncated { .. })), "{zult:?}");
    }

    #[test]
    fn test_threaded_matches() {
        let a = stream(&[(0, 0), (2, 200), (3, 300), (6, 600)]);
        let b = stream(&[(1, 100), (2, 200), (4, 400), (5, 500), (6, 600)]);
        let (expected_summary, expected) = run(&merger(), vec![a.clone(), b.clone()]);

        let threaded = Merger::builder()
            .apid(70)
            .threaded(true)
            .buffer_size(2)
            .build();
        let (summary, out) = run(&threaded, vec![a, b]);

        assert_eq!(out, expected);
        assert_eq!(summary, expected_summary);
    }

    #[test]
    fn test_invalid_apid() {
        let merger = Merger::builder().apid(200).build();
        let mut out = Vec::new();
        let zult = merger.merge_readers::<IoCursor<Vec<u8>>, _>(vec![], &mut out);
        assert!(matches!(zult, Err(Error::InvalidApid(200))));
    }

    #[test]
    fn test_no_sources() {
        let (summary, out) = run(&merger(), vec![]);
        assert!(out.is_empty());
        assert_eq!(summary, MergeSummary::default());
    }
}
