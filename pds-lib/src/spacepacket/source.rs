use std::io::Read;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{Apid, Candidate, Packet, PacketReader};
use crate::modis::ModisPacket;
use crate::timecode::TimeWindow;
use crate::{Error, Result};

/// Counts of packets read by a source and why they were not offered to the merge.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SourceStats {
    /// Total packets read with a supported primary header.
    pub read: usize,
    pub wrong_apid: usize,
    /// Payload too short to hold a secondary header.
    pub too_short: usize,
    pub bad_checksum: usize,
    pub outside_window: usize,
    /// Frames skipped due to an unsupported version.
    pub resyncs: usize,
}

impl SourceStats {
    /// Number of packets offered as merge candidates.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.read - self.wrong_apid - self.too_short - self.bad_checksum - self.outside_window
    }
}

/// Decides which packets of a source are merge candidates.
#[derive(Debug, Copy, Clone)]
pub struct CandidateFilter {
    pub apid: Apid,
    pub window: TimeWindow,
}

impl CandidateFilter {
    /// Return a [Candidate] for `packet` if it has the wanted APID, a valid secondary
    /// header and checksum, and a time within the window. Rejections are counted in
    /// `stats`.
    pub fn check(&self, packet: Packet, stats: &mut SourceStats) -> Option<Candidate> {
        stats.read += 1;
        if packet.header.apid != self.apid {
            stats.wrong_apid += 1;
            return None;
        }
        let offset = packet.offset;
        let modis = match ModisPacket::decode(packet) {
            Ok(modis) => modis,
            Err(err) => {
                debug!(offset, "dropping packet: {err}");
                stats.too_short += 1;
                return None;
            }
        };
        if !modis.is_valid() {
            debug!(
                offset,
                expected = modis.header.checksum,
                computed = modis.computed_checksum,
                "dropping packet with bad checksum"
            );
            stats.bad_checksum += 1;
            return None;
        }
        let timestamp = modis.timestamp();
        if !self.window.contains(&timestamp) {
            trace!(offset, %timestamp, "dropping packet outside window");
            stats.outside_window += 1;
            return None;
        }
        Some(Candidate::new(modis.packet, timestamp))
    }
}

/// A stream of merge candidates.
pub trait PacketSource {
    /// Name used in log messages, typically the input path.
    fn name(&self) -> &str;

    /// Produce the next candidate, or `None` once the source is exhausted.
    ///
    /// # Errors
    /// Any error reading the source. Errors are fatal; a source must not be polled again
    /// after returning one.
    fn next_candidate(&mut self) -> Result<Option<Candidate>>;

    /// Statistics for packets read so far.
    fn stats(&self) -> SourceStats;
}

impl<T> PacketSource for Box<T>
where
    T: PacketSource + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>> {
        (**self).next_candidate()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// [PacketSource] reading packets directly from a [Read].
pub struct ReaderSource<R> {
    name: String,
    packets: PacketReader<R>,
    filter: CandidateFilter,
    stats: SourceStats,
}

impl<R> ReaderSource<R>
where
    R: Read,
{
    pub fn new<S: Into<String>>(name: S, reader: R, filter: CandidateFilter) -> Self {
        ReaderSource {
            name: name.into(),
            packets: PacketReader::new(reader),
            filter,
            stats: SourceStats::default(),
        }
    }
}

impl<R> PacketSource for ReaderSource<R>
where
    R: Read,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>> {
        loop {
            let packet = match self.packets.next() {
                Some(zult) => zult?,
                None => return Ok(None),
            };
            if let Some(candidate) = self.filter.check(packet, &mut self.stats) {
                return Ok(Some(candidate));
            }
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            resyncs: self.packets.resyncs(),
            ..self.stats
        }
    }
}

/// [PacketSource] that reads and filters another source on a background thread,
/// handing candidates over a bounded channel.
///
/// The source statistics are only complete once this source is exhausted or has
/// returned an error.
pub struct ThreadedSource {
    name: String,
    rx: Receiver<Result<Candidate>>,
    handle: Option<JoinHandle<SourceStats>>,
    stats: SourceStats,
}

impl ThreadedSource {
    /// Start reading `source` on a new thread, buffering up to `buffer_size` candidates.
    ///
    /// # Errors
    /// [Error::Io] if the thread could not be started.
    pub fn spawn<S>(mut source: S, buffer_size: usize) -> Result<Self>
    where
        S: PacketSource + Send + 'static,
    {
        let name = source.name().to_string();
        let (tx, rx) = bounded(buffer_size);
        let handle = thread::Builder::new()
            .name(format!("source::{name}"))
            .spawn(move || {
                loop {
                    match source.next_candidate() {
                        Ok(Some(candidate)) => {
                            if tx.send(Ok(candidate)).is_err() {
                                debug!("receiver gone, stopping {}", source.name());
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            break;
                        }
                    }
                }
                source.stats()
            })?;

        Ok(ThreadedSource {
            name,
            rx,
            handle: Some(handle),
            stats: SourceStats::default(),
        })
    }

    // Join the worker to collect its statistics.
    fn finish(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(stats) => {
                self.stats = stats;
                Ok(())
            }
            Err(_) => {
                warn!(source = %self.name, "source worker panicked");
                Err(Error::SourceFailed(self.name.clone()))
            }
        }
    }
}

impl PacketSource for ThreadedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_candidate(&mut self) -> Result<Option<Candidate>> {
        if self.handle.is_none() {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(Ok(candidate)) => Ok(Some(candidate)),
            Ok(Err(err)) => {
                self.finish()?;
                Err(err)
            }
            // Sender dropped, worker is done
            Err(_) => {
                self.finish()?;
                Ok(None)
            }
        }
    }

    fn stats(&self) -> SourceStats {
        self.stats
    }
}
