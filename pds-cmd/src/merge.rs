use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use pds::spacepacket::{Apid, Merger};
use pds::timecode::TimeWindow;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::Failure;

/// Merge `inputs` into `output`.
///
/// Output is written to a temporary file next to `output` and only moved into place
/// once the merge completes, so a failed merge leaves no partial output behind.
pub fn merge(
    inputs: &[PathBuf],
    output: &Path,
    apid: Apid,
    window: TimeWindow,
    threaded: bool,
) -> Result<()> {
    let mut readers = Vec::with_capacity(inputs.len());
    for path in inputs {
        let file = File::open(path)
            .with_context(|| Failure::resource(format!("can't open input file {path:?}")))?;
        readers.push((path.display().to_string(), BufReader::new(file)));
    }

    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut dest = NamedTempFile::new_in(dir)
        .with_context(|| Failure::resource(format!("can't create output file {output:?}")))?;

    info!("merging {inputs:?} to {output:?}");
    let summary = Merger::builder()
        .apid(apid)
        .window(window)
        .threaded(threaded)
        .build()
        .merge_readers(readers, BufWriter::new(dest.as_file_mut()))
        .with_context(|| format!("merging {} inputs", inputs.len()))?;

    for (path, stats) in inputs.iter().zip(&summary.sources) {
        debug!(
            read = stats.read,
            accepted = stats.accepted(),
            wrong_apid = stats.wrong_apid,
            bad_checksum = stats.bad_checksum,
            outside_window = stats.outside_window,
            resyncs = stats.resyncs,
            "{path:?}"
        );
    }
    info!(
        "wrote {} packets; dropped {} duplicates and {} out of order",
        summary.emitted, summary.duplicates, summary.stale
    );

    dest.persist(output)
        .with_context(|| Failure::resource(format!("can't create output file {output:?}")))?;
    Ok(())
}
