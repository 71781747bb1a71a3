use anyhow::{anyhow, Context, Result};
use hifitime::Duration;
use pds::spacepacket::{summarize, Summary};
use serde::Serialize;
use std::{
    fs::File,
    io::{stdout, BufReader, Write},
    path::Path,
};
use tracing::warn;

use crate::Failure;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

#[derive(Debug, Serialize)]
struct Info<'a> {
    filename: String,
    first_packet_time: Option<String>,
    last_packet_time: Option<String>,
    duration: Option<String>,
    summary: &'a Summary,
}

impl<'a> Info<'a> {
    fn new(path: &Path, summary: &'a Summary) -> Self {
        let duration: Option<Duration> = match (summary.first, summary.last) {
            (Some(first), Some(last)) => Some(last.epoch() - first.epoch()),
            _ => None,
        };
        Info {
            filename: path.to_string_lossy().to_string(),
            first_packet_time: summary.first.map(|t| t.to_string()),
            last_packet_time: summary.last.map(|t| t.to_string()),
            duration: duration.map(|d| d.to_string()),
            summary,
        }
    }
}

pub fn info(fpath: &Path, format: &Format) -> Result<()> {
    let reader = File::open(fpath)
        .with_context(|| Failure::resource(format!("can't open input file {fpath:?}")))?;
    let zult = summarize(BufReader::new(reader));

    if zult.summary.count == 0 {
        if let Some(err) = zult.error {
            return Err(err).with_context(|| format!("reading {fpath:?}"));
        }
        return Err(Failure::io("no valid packets found").into());
    }

    let info = Info::new(fpath, &zult.summary);
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &info).context("serializing to json")?;
        }
        Format::Text => {
            let data = render_text(&info).context("serializing info")?;
            stdout()
                .write_all(str::as_bytes(&data))
                .context("writing to stdout")?;
        }
    }

    // Report what was gathered, but still fail on a damaged input
    match zult.error {
        Some(err) => {
            warn!("statistics are for the first {} packets only", zult.summary.count);
            Err(err).with_context(|| format!("reading {fpath:?}"))
        }
        None => Ok(()),
    }
}

fn render_text(info: &Info) -> Result<String> {
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_template_string("info", TEXT_TEMPLATE)
        .map_err(|e| anyhow!("compiling template: {e}"))?;

    hb.render("info", &info).context("rendering text")
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
{{ #each summary.apids }}APID {{ @key }}: count {{ count }} invalid {{ invalid }} missing {{ missing }} duplicates {{ duplicates }}
{{ /each }}first packet: {{ first_packet_time }}
last packet: {{ last_packet_time }}
duration: {{ duration }}
missing seconds: {{ summary.missing_seconds }}
day packets: {{ summary.earth_view.day }}/{{ summary.calibration.day }}
night packets: {{ summary.earth_view.night }}/{{ summary.calibration.night }}
engineering packets: {{ summary.earth_view.engineering }}/{{ summary.calibration.engineering }}
resyncs: {{ summary.resyncs }}
";

#[cfg(test)]
mod tests {
    use super::*;
    use pds::spacepacket::ChannelStats;
    use pds::timecode::Timestamp;

    #[test]
    fn test_render_text() {
        let mut summary = Summary::default();
        summary.count = 3;
        summary.missing = 1;
        summary.missing_seconds = 2;
        summary.first = Some(Timestamp::new(17532, 45_015_123, 456));
        summary.last = Some(Timestamp::new(17532, 45_017_123, 456));
        summary.earth_view.day = 2;
        summary.calibration.engineering = 1;
        summary.apids.insert(
            64,
            ChannelStats {
                count: 3,
                missing: 1,
                last_sequence: Some(4),
                ..Default::default()
            },
        );
        let info = Info::new(Path::new("input.pds"), &summary);

        let text = render_text(&info).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[..4],
            [
                "input.pds",
                "APID 64: count 3 invalid 0 missing 1 duplicates 0",
                "first packet: 2006/01/01 12:30:15.123456",
                "last packet: 2006/01/01 12:30:17.123456",
            ]
        );
        assert!(text.contains("missing seconds: 2\n"), "{text}");
        assert!(text.contains("day packets: 2/0\n"), "{text}");
        assert!(text.contains("engineering packets: 0/1\n"), "{text}");
    }
}
