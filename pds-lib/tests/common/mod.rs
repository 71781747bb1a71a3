use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use pds::modis::{set_checksum, PacketType, SecondaryHeader, Source};
use pds::timecode::Timestamp;
use pds::{Apid, PrimaryHeader};

/// Number of sample bytes in generated payloads; a multiple of 3 as for real science
/// packets.
pub const SAMPLE_BYTES: usize = 624;

/// Build a MODIS packet with a valid checksum and pseudo-random sample data.
pub fn modis_packet(apid: Apid, seqid: u16, ts: Timestamp, packet_type: PacketType) -> Vec<u8> {
    let sec = SecondaryHeader {
        day: ts.day,
        millis: ts.millis,
        micros: ts.micros,
        quicklook: false,
        packet_type,
        scan_count: (seqid % 8) as u8,
        mirror_side: (seqid % 2) as u8,
        source: Source::EarthView,
        sample_id: seqid % 1354,
        config: 0,
        state: false,
        abnormal: false,
        checksum: 0,
    };
    let mut payload = sec.encode().to_vec();
    payload.extend((0..SAMPLE_BYTES).map(|i| (i as u16 * 31 + seqid) as u8));
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

/// Generate `num` consecutive day packets for `apid`, 1ms apart, starting at `start`.
pub fn modis_stream(apid: Apid, first_seqid: u16, start: Timestamp, num: usize) -> Vec<Vec<u8>> {
    (0..num)
        .map(|i| {
            let seqid = (usize::from(first_seqid) + i) as u16 % (PrimaryHeader::SEQ_MAX + 1);
            let ts = Timestamp::new(start.day, start.millis + i as u32, 0);
            modis_packet(apid, seqid, ts, PacketType::Day)
        })
        .collect()
}

pub fn write_file(dir: &Path, name: &str, packets: &[Vec<u8>]) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    for packet in packets {
        file.write_all(packet).unwrap();
    }
    path
}
