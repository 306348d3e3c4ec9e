//! Analysis data decoded from ANLZ sections
//!
//! Each decoder takes one [`AnlzSection`] and reads the fields the section
//! header describes. Layouts follow the Deep Symmetry analysis.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;

use crate::anlz::{AnlzSection, SidecarWarning, Tag};

/// Loop end value meaning "not a loop"
const NO_LOOP: u32 = 0xFFFF_FFFF;

/// Beat grid containing all beat positions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BeatGrid {
    pub beats: Vec<Beat>,
}

/// Single beat in the grid
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[br(big)]
pub struct Beat {
    /// Position within bar (1-4 for 4/4 time)
    pub beat_number: u16,
    /// Tempo at this beat (BPM × 100)
    pub tempo_100: u16,
    /// Time from track start in milliseconds
    pub time_ms: u32,
}

impl BeatGrid {
    /// Number of beats
    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    /// Tempo at the first beat
    pub fn bpm(&self) -> Option<f64> {
        self.beats.first().map(|b| b.tempo_100 as f64 / 100.0)
    }

    pub fn first_beat_ms(&self) -> Option<u32> {
        self.beats.first().map(|b| b.time_ms)
    }
}

/// Which cue list a PCOB section holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CueListKind {
    Memory,
    HotCues,
    Unknown(u32),
}

impl From<u32> for CueListKind {
    fn from(value: u32) -> Self {
        match value {
            0 => CueListKind::Memory,
            1 => CueListKind::HotCues,
            other => CueListKind::Unknown(other),
        }
    }
}

/// Cue point type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CueType {
    Point,
    Loop,
    Unknown(u8),
}

impl From<u8> for CueType {
    fn from(value: u8) -> Self {
        match value {
            1 => CueType::Point,
            2 => CueType::Loop,
            other => CueType::Unknown(other),
        }
    }
}

/// Cue point from a PCPT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CuePoint {
    /// Hot cue number (0 for memory cue, 1-8 for hot cue A-H)
    pub hot_cue: u32,
    /// 0 when the cue is disabled
    pub status: u32,
    pub cue_type: CueType,
    /// Time in milliseconds from track start
    pub time_ms: u32,
    /// Loop end in milliseconds, for loops
    pub loop_time_ms: Option<u32>,
}

/// Cues from one PCOB section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CueList {
    pub kind: CueListKind,
    pub cues: Vec<CuePoint>,
}

/// Preview waveform (PWAV, normally 400 columns)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaveformPreview {
    pub columns: Vec<WaveformColumn>,
}

/// Single column in preview waveform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaveformColumn {
    /// Height 0-31 (low 5 bits)
    pub height: u8,
    /// Whiteness 0-7 (high 3 bits)
    pub whiteness: u8,
}

impl WaveformColumn {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            height: byte & 0x1F,
            whiteness: byte >> 5,
        }
    }
}

/// Scrolling monochrome waveform (PWV3, 150 columns per second)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaveformDetail {
    pub columns: Vec<WaveformColumn>,
}

/// Scrolling colour waveform (PWV5, 150 entries per second)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColorWaveform {
    pub entries: Vec<ColorWaveformEntry>,
}

/// One PWV5 entry. Red, green and blue are 0-7, height 0-31.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ColorWaveformEntry {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub height: u8,
}

impl ColorWaveformEntry {
    /// Bits 15-13 red, 12-10 green, 9-7 blue, 6-2 height
    pub fn from_bits(value: u16) -> Self {
        Self {
            red: (value >> 13) as u8 & 0x07,
            green: (value >> 10) as u8 & 0x07,
            blue: (value >> 7) as u8 & 0x07,
            height: (value >> 2) as u8 & 0x1F,
        }
    }
}

#[derive(BinRead, Debug)]
#[br(big)]
struct CueEntry {
    #[br(map = |bytes: [u8; 4]| Tag(bytes))]
    tag: Tag,
    _header_len: u32,
    len_entry: u32,
    hot_cue: u32,
    status: u32,
    _unknown1: u32,
    _order_first: u16,
    _order_last: u16,
    kind: u8,
    _pad: u8,
    _unknown2: u16,
    time: u32,
    loop_time: u32,
}

/// Bytes a PCPT entry needs for the fields above
const CUE_ENTRY_LEN: usize = 0x28;

fn facet_error(section: &AnlzSection, detail: String) -> SidecarWarning {
    SidecarWarning::Facet {
        tag: section.tag,
        detail,
    }
}

/// A u32 inside the section header
fn header_u32(section: &AnlzSection, at: usize) -> Result<u32, SidecarWarning> {
    let in_header = at + 4 <= section.header_len as usize;
    match crate::source::u32_be(&section.data, at) {
        Some(value) if in_header => Ok(value),
        _ => Err(facet_error(
            section,
            format!("header field at {:#x} missing (header is {} bytes)", at, section.header_len),
        )),
    }
}

/// Take `declared` bytes of payload, failing when fewer are present
fn declared_payload<'a>(section: &'a AnlzSection, declared: usize, what: &str) -> Result<&'a [u8], SidecarWarning> {
    let payload = section.payload();
    payload.get(..declared).ok_or_else(|| {
        facet_error(
            section,
            format!("{} declares {} bytes, {} present", what, declared, payload.len()),
        )
    })
}

/// PPTH: UTF-16BE path, NUL terminated
pub fn decode_path(section: &AnlzSection) -> Result<String, SidecarWarning> {
    let len = header_u32(section, 0x0C)? as usize;
    let bytes = declared_payload(section, len, "path")?;
    let units = bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
    let path: String = char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Ok(path.trim_end_matches('\0').to_string())
}

/// PQTZ: beat count in the header, 8 bytes per beat
pub fn decode_beat_grid(section: &AnlzSection) -> Result<BeatGrid, SidecarWarning> {
    let count = header_u32(section, 0x14)? as usize;
    let bytes = declared_payload(section, count.saturating_mul(8), "beat grid")?;

    let mut cursor = Cursor::new(bytes);
    let beats = (0..count)
        .map(|_| cursor.read_be::<Beat>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| facet_error(section, e.to_string()))?;
    Ok(BeatGrid { beats })
}

/// PCOB: list kind and entry count in the header, PCPT entries after it
pub fn decode_cue_list(section: &AnlzSection) -> Result<CueList, SidecarWarning> {
    let kind = CueListKind::from(header_u32(section, 0x0C)?);
    let count = header_u32(section, 0x10)? & 0xFFFF;
    let payload = section.payload();

    let mut cues = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for i in 0..count {
        let entry: CueEntry = payload
            .get(offset..offset + CUE_ENTRY_LEN)
            .and_then(|bytes| Cursor::new(bytes).read_be().ok())
            .ok_or_else(|| facet_error(section, format!("cue {} of {} cut off at {}", i + 1, count, offset)))?;
        if entry.tag != Tag::PCPT {
            return Err(facet_error(section, format!("cue {} has tag {}", i + 1, entry.tag)));
        }
        if (entry.len_entry as usize) < CUE_ENTRY_LEN {
            return Err(facet_error(
                section,
                format!("cue {} declares length {}", i + 1, entry.len_entry),
            ));
        }

        cues.push(CuePoint {
            hot_cue: entry.hot_cue,
            status: entry.status,
            cue_type: CueType::from(entry.kind),
            time_ms: entry.time,
            loop_time_ms: (entry.loop_time != NO_LOOP).then_some(entry.loop_time),
        });
        offset += entry.len_entry as usize;
    }

    Ok(CueList { kind, cues })
}

/// PWAV: one byte per column
pub fn decode_waveform_preview(section: &AnlzSection) -> Result<WaveformPreview, SidecarWarning> {
    let len = header_u32(section, 0x0C)? as usize;
    let bytes = declared_payload(section, len, "preview")?;
    Ok(WaveformPreview {
        columns: bytes.iter().copied().map(WaveformColumn::from_byte).collect(),
    })
}

/// Entries of a detail waveform: entry size at 0x0C, count at 0x10
fn waveform_entries<'a>(section: &'a AnlzSection, entry_len: usize, what: &str) -> Result<&'a [u8], SidecarWarning> {
    let declared_len = header_u32(section, 0x0C)? as usize;
    if declared_len != entry_len {
        return Err(facet_error(
            section,
            format!("{} entries are {} bytes, expected {}", what, declared_len, entry_len),
        ));
    }
    let count = header_u32(section, 0x10)? as usize;
    declared_payload(section, count.saturating_mul(entry_len), what)
}

/// PWV3: one byte per column, packed like the preview
pub fn decode_waveform_detail(section: &AnlzSection) -> Result<WaveformDetail, SidecarWarning> {
    let bytes = waveform_entries(section, 1, "detail waveform")?;
    Ok(WaveformDetail {
        columns: bytes.iter().copied().map(WaveformColumn::from_byte).collect(),
    })
}

/// PWV5: two big-endian bytes per entry
pub fn decode_color_waveform(section: &AnlzSection) -> Result<ColorWaveform, SidecarWarning> {
    let bytes = waveform_entries(section, 2, "colour waveform")?;
    Ok(ColorWaveform {
        entries: bytes
            .chunks_exact(2)
            .map(|c| ColorWaveformEntry::from_bits(u16::from_be_bytes([c[0], c[1]])))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anlz::tests::{section, sidecar};

    fn be32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn ppth(path: &str) -> Vec<u8> {
        let mut bytes: Vec<u8> = path.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        bytes.extend_from_slice(&[0, 0]);
        section(b"PPTH", 16, &be32(&[bytes.len() as u32]), &bytes)
    }

    fn cue(hot_cue: u32, kind: u8, time: u32, loop_time: u32) -> Vec<u8> {
        let mut entry = b"PCPT".to_vec();
        entry.extend(be32(&[0x1C, 0x38, hot_cue, 4, 0x10000]));
        entry.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        entry.extend_from_slice(&[kind, 0, 0x03, 0xE8]);
        entry.extend(be32(&[time, loop_time]));
        entry.resize(0x38, 0);
        entry
    }

    #[test]
    fn test_path() {
        let sidecar = sidecar(&[ppth("/Contents/Artist/Track.mp3")]);
        assert_eq!(sidecar.path().unwrap().as_deref(), Some("/Contents/Artist/Track.mp3"));
    }

    #[test]
    fn test_path_longer_than_section() {
        let section = section(b"PPTH", 16, &be32(&[100]), &[0, b'a']);
        let sidecar = sidecar(&[section]);
        assert!(matches!(sidecar.path(), Err(SidecarWarning::Facet { .. })));
    }

    #[test]
    fn test_beat_grid() {
        let beats = [be32(&[0x0001_3200, 120]), be32(&[0x0002_3200, 589])].concat();
        let section = section(b"PQTZ", 24, &be32(&[0, 0x80000, 2]), &beats);
        let grid = sidecar(&[section]).beat_grid().unwrap().unwrap();

        assert_eq!(grid.len(), 2);
        assert_eq!(
            grid.beats[1],
            Beat {
                beat_number: 2,
                tempo_100: 0x3200,
                time_ms: 589
            }
        );
        assert_eq!(grid.bpm(), Some(128.0));
        assert_eq!(grid.first_beat_ms(), Some(120));
    }

    #[test]
    fn test_beat_grid_count_past_payload() {
        let section = section(b"PQTZ", 24, &be32(&[0, 0x80000, 50]), &be32(&[0x0001_3200, 120]));
        assert!(sidecar(&[section]).beat_grid().is_err());
    }

    #[test]
    fn test_cue_lists() {
        let entries = [cue(0, 1, 5000, NO_LOOP), cue(0, 2, 8000, 12000)].concat();
        let memory = section(b"PCOB", 24, &be32(&[0, 2, 0xFFFF_FFFF]), &entries);
        let hot = section(b"PCOB", 24, &be32(&[1, 1, 0xFFFF_FFFF]), &cue(1, 1, 250, NO_LOOP));
        let lists = sidecar(&[hot, memory]).cue_lists().unwrap();

        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].kind, CueListKind::HotCues);
        assert_eq!(lists[0].cues[0].hot_cue, 1);
        assert_eq!(lists[0].cues[0].time_ms, 250);

        assert_eq!(lists[1].kind, CueListKind::Memory);
        assert_eq!(lists[1].cues.len(), 2);
        assert_eq!(lists[1].cues[0].cue_type, CueType::Point);
        assert_eq!(lists[1].cues[0].loop_time_ms, None);
        assert_eq!(lists[1].cues[1].cue_type, CueType::Loop);
        assert_eq!(lists[1].cues[1].loop_time_ms, Some(12000));
    }

    #[test]
    fn test_cue_count_past_payload() {
        let section = section(b"PCOB", 24, &be32(&[0, 3, 0]), &cue(0, 1, 1, NO_LOOP));
        assert!(matches!(sidecar(&[section]).cue_lists(), Err(SidecarWarning::Facet { .. })));
    }

    #[test]
    fn test_waveform_preview() {
        let section = section(b"PWAV", 20, &be32(&[3, 0x10000]), &[0x1F, 0xE0, 0x45]);
        let preview = sidecar(&[section]).waveform_preview().unwrap().unwrap();
        assert_eq!(
            preview.columns,
            vec![
                WaveformColumn { height: 31, whiteness: 0 },
                WaveformColumn { height: 0, whiteness: 7 },
                WaveformColumn { height: 5, whiteness: 2 },
            ]
        );
    }

    #[test]
    fn test_waveform_detail() {
        let section = section(b"PWV3", 24, &be32(&[1, 2, 0x960000]), &[0x3F, 0x81]);
        let detail = sidecar(&[section]).waveform_detail().unwrap().unwrap();
        assert_eq!(
            detail.columns,
            vec![
                WaveformColumn { height: 31, whiteness: 1 },
                WaveformColumn { height: 1, whiteness: 4 },
            ]
        );
    }

    #[test]
    fn test_color_waveform() {
        // red 5, green 3, blue 7, height 20
        let first: u16 = (5 << 13) | (3 << 10) | (7 << 7) | (20 << 2);
        let payload = [first.to_be_bytes(), 0xFFFFu16.to_be_bytes()].concat();
        let section = section(b"PWV5", 24, &be32(&[2, 2, 0x960305]), &payload);
        let color = sidecar(&[section]).waveform_color().unwrap().unwrap();

        assert_eq!(
            color.entries,
            vec![
                ColorWaveformEntry { red: 5, green: 3, blue: 7, height: 20 },
                ColorWaveformEntry { red: 7, green: 7, blue: 7, height: 31 },
            ]
        );
    }

    #[test]
    fn test_detail_waveform_bad_entry_size_or_count() {
        let color_section = section(b"PWV5", 24, &be32(&[1, 2, 0]), &[0, 0, 0, 0]);
        assert!(matches!(sidecar(&[color_section]).waveform_color(), Err(SidecarWarning::Facet { .. })));

        let section = section(b"PWV3", 24, &be32(&[1, 10, 0]), &[0, 0]);
        assert!(matches!(sidecar(&[section]).waveform_detail(), Err(SidecarWarning::Facet { .. })));
    }

    #[test]
    fn test_missing_facets() {
        let sidecar = sidecar(&[]);
        assert_eq!(sidecar.path().unwrap(), None);
        assert_eq!(sidecar.beat_grid().unwrap(), None);
        assert!(sidecar.cue_lists().unwrap().is_empty());
        assert_eq!(sidecar.waveform_preview().unwrap(), None);
        assert_eq!(sidecar.waveform_detail().unwrap(), None);
        assert_eq!(sidecar.waveform_color().unwrap(), None);
    }
}
