//! ANLZ analysis file reader (.DAT, .EXT, .2EX)
//!
//! ANLZ files are **big-endian**: a PMAI file header followed by a chain of
//! tagged sections:
//! - PPTH: File path
//! - PQTZ: Beat grid
//! - PWAV: Preview waveform (monochrome)
//! - PCOB: Cue/loop points
//! - PWV3/PWV4/PWV5: Detail and color waveforms
//!
//! Each section header carries its own header length and the total section
//! length, so unknown sections can be skipped.
//!
//! Reference: https://djl-analysis.deepsymmetry.org/rekordbox-export-analysis/anlz.html

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::Path;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::{self, BeatGrid, ColorWaveform, CueList, WaveformDetail, WaveformPreview};
use crate::error::{Error, Result};
use crate::source::ByteSource;

/// Smallest legal PMAI header
pub const MIN_HEADER_LEN: u32 = 28;

/// Tag, header length and total length
pub const SECTION_HEADER_LEN: usize = 12;

/// Every section tag starts with this byte
const TAG_LEAD: u8 = b'P';

/// Four-byte section tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const PMAI: Tag = Tag(*b"PMAI");
    pub const PPTH: Tag = Tag(*b"PPTH");
    pub const PQTZ: Tag = Tag(*b"PQTZ");
    pub const PWAV: Tag = Tag(*b"PWAV");
    pub const PWV2: Tag = Tag(*b"PWV2");
    pub const PWV3: Tag = Tag(*b"PWV3");
    pub const PWV4: Tag = Tag(*b"PWV4");
    pub const PWV5: Tag = Tag(*b"PWV5");
    pub const PCOB: Tag = Tag(*b"PCOB");
    pub const PCO2: Tag = Tag(*b"PCO2");
    pub const PCPT: Tag = Tag(*b"PCPT");
    pub const PVBR: Tag = Tag(*b"PVBR");
    pub const PSSI: Tag = Tag(*b"PSSI");

    /// Parse a tag given as text, e.g. on the command line
    pub fn from_str_lossy(s: &str) -> Option<Tag> {
        let bytes: [u8; 4] = s.as_bytes().try_into().ok()?;
        Some(Tag(bytes))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

impl Serialize for Tag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// PMAI file header
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[br(big)]
pub struct AnlzHeader {
    #[br(map = |bytes: [u8; 4]| Tag(bytes))]
    pub magic: Tag,
    pub len_header: u32,
    pub len_file: u32,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(big)]
struct SectionHeader {
    #[br(map = |bytes: [u8; 4]| Tag(bytes))]
    tag: Tag,
    header_len: u32,
    body_len: u32,
}

/// One tagged section, copied out of the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnlzSection {
    pub tag: Tag,
    /// Length of the section's own header, tag included
    pub header_len: u32,
    /// Total section length as declared, header included
    pub body_len: u32,
    /// File offset of the tag
    pub offset: usize,
    /// The whole section starting at its tag, cut short if `truncated`
    #[serde(skip)]
    pub data: Vec<u8>,
    /// The declared length ran past the end of the file
    pub truncated: bool,
}

impl AnlzSection {
    /// Bytes after the section header
    pub fn payload(&self) -> &[u8] {
        let start = (self.header_len as usize).min(self.data.len());
        &self.data[start..]
    }
}

/// Problems found while walking sections. None of them stop the file from
/// being used; sections read before the problem stay valid.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SidecarWarning {
    #[error("header declares {declared} bytes but the file has {available}")]
    FileTruncated { declared: u32, available: usize },

    #[error("section {tag} at {offset} declares {declared} bytes, only {available} remain")]
    SectionOverrun {
        tag: Tag,
        offset: usize,
        declared: u32,
        available: usize,
    },

    #[error("section {tag} at {offset} has impossible length {body_len}")]
    BadSectionLength { tag: Tag, offset: usize, body_len: u32 },

    #[error("section header at {offset} is cut off by the end of the file")]
    HeaderCutOff { offset: usize },

    #[error("section {tag}: {detail}")]
    Facet { tag: Tag, detail: String },
}

/// An opened ANLZ file
#[derive(Debug)]
pub struct Sidecar {
    source: ByteSource,
    header: AnlzHeader,
}

impl Sidecar {
    pub fn open(source: ByteSource) -> Result<Self> {
        if source.len() < SECTION_HEADER_LEN {
            return Err(Error::InvalidSidecar(format!(
                "file is {} bytes, too short for a header",
                source.len()
            )));
        }
        let header: AnlzHeader = Cursor::new(source.slice(0, SECTION_HEADER_LEN)?).read_be()?;

        if header.magic != Tag::PMAI {
            return Err(Error::InvalidSidecar(format!("signature is {}, expected PMAI", header.magic)));
        }
        if header.len_header < MIN_HEADER_LEN || header.len_header > header.len_file {
            return Err(Error::InvalidSidecar(format!(
                "header length {} outside {}..={}",
                header.len_header, MIN_HEADER_LEN, header.len_file
            )));
        }
        if header.len_header as usize > source.len() {
            return Err(Error::InvalidSidecar(format!(
                "header length {} exceeds the {}-byte file",
                header.len_header,
                source.len()
            )));
        }

        let sidecar = Self { source, header };
        if let Some(warning) = sidecar.truncation() {
            warn!("{}", warning);
        }
        debug!(len_file = header.len_file, "opened analysis file");
        Ok(sidecar)
    }

    /// Memory-map and open the file at `path`
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(ByteSource::map(path)?)
    }

    pub fn header(&self) -> &AnlzHeader {
        &self.header
    }

    /// Set when the header promises more bytes than the file has
    pub fn truncation(&self) -> Option<SidecarWarning> {
        (self.header.len_file as usize > self.source.len()).then(|| SidecarWarning::FileTruncated {
            declared: self.header.len_file,
            available: self.source.len(),
        })
    }

    /// Walk the section chain
    pub fn sections(&self) -> Sections<'_> {
        let bytes = self.source.as_bytes();
        let end = (self.header.len_file as usize).min(bytes.len());
        Sections {
            bytes: &bytes[..end],
            offset: self.header.len_header as usize,
            pending: None,
            done: false,
        }
    }

    /// All sections carrying `tag`, in file order. The first is authoritative.
    pub fn section(&self, tag: Tag) -> Vec<AnlzSection> {
        self.sections()
            .filter_map(|s| s.ok())
            .filter(|s| s.tag == tag)
            .collect()
    }

    /// Read every section, grouped by tag, along with any warnings
    pub fn read_sections(&self) -> SectionMap {
        let mut map = SectionMap::default();
        map.warnings.extend(self.truncation());
        for section in self.sections() {
            match section {
                Ok(section) => map.sections.entry(section.tag).or_default().push(section),
                Err(warning) => map.warnings.push(warning),
            }
        }
        map
    }

    fn first(&self, tag: Tag) -> Option<AnlzSection> {
        self.sections().filter_map(|s| s.ok()).find(|s| s.tag == tag)
    }

    /// Track path from PPTH
    pub fn path(&self) -> std::result::Result<Option<String>, SidecarWarning> {
        self.first(Tag::PPTH).map(|s| analysis::decode_path(&s)).transpose()
    }

    /// Beat grid from PQTZ
    pub fn beat_grid(&self) -> std::result::Result<Option<BeatGrid>, SidecarWarning> {
        self.first(Tag::PQTZ).map(|s| analysis::decode_beat_grid(&s)).transpose()
    }

    /// Every PCOB cue list (memory cues and hot cues are stored separately)
    pub fn cue_lists(&self) -> std::result::Result<Vec<CueList>, SidecarWarning> {
        self.section(Tag::PCOB).iter().map(analysis::decode_cue_list).collect()
    }

    /// Monochrome preview from PWAV
    pub fn waveform_preview(&self) -> std::result::Result<Option<WaveformPreview>, SidecarWarning> {
        self.first(Tag::PWAV).map(|s| analysis::decode_waveform_preview(&s)).transpose()
    }

    /// Monochrome detail waveform from PWV3
    pub fn waveform_detail(&self) -> std::result::Result<Option<WaveformDetail>, SidecarWarning> {
        self.first(Tag::PWV3).map(|s| analysis::decode_waveform_detail(&s)).transpose()
    }

    /// Colour detail waveform from PWV5
    pub fn waveform_color(&self) -> std::result::Result<Option<ColorWaveform>, SidecarWarning> {
        self.first(Tag::PWV5).map(|s| analysis::decode_color_waveform(&s)).transpose()
    }
}

/// Lazy walk over the section chain
///
/// Stops at the first tag not starting with 'P'. A section running past the
/// end of the file is yielded with `truncated` set, followed by one warning.
#[derive(Debug)]
pub struct Sections<'a> {
    bytes: &'a [u8],
    offset: usize,
    pending: Option<SidecarWarning>,
    done: bool,
}

impl<'a> Sections<'a> {
    fn finish(&mut self, warning: SidecarWarning) -> Option<std::result::Result<AnlzSection, SidecarWarning>> {
        warn!("{}", warning);
        self.done = true;
        Some(Err(warning))
    }
}

impl<'a> Iterator for Sections<'a> {
    type Item = std::result::Result<AnlzSection, SidecarWarning>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(warning) = self.pending.take() {
            return self.finish(warning);
        }
        if self.done {
            return None;
        }

        let offset = self.offset;
        let remaining = self.bytes.len().saturating_sub(offset);
        if remaining == 0 || self.bytes.get(offset) != Some(&TAG_LEAD) {
            debug!(offset, "end of section chain");
            self.done = true;
            return None;
        }
        if remaining < SECTION_HEADER_LEN {
            return self.finish(SidecarWarning::HeaderCutOff { offset });
        }

        let header: SectionHeader = match Cursor::new(&self.bytes[offset..]).read_be() {
            Ok(header) => header,
            Err(_) => return self.finish(SidecarWarning::HeaderCutOff { offset }),
        };
        if (header.body_len as usize) < SECTION_HEADER_LEN {
            return self.finish(SidecarWarning::BadSectionLength {
                tag: header.tag,
                offset,
                body_len: header.body_len,
            });
        }

        let declared = header.body_len as usize;
        let truncated = declared > remaining;
        let data = self.bytes[offset..offset + declared.min(remaining)].to_vec();
        if truncated {
            self.pending = Some(SidecarWarning::SectionOverrun {
                tag: header.tag,
                offset,
                declared: header.body_len,
                available: remaining,
            });
        } else {
            self.offset = offset + declared;
        }

        Some(Ok(AnlzSection {
            tag: header.tag,
            header_len: header.header_len,
            body_len: header.body_len,
            offset,
            data,
            truncated,
        }))
    }
}

/// Sections grouped by tag
#[derive(Debug, Clone, Default, Serialize)]
pub struct SectionMap {
    pub sections: BTreeMap<Tag, Vec<AnlzSection>>,
    pub warnings: Vec<SidecarWarning>,
}

impl SectionMap {
    /// The authoritative section for `tag`
    pub fn first(&self, tag: Tag) -> Option<&AnlzSection> {
        self.sections.get(&tag).and_then(|s| s.first())
    }

    /// Later sections with the same tag
    pub fn alternates(&self, tag: Tag) -> &[AnlzSection] {
        self.sections.get(&tag).map(|s| s.get(1..).unwrap_or(&[])).unwrap_or(&[])
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.sections.keys().copied()
    }
}
