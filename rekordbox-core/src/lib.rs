//! rekordbox-core: read-only access to Pioneer DJ export formats
//!
//! This crate decodes:
//! - export.pdb (DeviceSQL database) - little-endian
//! - ANLZ files (.DAT, .EXT, .2EX) - big-endian
//!
//! Damaged pages and rows are skipped and logged in a [`CorruptionReport`]
//! instead of failing the whole file.
//!
//! Based on Deep Symmetry's reverse engineering of the formats.

pub mod analysis;
pub mod anlz;
pub mod error;
pub mod history;
pub mod lookup;
pub mod options;
pub mod page;
pub mod pdb;
pub mod playlist;
pub mod report;
pub mod source;
pub mod string;
pub mod track;

#[cfg(test)]
mod fixture;

pub use anlz::{AnlzSection, SectionMap, Sidecar, SidecarWarning, Tag};
pub use error::{Error, Result};
pub use lookup::{LookupTable, NamedEntry};
pub use options::ParseOptions;
pub use page::TableType;
pub use pdb::{Database, TableDirectoryEntry, TableRecords};
pub use playlist::{PlaylistNode, PlaylistTree};
pub use report::{CorruptionReason, CorruptionReport, Parsed};
pub use source::ByteSource;
pub use track::Track;
