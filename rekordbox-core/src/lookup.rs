//! Id/name lookup tables (genres, artists, albums, keys, ...)

use std::collections::HashSet;
use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;

use crate::page::{Row, TableType};
use crate::pdb::Database;
use crate::report::{CorruptionReason, CorruptionReport};
use crate::string::decode_checked;

/// Artist subtype whose name offset is a u16 instead of a u8
const ARTIST_FAR_SUBTYPE: u16 = 0x64;

/// Album subtype whose name offset is a u16 instead of a u8
const ALBUM_FAR_SUBTYPE: u16 = 0x84;

/// Tables made of (id, name) rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupTable {
    Genres,
    Artists,
    Albums,
    Labels,
    Keys,
    Colors,
    Artwork,
    Columns,
}

impl LookupTable {
    pub const ALL: [LookupTable; 8] = [
        LookupTable::Genres,
        LookupTable::Artists,
        LookupTable::Albums,
        LookupTable::Labels,
        LookupTable::Keys,
        LookupTable::Colors,
        LookupTable::Artwork,
        LookupTable::Columns,
    ];

    pub fn table(self) -> TableType {
        match self {
            LookupTable::Genres => TableType::Genres,
            LookupTable::Artists => TableType::Artists,
            LookupTable::Albums => TableType::Albums,
            LookupTable::Labels => TableType::Labels,
            LookupTable::Keys => TableType::Keys,
            LookupTable::Colors => TableType::Colors,
            LookupTable::Artwork => TableType::Artwork,
            LookupTable::Columns => TableType::Columns,
        }
    }

    pub fn for_table(table: TableType) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.table() == table)
    }

    /// Shortest row that can hold the fixed fields and a string flag byte
    fn min_row_len(self) -> usize {
        match self {
            LookupTable::Genres | LookupTable::Labels | LookupTable::Artwork | LookupTable::Columns => 5,
            LookupTable::Keys | LookupTable::Colors => 9,
            LookupTable::Artists => 10,
            LookupTable::Albums => 0x16,
        }
    }
}

/// One row of a lookup table. For artwork the name is the image path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedEntry {
    pub id: u32,
    pub name: String,
    /// Set for albums
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist_id: Option<u32>,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct ArtistRow {
    _subtype: u16,
    _index_shift: u16,
    id: u32,
    _unknown: u8,
    near_name: u8,
    #[br(if(_subtype == ARTIST_FAR_SUBTYPE))]
    far_name: Option<u16>,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct AlbumRow {
    _subtype: u16,
    _index_shift: u16,
    _unknown1: u32,
    artist_id: u32,
    id: u32,
    _unknown2: u32,
    _unknown3: u8,
    near_name: u8,
    #[br(if(_subtype == ALBUM_FAR_SUBTYPE))]
    far_name: Option<u16>,
}

/// Decode a lookup table; rows with unreadable names are skipped
pub(crate) fn project(db: &Database, lookup: LookupTable, report: &mut CorruptionReport) -> Vec<NamedEntry> {
    let table = lookup.table();
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    db.scan_rows(table, lookup.min_row_len(), report, |row, report| {
        let entry = match decode_row(lookup, row) {
            Ok(entry) => entry,
            Err((id, reason)) => {
                let entity = id.map(|id| format!("{} {}", table, id));
                report.row_fault(table, entity.as_deref(), row.context(), reason);
                return;
            }
        };
        if !seen.insert(entry.id) {
            let reason = CorruptionReason::DuplicateId { id: entry.id };
            report.row_fault(table, Some(&entry.name), row.context(), reason);
            return;
        }
        report.row_ok(table);
        entries.push(entry);
    });

    entries
}

type RowError = (Option<u32>, CorruptionReason);

fn decode_row(lookup: LookupTable, row: &Row<'_>) -> Result<NamedEntry, RowError> {
    let bytes = row.bytes();
    let field = |offset: usize| -> Result<u32, RowError> {
        crate::source::u32_le(bytes, offset).ok_or_else(|| (None, truncated()))
    };
    let short = |offset: usize| -> Result<u32, RowError> {
        crate::source::u16_le(bytes, offset)
            .map(u32::from)
            .ok_or_else(|| (None, truncated()))
    };

    let (id, name_offset, artist_id) = match lookup {
        LookupTable::Genres | LookupTable::Labels | LookupTable::Artwork => (field(0)?, 4, None),
        LookupTable::Keys => (field(0)?, 8, None),
        LookupTable::Colors => (short(5)?, 8, None),
        LookupTable::Columns => (short(0)?, 4, None),
        LookupTable::Artists => {
            let raw: ArtistRow = Cursor::new(bytes).read_le().map_err(|e| (None, malformed(e)))?;
            let offset = raw.far_name.map(usize::from).unwrap_or(raw.near_name as usize);
            (raw.id, offset, None)
        }
        LookupTable::Albums => {
            let raw: AlbumRow = Cursor::new(bytes).read_le().map_err(|e| (None, malformed(e)))?;
            let offset = raw.far_name.map(usize::from).unwrap_or(raw.near_name as usize);
            (raw.id, offset, Some(raw.artist_id))
        }
    };

    let field_name = match lookup {
        LookupTable::Artwork => "path",
        _ => "name",
    };
    if name_offset >= bytes.len() {
        return Err((
            Some(id),
            CorruptionReason::StringOffsetOutOfRow {
                field: field_name,
                offset: name_offset,
                row_len: bytes.len(),
            },
        ));
    }
    let (name, _) = decode_checked(bytes, name_offset).map_err(|error| {
        (
            Some(id),
            CorruptionReason::BadString {
                field: field_name,
                error,
            },
        )
    })?;

    Ok(NamedEntry {
        id,
        name: name.into_string(),
        artist_id,
    })
}

fn truncated() -> CorruptionReason {
    CorruptionReason::Malformed {
        detail: "row ends inside its fixed fields".to_string(),
    }
}

fn malformed(e: binrw::Error) -> CorruptionReason {
    CorruptionReason::Malformed { detail: e.to_string() }
}
