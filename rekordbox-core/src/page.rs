//! Page layout for Pioneer DeviceSQL databases
//!
//! Every page starts with a 0x28-byte header. Row data lives in a heap
//! growing forward from offset 0x28; the row index grows backward from the
//! end of the page.
//!
//! Row index structure (per 16-row group, counted back from the page end):
//! - 2 bytes unknown (transaction flags)
//! - 2 bytes presence flags (bitmask of which rows exist)
//! - 16 × 2-byte offsets, row 0 nearest the flags, relative to the heap start

use std::fmt;
use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;

use crate::report::{Context, CorruptionReason};

/// Offset where heap data begins
pub const HEAP_START: usize = 0x28;

/// Size of the fixed page header
pub const PAGE_HEADER_SIZE: usize = 0x28;

/// Size of each row group in the backward-growing index
/// 2 (unknown) + 2 (flags) + 16*2 (offsets) = 36 bytes
pub const ROW_GROUP_SIZE: usize = 0x24;

/// Maximum rows per group
pub const ROWS_PER_GROUP: usize = 16;

/// Chain pointer value meaning "no next page"
pub const NULL_PAGE: u32 = 0xFFFF_FFFF;

/// Page flag bit set on index pages, which carry no rows
pub const FLAG_INDEX_PAGE: u8 = 0x40;

/// Table types in DeviceSQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableType {
    Tracks,
    Genres,
    Artists,
    Albums,
    Labels,
    Keys,
    Colors,
    PlaylistTree,
    PlaylistEntries,
    HistoryPlaylists,
    HistoryEntries,
    Artwork,
    Columns,
    History,
    Unknown(u32),
}

impl TableType {
    /// Numeric type as stored in the file
    pub fn id(self) -> u32 {
        match self {
            TableType::Tracks => 0,
            TableType::Genres => 1,
            TableType::Artists => 2,
            TableType::Albums => 3,
            TableType::Labels => 4,
            TableType::Keys => 5,
            TableType::Colors => 6,
            TableType::PlaylistTree => 7,
            TableType::PlaylistEntries => 8,
            TableType::HistoryPlaylists => 11,
            TableType::HistoryEntries => 12,
            TableType::Artwork => 13,
            TableType::Columns => 16,
            TableType::History => 19,
            TableType::Unknown(id) => id,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TableType::Tracks => "tracks",
            TableType::Genres => "genres",
            TableType::Artists => "artists",
            TableType::Albums => "albums",
            TableType::Labels => "labels",
            TableType::Keys => "keys",
            TableType::Colors => "colors",
            TableType::PlaylistTree => "playlist_tree",
            TableType::PlaylistEntries => "playlist_entries",
            TableType::HistoryPlaylists => "history_playlists",
            TableType::HistoryEntries => "history_entries",
            TableType::Artwork => "artwork",
            TableType::Columns => "columns",
            TableType::History => "history",
            TableType::Unknown(_) => "unknown",
        }
    }

    /// Every named table type, in file order
    pub const KNOWN: [TableType; 14] = [
        TableType::Tracks,
        TableType::Genres,
        TableType::Artists,
        TableType::Albums,
        TableType::Labels,
        TableType::Keys,
        TableType::Colors,
        TableType::PlaylistTree,
        TableType::PlaylistEntries,
        TableType::HistoryPlaylists,
        TableType::HistoryEntries,
        TableType::Artwork,
        TableType::Columns,
        TableType::History,
    ];

    /// Look a table up by its [`name`](Self::name)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::KNOWN.into_iter().find(|t| t.name() == name)
    }
}

impl From<u32> for TableType {
    fn from(id: u32) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|t| t.id() == id)
            .unwrap_or(TableType::Unknown(id))
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableType::Unknown(id) => write!(f, "unknown_{}", id),
            other => f.write_str(other.name()),
        }
    }
}

// Serialized by name so tables can key JSON maps
impl Serialize for TableType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Data page header
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little)]
pub struct PageHeader {
    /// Always zero
    pub signature: u32,
    /// Index this page claims to be at
    pub page_index: u32,
    /// Table type
    pub page_type: u32,
    /// Next page in this table's chain
    pub next_page: u32,
    /// Write sequence
    pub sequence: u32,
    pub unknown1: u32,
    /// Packed counts: low 13 bits row offsets ever allocated, high 11 bits live rows
    pub row_counts: [u8; 3],
    pub page_flags: u8,
    pub free_size: u16,
    pub used_size: u16,
    pub unknown5: u16,
    pub num_rows_large: u16,
    pub unknown6: u16,
    pub unknown7: u16,
}

impl PageHeader {
    fn packed_counts(&self) -> u32 {
        self.row_counts[0] as u32 | (self.row_counts[1] as u32) << 8 | (self.row_counts[2] as u32) << 16
    }

    /// Number of row slots in the index, including deleted ones
    pub fn num_row_offsets(&self) -> usize {
        (self.packed_counts() & 0x1FFF) as usize
    }

    /// Number of rows currently marked live
    pub fn num_rows(&self) -> usize {
        ((self.packed_counts() >> 13) & 0x7FF) as usize
    }

    pub fn table_type(&self) -> TableType {
        TableType::from(self.page_type)
    }

    pub fn is_data_page(&self) -> bool {
        self.page_flags & FLAG_INDEX_PAGE == 0
    }
}

/// One page of a table, borrowed from the database buffer
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    index: u32,
    header: PageHeader,
    data: &'a [u8],
}

impl<'a> Page<'a> {
    /// Parse the header of the page found at position `index`
    pub fn parse(index: u32, data: &'a [u8]) -> Result<Self, CorruptionReason> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(CorruptionReason::PageTooSmall {
                page: index,
                len: data.len(),
            });
        }
        let header: PageHeader = Cursor::new(data).read_le().map_err(|e| CorruptionReason::Malformed {
            detail: e.to_string(),
        })?;
        Ok(Self { index, header, data })
    }

    /// Position of this page in the file
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn table_type(&self) -> TableType {
        self.header.table_type()
    }

    pub fn next_page(&self) -> u32 {
        self.header.next_page
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// A page whose header was never written
    pub fn is_blank(&self) -> bool {
        self.data[..PAGE_HEADER_SIZE].iter().all(|&b| b == 0)
    }

    fn row_groups(&self) -> usize {
        self.header.num_row_offsets().div_ceil(ROWS_PER_GROUP)
    }

    /// First byte of the row index; rows must end before it
    pub fn heap_end(&self) -> usize {
        self.data.len().saturating_sub(self.row_groups() * ROW_GROUP_SIZE)
    }

    /// Iterate the rows marked present, requiring each to have at least
    /// `min_len` bytes before the row index begins.
    ///
    /// Fails when the row index claims more space than the page has.
    pub fn rows(&self, min_len: usize) -> Result<Rows<'a>, CorruptionReason> {
        let slots = if self.header.is_data_page() {
            self.header.num_row_offsets()
        } else {
            0
        };
        let index_len = slots.div_ceil(ROWS_PER_GROUP) * ROW_GROUP_SIZE;
        let available = self.data.len() - HEAP_START;
        if index_len > available {
            return Err(CorruptionReason::RowIndexOverflow {
                slots,
                index_len,
                available,
            });
        }
        Ok(Rows {
            page: *self,
            slots,
            slot: 0,
            min_len,
            heap_end: self.data.len() - index_len,
        })
    }
}

/// A raw row: the bytes from the row start up to the row index
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    page: u32,
    slot: u16,
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> Row<'a> {
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Position of this row in the page's row index
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Offset of the row start within the page
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Row bytes, starting at the row base. String offsets inside the row
    /// are relative to the start of this slice.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn context(&self) -> Context {
        Context {
            page: Some(self.page),
            row: Some(self.slot),
            offset: Some(self.offset),
        }
    }
}

/// A row slot that could not be turned into a [`Row`]
#[derive(Debug, Clone, PartialEq)]
pub struct RowFault {
    pub context: Context,
    pub reason: CorruptionReason,
}

/// Iterator over the present rows of a page
#[derive(Debug, Clone)]
pub struct Rows<'a> {
    page: Page<'a>,
    slots: usize,
    slot: usize,
    min_len: usize,
    heap_end: usize,
}

impl<'a> Rows<'a> {
    fn presence_flags(&self, group: usize) -> u16 {
        let base = self.page.data.len() - group * ROW_GROUP_SIZE;
        crate::source::u16_le(self.page.data, base - 4).unwrap_or(0)
    }

    fn row_offset(&self, group: usize, i: usize) -> u16 {
        let base = self.page.data.len() - group * ROW_GROUP_SIZE;
        crate::source::u16_le(self.page.data, base - 6 - 2 * i).unwrap_or(0)
    }
}

impl<'a> Iterator for Rows<'a> {
    type Item = Result<Row<'a>, RowFault>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.slot < self.slots {
            let slot = self.slot;
            self.slot += 1;

            let (group, i) = (slot / ROWS_PER_GROUP, slot % ROWS_PER_GROUP);
            if self.presence_flags(group) & (1 << i) == 0 {
                continue;
            }

            let offset = HEAP_START + self.row_offset(group, i) as usize;
            let context = Context {
                page: Some(self.page.index),
                row: Some(slot as u16),
                offset: Some(offset),
            };
            if offset + self.min_len > self.heap_end {
                return Some(Err(RowFault {
                    context,
                    reason: CorruptionReason::RowOutOfBounds {
                        offset,
                        required: self.min_len,
                        heap_end: self.heap_end,
                    },
                }));
            }

            return Some(Ok(Row {
                page: self.page.index,
                slot: slot as u16,
                offset,
                bytes: &self.page.data[offset..self.heap_end],
            }));
        }
        None
    }
}
