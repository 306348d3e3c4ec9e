//! PDB (DeviceSQL) database reader
//!
//! The export.pdb file is a little-endian database split into fixed-size
//! pages. Page 0 holds the file header and the table directory; every table
//! is a singly linked chain of pages starting at its `first_page`.
//!
//! Reference: https://djl-analysis.deepsymmetry.org/rekordbox-export-analysis/exports.html

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::Path;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::history::HistoryPlaylist;
use crate::lookup::{LookupTable, NamedEntry};
use crate::options::ParseOptions;
use crate::page::{Page, Row, TableType, NULL_PAGE, PAGE_HEADER_SIZE, ROW_GROUP_SIZE};
use crate::playlist::{PlaylistEntry, PlaylistTree};
use crate::report::{CorruptionReason, CorruptionReport, Parsed};
use crate::source::ByteSource;
use crate::track::Track;

/// Bytes needed before the table directory can be read
pub const MIN_FILE_LEN: usize = 32;

/// Offset of the first table directory entry
pub const DIRECTORY_OFFSET: usize = 28;

/// Size of one table directory entry
pub const DIRECTORY_ENTRY_SIZE: usize = 16;

/// Database file header
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[br(little)]
pub struct FileHeader {
    /// Always 0
    pub signature: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Number of table directory entries
    pub table_count: u32,
    /// Next unused page
    pub next_unused_page: u32,
    /// Unknown
    pub unknown: u32,
    /// Sequence counter
    pub sequence: u32,
    /// Gap before the directory
    pub gap: u32,
}

/// Pointer to a table's pages, as stored
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
struct TablePointer {
    table_type: u32,
    empty_candidate: u32,
    first_page: u32,
    last_page: u32,
}

/// One table directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableDirectoryEntry {
    pub table_type: TableType,
    pub empty_candidate: u32,
    pub first_page: u32,
    pub last_page: u32,
    /// False when first_page or last_page lies past the end of the file
    pub valid: bool,
}

/// An opened export.pdb
#[derive(Debug)]
pub struct Database {
    source: ByteSource,
    header: FileHeader,
    tables: BTreeMap<TableType, TableDirectoryEntry>,
    directory_truncated: bool,
    options: ParseOptions,
}

impl Database {
    /// Open a database with default options
    pub fn open(source: ByteSource) -> Result<Self> {
        Self::open_with(source, ParseOptions::default())
    }

    /// Memory-map and open the database at `path`
    pub fn open_path<P: AsRef<Path>>(path: P, options: ParseOptions) -> Result<Self> {
        Self::open_with(ByteSource::map(path)?, options)
    }

    pub fn open_with(source: ByteSource, options: ParseOptions) -> Result<Self> {
        if source.len() < MIN_FILE_LEN {
            return Err(Error::InvalidHeader(format!(
                "file is {} bytes, header needs {}",
                source.len(),
                MIN_FILE_LEN
            )));
        }

        let header: FileHeader = Cursor::new(source.slice(0, MIN_FILE_LEN)?).read_le()?;
        if header.signature != 0 {
            return Err(Error::InvalidHeader(format!(
                "signature is 0x{:08x}, expected 0",
                header.signature
            )));
        }

        let min_page_size = options.min_page_size.max((PAGE_HEADER_SIZE + ROW_GROUP_SIZE) as u32);
        if !header.page_size.is_power_of_two() || header.page_size < min_page_size {
            return Err(Error::InvalidPageSize(header.page_size, min_page_size));
        }

        let mut db = Self {
            source,
            header,
            tables: BTreeMap::new(),
            directory_truncated: false,
            options,
        };
        db.read_directory();

        debug!(
            page_size = header.page_size,
            pages = db.page_count(),
            tables = db.tables.len(),
            "opened database"
        );
        Ok(db)
    }

    fn read_directory(&mut self) {
        let end = (self.header.page_size as usize).min(self.source.len());
        let page_count = self.page_count();

        for i in 0..self.header.table_count as usize {
            let offset = DIRECTORY_OFFSET + i * DIRECTORY_ENTRY_SIZE;
            let bytes = match self.source.slice(offset, DIRECTORY_ENTRY_SIZE) {
                Ok(bytes) if offset + DIRECTORY_ENTRY_SIZE <= end => bytes,
                _ => {
                    warn!(
                        declared = self.header.table_count,
                        read = i,
                        "table directory runs past the header page"
                    );
                    self.directory_truncated = true;
                    break;
                }
            };
            let pointer: TablePointer = match Cursor::new(bytes).read_le() {
                Ok(pointer) => pointer,
                Err(e) => {
                    warn!(entry = i, "unreadable table directory entry: {}", e);
                    self.directory_truncated = true;
                    break;
                }
            };

            let entry = TableDirectoryEntry {
                table_type: TableType::from(pointer.table_type),
                empty_candidate: pointer.empty_candidate,
                first_page: pointer.first_page,
                last_page: pointer.last_page,
                valid: pointer.first_page < page_count && pointer.last_page < page_count,
            };
            if !entry.valid {
                warn!(
                    table = %entry.table_type,
                    first_page = entry.first_page,
                    last_page = entry.last_page,
                    pages = page_count,
                    "table range extends past end of file"
                );
            }
            if self.tables.insert(entry.table_type, entry).is_some() {
                debug!(table = %entry.table_type, "duplicate directory entry, keeping the last");
            }
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Table directory, keyed by table type
    pub fn tables(&self) -> &BTreeMap<TableType, TableDirectoryEntry> {
        &self.tables
    }

    pub fn table(&self, table: TableType) -> Option<&TableDirectoryEntry> {
        self.tables.get(&table)
    }

    /// The directory declared more entries than the header page holds
    pub fn directory_truncated(&self) -> bool {
        self.directory_truncated
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    /// Number of whole pages in the file
    pub fn page_count(&self) -> u32 {
        (self.source.len() / self.page_size()).min(u32::MAX as usize) as u32
    }

    /// Read the page at position `index`
    pub fn page(&self, index: u32) -> std::result::Result<Page<'_>, CorruptionReason> {
        let bytes = (index as usize)
            .checked_mul(self.page_size())
            .and_then(|offset| self.source.slice(offset, self.page_size()).ok())
            .ok_or(CorruptionReason::PageOutOfBounds {
                page: index,
                page_size: self.header.page_size,
                file_len: self.source.len(),
            })?;
        Page::parse(index, bytes)
    }

    /// Walk the page chain of a table. Empty when the table is absent.
    pub fn pages_of(&self, table: TableType) -> PageChain<'_> {
        let entry = self.tables.get(&table);
        let max_steps = match self.options.max_chain_steps {
            0 => self.page_count() as usize,
            n => n,
        };
        PageChain {
            db: self,
            table,
            next: entry.map(|e| e.first_page),
            last_page: entry.map(|e| e.last_page).unwrap_or(NULL_PAGE),
            visited: HashSet::new(),
            steps: 0,
            max_steps,
            done: entry.is_none(),
        }
    }

    /// Feed every readable row of `table` to `visit`, recording page and row
    /// faults in `report`. Rows shorter than `min_len` are faults.
    pub(crate) fn scan_rows<F>(&self, table: TableType, min_len: usize, report: &mut CorruptionReport, mut visit: F)
    where
        F: FnMut(&Row<'_>, &mut CorruptionReport),
    {
        for step in self.pages_of(table) {
            let page = match step {
                Ok(page) => page,
                Err(fault) => {
                    if fault.fatal {
                        report.chain_broken(table, fault.page, fault.reason);
                    } else {
                        report.page_fault(table, fault.page, fault.reason);
                    }
                    continue;
                }
            };
            report.page_read(table);

            let rows = match page.rows(min_len) {
                Ok(rows) => rows,
                Err(reason) => {
                    report.page_fault(table, page.index(), reason);
                    continue;
                }
            };
            for row in rows {
                match row {
                    Ok(row) => visit(&row, report),
                    Err(fault) => report.row_fault(table, None, fault.context, fault.reason),
                }
            }
        }
    }

    /// All tracks that decode cleanly
    pub fn tracks(&self) -> Parsed<Vec<Track>> {
        let mut report = CorruptionReport::new();
        let value = crate::track::project(self, &mut report);
        Parsed { value, report }
    }

    /// The playlist tree with each playlist's entries attached
    pub fn playlists(&self) -> Parsed<PlaylistTree> {
        let mut report = CorruptionReport::new();
        let value = crate::playlist::project(self, &mut report);
        Parsed { value, report }
    }

    /// Raw playlist entries grouped by playlist and ordered by entry index
    pub fn playlist_entries(&self) -> Parsed<BTreeMap<u32, Vec<u32>>> {
        let mut report = CorruptionReport::new();
        let value = crate::playlist::project_entries(self, TableType::PlaylistEntries, &mut report);
        Parsed { value, report }
    }

    /// Id/name rows of a lookup table
    pub fn lookup(&self, table: LookupTable) -> Parsed<Vec<NamedEntry>> {
        let mut report = CorruptionReport::new();
        let value = crate::lookup::project(self, table, &mut report);
        Parsed { value, report }
    }

    /// History playlists with their entries
    pub fn history(&self) -> Parsed<Vec<HistoryPlaylist>> {
        let mut report = CorruptionReport::new();
        let value = crate::history::project(self, &mut report);
        Parsed { value, report }
    }

    fn count_rows(&self, table: TableType, report: &mut CorruptionReport) -> usize {
        let mut rows = 0;
        self.scan_rows(table, 0, report, |_, report| {
            report.row_ok(table);
            rows += 1;
        });
        rows
    }

    /// Decode any table with the projector that fits it
    pub fn project(&self, table: TableType) -> Parsed<TableRecords> {
        let mut report = CorruptionReport::new();
        let value = match table {
            TableType::Tracks => TableRecords::Tracks(crate::track::project(self, &mut report)),
            TableType::Genres
            | TableType::Artists
            | TableType::Albums
            | TableType::Labels
            | TableType::Keys
            | TableType::Colors
            | TableType::Artwork
            | TableType::Columns => match LookupTable::for_table(table) {
                Some(lookup) => TableRecords::Named(crate::lookup::project(self, lookup, &mut report)),
                None => TableRecords::Opaque {
                    rows: self.count_rows(table, &mut report),
                },
            },
            TableType::PlaylistTree => TableRecords::Playlists(crate::playlist::project(self, &mut report)),
            TableType::PlaylistEntries | TableType::HistoryEntries => {
                TableRecords::Entries(crate::playlist::scan_entries(self, table, &mut report))
            }
            TableType::HistoryPlaylists => TableRecords::History(crate::history::project(self, &mut report)),
            TableType::History | TableType::Unknown(_) => TableRecords::Opaque {
                rows: self.count_rows(table, &mut report),
            },
        };
        Parsed { value, report }
    }
}

/// Records of one table, as chosen by [`Database::project`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "records", rename_all = "snake_case")]
pub enum TableRecords {
    Tracks(Vec<Track>),
    Named(Vec<NamedEntry>),
    Playlists(PlaylistTree),
    Entries(Vec<PlaylistEntry>),
    History(Vec<HistoryPlaylist>),
    /// Table without a known row layout; only rows are counted
    Opaque { rows: usize },
}

impl TableRecords {
    /// Records decoded, or rows counted for opaque tables
    pub fn len(&self) -> usize {
        match self {
            TableRecords::Tracks(tracks) => tracks.len(),
            TableRecords::Named(entries) => entries.len(),
            TableRecords::Playlists(tree) => tree.len(),
            TableRecords::Entries(entries) => entries.len(),
            TableRecords::History(playlists) => playlists.len(),
            TableRecords::Opaque { rows } => *rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A page the chain walk could not use
#[derive(Debug, Clone, PartialEq)]
pub struct ChainFault {
    pub page: u32,
    pub reason: CorruptionReason,
    /// The walk stopped here
    pub fatal: bool,
}

/// Lazy walk over a table's page chain
///
/// Follows each page's `next_page` pointer until the pointer is null, the
/// table's `last_page` has been visited, a page repeats, or the step cap is
/// reached. Dropping the iterator early is always fine.
#[derive(Debug)]
pub struct PageChain<'a> {
    db: &'a Database,
    table: TableType,
    next: Option<u32>,
    last_page: u32,
    visited: HashSet<u32>,
    steps: usize,
    max_steps: usize,
    done: bool,
}

impl<'a> PageChain<'a> {
    fn stop(&mut self, page: u32, reason: CorruptionReason) -> Option<std::result::Result<Page<'a>, ChainFault>> {
        self.done = true;
        Some(Err(ChainFault {
            page,
            reason,
            fatal: true,
        }))
    }

    fn follow(&self, page: &Page<'_>) -> Option<u32> {
        if page.index() == self.last_page {
            return None;
        }
        match page.next_page() {
            0 | NULL_PAGE => None,
            next => Some(next),
        }
    }
}

impl<'a> Iterator for PageChain<'a> {
    type Item = std::result::Result<Page<'a>, ChainFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(index) = self.next.take() else {
            self.done = true;
            return None;
        };

        if self.steps >= self.max_steps {
            return self.stop(index, CorruptionReason::ChainStepLimit { steps: self.steps });
        }
        if !self.visited.insert(index) {
            return self.stop(index, CorruptionReason::ChainCycle { page: index });
        }
        self.steps += 1;

        let page = match self.db.page(index) {
            Ok(page) => page,
            Err(reason) => return self.stop(index, reason),
        };

        if page.is_blank() {
            if index == self.last_page {
                debug!(table = %self.table, page = index, "blank last page ends chain");
                self.done = true;
                return None;
            }
            // the pages after this one can no longer be reached
            return self.stop(index, CorruptionReason::BlankPage { page: index });
        }

        self.next = self.follow(&page);

        let found = page.table_type();
        if found != self.table {
            return Some(Err(ChainFault {
                page: index,
                reason: CorruptionReason::TableMismatch {
                    expected: self.table,
                    found,
                },
                fatal: false,
            }));
        }
        if self.db.options.strict_page_index && page.header().page_index != index {
            return Some(Err(ChainFault {
                page: index,
                reason: CorruptionReason::PageIndexMismatch {
                    stored: page.header().page_index,
                },
                fatal: false,
            }));
        }

        Some(Ok(page))
    }
}
