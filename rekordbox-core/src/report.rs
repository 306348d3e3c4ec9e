//! Corruption bookkeeping
//!
//! Projectors never fail on a bad page or row. They record what went wrong
//! in a [`CorruptionReport`] and move on. Reports are plain values, so each
//! worker can keep its own and [`merge`](CorruptionReport::merge) them later.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::page::TableType;
use crate::string::StringError;

/// Where in the file a problem was found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Context {
    pub page: Option<u32>,
    pub row: Option<u16>,
    pub offset: Option<usize>,
}

impl Context {
    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            ..Self::default()
        }
    }
}

/// Why a page, row, field or node was rejected
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptionReason {
    #[error("page {page} lies outside the file ({page_size}-byte pages, {file_len}-byte file)")]
    PageOutOfBounds { page: u32, page_size: u32, file_len: usize },

    #[error("page {page} is only {len} bytes")]
    PageTooSmall { page: u32, len: usize },

    #[error("page belongs to table {found}, expected {expected}")]
    TableMismatch { expected: TableType, found: TableType },

    #[error("page header claims index {stored}")]
    PageIndexMismatch { stored: u32 },

    #[error("row index of {slots} slots needs {index_len} bytes, page has {available}")]
    RowIndexOverflow { slots: usize, index_len: usize, available: usize },

    #[error("row at offset {offset} needs {required} bytes but the heap ends at {heap_end}")]
    RowOutOfBounds { offset: usize, required: usize, heap_end: usize },

    #[error("field {field}: {error}")]
    BadString { field: &'static str, error: StringError },

    #[error("field {field}: string offset {offset} is outside the {row_len}-byte row")]
    StringOffsetOutOfRow { field: &'static str, offset: usize, row_len: usize },

    #[error("track has no title")]
    MissingTitle,

    #[error("row has reserved id 0")]
    ZeroId,

    #[error("id {id} already seen")]
    DuplicateId { id: u32 },

    #[error("parent chain loops back: {path:?}")]
    PlaylistCycle { path: Vec<u32> },

    #[error("page {page} is blank but the chain continues past it")]
    BlankPage { page: u32 },

    #[error("page {page} already visited, chain is cyclic")]
    ChainCycle { page: u32 },

    #[error("chain walk stopped after {steps} pages")]
    ChainStepLimit { steps: usize },

    #[error("malformed structure: {detail}")]
    Malformed { detail: String },
}

impl CorruptionReason {
    /// Problems with the chain itself rather than with one page in it
    pub fn is_chain_warning(&self) -> bool {
        matches!(
            self,
            CorruptionReason::ChainCycle { .. } | CorruptionReason::ChainStepLimit { .. }
        )
    }
}

/// How much of the file a corruption entry cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Page,
    Row,
    Field,
    Chain,
}

/// One entry in the corruption log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Corruption {
    pub table: TableType,
    pub scope: Scope,
    /// Best-effort name of the affected record
    pub entity: Option<String>,
    pub reason: CorruptionReason,
    pub context: Context,
}

/// Per-table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub pages: usize,
    pub rows: usize,
    pub corrupt_pages: usize,
    pub corrupt_rows: usize,
    pub field_errors: usize,
    /// Entry rows naming a parent record that does not exist
    pub unattached_entries: usize,
    /// The chain walk ended early, so rows may be missing
    pub partial: bool,
}

impl TableStats {
    fn merge(&mut self, other: &TableStats) {
        self.pages += other.pages;
        self.rows += other.rows;
        self.corrupt_pages += other.corrupt_pages;
        self.corrupt_rows += other.corrupt_rows;
        self.field_errors += other.field_errors;
        self.unattached_entries += other.unattached_entries;
        self.partial |= other.partial;
    }
}

/// Playlist counters. Every playlist-tree page, row or node that failed
/// validation is counted once in `corrupt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaylistStats {
    pub total_playlists: usize,
    pub valid_playlists: usize,
    pub corrupt_playlists: usize,
    /// Valid nodes moved to the root because their parent was lost
    pub reparented: usize,
    /// Entries naming a playlist that is not in the tree
    pub unattached_entries: usize,
}

impl PlaylistStats {
    fn valid(&mut self) {
        self.valid_playlists += 1;
        self.total_playlists += 1;
    }

    fn corrupt(&mut self) {
        self.corrupt_playlists += 1;
        self.total_playlists += 1;
    }
}

/// Accumulated corruption log and counters for one or more parse passes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorruptionReport {
    tables: BTreeMap<TableType, TableStats>,
    playlists: PlaylistStats,
    entries: Vec<Corruption>,
}

impl CorruptionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, table: TableType) -> TableStats {
        self.tables.get(&table).copied().unwrap_or_default()
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableType, &TableStats)> {
        self.tables.iter().map(|(t, s)| (*t, s))
    }

    pub fn playlists(&self) -> PlaylistStats {
        self.playlists
    }

    pub fn entries(&self) -> &[Corruption] {
        &self.entries
    }

    /// True when nothing at all was rejected
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pages and rows rejected, across all tables
    pub fn corrupt_records(&self) -> usize {
        self.tables.values().map(|s| s.corrupt_pages + s.corrupt_rows).sum()
    }

    pub fn merge(&mut self, other: CorruptionReport) {
        for (table, stats) in &other.tables {
            self.tables.entry(*table).or_default().merge(stats);
        }
        self.playlists.total_playlists += other.playlists.total_playlists;
        self.playlists.valid_playlists += other.playlists.valid_playlists;
        self.playlists.corrupt_playlists += other.playlists.corrupt_playlists;
        self.playlists.reparented += other.playlists.reparented;
        self.playlists.unattached_entries += other.playlists.unattached_entries;
        self.entries.extend(other.entries);
    }

    fn stats(&mut self, table: TableType) -> &mut TableStats {
        self.tables.entry(table).or_default()
    }

    pub(crate) fn page_read(&mut self, table: TableType) {
        self.stats(table).pages += 1;
    }

    pub(crate) fn row_ok(&mut self, table: TableType) {
        self.stats(table).rows += 1;
    }

    pub(crate) fn playlist_valid(&mut self) {
        self.playlists.valid();
    }

    pub(crate) fn playlist_reparented(&mut self) {
        self.playlists.reparented += 1;
    }

    pub(crate) fn unattached_entries(&mut self, count: usize) {
        self.playlists.unattached_entries += count;
        self.stats(TableType::PlaylistEntries).unattached_entries += count;
    }

    /// History entries whose session is missing
    pub(crate) fn unattached_history(&mut self, count: usize) {
        self.stats(TableType::HistoryEntries).unattached_entries += count;
    }

    /// A page was skipped. Chain warnings mark the table partial instead of
    /// counting a corrupt page.
    pub(crate) fn page_fault(&mut self, table: TableType, page: u32, reason: CorruptionReason) {
        if reason.is_chain_warning() {
            warn!(%table, page, "table chain cut short: {}", reason);
            self.stats(table).partial = true;
            self.push(table, Scope::Chain, None, Context::page(page), reason);
            return;
        }

        warn!(%table, page, "corrupt page skipped: {}", reason);
        self.stats(table).corrupt_pages += 1;
        if table == TableType::PlaylistTree {
            self.playlists.corrupt();
        }
        self.push(table, Scope::Page, None, Context::page(page), reason);
    }

    /// The chain ended at a page that could not be read at all
    pub(crate) fn chain_broken(&mut self, table: TableType, page: u32, reason: CorruptionReason) {
        self.page_fault(table, page, reason);
        self.stats(table).partial = true;
    }

    /// A row was skipped
    pub(crate) fn row_fault(
        &mut self,
        table: TableType,
        entity: Option<&str>,
        context: Context,
        reason: CorruptionReason,
    ) {
        warn!(
            %table,
            entity = entity.unwrap_or("<unknown>"),
            page = ?context.page,
            row = ?context.row,
            "corrupt row skipped: {}",
            reason
        );
        self.stats(table).corrupt_rows += 1;
        if table == TableType::PlaylistTree {
            self.playlists.corrupt();
        }
        self.push(table, Scope::Row, entity, context, reason);
    }

    /// One field of an otherwise usable row was dropped
    pub(crate) fn field_fault(
        &mut self,
        table: TableType,
        entity: Option<&str>,
        context: Context,
        reason: CorruptionReason,
    ) {
        debug!(
            %table,
            entity = entity.unwrap_or("<unknown>"),
            page = ?context.page,
            row = ?context.row,
            "field dropped: {}",
            reason
        );
        self.stats(table).field_errors += 1;
        self.push(table, Scope::Field, entity, context, reason);
    }

    fn push(
        &mut self,
        table: TableType,
        scope: Scope,
        entity: Option<&str>,
        context: Context,
        reason: CorruptionReason,
    ) {
        self.entries.push(Corruption {
            table,
            scope,
            entity: entity.map(str::to_string),
            reason,
            context,
        });
    }
}

/// Records decoded by a projector, together with what was skipped on the way
#[derive(Debug, Clone, Serialize)]
pub struct Parsed<T> {
    pub value: T,
    pub report: CorruptionReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_fault_counts() {
        let mut report = CorruptionReport::new();
        report.page_fault(
            TableType::Tracks,
            4,
            CorruptionReason::TableMismatch {
                expected: TableType::Tracks,
                found: TableType::Artists,
            },
        );
        assert_eq!(report.table(TableType::Tracks).corrupt_pages, 1);
        assert!(!report.table(TableType::Tracks).partial);
        assert_eq!(report.entries()[0].scope, Scope::Page);
        assert_eq!(report.entries()[0].context.page, Some(4));
        assert_eq!(report.playlists().total_playlists, 0);
    }

    #[test]
    fn test_chain_warning_marks_partial() {
        let mut report = CorruptionReport::new();
        report.page_fault(TableType::Tracks, 2, CorruptionReason::ChainCycle { page: 2 });
        let stats = report.table(TableType::Tracks);
        assert_eq!(stats.corrupt_pages, 0);
        assert!(stats.partial);
        assert_eq!(report.entries()[0].scope, Scope::Chain);
    }

    #[test]
    fn test_playlist_counters_balance() {
        let mut report = CorruptionReport::new();
        report.playlist_valid();
        report.playlist_valid();
        report.row_fault(TableType::PlaylistTree, Some("Broken"), Context::default(), CorruptionReason::ZeroId);
        report.page_fault(
            TableType::PlaylistTree,
            7,
            CorruptionReason::PageIndexMismatch { stored: 8 },
        );
        // Chain warnings and other tables do not touch playlist counters
        report.page_fault(TableType::PlaylistTree, 7, CorruptionReason::ChainCycle { page: 7 });
        report.row_fault(TableType::Tracks, None, Context::default(), CorruptionReason::MissingTitle);

        let stats = report.playlists();
        assert_eq!(stats.valid_playlists, 2);
        assert_eq!(stats.corrupt_playlists, 2);
        assert_eq!(stats.total_playlists, stats.valid_playlists + stats.corrupt_playlists);
    }

    #[test]
    fn test_merge() {
        let mut a = CorruptionReport::new();
        a.page_read(TableType::Tracks);
        a.row_ok(TableType::Tracks);
        a.playlist_valid();

        let mut b = CorruptionReport::new();
        b.page_read(TableType::Tracks);
        b.row_fault(TableType::Tracks, Some("x"), Context::default(), CorruptionReason::MissingTitle);
        b.field_fault(
            TableType::Tracks,
            Some("y"),
            Context::default(),
            CorruptionReason::StringOffsetOutOfRow { field: "comment", offset: 500, row_len: 200 },
        );
        b.row_fault(TableType::PlaylistTree, None, Context::default(), CorruptionReason::ZeroId);

        a.merge(b);
        let tracks = a.table(TableType::Tracks);
        assert_eq!(tracks.pages, 2);
        assert_eq!(tracks.rows, 1);
        assert_eq!(tracks.corrupt_rows, 1);
        assert_eq!(tracks.field_errors, 1);
        assert_eq!(a.entries().len(), 3);
        assert_eq!(a.corrupt_records(), 2);
        let playlists = a.playlists();
        assert_eq!(playlists.total_playlists, 2);
        assert_eq!(playlists.total_playlists, playlists.valid_playlists + playlists.corrupt_playlists);
    }

    #[test]
    fn test_reason_display() {
        let reason = CorruptionReason::BadString {
            field: "title",
            error: StringError::UnknownFlag { flag: 0x41 },
        };
        assert_eq!(reason.to_string(), "field title: unknown string flag 0x41");
    }
}
