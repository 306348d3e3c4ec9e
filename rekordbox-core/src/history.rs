//! Play history: one playlist per session, with its entries

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::page::TableType;
use crate::pdb::Database;
use crate::playlist::project_entries;
use crate::report::{CorruptionReason, CorruptionReport};
use crate::string::decode_checked;

/// A recorded play session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPlaylist {
    pub id: u32,
    pub name: String,
    /// Track ids in the order they were played
    pub entries: Vec<u32>,
}

pub(crate) fn project(db: &Database, report: &mut CorruptionReport) -> Vec<HistoryPlaylist> {
    let table = TableType::HistoryPlaylists;
    let mut playlists: BTreeMap<u32, HistoryPlaylist> = BTreeMap::new();

    db.scan_rows(table, 5, report, |row, report| {
        let bytes = row.bytes();
        let Some(id) = crate::source::u32_le(bytes, 0) else {
            let reason = CorruptionReason::Malformed {
                detail: "row ends inside its id".to_string(),
            };
            report.row_fault(table, None, row.context(), reason);
            return;
        };
        let name = match decode_checked(bytes, 4) {
            Ok((name, _)) => name.into_string(),
            Err(error) => {
                let entity = format!("history {}", id);
                let reason = CorruptionReason::BadString { field: "name", error };
                report.row_fault(table, Some(&entity), row.context(), reason);
                return;
            }
        };
        if playlists.contains_key(&id) {
            report.row_fault(table, Some(&name), row.context(), CorruptionReason::DuplicateId { id });
            return;
        }
        report.row_ok(table);
        playlists.insert(
            id,
            HistoryPlaylist {
                id,
                name,
                entries: Vec::new(),
            },
        );
    });

    for (playlist_id, track_ids) in project_entries(db, TableType::HistoryEntries, report) {
        match playlists.get_mut(&playlist_id) {
            Some(playlist) => playlist.entries = track_ids,
            None => {
                warn!(
                    playlist_id,
                    entries = track_ids.len(),
                    "history entries reference a missing session"
                );
                report.unattached_history(track_ids.len());
            }
        }
    }

    playlists.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{history_entry_row, named_row, DatabaseBuilder, PageBuilder};
    use crate::page::NULL_PAGE;

    #[test]
    fn test_sessions_with_entries() {
        let mut db = DatabaseBuilder::new(1024);

        let mut page = PageBuilder::new(1024, 1, TableType::HistoryPlaylists);
        page.push_row(&named_row(2, "HISTORY 002"));
        page.push_row(&named_row(1, "HISTORY 001"));
        db.push_page(page.finalize(NULL_PAGE));
        db.table(TableType::HistoryPlaylists, 1, 1);

        let mut page = PageBuilder::new(1024, 2, TableType::HistoryEntries);
        page.push_row(&history_entry_row(30, 1, 2));
        page.push_row(&history_entry_row(10, 1, 1));
        page.push_row(&history_entry_row(55, 2, 1));
        page.push_row(&history_entry_row(99, 7, 1));
        db.push_page(page.finalize(NULL_PAGE));
        db.table(TableType::HistoryEntries, 2, 2);

        let parsed = db.open().history();
        assert!(parsed.report.is_clean());
        assert_eq!(
            parsed.value,
            vec![
                HistoryPlaylist {
                    id: 1,
                    name: "HISTORY 001".to_string(),
                    entries: vec![10, 30],
                },
                HistoryPlaylist {
                    id: 2,
                    name: "HISTORY 002".to_string(),
                    entries: vec![55],
                },
            ]
        );
        assert_eq!(parsed.report.table(TableType::HistoryEntries).rows, 4);
        // track 99 was played in session 7, which does not exist
        assert_eq!(parsed.report.table(TableType::HistoryEntries).unattached_entries, 1);
    }

    #[test]
    fn test_missing_tables() {
        let parsed = DatabaseBuilder::new(1024).open().history();
        assert!(parsed.value.is_empty());
        assert!(parsed.report.is_clean());
    }
}
