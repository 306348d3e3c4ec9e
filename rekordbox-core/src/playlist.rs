//! Playlist tree and playlist entries
//!
//! The PlaylistTree table stores one row per playlist or folder, each
//! naming its parent (0 for the root). Entries live in a separate table and
//! point back at their playlist. The parent links come straight from the
//! device, so loops and dangling parents have to be expected.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;
use tracing::warn;

use crate::page::{Row, TableType};
use crate::pdb::Database;
use crate::report::{Context, CorruptionReason, CorruptionReport};
use crate::string::decode_checked;

/// Parent id of top-level nodes
pub const ROOT_ID: u32 = 0;

/// Offset of the inline name within a tree row
const TREE_NAME_OFFSET: usize = 0x14;

/// Size of an entry row
const ENTRY_ROW_LEN: usize = 12;

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
struct PlaylistTreeRow {
    parent_id: u32,
    _unknown: u32,
    sort_order: u32,
    id: u32,
    raw_is_folder: u32,
}

/// A playlist or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistNode {
    pub id: u32,
    /// 0 for top-level nodes
    pub parent_id: u32,
    pub name: String,
    pub is_folder: bool,
    pub sort_order: u32,
    /// Track ids in playback order
    pub entries: Vec<u32>,
}

/// One row of a playlist or history entry table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaylistEntry {
    pub entry_index: u32,
    pub playlist_id: u32,
    pub track_id: u32,
}

/// Validated playlist hierarchy
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaylistTree {
    nodes: BTreeMap<u32, PlaylistNode>,
    /// Child ids per parent, ordered by (sort_order, id)
    children: BTreeMap<u32, Vec<u32>>,
    /// Entries whose playlist is not in the tree, keyed by the playlist id they name
    unattached: BTreeMap<u32, Vec<u32>>,
}

impl PlaylistTree {
    pub fn get(&self, id: u32) -> Option<&PlaylistNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top-level nodes in display order
    pub fn roots(&self) -> impl Iterator<Item = &PlaylistNode> {
        self.children(ROOT_ID)
    }

    /// Children of `id` in display order
    pub fn children(&self, id: u32) -> impl Iterator<Item = &PlaylistNode> {
        self.children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.nodes.get(child))
    }

    /// Depth-first walk in display order, yielding each node with its depth
    pub fn iter(&self) -> Walk<'_> {
        let stack = self
            .children
            .get(&ROOT_ID)
            .map(|ids| ids.iter().rev().map(|&id| (0, id)).collect())
            .unwrap_or_default();
        Walk { tree: self, stack }
    }

    /// Entries naming playlists that are not in the tree
    pub fn unattached(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.unattached
    }

    fn insert(&mut self, node: PlaylistNode) {
        self.children.entry(node.parent_id).or_default().push(node.id);
        self.nodes.insert(node.id, node);
    }

    fn sort_children(&mut self) {
        let nodes = &self.nodes;
        for ids in self.children.values_mut() {
            ids.sort_by_key(|id| nodes.get(id).map(|n| (n.sort_order, n.id)));
        }
    }
}

/// Depth-first iterator over a [`PlaylistTree`]
#[derive(Debug)]
pub struct Walk<'a> {
    tree: &'a PlaylistTree,
    stack: Vec<(usize, u32)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a PlaylistNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((depth, id)) = self.stack.pop() {
            let Some(node) = self.tree.nodes.get(&id) else {
                continue;
            };
            if let Some(children) = self.tree.children.get(&id) {
                self.stack.extend(children.iter().rev().map(|&child| (depth + 1, child)));
            }
            return Some((depth, node));
        }
        None
    }
}

/// A decoded tree row waiting for validation
struct Candidate {
    node: PlaylistNode,
    context: Context,
}

/// Build the validated tree with entries attached
pub(crate) fn project(db: &Database, report: &mut CorruptionReport) -> PlaylistTree {
    let candidates = scan_tree(db, report);
    let mut tree = assemble(candidates, report);

    let entries = project_entries(db, TableType::PlaylistEntries, report);
    for (playlist_id, track_ids) in entries {
        match tree.nodes.get_mut(&playlist_id) {
            Some(node) => node.entries = track_ids,
            None => {
                warn!(playlist_id, entries = track_ids.len(), "entries reference a missing playlist");
                report.unattached_entries(track_ids.len());
                tree.unattached.insert(playlist_id, track_ids);
            }
        }
    }
    tree
}

fn scan_tree(db: &Database, report: &mut CorruptionReport) -> BTreeMap<u32, Candidate> {
    let mut candidates = BTreeMap::new();

    db.scan_rows(TableType::PlaylistTree, TREE_NAME_OFFSET + 1, report, |row, report| {
        let node = match decode_tree_row(row) {
            Ok(node) => node,
            Err((entity, reason)) => {
                report.row_fault(TableType::PlaylistTree, Some(&entity), row.context(), reason);
                return;
            }
        };
        if node.id == 0 {
            report.row_fault(TableType::PlaylistTree, Some(&node.name), row.context(), CorruptionReason::ZeroId);
            return;
        }
        if candidates.contains_key(&node.id) {
            let reason = CorruptionReason::DuplicateId { id: node.id };
            report.row_fault(TableType::PlaylistTree, Some(&node.name), row.context(), reason);
            return;
        }
        candidates.insert(
            node.id,
            Candidate {
                node,
                context: row.context(),
            },
        );
    });

    candidates
}

fn decode_tree_row(row: &Row<'_>) -> Result<PlaylistNode, (String, CorruptionReason)> {
    let raw: PlaylistTreeRow = Cursor::new(row.bytes()).read_le().map_err(|e| {
        (
            "<unreadable playlist>".to_string(),
            CorruptionReason::Malformed { detail: e.to_string() },
        )
    })?;
    let (name, _) = decode_checked(row.bytes(), TREE_NAME_OFFSET).map_err(|error| {
        (
            format!("playlist {}", raw.id),
            CorruptionReason::BadString { field: "name", error },
        )
    })?;

    Ok(PlaylistNode {
        id: raw.id,
        parent_id: raw.parent_id,
        name: name.into_string(),
        is_folder: raw.raw_is_folder != 0,
        sort_order: raw.sort_order,
        entries: Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the walk currently in progress
    Gray,
    /// Reaches the root, a missing parent, or an already-rejected node
    Black,
    /// Part of a parent loop
    Cyclic,
}

/// Find every node that sits on a parent loop, returning each loop in walk order
fn find_cycles(candidates: &BTreeMap<u32, Candidate>) -> Vec<Vec<u32>> {
    let mut marks: HashMap<u32, Mark> = HashMap::with_capacity(candidates.len());
    let mut cycles = Vec::new();

    for &start in candidates.keys() {
        if marks.contains_key(&start) {
            continue;
        }

        let mut path = Vec::new();
        let mut current = start;
        while let Some(candidate) = candidates.get(&current) {
            if marks.contains_key(&current) {
                break;
            }
            marks.insert(current, Mark::Gray);
            path.push(current);
            current = candidate.node.parent_id;
            if current == ROOT_ID {
                break;
            }
        }

        let loop_start = match marks.get(&current) {
            Some(Mark::Gray) => path.iter().position(|&id| id == current),
            _ => None,
        };
        if let Some(at) = loop_start {
            let cycle = path.split_off(at);
            for id in &cycle {
                marks.insert(*id, Mark::Cyclic);
            }
            cycles.push(cycle);
        }
        for id in path {
            marks.insert(id, Mark::Black);
        }
    }

    cycles
}

fn assemble(mut candidates: BTreeMap<u32, Candidate>, report: &mut CorruptionReport) -> PlaylistTree {
    for cycle in find_cycles(&candidates) {
        for id in &cycle {
            if let Some(candidate) = candidates.remove(id) {
                report.row_fault(
                    TableType::PlaylistTree,
                    Some(&candidate.node.name),
                    candidate.context,
                    CorruptionReason::PlaylistCycle { path: cycle.clone() },
                );
            }
        }
    }

    let mut tree = PlaylistTree::default();
    let valid: Vec<u32> = candidates.keys().copied().collect();
    for id in valid {
        let Some(Candidate { mut node, .. }) = candidates.remove(&id) else {
            continue;
        };
        let parent_known = node.parent_id == ROOT_ID
            || candidates.contains_key(&node.parent_id)
            || tree.nodes.contains_key(&node.parent_id);
        if !parent_known {
            warn!(
                playlist = %node.name,
                id = node.id,
                parent_id = node.parent_id,
                "parent missing, moving playlist to the root"
            );
            report.playlist_reparented();
            node.parent_id = ROOT_ID;
        }
        report.row_ok(TableType::PlaylistTree);
        report.playlist_valid();
        tree.insert(node);
    }

    tree.sort_children();
    tree
}

/// Read an entry table in row order
pub(crate) fn scan_entries(db: &Database, table: TableType, report: &mut CorruptionReport) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    db.scan_rows(table, ENTRY_ROW_LEN, report, |row, report| {
        let Some(entry) = decode_entry(table, row.bytes()) else {
            let reason = CorruptionReason::Malformed {
                detail: "entry row too short".to_string(),
            };
            report.row_fault(table, None, row.context(), reason);
            return;
        };
        report.row_ok(table);
        entries.push(entry);
    });
    entries
}

fn decode_entry(table: TableType, bytes: &[u8]) -> Option<PlaylistEntry> {
    let a = crate::source::u32_le(bytes, 0)?;
    let b = crate::source::u32_le(bytes, 4)?;
    let c = crate::source::u32_le(bytes, 8)?;
    Some(match table {
        TableType::HistoryEntries => PlaylistEntry {
            track_id: a,
            playlist_id: b,
            entry_index: c,
        },
        _ => PlaylistEntry {
            entry_index: a,
            track_id: b,
            playlist_id: c,
        },
    })
}

/// Track ids per playlist, each list stable-sorted by entry index
pub(crate) fn project_entries(
    db: &Database,
    table: TableType,
    report: &mut CorruptionReport,
) -> BTreeMap<u32, Vec<u32>> {
    group_entries(scan_entries(db, table, report))
}

pub(crate) fn group_entries(entries: Vec<PlaylistEntry>) -> BTreeMap<u32, Vec<u32>> {
    let mut grouped: BTreeMap<u32, Vec<PlaylistEntry>> = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.playlist_id).or_default().push(entry);
    }
    grouped
        .into_iter()
        .map(|(playlist_id, mut entries)| {
            entries.sort_by_key(|e| e.entry_index);
            (playlist_id, entries.into_iter().map(|e| e.track_id).collect())
        })
        .collect()
}
