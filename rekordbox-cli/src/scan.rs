//! Run the readers over an export and collect everything they produce

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use rekordbox_core::history::HistoryPlaylist;
use rekordbox_core::pdb::FileHeader;
use rekordbox_core::{
    CorruptionReport, Database, LookupTable, NamedEntry, ParseOptions, PlaylistTree, Sidecar, SidecarWarning,
    TableDirectoryEntry, Tag, Track,
};

/// Everything read from one export.pdb
#[derive(Debug, Serialize)]
pub struct DatabaseDump {
    pub path: PathBuf,
    pub header: FileHeader,
    pub directory_truncated: bool,
    pub tables: Vec<TableDirectoryEntry>,
    pub tracks: Vec<Track>,
    pub playlists: PlaylistTree,
    pub lookups: BTreeMap<&'static str, Vec<NamedEntry>>,
    pub history: Vec<HistoryPlaylist>,
    pub report: CorruptionReport,
}

/// What one analysis file held
#[derive(Debug, Default, Serialize)]
pub struct SidecarDump {
    pub path: PathBuf,
    pub tags: Vec<Tag>,
    pub sections: usize,
    pub track_path: Option<String>,
    pub beats: usize,
    pub cues: usize,
    pub preview_columns: usize,
    pub detail_columns: usize,
    pub color_entries: usize,
    pub warnings: Vec<SidecarWarning>,
    /// Set when the file could not be opened at all
    pub error: Option<String>,
}

pub fn read_database(path: &Path, options: ParseOptions) -> Result<DatabaseDump> {
    let db = Database::open_path(path, options).with_context(|| format!("opening database {:?}", path))?;
    info!(
        "Opened {:?}: {} pages of {} bytes, {} tables",
        path,
        db.page_count(),
        db.page_size(),
        db.tables().len()
    );

    // Tables are independent; each projector keeps its own report
    let ((tracks, playlists), (lookups, history)) = rayon::join(
        || rayon::join(|| db.tracks(), || db.playlists()),
        || {
            rayon::join(
                || {
                    LookupTable::ALL
                        .par_iter()
                        .map(|&table| (table.table().name(), db.lookup(table)))
                        .collect::<Vec<_>>()
                },
                || db.history(),
            )
        },
    );

    let mut report = CorruptionReport::new();
    report.merge(tracks.report);
    report.merge(playlists.report);
    report.merge(history.report);
    let lookups = lookups
        .into_iter()
        .map(|(name, parsed)| {
            report.merge(parsed.report);
            (name, parsed.value)
        })
        .collect();

    Ok(DatabaseDump {
        path: path.to_path_buf(),
        header: *db.header(),
        directory_truncated: db.directory_truncated(),
        tables: db.tables().values().copied().collect(),
        tracks: tracks.value,
        playlists: playlists.value,
        lookups,
        history: history.value,
        report,
    })
}

/// Parse analysis files in parallel, one buffer per file
pub fn read_sidecars(paths: &[PathBuf]) -> Vec<SidecarDump> {
    paths.par_iter().map(|path| read_sidecar(path)).collect()
}

pub fn read_sidecar(path: &Path) -> SidecarDump {
    let mut dump = SidecarDump {
        path: path.to_path_buf(),
        ..SidecarDump::default()
    };

    let sidecar = match Sidecar::open_path(path) {
        Ok(sidecar) => sidecar,
        Err(e) => {
            warn!("Skipping {:?}: {}", path, e);
            dump.error = Some(e.to_string());
            return dump;
        }
    };

    let map = sidecar.read_sections();
    dump.tags = map.tags().collect();
    dump.sections = map.sections.values().map(Vec::len).sum();
    dump.warnings = map.warnings;

    let mut facet = |result: std::result::Result<(), SidecarWarning>| {
        if let Err(warning) = result {
            dump.warnings.push(warning);
        }
    };
    let mut track_path = None;
    let (mut beats, mut cues, mut preview_columns) = (0, 0, 0);
    let (mut detail_columns, mut color_entries) = (0, 0);
    facet(sidecar.path().map(|p| track_path = p));
    facet(sidecar.beat_grid().map(|g| beats = g.map_or(0, |g| g.len())));
    facet(sidecar.cue_lists().map(|lists| cues = lists.iter().map(|l| l.cues.len()).sum()));
    facet(
        sidecar
            .waveform_preview()
            .map(|p| preview_columns = p.map_or(0, |p| p.columns.len())),
    );
    facet(
        sidecar
            .waveform_detail()
            .map(|d| detail_columns = d.map_or(0, |d| d.columns.len())),
    );
    facet(
        sidecar
            .waveform_color()
            .map(|c| color_entries = c.map_or(0, |c| c.entries.len())),
    );

    dump.track_path = track_path;
    dump.beats = beats;
    dump.cues = cues;
    dump.preview_columns = preview_columns;
    dump.detail_columns = detail_columns;
    dump.color_entries = color_entries;
    debug!(path = ?path, sections = dump.sections, "read analysis file");
    dump
}
