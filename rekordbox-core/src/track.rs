//! Track rows
//!
//! A track row is a 0x5E-byte fixed header followed by 21 u16 string
//! offsets. Each offset is relative to the row start; 0 means the field was
//! never written.

use std::collections::HashSet;
use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use serde::Serialize;

use crate::page::{Row, TableType};
use crate::pdb::Database;
use crate::report::{CorruptionReason, CorruptionReport};
use crate::string::decode_checked;

/// Bytes a track row needs before any string data
pub const TRACK_ROW_LEN: usize = 0x88;

/// Number of entries in the string offset table
pub const TRACK_STRING_COUNT: usize = 21;

/// Positions in the string offset table
pub mod field {
    pub const ISRC: usize = 0;
    pub const DATE_ADDED: usize = 10;
    pub const RELEASE_DATE: usize = 11;
    pub const MIX_NAME: usize = 12;
    pub const ANALYZE_PATH: usize = 14;
    pub const ANALYZE_DATE: usize = 15;
    pub const COMMENT: usize = 16;
    pub const TITLE: usize = 17;
    pub const FILENAME: usize = 19;
    pub const FILE_PATH: usize = 20;
}

/// Fixed part of a track row
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct TrackRowHeader {
    pub subtype: u16,
    pub index_shift: u16,
    pub bitmask: u32,
    pub sample_rate: u32,
    pub composer_id: u32,
    pub file_size: u32,
    pub unknown2: u32,
    pub unknown3: u16,
    pub unknown4: u16,
    pub artwork_id: u32,
    pub key_id: u32,
    pub original_artist_id: u32,
    pub label_id: u32,
    pub remixer_id: u32,
    pub bitrate: u32,
    pub track_number: u32,
    /// BPM × 100
    pub tempo: u32,
    pub genre_id: u32,
    pub album_id: u32,
    pub artist_id: u32,
    pub id: u32,
    pub disc_number: u16,
    pub play_count: u16,
    pub year: u16,
    pub sample_depth: u16,
    /// Seconds
    pub duration: u16,
    pub unknown5: u16,
    pub color_id: u8,
    pub rating: u8,
    pub unknown6: u16,
    pub unknown7: u16,
    pub string_offsets: [u16; TRACK_STRING_COUNT],
}

/// A track as stored in the Tracks table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: u32,
    pub title: String,
    pub artist_id: u32,
    pub album_id: u32,
    pub genre_id: u32,
    pub key_id: u32,
    pub label_id: u32,
    pub artwork_id: u32,
    pub composer_id: u32,
    pub original_artist_id: u32,
    pub remixer_id: u32,
    pub color_id: u8,
    /// Path of the audio file on the device
    pub file_path: String,
    pub filename: String,
    /// Path of the track's ANLZ .DAT file on the device
    pub analyze_path: String,
    pub comment: String,
    pub date_added: String,
    pub release_date: String,
    pub analyze_date: String,
    pub isrc: String,
    pub mix_name: String,
    pub duration_seconds: u16,
    /// BPM × 100, as stored
    pub tempo: u32,
    /// `tempo` as beats per minute
    pub bpm: f64,
    pub sample_rate: u32,
    pub sample_depth: u16,
    pub bitrate: u32,
    pub track_number: u32,
    pub disc_number: u16,
    pub rating: u8,
    pub year: u16,
    pub play_count: u16,
    pub file_size: u32,
}

/// Decode every track row, skipping corrupt rows and unreadable fields
pub(crate) fn project(db: &Database, report: &mut CorruptionReport) -> Vec<Track> {
    let mut tracks = Vec::new();
    let mut seen = HashSet::new();

    db.scan_rows(TableType::Tracks, TRACK_ROW_LEN, report, |row, report| {
        let track = match decode_row(row, report) {
            Ok(track) => track,
            Err((entity, reason)) => {
                report.row_fault(TableType::Tracks, Some(&entity), row.context(), reason);
                return;
            }
        };
        if !seen.insert(track.id) {
            report.row_fault(
                TableType::Tracks,
                Some(&track.title),
                row.context(),
                CorruptionReason::DuplicateId { id: track.id },
            );
            return;
        }
        report.row_ok(TableType::Tracks);
        tracks.push(track);
    });

    tracks
}

/// Errors carry the best name available for the row
fn decode_row(row: &Row<'_>, report: &mut CorruptionReport) -> Result<Track, (String, CorruptionReason)> {
    let bytes = row.bytes();
    let header: TrackRowHeader = Cursor::new(bytes).read_le().map_err(|e| {
        (
            "<unreadable track>".to_string(),
            CorruptionReason::Malformed { detail: e.to_string() },
        )
    })?;
    let fallback = format!("track {}", header.id);

    let title = match string_field(bytes, &header, field::TITLE, "title") {
        Ok(Some(title)) if !title.is_empty() => title,
        Ok(_) => return Err((fallback, CorruptionReason::MissingTitle)),
        Err(reason) => return Err((fallback, reason)),
    };

    let mut text = |index: usize, name: &'static str| match string_field(bytes, &header, index, name) {
        Ok(value) => value.unwrap_or_default(),
        Err(reason) => {
            report.field_fault(TableType::Tracks, Some(&title), row.context(), reason);
            String::new()
        }
    };

    let file_path = text(field::FILE_PATH, "file_path");
    let filename = text(field::FILENAME, "filename");
    let analyze_path = text(field::ANALYZE_PATH, "analyze_path");
    let comment = text(field::COMMENT, "comment");
    let date_added = text(field::DATE_ADDED, "date_added");
    let release_date = text(field::RELEASE_DATE, "release_date");
    let analyze_date = text(field::ANALYZE_DATE, "analyze_date");
    let isrc = text(field::ISRC, "isrc");
    let mix_name = text(field::MIX_NAME, "mix_name");

    Ok(Track {
        id: header.id,
        title,
        artist_id: header.artist_id,
        album_id: header.album_id,
        genre_id: header.genre_id,
        key_id: header.key_id,
        label_id: header.label_id,
        artwork_id: header.artwork_id,
        composer_id: header.composer_id,
        original_artist_id: header.original_artist_id,
        remixer_id: header.remixer_id,
        color_id: header.color_id,
        file_path,
        filename,
        analyze_path,
        comment,
        date_added,
        release_date,
        analyze_date,
        isrc,
        mix_name,
        duration_seconds: header.duration,
        tempo: header.tempo,
        bpm: header.tempo as f64 / 100.0,
        sample_rate: header.sample_rate,
        sample_depth: header.sample_depth,
        bitrate: header.bitrate,
        track_number: header.track_number,
        disc_number: header.disc_number,
        rating: header.rating,
        year: header.year,
        play_count: header.play_count,
        file_size: header.file_size,
    })
}

/// Resolve one entry of the string offset table. `None` when never written.
fn string_field(
    row: &[u8],
    header: &TrackRowHeader,
    index: usize,
    name: &'static str,
) -> Result<Option<String>, CorruptionReason> {
    let offset = header.string_offsets[index] as usize;
    if offset == 0 {
        return Ok(None);
    }
    if offset >= row.len() {
        return Err(CorruptionReason::StringOffsetOutOfRow {
            field: name,
            offset,
            row_len: row.len(),
        });
    }
    decode_checked(row, offset)
        .map(|(s, _)| Some(s.into_string()))
        .map_err(|error| CorruptionReason::BadString { field: name, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{DatabaseBuilder, PageBuilder, TrackRowBuilder};
    use crate::page::{NULL_PAGE, PAGE_HEADER_SIZE, ROW_GROUP_SIZE};
    use crate::report::Scope;
    use crate::string::StringError;

    const PAGE_SIZE: usize = 4096;

    fn database(rows: &[Vec<u8>]) -> Database {
        let mut page = PageBuilder::new(PAGE_SIZE, 1, TableType::Tracks);
        for row in rows {
            page.push_row(row);
        }
        let mut db = DatabaseBuilder::new(PAGE_SIZE);
        db.push_page(page.finalize(NULL_PAGE));
        db.table(TableType::Tracks, 1, 1);
        db.open()
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(0x5E + 2 * TRACK_STRING_COUNT, TRACK_ROW_LEN);
    }

    #[test]
    fn test_decode_track() {
        let row = TrackRowBuilder::new(42, "Strobe")
            .artist_id(7)
            .album_id(3)
            .tempo(12800)
            .duration(634)
            .string(field::FILE_PATH, "/Contents/deadmau5/Strobe.mp3")
            .string(field::ANALYZE_PATH, "/PIONEER/USBANLZ/P016/0000875E/ANLZ0000.DAT")
            .string(field::COMMENT, "Ünïcödé comment")
            .build();
        let parsed = database(&[row]).tracks();

        assert!(parsed.report.is_clean());
        assert_eq!(parsed.value.len(), 1);
        let track = &parsed.value[0];
        assert_eq!(track.id, 42);
        assert_eq!(track.title, "Strobe");
        assert_eq!(track.artist_id, 7);
        assert_eq!(track.album_id, 3);
        assert_eq!(track.tempo, 12800);
        assert_eq!(track.bpm, 128.0);

        let json = serde_json::to_value(track).unwrap();
        assert_eq!(json["bpm"], 128.0);
        assert_eq!(track.duration_seconds, 634);
        assert_eq!(track.file_path, "/Contents/deadmau5/Strobe.mp3");
        assert_eq!(track.analyze_path, "/PIONEER/USBANLZ/P016/0000875E/ANLZ0000.DAT");
        assert_eq!(track.comment, "Ünïcödé comment");
        assert!(track.isrc.is_empty());
        assert_eq!(parsed.report.table(TableType::Tracks).rows, 1);
    }

    #[test]
    fn test_bad_string_offset_drops_only_that_field() {
        let row_len = PAGE_SIZE - PAGE_HEADER_SIZE - ROW_GROUP_SIZE;
        let row = TrackRowBuilder::new(1, "Kept")
            .string(field::FILE_PATH, "/music/kept.flac")
            .string_offset(field::COMMENT, (row_len + 10) as u16)
            .build();
        let parsed = database(&[row]).tracks();

        assert_eq!(parsed.value.len(), 1);
        let track = &parsed.value[0];
        assert_eq!(track.title, "Kept");
        assert_eq!(track.file_path, "/music/kept.flac");
        assert!(track.comment.is_empty());

        let stats = parsed.report.table(TableType::Tracks);
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.corrupt_rows, 0);
        assert_eq!(stats.field_errors, 1);
        let entry = &parsed.report.entries()[0];
        assert_eq!(entry.scope, Scope::Field);
        assert_eq!(entry.entity.as_deref(), Some("Kept"));
        assert!(matches!(
            entry.reason,
            CorruptionReason::StringOffsetOutOfRow { field: "comment", .. }
        ));
    }

    #[test]
    fn test_undecodable_field_is_dropped() {
        let row = TrackRowBuilder::new(1, "Title")
            .raw_string(field::ISRC, &[0x41, 0x00])
            .build();
        let parsed = database(&[row]).tracks();

        assert_eq!(parsed.value.len(), 1);
        assert!(parsed.value[0].isrc.is_empty());
        assert_eq!(
            parsed.report.entries()[0].reason,
            CorruptionReason::BadString {
                field: "isrc",
                error: StringError::UnknownFlag { flag: 0x41 },
            }
        );
    }

    #[test]
    fn test_missing_or_bad_title_rejects_row() {
        let rows = vec![
            TrackRowBuilder::new(1, "").build(),
            TrackRowBuilder::new(2, "ignored").string_offset(field::TITLE, 0).build(),
            TrackRowBuilder::new(3, "ignored").raw_string(field::TITLE, &[0xC1]).build(),
            TrackRowBuilder::new(4, "Good").build(),
        ];
        let parsed = database(&rows).tracks();

        assert_eq!(parsed.value.len(), 1);
        assert_eq!(parsed.value[0].id, 4);
        let stats = parsed.report.table(TableType::Tracks);
        assert_eq!(stats.corrupt_rows, 3);
        assert_eq!(stats.rows, 1);

        let entities: Vec<_> = parsed
            .report
            .entries()
            .iter()
            .map(|e| e.entity.clone().unwrap_or_default())
            .collect();
        assert_eq!(entities, vec!["track 1", "track 2", "track 3"]);
    }

    #[test]
    fn test_duplicate_id_first_wins() {
        let rows = vec![
            TrackRowBuilder::new(9, "First").build(),
            TrackRowBuilder::new(9, "Second").build(),
        ];
        let parsed = database(&rows).tracks();

        assert_eq!(parsed.value.len(), 1);
        assert_eq!(parsed.value[0].title, "First");
        let entry = &parsed.report.entries()[0];
        assert_eq!(entry.reason, CorruptionReason::DuplicateId { id: 9 });
        assert_eq!(entry.entity.as_deref(), Some("Second"));
    }

    #[test]
    fn test_truncated_row_is_corrupt() {
        let mut page = PageBuilder::new(512, 1, TableType::Tracks);
        page.push_row(&TrackRowBuilder::new(1, "Fits").build());
        // Starts too close to the row index for a full header
        page.push_raw_offset((512 - PAGE_HEADER_SIZE - 2 * ROW_GROUP_SIZE - 0x40) as u16);
        let mut db = DatabaseBuilder::new(512);
        db.push_page(page.finalize(NULL_PAGE));
        db.table(TableType::Tracks, 1, 1);
        let parsed = db.open().tracks();

        assert_eq!(parsed.value.len(), 1);
        assert!(matches!(
            parsed.report.entries()[0].reason,
            CorruptionReason::RowOutOfBounds { required: TRACK_ROW_LEN, .. }
        ));
    }
}
