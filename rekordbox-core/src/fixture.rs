//! Builders for synthetic databases used by the unit tests

use crate::options::ParseOptions;
use crate::page::{TableType, HEAP_START, ROWS_PER_GROUP, ROW_GROUP_SIZE};
use crate::pdb::{Database, DIRECTORY_ENTRY_SIZE, DIRECTORY_OFFSET};
use crate::source::ByteSource;
use crate::string::encode_string;
use crate::track::{TRACK_ROW_LEN, TRACK_STRING_COUNT};

/// Page flags seen on ordinary data pages
const DATA_PAGE_FLAGS: u8 = 0x34;

/// Lays out one page: heap rows from the front, row index from the back
pub struct PageBuilder {
    page_size: usize,
    index: u32,
    table: TableType,
    heap: Vec<u8>,
    slots: Vec<(u16, bool)>,
}

impl PageBuilder {
    pub fn new(page_size: usize, index: u32, table: TableType) -> Self {
        Self {
            page_size,
            index,
            table,
            heap: Vec::new(),
            slots: Vec::new(),
        }
    }

    fn append(&mut self, row: &[u8]) -> u16 {
        let offset = self.heap.len() as u16;
        self.heap.extend_from_slice(row);
        offset
    }

    pub fn push_row(&mut self, row: &[u8]) {
        let offset = self.append(row);
        self.slots.push((offset, true));
    }

    /// Write the row but leave its presence bit clear
    pub fn push_absent_row(&mut self, row: &[u8]) {
        let offset = self.append(row);
        self.slots.push((offset, false));
    }

    /// A present slot pointing wherever `offset` says
    pub fn push_raw_offset(&mut self, offset: u16) {
        self.slots.push((offset, true));
    }

    pub fn finalize(self, next_page: u32) -> Vec<u8> {
        let mut page = vec![0u8; self.page_size];
        let groups = self.slots.len().div_ceil(ROWS_PER_GROUP);
        let heap_end = self.page_size - groups * ROW_GROUP_SIZE;
        assert!(HEAP_START + self.heap.len() <= heap_end, "rows overflow the page");

        let live = self.slots.iter().filter(|(_, present)| *present).count();
        let packed = (self.slots.len() as u32 & 0x1FFF) | ((live as u32 & 0x7FF) << 13);

        page[4..8].copy_from_slice(&self.index.to_le_bytes());
        page[8..12].copy_from_slice(&self.table.id().to_le_bytes());
        page[12..16].copy_from_slice(&next_page.to_le_bytes());
        page[16..20].copy_from_slice(&1u32.to_le_bytes());
        page[0x18..0x1B].copy_from_slice(&packed.to_le_bytes()[..3]);
        page[0x1B] = DATA_PAGE_FLAGS;
        let free = (heap_end - HEAP_START - self.heap.len()) as u16;
        page[0x1C..0x1E].copy_from_slice(&free.to_le_bytes());
        page[0x1E..0x20].copy_from_slice(&(self.heap.len() as u16).to_le_bytes());

        page[HEAP_START..HEAP_START + self.heap.len()].copy_from_slice(&self.heap);

        for (slot, (offset, present)) in self.slots.iter().enumerate() {
            let (group, i) = (slot / ROWS_PER_GROUP, slot % ROWS_PER_GROUP);
            let base = self.page_size - group * ROW_GROUP_SIZE;
            let at = base - 6 - 2 * i;
            page[at..at + 2].copy_from_slice(&offset.to_le_bytes());
            if *present {
                let flags = u16::from_le_bytes([page[base - 4], page[base - 3]]) | (1 << i);
                page[base - 4..base - 2].copy_from_slice(&flags.to_le_bytes());
            }
        }

        page
    }
}

/// Assembles a whole file: header page, directory and data pages
#[derive(Clone)]
pub struct DatabaseBuilder {
    page_size: usize,
    pages: Vec<Vec<u8>>,
    tables: Vec<(TableType, u32, u32)>,
}

impl DatabaseBuilder {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Vec::new(),
            tables: Vec::new(),
        }
    }

    /// Append a page; it lands at the next position after the header page
    pub fn push_page(&mut self, page: Vec<u8>) -> u32 {
        assert_eq!(page.len(), self.page_size);
        self.pages.push(page);
        self.pages.len() as u32
    }

    /// Add a directory entry
    pub fn table(&mut self, table: TableType, first_page: u32, last_page: u32) {
        self.tables.push((table, first_page, last_page));
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.page_size];
        data[4..8].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        data[8..12].copy_from_slice(&(self.tables.len() as u32).to_le_bytes());
        data[12..16].copy_from_slice(&(self.pages.len() as u32 + 1).to_le_bytes());
        data[20..24].copy_from_slice(&1u32.to_le_bytes());

        for (i, (table, first, last)) in self.tables.iter().enumerate() {
            let offset = DIRECTORY_OFFSET + i * DIRECTORY_ENTRY_SIZE;
            data[offset..offset + 4].copy_from_slice(&table.id().to_le_bytes());
            data[offset + 4..offset + 8].copy_from_slice(&(self.pages.len() as u32 + 1).to_le_bytes());
            data[offset + 8..offset + 12].copy_from_slice(&first.to_le_bytes());
            data[offset + 12..offset + 16].copy_from_slice(&last.to_le_bytes());
        }

        for page in &self.pages {
            data.extend_from_slice(page);
        }
        data
    }

    pub fn open(&self) -> Database {
        self.open_with(ParseOptions::default())
    }

    pub fn open_with(&self, options: ParseOptions) -> Database {
        Database::open_with(ByteSource::from_vec(self.build()), options).unwrap()
    }
}

/// Builds a track row: fixed header, string offset table, then strings
pub struct TrackRowBuilder {
    header: [u8; TRACK_ROW_LEN],
    strings: Vec<(usize, Vec<u8>)>,
    offsets: Vec<(usize, u16)>,
}

impl TrackRowBuilder {
    pub fn new(id: u32, title: &str) -> Self {
        let mut header = [0u8; TRACK_ROW_LEN];
        header[0..2].copy_from_slice(&0x24u16.to_le_bytes());
        header[0x48..0x4C].copy_from_slice(&id.to_le_bytes());
        Self {
            header,
            strings: Vec::new(),
            offsets: Vec::new(),
        }
        .string(crate::track::field::TITLE, title)
    }

    fn u32_at(mut self, at: usize, value: u32) -> Self {
        self.header[at..at + 4].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn artist_id(self, id: u32) -> Self {
        self.u32_at(0x44, id)
    }

    pub fn album_id(self, id: u32) -> Self {
        self.u32_at(0x40, id)
    }

    pub fn tempo(self, tempo: u32) -> Self {
        self.u32_at(0x38, tempo)
    }

    pub fn duration(mut self, seconds: u16) -> Self {
        self.header[0x54..0x56].copy_from_slice(&seconds.to_le_bytes());
        self
    }

    pub fn string(self, index: usize, text: &str) -> Self {
        self.raw_string(index, &encode_string(text))
    }

    /// Store arbitrary bytes where the string would go
    pub fn raw_string(mut self, index: usize, bytes: &[u8]) -> Self {
        assert!(index < TRACK_STRING_COUNT);
        self.strings.retain(|(i, _)| *i != index);
        self.strings.push((index, bytes.to_vec()));
        self
    }

    /// Force a string offset, overriding any string stored for the field
    pub fn string_offset(mut self, index: usize, offset: u16) -> Self {
        self.offsets.push((index, offset));
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let mut tail = Vec::new();
        self.strings.sort_by_key(|(i, _)| *i);
        for (index, bytes) in &self.strings {
            let offset = (TRACK_ROW_LEN + tail.len()) as u16;
            let at = 0x5E + 2 * index;
            self.header[at..at + 2].copy_from_slice(&offset.to_le_bytes());
            tail.extend_from_slice(bytes);
        }
        for (index, offset) in &self.offsets {
            let at = 0x5E + 2 * index;
            self.header[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        }

        let mut row = self.header.to_vec();
        row.extend(tail);
        row
    }
}

fn le32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Playlist tree row
pub fn playlist_row(id: u32, parent_id: u32, sort_order: u32, is_folder: bool, name: &str) -> Vec<u8> {
    let mut row = le32(&[parent_id, 0, sort_order, id, is_folder as u32]);
    row.extend(encode_string(name));
    row
}

/// Playlist entry row
pub fn entry_row(entry_index: u32, track_id: u32, playlist_id: u32) -> Vec<u8> {
    le32(&[entry_index, track_id, playlist_id])
}

/// History entry row
pub fn history_entry_row(track_id: u32, playlist_id: u32, entry_index: u32) -> Vec<u8> {
    le32(&[track_id, playlist_id, entry_index])
}

/// Genre, label, history playlist and artwork rows: id then inline string
pub fn named_row(id: u32, name: &str) -> Vec<u8> {
    let mut row = le32(&[id]);
    row.extend(encode_string(name));
    row
}

pub fn key_row(id: u32, name: &str) -> Vec<u8> {
    let mut row = le32(&[id, id]);
    row.extend(encode_string(name));
    row
}

pub fn color_row(id: u16, name: &str) -> Vec<u8> {
    let mut row = vec![0u8; 5];
    row.extend_from_slice(&id.to_le_bytes());
    row.push(0);
    row.extend(encode_string(name));
    row
}

pub fn column_row(id: u16, name: &str) -> Vec<u8> {
    let mut row = id.to_le_bytes().to_vec();
    row.extend_from_slice(&id.to_le_bytes());
    row.extend(encode_string(name));
    row
}

/// Artist row using the near (u8) name offset
pub fn artist_row(id: u32, name: &str) -> Vec<u8> {
    let mut row = 0x60u16.to_le_bytes().to_vec();
    row.extend_from_slice(&0u16.to_le_bytes());
    row.extend_from_slice(&id.to_le_bytes());
    row.push(0x03);
    row.push(0x0A);
    row.extend(encode_string(name));
    row
}

/// Album row using the near (u8) name offset
pub fn album_row(id: u32, artist_id: u32, name: &str) -> Vec<u8> {
    let mut row = 0x80u16.to_le_bytes().to_vec();
    row.extend_from_slice(&0u16.to_le_bytes());
    row.extend(le32(&[0, artist_id, id, 0]));
    row.push(0x03);
    row.push(0x16);
    row.extend(encode_string(name));
    row
}
