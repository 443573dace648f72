//! Event markers and trigger alignment.
//!
//! The capture engine can replace one sample row with an event marker: a row of
//! sentinel words carrying the sample index and the clock count at which the event
//! happened. Word layout, per 16-bit column:
//!
//! | column      | content                         |
//! |-------------|---------------------------------|
//! | 0, 1        | sample index, low / high half   |
//! | 2, 6        | event id (`0xF15x`)             |
//! | 3, 7, 11, 15| static `0xAA55`                 |
//! | 4, 5        | clock count, low / high half    |
//!
//! Columns past the row width are simply absent; at least eight columns are needed
//! to carry a marker.

use serde::Serialize;

/// Static sentinel word.
pub const STATIC_WORD: u16 = 0xAA55;
/// Event id of a master marker.
pub const MASTER_WORD: u16 = 0xF154;
/// Event id of a slave marker.
pub const SLAVE_WORD: u16 = 0xF15F;
/// Mask selecting the event id family.
pub const EVENT_MASK: u16 = 0xF150;
/// Columns that hold [`STATIC_WORD`].
pub const STATIC_COLUMNS: [usize; 4] = [3, 7, 11, 15];
/// Minimum row width able to carry a marker.
pub const MIN_COLUMNS: usize = 8;

/// What caused a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkerKind {
    /// Event line 0.
    Event0,
    /// Event line 1.
    Event1,
    /// Gate edge in gated mode.
    Gate,
    /// Combined or slave marker.
    All,
    /// Any other id in the family.
    Other(u8),
}

impl MarkerKind {
    fn from_word(word: u16) -> Self {
        match word & 0x000F {
            0x1 => MarkerKind::Event0,
            0x2 => MarkerKind::Event1,
            0x4 => MarkerKind::Gate,
            0xF => MarkerKind::All,
            other => MarkerKind::Other(other as u8),
        }
    }
}

/// A decoded event marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventMarker {
    /// Sample index at the event.
    pub index: u64,
    /// Clock count at the event.
    pub clock: u64,
    /// Event id.
    pub kind: MarkerKind,
}

fn join_halves(lo: i16, hi: i16) -> u64 {
    u64::from(lo as u16) | (u64::from(hi as u16) << 16)
}

impl EventMarker {
    /// Decode one sample row; `None` if it is ordinary data.
    pub fn decode(row: &[i16]) -> Option<Self> {
        if row.len() < MIN_COLUMNS || !has_statics(row) {
            return None;
        }
        let id = row[2] as u16;
        if id & 0xFFF0 != EVENT_MASK {
            return None;
        }
        Some(Self {
            index: join_halves(row[0], row[1]),
            clock: join_halves(row[4], row[5]),
            kind: MarkerKind::from_word(id),
        })
    }

    /// Encode as a row of `columns` words.
    pub fn encode(&self, columns: usize, id: u16) -> Vec<i16> {
        let mut row = vec![0i16; columns];
        let mut put = |col: usize, word: u16| {
            if let Some(slot) = row.get_mut(col) {
                *slot = word as i16;
            }
        };
        put(0, self.index as u16);
        put(1, (self.index >> 16) as u16);
        put(2, id);
        put(4, self.clock as u16);
        put(5, (self.clock >> 16) as u16);
        put(6, id);
        put(10, SLAVE_WORD);
        put(12, self.clock as u16);
        put(13, (self.clock >> 16) as u16);
        for col in STATIC_COLUMNS {
            put(col, STATIC_WORD);
        }
        row
    }
}

fn has_statics(row: &[i16]) -> bool {
    STATIC_COLUMNS
        .iter()
        .filter(|&&col| col < row.len())
        .all(|&col| row[col] as u16 == STATIC_WORD)
}

/// Clock count of an event-sample row stored column-wise in the on-board memory.
///
/// Only the static columns are checked there; the id columns are not guaranteed.
pub fn event_sample_clock(row: &[i16]) -> Option<u64> {
    (row.len() >= MIN_COLUMNS && has_statics(row)).then(|| join_halves(row[4], row[5]))
}

/// A run of contiguous data rows sharing one time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// First row within the chunk.
    pub first_row: usize,
    /// Number of rows.
    pub rows: usize,
    /// Tick of the first row.
    pub start_tick: i64,
    /// Whether the tick derives from a marker.
    pub aligned: bool,
}

impl Block {
    /// Row range within the chunk.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.first_row..self.first_row + self.rows
    }
}

/// Turns marker rows into per-block time offsets across consecutive chunks.
///
/// The first marker defines time zero. Every later marker restarts the tick count at
/// `(clock - clock0) / fpga_decim`. Marker rows and the `skip` rows after each marker
/// are not data. Rows before the first marker get a provisional tick that places the
/// stream start at `-pre`.
#[derive(Debug, Clone)]
pub struct TimeAligner {
    fpga_decim: u64,
    skip: usize,
    clock0: Option<u64>,
    next_tick: i64,
    aligned: bool,
    pending_skip: usize,
    markers: usize,
    last_marker: Option<EventMarker>,
}

impl TimeAligner {
    /// New aligner for a capture with `pre` pre-trigger samples.
    pub fn new(pre: u64, fpga_decim: u64, skip: usize) -> Self {
        Self {
            fpga_decim: fpga_decim.max(1),
            skip,
            clock0: None,
            next_tick: -(pre as i64),
            aligned: false,
            pending_skip: 0,
            markers: 0,
            last_marker: None,
        }
    }

    /// Markers seen so far.
    pub fn markers(&self) -> usize {
        self.markers
    }

    /// Most recent marker.
    pub fn last_marker(&self) -> Option<EventMarker> {
        self.last_marker
    }

    /// Whether at least one marker was decoded.
    pub fn triggered(&self) -> bool {
        self.markers > 0
    }

    /// Split an interleaved chunk of `columns`-word rows into blocks.
    ///
    /// A trailing partial row is ignored.
    pub fn align(&mut self, chunk: &[i16], columns: usize) -> Vec<Block> {
        if columns == 0 {
            return Vec::new();
        }
        let rows = chunk.len() / columns;
        self.align_rows(rows, |row| {
            EventMarker::decode(&chunk[row * columns..(row + 1) * columns])
        })
    }

    /// Split `rows` rows into blocks, asking `marker_at` which rows are markers.
    pub fn align_rows<F>(&mut self, rows: usize, mut marker_at: F) -> Vec<Block>
    where
        F: FnMut(usize) -> Option<EventMarker>,
    {
        let mut blocks = Vec::new();
        let mut open: Option<Block> = None;
        for row in 0..rows {
            if let Some(marker) = marker_at(row) {
                blocks.extend(open.take());
                let clock0 = *self.clock0.get_or_insert(marker.clock);
                self.next_tick = (marker.clock.saturating_sub(clock0) / self.fpga_decim) as i64;
                self.aligned = true;
                self.pending_skip = self.skip;
                self.markers += 1;
                self.last_marker = Some(marker);
                continue;
            }
            if self.pending_skip > 0 {
                self.pending_skip -= 1;
                continue;
            }
            match open.as_mut() {
                Some(block) => block.rows += 1,
                None => {
                    open = Some(Block {
                        first_row: row,
                        rows: 1,
                        start_tick: self.next_tick,
                        aligned: self.aligned,
                    })
                }
            }
            self.next_tick += 1;
        }
        blocks.extend(open);
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: usize = 8;

    fn data_rows(rows: usize, base: i16) -> Vec<i16> {
        (0..rows * COLUMNS).map(|i| base + (i / COLUMNS) as i16).collect()
    }

    fn marker(clock: u64) -> Vec<i16> {
        EventMarker {
            index: 0x0001_0002,
            clock,
            kind: MarkerKind::Gate,
        }
        .encode(COLUMNS, MASTER_WORD)
    }

    #[test]
    fn marker_round_trip() {
        let row = EventMarker {
            index: 0x0003_8001,
            clock: 0x1234_5678,
            kind: MarkerKind::Gate,
        }
        .encode(16, MASTER_WORD);
        let decoded = EventMarker::decode(&row).unwrap();
        assert_eq!(decoded.index, 0x0003_8001);
        assert_eq!(decoded.clock, 0x1234_5678);
        assert_eq!(decoded.kind, MarkerKind::Gate);

        let slave = EventMarker::decode(&EventMarker { index: 0, clock: 0, kind: MarkerKind::All }.encode(8, SLAVE_WORD));
        assert_eq!(slave.map(|m| m.kind), Some(MarkerKind::All));
    }

    #[test]
    fn ordinary_rows_are_not_markers() {
        assert!(EventMarker::decode(&[0; 8]).is_none());
        let mut row = marker(10);
        row[7] = 0;
        assert!(EventMarker::decode(&row).is_none());
        let mut row = marker(10);
        row[2] = 0x1234;
        assert!(EventMarker::decode(&row).is_none());
        assert!(EventMarker::decode(&marker(10)[..7]).is_none());
    }

    #[test]
    fn chunk_without_marker_is_not_triggered() {
        let mut aligner = TimeAligner::new(100, 1, 0);
        let blocks = aligner.align(&data_rows(50, 0), COLUMNS);
        assert!(!aligner.triggered());
        assert_eq!(aligner.markers(), 0);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_tick, -100);
        assert!(!blocks[0].aligned);
    }

    #[test]
    fn markers_split_blocks_and_set_ticks() {
        let mut chunk = data_rows(3, 0);
        chunk.extend(marker(1000));
        chunk.extend(data_rows(4, 10));
        chunk.extend(marker(1000 + 4 * 50));
        chunk.extend(data_rows(2, 20));

        let mut aligner = TimeAligner::new(3, 4, 1);
        let blocks = aligner.align(&chunk, COLUMNS);
        assert_eq!(aligner.markers(), 2);
        assert_eq!(
            blocks,
            vec![
                Block { first_row: 0, rows: 3, start_tick: -3, aligned: false },
                Block { first_row: 5, rows: 3, start_tick: 0, aligned: true },
                Block { first_row: 10, rows: 1, start_tick: 50, aligned: true },
            ]
        );
    }

    #[test]
    fn skip_and_ticks_carry_across_chunks() {
        let mut aligner = TimeAligner::new(0, 1, 2);
        let mut first = data_rows(2, 0);
        first.extend(marker(500));
        first.extend(data_rows(1, 0));
        let blocks = aligner.align(&first, COLUMNS);
        assert_eq!(blocks.len(), 1);

        let blocks = aligner.align(&data_rows(4, 0), COLUMNS);
        assert_eq!(blocks, vec![Block { first_row: 1, rows: 3, start_tick: 0, aligned: true }]);

        let blocks = aligner.align(&data_rows(2, 0), COLUMNS);
        assert_eq!(blocks[0].start_tick, 3);
    }

    #[test]
    fn event_sample_rows_need_statics_only() {
        let mut row = vec![0i16; 8];
        row[3] = STATIC_WORD as i16;
        row[7] = STATIC_WORD as i16;
        row[4] = 0x10;
        row[5] = 0x1;
        assert_eq!(event_sample_clock(&row), Some(0x1_0010));
        row[7] = 1;
        assert_eq!(event_sample_clock(&row), None);
    }
}
