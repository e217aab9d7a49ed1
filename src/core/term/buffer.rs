//! Scrolling line buffer
//!
//! Holds the rows received from the serial link as raw bytes together with
//! the cursor. Rows are only ever appended at the bottom; once more rows are
//! populated than the display can show, the oldest ones are evicted.
//!
//! Cursor coordinates are accepted as signed values so that escape
//! parameters and `column - 1` style arithmetic can be passed straight
//! through: anything outside `0..=MAX_CURSOR` is ignored.

use super::Effects;

/// Largest accepted cursor row or column
pub const MAX_CURSOR: i32 = 300;

/// Bytes allocated for a freshly created line
const LINE_INITIAL_CAPACITY: usize = 8;
/// Headroom added when a line or the row table has to grow
const GROWTH: usize = 10;

pub const DEFAULT_COLS: usize = 80;
pub const DEFAULT_ROWS: usize = 24;

/// One row of text
#[derive(Clone, Debug)]
pub struct Line {
    bytes: Vec<u8>,
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

impl Line {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(LINE_INITIAL_CAPACITY),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Allocated size, always at least `len()`
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[cfg(test)]
    pub fn get(&self, col: usize) -> Option<u8> {
        self.bytes.get(col).copied()
    }

    /// Row contents with every byte mapped to the Latin-1 code point of the same value
    pub fn to_text(&self) -> String {
        self.bytes.iter().map(|&b| b as char).collect()
    }

    /// Make room for a write at column `col`
    fn reserve_column(&mut self, col: usize) {
        if col + 1 > self.bytes.capacity() {
            let target = col + GROWTH;
            self.bytes.reserve_exact(target - self.bytes.len());
        }
    }

    /// Pad with spaces so that the row is at least `col` bytes long
    fn pad_to(&mut self, col: usize) {
        if self.bytes.len() < col {
            self.bytes.resize(col, b' ');
        }
    }

    /// Store `byte` at `col`, extending the row when writing at its end
    fn put(&mut self, col: usize, byte: u8) {
        self.pad_to(col);
        if col == self.bytes.len() {
            self.bytes.push(byte);
        } else {
            self.bytes[col] = byte;
        }
    }

    fn truncate(&mut self, col: usize) {
        self.bytes.truncate(col);
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Row table and cursor
pub struct ScreenBuffer {
    /// Allocated row slots; `rows.len()` is the capacity
    rows: Vec<Line>,
    /// Number of populated rows
    count: usize,
    cursor_x: usize,
    cursor_y: usize,
    cursor_visible: bool,
    /// Rows the display can show; more populated rows than this are evicted
    visible_rows: usize,
    /// Display width in columns, used for soft wrapping
    cols: usize,
    /// Effects accumulated since the last `take_effects`
    effects: Effects,
}

impl Default for ScreenBuffer {
    fn default() -> Self {
        Self::new(4)
    }
}

impl ScreenBuffer {
    /// Create an empty buffer with `initial_capacity` row slots
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.max(1);
        Self {
            rows: (0..capacity).map(|_| Line::new()).collect(),
            count: 0,
            cursor_x: 0,
            cursor_y: 0,
            cursor_visible: true,
            visible_rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            effects: Effects::empty(),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    pub fn cursor_x(&self) -> usize {
        self.cursor_x
    }

    pub fn cursor_y(&self) -> usize {
        self.cursor_y
    }

    /// Cursor as (column, row)
    #[cfg(test)]
    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn visible_rows(&self) -> usize {
        self.visible_rows
    }

    pub fn line_width(&self) -> usize {
        self.cols
    }

    /// Populated row `y`
    pub fn line(&self, y: usize) -> Option<&Line> {
        if y < self.count {
            self.rows.get(y)
        } else {
            None
        }
    }

    /// Populated rows, oldest first
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.rows[..self.count].iter()
    }

    #[cfg(test)]
    pub fn char_at(&self, x: usize, y: usize) -> Option<u8> {
        self.line(y).and_then(|line| line.get(x))
    }

    /// Populated rows joined with newlines
    pub fn text(&self) -> String {
        self.lines().map(Line::to_text).collect::<Vec<_>>().join("\n")
    }

    /// Effects accumulated since the previous call
    pub fn take_effects(&mut self) -> Effects {
        std::mem::take(&mut self.effects)
    }

    /// Show or hide the cursor
    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor_visible = visible;
        self.effects |= Effects::CURSOR;
        if visible {
            self.effects |= Effects::REDRAW;
        }
    }

    /// Adopt a new display size. A shorter display scrolls rows off the top.
    pub fn set_viewport(&mut self, cols: usize, rows: usize) {
        self.cols = cols.max(1);
        self.visible_rows = rows.max(1);
        self.effects |= Effects::REDRAW;
        if self.count > 0 {
            self.set_cursor_row(self.cursor_y as i32);
        }
    }

    /// Move the cursor to column `x` of the current row, padding the row with spaces
    pub fn set_cursor_column(&mut self, x: i32) {
        if !(0..=MAX_CURSOR).contains(&x) {
            return;
        }
        let x = x as usize;

        let line = &mut self.rows[self.cursor_y];
        line.reserve_column(x);
        line.pad_to(x);

        if x != self.cursor_x && self.cursor_visible {
            self.effects |= Effects::REDRAW;
        }
        self.cursor_x = x;
    }

    /// Move the cursor to row `y`, growing the row table and evicting old rows as needed
    pub fn set_cursor_row(&mut self, y: i32) {
        if !(0..=MAX_CURSOR).contains(&y) {
            return;
        }
        let y = y as usize;

        if y >= self.rows.len() {
            self.rows.resize_with(y + GROWTH, Line::new);
        }

        if y != self.cursor_y && self.cursor_visible {
            self.effects |= Effects::REDRAW;
        }
        self.cursor_y = y;
        self.count = self.count.max(y + 1);

        // Re-pad the row the cursor now sits on
        self.set_cursor_column(self.cursor_x as i32);

        if self.count > self.visible_rows {
            let evicted = self.count - self.visible_rows;
            self.evict(evicted);
            self.set_cursor_row(self.cursor_y.saturating_sub(evicted) as i32);
        }
    }

    /// Drop the `n` oldest rows; their slots come back as empty rows at the tail
    fn evict(&mut self, n: usize) {
        let capacity = self.rows.len();
        self.rows.rotate_left(n);
        for slot in &mut self.rows[capacity - n..] {
            *slot = Line::new();
        }
        self.count -= n;
        self.effects |= Effects::REDRAW;
    }

    /// Write `byte` at the cursor and advance one column
    pub fn push_char(&mut self, byte: u8) {
        let (x, y) = (self.cursor_x, self.cursor_y);
        self.rows[y].put(x, byte);
        self.effects |= Effects::REDRAW;

        self.set_cursor_column(x as i32 + 1);
        if y >= self.count {
            self.count = y + 1;
        }
    }

    /// Truncate the current row at the cursor
    pub fn clear_to_end_of_line(&mut self) {
        self.rows[self.cursor_y].truncate(self.cursor_x);
        self.effects |= Effects::REDRAW;
    }

    /// Truncate the current row at the cursor and empty every row below it
    pub fn clear_to_end_of_screen(&mut self) {
        self.clear_to_end_of_line();
        let start = (self.cursor_y + 1).min(self.count);
        for line in &mut self.rows[start..self.count] {
            line.clear();
        }
    }

    /// Home the cursor and empty every row
    pub fn clear(&mut self) {
        self.set_cursor_column(0);
        self.set_cursor_row(0);
        for line in &mut self.rows {
            line.clear();
        }
        self.effects |= Effects::REDRAW;
    }
}
