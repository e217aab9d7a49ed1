//! Console renderer using crossterm
//!
//! Paints the screen buffer into the console with a status line on the last
//! row.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{Attribute, Print, ResetColor, SetAttribute},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};

use crate::core::session::Activity;
use crate::core::term::ScreenBuffer;

/// Console glyph for a received byte
///
/// Printable ASCII and Latin-1 map to themselves; control bytes show as `.`.
pub fn display_char(byte: u8) -> char {
    match byte {
        0x20..=0x7E | 0xA0..=0xFF => byte as char,
        _ => '.',
    }
}

/// Status line text padded or cut to `cols` columns
pub fn status_text(status: &str, activity: Activity, cols: usize) -> String {
    let leds = format!(
        " {} {} ",
        if activity.rx { "RX" } else { "  " },
        if activity.tx { "TX" } else { "  " }
    );
    let mut line = format!("{}| {}", leds, status);
    let len = line.chars().count();
    if len < cols {
        line.extend(std::iter::repeat(' ').take(cols - len));
    } else {
        line = line.chars().take(cols).collect();
    }
    line
}

/// Console renderer
pub struct Renderer {
    /// Whether the console has been switched into raw mode
    initialized: bool,
    /// Console size (cols, rows)
    size: (u16, u16),
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            initialized: false,
            size: (80, 25),
        }
    }

    /// Switch the console to raw mode on the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;

        self.size = terminal::size()?;
        self.initialized = true;
        Ok(())
    }

    /// Restore the console
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset));
        let _ = execute!(stdout, Show, EnableLineWrap, LeaveAlternateScreen);
        let _ = stdout.flush();

        terminal::disable_raw_mode()?;
        println!();
        Ok(())
    }

    /// Record a new console size
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.size = (cols, rows);
    }

    /// Screen area available to the buffer (cols, rows); the last row is the status line
    pub fn viewport(&self) -> (usize, usize) {
        let (cols, rows) = self.size;
        (cols.max(1) as usize, rows.saturating_sub(1).max(1) as usize)
    }

    /// Draw the buffer and status line
    pub fn render(
        &mut self,
        buffer: &ScreenBuffer,
        status: &str,
        activity: Activity,
    ) -> io::Result<()> {
        let (cols, rows) = self.viewport();

        let stdout = io::stdout();
        let mut stdout = io::BufWriter::with_capacity(16384, stdout.lock());
        queue!(stdout, Hide)?;

        let mut line = String::with_capacity(cols);
        for y in 0..rows {
            line.clear();
            if let Some(row) = buffer.line(y) {
                line.extend(row.as_bytes().iter().take(cols).map(|&b| display_char(b)));
            }
            queue!(
                stdout,
                MoveTo(0, y as u16),
                Print(&line),
                Clear(ClearType::UntilNewLine)
            )?;
        }

        queue!(
            stdout,
            MoveTo(0, rows as u16),
            SetAttribute(Attribute::Reverse),
            Print(status_text(status, activity, cols)),
            SetAttribute(Attribute::Reset)
        )?;

        if buffer.cursor_visible() {
            let x = buffer.cursor_x().min(cols - 1) as u16;
            let y = buffer.cursor_y().min(rows - 1) as u16;
            queue!(stdout, MoveTo(x, y), Show)?;
        }

        stdout.flush()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Renders a buffer to a string, for demo mode and debugging
pub struct DebugRenderer;

impl DebugRenderer {
    pub fn render(buffer: &ScreenBuffer) -> String {
        let width = buffer.line_width();
        let mut output = String::new();

        output.push_str(&format!(
            "=== Screen {}x{} ({} rows) ===\n",
            width,
            buffer.visible_rows(),
            buffer.count()
        ));
        output.push_str(&format!(
            "Cursor: ({}, {}) visible={}\n",
            buffer.cursor_x(),
            buffer.cursor_y(),
            buffer.cursor_visible()
        ));
        output.push_str("─".repeat(width).as_str());
        output.push('\n');

        for (y, row) in buffer.lines().enumerate() {
            output.push(if y == buffer.cursor_y() { '>' } else { ' ' });
            output.extend(row.as_bytes().iter().map(|&b| display_char(b)));
            output.push('\n');
        }

        output.push_str("─".repeat(width).as_str());
        output.push('\n');
        output
    }
}
