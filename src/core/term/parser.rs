//! Escape-code parser
//!
//! Decodes the byte stream one byte at a time. Printable bytes go to the
//! screen; a handful of control bytes move the cursor or clear the screen;
//! `ESC` introduces a short command:
//!
//! | Sequence | Meaning |
//! |----------|---------|
//! | `ESC T` | Clear to end of line |
//! | `ESC Y` | Clear to end of screen |
//! | `ESC . x` | Cursor off when `x` is `'0'`, on otherwise |
//! | `ESC = row col` | Move cursor; both parameters biased by 0x20 |
//!
//! Command letters are case-insensitive. An unknown command byte ends the
//! sequence and is itself consumed.

use super::{Effects, ScreenBuffer};

/// Offset added to cursor position parameters
pub const PARAM_BIAS: u8 = 0x20;

/// Tab stops every 8 columns
const TAB_WIDTH: usize = 8;

/// Parser state machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParserState {
    #[default]
    Idle,
    /// Got ESC, waiting for the command byte
    ReadyForCommand,
    AwaitingCursorToggleArg,
    AwaitingRow,
    AwaitingColumn,
}

/// What a byte does to the screen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// State change only
    Nothing,
    Home,
    ClearScreen,
    CarriageReturn,
    LineFeed,
    Backspace,
    Tab,
    /// Display the byte
    Print,
    /// Drop the byte
    Discard,
    ClearToEndOfLine,
    ClearToEndOfScreen,
    /// Unknown command byte
    Abort,
    HideCursor,
    ShowCursor,
    SetRow,
    SetColumn,
}

type Transition = (u8, Action, ParserState);

/// Bytes with a meaning of their own while idle; everything else is printed
const IDLE_CONTROLS: [Transition; 10] = [
    (0x1B, Action::Nothing, ParserState::ReadyForCommand),
    (0x1E, Action::Home, ParserState::Idle),
    (0x18, Action::Home, ParserState::Idle),
    (0x1A, Action::ClearScreen, ParserState::Idle),
    (0x0C, Action::ClearScreen, ParserState::Idle),
    (0x0D, Action::CarriageReturn, ParserState::Idle),
    (0x0A, Action::LineFeed, ParserState::Idle),
    (0x08, Action::Backspace, ParserState::Idle),
    (0x09, Action::Tab, ParserState::Idle),
    // End-of-stream marker on some hosts
    (0xFF, Action::Discard, ParserState::Idle),
];

/// Command bytes accepted after ESC (upper case)
const ESCAPE_COMMANDS: [Transition; 4] = [
    (b'T', Action::ClearToEndOfLine, ParserState::Idle),
    (b'Y', Action::ClearToEndOfScreen, ParserState::Idle),
    (b'.', Action::Nothing, ParserState::AwaitingCursorToggleArg),
    (b'=', Action::Nothing, ParserState::AwaitingRow),
];

fn lookup(table: &[Transition], byte: u8) -> Option<(Action, ParserState)> {
    table
        .iter()
        .find(|(b, _, _)| *b == byte)
        .map(|&(_, action, next)| (action, next))
}

/// Action and next state for `byte` received in `state`
pub fn transition(state: ParserState, byte: u8) -> (Action, ParserState) {
    match state {
        ParserState::Idle => {
            lookup(&IDLE_CONTROLS, byte).unwrap_or((Action::Print, ParserState::Idle))
        }
        ParserState::ReadyForCommand => lookup(&ESCAPE_COMMANDS, byte.to_ascii_uppercase())
            .unwrap_or((Action::Abort, ParserState::Idle)),
        ParserState::AwaitingCursorToggleArg if byte == b'0' => {
            (Action::HideCursor, ParserState::Idle)
        }
        ParserState::AwaitingCursorToggleArg => (Action::ShowCursor, ParserState::Idle),
        ParserState::AwaitingRow => (Action::SetRow, ParserState::AwaitingColumn),
        ParserState::AwaitingColumn => (Action::SetColumn, ParserState::Idle),
    }
}

/// Byte-at-a-time decoder driving a `ScreenBuffer`
#[derive(Debug, Default)]
pub struct EscapeParser {
    state: ParserState,
    /// Treat LF as CR+LF
    crlf: bool,
}

impl EscapeParser {
    pub fn new(crlf: bool) -> Self {
        Self {
            state: ParserState::Idle,
            crlf,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn crlf(&self) -> bool {
        self.crlf
    }

    pub fn set_crlf(&mut self, crlf: bool) {
        self.crlf = crlf;
    }

    /// Abandon any partial sequence
    pub fn reset(&mut self) {
        self.state = ParserState::Idle;
    }

    /// Feed a single byte to the parser
    pub fn feed(&mut self, byte: u8, buffer: &mut ScreenBuffer) -> Option<Effects> {
        let (action, next) = transition(self.state, byte);
        self.state = next;
        self.apply(action, byte, buffer);

        let effects = buffer.take_effects();
        if effects.is_empty() {
            None
        } else {
            Some(effects)
        }
    }

    fn apply(&self, action: Action, byte: u8, buffer: &mut ScreenBuffer) {
        let x = buffer.cursor_x() as i32;
        let y = buffer.cursor_y() as i32;

        match action {
            Action::Nothing | Action::Discard => {}
            Action::Home => {
                buffer.set_cursor_column(0);
                buffer.set_cursor_row(0);
            }
            Action::ClearScreen => buffer.clear(),
            Action::CarriageReturn => buffer.set_cursor_column(0),
            Action::LineFeed => {
                if self.crlf {
                    buffer.set_cursor_column(0);
                }
                buffer.set_cursor_row(y + 1);
            }
            Action::Backspace => buffer.set_cursor_column(x - 1),
            Action::Tab => {
                let stop = (buffer.cursor_x() / TAB_WIDTH + 1) * TAB_WIDTH;
                let last = buffer.line_width().saturating_sub(1);
                buffer.set_cursor_column(stop.min(last).max(buffer.cursor_x()) as i32);
            }
            Action::Print => {
                // Soft wrap at the right edge
                if buffer.cursor_x() + 1 >= buffer.line_width() {
                    buffer.set_cursor_column(0);
                    buffer.set_cursor_row(y + 1);
                }
                buffer.push_char(byte);
            }
            Action::ClearToEndOfLine => buffer.clear_to_end_of_line(),
            Action::ClearToEndOfScreen => buffer.clear_to_end_of_screen(),
            Action::Abort => {
                tracing::debug!("Unknown escape command 0x{:02X}, sequence dropped", byte);
            }
            Action::HideCursor => buffer.set_cursor_visible(false),
            Action::ShowCursor => buffer.set_cursor_visible(true),
            Action::SetRow => buffer.set_cursor_row(byte as i32 - PARAM_BIAS as i32),
            Action::SetColumn => buffer.set_cursor_column(byte as i32 - PARAM_BIAS as i32),
        }
    }
}
