//! Terminal state and escape-code parser
//!
//! - **buffer**: scrolling rows of raw bytes plus the cursor
//! - **parser**: byte-at-a-time decoder for the control protocol

pub mod buffer;
pub mod parser;

use bitflags::bitflags;

pub use buffer::ScreenBuffer;
pub use parser::EscapeParser;

bitflags! {
    /// Side effects requested from the renderer
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Effects: u8 {
        /// Screen content or cursor position changed
        const REDRAW = 0b0001;
        /// Cursor visibility was toggled
        const CURSOR = 0b0010;
    }
}
