//! Console front-end.
//!
//! - **renderer**: paints the screen buffer and status line with crossterm
//! - **keymapper**: keyboard input to serial bytes and local commands

pub mod keymapper;
pub mod renderer;

pub use keymapper::*;
pub use renderer::*;
