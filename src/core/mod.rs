//! Core serial terminal components.
//!
//! - **serial**: port lifecycle, background reader and flow-controlled writer
//! - **bridge**: ordered hand-off of received chunks to the consumer
//! - **term**: screen buffer and escape-code parser
//! - **session**: the consumer that ties them together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── SerialTransport ── reader thread ──┐
//! ├── IngressReceiver ◄── chunks ────────┘
//! ├── EscapeParser
//! └── ScreenBuffer (rows + cursor)
//! ```

pub mod bridge;
pub mod serial;
pub mod session;
pub mod term;
