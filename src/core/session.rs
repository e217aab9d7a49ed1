//! Terminal session
//!
//! Ties the serial transport, the ingress bridge, the escape parser and the
//! screen buffer together. The session is the consumer side of the bridge:
//! everything that touches the screen runs on the thread that owns it.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use super::bridge::{self, Chunk, Disconnected, IngressReceiver};
use super::serial::{self, PortOpener, PortSettings, SerialTransport, WriteOutcome};
use super::term::{Effects, EscapeParser, ScreenBuffer};

/// Called with the raw bytes of every received chunk after it was parsed
pub type ByteObserver = Box<dyn FnMut(&[u8]) + Send>;

/// Connection state shown on the status line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Closed,
    /// The last open attempt failed
    Failed,
    Open,
}

/// Traffic seen since the last `take_activity`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Activity {
    pub rx: bool,
    pub tx: bool,
}

/// A serial terminal session
pub struct Session {
    /// Screen contents
    pub buffer: ScreenBuffer,
    parser: EscapeParser,
    transport: SerialTransport,
    /// Present while a connection is open
    ingress: Option<IngressReceiver>,
    observers: Vec<ByteObserver>,
    settings: PortSettings,
    status: LinkStatus,
    activity: Activity,
}

impl Session {
    /// Create a disconnected session
    pub fn new(
        opener: Box<dyn PortOpener>,
        settings: PortSettings,
        crlf: bool,
        initial_rows: usize,
    ) -> Self {
        Self {
            buffer: ScreenBuffer::new(initial_rows),
            parser: EscapeParser::new(crlf),
            transport: SerialTransport::new(opener),
            ingress: None,
            observers: Vec::new(),
            settings,
            status: LinkStatus::Closed,
            activity: Activity::default(),
        }
    }

    /// Open the port described by `settings`
    pub fn connect(&mut self, settings: PortSettings) -> serial::Result<()> {
        let (tx, rx) = bridge::channel();
        match self.transport.open(settings, tx) {
            Ok(()) => {
                self.settings = settings;
                self.ingress = Some(rx);
                self.status = LinkStatus::Open;
                Ok(())
            }
            Err(e) => {
                if !self.transport.is_open() {
                    self.status = LinkStatus::Failed;
                }
                Err(e)
            }
        }
    }

    /// Close the port, processing whatever the reader already queued
    pub fn disconnect(&mut self) -> Effects {
        if !self.transport.is_open() {
            return Effects::empty();
        }
        self.transport.close();
        let effects = self.process_input();
        self.ingress = None;
        self.status = LinkStatus::Closed;
        effects
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    #[cfg(test)]
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// Settings of the current or most recent connection
    pub fn settings(&self) -> PortSettings {
        self.settings
    }

    /// Text of the most recent open failure
    pub fn last_error(&self) -> Option<String> {
        self.transport.last_error()
    }

    /// Register a callback for raw received chunks
    pub fn on_bytes_received(&mut self, observer: ByteObserver) {
        self.observers.push(observer);
    }

    /// Process every chunk queued by the reader (non-blocking)
    pub fn process_input(&mut self) -> Effects {
        let mut effects = Effects::empty();
        loop {
            let next = match &self.ingress {
                Some(rx) => rx.try_next(),
                None => return effects,
            };
            match next {
                Ok(Some(chunk)) => effects |= self.handle_chunk(chunk),
                Ok(None) => return effects,
                Err(Disconnected) => {
                    self.reader_gone();
                    return effects;
                }
            }
        }
    }

    /// Wait up to `timeout` for input, then process everything queued
    pub fn wait_input(&mut self, timeout: Duration) -> Effects {
        let first = match &self.ingress {
            Some(rx) => rx.next_timeout(timeout),
            None => return Effects::empty(),
        };
        match first {
            Ok(Some(chunk)) => self.handle_chunk(chunk) | self.process_input(),
            Ok(None) => Effects::empty(),
            Err(Disconnected) => {
                self.reader_gone();
                Effects::empty()
            }
        }
    }

    fn handle_chunk(&mut self, chunk: Chunk) -> Effects {
        let effects = self.feed_bytes(&chunk);
        self.activity.rx = true;
        for observer in &mut self.observers {
            observer(&chunk);
        }
        effects
    }

    /// The reader exited while the port was still open
    fn reader_gone(&mut self) {
        self.ingress = None;
        if self.transport.is_open() {
            warn!("Serial reader stopped unexpectedly, closing port");
            self.transport.close();
        }
        self.status = LinkStatus::Closed;
    }

    /// Run bytes through the parser as if they had been received
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Effects {
        let mut effects = Effects::empty();
        for &b in bytes {
            if let Some(e) = self.parser.feed(b, &mut self.buffer) {
                effects |= e;
            }
        }
        effects
    }

    /// Send one byte to the remote end
    pub fn send_byte(&mut self, byte: u8) -> WriteOutcome {
        let outcome = self.transport.put_char(byte);
        if outcome.is_written() {
            self.activity.tx = true;
        }
        outcome
    }

    /// Send a byte sequence. Returns how many bytes went out.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> usize {
        let sent = self.transport.put_bytes(bytes);
        if sent > 0 {
            self.activity.tx = true;
        }
        if sent < bytes.len() {
            debug!("Sent {} of {} bytes", sent, bytes.len());
        }
        sent
    }

    /// Flip CR/LF mode, returning the new setting
    pub fn toggle_crlf(&mut self) -> bool {
        let crlf = !self.parser.crlf();
        self.parser.set_crlf(crlf);
        crlf
    }

    /// Home the cursor and blank the screen
    pub fn clear_screen(&mut self) -> Effects {
        self.parser.reset();
        self.buffer.clear();
        self.buffer.take_effects()
    }

    /// Adopt a new display size
    pub fn resize(&mut self, cols: usize, rows: usize) -> Effects {
        self.buffer.set_viewport(cols, rows);
        self.buffer.take_effects()
    }

    /// Write the populated rows to `path`, one line each
    pub fn save_screen(&self, path: &Path) -> io::Result<()> {
        let mut text = self.buffer.text();
        text.push('\n');
        fs::write(path, text)
    }

    /// Rx/Tx flags since the previous call
    pub fn take_activity(&mut self) -> Activity {
        std::mem::take(&mut self.activity)
    }

    /// Status bar text
    pub fn status_line(&self) -> String {
        match self.status {
            LinkStatus::Closed => "Serial port closed".to_string(),
            LinkStatus::Failed => match self.last_error() {
                Some(reason) => format!(
                    "Unable to open serial port - check comm setup ({})",
                    reason
                ),
                None => "Unable to open serial port - check comm setup".to_string(),
            },
            LinkStatus::Open => format!(
                "{} | {} | N-8-1 | {} Flow Control | {} CR/LF",
                self.settings.port_name(),
                self.settings.baud,
                if self.settings.hardware_flow_control {
                    "Hardware"
                } else {
                    "No"
                },
                if self.parser.crlf() { "UNIX" } else { "DOS" },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::serial::sim::{SimulatedOpener, SimulatedPort};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn session() -> (Session, Arc<SimulatedPort>) {
        let (opener, port) = SimulatedOpener::new();
        let settings = PortSettings::new(3, 9600, false);
        (Session::new(Box::new(opener), settings, false, 4), port)
    }

    /// Pump input until `done` holds or a second passes
    fn pump_until(session: &mut Session, done: impl Fn(&Session) -> bool) {
        let started = Instant::now();
        while !done(session) && started.elapsed() < Duration::from_secs(1) {
            session.wait_input(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_connect_disconnect() {
        let (mut session, _port) = session();
        assert_eq!(session.status(), LinkStatus::Closed);
        assert_eq!(session.status_line(), "Serial port closed");

        session.connect(PortSettings::new(3, 9600, false)).unwrap();
        assert!(session.is_connected());
        assert_eq!(session.status(), LinkStatus::Open);
        assert_eq!(
            session.status_line(),
            "COM3 | 9600 | N-8-1 | No Flow Control | DOS CR/LF"
        );

        session.disconnect();
        assert!(!session.is_connected());
        assert_eq!(session.status(), LinkStatus::Closed);
        session.disconnect();
    }

    #[test]
    fn test_failed_connect_status() {
        let settings = PortSettings::new(3, 9600, false);
        let mut session = Session::new(Box::new(SimulatedOpener::busy()), settings, false, 4);

        assert!(session.connect(settings).is_err());
        assert_eq!(session.status(), LinkStatus::Failed);
        let line = session.status_line();
        assert!(line.starts_with("Unable to open serial port - check comm setup ("));
        assert!(line.contains("COM3"), "{}", line);
        assert!(line.contains("Access is denied."), "{}", line);
    }

    #[test]
    fn test_second_connect_keeps_first() {
        let (mut session, _port) = session();
        session.connect(PortSettings::new(3, 9600, false)).unwrap();
        assert!(session.connect(PortSettings::new(4, 9600, false)).is_err());
        assert_eq!(session.status(), LinkStatus::Open);
        assert_eq!(session.settings().port, 3);
    }

    #[test]
    fn test_received_bytes_reach_screen() {
        let (mut session, port) = session();
        session.connect(PortSettings::new(3, 9600, false)).unwrap();

        port.inject(b"AB");
        port.inject(b"CD");
        pump_until(&mut session, |s| s.buffer.cursor_x() == 4);

        assert_eq!(session.buffer.text(), "ABCD");
        assert!(session.take_activity().rx);
        assert!(!session.take_activity().rx);
    }

    #[test]
    fn test_observers_see_chunks_in_order() {
        let (mut session, port) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_bytes_received(Box::new(move |bytes| {
            sink.lock().unwrap().extend_from_slice(bytes);
        }));
        session.connect(PortSettings::new(3, 9600, false)).unwrap();

        port.inject(b"\x1bT");
        port.inject(b"xy");
        pump_until(&mut session, |_| seen.lock().unwrap().len() == 4);

        assert_eq!(*seen.lock().unwrap(), b"\x1bTxy");
        assert_eq!(session.buffer.text(), "xy");
    }

    #[test]
    fn test_send_byte() {
        let (mut session, port) = session();
        assert_eq!(session.send_byte(b'a'), WriteOutcome::NotOpen);
        assert!(!session.take_activity().tx);

        session.connect(PortSettings::new(3, 9600, false)).unwrap();
        assert_eq!(session.send_byte(b'a'), WriteOutcome::Written);
        assert_eq!(session.send_bytes(b"bc"), 2);
        assert_eq!(port.written(), b"abc");
        assert!(session.take_activity().tx);
    }

    #[test]
    fn test_toggle_crlf() {
        let (mut session, _port) = session();
        session.connect(PortSettings::new(3, 9600, false)).unwrap();
        assert!(session.toggle_crlf());
        assert!(session.status_line().ends_with("UNIX CR/LF"));

        session.feed_bytes(b"ab\ncd");
        assert_eq!(session.buffer.text(), "ab\ncd");
    }

    #[test]
    fn test_clear_screen_resets_parser() {
        let (mut session, _port) = session();
        session.feed_bytes(b"text\x1b=");
        let effects = session.clear_screen();
        assert!(effects.contains(Effects::REDRAW));

        session.feed_bytes(b"ok");
        assert_eq!(session.buffer.cursor(), (2, 0));
        assert!(session.buffer.text().starts_with("ok"));
    }

    #[test]
    fn test_resize_scrolls() {
        let (mut session, _port) = session();
        session.feed_bytes(b"1\r\n2\r\n3\r\n4");
        session.resize(80, 2);
        assert_eq!(session.buffer.text(), "3\n4");
    }

    #[test]
    fn test_save_screen() {
        let (mut session, _port) = session();
        session.feed_bytes(b"first\r\nsecond \xe9");

        let path = std::env::temp_dir().join(format!("comterm-screen-{}.txt", std::process::id()));
        session.save_screen(&path).unwrap();
        let saved = fs::read_to_string(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(saved, "first\nsecond \u{e9}\n");
    }

    #[test]
    fn test_process_input_without_connection() {
        let (mut session, _port) = session();
        assert!(session.process_input().is_empty());
        assert!(session.wait_input(Duration::from_millis(1)).is_empty());
    }
}
