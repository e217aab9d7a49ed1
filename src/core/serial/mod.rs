//! Serial port transport
//!
//! [`SerialTransport`] owns the lifecycle of a single port connection:
//! opening and configuring it, running the background reader that feeds
//! the ingress bridge, writing bytes with optional CTS gating, and closing
//! it again. The device itself sits behind the [`SerialPort`] trait so the
//! Win32 backend and the in-memory [`sim::SimulatedPort`] are interchangeable.

pub mod sim;
#[cfg(windows)]
pub mod win32;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::bridge::{IngressSender, MAX_CHUNK};

/// Supported line speeds
pub const BAUD_RATES: [u32; 8] = [300, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Highest COM port number
pub const MAX_PORT: u8 = 64;

/// Reader back-off after an empty read
const IDLE_POLL: Duration = Duration::from_millis(50);
/// How long `put_char` waits for CTS before writing anyway
const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const FLOW_CONTROL_POLL: Duration = Duration::from_millis(1);
/// How long `close` waits for the reader to exit
const CLOSE_TIMEOUT: Duration = Duration::from_millis(2000);
const CLOSE_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Invalid port number COM{0} (expected 1-{max})", max = MAX_PORT)]
    InvalidPort(u8),

    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaud(u32),

    #[error("Serial port is already open")]
    AlreadyOpen,

    #[error("Unable to open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to {step}: {source}")]
    Configure {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Serial ports are only supported on Windows")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Line parameters for one connection. Framing is always 8-N-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortSettings {
    /// COM port number, 1-based
    pub port: u8,
    pub baud: u32,
    pub hardware_flow_control: bool,
}

impl PortSettings {
    pub fn new(port: u8, baud: u32, hardware_flow_control: bool) -> Self {
        Self {
            port,
            baud,
            hardware_flow_control,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PORT).contains(&self.port) {
            return Err(SerialError::InvalidPort(self.port));
        }
        if !BAUD_RATES.contains(&self.baud) {
            return Err(SerialError::UnsupportedBaud(self.baud));
        }
        Ok(())
    }

    /// Short name shown to the user, e.g. `COM3`
    pub fn port_name(&self) -> String {
        format!("COM{}", self.port)
    }

    /// Device path passed to the OS; ports above 9 need the `\\.\` prefix
    pub fn device_path(&self) -> String {
        if self.port > 9 {
            format!(r"\\.\COM{}", self.port)
        } else {
            self.port_name()
        }
    }
}

/// An open serial device
///
/// Reads happen on the reader thread while writes and status queries come
/// from the consumer, so implementations must tolerate concurrent calls.
pub trait SerialPort: Send + Sync {
    /// Read whatever is available. `Ok(0)` means nothing was received and
    /// the caller should back off before trying again. Must not hold up
    /// concurrent `write_byte` or `clear_to_send` calls.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write a single byte
    fn write_byte(&self, byte: u8) -> io::Result<()>;

    /// State of the clear-to-send modem line
    fn clear_to_send(&self) -> io::Result<bool>;

    /// Unblock a pending `read`, if the backend ever waits in one
    fn cancel_read(&self);

    /// Discard everything queued in both directions
    fn purge(&self) -> io::Result<()>;
}

/// Opens and configures ports
pub trait PortOpener: Send + Sync {
    fn open(&self, settings: &PortSettings) -> Result<Arc<dyn SerialPort>>;
}

/// Opener for hosts without a serial backend
#[cfg_attr(windows, allow(dead_code))]
#[derive(Debug, Default)]
pub struct UnsupportedOpener;

impl PortOpener for UnsupportedOpener {
    fn open(&self, _settings: &PortSettings) -> Result<Arc<dyn SerialPort>> {
        Err(SerialError::Unsupported)
    }
}

/// The platform's native opener
pub fn system_opener() -> Box<dyn PortOpener> {
    #[cfg(windows)]
    {
        Box::new(win32::ComPortOpener)
    }
    #[cfg(not(windows))]
    {
        Box::new(UnsupportedOpener)
    }
}

/// Result of a single `put_char`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// CTS never came up; the byte was written anyway
    WrittenAfterFlowTimeout,
    /// The write itself failed or timed out; the byte is lost
    WriteFailed(io::ErrorKind),
    /// The modem status could not be read; nothing was written
    ModemStatusFailed(io::ErrorKind),
    NotOpen,
}

impl WriteOutcome {
    /// Whether the byte went out on the wire
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written | Self::WrittenAfterFlowTimeout)
    }
}

struct Connection {
    port: Arc<dyn SerialPort>,
    settings: PortSettings,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    /// Disconnects when the reader thread exits
    reader_done: Receiver<()>,
}

impl Connection {
    /// Stop the reader, purge and release the port
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.port.cancel_read();

        let started = Instant::now();
        let exited = loop {
            match self.reader_done.recv_timeout(CLOSE_POLL) {
                Err(RecvTimeoutError::Timeout) => {
                    if started.elapsed() >= CLOSE_TIMEOUT {
                        break false;
                    }
                    self.port.cancel_read();
                }
                _ => break true,
            }
        };

        if let Some(handle) = self.reader.take() {
            if exited {
                let _ = handle.join();
            } else {
                warn!(
                    "Serial reader did not exit within {:?}, detaching it",
                    CLOSE_TIMEOUT
                );
            }
        }

        if let Err(e) = self.port.purge() {
            debug!("Purge on close failed: {}", e);
        }
    }
}

enum Phase {
    Closed,
    Open(Connection),
    /// Reader is being stopped; no writes accepted
    Closing,
}

/// Single serial connection with a background reader
pub struct SerialTransport {
    opener: Box<dyn PortOpener>,
    phase: Mutex<Phase>,
    last_error: Mutex<Option<String>>,
}

impl SerialTransport {
    pub fn new(opener: Box<dyn PortOpener>) -> Self {
        Self {
            opener,
            phase: Mutex::new(Phase::Closed),
            last_error: Mutex::new(None),
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, error: Option<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Open the port and start forwarding received chunks to `consumer`
    ///
    /// Only one connection may exist at a time. On failure the error text
    /// is also kept for [`last_error`](Self::last_error).
    pub fn open(&self, settings: PortSettings, consumer: IngressSender) -> Result<()> {
        let result = self.open_connection(settings, consumer);
        match &result {
            Ok(()) => {
                self.set_last_error(None);
                info!(
                    "Opened {} at {} baud, {}",
                    settings.port_name(),
                    settings.baud,
                    if settings.hardware_flow_control {
                        "hardware flow control"
                    } else {
                        "no flow control"
                    }
                );
            }
            Err(e) => {
                self.set_last_error(Some(e.to_string()));
                warn!("Failed to open {}: {}", settings.port_name(), e);
            }
        }
        result
    }

    fn open_connection(&self, settings: PortSettings, consumer: IngressSender) -> Result<()> {
        settings.validate()?;

        let mut phase = self.lock_phase();
        if !matches!(*phase, Phase::Closed) {
            return Err(SerialError::AlreadyOpen);
        }

        let port = self.opener.open(&settings)?;
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, reader_done) = mpsc::channel();

        let reader = spawn_reader(port.clone(), stop.clone(), consumer, done_tx).map_err(
            |source| SerialError::Configure {
                step: "start reader thread",
                source,
            },
        )?;

        *phase = Phase::Open(Connection {
            port,
            settings,
            stop,
            reader: Some(reader),
            reader_done,
        });
        Ok(())
    }

    /// Stop the reader and release the port. Does nothing when already closed.
    pub fn close(&self) {
        let connection = {
            let mut phase = self.lock_phase();
            match std::mem::replace(&mut *phase, Phase::Closing) {
                Phase::Open(connection) => connection,
                other => {
                    *phase = other;
                    return;
                }
            }
        };

        let name = connection.settings.port_name();
        connection.shutdown();
        *self.lock_phase() = Phase::Closed;
        info!("Closed {}", name);
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock_phase(), Phase::Open(_))
    }

    /// Settings of the current connection
    #[cfg(test)]
    pub fn settings(&self) -> Option<PortSettings> {
        match &*self.lock_phase() {
            Phase::Open(connection) => Some(connection.settings),
            _ => None,
        }
    }

    /// Text of the most recent `open` failure
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send one byte
    ///
    /// With hardware flow control the CTS line is polled for up to a second
    /// first; if it never rises the byte is written regardless and the
    /// outcome says so. Holds the connection lock throughout, so `close`
    /// waits for an in-flight write.
    pub fn put_char(&self, byte: u8) -> WriteOutcome {
        let phase = self.lock_phase();
        let connection = match &*phase {
            Phase::Open(connection) => connection,
            _ => return WriteOutcome::NotOpen,
        };

        let mut outcome = WriteOutcome::Written;
        if connection.settings.hardware_flow_control {
            match wait_for_clear_to_send(connection.port.as_ref(), FLOW_CONTROL_TIMEOUT) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("CTS wait timed out, writing 0x{:02X} anyway", byte);
                    outcome = WriteOutcome::WrittenAfterFlowTimeout;
                }
                Err(e) => {
                    warn!("Failed to read modem status: {}", e);
                    return WriteOutcome::ModemStatusFailed(e.kind());
                }
            }
        }

        match connection.port.write_byte(byte) {
            Ok(()) => outcome,
            Err(e) => {
                warn!("Write of 0x{:02X} failed: {}", byte, e);
                WriteOutcome::WriteFailed(e.kind())
            }
        }
    }

    /// Send bytes one at a time, stopping at the first one that could not be
    /// written. Returns how many went out.
    pub fn put_bytes(&self, bytes: &[u8]) -> usize {
        bytes
            .iter()
            .take_while(|&&b| self.put_char(b).is_written())
            .count()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Poll CTS until it is asserted or `timeout` passes
fn wait_for_clear_to_send(port: &dyn SerialPort, timeout: Duration) -> io::Result<bool> {
    let started = Instant::now();
    loop {
        if port.clear_to_send()? {
            return Ok(true);
        }
        if started.elapsed() >= timeout {
            return Ok(false);
        }
        thread::sleep(FLOW_CONTROL_POLL);
    }
}

fn spawn_reader(
    port: Arc<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    consumer: IngressSender,
    done: Sender<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || {
            // Dropped on exit, which wakes `close`
            let _done = done;
            let mut buffer = [0u8; MAX_CHUNK];

            while !stop.load(Ordering::SeqCst) {
                match port.read(&mut buffer) {
                    Ok(0) => thread::sleep(IDLE_POLL),
                    Ok(n) => {
                        if !consumer.push(buffer[..n].to_vec()) {
                            debug!("Ingress receiver dropped, stopping reader");
                            break;
                        }
                    }
                    Err(_) if stop.load(Ordering::SeqCst) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("Serial reader stopped: {}", e);
                        break;
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::sim::SimulatedOpener;
    use super::*;
    use crate::core::bridge;

    fn transport() -> (SerialTransport, Arc<sim::SimulatedPort>) {
        let (opener, port) = SimulatedOpener::new();
        (SerialTransport::new(Box::new(opener)), port)
    }

    fn settings() -> PortSettings {
        PortSettings::new(3, 9600, false)
    }

    fn collect(rx: &bridge::IngressReceiver, expected: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        let started = Instant::now();
        while bytes.len() < expected && started.elapsed() < Duration::from_secs(2) {
            if let Ok(Some(chunk)) = rx.next_timeout(Duration::from_millis(20)) {
                bytes.extend(chunk);
            }
        }
        bytes
    }

    #[test]
    fn test_open_close() {
        let (transport, _port) = transport();
        let (tx, _rx) = bridge::channel();

        assert!(transport.open(settings(), tx).is_ok());
        assert!(transport.is_open());
        assert_eq!(transport.settings(), Some(settings()));

        transport.close();
        assert!(!transport.is_open());
        transport.close();
        assert!(!transport.is_open());
    }

    #[test]
    fn test_reopen_after_close() {
        let (transport, _port) = transport();
        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx.clone()).unwrap();
        transport.close();
        assert!(transport.open(settings(), tx).is_ok());
    }

    #[test]
    fn test_second_open_rejected() {
        let (transport, _port) = transport();
        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx.clone()).unwrap();

        let err = transport.open(settings(), tx).unwrap_err();
        assert!(matches!(err, SerialError::AlreadyOpen));
        assert!(transport.is_open());
    }

    #[test]
    fn test_open_validates_settings() {
        let (transport, _port) = transport();
        let (tx, _rx) = bridge::channel();

        let err = transport.open(PortSettings::new(0, 9600, false), tx.clone());
        assert!(matches!(err, Err(SerialError::InvalidPort(0))));
        let err = transport.open(PortSettings::new(65, 9600, false), tx.clone());
        assert!(matches!(err, Err(SerialError::InvalidPort(65))));
        let err = transport.open(PortSettings::new(1, 1200, false), tx);
        assert!(matches!(err, Err(SerialError::UnsupportedBaud(1200))));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_busy_port_reports_last_error() {
        let transport = SerialTransport::new(Box::new(SimulatedOpener::busy()));
        let (tx, _rx) = bridge::channel();

        let err = transport.open(settings(), tx).unwrap_err();
        assert!(matches!(err, SerialError::Open { .. }));
        let message = transport.last_error().unwrap();
        assert!(message.contains("COM3"), "{}", message);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_last_error_cleared_on_success() {
        let (transport, _port) = transport();
        let (tx, _rx) = bridge::channel();
        let _ = transport.open(PortSettings::new(1, 1, false), tx.clone());
        assert!(transport.last_error().is_some());
        transport.open(settings(), tx).unwrap();
        assert!(transport.last_error().is_none());
    }

    #[test]
    fn test_open_purges_port() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx).unwrap();
        assert_eq!(port.purge_count(), 1);
        transport.close();
        assert_eq!(port.purge_count(), 2);
    }

    #[test]
    fn test_reader_forwards_chunks_in_order() {
        let (transport, port) = transport();
        let (tx, rx) = bridge::channel();
        transport.open(settings(), tx).unwrap();

        port.inject(b"AB");
        port.inject(b"CD");
        assert_eq!(collect(&rx, 4), b"ABCD");
        transport.close();
    }

    #[test]
    fn test_close_stops_reader() {
        let (transport, port) = transport();
        let (tx, rx) = bridge::channel();
        transport.open(settings(), tx.clone()).unwrap();
        transport.close();

        port.inject(b"late");
        assert_eq!(rx.next_timeout(Duration::from_millis(100)), Ok(None));
    }

    #[test]
    fn test_reader_retries_empty_reads() {
        let (transport, port) = transport();
        let (tx, rx) = bridge::channel();
        port.return_empty(3);

        let started = Instant::now();
        transport.open(settings(), tx).unwrap();
        port.inject(b"ok");

        assert_eq!(collect(&rx, 2), b"ok");
        assert!(started.elapsed() >= IDLE_POLL * 3);
        assert!(port.read_count() >= 4);
        transport.close();
    }

    #[test]
    fn test_close_gives_up_on_stuck_reader() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        port.stall_next_read(Duration::from_secs(4));
        transport.open(settings(), tx).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        transport.close();
        let took = started.elapsed();

        assert!(took >= CLOSE_TIMEOUT, "{:?}", took);
        assert!(took < Duration::from_secs(4), "{:?}", took);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_put_char() {
        let (transport, port) = transport();
        assert_eq!(transport.put_char(b'x'), WriteOutcome::NotOpen);

        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx).unwrap();
        assert_eq!(transport.put_char(b'h'), WriteOutcome::Written);
        assert_eq!(transport.put_char(b'i'), WriteOutcome::Written);
        assert_eq!(port.written(), b"hi");
    }

    #[test]
    fn test_put_char_ignores_cts_without_flow_control() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        port.set_clear_to_send(false);
        transport.open(settings(), tx).unwrap();
        assert_eq!(transport.put_char(b'a'), WriteOutcome::Written);
    }

    #[test]
    fn test_put_char_flow_control_timeout() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        port.set_clear_to_send(false);
        transport
            .open(PortSettings::new(3, 9600, true), tx)
            .unwrap();

        let started = Instant::now();
        assert_eq!(transport.put_char(b'a'), WriteOutcome::WrittenAfterFlowTimeout);
        assert!(started.elapsed() >= FLOW_CONTROL_TIMEOUT);
        assert_eq!(port.written(), b"a");

        port.set_clear_to_send(true);
        assert_eq!(transport.put_char(b'b'), WriteOutcome::Written);
    }

    #[test]
    fn test_put_char_write_failure() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx).unwrap();

        port.fail_writes(Some(io::ErrorKind::TimedOut));
        assert_eq!(
            transport.put_char(b'a'),
            WriteOutcome::WriteFailed(io::ErrorKind::TimedOut)
        );
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_put_bytes_stops_at_failure() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx).unwrap();

        assert_eq!(transport.put_bytes(b"abc"), 3);
        port.fail_writes(Some(io::ErrorKind::BrokenPipe));
        assert_eq!(transport.put_bytes(b"def"), 0);
        assert_eq!(port.written(), b"abc");
    }

    #[test]
    fn test_device_path() {
        assert_eq!(PortSettings::new(3, 9600, false).device_path(), "COM3");
        assert_eq!(PortSettings::new(9, 9600, false).device_path(), "COM9");
        assert_eq!(PortSettings::new(12, 9600, false).device_path(), r"\\.\COM12");
        assert_eq!(PortSettings::new(12, 9600, false).port_name(), "COM12");
    }

    #[test]
    fn test_drop_closes() {
        let (transport, port) = transport();
        let (tx, _rx) = bridge::channel();
        transport.open(settings(), tx).unwrap();
        drop(transport);
        assert_eq!(port.purge_count(), 2);
    }
}
