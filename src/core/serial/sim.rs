//! In-memory serial port
//!
//! Stands in for a real device in tests and demo mode. Bytes injected with
//! [`SimulatedPort::inject`] come out of `read` one chunk at a time; written
//! bytes are recorded for inspection.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{PortOpener, PortSettings, Result, SerialError, SerialPort};

#[derive(Debug)]
struct Wire {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    clear_to_send: bool,
    cancelled: bool,
    write_error: Option<io::ErrorKind>,
    /// Reads that return `Ok(0)` before the next one waits for data
    empty_reads: usize,
    /// Next read sleeps this long and ignores `cancel_read`
    stall: Option<Duration>,
    #[cfg(test)]
    reads: usize,
    #[cfg(test)]
    purges: usize,
}

/// Fake device driven from the test side
#[derive(Debug)]
pub struct SimulatedPort {
    line: Mutex<Wire>,
    ready: Condvar,
}

impl SimulatedPort {
    pub fn new() -> Self {
        Self {
            line: Mutex::new(Wire {
                incoming: VecDeque::new(),
                written: Vec::new(),
                clear_to_send: true,
                cancelled: false,
                write_error: None,
                empty_reads: 0,
                stall: None,
                #[cfg(test)]
                reads: 0,
                #[cfg(test)]
                purges: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Wire> {
        self.line.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes as if the remote end had sent them
    pub fn inject(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.lock().incoming.push_back(bytes.to_vec());
        self.ready.notify_all();
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    #[cfg(test)]
    pub fn set_clear_to_send(&self, asserted: bool) {
        self.lock().clear_to_send = asserted;
    }

    /// Make subsequent writes fail with `kind`, or succeed again with `None`
    #[cfg(test)]
    pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
        self.lock().write_error = kind;
    }

    /// Have the next `count` reads come back empty without waiting
    #[cfg(test)]
    pub fn return_empty(&self, count: usize) {
        self.lock().empty_reads = count;
    }

    /// Have the next read sleep for `duration` regardless of `cancel_read`
    #[cfg(test)]
    pub fn stall_next_read(&self, duration: Duration) {
        self.lock().stall = Some(duration);
    }

    #[cfg(test)]
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    #[cfg(test)]
    pub fn purge_count(&self) -> usize {
        self.lock().purges
    }

    fn reset_cancel(&self) {
        self.lock().cancelled = false;
    }
}

impl Default for SimulatedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for SimulatedPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut line = self.lock();
        #[cfg(test)]
        {
            line.reads += 1;
        }

        if let Some(stall) = line.stall.take() {
            drop(line);
            thread::sleep(stall);
            return Ok(0);
        }
        if line.empty_reads > 0 {
            line.empty_reads -= 1;
            return Ok(0);
        }

        while line.incoming.is_empty() && !line.cancelled {
            line = self
                .ready
                .wait(line)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if line.cancelled {
            line.cancelled = false;
            return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
        }

        let Some(mut chunk) = line.incoming.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            line.incoming.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn write_byte(&self, byte: u8) -> io::Result<()> {
        let mut line = self.lock();
        if let Some(kind) = line.write_error {
            return Err(io::Error::new(kind, "simulated write failure"));
        }
        line.written.push(byte);
        Ok(())
    }

    fn clear_to_send(&self) -> io::Result<bool> {
        Ok(self.lock().clear_to_send)
    }

    fn cancel_read(&self) {
        self.lock().cancelled = true;
        self.ready.notify_all();
    }

    fn purge(&self) -> io::Result<()> {
        let mut line = self.lock();
        line.incoming.clear();
        #[cfg(test)]
        {
            line.purges += 1;
        }
        Ok(())
    }
}

/// Opener that always hands out the same simulated port
pub struct SimulatedOpener {
    port: Option<Arc<SimulatedPort>>,
}

impl SimulatedOpener {
    /// Opener plus a handle to the port it opens
    pub fn new() -> (Self, Arc<SimulatedPort>) {
        let port = Arc::new(SimulatedPort::new());
        (
            Self {
                port: Some(port.clone()),
            },
            port,
        )
    }

    /// Opener whose port is always in use by someone else
    #[cfg(test)]
    pub fn busy() -> Self {
        Self { port: None }
    }
}

impl PortOpener for SimulatedOpener {
    fn open(&self, settings: &PortSettings) -> Result<Arc<dyn SerialPort>> {
        let port = self.port.as_ref().ok_or_else(|| SerialError::Open {
            name: settings.device_path(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "Access is denied."),
        })?;

        port.reset_cancel();
        port.purge()
            .map_err(|source| SerialError::Configure {
                step: "purge port",
                source,
            })?;
        Ok(port.clone())
    }
}
