//! Ingress hand-off between the serial reader and the terminal
//!
//! The reader thread owns an [`IngressSender`] and pushes every chunk it
//! reads; the consumer side drains the matching [`IngressReceiver`] in
//! arrival order. The queue is unbounded: chunks are at most
//! [`MAX_CHUNK`] bytes and arrive at line speed.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Largest chunk a single read produces
pub const MAX_CHUNK: usize = 256;

/// Bytes delivered by one successful read
pub type Chunk = Vec<u8>;

/// Producer half, moved into the reader thread
#[derive(Clone, Debug)]
pub struct IngressSender {
    tx: Sender<Chunk>,
}

/// Consumer half, owned by the session
#[derive(Debug)]
pub struct IngressReceiver {
    rx: Receiver<Chunk>,
}

/// Create a connected sender/receiver pair
pub fn channel() -> (IngressSender, IngressReceiver) {
    let (tx, rx) = mpsc::channel();
    (IngressSender { tx }, IngressReceiver { rx })
}

impl IngressSender {
    /// Queue a chunk. Returns false once the receiver is gone.
    pub fn push(&self, chunk: Chunk) -> bool {
        if chunk.is_empty() {
            return true;
        }
        self.tx.send(chunk).is_ok()
    }
}

impl IngressReceiver {
    /// Next queued chunk, if any. `Err(Disconnected)` means every sender has been dropped
    /// and the queue is empty.
    pub fn try_next(&self) -> Result<Option<Chunk>, Disconnected> {
        match self.rx.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Disconnected),
        }
    }

    /// Block up to `timeout` for the next chunk
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<Chunk>, Disconnected> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Disconnected),
        }
    }

    /// Everything queued right now, oldest first
    #[cfg(test)]
    pub fn drain(&self) -> impl Iterator<Item = Chunk> + '_ {
        self.rx.try_iter()
    }
}

/// All senders were dropped; no more chunks will arrive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnected;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_chunks_arrive_in_order() {
        let (tx, rx) = channel();
        assert!(tx.push(b"AB".to_vec()));
        assert!(tx.push(b"CD".to_vec()));

        let bytes: Vec<u8> = rx.drain().flatten().collect();
        assert_eq!(bytes, b"ABCD");
    }

    #[test]
    fn test_order_across_threads() {
        let (tx, rx) = channel();
        let producer = thread::spawn(move || {
            for i in 0..100u8 {
                tx.push(vec![i, i]);
                if i % 10 == 0 {
                    thread::yield_now();
                }
            }
        });
        producer.join().unwrap();

        let bytes: Vec<u8> = rx.drain().flatten().collect();
        let expected: Vec<u8> = (0..100u8).flat_map(|i| [i, i]).collect();
        assert_eq!(bytes, expected);
        assert_eq!(rx.try_next(), Err(Disconnected));
    }

    #[test]
    fn test_empty_chunk_not_queued() {
        let (tx, rx) = channel();
        assert!(tx.push(Vec::new()));
        assert_eq!(rx.try_next(), Ok(None));
    }

    #[test]
    fn test_push_after_receiver_dropped() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(!tx.push(b"x".to_vec()));
    }

    #[test]
    fn test_next_timeout() {
        let (tx, rx) = channel();
        assert_eq!(rx.next_timeout(Duration::from_millis(5)), Ok(None));
        tx.push(b"z".to_vec());
        assert_eq!(rx.next_timeout(Duration::from_millis(5)), Ok(Some(b"z".to_vec())));
    }
}
