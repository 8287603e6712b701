//! Bounded SPSC byte ring buffer
//!
//! Carries the OTA delta patch stream from the command receiver (producer,
//! main loop) to the patch worker (consumer). The producer blocks until the
//! whole chunk fits or a timeout elapses; the consumer blocks until bytes
//! arrive or the producer closes the ring, which reads as EOF.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Ring buffer failures seen by the producer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The chunk did not fit within the timeout
    #[error("ring buffer full")]
    Full,

    /// The ring was closed
    #[error("ring buffer closed")]
    Closed,
}

struct Inner {
    buf: VecDeque<u8>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    capacity: usize,
    readable: Condvar,
    writable: Condvar,
}

/// Create a ring of the given byte capacity
pub fn byte_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buf: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        capacity,
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// Writing half, held by the main loop
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Push a whole chunk, waiting up to `timeout` for space.
    ///
    /// All-or-nothing: either the entire chunk is enqueued or the ring is
    /// left untouched.
    pub fn push(&self, data: &[u8], timeout: Duration) -> Result<(), RingError> {
        if data.len() > self.shared.capacity {
            return Err(RingError::Full);
        }

        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(RingError::Closed);
            }
            if self.shared.capacity - inner.buf.len() >= data.len() {
                inner.buf.extend(data);
                self.shared.readable.notify_one();
                return Ok(());
            }
            let (guard, result) = self
                .shared
                .writable
                .wait_timeout(inner, timeout)
                .unwrap();
            inner = guard;
            if result.timed_out() {
                if !inner.closed && self.shared.capacity - inner.buf.len() >= data.len() {
                    inner.buf.extend(data);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
                return Err(if inner.closed {
                    RingError::Closed
                } else {
                    RingError::Full
                });
            }
        }
    }

    /// Close the ring; the consumer reads EOF once drained
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.closed = true;
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Discard all buffered bytes
    pub fn clear(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.buf.clear();
        self.shared.writable.notify_all();
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reading half, moved into the patch worker
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl Read for RingConsumer {
    /// Blocks until bytes are available or the ring is closed (then `Ok(0)`)
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inner = self.shared.inner.lock().unwrap();
        while inner.buf.is_empty() {
            if inner.closed {
                return Ok(0);
            }
            inner = self.shared.readable.wait(inner).unwrap();
        }

        let n = buf.len().min(inner.buf.len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.buf.pop_front().unwrap();
        }
        self.shared.writable.notify_one();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_then_read() {
        let (producer, mut consumer) = byte_ring(16);
        producer.push(b"hello", Duration::from_millis(10)).unwrap();
        assert_eq!(producer.len(), 5);

        let mut buf = [0u8; 16];
        let n = consumer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(producer.is_empty());
    }

    #[test]
    fn test_full_ring_times_out() {
        let (producer, _consumer) = byte_ring(4);
        producer.push(b"abcd", Duration::from_millis(10)).unwrap();
        assert_eq!(
            producer.push(b"e", Duration::from_millis(10)),
            Err(RingError::Full)
        );
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let (producer, _consumer) = byte_ring(4);
        assert_eq!(
            producer.push(b"abcdef", Duration::from_millis(10)),
            Err(RingError::Full)
        );
    }

    #[test]
    fn test_close_reads_as_eof() {
        let (producer, mut consumer) = byte_ring(16);
        producer.push(b"ab", Duration::from_millis(10)).unwrap();
        producer.close();

        // Buffered bytes drain first, then EOF
        let mut buf = [0u8; 16];
        assert_eq!(consumer.read(&mut buf).unwrap(), 2);
        assert_eq!(consumer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_push_after_close_fails() {
        let (producer, _consumer) = byte_ring(16);
        producer.close();
        assert_eq!(
            producer.push(b"x", Duration::from_millis(10)),
            Err(RingError::Closed)
        );
    }

    #[test]
    fn test_consumer_unblocks_producer() {
        let (producer, mut consumer) = byte_ring(8);
        producer.push(&[1u8; 8], Duration::from_millis(10)).unwrap();

        let reader = thread::spawn(move || {
            let mut total = Vec::new();
            let mut buf = [0u8; 4];
            loop {
                match consumer.read(&mut buf).unwrap() {
                    0 => break,
                    n => total.extend_from_slice(&buf[..n]),
                }
            }
            total
        });

        // Blocks until the reader frees space
        producer.push(&[2u8; 8], Duration::from_secs(5)).unwrap();
        producer.close();

        let total = reader.join().unwrap();
        assert_eq!(total.len(), 16);
        assert_eq!(&total[..8], &[1u8; 8]);
        assert_eq!(&total[8..], &[2u8; 8]);
    }

    #[test]
    fn test_clear_discards_buffered_bytes() {
        let (producer, mut consumer) = byte_ring(8);
        producer.push(&[9u8; 8], Duration::from_millis(10)).unwrap();
        producer.clear();
        assert!(producer.is_empty());
        producer.close();

        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf).unwrap(), 0);
    }
}
