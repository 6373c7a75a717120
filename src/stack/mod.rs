//! The shared transmit plumbing between the connection engine and the
//! transmit thread.
//!
//! The engine runs on the receive thread and never sends packets itself.
//! Instead it borrows a [`PacketBuffer`] from a shared pool, formats the
//! response into it, and pushes it onto a multi-producer queue. A dedicated
//! transmit thread drains the queue, puts the bytes on the wire, and returns
//! each buffer to the pool. No connection state ever crosses the thread
//! boundary, only self-contained byte buffers.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

use crate::wire::{Ipv4Address, Ipv6Address};

pub mod template;

pub use self::template::TemplatePacket;

/// An outgoing packet in flight between the formatting and transmit threads.
pub struct PacketBuffer {
    bytes: Box<[u8]>,
    len: usize,
}

/// An inclusive-exclusive span of source addresses or ports the scanner owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange<T> {
    pub first: T,
    pub last: T,
}

/// The transmit-side source configuration: which local addresses and ports
/// outgoing connections may be minted from.
#[derive(Debug, Clone, Copy)]
pub struct StackSource {
    pub ipv4: SourceRange<Ipv4Address>,
    pub ipv6: SourceRange<Ipv6Address>,
    pub port: SourceRange<u16>,
}

/// The buffer pool and transmit queue shared with the transmit thread.
pub struct Stack {
    pool: Mutex<Vec<PacketBuffer>>,
    queue: Mutex<mpsc::Sender<PacketBuffer>>,
    src: StackSource,
    pool_warned: AtomicBool,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> PacketBuffer {
        PacketBuffer {
            bytes: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// The formatted portion of the buffer.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The whole backing storage, for formatting into.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Record how many octets of the storage were formatted.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.bytes.len());
        self.len = len;
    }
}

impl Default for StackSource {
    fn default() -> StackSource {
        StackSource {
            ipv4: SourceRange {
                first: Ipv4Address::default(),
                last: Ipv4Address::default(),
            },
            ipv6: SourceRange {
                first: Ipv6Address::default(),
                last: Ipv6Address::default(),
            },
            port: SourceRange {
                first: 40000,
                last: 60000,
            },
        }
    }
}

impl Stack {
    /// Create the shared stack with `buffers` pre-allocated packet buffers of
    /// `buffer_size` octets each.
    ///
    /// Returns the receiving end of the transmit queue, to be moved into the
    /// transmit thread. Drained buffers should be handed back through
    /// [`Stack::recycle`].
    pub fn new(
        src: StackSource,
        buffers: usize,
        buffer_size: usize,
    ) -> (Stack, mpsc::Receiver<PacketBuffer>) {
        let (tx, rx) = mpsc::channel();
        let pool = (0..buffers).map(|_| PacketBuffer::new(buffer_size)).collect();
        let stack = Stack {
            pool: Mutex::new(pool),
            queue: Mutex::new(tx),
            src,
            pool_warned: AtomicBool::new(false),
        };
        (stack, rx)
    }

    pub fn source(&self) -> &StackSource {
        &self.src
    }

    /// Borrow a buffer for formatting an outgoing packet.
    ///
    /// The pool running dry means the transmit thread has fallen impossibly
    /// far behind. Yield briefly and retry once, then give up; the caller
    /// drops the packet, which TCP tolerates.
    pub fn packet_buffer(&self) -> Option<PacketBuffer> {
        if let Some(buffer) = self.pool_pop() {
            return Some(buffer);
        }

        if !self.pool_warned.swap(true, Ordering::Relaxed) {
            net_warn!("packet buffers empty (should be impossible)");
        }
        std::thread::sleep(core::time::Duration::from_micros(100));
        self.pool_pop()
    }

    /// Queue a formatted buffer for the transmit thread.
    pub fn transmit(&self, buffer: PacketBuffer) {
        let result = self
            .queue
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .send(buffer);
        if let Err(mpsc::SendError(buffer)) = result {
            net_debug!("transmit queue closed, dropping packet");
            self.recycle(buffer);
        }
    }

    /// Return a drained buffer to the pool.
    pub fn recycle(&self, mut buffer: PacketBuffer) {
        buffer.len = 0;
        self.pool_lock().push(buffer);
    }

    fn pool_pop(&self) -> Option<PacketBuffer> {
        self.pool_lock().pop()
    }

    fn pool_lock(&self) -> std::sync::MutexGuard<'_, Vec<PacketBuffer>> {
        // A poisoned pool mutex only means another thread panicked while
        // holding a plain Vec; the data cannot be torn.
        self.pool.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
