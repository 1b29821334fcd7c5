//! Transferable byte buffers.
//!
//! A [`TransferBuffer`] is a shared handle to a block of bytes. Sending it
//! through a transport *moves* the bytes: the receiver gets a fresh handle
//! holding them, and every handle on the sending side reads as zero-length
//! from then on.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared handle to a byte block whose ownership moves on transfer.
#[derive(Clone, Default)]
pub struct TransferBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl TransferBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes.into())),
        }
    }

    /// Build a buffer from `u32` values in little-endian order.
    pub fn from_u32s(values: &[u32]) -> Self {
        Self::new(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Move the contents into a new, unshared handle.
    ///
    /// This handle and all of its clones are left zero-length.
    pub fn transfer(&self) -> TransferBuffer {
        let bytes = std::mem::take(&mut *self.bytes.lock());
        Self::new(bytes)
    }

    /// Copy the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Read the contents as little-endian `u32` values. Trailing bytes are ignored.
    pub fn to_u32s(&self) -> Vec<u32> {
        self.bytes
            .lock()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Run `f` against the bytes without copying them.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.lock())
    }

    /// Whether two handles point at the same underlying block.
    pub fn same_block(&self, other: &TransferBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.len())
            .finish()
    }
}
