//! The producer-side string database.
//!
//! Strings are identified by a 64-bit id: the address of the literal for
//! static strings, a polynomial hash for dynamic ones. Each newly seen id
//! appends an `[id][nul-terminated text, padded to 8 bytes]` entry to an
//! append-only byte image. Only the bytes appended since the last flush are
//! shipped to the consumer; the `sent` cursor tracks the boundary.

use hopscotch_ipc::wire::align8;
use rustc_hash::FxHashSet;

use crate::block_alloc::ChunkedBytes;

/// Java-style 31-prime string hash. Collisions between two distinct
/// dynamic strings silently alias them; accepted as a rarity.
pub fn str_hash(text: &str) -> u64 {
    let mut hash: u64 = 0;
    for byte in text.bytes() {
        hash = (byte as u64).wrapping_add(hash.wrapping_mul(31));
    }
    hash
}

pub struct StringTable {
    ids: FxHashSet<u64>,
    data: ChunkedBytes,
    sent: usize,
}

impl StringTable {
    pub fn new() -> StringTable {
        StringTable {
            ids: FxHashSet::default(),
            data: ChunkedBytes::new(),
            sent: 0,
        }
    }

    /// Interns a static string; its id is the address of the literal.
    pub fn intern_static(&mut self, text: &'static str) -> u64 {
        let id = text.as_ptr() as u64;
        if id == 0 {
            return 0;
        }
        self.insert(id, text);
        id
    }

    /// Interns a dynamic string; its id is a hash of the text. Returns the
    /// reserved id 0 for text that hashes to 0 (notably the empty string),
    /// in which case nothing is stored.
    pub fn intern_dynamic(&mut self, text: &str) -> u64 {
        // Downstream entries are nul-terminated; anything past an interior
        // nul could never be read back.
        let text = match text.find('\0') {
            Some(pos) => &text[..pos],
            None => text,
        };
        let id = str_hash(text);
        if id == 0 {
            return 0;
        }
        self.insert(id, text);
        id
    }

    fn insert(&mut self, id: u64, text: &str) {
        if !self.ids.insert(id) {
            return;
        }
        debug_assert_eq!(self.data.len() % 8, 0);
        self.data.push_bytes(&id.to_le_bytes());
        self.data.push_bytes(text.as_bytes());
        let padded = align8(text.len() as u64 + 1) as usize;
        const ZEROS: [u8; 8] = [0; 8];
        self.data.push_bytes(&ZEROS[..padded - text.len()]);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    /// Number of image bytes not yet shipped to the consumer.
    pub fn unsent_len(&self) -> usize {
        self.data.len() - self.sent
    }

    /// Copies the unshipped byte range into `out`, which must have room
    /// for exactly [`Self::unsent_len`] bytes.
    pub fn copy_unsent_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.unsent_len());
        self.data.copy_range_into(self.sent, out);
    }

    /// Advances the delta cursor past everything currently in the image.
    pub fn mark_sent(&mut self) {
        self.sent = self.data.len();
    }

    /// Drops every entry and rewinds the delta cursor. Used when the
    /// consumer requests a reset.
    pub fn clear(&mut self) {
        self.ids.clear();
        self.data.clear();
        self.sent = 0;
    }
}
