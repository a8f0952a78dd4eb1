//! Process-wide pool of fixed-size memory blocks, plus the chunked growing
//! containers built on top of it.
//!
//! The recorder's per-thread arrays and the string table grow by taking
//! 4 KiB blocks from this pool, so after a thread's arrays have warmed up,
//! `enter`/`leave` never touch the system allocator. The pool itself is
//! guarded by a plain mutex; it is only reached when a container needs a
//! new chunk.

use std::alloc::{alloc, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub const BLOCK_BYTES: usize = 4096;
const BLOCK_ALIGN: usize = 64;
const INITIAL_BLOCKS: usize = 128;

struct Pool {
    free: Vec<NonNull<u8>>,
    /// Slab base pointers; slabs live for the rest of the process.
    slabs: Vec<NonNull<u8>>,
    total_blocks: usize,
}

unsafe impl Send for Pool {}

static POOL: Lazy<Mutex<Pool>> = Lazy::new(|| {
    Mutex::new(Pool {
        free: Vec::with_capacity(1024),
        slabs: Vec::with_capacity(32),
        total_blocks: 0,
    })
});

fn grow(pool: &mut Pool, block_count: usize) {
    let layout = Layout::from_size_align(block_count * BLOCK_BYTES, BLOCK_ALIGN)
        .expect("block slab layout");
    let base = NonNull::new(unsafe { alloc(layout) }).expect("block pool slab allocation failed");
    pool.slabs.push(base);
    pool.free.reserve(block_count);
    for i in 0..block_count {
        pool.free
            .push(unsafe { NonNull::new_unchecked(base.as_ptr().add(i * BLOCK_BYTES)) });
    }
    pool.total_blocks += block_count;
}

/// Takes one block out of the pool, growing it if necessary. Each growth
/// doubles the total number of blocks.
pub fn acquire() -> NonNull<u8> {
    let mut pool = POOL.lock();
    if pool.free.is_empty() {
        let count = pool.total_blocks.max(INITIAL_BLOCKS);
        grow(&mut pool, count);
    }
    pool.free.pop().expect("pool grew but has no free block")
}

/// Returns blocks to the pool.
pub fn release<I>(blocks: I)
where
    I: IntoIterator<Item = NonNull<u8>>,
{
    let mut pool = POOL.lock();
    pool.free.extend(blocks);
}


/// A growing array of `T` backed by pool blocks. Elements are stored in
/// fixed-size chunks, so pushes never move existing elements and growth
/// never calls the system allocator once the pool is warm.
pub struct ChunkedVec<T> {
    chunks: Vec<NonNull<u8>>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> ChunkedVec<T> {
    const PER_CHUNK: usize = BLOCK_BYTES / mem::size_of::<T>();

    pub fn new() -> ChunkedVec<T> {
        assert!(mem::size_of::<T>() > 0 && mem::size_of::<T>() <= BLOCK_BYTES);
        assert!(mem::align_of::<T>() <= BLOCK_ALIGN);
        ChunkedVec {
            chunks: Vec::new(),
            len: 0,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        let chunk = self.len / Self::PER_CHUNK;
        if chunk == self.chunks.len() {
            self.chunks.push(acquire());
        }
        let slot = self.len % Self::PER_CHUNK;
        unsafe {
            (self.chunks[chunk].as_ptr() as *mut T).add(slot).write(value);
        }
        self.len += 1;
    }

    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len);
        let chunk = index / Self::PER_CHUNK;
        let slot = index % Self::PER_CHUNK;
        unsafe { (self.chunks[chunk].as_ptr() as *const T).add(slot).read() }
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// Forgets the elements but keeps the chunks.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<T> Drop for ChunkedVec<T> {
    fn drop(&mut self) {
        release(self.chunks.drain(..));
    }
}

/// A growing byte buffer backed by pool blocks, used for the string table's
/// append-only byte image.
pub struct ChunkedBytes {
    chunks: Vec<NonNull<u8>>,
    len: usize,
}

impl ChunkedBytes {
    pub fn new() -> ChunkedBytes {
        ChunkedBytes {
            chunks: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push_bytes(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let chunk = self.len / BLOCK_BYTES;
            if chunk == self.chunks.len() {
                self.chunks.push(acquire());
            }
            let slot = self.len % BLOCK_BYTES;
            let take = src.len().min(BLOCK_BYTES - slot);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    self.chunks[chunk].as_ptr().add(slot),
                    take,
                );
            }
            src = &src[take..];
            self.len += take;
        }
    }

    /// Copies `out.len()` bytes starting at `start` into `out`.
    pub fn copy_range_into(&self, start: usize, out: &mut [u8]) {
        assert!(start + out.len() <= self.len);
        let mut pos = start;
        let mut written = 0;
        while written < out.len() {
            let chunk = pos / BLOCK_BYTES;
            let slot = pos % BLOCK_BYTES;
            let take = (out.len() - written).min(BLOCK_BYTES - slot);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.chunks[chunk].as_ptr().add(slot),
                    out[written..].as_mut_ptr(),
                    take,
                );
            }
            pos += take;
            written += take;
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for ChunkedBytes {
    fn drop(&mut self) {
        release(self.chunks.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_distinct_and_writable() {
        let blocks: Vec<_> = (0..16).map(|_| acquire()).collect();
        for (i, block) in blocks.iter().enumerate() {
            for other in &blocks[i + 1..] {
                assert_ne!(block.as_ptr(), other.as_ptr());
            }
            unsafe {
                std::ptr::write_bytes(block.as_ptr(), i as u8, BLOCK_BYTES);
            }
        }
        for (i, block) in blocks.iter().enumerate() {
            let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), BLOCK_BYTES) };
            assert!(bytes.iter().all(|&b| b == i as u8));
        }
        release(blocks);
    }

    #[test]
    fn chunked_vec_grows_across_blocks() {
        let mut v: ChunkedVec<u64> = ChunkedVec::new();
        // More than 4096 / 8 elements forces several chunks.
        for i in 0..2000u64 {
            v.push(i * 3);
        }
        assert_eq!(v.len(), 2000);
        for (i, value) in v.iter().enumerate() {
            assert_eq!(value, i as u64 * 3);
        }
        assert_eq!(v.get(1999), 1999 * 3);
    }

    #[test]
    fn chunked_vec_clear_keeps_chunks() {
        let mut v: ChunkedVec<u32> = ChunkedVec::new();
        for i in 0..5000u32 {
            v.push(i);
        }
        let chunks_before = v.chunks.len();
        v.clear();
        assert!(v.is_empty());
        // Clearing keeps the capacity; refilling allocates no new chunks.
        for i in 0..5000u32 {
            v.push(i + 1);
        }
        assert_eq!(v.chunks.len(), chunks_before);
        assert_eq!(v.get(0), 1);
    }

    #[test]
    fn chunked_bytes_round_trips_across_chunk_boundaries() {
        let mut bytes = ChunkedBytes::new();
        let pattern: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        // Push in odd-sized pieces so entries straddle block boundaries.
        for piece in pattern.chunks(37) {
            bytes.push_bytes(piece);
        }
        assert_eq!(bytes.len(), pattern.len());

        let mut out = vec![0u8; 5000];
        bytes.copy_range_into(3000, &mut out);
        assert_eq!(&out[..], &pattern[3000..8000]);
    }
}
