//! Pooled buffer allocator — fixed-capacity memory arenas divided into pages.
//!
//! Each page is a coalescing free-list allocator over one contiguous backing
//! buffer. Allocations come back as [`Chunk`]s: exactly-sized, uniquely owned
//! slices identified by `(page, offset, length)`. Releasing a chunk returns
//! its span to the page and merges it with any touching free neighbours, so
//! fragmentation does not grow over long session lifetimes.
//!
//! Pages serialize their own free-list mutations behind a per-page mutex;
//! allocations on different pages proceed in parallel. The backing store is
//! either ordinary heap memory or an anonymous mapping (`memmap2`), chosen by
//! configuration with no behavioral difference beyond the store itself.
//!
//! Unsafe code in this module is confined to handing out raw spans of page
//! memory. The invariant that makes it sound: the free list never yields
//! overlapping spans, and a `Chunk` is the unique owner of its span until it
//! is released.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;
use thiserror::Error;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Backing store for page memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Ordinary heap allocation.
    Heap,
    /// Anonymous memory mapping, outside the allocator's heap.
    Mapped,
}

/// What `allocate` does when no page can satisfy the request.
///
/// The policy is explicit and fixed at pool construction — there is no
/// hidden default behind the two options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Reject the request with [`PoolError::Exhausted`].
    Fail,
    /// Serve the request from a plain unpooled allocation, with a warning.
    Unpooled,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bytes per page.
    pub page_size: usize,
    /// Number of pages. Pool capacity = `page_size * page_count`.
    pub page_count: usize,
    pub backing: Backing,
    pub fallback: FallbackPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            page_count: 64,
            backing: Backing::Heap,
            fallback: FallbackPolicy::Unpooled,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("allocation of {0} bytes cannot be satisfied and fallback is disabled")]
    Exhausted(usize),

    #[error("zero-length allocation requested")]
    ZeroSized,

    #[error("pool configured with zero page size or page count")]
    EmptyPool,

    #[error("released span {offset}+{len} on page {page} overlaps the free list")]
    CorruptRelease { page: u32, offset: u32, len: u32 },

    #[error("failed to map pool memory: {0}")]
    Map(std::io::Error),
}

// ── Page memory ───────────────────────────────────────────────────────────────

enum Store {
    Heap(#[allow(dead_code)] Box<[UnsafeCell<u8>]>),
    Mapped(#[allow(dead_code)] MmapMut),
}

/// One page's backing buffer. The pointer is taken once at construction and
/// all span access goes through it; the owning store is kept only to hold the
/// allocation alive.
struct PageMem {
    ptr: NonNull<u8>,
    len: usize,
    _store: Store,
}

// Spans handed out by the free list never overlap, and the per-page mutex
// serializes free-list mutation. Chunk owners have exclusive access to their
// span, so cross-thread access to page memory is disjoint.
unsafe impl Send for PageMem {}
unsafe impl Sync for PageMem {}

impl PageMem {
    fn new(len: usize, backing: Backing) -> Result<Self, PoolError> {
        match backing {
            Backing::Heap => {
                let store: Box<[UnsafeCell<u8>]> =
                    std::iter::repeat_with(|| UnsafeCell::new(0u8)).take(len).collect();
                let ptr = NonNull::new(store.as_ptr() as *mut u8).expect("boxed slice is non-null");
                Ok(Self { ptr, len, _store: Store::Heap(store) })
            }
            Backing::Mapped => {
                let mut map = MmapMut::map_anon(len).map_err(PoolError::Map)?;
                let ptr = NonNull::new(map.as_mut_ptr()).expect("mapping is non-null");
                Ok(Self { ptr, len, _store: Store::Mapped(map) })
            }
        }
    }

    /// Raw pointer to the start of a span. Caller must hold a span that the
    /// free list has handed out and not yet reclaimed.
    fn span_ptr(&self, offset: u32) -> NonNull<u8> {
        debug_assert!((offset as usize) < self.len);
        // Safety: offset is within the page; the resulting pointer stays
        // inside the backing allocation.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset as usize)) }
    }
}

// ── Free list ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Span {
    offset: u32,
    len: u32,
}

/// Per-page free list, ordered by offset. Invariants: spans never overlap,
/// never touch (touching spans are merged on release), and
/// `free_bytes + allocated bytes == page capacity`.
struct FreeList {
    spans: Vec<Span>,
    free_bytes: usize,
    live_chunks: usize,
}

impl FreeList {
    fn new(page_size: usize) -> Self {
        Self {
            spans: vec![Span { offset: 0, len: page_size as u32 }],
            free_bytes: page_size,
            live_chunks: 0,
        }
    }

    /// First-fit allocation. Splits the matched span, taking `size` bytes
    /// from its front, and returns the offset.
    fn allocate(&mut self, size: u32) -> Option<u32> {
        let idx = self.spans.iter().position(|s| s.len >= size)?;
        let span = &mut self.spans[idx];
        let offset = span.offset;
        if span.len == size {
            self.spans.remove(idx);
        } else {
            span.offset += size;
            span.len -= size;
        }
        self.free_bytes -= size as usize;
        self.live_chunks += 1;
        Some(offset)
    }

    /// Insert a span back, coalescing with neighbours whose boundaries touch.
    /// A span that overlaps existing free space is a double release or a
    /// corrupted handle; it is rejected without mutating the list.
    fn release(&mut self, page: u32, offset: u32, len: u32) -> Result<(), PoolError> {
        let idx = self.spans.partition_point(|s| s.offset < offset);

        let overlaps_prev =
            idx > 0 && self.spans[idx - 1].offset + self.spans[idx - 1].len > offset;
        let overlaps_next = idx < self.spans.len() && offset + len > self.spans[idx].offset;
        if overlaps_prev || overlaps_next {
            return Err(PoolError::CorruptRelease { page, offset, len });
        }

        let merge_prev = idx > 0 && self.spans[idx - 1].offset + self.spans[idx - 1].len == offset;
        let merge_next = idx < self.spans.len() && offset + len == self.spans[idx].offset;

        match (merge_prev, merge_next) {
            (true, true) => {
                let next_len = self.spans[idx].len;
                self.spans[idx - 1].len += len + next_len;
                self.spans.remove(idx);
            }
            (true, false) => self.spans[idx - 1].len += len,
            (false, true) => {
                self.spans[idx].offset = offset;
                self.spans[idx].len += len;
            }
            (false, false) => self.spans.insert(idx, Span { offset, len }),
        }

        self.free_bytes += len as usize;
        self.live_chunks -= 1;
        Ok(())
    }
}

struct Page {
    mem: PageMem,
    free: Mutex<FreeList>,
}

// ── Pool ──────────────────────────────────────────────────────────────────────

struct Shared {
    pages: Vec<Page>,
    page_size: usize,
    fallback: FallbackPolicy,
    /// Round-robin starting point so concurrent allocators spread across pages.
    cursor: AtomicUsize,
}

/// Handle to a pool of pages, shared across sessions and threads.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Shared>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.page_size == 0 || config.page_count == 0 {
            return Err(PoolError::EmptyPool);
        }
        let mut pages = Vec::with_capacity(config.page_count);
        for _ in 0..config.page_count {
            pages.push(Page {
                mem: PageMem::new(config.page_size, config.backing)?,
                free: Mutex::new(FreeList::new(config.page_size)),
            });
        }
        Ok(Self {
            inner: Arc::new(Shared {
                pages,
                page_size: config.page_size,
                fallback: config.fallback,
                cursor: AtomicUsize::new(0),
            }),
        })
    }

    /// Allocate a chunk of exactly `size` bytes.
    ///
    /// Pages are scanned round-robin from an advancing cursor. A request no
    /// page can satisfy is handled per the configured [`FallbackPolicy`].
    pub fn allocate(&self, size: usize) -> Result<Chunk, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroSized);
        }

        if size <= self.inner.page_size {
            let n = self.inner.pages.len();
            let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % n;
            for i in 0..n {
                let page_idx = (start + i) % n;
                let page = &self.inner.pages[page_idx];
                let offset = {
                    let mut free = page.free.lock().expect("page free list poisoned");
                    free.allocate(size as u32)
                };
                if let Some(offset) = offset {
                    return Ok(Chunk {
                        ptr: page.mem.span_ptr(offset),
                        len: size,
                        origin: Origin::Pooled {
                            pool: self.inner.clone(),
                            page: page_idx as u32,
                            offset,
                        },
                    });
                }
            }
        }

        match self.inner.fallback {
            FallbackPolicy::Unpooled => {
                tracing::warn!(size, "pool exhausted, serving unpooled allocation");
                Ok(Chunk::unpooled(size))
            }
            FallbackPolicy::Fail => Err(PoolError::Exhausted(size)),
        }
    }

    /// Explicitly return a chunk to its page.
    ///
    /// Dropping a chunk does the same; this form surfaces a corrupt-release
    /// error instead of logging it.
    pub fn release(&self, chunk: Chunk) -> Result<(), PoolError> {
        chunk.release()
    }

    /// Total pool capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.page_size * self.inner.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// `(free_bytes, live_chunks)` for one page. Used by accounting checks.
    pub fn page_stats(&self, page: usize) -> (usize, usize) {
        let free = self.inner.pages[page].free.lock().expect("page free list poisoned");
        (free.free_bytes, free.live_chunks)
    }

    /// Free bytes summed across all pages.
    pub fn free_bytes(&self) -> usize {
        (0..self.inner.pages.len()).map(|p| self.page_stats(p).0).sum()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("page_size", &self.inner.page_size)
            .field("page_count", &self.inner.pages.len())
            .finish()
    }
}

impl Shared {
    fn release_span(&self, page: u32, offset: u32, len: u32) -> Result<(), PoolError> {
        let mut free = self.pages[page as usize].free.lock().expect("page free list poisoned");
        free.release(page, offset, len)
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

enum Origin {
    Pooled { pool: Arc<Shared>, page: u32, offset: u32 },
    Unpooled { _buf: Box<[u8]> },
}

/// An owned, exactly-sized slice of pool memory.
///
/// Dereferences to `[u8]`. Returned to its page when released or dropped;
/// ownership makes a second release of the same chunk unrepresentable, and
/// the page-side overlap check makes a forged one fail fast.
pub struct Chunk {
    ptr: NonNull<u8>,
    len: usize,
    origin: Origin,
}

// A Chunk is the unique owner of a non-overlapping span; see module docs.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn unpooled(size: usize) -> Self {
        let mut buf = vec![0u8; size].into_boxed_slice();
        let ptr = NonNull::new(buf.as_mut_ptr()).expect("boxed slice is non-null");
        Self { ptr, len: size, origin: Origin::Unpooled { _buf: buf } }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this chunk came from a page (as opposed to the unpooled fallback).
    pub fn is_pooled(&self) -> bool {
        matches!(self.origin, Origin::Pooled { .. })
    }

    /// Consume the chunk and return its span to the pool.
    pub fn release(self) -> Result<(), PoolError> {
        match &self.origin {
            Origin::Pooled { pool, page, offset } => {
                let (pool, page, offset, len) = (pool.clone(), *page, *offset, self.len as u32);
                std::mem::forget(self);
                pool.release_span(page, offset, len)
            }
            Origin::Unpooled { .. } => Ok(()),
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Origin::Pooled { pool, page, offset } = &self.origin {
            if let Err(e) = pool.release_span(*page, *offset, self.len as u32) {
                tracing::error!(error = %e, "chunk release failed on drop");
            }
        }
    }
}

impl std::ops::Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: unique ownership of the span, see module docs.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: &mut self guarantees exclusive access to the span.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (page, offset) = match &self.origin {
            Origin::Pooled { page, offset, .. } => (Some(*page), Some(*offset)),
            Origin::Unpooled { .. } => (None, None),
        };
        f.debug_struct("Chunk")
            .field("len", &self.len)
            .field("page", &page)
            .field("offset", &offset)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
