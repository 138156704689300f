//! Size-classed thread-local free-list allocator.
//!
//! Small, same-sized allocations (TLS handshake buffers, completion-handler
//! slots, ephemeral request objects) are common on a reactor thread and
//! churn constantly; routing them through the global allocator on every
//! call causes needless contention and fragmentation. `MemoryCache` instead
//! keeps one free-list per rounded-up size class, backed by fixed-capacity
//! pages it requests from the OS allocator directly.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;

use indexmap::IndexMap;

use crate::error::Error;

const DEFAULT_EMPTY_PAGE_RETENTION: usize = 1;
const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<usize>();

/// Tuning knobs for a [`MemoryCache`]. Only meaningful before the cache's
/// first `allocate`/`reserve` call — see [`MemoryCache::configure`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryCacheConfig {
    /// Bytes per page. `0` means "use the OS page size".
    pub page_capacity: usize,
    /// Byte alignment for every size class. `0` means native pointer
    /// alignment.
    pub alignment: usize,
    /// How many fully-empty pages per size class to keep around before
    /// returning them to the OS.
    pub empty_page_retention: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        MemoryCacheConfig {
            page_capacity: 0,
            alignment: 0,
            empty_page_retention: DEFAULT_EMPTY_PAGE_RETENTION,
        }
    }
}

fn os_page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn round_up(size: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (size + mask) & !mask
}

struct Page {
    base: NonNull<u8>,
    layout: Layout,
    use_count: usize,
}

struct SizeClass {
    node_size: usize,
    free_list: Vec<NonNull<u8>>,
    pages: Vec<Page>,
}

impl SizeClass {
    fn new(node_size: usize) -> Self {
        SizeClass {
            node_size,
            free_list: Vec::new(),
            pages: Vec::new(),
        }
    }

    fn page_containing(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        self.pages.iter().position(|page| {
            let start = page.base.as_ptr() as usize;
            addr >= start && addr < start + page.layout.size()
        })
    }

    fn grow(&mut self, page_capacity: usize, alignment: usize) -> Result<(), Error> {
        let layout =
            Layout::from_size_align(page_capacity, alignment).map_err(|_| Error::AllocationError)?;
        let base = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(base).ok_or(Error::AllocationError)?;

        let node_count = page_capacity / self.node_size;
        for i in 0..node_count {
            let node = unsafe { base.as_ptr().add(i * self.node_size) };
            self.free_list.push(unsafe { NonNull::new_unchecked(node) });
        }

        self.pages.push(Page {
            base,
            layout,
            use_count: 0,
        });

        Ok(())
    }

    fn release_empty_pages(&mut self, keep_pages: usize) {
        loop {
            let empty_pages = self.pages.iter().filter(|p| p.use_count == 0).count();
            if empty_pages <= keep_pages {
                break;
            }

            let Some(idx) = self.pages.iter().position(|p| p.use_count == 0) else {
                break;
            };

            let page = self.pages.remove(idx);
            let start = page.base.as_ptr() as usize;
            let end = start + page.layout.size();
            self.free_list
                .retain(|n| !(n.as_ptr() as usize >= start && (n.as_ptr() as usize) < end));

            unsafe { alloc::dealloc(page.base.as_ptr(), page.layout) };
        }
    }
}

struct Inner {
    page_capacity: usize,
    alignment: usize,
    keep_pages: usize,
    // IndexMap rather than HashMap: size classes are few and iterated in
    // insertion order when the `stats` feature walks them for a report, so
    // reports come out in the order classes were first touched instead of
    // hash-scrambled.
    classes: IndexMap<usize, SizeClass>,
    large: IndexMap<usize, Layout>,
    in_use: bool,
    #[cfg(feature = "stats")]
    hits: usize,
    #[cfg(feature = "stats")]
    misses: usize,
}

/// A thread-local size-classed free-list allocator.
///
/// Not `Sync`/`Send` by design — every reactor thread owns its own cache,
/// matching the spec's "memory caches are strictly thread-local" rule.
pub struct MemoryCache {
    inner: RefCell<Inner>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> MemoryCache {
        MemoryCache {
            inner: RefCell::new(Inner {
                page_capacity: if config.page_capacity == 0 {
                    os_page_size()
                } else {
                    config.page_capacity
                },
                alignment: if config.alignment == 0 {
                    DEFAULT_ALIGNMENT
                } else {
                    config.alignment
                },
                keep_pages: config.empty_page_retention,
                classes: IndexMap::new(),
                large: IndexMap::new(),
                in_use: false,
                #[cfg(feature = "stats")]
                hits: 0,
                #[cfg(feature = "stats")]
                misses: 0,
            }),
        }
    }

    /// Resets the hit/miss counters. Only present with the `stats` feature.
    #[cfg(feature = "stats")]
    pub fn reset_stats_counter(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Allocations served from an existing free-list entry since the last
    /// reset. Only present with the `stats` feature.
    #[cfg(feature = "stats")]
    pub fn hit_count(&self) -> usize {
        self.inner.borrow().hits
    }

    /// Allocations that required growing a size class with a fresh page
    /// since the last reset. Only present with the `stats` feature.
    #[cfg(feature = "stats")]
    pub fn miss_count(&self) -> usize {
        self.inner.borrow().misses
    }

    /// Reconfigures page capacity and retention. Only valid before the
    /// first `allocate`/`reserve` call.
    pub fn configure(&self, page_capacity: usize, empty_page_retention: usize) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.in_use {
            return Err(Error::CacheAlreadyInUse);
        }
        inner.page_capacity = if page_capacity == 0 {
            os_page_size()
        } else {
            page_capacity
        };
        inner.keep_pages = empty_page_retention;
        Ok(())
    }

    /// Pre-populates the free-list for `size`. If `lazy`, only the target
    /// node count is recorded without touching the allocator.
    pub fn reserve(&self, size: usize, count: usize, lazy: bool) -> Result<(), Error> {
        if lazy {
            return Ok(());
        }

        let mut inner = self.inner.borrow_mut();
        inner.in_use = true;
        let node_size = round_up(size, inner.alignment);
        let page_capacity = inner.page_capacity;
        let alignment = inner.alignment;

        let class = inner
            .classes
            .entry(node_size)
            .or_insert_with(|| SizeClass::new(node_size));

        while class.free_list.len() < count {
            class.grow(page_capacity, alignment)?;
        }

        Ok(())
    }

    /// Allocates a node able to hold `size` bytes.
    ///
    /// Sizes larger than the page capacity bypass the cache and go
    /// straight to the system allocator.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let mut inner = self.inner.borrow_mut();
        inner.in_use = true;
        let alignment = inner.alignment;
        let node_size = round_up(size, alignment);
        let page_capacity = inner.page_capacity;

        if node_size > page_capacity {
            let layout = Layout::from_size_align(size, alignment).map_err(|_| Error::AllocationError)?;
            let ptr = unsafe { alloc::alloc(layout) };
            let ptr = NonNull::new(ptr).ok_or(Error::AllocationError)?;
            inner.large.insert(ptr.as_ptr() as usize, layout);
            return Ok(ptr);
        }

        let class = inner
            .classes
            .entry(node_size)
            .or_insert_with(|| SizeClass::new(node_size));

        #[cfg(feature = "stats")]
        let was_empty = class.free_list.is_empty();

        if class.free_list.is_empty() {
            class.grow(page_capacity, alignment)?;
        }

        #[cfg(feature = "stats")]
        {
            if was_empty {
                inner.misses += 1;
            } else {
                inner.hits += 1;
            }
        }

        let ptr = class.free_list.pop().expect("grow() populates the free-list");
        let page_idx = class.page_containing(ptr).expect("node must belong to a known page");
        class.pages[page_idx].use_count += 1;

        Ok(ptr)
    }

    /// Returns a node previously handed out by [`MemoryCache::allocate`].
    /// `size` must match the size passed to `allocate`.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let mut inner = self.inner.borrow_mut();

        if let Some(layout) = inner.large.swap_remove(&(ptr.as_ptr() as usize)) {
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            return;
        }

        let alignment = inner.alignment;
        let node_size = round_up(size, alignment);
        let keep_pages = inner.keep_pages;

        let Some(class) = inner.classes.get_mut(&node_size) else {
            debug_assert!(false, "deallocate() called with an unknown size class");
            return;
        };

        if let Some(page_idx) = class.page_containing(ptr) {
            class.pages[page_idx].use_count -= 1;
        }

        class.free_list.push(ptr);
        class.release_empty_pages(keep_pages);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_and_deallocate_round_trip() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());

        let ptr = cache.allocate(48).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 48);
        }
        cache.deallocate(ptr, 48);
    }

    #[test]
    fn reuses_freed_nodes_instead_of_growing_unboundedly() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            page_capacity: 4096,
            ..MemoryCacheConfig::default()
        });

        let mut live = Vec::new();
        for _ in 0..1000 {
            live.push(cache.allocate(48).unwrap());
        }
        for ptr in live.drain(..) {
            cache.deallocate(ptr, 48);
        }
        for _ in 0..1000 {
            live.push(cache.allocate(48).unwrap());
        }
        for ptr in live.drain(..) {
            cache.deallocate(ptr, 48);
        }
    }

    #[test]
    #[cfg(feature = "stats")]
    fn stats_track_hits_and_misses_per_size_class() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            page_capacity: 4096,
            ..MemoryCacheConfig::default()
        });

        let first = cache.allocate(48).unwrap();
        assert_eq!(cache.miss_count(), 1);
        assert_eq!(cache.hit_count(), 0);

        cache.deallocate(first, 48);
        let second = cache.allocate(48).unwrap();
        assert_eq!(cache.hit_count(), 1);

        cache.deallocate(second, 48);
        cache.reset_stats_counter();
        assert_eq!(cache.hit_count(), 0);
        assert_eq!(cache.miss_count(), 0);
    }

    #[test]
    fn configure_after_first_use_is_rejected() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());
        let ptr = cache.allocate(16).unwrap();
        assert!(matches!(cache.configure(8192, 2), Err(Error::CacheAlreadyInUse)));
        cache.deallocate(ptr, 16);
    }

    #[test]
    fn oversized_allocations_bypass_the_cache() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            page_capacity: 256,
            ..MemoryCacheConfig::default()
        });

        let ptr = cache.allocate(4096).unwrap();
        cache.deallocate(ptr, 4096);
    }
}
