// Kernel Heap Allocator
// Provides kmalloc/kfree over a fixed ladder of slab size classes

use spin::Once;

use super::slab::{self, SlabCache};
use crate::mm_warn;

/// The size-class ladder. Requests above the largest class fail; callers
/// for which that is unacceptable must panic, there is no fallback path.
const CLASS_SIZES: [usize; 9] = [32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

struct Ladder {
    classes: [SlabCache; CLASS_SIZES.len()],
}

/// Global heap ladder instance
static LADDER: Once<Ladder> = Once::new();

/// Initialize the heap ladder. Called once from `mm::init`, after the PFN
/// database exists.
pub fn init() {
    let ladder = LADDER.call_once(|| Ladder {
        classes: [
            SlabCache::new("kmalloc-32", 32),
            SlabCache::new("kmalloc-64", 64),
            SlabCache::new("kmalloc-128", 128),
            SlabCache::new("kmalloc-256", 256),
            SlabCache::new("kmalloc-512", 512),
            SlabCache::new("kmalloc-1024", 1024),
            SlabCache::new("kmalloc-2048", 2048),
            SlabCache::new("kmalloc-4096", 4096),
            SlabCache::new("kmalloc-8192", 8192),
        ],
    });
    for cache in &ladder.classes {
        slab::register(cache);
    }
}

fn ladder() -> &'static Ladder {
    LADDER.get().expect("[MM] kmalloc used before init")
}

/// Allocate kernel heap memory
///
/// Picks the smallest class that fits. Returns null when the request
/// exceeds the largest class or the frame allocator is exhausted.
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }

    let ladder = ladder();
    for (i, class) in CLASS_SIZES.iter().enumerate() {
        if size <= *class {
            return match ladder.classes[i].alloc() {
                Some(ptr) => ptr,
                None => core::ptr::null_mut(),
            };
        }
    }

    mm_warn!("kmalloc({}) exceeds largest class", size);
    core::ptr::null_mut()
}

/// Free kernel heap memory
///
/// The owning size class is recovered from the slab bucket header, so no
/// size is needed.
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    slab::cache_of(ptr).free(ptr);
}

/// Bytes currently outstanding across all registered caches
pub fn allocated_bytes() -> usize {
    let mut total = 0usize;
    slab::for_each_registered(|cache| {
        let s = cache.stats();
        total += (s.allocs - s.frees) as usize * s.block_size;
    });
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn class_selection_and_reuse() {
        testutil::boot();
        let a = kmalloc(24);
        let b = kmalloc(100);
        let c = kmalloc(5000);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        kfree(a);
        kfree(b);
        kfree(c);
    }

    #[test]
    fn oversize_returns_null() {
        testutil::boot();
        assert!(kmalloc(CLASS_SIZES[CLASS_SIZES.len() - 1] + 1).is_null());
        assert!(kmalloc(0).is_null());
    }

    #[test]
    fn accounting_is_sane() {
        testutil::boot();
        // Other tests allocate concurrently, so only sanity is checkable
        // against the global counter: it moves in block_size units and
        // never underflows.
        let p = kmalloc(512);
        assert!(!p.is_null());
        let mid = allocated_bytes();
        assert!(mid >= 512);
        kfree(p);
    }
}
