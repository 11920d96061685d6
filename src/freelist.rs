//! Tiered lock-free allocator for [`ReclaimLink`] nodes.
//!
//! Three tiers absorb traffic in order of decreasing likelihood: a handful of
//! atomic cache slots (one CAS, no shared head), a shared lock-free chain,
//! and mutex-guarded page-aligned extension pages that are bump-allocated and
//! returned to the OS once fully free again (keeping a small spare cache).

use std::alloc::{alloc, dealloc, Layout};
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::ObjectHeader;
use crate::sync::lifo::{LifoNode, LifoStack};

/// Cache slots checked before touching any shared head pointer.
const ITEM_CACHE: usize = 8;
/// Fully-free extension pages kept around instead of being released.
const PAGE_CACHE: usize = 2;

/// Intrusive descriptor pairing a deferred object with its place on a
/// reclaim or free chain.
pub struct ReclaimLink {
    next: AtomicPtr<ReclaimLink>,
    pub(crate) object: *mut ObjectHeader,
}

impl LifoNode for ReclaimLink {
    fn next_ptr(&self) -> &AtomicPtr<ReclaimLink> {
        &self.next
    }
}

/// Header of a page-aligned extension block. Links carved from a page are
/// located by masking their address with the page size.
#[repr(C)]
struct Page {
    prev: *mut Page,
    next: *mut Page,
    head: *mut ReclaimLink,
    avails: u32,
    offset: u32,
}

struct PageList {
    head: *mut Page,
    tail: *mut Page,
}

pub struct FreeList {
    cache: [AtomicPtr<ReclaimLink>; ITEM_CACHE],
    free: LifoStack<ReclaimLink>,
    // Serializes pops from `free`; pushes stay lock-free.
    item_lock: Mutex<()>,
    pages: Mutex<PageList>,
    used_pages: AtomicUsize,

    reserved_origin: *mut u8,
    reserved_ending: *mut u8,
    reserved_count: usize,

    item_size: usize,
    page_size: usize,
    page_items: u32,
    first_offset: u32,

    stat_gets: AtomicUsize,
    stat_puts: AtomicUsize,
    stat_finds: AtomicUsize,
    stat_frees: AtomicUsize,
}

unsafe impl Send for FreeList {}
unsafe impl Sync for FreeList {}

const fn align_usize(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl FreeList {
    /// `reserved` is the number of preallocated links in the base block;
    /// `per_page` the minimum number of links carved from each extension
    /// page.
    pub fn new(reserved: usize, per_page: usize) -> Self {
        let item_size = align_usize(size_of::<ReclaimLink>(), 16);
        let first_offset = align_usize(size_of::<Page>(), 16);

        let per_page = per_page.max(32);
        let min_size = align_usize(first_offset + per_page * item_size, 4096);
        let page_size = min_size.next_power_of_two();
        let page_items = ((page_size - first_offset) / item_size) as u32;

        let reserved = reserved.max(32);
        let layout = match Layout::from_size_align(reserved * item_size, 16) {
            Ok(layout) => layout,
            Err(_) => crate::fatal_error("reserved block layout overflow"),
        };
        let origin = unsafe { alloc(layout) };
        if origin.is_null() {
            crate::fatal_error("reserved link block allocation failure");
        }

        let list = Self {
            cache: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
            free: LifoStack::new(),
            item_lock: Mutex::new(()),
            pages: Mutex::new(PageList {
                head: null_mut(),
                tail: null_mut(),
            }),
            used_pages: AtomicUsize::new(0),
            reserved_origin: origin,
            reserved_ending: unsafe { origin.add(reserved * item_size) },
            reserved_count: reserved,
            item_size,
            page_size,
            page_items,
            first_offset: first_offset as u32,
            stat_gets: AtomicUsize::new(0),
            stat_puts: AtomicUsize::new(0),
            stat_finds: AtomicUsize::new(0),
            stat_frees: AtomicUsize::new(0),
        };

        unsafe {
            for i in 0..reserved {
                let link = origin.add(i * item_size) as *mut ReclaimLink;
                link.write(ReclaimLink {
                    next: AtomicPtr::new(null_mut()),
                    object: null_mut(),
                });
                if i < ITEM_CACHE {
                    list.cache[i].store(link, Ordering::Relaxed);
                } else {
                    list.free.push(link);
                }
            }
        }

        list
    }

    /// Allocate a link. Never returns null: when every reclaim tier is
    /// exhausted a new extension page is mapped, and failure to do so is
    /// fatal.
    pub fn get(&self) -> *mut ReclaimLink {
        self.stat_gets.fetch_add(1, Ordering::Relaxed);

        for slot in self.cache.iter() {
            let item = slot.load(Ordering::Relaxed);
            if !item.is_null()
                && slot
                    .compare_exchange(item, null_mut(), Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            {
                return item;
            }
        }

        {
            let _lock = self.item_lock.lock();
            let item = unsafe { self.free.pop() };
            if !item.is_null() {
                return item;
            }
        }

        let mut pages = self.pages.lock();
        unsafe {
            let page = self.page_with_avail(&pages);
            if !page.is_null() {
                return self.carve(page);
            }
            self.grow(&mut pages)
        }
    }

    /// Return a link. The link must have come from this allocator's `get`
    /// and must not already have been returned.
    pub fn put(&self, link: *mut ReclaimLink) {
        self.stat_puts.fetch_add(1, Ordering::Relaxed);

        let addr = link as *mut u8;
        if addr >= self.reserved_origin && addr < self.reserved_ending {
            for slot in self.cache.iter() {
                if slot.load(Ordering::Relaxed).is_null()
                    && slot
                        .compare_exchange(null_mut(), link, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                {
                    return;
                }
            }
            unsafe {
                self.free.push(link);
            }
            return;
        }

        let mut pages = self.pages.lock();
        unsafe {
            let page = self.page_of(link);
            (*link).next.store((*page).head, Ordering::Relaxed);
            (*page).head = link;
            (*page).avails += 1;

            if (*page).avails == self.page_items {
                self.retire_page(&mut pages, page);
            }
        }
    }

    /// Extension pages currently mapped, spares included. Read without any
    /// lock; the backpressure check only needs a rough value.
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    pub fn debug(&self) {
        let pages = self.pages.lock();
        let mut count = 0usize;
        let mut avails = 0usize;
        let mut page = pages.head;
        while !page.is_null() {
            count += 1;
            unsafe {
                avails += (*page).avails as usize;
                page = (*page).next;
            }
        }
        log::debug!(
            target: "gc",
            "freelist: reserved({}) item_size({}) page_size({}) page_items({})",
            self.reserved_count, self.item_size, self.page_size, self.page_items
        );
        log::debug!(
            target: "gc",
            "freelist: gets({}) puts({}) finds({}) frees({}) pages({}/{}) page_avails({})",
            self.stat_gets.load(Ordering::Relaxed),
            self.stat_puts.load(Ordering::Relaxed),
            self.stat_finds.load(Ordering::Relaxed),
            self.stat_frees.load(Ordering::Relaxed),
            count,
            self.used_pages(),
            avails
        );
    }

    /// Debug-build consistency check: `link` must be in use, i.e. absent
    /// from the cache slots, the shared chain, and every page free chain.
    #[cfg(debug_assertions)]
    pub(crate) fn check(&self, link: *mut ReclaimLink) {
        for (i, slot) in self.cache.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == link {
                crate::fatal_error(&format!("link {:p} free in cache[{}]", link, i));
            }
        }
        let _lock = self.item_lock.lock();
        let mut cur = self.free.top();
        while !cur.is_null() {
            if cur == link {
                crate::fatal_error(&format!("link {:p} already on free chain", link));
            }
            cur = unsafe { LifoStack::next(&*cur) };
        }
        let pages = self.pages.lock();
        let mut page = pages.head;
        while !page.is_null() {
            unsafe {
                let mut free = (*page).head;
                while !free.is_null() {
                    if free == link {
                        crate::fatal_error(&format!("link {:p} already on page chain", link));
                    }
                    free = (*free).next.load(Ordering::Relaxed);
                }
                page = (*page).next;
            }
        }
    }

    fn page_of(&self, link: *mut ReclaimLink) -> *mut Page {
        (link as usize & !(self.page_size - 1)) as *mut Page
    }

    /// First page with available links. Caller holds the page lock.
    fn page_with_avail(&self, pages: &PageList) -> *mut Page {
        let mut page = pages.head;
        while !page.is_null() {
            unsafe {
                if (*page).avails > 0 {
                    return page;
                }
                page = (*page).next;
            }
        }
        null_mut()
    }

    /// Take one link from `page` (free chain first, then bump space).
    /// Caller holds the page lock.
    unsafe fn carve(&self, page: *mut Page) -> *mut ReclaimLink {
        let item;
        if !(*page).head.is_null() {
            item = (*page).head;
            (*page).head = (*item).next.load(Ordering::Relaxed);
        } else {
            item = (page as *mut u8).add((*page).offset as usize) as *mut ReclaimLink;
            item.write(ReclaimLink {
                next: AtomicPtr::new(null_mut()),
                object: null_mut(),
            });
            (*page).offset += self.item_size as u32;
        }
        (*page).avails -= 1;
        item
    }

    /// Map a new extension page and take its first link. Caller holds the
    /// page lock.
    unsafe fn grow(&self, pages: &mut PageList) -> *mut ReclaimLink {
        let layout = match Layout::from_size_align(self.page_size, self.page_size) {
            Ok(layout) => layout,
            Err(_) => crate::fatal_error("extension page layout overflow"),
        };
        let raw = alloc(layout);
        if raw.is_null() {
            crate::fatal_error("extension page allocation failure");
        }
        self.stat_finds.fetch_add(1, Ordering::Relaxed);
        self.used_pages.fetch_add(1, Ordering::Relaxed);

        let page = raw as *mut Page;
        page.write(Page {
            prev: null_mut(),
            next: null_mut(),
            head: null_mut(),
            avails: self.page_items,
            offset: self.first_offset,
        });
        self.ins_page(pages, page);

        log::trace!(target: "gc", "freelist: extension page {:p} mapped", page);
        self.carve(page)
    }

    /// `page` just became fully free. Keep up to PAGE_CACHE spares, release
    /// the rest. Caller holds the page lock.
    unsafe fn retire_page(&self, pages: &mut PageList, page: *mut Page) {
        self.rem_page(pages, page);

        let mut spares = 0usize;
        let mut cur = pages.head;
        while !cur.is_null() {
            if (*cur).avails == self.page_items {
                spares += 1;
            }
            cur = (*cur).next;
        }

        if spares < PAGE_CACHE {
            self.ins_tail(pages, page);
            return;
        }

        self.free_page(page);
    }

    unsafe fn free_page(&self, page: *mut Page) {
        log::trace!(target: "gc", "freelist: extension page {:p} released", page);
        self.stat_frees.fetch_add(1, Ordering::Relaxed);
        self.used_pages.fetch_sub(1, Ordering::Relaxed);
        let layout = Layout::from_size_align_unchecked(self.page_size, self.page_size);
        dealloc(page as *mut u8, layout);
    }

    unsafe fn ins_page(&self, pages: &mut PageList, page: *mut Page) {
        (*page).prev = null_mut();
        let head = pages.head;
        if !head.is_null() {
            (*head).prev = page;
            (*page).next = head;
        } else {
            pages.tail = page;
            (*page).next = null_mut();
        }
        pages.head = page;
    }

    unsafe fn ins_tail(&self, pages: &mut PageList, page: *mut Page) {
        (*page).next = null_mut();
        let tail = pages.tail;
        if !tail.is_null() {
            (*tail).next = page;
            (*page).prev = tail;
        } else {
            pages.head = page;
            (*page).prev = null_mut();
        }
        pages.tail = page;
    }

    unsafe fn rem_page(&self, pages: &mut PageList, page: *mut Page) {
        if !(*page).prev.is_null() {
            (*(*page).prev).next = (*page).next;
        } else {
            pages.head = (*page).next;
        }
        if !(*page).next.is_null() {
            (*(*page).next).prev = (*page).prev;
        } else {
            pages.tail = (*page).prev;
        }
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        unsafe {
            let pages = self.pages.lock();
            let mut page = pages.head;
            while !page.is_null() {
                let next = (*page).next;
                let layout = Layout::from_size_align_unchecked(self.page_size, self.page_size);
                dealloc(page as *mut u8, layout);
                page = next;
            }
            drop(pages);

            let layout = Layout::from_size_align_unchecked(
                self.reserved_count * self.item_size,
                16,
            );
            dealloc(self.reserved_origin, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn reserved_links_are_reused() {
        let list = FreeList::new(32, 32);
        let a = list.get();
        let b = list.get();
        assert_ne!(a, b);
        list.put(a);
        list.put(b);

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let link = list.get();
            seen.insert(link as usize);
            list.put(link);
        }
        // no pages needed for a one-at-a-time pattern
        assert_eq!(list.used_pages(), 0);
        assert!(seen.len() <= 32);
    }

    #[test]
    fn overflow_grows_and_retires_pages() {
        let list = FreeList::new(32, 32);
        let total = 2048usize;
        let links: Vec<_> = (0..total).map(|_| list.get()).collect();
        assert!(list.used_pages() > 0);

        let distinct: HashSet<_> = links.iter().map(|&p| p as usize).collect();
        assert_eq!(distinct.len(), total);

        for link in links {
            list.put(link);
        }
        // fully-free pages beyond the spare cache go back to the OS
        assert!(list.used_pages() <= PAGE_CACHE);
    }

    #[test]
    fn page_links_round_trip() {
        let list = FreeList::new(32, 32);
        let held: Vec<_> = (0..64).map(|_| list.get()).collect();
        let pages_before = list.used_pages();
        assert!(pages_before >= 1);

        for &link in &held {
            list.put(link);
        }
        let again = list.get();
        assert!(!again.is_null());
        list.put(again);
    }
}
