//! Physical memory manager
//!
//! All RAM is carved into regions of at most 64 MiB. A region's first
//! frame holds its [`RegionHeader`]: four bitmaps tracking blocks of 4,
//! 16, 32 and 64 KiB plus a free counter per level. A level-k bit is set
//! iff any 4 KiB page below it is allocated, so a zero bit at a high
//! level certifies a large contiguous free block.
//!
//! Regions sit on four worst-fit free lists indexed by the largest block
//! class they can still provide. Allocation always serves from the head
//! of the highest non-empty list: scanning a coarse bitmap 64 bits at a
//! time finds big free runs quickly, and the region is relinked when its
//! class changes.
//!
//! Every frame returned by [`PhysicalMemoryManager::free`] is zeroed
//! before the counters are updated; callers rely on fresh frames reading
//! as zero (page-table frames in particular).

use crate::mm::vmap::{PhysAddr, VirtAddr};
use crate::mm::FRAME_SIZE;
use crate::sync::IrqSpinlock;

/// Largest region: 64 MiB, i.e. 16384 frames (one of them the header).
pub const MAX_REGION_PAGES: usize = 16384;

/// Ranges smaller than this are not worth a header frame and are dropped.
pub const MIN_REGION_PAGES: usize = 10;

/// Upper bound on tracked regions (512 x 64 MiB = 32 GiB of RAM).
pub const MAX_REGIONS: usize = 512;

/// Block granularity in pages for each bitmap level.
const GRANULARITY: [usize; 4] = [1, 4, 8, 16];

/// Bitmap length in 64-bit words for each level, sized for
/// [`MAX_REGION_PAGES`].
const WORDS: [usize; 4] = [256, 64, 32, 16];

/// Per-region allocation bitmaps and free counters.
///
/// Lives in the first frame of the region on bare metal (reached through
/// the translated window); unit tests box it instead. The layout is fixed
/// so the whole structure fills exactly one frame.
#[repr(C, align(4096))]
pub struct RegionHeader {
    /// Free block count per level.
    available: [u32; 4],
    _padding: [u8; 1136],
    bitmap3: [u64; WORDS[3]],
    bitmap2: [u64; WORDS[2]],
    bitmap1: [u64; WORDS[1]],
    bitmap0: [u64; WORDS[0]],
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == 4096);

/// Real block count of level `level` for a region of `pages` pages.
#[inline]
const fn blocks_at(pages: usize, level: usize) -> usize {
    pages.div_ceil(GRANULARITY[level])
}

/// Phantom bits at the tail of the last used word of level `level`.
#[inline]
const fn overrun_at(pages: usize, level: usize) -> usize {
    let blocks = blocks_at(pages, level);
    blocks.div_ceil(64) * 64 - blocks
}

impl RegionHeader {
    /// Reset to the all-free state for a region of `pages` usable pages.
    pub fn init(&mut self, pages: usize) {
        assert!(pages > 0 && pages <= MAX_REGION_PAGES);
        self.bitmap0 = [0; WORDS[0]];
        self.bitmap1 = [0; WORDS[1]];
        self.bitmap2 = [0; WORDS[2]];
        self.bitmap3 = [0; WORDS[3]];
        for level in 0..4 {
            self.available[level] = blocks_at(pages, level) as u32;
        }
    }

    fn bitmap(&self, level: usize) -> &[u64] {
        match level {
            0 => &self.bitmap0,
            1 => &self.bitmap1,
            2 => &self.bitmap2,
            3 => &self.bitmap3,
            _ => unreachable!(),
        }
    }

    fn bitmap_mut(&mut self, level: usize) -> &mut [u64] {
        match level {
            0 => &mut self.bitmap0,
            1 => &mut self.bitmap1,
            2 => &mut self.bitmap2,
            3 => &mut self.bitmap3,
            _ => unreachable!(),
        }
    }

    /// Free block count at `level`.
    pub fn available(&self, level: usize) -> u32 {
        self.available[level]
    }

    /// Highest level that can still serve a block, `None` when full.
    pub fn largest_free_level(&self) -> Option<usize> {
        (0..4).rev().find(|&level| self.available[level] > 0)
    }

    pub fn is_allocated(&self, page: usize) -> bool {
        self.bitmap0[page / 64] & (1 << (page % 64)) != 0
    }

    /// Mark one page allocated, maintaining all four levels.
    fn alloc_page(&mut self, page: usize) {
        debug_assert!(!self.is_allocated(page), "page {page} already allocated");

        self.bitmap0[page / 64] |= 1 << (page % 64);
        self.available[0] -= 1;

        for level in 1..4 {
            let block = page / GRANULARITY[level];
            let word = &mut self.bitmap_mut(level)[block / 64];
            let mask = 1u64 << (block % 64);
            if *word & mask == 0 {
                *word |= mask;
                self.available[level] -= 1;
            }
        }
    }

    /// Mark one page free; a covering block becomes free again once its
    /// last allocated page goes.
    fn free_page(&mut self, page: usize) {
        assert!(self.is_allocated(page), "double free of page {page}");

        self.bitmap0[page / 64] &= !(1 << (page % 64));
        self.available[0] += 1;

        for level in 1..4 {
            let gran = GRANULARITY[level];
            let block = page / gran;
            // All level-0 bits below this block must be clear.
            let first = block * gran;
            let mask = ((1u128 << gran) - 1) as u64;
            let children = (self.bitmap0[first / 64] >> (first % 64)) & mask;
            if children != 0 {
                break;
            }
            let word = &mut self.bitmap_mut(level)[block / 64];
            let bit = 1u64 << (block % 64);
            if *word & bit != 0 {
                *word &= !bit;
                self.available[level] += 1;
            }
        }
    }

    /// Recompute the counters from the bitmaps and assert consistency:
    /// `available[k] == zero bits - overrun`, and each level-k bit covers
    /// its children correctly. `pages` is the region's usable page count.
    ///
    /// Callers must hold the PMM lock; the check reads all four bitmaps
    /// and is only meaningful against a quiescent header.
    pub fn check(&self, pages: usize) {
        for level in 0..4 {
            let blocks = blocks_at(pages, level);
            let words = blocks.div_ceil(64);
            let zeros: usize = self.bitmap(level)[..words]
                .iter()
                .map(|w| w.count_zeros() as usize)
                .sum();
            let counted = zeros - overrun_at(pages, level);
            assert!(
                counted == self.available[level] as usize,
                "level {} counter {} != recomputed {}",
                level,
                self.available[level],
                counted,
            );
        }

        // Covering invariant: a level-k bit is set iff any child is set.
        for level in 1..4 {
            let gran = GRANULARITY[level];
            for block in 0..blocks_at(pages, level) {
                let set = self.bitmap(level)[block / 64] & (1 << (block % 64)) != 0;
                let first = block * gran;
                let mask = ((1u128 << gran) - 1) as u64;
                let children = (self.bitmap0[first / 64] >> (first % 64)) & mask;
                assert!(
                    set == (children != 0),
                    "level {level} block {block} covering mismatch",
                );
            }
        }
    }
}

/// One tracked physical region.
struct MemoryRegion {
    /// Physical base; the first frame is the header.
    base: PhysAddr,
    /// Usable pages, header excluded.
    pages: usize,
    header: &'static mut RegionHeader,
    /// Free list this region currently sits on, `None` when full.
    list: Option<usize>,
    /// Next region index on the same list.
    next: Option<usize>,
}

impl MemoryRegion {
    /// Physical address of usable page number `page`.
    fn page_addr(&self, page: usize) -> PhysAddr {
        self.base.offset(((page + 1) * FRAME_SIZE) as u64)
    }

    /// Usable page number of `paddr`, if it belongs to this region.
    fn page_of(&self, paddr: PhysAddr) -> Option<usize> {
        let off = paddr.as_u64().checked_sub(self.base.as_u64())?;
        let frame = (off as usize) / FRAME_SIZE;
        if frame == 0 || frame > self.pages {
            return None;
        }
        Some(frame - 1)
    }
}

/// The physical frame allocator.
pub struct PhysicalMemoryManager {
    regions: [Option<MemoryRegion>; MAX_REGIONS],
    /// Number of populated slots; regions are inserted sorted by base.
    n_regions: usize,
    /// Head region index of each worst-fit list.
    lists: [Option<usize>; 4],
    total_pages: usize,
    available_pages: usize,
}

impl PhysicalMemoryManager {
    pub const fn new() -> Self {
        Self {
            regions: [const { None }; MAX_REGIONS],
            n_regions: 0,
            lists: [None; 4],
            total_pages: 0,
            available_pages: 0,
        }
    }

    /// Register a physical range `[base, base + pages * 4K)` whose first
    /// frame is `header`. Ranges must be added in ascending base order
    /// (the memory map is sorted); `pages` counts all frames including
    /// the header one.
    pub fn add_region(&mut self, base: PhysAddr, pages: usize, header: &'static mut RegionHeader) {
        assert!(base.is_frame_aligned());
        assert!(pages >= MIN_REGION_PAGES && pages <= MAX_REGION_PAGES);
        assert!(self.n_regions < MAX_REGIONS, "too many physical regions");
        if let Some(last) = self.regions[..self.n_regions].last() {
            let last = last.as_ref().unwrap();
            assert!(base.as_u64() >= last.base.as_u64() + (last.pages + 1) as u64 * FRAME_SIZE as u64);
        }

        let usable = pages - 1;
        header.init(usable);

        let idx = self.n_regions;
        self.regions[idx] = Some(MemoryRegion {
            base,
            pages: usable,
            header,
            list: None,
            next: None,
        });
        self.n_regions += 1;
        self.total_pages += usable;
        self.available_pages += usable;
        self.relink(idx);
    }

    /// Build the allocator from the boot memory map: every usable range
    /// is split into 64 MiB regions whose headers live in their first
    /// frame, reached through the translated window.
    ///
    /// # Safety
    ///
    /// The memory map must describe RAM that is unused, identity-present
    /// in the translated window, and not aliased by anything else.
    pub unsafe fn init_from_boot(&mut self, boot: &crate::boot::BootInfo) {
        for entry in boot.usable_ranges() {
            let mut base = crate::mm::frame_ceil(entry.pbase);
            let end = entry.pbase + entry.length;
            let mut pages = (end.saturating_sub(base) / FRAME_SIZE as u64) as usize;

            while pages >= MIN_REGION_PAGES {
                let take = pages.min(MAX_REGION_PAGES);
                let paddr = PhysAddr::new(base);
                let header = unsafe { &mut *(paddr.kernel_view() as *mut RegionHeader) };
                self.add_region(paddr, take, header);
                base += (take * FRAME_SIZE) as u64;
                pages -= take;
            }
        }
        log::info!(
            "{} MiB usable in {} regions",
            self.total_pages * FRAME_SIZE / (1024 * 1024),
            self.n_regions,
        );
    }

    /// Frames currently free.
    pub fn available_frames(&self) -> usize {
        self.available_pages
    }

    /// Frames managed in total.
    pub fn total_frames(&self) -> usize {
        self.total_pages
    }

    /// Detach `idx` from its list (if any) and push it onto the list
    /// matching its current largest free class.
    fn relink(&mut self, idx: usize) {
        let old = self.regions[idx].as_ref().unwrap().list;
        let new = self.regions[idx].as_ref().unwrap().header.largest_free_level();
        if old == new {
            return;
        }

        if let Some(list) = old {
            // Unlink; the region is usually the head, but frees can touch
            // any region so walk when it is not.
            let next = self.regions[idx].as_ref().unwrap().next;
            if self.lists[list] == Some(idx) {
                self.lists[list] = next;
            } else {
                let mut cur = self.lists[list];
                while let Some(c) = cur {
                    if self.regions[c].as_ref().unwrap().next == Some(idx) {
                        self.regions[c].as_mut().unwrap().next = next;
                        break;
                    }
                    cur = self.regions[c].as_ref().unwrap().next;
                }
            }
        }

        let region = self.regions[idx].as_mut().unwrap();
        region.list = new;
        region.next = None;
        if let Some(list) = new {
            region.next = self.lists[list];
            self.lists[list] = Some(idx);
        }
    }

    /// Worst fit: the head of the highest non-empty list.
    fn pick_region(&self) -> Option<(usize, usize)> {
        (0..4)
            .rev()
            .find_map(|level| self.lists[level].map(|idx| (idx, level)))
    }

    /// Reserve `count` frames, invoking `emit(paddr, vaddr)` once per
    /// frame with `vaddr` advancing from `virtual_addr` in page steps so
    /// the caller can map as it goes.
    ///
    /// Running out of physical memory here is fatal by design: the
    /// callers that can tolerate failure check `available_frames` first.
    pub fn alloc<F>(&mut self, count: usize, virtual_addr: VirtAddr, mut emit: F)
    where
        F: FnMut(PhysAddr, VirtAddr),
    {
        assert!(
            self.available_pages >= count,
            "out of physical memory: {count} frames requested, {} available",
            self.available_pages,
        );
        self.available_pages -= count;

        let mut remaining = count;
        let mut vaddr = virtual_addr;

        while remaining > 0 {
            let (idx, level) = self
                .pick_region()
                .expect("free list accounting out of sync");
            let region = self.regions[idx].as_mut().unwrap();
            let gran = GRANULARITY[level];
            let blocks = blocks_at(region.pages, level);

            'scan: for word_idx in 0..blocks.div_ceil(64) {
                let mut free_bits = !region.header.bitmap(level)[word_idx];
                while free_bits != 0 {
                    let bit = free_bits.trailing_zeros() as usize;
                    free_bits &= free_bits - 1;
                    let block = word_idx * 64 + bit;
                    if block >= blocks {
                        break 'scan;
                    }

                    // Expand the free block into its 4 KiB pages.
                    let first = block * gran;
                    let last = (first + gran).min(region.pages);
                    for page in first..last {
                        region.header.alloc_page(page);
                        emit(region.page_addr(page), vaddr);
                        vaddr = vaddr.offset(FRAME_SIZE as i64);
                        remaining -= 1;
                        if remaining == 0 {
                            break 'scan;
                        }
                    }
                }
            }

            self.relink(idx);
        }
    }

    /// Allocate one frame and return its physical address.
    pub fn alloc_single(&mut self) -> PhysAddr {
        let mut result = PhysAddr::new(0);
        self.alloc(1, VirtAddr::new(0), |paddr, _| result = paddr);
        assert!(result.as_u64() != 0);
        result
    }

    /// Return one frame to the pool. The frame is zeroed before the
    /// counters see it as free again.
    pub fn free(&mut self, paddr: PhysAddr) {
        assert!(paddr.is_frame_aligned());
        let idx = self
            .region_of(paddr)
            .unwrap_or_else(|| panic!("free of unmanaged frame {:#x}", paddr.as_u64()));

        let region = self.regions[idx].as_mut().unwrap();
        let page = region
            .page_of(paddr)
            .unwrap_or_else(|| panic!("free of region header frame {:#x}", paddr.as_u64()));

        #[cfg(target_os = "none")]
        unsafe {
            core::ptr::write_bytes(paddr.kernel_view(), 0, FRAME_SIZE);
        }

        region.header.free_page(page);
        self.available_pages += 1;
        self.relink(idx);
    }

    /// Binary search the sorted region array for the owner of `paddr`.
    fn region_of(&self, paddr: PhysAddr) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.n_regions;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let region = self.regions[mid].as_ref().unwrap();
            let start = region.base.as_u64();
            let end = start + ((region.pages + 1) * FRAME_SIZE) as u64;
            if paddr.as_u64() < start {
                hi = mid;
            } else if paddr.as_u64() >= end {
                lo = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// Full consistency pass over every region: bitmap/counter agreement,
    /// covering invariant, list membership matching the region class.
    /// Must be called with the PMM lock held.
    pub fn check(&self) {
        let mut free = 0usize;
        for region in self.regions[..self.n_regions].iter() {
            let region = region.as_ref().unwrap();
            region.header.check(region.pages);
            assert!(region.list == region.header.largest_free_level());
            free += region.header.available(0) as usize;
        }
        assert!(
            free == self.available_pages,
            "region counters {free} != global available {}",
            self.available_pages,
        );
    }
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The system-wide frame allocator. Interrupts are disabled for the whole
/// of every bitmap edit; the lock guard guarantees it.
pub static PMM: IrqSpinlock<PhysicalMemoryManager> =
    IrqSpinlock::new(PhysicalMemoryManager::new());

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn leaked_header() -> &'static mut RegionHeader {
        Box::leak(Box::new(RegionHeader {
            available: [0; 4],
            _padding: [0; 1136],
            bitmap3: [0; WORDS[3]],
            bitmap2: [0; WORDS[2]],
            bitmap1: [0; WORDS[1]],
            bitmap0: [0; WORDS[0]],
        }))
    }

    fn small_pmm(pages: usize) -> PhysicalMemoryManager {
        let mut pmm = PhysicalMemoryManager::new();
        pmm.add_region(PhysAddr::new(0x100_0000), pages, leaked_header());
        pmm
    }

    #[test]
    fn counters_track_allocation() {
        let mut pmm = small_pmm(65);
        assert_eq!(pmm.total_frames(), 64);
        assert_eq!(pmm.available_frames(), 64);

        let frame = pmm.alloc_single();
        assert_eq!(pmm.available_frames(), 63);
        pmm.check();

        pmm.free(frame);
        assert_eq!(pmm.available_frames(), 64);
        pmm.check();
    }

    #[test]
    fn alloc_free_roundtrip_is_idempotent_on_counters() {
        let mut pmm = small_pmm(100);
        let before: Vec<u32> = {
            let region = pmm.regions[0].as_ref().unwrap();
            (0..4).map(|l| region.header.available(l)).collect()
        };

        let mut frames = Vec::new();
        pmm.alloc(37, VirtAddr::new(0), |p, _| frames.push(p));
        pmm.check();
        for f in frames {
            pmm.free(f);
        }
        pmm.check();

        let region = pmm.regions[0].as_ref().unwrap();
        for (level, want) in before.iter().enumerate() {
            assert_eq!(region.header.available(level), *want);
        }
    }

    #[test]
    fn emitted_frames_are_distinct_and_in_range() {
        let mut pmm = small_pmm(200);
        let mut frames = Vec::new();
        pmm.alloc(150, VirtAddr::new(0x4000_0000), |p, v| frames.push((p, v)));

        // Virtual cursor advances page by page.
        for (i, (_, v)) in frames.iter().enumerate() {
            assert_eq!(v.as_u64(), 0x4000_0000 + (i * FRAME_SIZE) as u64);
        }

        let mut phys: Vec<u64> = frames.iter().map(|(p, _)| p.as_u64()).collect();
        phys.sort_unstable();
        phys.dedup();
        assert_eq!(phys.len(), 150);

        for p in phys {
            assert!(p > 0x100_0000); // never the header frame
            assert!(p < 0x100_0000 + (200 * FRAME_SIZE) as u64);
        }
    }

    #[test]
    fn exhaustion_then_refill() {
        let mut pmm = small_pmm(MIN_REGION_PAGES);
        let n = pmm.available_frames();
        let mut frames = Vec::new();
        pmm.alloc(n, VirtAddr::new(0), |p, _| frames.push(p));
        assert_eq!(pmm.available_frames(), 0);
        pmm.check();

        // A freed frame becomes allocatable again.
        let f = frames.pop().unwrap();
        pmm.free(f);
        assert_eq!(pmm.available_frames(), 1);
        let again = pmm.alloc_single();
        assert_eq!(again, f);
    }

    #[test]
    #[should_panic(expected = "out of physical memory")]
    fn over_allocation_panics() {
        let mut pmm = small_pmm(MIN_REGION_PAGES);
        let n = pmm.available_frames();
        pmm.alloc(n + 1, VirtAddr::new(0), |_, _| {});
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut pmm = small_pmm(64);
        let f = pmm.alloc_single();
        pmm.free(f);
        pmm.free(f);
    }

    #[test]
    fn worst_fit_prefers_emptier_region() {
        let mut pmm = PhysicalMemoryManager::new();
        pmm.add_region(PhysAddr::new(0x100_0000), 20, leaked_header());
        pmm.add_region(PhysAddr::new(0x4000_0000), 1000, leaked_header());

        // The big region still has 64 KiB blocks; the small one does not
        // after a few allocations. All frames must come from the big one
        // while it keeps the highest class.
        let mut frames = Vec::new();
        pmm.alloc(100, VirtAddr::new(0), |p, _| frames.push(p));
        assert!(frames.iter().all(|p| p.as_u64() >= 0x4000_0000));
        pmm.check();
    }

    #[test]
    fn level_counters_respect_hierarchy() {
        let mut pmm = small_pmm(MAX_REGION_PAGES);
        let mut frames = Vec::new();
        pmm.alloc(1000, VirtAddr::new(0), |p, _| frames.push(p));

        let region = pmm.regions[0].as_ref().unwrap();
        let a0 = region.header.available(0) as usize;
        let a1 = region.header.available(1) as usize;
        // A free 16 KiB block certifies 4 free pages.
        assert!(a1 * 4 <= a0 + 3);
        pmm.check();

        for f in frames {
            pmm.free(f);
        }
        pmm.check();
    }

    #[test]
    fn partial_tail_block_roundtrip() {
        // 50 usable pages: the last level-3 block covers pages 48..50
        // only. Exercise alloc/free across the ragged tail.
        let mut pmm = small_pmm(51);
        let mut frames = Vec::new();
        pmm.alloc(50, VirtAddr::new(0), |p, _| frames.push(p));
        assert_eq!(pmm.available_frames(), 0);
        pmm.check();
        for f in frames {
            pmm.free(f);
        }
        pmm.check();
        assert_eq!(pmm.available_frames(), 50);
    }
}
