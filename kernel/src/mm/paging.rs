//! 4-level page table management
//!
//! Table frames come from the PMM and are reached through the translated
//! window, so the walker works on whichever address space owns the frame,
//! not just the active one. The kernel top half (PML4 slots 256..512) is
//! written once at boot and copied into every user page map; switching
//! CR3 therefore never invalidates kernel mappings.
//!
//! Mapping over a present leaf entry is a programming error (debug
//! panic); running out of frames for table pages is fatal.

use bitflags::bitflags;

use crate::mm::pmm::PMM;
use crate::mm::vmap::{self, PhysAddr, VirtAddr};
use crate::mm::FRAME_SIZE;

bitflags! {
    /// Page table entry flags. The bit positions are exactly the x86-64
    /// hardware ones so an entry is flags OR frame address.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITE         = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Flags for user data pages: present, writable, non-executable.
    pub fn user_data() -> Self {
        Self::PRESENT | Self::WRITE | Self::USER | Self::NO_EXECUTE
    }

    /// Flags for kernel heap pages.
    pub fn kernel_data() -> Self {
        Self::PRESENT | Self::WRITE | Self::NO_EXECUTE
    }
}

/// Mask of the frame address within an entry.
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn frame(self) -> Option<PhysAddr> {
        if self.is_present() {
            Some(PhysAddr::new(self.0 & ADDR_MASK))
        } else {
            None
        }
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    pub fn set(&mut self, frame: PhysAddr, flags: PageFlags) {
        debug_assert!(frame.is_frame_aligned());
        self.0 = (frame.as_u64() & ADDR_MASK) | flags.bits();
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A table of 512 entries; every level has the same shape.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == FRAME_SIZE);

impl PageTable {
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::empty(); 512];
    }

    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

/// View a physical frame as a page table through the translated window.
///
/// # Safety
///
/// `frame` must hold a page table belonging to the caller; the returned
/// reference must not outlive that ownership.
unsafe fn table_at(frame: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *(frame.kernel_view() as *mut PageTable) }
}

/// Allocate and zero a fresh table frame.
fn alloc_table_frame() -> PhysAddr {
    let frame = PMM.lock().alloc_single();
    #[cfg(target_os = "none")]
    unsafe {
        core::ptr::write_bytes(frame.kernel_view(), 0, FRAME_SIZE);
    }
    frame
}

/// Active PML4 root.
fn current_root() -> PhysAddr {
    PhysAddr::new(crate::arch::x86_64::read_page_map())
}

/// Intermediate-table flags: the leaf entry carries the restrictive bits,
/// directories stay permissive.
fn directory_flags(vaddr: VirtAddr) -> PageFlags {
    let mut flags = PageFlags::PRESENT | PageFlags::WRITE;
    if vmap::is_user(vaddr.as_u64()) {
        flags |= PageFlags::USER;
    }
    flags
}

/// Walk to the page table (level 1) covering `vaddr`, allocating missing
/// directories on the way.
///
/// # Safety
///
/// Requires the translated window (bare metal only).
unsafe fn ensure_leaf_table(root: PhysAddr, vaddr: VirtAddr) -> &'static mut PageTable {
    let indices = vaddr.table_indices();
    let mut table = unsafe { table_at(root) };
    for &index in &indices[..3] {
        let entry = table.entry(index);
        let next = match entry.frame() {
            Some(frame) => frame,
            None => {
                let frame = alloc_table_frame();
                table.entry_mut(index).set(frame, directory_flags(vaddr));
                frame
            }
        };
        table = unsafe { table_at(next) };
    }
    table
}

/// Walk to the page table covering `vaddr` without allocating.
unsafe fn leaf_table(root: PhysAddr, vaddr: VirtAddr) -> Option<&'static mut PageTable> {
    let indices = vaddr.table_indices();
    let mut table = unsafe { table_at(root) };
    for &index in &indices[..3] {
        let frame = table.entry(index).frame()?;
        table = unsafe { table_at(frame) };
    }
    Some(table)
}

/// Install `count` consecutive PTEs mapping `paddr..` at `vaddr..`.
///
/// # Safety
///
/// The physical range must be owned by the caller. Mapping over a present
/// entry is a bug (debug panic).
pub unsafe fn map_pages(paddr: PhysAddr, vaddr: VirtAddr, count: usize, flags: PageFlags) {
    let root = current_root();
    for i in 0..count {
        let va = vaddr.offset((i * FRAME_SIZE) as i64);
        let pa = paddr.offset((i * FRAME_SIZE) as u64);
        let table = unsafe { ensure_leaf_table(root, va) };
        let entry = table.entry_mut(va.table_indices()[3]);
        debug_assert!(!entry.is_present(), "mapping over present PTE {:#x}", va.as_u64());
        entry.set(pa, flags);
    }
}

/// Tear down `count` PTEs starting at `vaddr`; optionally return the
/// frames to the PMM.
///
/// # Safety
///
/// The range must be mapped in the current address space and no longer in
/// use by anyone else.
pub unsafe fn unmap_pages(vaddr: VirtAddr, count: usize, free_frames: bool) {
    let root = current_root();
    for i in 0..count {
        let va = vaddr.offset((i * FRAME_SIZE) as i64);
        let Some(table) = (unsafe { leaf_table(root, va) }) else {
            continue;
        };
        let entry = table.entry_mut(va.table_indices()[3]);
        if let Some(frame) = entry.frame() {
            entry.clear();
            crate::arch::x86_64::invlpg(va.as_u64());
            if free_frames {
                PMM.lock().free(frame);
            }
        }
    }
}

/// Allocate `count` fresh frames and map them at `vaddr` with `flags`.
///
/// Table pages are pre-grown first so the PMM emit callback only writes
/// leaf entries and never re-enters the allocator.
///
/// # Safety
///
/// Same contract as [`map_pages`]; additionally the caller owns the
/// virtual range.
pub unsafe fn alloc_pages(vaddr: VirtAddr, count: usize, flags: PageFlags) {
    let root = current_root();
    // Phase 1: make every leaf table exist.
    let mut page = 0;
    while page < count {
        let va = vaddr.offset((page * FRAME_SIZE) as i64);
        unsafe { ensure_leaf_table(root, va) };
        // One leaf table covers 512 pages; jump to the next boundary.
        let covered = 512 - va.table_indices()[3];
        page += covered;
    }

    // Phase 2: reserve frames and write leaves as they come.
    PMM.lock().alloc(count, vaddr, |pa, va| {
        let table = unsafe { leaf_table(root, va).expect("leaf table vanished") };
        let entry = table.entry_mut(va.table_indices()[3]);
        debug_assert!(!entry.is_present(), "mapping over present PTE {:#x}", va.as_u64());
        entry.set(pa, flags);
    });
}

/// Change the protection bits of `count` mapped pages, leaving frames.
///
/// # Safety
///
/// The range must be mapped in the current address space.
pub unsafe fn remap_pages(vaddr: VirtAddr, count: usize, flags: PageFlags) {
    let root = current_root();
    for i in 0..count {
        let va = vaddr.offset((i * FRAME_SIZE) as i64);
        let table = unsafe { leaf_table(root, va).expect("remap of unmapped range") };
        let entry = table.entry_mut(va.table_indices()[3]);
        assert!(entry.is_present(), "remap of unmapped page {:#x}", va.as_u64());
        entry.set_flags(flags | PageFlags::PRESENT);
        crate::arch::x86_64::invlpg(va.as_u64());
    }
}

/// Allocate a fresh PML4 for a new process: user half empty, kernel half
/// copied from the running kernel's so high mappings are shared forever.
///
/// # Safety
///
/// Requires the translated window.
pub unsafe fn alloc_user_page_map() -> PhysAddr {
    let frame = alloc_table_frame();
    let new = unsafe { table_at(frame) };
    let current = unsafe { table_at(current_root()) };
    for i in 256..512 {
        *new.entry_mut(i) = current.entry(i);
    }
    frame
}

/// Switch CR3 to `pml4`. Kernel mappings survive by construction; only
/// the user range of the leaving map needs TLB invalidation, which the
/// CR3 write provides.
///
/// # Safety
///
/// `pml4` must come from [`alloc_user_page_map`] and still be alive.
pub unsafe fn set_user_page_map(pml4: PhysAddr) {
    unsafe { crate::arch::x86_64::write_page_map(pml4.as_u64()) };
}

/// Physical address of the active PML4.
pub fn user_page_map() -> PhysAddr {
    current_root()
}

/// Detach the 1 GiB-covering directory that maps `vaddr` from the current
/// address space, returning its frame. The directory keeps its leaf
/// tables and mappings; the caller (SHM) owns them from now on.
///
/// # Safety
///
/// `vaddr` must be 1 GiB-aligned and its directory populated.
pub unsafe fn detach_l3_directory(vaddr: VirtAddr) -> Option<PhysAddr> {
    debug_assert!(vaddr.as_u64() % (1 << 30) == 0);
    let indices = vaddr.table_indices();
    let root = unsafe { table_at(current_root()) };
    let pdpt_frame = root.entry(indices[0]).frame()?;
    let pdpt = unsafe { table_at(pdpt_frame) };
    let entry = pdpt.entry_mut(indices[1]);
    let directory = entry.frame()?;
    entry.clear();
    Some(directory)
}

/// Attach a detached 1 GiB directory at `vaddr` in the current address
/// space (the memfs mapping path).
///
/// # Safety
///
/// `directory` must be a live SHM directory and `vaddr` a free,
/// 1 GiB-aligned slot.
pub unsafe fn attach_l3_directory(vaddr: VirtAddr, directory: PhysAddr, flags: PageFlags) {
    debug_assert!(vaddr.as_u64() % (1 << 30) == 0);
    let indices = vaddr.table_indices();
    let root_frame = current_root();
    let root = unsafe { table_at(root_frame) };
    let pdpt_frame = match root.entry(indices[0]).frame() {
        Some(f) => f,
        None => {
            let f = alloc_table_frame();
            root.entry_mut(indices[0]).set(f, directory_flags(vaddr));
            f
        }
    };
    let pdpt = unsafe { table_at(pdpt_frame) };
    let entry = pdpt.entry_mut(indices[1]);
    debug_assert!(!entry.is_present(), "attach over present directory");
    entry.set(directory, flags);
}

/// Clear the 1 GiB directory slot at `vaddr` without touching the
/// directory contents (the SHM keeps ownership).
///
/// # Safety
///
/// `vaddr` must have been attached with [`attach_l3_directory`].
pub unsafe fn detach_l3_slot(vaddr: VirtAddr) {
    unsafe {
        detach_l3_directory(vaddr);
    }
}

/// Deep-free a detached 1 GiB directory: every mapped frame, every leaf
/// table and the directory frame itself go back to the PMM.
///
/// # Safety
///
/// `directory` must be detached from every address space.
pub unsafe fn free_l3_directory(directory: PhysAddr) {
    let dir = unsafe { table_at(directory) };
    for pd_index in 0..512 {
        let Some(pt_frame) = dir.entry(pd_index).frame() else {
            continue;
        };
        let pt = unsafe { table_at(pt_frame) };
        for pt_index in 0..512 {
            if let Some(frame) = pt.entry(pt_index).frame() {
                PMM.lock().free(frame);
            }
        }
        PMM.lock().free(pt_frame);
    }
    PMM.lock().free(directory);
}

/// Unmap the whole user half of the current address space, freeing every
/// leaf frame and intermediate table. Used by process teardown and by
/// exec-in-place.
///
/// # Safety
///
/// No thread of the process may run user code concurrently.
pub unsafe fn free_user_half(pml4: PhysAddr) {
    let root = unsafe { table_at(pml4) };
    for l4 in 0..256 {
        let Some(pdpt_frame) = root.entry(l4).frame() else {
            continue;
        };
        let pdpt = unsafe { table_at(pdpt_frame) };
        for l3 in 0..512 {
            let Some(pd_frame) = pdpt.entry(l3).frame() else {
                continue;
            };
            unsafe { free_l3_directory(pd_frame) };
        }
        root.entry_mut(l4).clear();
        PMM.lock().free(pdpt_frame);
    }
}

/// Outcome of a page fault, decided by where it landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// User-range fault: the faulting process gets SIGSEGV.
    UserSegv,
    /// Kernel-range fault: unrecoverable.
    KernelFatal,
}

/// Classify a page fault at `vaddr`. `user_mode` is the CPL at fault time.
pub fn classify_fault(vaddr: u64, user_mode: bool) -> FaultOutcome {
    if user_mode || vmap::is_user(vaddr) {
        FaultOutcome::UserSegv
    } else {
        FaultOutcome::KernelFatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip_preserves_frame_and_flags() {
        let mut entry = PageTableEntry::empty();
        assert!(!entry.is_present());

        let frame = PhysAddr::new(0x1234_5000);
        entry.set(frame, PageFlags::user_data());
        assert!(entry.is_present());
        assert_eq!(entry.frame(), Some(frame));
        assert!(entry.flags().contains(PageFlags::USER));
        assert!(entry.flags().contains(PageFlags::NO_EXECUTE));

        entry.set_flags(PageFlags::PRESENT);
        assert_eq!(entry.frame(), Some(frame));
        assert!(!entry.flags().contains(PageFlags::USER));

        entry.clear();
        assert!(!entry.is_present());
    }

    #[test]
    fn nx_bit_does_not_corrupt_address() {
        let mut entry = PageTableEntry::empty();
        entry.set(PhysAddr::new(0xf_ffff_f000), PageFlags::kernel_data());
        assert_eq!(entry.frame(), Some(PhysAddr::new(0xf_ffff_f000)));
        assert!(entry.flags().contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn fault_classification() {
        assert_eq!(classify_fault(0x40_0000, true), FaultOutcome::UserSegv);
        assert_eq!(classify_fault(0x40_0000, false), FaultOutcome::UserSegv);
        assert_eq!(
            classify_fault(vmap::KERNEL_HEAP_BEGIN, false),
            FaultOutcome::KernelFatal
        );
    }

    #[test]
    fn directory_flags_follow_half() {
        assert!(directory_flags(VirtAddr::new(0x1000)).contains(PageFlags::USER));
        assert!(!directory_flags(VirtAddr::new(vmap::KERNEL_HEAP_BEGIN)).contains(PageFlags::USER));
    }
}
