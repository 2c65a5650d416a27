//! Shared memory objects
//!
//! An SHM is 1 GiB of address space backed by a detached level-3 page
//! directory: creating one populates a directory through the temp window,
//! then unplugs it from the address space. The bare `pd_paddr` is all a
//! mapper needs — plugging the directory into a PDPT slot makes the whole
//! object visible at a 1 GiB-aligned base.
//!
//! Objects are reference-counted through instances. Dropping the last
//! instance walks the frame tree and gives everything back to the PMM.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::vmap::PhysAddr;
use crate::sync::IrqSpinlock;

/// Shared memory object identifier.
pub type ShmId = u32;

/// Largest SHM: one level-3 directory's coverage.
pub const SHM_SIZE_MAX: usize = 1 << 30;

struct Shm {
    id: ShmId,
    /// Live instance count.
    refcount: u32,
    /// The detached 1 GiB directory.
    pd_paddr: PhysAddr,
    size: usize,
}

/// A counted reference to an SHM. Obtained from [`create`]/[`open`],
/// surrendered with [`close`]; not cloneable, so the count stays exact.
#[derive(Debug, PartialEq, Eq)]
pub struct ShmInstance {
    target: ShmId,
}

impl ShmInstance {
    pub fn id(&self) -> ShmId {
        self.target
    }
}

static TABLE: IrqSpinlock<Vec<Shm>> = IrqSpinlock::new(Vec::new());
static NEXT_ID: IrqSpinlock<ShmId> = IrqSpinlock::new(1);

fn next_id() -> ShmId {
    let mut id = NEXT_ID.lock();
    let v = *id;
    *id += 1;
    v
}

/// Allocate and map `size` bytes of fresh user-accessible memory in the
/// temp window, then detach the covering directory.
#[cfg(target_os = "none")]
fn allocate_backing(size: usize) -> KernelResult<PhysAddr> {
    use crate::mm::paging::{self, PageFlags};
    use crate::mm::{frames_for, temp};

    let pages = frames_for(size);
    if crate::mm::pmm::PMM.lock().available_frames() < pages + 4 {
        return Err(KernelError::OutOfMemory);
    }

    crate::arch::without_interrupts(|| {
        let base = temp::lock();
        unsafe {
            paging::alloc_pages(base, pages, PageFlags::user_data());
            let pd = paging::detach_l3_directory(base).ok_or(KernelError::OutOfMemory);
            temp::release();
            pd
        }
    })
}

/// Host stand-in: a unique fake directory address so table lifecycle
/// tests can run without page tables.
#[cfg(not(target_os = "none"))]
fn allocate_backing(_size: usize) -> KernelResult<PhysAddr> {
    use core::sync::atomic::{AtomicU64, Ordering};
    static FAKE: AtomicU64 = AtomicU64::new(0x1000_0000);
    Ok(PhysAddr::new(FAKE.fetch_add(0x1000, Ordering::Relaxed)))
}

#[cfg(target_os = "none")]
fn release_backing(pd_paddr: PhysAddr) {
    crate::arch::without_interrupts(|| unsafe {
        crate::mm::paging::free_l3_directory(pd_paddr);
    });
}

#[cfg(not(target_os = "none"))]
fn release_backing(_pd_paddr: PhysAddr) {}

/// Create an SHM of `size` bytes. The caller holds the first instance.
pub fn create(size: usize) -> KernelResult<ShmInstance> {
    if size == 0 || size > SHM_SIZE_MAX {
        return Err(KernelError::InvalidArgument);
    }

    let pd_paddr = allocate_backing(size)?;
    let id = next_id();

    TABLE.lock().push(Shm {
        id,
        refcount: 1,
        pd_paddr,
        size,
    });

    log::debug!("shm {id} created: {size} bytes, pd {:#x}", pd_paddr.as_u64());
    Ok(ShmInstance { target: id })
}

/// Wrap an existing kernel mapping as an SHM: `kernel_vaddr` is the
/// 1 GiB-aligned base of a populated range the caller donates (the
/// framebuffer hand-over path). The covering directory is detached from
/// the kernel address space and becomes the object's backing.
pub fn create_from(size: usize, kernel_vaddr: crate::mm::VirtAddr) -> KernelResult<ShmInstance> {
    if size == 0 || size > SHM_SIZE_MAX {
        return Err(KernelError::InvalidArgument);
    }
    if kernel_vaddr.as_u64() % (1 << 30) != 0 {
        return Err(KernelError::InvalidArgument);
    }

    #[cfg(target_os = "none")]
    let pd_paddr = crate::arch::without_interrupts(|| unsafe {
        crate::mm::paging::detach_l3_directory(kernel_vaddr).ok_or(KernelError::OutOfMemory)
    })?;
    #[cfg(not(target_os = "none"))]
    let pd_paddr = allocate_backing(size)?;

    let id = next_id();
    TABLE.lock().push(Shm {
        id,
        refcount: 1,
        pd_paddr,
        size,
    });
    Ok(ShmInstance { target: id })
}

/// Take a new reference on `id`.
pub fn open(id: ShmId) -> KernelResult<ShmInstance> {
    let mut table = TABLE.lock();
    let shm = table
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or(KernelError::NotFound)?;
    shm.refcount += 1;
    Ok(ShmInstance { target: id })
}

/// Drop a reference; the last one frees the whole frame tree.
pub fn close(instance: ShmInstance) -> KernelResult<()> {
    let mut table = TABLE.lock();
    let index = table
        .iter()
        .position(|s| s.id == instance.target)
        .ok_or(KernelError::NotFound)?;

    table[index].refcount -= 1;
    if table[index].refcount == 0 {
        let shm = table.swap_remove(index);
        drop(table);
        release_backing(shm.pd_paddr);
        log::debug!("shm {} destroyed", shm.id);
    }
    Ok(())
}

/// Resize `id` to `new_size` bytes (page granular, within the 1 GiB cap).
pub fn truncate(id: ShmId, new_size: usize) -> KernelResult<()> {
    if new_size == 0 || new_size > SHM_SIZE_MAX {
        return Err(KernelError::InvalidArgument);
    }

    let mut table = TABLE.lock();
    let shm = table
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or(KernelError::NotFound)?;

    #[cfg(target_os = "none")]
    {
        use crate::mm::paging::{self, PageFlags};
        use crate::mm::{frames_for, temp, FRAME_SIZE};

        let old_pages = frames_for(shm.size);
        let new_pages = frames_for(new_size);
        if new_pages != old_pages {
            crate::arch::without_interrupts(|| {
                let base = temp::lock();
                unsafe {
                    paging::attach_l3_directory(base, shm.pd_paddr, PageFlags::user_data());
                    if new_pages > old_pages {
                        paging::alloc_pages(
                            base.offset((old_pages * FRAME_SIZE) as i64),
                            new_pages - old_pages,
                            PageFlags::user_data(),
                        );
                    } else {
                        paging::unmap_pages(
                            base.offset((new_pages * FRAME_SIZE) as i64),
                            old_pages - new_pages,
                            true,
                        );
                    }
                    paging::detach_l3_slot(base);
                }
                temp::release();
            });
        }
    }

    shm.size = new_size;
    Ok(())
}

/// The directory backing `id`, for mappers.
pub fn directory_of(id: ShmId) -> KernelResult<PhysAddr> {
    TABLE
        .lock()
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.pd_paddr)
        .ok_or(KernelError::NotFound)
}

/// Current size of `id` in bytes.
pub fn size_of(id: ShmId) -> KernelResult<usize> {
    TABLE
        .lock()
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.size)
        .ok_or(KernelError::NotFound)
}

/// Number of live SHM objects.
pub fn object_count() -> usize {
    TABLE.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_close_close_restores_table() {
        let a = create(1024 * 1024).unwrap();
        let id = a.id();
        assert!(size_of(id).is_ok());

        let b = open(id).unwrap();
        assert_eq!(b.id(), id);

        close(a).unwrap();
        // Still alive: one instance remains.
        assert!(open(id).is_ok_and(|c| close(c).is_ok()));

        close(b).unwrap();
        // Refcount hit zero: the object is gone for good.
        assert_eq!(open(id).unwrap_err(), KernelError::NotFound);
        assert_eq!(size_of(id).unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn size_bounds_enforced() {
        assert_eq!(create(0).unwrap_err(), KernelError::InvalidArgument);
        assert_eq!(
            create(SHM_SIZE_MAX + 1).unwrap_err(),
            KernelError::InvalidArgument
        );
    }

    #[test]
    fn truncate_updates_size() {
        let a = create(4096).unwrap();
        let id = a.id();
        assert_eq!(size_of(id).unwrap(), 4096);
        truncate(id, 8192).unwrap();
        assert_eq!(size_of(id).unwrap(), 8192);
        truncate(id, 4096).unwrap();
        assert_eq!(size_of(id).unwrap(), 4096);
        close(a).unwrap();
    }

    #[test]
    fn open_unknown_id_fails() {
        assert_eq!(open(0xdead_beef as ShmId).unwrap_err(), KernelError::NotFound);
    }
}
