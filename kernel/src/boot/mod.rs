//! Boot handoff contract
//!
//! The loader (a Stivale2-compliant boot loader, out of tree) enters the
//! kernel with one structure describing the machine. Nothing else crosses
//! the boundary: once `mm` is up the kernel never touches loader memory
//! again, and the console callback stops being valid after VMM init.

/// Classification of a physical memory range reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMapEntryType {
    /// Free RAM, handed to the PMM.
    Usable,
    /// The kernel image itself.
    Kernel,
    /// Loader structures; reclaimable once the handoff has been consumed.
    BootloaderReclaimable,
    /// ACPI tables; reclaimable after ACPI init.
    AcpiReclaimable,
    /// ACPI non-volatile storage, never reclaimed.
    AcpiNvs,
    /// Memory-mapped IO ranges.
    Mmio,
}

/// One physical memory range.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    /// Physical base address.
    pub pbase: u64,
    /// Length in bytes.
    pub length: u64,
    pub entry_type: MemoryMapEntryType,
}

/// Everything the loader gives us.
///
/// Lifetimes are deliberately `'static` from the kernel's point of view:
/// the loader guarantees the referenced memory stays valid until the
/// corresponding reclaimable ranges are released to the PMM.
pub struct BootInfo {
    /// Early console output, valid at least until VMM initialisation.
    pub console_write: fn(&str),
    /// Physical address of the ACPI RSDP.
    pub rsdp_paddr: u64,
    /// Optional kernel symbol table blob for panic backtraces.
    pub kernel_symbols: Option<&'static [u8]>,
    /// The machine memory map, sorted by base address.
    pub memory_map: &'static [MemoryMapEntry],
    /// GUID of the GPT partition the kernel was loaded from.
    pub boot_volume_guid: [u8; 16],
}

impl BootInfo {
    /// Iterate the usable RAM ranges destined for the PMM.
    pub fn usable_ranges(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.memory_map
            .iter()
            .filter(|e| e.entry_type == MemoryMapEntryType::Usable)
    }

    /// Total bytes of usable RAM reported by the loader.
    pub fn usable_bytes(&self) -> u64 {
        self.usable_ranges().map(|e| e.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(_: &str) {}

    #[test]
    fn usable_filter() {
        static MAP: [MemoryMapEntry; 3] = [
            MemoryMapEntry {
                pbase: 0x1000,
                length: 0x8000,
                entry_type: MemoryMapEntryType::Usable,
            },
            MemoryMapEntry {
                pbase: 0x100000,
                length: 0x200000,
                entry_type: MemoryMapEntryType::Kernel,
            },
            MemoryMapEntry {
                pbase: 0x400000,
                length: 0x10000,
                entry_type: MemoryMapEntryType::Usable,
            },
        ];
        let bi = BootInfo {
            console_write: sink,
            rsdp_paddr: 0,
            kernel_symbols: None,
            memory_map: &MAP,
            boot_volume_guid: [0; 16],
        };
        assert_eq!(bi.usable_ranges().count(), 2);
        assert_eq!(bi.usable_bytes(), 0x18000);
    }
}
