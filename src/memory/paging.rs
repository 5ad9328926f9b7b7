//! Two-level 32-bit page tables: one directory of 1024 entries, each
//! optionally pointing at a table of 1024 entries mapping 4 KiB frames.

use core::{
    fmt,
    ops::{Index, IndexMut},
};

use bitflags::bitflags;

use crate::{arch::Cpu, constants::memory::PAGE_ENTRIES};

use super::{
    addr::{PhysAddr, PhysFrame, VirtAddr},
    frame_allocator::{FrameAllocator, FrameDeallocator, FrameError},
};

bitflags! {
    /// Low 12 bits of a directory or table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        /// Table entries only.
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

const FLAGS_MASK: u32 = 0xFFF;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysFrame, flags: PageFlags) -> Self {
        PageTableEntry((frame.number() << 12) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    /// Only meaningful for present entries.
    pub fn frame(&self) -> Option<PhysFrame> {
        self.is_present().then(|| PhysFrame::from_number(self.0 >> 12))
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & !FLAGS_MASK) | flags.bits();
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &format_args!("{:#x}", self.0 & !FLAGS_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        PageTable {
            entries: [PageTableEntry::empty(); PAGE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Reaches physical frames by adding a fixed offset. On the target all
/// installed memory is identity-mapped so the offset is zero.
#[derive(Debug, Clone, Copy)]
pub struct PhysOffset(usize);

impl PhysOffset {
    pub const fn identity() -> Self {
        PhysOffset(0)
    }

    pub const fn new(offset: usize) -> Self {
        PhysOffset(offset)
    }

    /// # Safety
    ///
    /// `frame` must hold a page table that is reachable through this offset
    /// and not otherwise borrowed.
    unsafe fn table_mut<'a>(&self, frame: PhysFrame) -> &'a mut PageTable {
        let virt = self
            .0
            .wrapping_add(frame.start_address().as_u32() as usize);
        &mut *(virt as *mut PageTable)
    }
}

/// Address-space handle: the physical frame holding a page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directory(PhysFrame);

impl Directory {
    pub fn frame(&self) -> PhysFrame {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No physical frame left for a directory or page table.
    FrameAllocationFailed,
    NoActiveDirectory,
    NotMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::FrameAllocationFailed => write!(f, "No frame available for page table"),
            MapError::NoActiveDirectory => write!(f, "No page directory installed"),
            MapError::NotMapped => write!(f, "Page is not mapped"),
        }
    }
}

pub struct AddressSpaceManager {
    phys: PhysOffset,
    current: Option<Directory>,
    kernel: Option<Directory>,
}

impl AddressSpaceManager {
    pub const fn new(phys: PhysOffset) -> Self {
        AddressSpaceManager {
            phys,
            current: None,
            kernel: None,
        }
    }

    pub fn current(&self) -> Option<Directory> {
        self.current
    }

    pub fn kernel_directory(&self) -> Option<Directory> {
        self.kernel
    }

    /// Allocates a zeroed page directory.
    pub fn create_directory(
        &self,
        frames: &mut impl FrameAllocator,
    ) -> Result<Directory, MapError> {
        let frame = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        // SAFETY: freshly allocated frame, nothing else refers to it
        unsafe { self.phys.table_mut(frame) }.zero();
        Ok(Directory(frame))
    }

    /// Builds the kernel directory identity-mapping [0, end) kernel-only and
    /// remembers it as the template for process directories.
    pub fn init_kernel_directory<C: Cpu>(
        &mut self,
        end: u32,
        frames: &mut impl FrameAllocator,
    ) -> Result<Directory, MapError> {
        let directory = self.create_directory(frames)?;
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;

        for page in (0..end / 4096).map(|n| n * 4096) {
            self.map_in::<C>(
                directory,
                VirtAddr::new(page),
                PhysAddr::new(page),
                flags,
                frames,
            )?;
        }

        self.kernel = Some(directory);
        log::info!("Kernel directory at {:?} maps {} KiB", directory.0, end / 1024);
        Ok(directory)
    }

    /// New directory sharing the kernel directory's page tables.
    pub fn create_process_directory(
        &self,
        frames: &mut impl FrameAllocator,
    ) -> Result<Directory, MapError> {
        let directory = self.create_directory(frames)?;
        if let Some(kernel) = self.kernel {
            // SAFETY: distinct frames, both page directories
            let (dst, src) = unsafe {
                (
                    self.phys.table_mut(directory.0),
                    self.phys.table_mut(kernel.0),
                )
            };
            dst.clone_from(src);
        }
        Ok(directory)
    }

    /// Frees a process directory and any page tables it does not share with
    /// the kernel directory. Mapped leaf frames are not touched. Every frame
    /// is released even if one fails; the first failure is reported.
    pub fn destroy_directory(
        &mut self,
        directory: Directory,
        frames: &mut impl FrameDeallocator,
    ) -> Result<(), FrameError> {
        // SAFETY: directories are only reached through this manager
        let dir = unsafe { self.phys.table_mut(directory.0) };
        let kernel = self
            .kernel
            .filter(|k| *k != directory)
            .map(|k| unsafe { &*self.phys.table_mut(k.0) });

        let mut result = Ok(());
        for index in 0..PAGE_ENTRIES {
            let Some(table) = dir[index].frame() else { continue };
            let shared = kernel.is_some_and(|k| k[index].frame() == Some(table));
            if !shared {
                let freed = unsafe { frames.deallocate_frame(table) };
                result = result.and(freed);
            }
        }

        if self.current == Some(directory) {
            self.current = self.kernel;
        }
        let freed = unsafe { frames.deallocate_frame(directory.0) };
        result.and(freed)
    }

    /// Installs `directory` as the active translation root.
    pub fn switch_to<C: Cpu>(&mut self, directory: Directory) {
        self.current = Some(directory);
        // SAFETY: directory was built by this manager and maps the kernel
        unsafe { C::load_directory(directory.0) };
        log::debug!("Switched to directory {:?}", directory.0);
    }

    /// Notes a directory that a planned context switch is about to load.
    pub(crate) fn record_loaded(&mut self, frame: PhysFrame) {
        self.current = Some(Directory(frame));
    }

    /// Maps into the active directory.
    pub fn map<C: Cpu>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        frames: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        let directory = self.current.ok_or(MapError::NoActiveDirectory)?;
        self.map_in::<C>(directory, virt, phys, flags, frames)
    }

    /// Page table behind directory entry `index` that can be written without
    /// changing any other address space. A process directory still sharing
    /// that table with the kernel directory gets a private copy first.
    fn writable_table(
        &self,
        directory: Directory,
        index: usize,
        frames: &mut impl FrameAllocator,
    ) -> Result<Option<PhysFrame>, MapError> {
        // SAFETY: directory frames are owned by this manager
        let dir = unsafe { self.phys.table_mut(directory.0) };
        let Some(table) = dir[index].frame() else {
            return Ok(None);
        };
        let shared = self
            .kernel
            .filter(|k| *k != directory)
            .is_some_and(|k| unsafe { self.phys.table_mut(k.0) }[index].frame() == Some(table));
        if !shared {
            return Ok(Some(table));
        }

        let copy = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        // SAFETY: fresh frame, distinct from the shared table
        let (dst, src) = unsafe { (self.phys.table_mut(copy), self.phys.table_mut(table)) };
        dst.clone_from(src);
        dir[index] = PageTableEntry::new(copy, dir[index].flags());
        log::debug!(
            "Directory {:?} took a private copy of kernel table {}",
            directory.0,
            index
        );
        Ok(Some(copy))
    }

    /// Maps `virt` to `phys` in `directory`, allocating the page table on
    /// demand. On allocation failure nothing is written.
    pub fn map_in<C: Cpu>(
        &mut self,
        directory: Directory,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        frames: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        let index = virt.directory_index();
        let existing = self.writable_table(directory, index, frames)?;
        // SAFETY: directory frames are owned by this manager
        let dir_entry = &mut unsafe { self.phys.table_mut(directory.0) }[index];

        let table_frame = match existing {
            Some(frame) => {
                if flags.contains(PageFlags::USER) {
                    dir_entry.set_flags(dir_entry.flags() | PageFlags::USER);
                }
                frame
            }
            None => {
                let frame = frames
                    .allocate_frame()
                    .ok_or(MapError::FrameAllocationFailed)?;
                unsafe { self.phys.table_mut(frame) }.zero();

                let mut table_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
                if flags.contains(PageFlags::USER) {
                    table_flags |= PageFlags::USER;
                }
                *dir_entry = PageTableEntry::new(frame, table_flags);
                frame
            }
        };

        let table = unsafe { self.phys.table_mut(table_frame) };
        table[virt.table_index()] =
            PageTableEntry::new(PhysFrame::containing_address(phys), flags);

        if self.current == Some(directory) {
            C::invalidate_page(virt);
        }
        Ok(())
    }

    /// Clears the present bit of the leaf entry in the active directory and
    /// returns the frame it pointed at. The frame is not freed.
    pub fn unmap<C: Cpu>(
        &mut self,
        virt: VirtAddr,
        frames: &mut impl FrameAllocator,
    ) -> Result<PhysFrame, MapError> {
        let directory = self.current.ok_or(MapError::NoActiveDirectory)?;
        self.unmap_in::<C>(directory, virt, frames)
    }

    /// `frames` is only drawn on when the page sits in a table shared with
    /// the kernel directory.
    pub fn unmap_in<C: Cpu>(
        &mut self,
        directory: Directory,
        virt: VirtAddr,
        frames: &mut impl FrameAllocator,
    ) -> Result<PhysFrame, MapError> {
        let (phys, _) = self
            .translate_in(directory, virt)
            .ok_or(MapError::NotMapped)?;
        let table_frame = self
            .writable_table(directory, virt.directory_index(), frames)?
            .ok_or(MapError::NotMapped)?;

        let entry = &mut unsafe { self.phys.table_mut(table_frame) }[virt.table_index()];
        entry.set_flags(entry.flags() - PageFlags::PRESENT);

        if self.current == Some(directory) {
            C::invalidate_page(virt);
        }
        Ok(PhysFrame::containing_address(phys))
    }

    /// Translates through the active directory.
    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.translate_in(self.current?, virt)
    }

    /// Physical address and leaf flags for `virt`, if mapped.
    pub fn translate_in(
        &self,
        directory: Directory,
        virt: VirtAddr,
    ) -> Option<(PhysAddr, PageFlags)> {
        let dir = unsafe { self.phys.table_mut(directory.0) };
        let table = unsafe { self.phys.table_mut(dir[virt.directory_index()].frame()?) };
        let entry = table[virt.table_index()];
        let frame = entry.frame()?;
        Some((
            PhysAddr::new(frame.start_address().as_u32() | virt.page_offset()),
            entry.flags(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::mock::{self, CpuEvent, MockCpu},
        constants::memory::RESERVED_END,
        memory::{bitmap_frame_allocator::BitmapFrameAllocator, test_support::PhysBacking},
    };
    use std::vec::Vec;

    const MEMORY: usize = 12 * 1024 * 1024;

    fn setup() -> (PhysBacking, BitmapFrameAllocator, AddressSpaceManager) {
        let backing = PhysBacking::new(RESERVED_END, MEMORY as u32);
        let frames = BitmapFrameAllocator::init(MEMORY, RESERVED_END).unwrap();
        let manager = AddressSpaceManager::new(backing.offset());
        (backing, frames, manager)
    }

    #[test]
    fn test_map_translate_round_trip() {
        let (_backing, mut frames, mut manager) = setup();
        let dir = manager.create_directory(&mut frames).unwrap();
        manager.switch_to::<MockCpu>(dir);

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        let virt = VirtAddr::new(0x4000_1000);
        let phys = PhysAddr::new(0x0090_3000);
        manager
            .map::<MockCpu>(virt, phys, flags, &mut frames)
            .unwrap();

        assert_eq!(manager.translate(virt), Some((phys, flags)));
        assert_eq!(
            manager.translate(VirtAddr::new(0x4000_1abc)),
            Some((PhysAddr::new(0x0090_3abc), flags))
        );
        assert_eq!(manager.translate(VirtAddr::new(0x4000_2000)), None);
        assert!(mock::events().contains(&CpuEvent::InvalidatePage(virt)));
    }

    #[test]
    fn test_map_allocates_table_once() {
        let (_backing, mut frames, mut manager) = setup();
        let dir = manager.create_directory(&mut frames).unwrap();
        manager.switch_to::<MockCpu>(dir);
        let before = frames.free_frames();

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        for i in 0..4 {
            manager
                .map::<MockCpu>(
                    VirtAddr::new(0x1000_0000 + i * 4096),
                    PhysAddr::new(0x0090_0000 + i * 4096),
                    flags,
                    &mut frames,
                )
                .unwrap();
        }
        assert_eq!(frames.free_frames(), before - 1);
    }

    #[test]
    fn test_map_fails_without_frames() {
        let (_backing, mut frames, mut manager) = setup();
        let dir = manager.create_directory(&mut frames).unwrap();
        manager.switch_to::<MockCpu>(dir);
        while frames.allocate().is_some() {}

        let virt = VirtAddr::new(0x1000_0000);
        let result = manager.map::<MockCpu>(
            virt,
            PhysAddr::new(0x0090_0000),
            PageFlags::PRESENT,
            &mut frames,
        );
        assert_eq!(result, Err(MapError::FrameAllocationFailed));
        assert_eq!(manager.translate(virt), None);
    }

    #[test]
    fn test_map_without_directory() {
        let (_backing, mut frames, mut manager) = setup();
        let result = manager.map::<MockCpu>(
            VirtAddr::new(0),
            PhysAddr::new(0),
            PageFlags::PRESENT,
            &mut frames,
        );
        assert_eq!(result, Err(MapError::NoActiveDirectory));
    }

    #[test]
    fn test_unmap_keeps_frame_allocated() {
        let (_backing, mut frames, mut manager) = setup();
        let dir = manager.create_directory(&mut frames).unwrap();
        manager.switch_to::<MockCpu>(dir);

        let data = frames.allocate().unwrap();
        let virt = VirtAddr::new(0x2000_0000);
        manager
            .map::<MockCpu>(
                virt,
                data.start_address(),
                PageFlags::PRESENT | PageFlags::WRITABLE,
                &mut frames,
            )
            .unwrap();

        mock::clear_events();
        assert_eq!(manager.unmap::<MockCpu>(virt, &mut frames), Ok(data));
        assert_eq!(manager.translate(virt), None);
        assert!(frames.is_frame_used(data));
        assert_eq!(mock::events(), [CpuEvent::InvalidatePage(virt)]);
        assert_eq!(
            manager.unmap::<MockCpu>(virt, &mut frames),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn test_process_directory_shares_kernel_tables() {
        let (_backing, mut frames, mut manager) = setup();
        let kernel = manager
            .init_kernel_directory::<MockCpu>(MEMORY as u32, &mut frames)
            .unwrap();
        manager.switch_to::<MockCpu>(kernel);

        let before = frames.free_frames();
        let process = manager.create_process_directory(&mut frames).unwrap();
        assert_eq!(frames.free_frames(), before - 1);

        let sample = VirtAddr::new(0x0030_0123);
        assert_eq!(
            manager.translate_in(process, sample),
            manager.translate_in(kernel, sample)
        );

        // private table above installed memory
        manager
            .map_in::<MockCpu>(
                process,
                VirtAddr::new(0x8000_0000),
                PhysAddr::new(0x0090_0000),
                PageFlags::PRESENT | PageFlags::USER,
                &mut frames,
            )
            .unwrap();
        assert_eq!(frames.free_frames(), before - 2);

        manager.destroy_directory(process, &mut frames).unwrap();
        assert_eq!(frames.free_frames(), before);
        assert!(manager.translate_in(kernel, sample).is_some());
    }

    #[test]
    fn test_process_writes_leave_kernel_tables_alone() {
        let (_backing, mut frames, mut manager) = setup();
        let kernel = manager
            .init_kernel_directory::<MockCpu>(MEMORY as u32, &mut frames)
            .unwrap();
        manager.switch_to::<MockCpu>(kernel);
        let a = manager.create_process_directory(&mut frames).unwrap();
        let b = manager.create_process_directory(&mut frames).unwrap();
        let before = frames.free_frames();

        let virt = VirtAddr::new(0x0090_0000);
        let original = manager.translate_in(kernel, virt);
        assert!(original.is_some());

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        manager
            .map_in::<MockCpu>(a, virt, PhysAddr::new(0x00A0_0000), flags, &mut frames)
            .unwrap();
        assert_eq!(
            manager.translate_in(a, virt),
            Some((PhysAddr::new(0x00A0_0000), flags))
        );
        assert_eq!(manager.translate_in(kernel, virt), original);
        assert_eq!(manager.translate_in(b, virt), original);
        assert_eq!(frames.free_frames(), before - 1);

        // same table, already private
        manager
            .unmap_in::<MockCpu>(a, VirtAddr::new(0x0090_1000), &mut frames)
            .unwrap();
        assert_eq!(frames.free_frames(), before - 1);

        let stack = VirtAddr::new(0x0040_1000);
        assert_eq!(
            manager.unmap_in::<MockCpu>(a, stack, &mut frames),
            Ok(PhysFrame::containing_address(PhysAddr::new(0x0040_1000)))
        );
        assert_eq!(manager.translate_in(a, stack), None);
        assert_eq!(
            manager.translate_in(kernel, stack),
            Some((
                PhysAddr::new(0x0040_1000),
                PageFlags::PRESENT | PageFlags::WRITABLE
            ))
        );
        assert!(manager.translate_in(b, stack).is_some());
        assert_eq!(frames.free_frames(), before - 2);

        // no frame for the copy: nothing changes
        let mut held = Vec::new();
        while let Some(frame) = frames.allocate() {
            held.push(frame);
        }
        assert_eq!(
            manager.unmap_in::<MockCpu>(b, stack, &mut frames),
            Err(MapError::FrameAllocationFailed)
        );
        assert!(manager.translate_in(b, stack).is_some());
        for frame in held {
            frames.free(frame).unwrap();
        }

        manager.destroy_directory(a, &mut frames).unwrap();
        assert_eq!(frames.free_frames(), before + 1);
        assert_eq!(manager.translate_in(kernel, virt), original);
        assert_eq!(manager.translate_in(b, stack), manager.translate_in(kernel, stack));
    }

    #[test]
    fn test_destroy_reports_first_error_and_frees_the_rest() {
        let (_backing, mut frames, mut manager) = setup();
        let dir = manager.create_directory(&mut frames).unwrap();
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        for virt in [0x1000_0000, 0x2000_0000] {
            manager
                .map_in::<MockCpu>(
                    dir,
                    VirtAddr::new(virt),
                    PhysAddr::new(0x0090_0000),
                    flags,
                    &mut frames,
                )
                .unwrap();
        }
        let before = frames.free_frames();

        // release the first table behind the manager's back
        let dir_table = unsafe { manager.phys.table_mut(dir.frame()) };
        let first = dir_table[VirtAddr::new(0x1000_0000).directory_index()]
            .frame()
            .unwrap();
        frames.free(first).unwrap();

        assert_eq!(
            manager.destroy_directory(dir, &mut frames),
            Err(FrameError::AlreadyFree)
        );
        // second table and the directory itself still came back
        assert_eq!(frames.free_frames(), before + 3);
    }

    #[test]
    fn test_switch_loads_directory() {
        let (_backing, mut frames, mut manager) = setup();
        let dir = manager.create_directory(&mut frames).unwrap();
        mock::clear_events();
        manager.switch_to::<MockCpu>(dir);
        assert_eq!(manager.current(), Some(dir));
        assert_eq!(mock::events(), [CpuEvent::LoadDirectory(dir.frame())]);
    }
}
