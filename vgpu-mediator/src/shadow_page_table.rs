// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Shadow of a guest GPU address space.
//!
//! The page directory holds one 8-byte entry per 128 MiB of virtual address
//! space. Its low word points at a large-page table (1024 entries of
//! 128 KiB pages), its high word at a small-page table (32768 entries of
//! 4 KiB pages). In both words bits `[0, 2)` select the target memory and
//! bits `[4, 32)` hold `address >> 12`.
//!
//! Page table entries carry a present bit and `address >> 12` in bits
//! `[4, 32)` of the low word and the target in bits `[0, 3)` of the high
//! word. Only VRAM pages lying entirely inside the guest's arena are
//! accepted; everything else is written back to memory as non-present.
//!
//! An instance block points at its page directory at `0x200` and bounds the
//! address space with the VM limit at `0x208`. A directory is always one
//! page, so the limit is clamped to the space one page of entries covers.

use std::{collections::BTreeMap, mem, ops::Range};

use log::debug;

use crate::{
    barrier::{pages_spanning, BarrierTable, PageRole, ENTRIES_PER_PAGE, ENTRY_SIZE, PAGE_SIZE},
    bit_mask::{lower_32_bits, upper_32_bits, BitField},
    device::VramArena,
    registers::Accessor,
};

pub const ADDRESS_SHIFT: u32 = 12;
pub const DIRECTORY_SPAN_SHIFT: u32 = 27;
pub const SMALL_PAGE_SIZE: u64 = 1 << 12;
pub const LARGE_PAGE_SIZE: u64 = 1 << 17;
pub const SMALL_TABLE_ENTRIES: u64 = 1 << (DIRECTORY_SPAN_SHIFT - 12);
pub const LARGE_TABLE_ENTRIES: u64 = 1 << (DIRECTORY_SPAN_SHIFT - 17);

/// Offset of the page directory pointer inside an instance block.
pub const INSTANCE_PAGE_DIRECTORY: u64 = 0x200;
/// Offset of the VM limit inside an instance block.
pub const INSTANCE_VM_LIMIT: u64 = 0x208;
pub const MAX_VM_LIMIT: u64 = ((ENTRIES_PER_PAGE as u64) << DIRECTORY_SPAN_SHIFT) - 1;

const TARGET_VRAM: u32 = 1;

/// Host page tables referenced by one directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Directory {
    pub small: Option<u64>,
    pub large: Option<u64>,
}

const fn word_address(word: u32) -> u64 {
    ((word >> 4) as u64) << 12
}

fn translate_directory_word(word: u32, arena: &VramArena, table_len: u64) -> Option<(u32, u64)> {
    if word.bit_mask::<2>() != TARGET_VRAM {
        return None;
    }
    let host = arena.translate(word_address(word), table_len)?;
    Some((word.bit_mask::<4>() | (host >> 8) as u32, host))
}

/// Translates both halves of a directory entry; an invalid half becomes 0.
pub fn translate_pde(raw: u64, arena: &VramArena) -> (u64, Directory) {
    let large = translate_directory_word(
        lower_32_bits(raw),
        arena,
        LARGE_TABLE_ENTRIES * ENTRY_SIZE,
    );
    let small = translate_directory_word(
        upper_32_bits(raw),
        arena,
        SMALL_TABLE_ENTRIES * ENTRY_SIZE,
    );
    let entry = (u64::from(small.map_or(0, |s| s.0)) << 32) | u64::from(large.map_or(0, |l| l.0));

    (
        entry,
        Directory {
            small: small.map(|s| s.1),
            large: large.map(|l| l.1),
        },
    )
}

/// Translates a page table entry mapping pages of `page_size` bytes.
pub fn translate_pte(raw: u64, arena: &VramArena, page_size: u64) -> Option<u64> {
    let lo = lower_32_bits(raw);
    let hi = upper_32_bits(raw);
    if lo & 1 == 0 || hi.bit_mask::<3>() != 0 {
        return None;
    }
    let guest = word_address(lo);
    if guest & (page_size - 1) != 0 {
        return None;
    }
    let host = arena.translate(guest, page_size)?;
    Some((u64::from(hi) << 32) | u64::from(lo.bit_mask::<4>() | (host >> 8) as u32))
}

/// Translates the page directory pointer of an instance block. A null
/// pointer means the instance has no address space yet.
pub fn translate_instance_pd(raw: u64, arena: &VramArena) -> Option<u64> {
    if raw == 0 {
        return None;
    }
    let host = arena.translate(raw.bit_clear::<12>(), ENTRY_SIZE)?;
    Some(host | raw.bit_mask::<12>())
}

/// Hardware form of the raw entry at `offset` of a page used as `role`.
/// Pointers to other shadowed pages yield `None`: their owner writes them
/// once the target page is adopted.
pub fn sanitize_entry(role: PageRole, offset: u64, raw: u64, arena: &VramArena) -> Option<u64> {
    match role {
        PageRole::Table(page_size) => Some(translate_pte(raw, arena, page_size).unwrap_or(0)),
        PageRole::Directory => None,
        PageRole::Instance => match offset {
            INSTANCE_PAGE_DIRECTORY => None,
            INSTANCE_VM_LIMIT => Some(raw.min(MAX_VM_LIMIT)),
            _ => Some(raw),
        },
    }
}

/// Host address a translated entry points at.
pub const fn entry_address(entry: u64) -> u64 {
    word_address(entry as u32)
}

#[derive(Debug)]
pub struct ShadowPageTable {
    size: u64,
    page_directory: Option<u64>,
    directories: Vec<Directory>,
    pages: Vec<u64>,
    mirror: BTreeMap<u64, u64>,
}

impl ShadowPageTable {
    /// Shadows `size` bytes of virtual address space.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            page_directory: None,
            directories: Vec::new(),
            pages: Vec::new(),
            mirror: BTreeMap::new(),
        }
    }

    pub const fn page_directory_address(&self) -> Option<u64> {
        self.page_directory
    }

    pub fn directory_range(&self) -> Option<Range<u64>> {
        self.page_directory.map(|pd| pd..pd + PAGE_SIZE)
    }

    pub fn directories(&self) -> &[Directory] {
        &self.directories
    }

    /// Whether `page` is one of the barrier pages this table holds.
    pub fn holds(&self, page: u64) -> bool {
        self.pages.contains(&page)
    }

    /// Host location of each valid entry mapped to its translated value.
    pub const fn mirror(&self) -> &BTreeMap<u64, u64> {
        &self.mirror
    }

    /// Re-walks the guest page directory at host address `pd` and every
    /// table it references, rewriting each directory entry in host form.
    /// Returns `false` if the directory could not be shadowed, in which case
    /// nothing may point at it.
    pub fn refresh_page_directories(
        &mut self,
        arena: &VramArena,
        barrier: &mut BarrierTable,
        regs: &mut Accessor,
        pd: u64,
    ) -> bool {
        let previous = mem::take(&mut self.pages);
        self.page_directory = Some(pd);
        self.directories.clear();
        self.mirror.clear();

        let shadowed = if !(arena.contains(pd) && arena.contains(pd + PAGE_SIZE - 1)) {
            debug!("page directory {pd:#x} outside the arena");
            false
        } else if !self.adopt(barrier, regs, pd, PAGE_SIZE, PageRole::Directory) {
            debug!("page directory {pd:#x} already shadowed in another role");
            false
        } else {
            for location in (pd..pd + PAGE_SIZE).step_by(ENTRY_SIZE as usize) {
                let raw = barrier.raw(location).unwrap_or(0);
                let (entry, mut directory) = translate_pde(raw, arena);
                let mut mask = 0;
                if let Some(table) = directory.large {
                    if self.walk_table(arena, barrier, regs, table, LARGE_TABLE_ENTRIES, LARGE_PAGE_SIZE) {
                        mask |= u64::from(u32::MAX);
                    } else {
                        directory.large = None;
                    }
                }
                if let Some(table) = directory.small {
                    if self.walk_table(arena, barrier, regs, table, SMALL_TABLE_ENTRIES, SMALL_PAGE_SIZE) {
                        mask |= u64::from(u32::MAX) << 32;
                    } else {
                        directory.small = None;
                    }
                }
                if regs.read_vram64(location) != entry & mask {
                    regs.write_vram64(location, entry & mask);
                }
                self.directories.push(directory);
            }
            true
        };

        for page in previous {
            barrier.release(regs, page);
        }
        shadowed
    }

    /// Adopts every page of `[start, start + len)` as `role`, or none.
    fn adopt(
        &mut self,
        barrier: &mut BarrierTable,
        regs: &mut Accessor,
        start: u64,
        len: u64,
        role: PageRole,
    ) -> bool {
        let pages: Vec<u64> = pages_spanning(start, len).collect();
        for (i, page) in pages.iter().enumerate() {
            if !barrier.adopt(regs, *page, role) {
                for taken in &pages[..i] {
                    barrier.release(regs, *taken);
                }
                return false;
            }
        }
        self.pages.extend(pages);
        true
    }

    fn walk_table(
        &mut self,
        arena: &VramArena,
        barrier: &mut BarrierTable,
        regs: &mut Accessor,
        table: u64,
        entries: u64,
        page_size: u64,
    ) -> bool {
        if !self.adopt(barrier, regs, table, entries * ENTRY_SIZE, PageRole::Table(page_size)) {
            debug!("page table {table:#x} already shadowed in another role");
            return false;
        }

        let mut rejected = 0;
        for location in (table..table + entries * ENTRY_SIZE).step_by(ENTRY_SIZE as usize) {
            let raw = barrier.raw(location).unwrap_or(0);
            if raw == 0 {
                continue;
            }
            match translate_pte(raw, arena, page_size) {
                Some(entry) => {
                    self.mirror.insert(location, entry);
                }
                None => rejected += 1,
            }
        }
        if rejected > 0 {
            debug!("page table {table:#x}: {rejected} entries not mapped");
        }
        true
    }

    /// Records a single translated entry after a guest write.
    pub fn update_entry(&mut self, location: u64, entry: Option<u64>) {
        match entry {
            Some(entry) => self.mirror.insert(location, entry),
            None => self.mirror.remove(&location),
        };
    }

    /// Drops the address space, releasing every held page.
    pub fn clear(&mut self, barrier: &mut BarrierTable, regs: &mut Accessor) {
        for page in mem::take(&mut self.pages) {
            barrier.release(regs, page);
        }
        self.page_directory = None;
        self.directories.clear();
        self.mirror.clear();
    }

    /// Host address backing virtual address `va`. Small pages shadow large
    /// ones.
    pub fn resolve(&self, va: u64) -> Option<u64> {
        if va >= self.size {
            return None;
        }
        let directory = self.directories.get((va >> DIRECTORY_SPAN_SHIFT) as usize)?;
        let small = directory.small.and_then(|table| {
            let index = (va >> 12) & (SMALL_TABLE_ENTRIES - 1);
            self.mirror
                .get(&(table + index * ENTRY_SIZE))
                .map(|entry| entry_address(*entry) + (va & (SMALL_PAGE_SIZE - 1)))
        });
        small.or_else(|| {
            let table = directory.large?;
            let index = (va >> 17) & (LARGE_TABLE_ENTRIES - 1);
            self.mirror
                .get(&(table + index * ENTRY_SIZE))
                .map(|entry| entry_address(*entry) + (va & (LARGE_PAGE_SIZE - 1)))
        })
    }

    /// Every mapped 4 KiB page below `limit`, as `(va, host)` pairs.
    pub fn mappings(&self, limit: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        (0..limit.min(self.size))
            .step_by(SMALL_PAGE_SIZE as usize)
            .filter_map(|va| self.resolve(va).map(|host| (va, host)))
    }
}
