// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Write-back store for guest pages the hardware interprets.
//!
//! While a VRAM page is in use as a page directory, page table or instance
//! block, real memory holds the sanitized (host) form of every entry and
//! the barrier holds the guest's raw form. Guests only ever see the raw
//! form. When the last user of a page releases it, the raw form is written
//! back.
//!
//! A page has exactly one role. Adopting it in a second role is refused, so
//! the hardware never interprets one page two ways.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    mem,
};

use log::trace;

use crate::{
    bit_mask::{extract_bytes, insert_bytes},
    command::AccessSize,
    device::VramArena,
    registers::Accessor,
    shadow_page_table::sanitize_entry,
};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const ENTRY_SIZE: u64 = 8;
pub const ENTRIES_PER_PAGE: usize = (PAGE_SIZE / ENTRY_SIZE) as usize;

/// What a barrier page is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageRole {
    Directory,
    /// Page table mapping pages of the given size.
    Table(u64),
    Instance,
}

#[derive(Debug)]
struct BarrierPage {
    role: PageRole,
    refcount: u32,
    raw: Vec<u64>,
}

/// 4 KiB aligned pages touched by `[start, start + len)`.
pub fn pages_spanning(start: u64, len: u64) -> impl Iterator<Item = u64> {
    let first = start & !(PAGE_SIZE - 1);
    let end = start + len.max(1);
    (first..end).step_by(PAGE_SIZE as usize)
}

const fn page_of(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

const fn index_of(address: u64) -> usize {
    ((address & (PAGE_SIZE - 1)) / ENTRY_SIZE) as usize
}

const fn offset_of(address: u64) -> u64 {
    address & (PAGE_SIZE - 1) & !(ENTRY_SIZE - 1)
}

#[derive(Debug, Default)]
pub struct BarrierTable {
    arena: VramArena,
    pages: BTreeMap<u64, BarrierPage>,
}

impl BarrierTable {
    /// Barrier for pages of a guest owning `arena`.
    pub fn new(arena: VramArena) -> Self {
        Self {
            arena,
            pages: BTreeMap::new(),
        }
    }

    /// Takes a reference on `page` as `role`. On first use the raw content
    /// is snapshotted and memory is rewritten in sanitized form, with every
    /// pointer entry cleared until its owner validates it. Returns `false`,
    /// taking no reference, if the page is already held in another role.
    pub fn adopt(&mut self, regs: &mut Accessor, page: u64, role: PageRole) -> bool {
        match self.pages.entry(page) {
            Entry::Occupied(entry) => {
                let entry = entry.into_mut();
                if entry.role != role {
                    trace!("barrier: {page:#x} is {:?}, refusing {role:?}", entry.role);
                    return false;
                }
                entry.refcount += 1;
            }
            Entry::Vacant(entry) => {
                let raw: Vec<u64> = (0..ENTRIES_PER_PAGE as u64)
                    .map(|i| regs.read_vram64(page + i * ENTRY_SIZE))
                    .collect();
                for (i, value) in raw.iter().enumerate() {
                    let offset = i as u64 * ENTRY_SIZE;
                    let sanitized = sanitize_entry(role, offset, *value, &self.arena).unwrap_or(0);
                    if sanitized != *value {
                        regs.write_vram64(page + offset, sanitized);
                    }
                }
                trace!("barrier: adopt {page:#x} as {role:?}");
                entry.insert(BarrierPage {
                    role,
                    refcount: 1,
                    raw,
                });
            }
        }
        true
    }

    /// Drops a reference on `page`; the last one writes the raw content
    /// back.
    pub fn release(&mut self, regs: &mut Accessor, page: u64) {
        let Some(entry) = self.pages.get_mut(&page) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount == 0 {
            if let Some(entry) = self.pages.remove(&page) {
                trace!("barrier: release {page:#x}");
                write_back(regs, page, &entry.raw);
            }
        }
    }

    /// Writes every page back regardless of its reference count.
    pub fn release_all(&mut self, regs: &mut Accessor) {
        for (page, entry) in mem::take(&mut self.pages) {
            write_back(regs, page, &entry.raw);
        }
    }

    pub fn role(&self, address: u64) -> Option<PageRole> {
        self.pages.get(&page_of(address)).map(|p| p.role)
    }

    pub fn refcount(&self, page: u64) -> u32 {
        self.pages.get(&page).map_or(0, |p| p.refcount)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Every held page with its role.
    #[cfg(test)]
    pub fn pages(&self) -> impl Iterator<Item = (u64, PageRole)> + '_ {
        self.pages.iter().map(|(page, entry)| (*page, entry.role))
    }

    /// Raw guest value of the entry containing `address`.
    pub fn raw(&self, address: u64) -> Option<u64> {
        self.pages
            .get(&page_of(address))
            .map(|p| p.raw[index_of(address)])
    }

    pub fn read(&self, address: u64, size: AccessSize) -> Option<u32> {
        let entry = self.raw(address)?;
        Some(extract_bytes(entry, (address & 7) as u32, size.bytes()) as u32)
    }

    /// Merges a guest write into the raw entry and returns the new raw
    /// entry. Memory receives the sanitized form, except for pointer
    /// entries, which are left for their owner to rewrite.
    pub fn write(
        &mut self,
        regs: &mut Accessor,
        address: u64,
        value: u32,
        size: AccessSize,
    ) -> Option<u64> {
        let page = self.pages.get_mut(&page_of(address))?;
        let entry = &mut page.raw[index_of(address)];
        *entry = insert_bytes(
            *entry,
            (address & 7) as u32,
            size.bytes(),
            value.into(),
        );
        let raw = *entry;
        if let Some(sanitized) = sanitize_entry(page.role, offset_of(address), raw, &self.arena) {
            regs.write_vram64(address & !(ENTRY_SIZE - 1), sanitized);
        }
        Some(raw)
    }
}

fn write_back(regs: &mut Accessor, page: u64, raw: &[u64]) {
    for (i, value) in raw.iter().enumerate() {
        regs.write_vram64(page + i as u64 * ENTRY_SIZE, *value);
    }
}
