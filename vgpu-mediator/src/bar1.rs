// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Host side of each guest's BAR1 arena.
//!
//! A guest reaches VRAM through BAR1 by mapping it in the BAR1 address space
//! it binds at `0x1704`. The device keeps one page map per virtual GPU,
//! rebuilt from the guest's BAR1 shadow table on request, and a translation
//! cache in front of it that behaves like the hardware TLB: it only forgets
//! entries when flushed.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::shadow_page_table::{ShadowPageTable, SMALL_PAGE_SIZE};

const PAGE_MASK: u64 = SMALL_PAGE_SIZE - 1;

#[derive(Debug, Default)]
pub struct Bar1Shadow {
    maps: HashMap<u32, BTreeMap<u64, u64>>,
    cache: HashMap<(u32, u64), u64>,
}

impl Bar1Shadow {
    /// Rebuilds the page map of virtual GPU `id` from the first `size` bytes
    /// of `table`.
    pub fn shadow(&mut self, id: u32, table: &ShadowPageTable, size: u64) {
        let map: BTreeMap<u64, u64> = table.mappings(size).collect();
        debug!("BAR1 arena of virtual GPU {id}: {} pages mapped", map.len());
        self.maps.insert(id, map);
    }

    pub fn flush(&mut self) {
        self.cache.clear();
    }

    /// Host VRAM address behind BAR1 `offset` of virtual GPU `id`.
    pub fn translate(&mut self, id: u32, offset: u64) -> Option<u64> {
        let page = offset & !PAGE_MASK;
        let host = match self.cache.get(&(id, page)) {
            Some(host) => *host,
            None => {
                let host = *self.maps.get(&id)?.get(&page)?;
                self.cache.insert((id, page), host);
                host
            }
        };
        Some(host + (offset & PAGE_MASK))
    }

    pub fn clear(&mut self, id: u32) {
        self.maps.remove(&id);
        self.cache.retain(|(owner, _), _| *owner != id);
    }
}
