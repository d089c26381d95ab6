// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Shadow of the guest's channel run list.
//!
//! The guest hands the hardware a list of 8-byte entries whose first word
//! is a channel index. Before it reaches the hardware the list is rebuilt
//! in host VRAM: only enabled guest channels survive, each once, in
//! ascending order, renamed to their physical channel.

use std::collections::BTreeSet;

use log::debug;

use crate::{channel::Channel, registers::Accessor};

pub const ENTRY_SIZE: u64 = 8;
/// Second word of every entry written to the hardware.
pub const ENTRY_FLAGS: u32 = 0x4;

/// Double-buffered host copy of a guest playlist.
#[derive(Debug)]
pub struct Playlist {
    slots: [u64; 2],
    next: usize,
    entries: Vec<u32>,
}

impl Playlist {
    pub const fn new(slots: [u64; 2]) -> Self {
        Self {
            slots,
            next: 0,
            entries: Vec::new(),
        }
    }

    /// Rebuilds the shadow from `count` guest entries at host `address`.
    ///
    /// Returns the host address of the shadow and its entry count. The slot
    /// last handed to the hardware is never written.
    pub fn update(
        &mut self,
        regs: &mut Accessor,
        channels: &[Channel],
        first_channel: u32,
        address: u64,
        count: u32,
    ) -> (u64, u32) {
        let mut selected = BTreeSet::new();
        for i in 0..u64::from(count) {
            let index = regs.read_vram32(address + i * ENTRY_SIZE);
            match channels.get(index as usize) {
                Some(channel) if channel.enabled() => {
                    selected.insert(index);
                }
                _ => debug!("playlist: dropping channel {index}"),
            }
        }

        let shadow = self.slots[self.next];
        self.next ^= 1;
        for (i, index) in selected.iter().enumerate() {
            let entry = shadow + i as u64 * ENTRY_SIZE;
            regs.write_vram32(entry, first_channel + index);
            regs.write_vram32(entry + 4, ENTRY_FLAGS);
        }
        self.entries = selected.into_iter().collect();

        (shadow, self.entries.len() as u32)
    }

    /// Guest channel indices of the last shadow built.
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Channel ids of a playlist as stored in VRAM.
    pub fn decode(regs: &mut Accessor, address: u64, count: u32) -> Vec<u32> {
        (0..u64::from(count))
            .map(|i| regs.read_vram32(address + i * ENTRY_SIZE))
            .collect()
    }
}
