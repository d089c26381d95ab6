// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The shared physical device.
//!
//! One [`Device`] exists per physical GPU and is shared by every guest
//! context through an `Arc`. All hardware access, the virtual GPU id pool,
//! the BAR1 shadow and the scheduler live behind a single mutex; the guard
//! ([`DeviceState`]) is the only way to reach them.

use std::{
    io,
    sync::{Mutex, MutexGuard},
};

use log::{debug, info};
use thiserror::Error as ThisError;

use crate::{
    bar1::Bar1Shadow,
    hardware::Hardware,
    registers::{Accessor, CHANNELS, POLL_SLOT_SIZE},
    MediatorConfig,
};

pub type Result<T> = std::result::Result<T, Error>;

pub const PAGE_SIZE: u64 = 0x1000;
pub const BAR1_SIZE: u64 = 128 << 20;
/// Usable part of BAR3; the rest of the aperture is not decoded.
pub const BAR3_SIZE: u64 = 16 << 20;
/// Host VRAM reserved per virtual GPU for its two playlist slots.
pub const PLAYLIST_RESERVE: u64 = 2 * PAGE_SIZE;

#[derive(Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("All {0} virtual GPU ids are in use")]
    VirtIdsExhausted(u32),
    #[error("Virtual GPU id {0} is not in use")]
    UnknownVirtId(u32),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

/// A guest's slice of VRAM.
///
/// Guest physical addresses start at 0 and map linearly onto
/// `[base, base + size)` of host VRAM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VramArena {
    pub base: u64,
    pub size: u64,
}

impl VramArena {
    /// Host address of `[gphys, gphys + len)`, if the whole range lies in
    /// the arena.
    pub fn translate(&self, gphys: u64, len: u64) -> Option<u64> {
        let end = gphys.checked_add(len)?;
        (end <= self.size).then_some(self.base + gphys)
    }

    pub const fn contains(&self, host: u64) -> bool {
        host >= self.base && host < self.base + self.size
    }
}

/// Partitioning of host VRAM among virtual GPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VramLayout {
    vm_count: u32,
    guest_vram_size: u64,
}

impl VramLayout {
    pub const fn new(vm_count: u32, guest_vram_size: u64) -> Self {
        Self {
            vm_count,
            guest_vram_size,
        }
    }

    pub const fn vm_count(&self) -> u32 {
        self.vm_count
    }

    pub const fn arena(&self, id: u32) -> VramArena {
        VramArena {
            base: id as u64 * self.guest_vram_size,
            size: self.guest_vram_size,
        }
    }

    const fn reserved_base(&self) -> u64 {
        self.vm_count as u64 * self.guest_vram_size
    }

    pub const fn playlist_slots(&self, id: u32) -> [u64; 2] {
        let base = self.reserved_base() + id as u64 * PLAYLIST_RESERVE;
        [base, base + PAGE_SIZE]
    }

    /// VRAM the layout needs on the physical device.
    pub const fn total_size(&self) -> u64 {
        self.reserved_base() + self.vm_count as u64 * PLAYLIST_RESERVE
    }
}

/// Bounded pool of virtual GPU ids, lowest free id first.
#[derive(Debug)]
pub struct VirtIdPool {
    used: Vec<bool>,
}

impl VirtIdPool {
    pub fn new(count: u32) -> Self {
        Self {
            used: vec![false; count as usize],
        }
    }

    pub fn acquire(&mut self) -> Result<u32> {
        let id = self
            .used
            .iter()
            .position(|used| !used)
            .ok_or(Error::VirtIdsExhausted(self.used.len() as u32))?;
        self.used[id] = true;
        Ok(id as u32)
    }

    pub fn release(&mut self, id: u32) -> Result<()> {
        match self.used.get_mut(id as usize) {
            Some(used) if *used => {
                *used = false;
                Ok(())
            }
            _ => Err(Error::UnknownVirtId(id)),
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|used| **used).count()
    }
}

/// Tracks which virtual GPU last submitted work to the hardware.
#[derive(Debug, Default)]
pub struct GpuScheduler {
    owner: Option<u32>,
    switches: u64,
}

impl GpuScheduler {
    /// Returns `true` if ownership moved to `id`.
    pub fn acquire(&mut self, id: u32) -> bool {
        if self.owner == Some(id) {
            return false;
        }
        debug!("GPU owner {:?} -> {id}", self.owner);
        self.owner = Some(id);
        self.switches += 1;
        true
    }

    pub fn release(&mut self, id: u32) {
        if self.owner == Some(id) {
            self.owner = None;
        }
    }

    pub const fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub const fn switches(&self) -> u64 {
        self.switches
    }
}

/// Everything guarded by the device lock.
pub struct DeviceState {
    hardware: Box<dyn Hardware>,
    ids: VirtIdPool,
    bar1: Bar1Shadow,
    scheduler: GpuScheduler,
}

impl DeviceState {
    pub fn registers(&mut self) -> Accessor<'_> {
        Accessor::new(self.hardware.as_mut())
    }

    pub fn bar1(&mut self) -> &mut Bar1Shadow {
        &mut self.bar1
    }

    pub const fn scheduler(&self) -> &GpuScheduler {
        &self.scheduler
    }

    /// Scheduling hook run at every playlist commit.
    pub fn try_acquire_gpu(&mut self, id: u32) -> bool {
        self.scheduler.acquire(id)
    }

    pub fn virt_ids_in_use(&self) -> usize {
        self.ids.in_use()
    }
}

pub struct Device {
    layout: VramLayout,
    guest_channels: u32,
    bar1_arena_size: u64,
    bar3_arena_size: u64,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(config: &MediatorConfig, hardware: Box<dyn Hardware>) -> Self {
        let vm_count = config.vm_count();
        let poll_size = u64::from(CHANNELS) * POLL_SLOT_SIZE;
        let bar1_arena_size = ((BAR1_SIZE - poll_size) / u64::from(vm_count)) & !(PAGE_SIZE - 1);
        let bar3_arena_size = (BAR3_SIZE / u64::from(vm_count)) & !(PAGE_SIZE - 1);
        info!(
            "Device: {vm_count} virtual GPUs, {} MiB VRAM and {} channels each",
            config.guest_vram_size() >> 20,
            CHANNELS / vm_count
        );

        Self {
            layout: VramLayout::new(vm_count, config.guest_vram_size()),
            guest_channels: CHANNELS / vm_count,
            bar1_arena_size,
            bar3_arena_size,
            state: Mutex::new(DeviceState {
                hardware,
                ids: VirtIdPool::new(vm_count),
                bar1: Bar1Shadow::default(),
                scheduler: GpuScheduler::default(),
            }),
        }
    }

    /// Takes the device lock.
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub const fn layout(&self) -> &VramLayout {
        &self.layout
    }

    pub const fn guest_channels(&self) -> u32 {
        self.guest_channels
    }

    pub const fn bar1_arena_size(&self) -> u64 {
        self.bar1_arena_size
    }

    pub const fn bar3_arena_size(&self) -> u64 {
        self.bar3_arena_size
    }

    /// First physical channel backing virtual GPU `id`.
    pub const fn first_channel(&self, id: u32) -> u32 {
        id * self.guest_channels
    }

    pub fn acquire_virt(&self) -> Result<u32> {
        let id = self.lock().ids.acquire()?;
        info!("Acquired virtual GPU id {id}");
        Ok(id)
    }

    pub fn release_virt(&self, id: u32) -> Result<()> {
        let mut state = self.lock();
        state.ids.release(id)?;
        state.bar1.clear(id);
        state.scheduler.release(id);
        info!("Released virtual GPU id {id}");
        Ok(())
    }
}
