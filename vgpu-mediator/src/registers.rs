// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Register offsets and scoped hardware access.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::{
    bit_mask::{extract_bytes, insert_bytes, lower_32_bits, upper_32_bits},
    command::{AccessSize, Aperture},
    hardware::Hardware,
};

pub const PMC_BOOT_0: u64 = 0x0000;
pub const PRAMIN_BASE: u64 = 0x1700;
pub const BAR1_INSTANCE: u64 = 0x1704;
pub const BAR3_INSTANCE: u64 = 0x1714;
pub const FIFO_POLL_AREA: u64 = 0x2254;
pub const FIFO_PLAYLIST_ADDRESS: u64 = 0x2270;
pub const FIFO_PLAYLIST_COMMIT: u64 = 0x2274;
pub const FIFO_CHANNEL_BASE: u64 = 0x3000;
pub const FIFO_CHANNEL_STRIDE: u64 = 8;
pub const PTIMER_TIME_0: u64 = 0x9400;
pub const PTIMER_TIME_1: u64 = 0x9410;
pub const PBFB_PART_COUNT: u64 = 0x02_2438;
pub const PBFB_PART_MASK: u64 = 0x02_2554;
pub const PBFB_MEM_SIZE_0: u64 = 0x10_f20c;
pub const PBFB_MEM_SIZE_1: u64 = 0x11_020c;
pub const VM_FLUSH_VSPACE: u64 = 0x10_0cb8;
pub const VM_FLUSH_TRIGGER: u64 = 0x10_0cbc;
pub const PRAMIN_WINDOW: u64 = 0x70_0000;
pub const PRAMIN_WINDOW_SIZE: u64 = 0x10_0000;

/// Number of hardware channels on the device.
pub const CHANNELS: u32 = 128;
/// BAR1 bytes reserved per channel for its poll slot.
pub const POLL_SLOT_SIZE: u64 = 0x1000;

/// Instance register of physical channel `phys`.
pub const fn channel_instance(phys: u32) -> u64 {
    FIFO_CHANNEL_BASE + FIFO_CHANNEL_STRIDE * phys as u64
}

/// Control register of physical channel `phys`.
pub const fn channel_control(phys: u32) -> u64 {
    channel_instance(phys) + 4
}

bitflags! {
    /// Instance pointer as written to the channel and aperture bind
    /// registers: `address >> 12` in bits `[0, 28)` plus flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InstancePointer: u32 {
        const VALID = 1 << 31;
        const _ = !0;
    }
}

impl InstancePointer {
    pub const ADDRESS_MASK: u32 = 0x0fff_ffff;

    pub const fn address(self) -> u64 {
        ((self.bits() & Self::ADDRESS_MASK) as u64) << 12
    }

    /// Same flags, address bits replaced by `address`.
    pub const fn with_address(self, address: u64) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::ADDRESS_MASK) | ((address >> 12) as u32 & Self::ADDRESS_MASK),
        )
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelControl: u32 {
        const ENABLE = 1 << 0;
        const _ = !0;
    }
}

bitflags! {
    /// Poll area register: BAR1 `address >> 12` in bits `[0, 28)`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollArea: u32 {
        const VALID = 1 << 28;
        const _ = !0;
    }
}

impl PollArea {
    pub const fn address(self) -> u64 {
        ((self.bits() & 0x0fff_ffff) as u64) << 12
    }
}

/// Sparse dword register file with sub-dword access.
#[derive(Debug, Default)]
pub struct RegisterFile(BTreeMap<u64, u32>);

impl RegisterFile {
    pub fn read(&self, offset: u64, size: AccessSize) -> u32 {
        let word = self.read32(offset & !3);
        extract_bytes(word.into(), (offset & 3) as u32, size.bytes()) as u32
    }

    /// Merges the access into the containing dword and returns the result.
    pub fn write(&mut self, offset: u64, value: u32, size: AccessSize) -> u32 {
        let word = self.0.entry(offset & !3).or_insert(0);
        *word = insert_bytes(
            u64::from(*word),
            (offset & 3) as u32,
            size.bytes(),
            value.into(),
        ) as u32;
        *word
    }

    pub fn read32(&self, offset: u64) -> u32 {
        self.0.get(&offset).copied().unwrap_or(0)
    }
}

/// Scoped access to the hardware.
///
/// Only handed out by [`crate::device::DeviceState::registers`], so holding
/// one proves the device lock is held.
pub struct Accessor<'a> {
    hardware: &'a mut dyn Hardware,
}

impl<'a> Accessor<'a> {
    pub(crate) fn new(hardware: &'a mut dyn Hardware) -> Self {
        Self { hardware }
    }

    pub fn read32(&mut self, offset: u64) -> u32 {
        self.hardware
            .read(Aperture::General, offset, AccessSize::Dword)
    }

    pub fn write32(&mut self, offset: u64, value: u32) {
        self.hardware
            .write(Aperture::General, offset, value, AccessSize::Dword)
    }

    pub fn read(&mut self, aperture: Aperture, offset: u64, size: AccessSize) -> u32 {
        self.hardware.read(aperture, offset, size)
    }

    pub fn write(&mut self, aperture: Aperture, offset: u64, value: u32, size: AccessSize) {
        self.hardware.write(aperture, offset, value, size)
    }

    pub fn read_vram(&mut self, address: u64, size: AccessSize) -> u32 {
        self.hardware.read_vram(address, size)
    }

    pub fn write_vram(&mut self, address: u64, value: u32, size: AccessSize) {
        self.hardware.write_vram(address, value, size)
    }

    pub fn read_vram32(&mut self, address: u64) -> u32 {
        self.hardware.read_vram(address, AccessSize::Dword)
    }

    pub fn write_vram32(&mut self, address: u64, value: u32) {
        self.hardware.write_vram(address, value, AccessSize::Dword)
    }

    /// Low word first.
    pub fn read_vram64(&mut self, address: u64) -> u64 {
        let lo = self.read_vram32(address);
        let hi = self.read_vram32(address + 4);
        (u64::from(hi) << 32) | u64::from(lo)
    }

    /// Low word first.
    pub fn write_vram64(&mut self, address: u64, value: u64) {
        self.write_vram32(address, lower_32_bits(value));
        self.write_vram32(address + 4, upper_32_bits(value));
    }
}
