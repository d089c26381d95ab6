// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{path::PathBuf, sync::Arc};

use crate::{
    barrier::{BarrierTable, PageRole, ENTRY_SIZE, PAGE_SIZE},
    bit_mask::{lower_32_bits, upper_32_bits, BitField},
    command::{AccessSize, Aperture, Command},
    context::Context,
    device::{Device, VramArena},
    hardware::{EmulatedGpu, WriteLog},
    registers::Accessor,
    shadow_page_table::{entry_address, INSTANCE_PAGE_DIRECTORY, INSTANCE_VM_LIMIT, MAX_VM_LIMIT},
    HardwareKind, MediatorConfig,
};

/// VRAM arena of every test guest.
pub const GUEST_VRAM: u64 = 16 << 20;

pub fn test_config(vm_count: u32) -> MediatorConfig {
    MediatorConfig::new(
        PathBuf::from("/tmp/vgpu-mediator-test.sock"),
        HardwareKind::Emulated,
        None,
        vm_count,
        GUEST_VRAM,
        false,
    )
    .unwrap()
}

pub fn emulated_device(config: &MediatorConfig) -> Arc<Device> {
    emulated_device_with_log(config).0
}

pub fn emulated_device_with_log(config: &MediatorConfig) -> (Arc<Device>, WriteLog) {
    let gpu = EmulatedGpu::new(config.vram_size()).unwrap();
    let log = gpu.write_log();
    (Arc::new(Device::new(config, Box::new(gpu))), log)
}

fn directory_word(address: Option<u64>) -> u64 {
    address.map_or(0, |a| ((a >> 12) << 4) | 1)
}

/// Guest page directory entry pointing at VRAM page tables.
pub fn pde(small: Option<u64>, large: Option<u64>) -> u64 {
    (directory_word(small) << 32) | directory_word(large)
}

/// Present guest page table entry mapping VRAM address `gaddr`.
pub fn pte(gaddr: u64) -> u64 {
    ((gaddr >> 12) << 4) | 1
}

/// Dword write command.
pub fn write(aperture: Aperture, offset: u64, value: u32) -> Command {
    Command::Write {
        aperture,
        offset,
        value,
        size: AccessSize::Dword,
    }
}

/// Issues a dword read on `context` and returns the result.
pub fn read(context: &mut Context, aperture: Aperture, offset: u64) -> u32 {
    context.handle(&Command::Read {
        aperture,
        offset,
        size: AccessSize::Dword,
    });
    context.result()
}

/// Checks every entry the hardware can read on a barrier page. Present page
/// table entries map VRAM inside `arena`, directory words point at shadowed
/// page tables, and instance blocks point at a shadowed directory.
pub fn assert_isolated(regs: &mut Accessor, barrier: &BarrierTable, arena: &VramArena) {
    let pages: Vec<(u64, PageRole)> = barrier.pages().collect();
    for (page, role) in pages {
        for offset in (0..PAGE_SIZE).step_by(ENTRY_SIZE as usize) {
            let location = page + offset;
            let value = regs.read_vram64(location);
            match role {
                PageRole::Table(page_size) => {
                    let target = entry_address(value);
                    assert!(
                        value == 0
                            || (upper_32_bits(value).bit_mask::<3>() == 0
                                && arena.contains(target)
                                && arena.contains(target + page_size - 1)),
                        "page table entry {location:#x} = {value:#x}"
                    );
                }
                PageRole::Directory => {
                    for word in [lower_32_bits(value), upper_32_bits(value)] {
                        let target = entry_address(u64::from(word));
                        assert!(
                            word == 0
                                || (arena.contains(target)
                                    && matches!(barrier.role(target), Some(PageRole::Table(_)))),
                            "directory entry {location:#x} = {value:#x}"
                        );
                    }
                }
                PageRole::Instance if offset == INSTANCE_PAGE_DIRECTORY => {
                    assert!(
                        value == 0 || barrier.role(value.bit_clear::<12>()) == Some(PageRole::Directory),
                        "instance {page:#x} page directory = {value:#x}"
                    );
                }
                PageRole::Instance if offset == INSTANCE_VM_LIMIT => {
                    assert!(value <= MAX_VM_LIMIT, "instance {page:#x} VM limit = {value:#x}");
                }
                PageRole::Instance => {}
            }
        }
    }
}
