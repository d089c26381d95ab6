// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Software model of the physical GPU.
//!
//! Registers and the two BAR windows are sparse dword files; VRAM is an
//! anonymous mapping that only consumes host memory for touched pages.
//! Every BAR0 write is appended to a [`WriteLog`] that can be inspected
//! after the backend has been handed to a [`crate::device::Device`].

use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::{Error, Hardware, Result};
use crate::{
    command::{AccessSize, Aperture},
    registers::RegisterFile,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterWrite {
    pub offset: u64,
    pub value: u32,
    pub size: AccessSize,
}

/// Shared record of the BAR0 writes reaching an [`EmulatedGpu`].
#[derive(Clone, Debug, Default)]
pub struct WriteLog(Arc<Mutex<Vec<RegisterWrite>>>);

impl WriteLog {
    fn entries(&self) -> MutexGuard<'_, Vec<RegisterWrite>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, write: RegisterWrite) {
        self.entries().push(write);
    }

    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.entries().clone()
    }

    /// Values written to `offset`, oldest first.
    pub fn values_at(&self, offset: u64) -> Vec<u32> {
        self.entries()
            .iter()
            .filter(|w| w.offset == offset)
            .map(|w| w.value)
            .collect()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

pub struct EmulatedGpu {
    registers: RegisterFile,
    bar1: RegisterFile,
    bar3: RegisterFile,
    vram: GuestMemoryMmap,
    log: WriteLog,
}

impl EmulatedGpu {
    pub fn new(vram_size: u64) -> Result<Self> {
        let vram = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), vram_size as usize)])
            .map_err(|e| Error::VramAllocation(e.to_string()))?;
        info!("Emulated GPU with {} MiB of VRAM", vram_size >> 20);

        Ok(Self {
            registers: RegisterFile::default(),
            bar1: RegisterFile::default(),
            bar3: RegisterFile::default(),
            vram,
            log: WriteLog::default(),
        })
    }

    pub fn write_log(&self) -> WriteLog {
        self.log.clone()
    }

    fn window(&mut self, aperture: Aperture) -> &mut RegisterFile {
        match aperture {
            Aperture::General => &mut self.registers,
            Aperture::Vram => &mut self.bar1,
            Aperture::Instance => &mut self.bar3,
        }
    }
}

impl Hardware for EmulatedGpu {
    fn read(&mut self, aperture: Aperture, offset: u64, size: AccessSize) -> u32 {
        self.window(aperture).read(offset, size)
    }

    fn write(&mut self, aperture: Aperture, offset: u64, value: u32, size: AccessSize) {
        if aperture == Aperture::General {
            self.log.push(RegisterWrite {
                offset,
                value,
                size,
            });
        }
        self.window(aperture).write(offset, value, size);
    }

    fn read_vram(&mut self, address: u64, size: AccessSize) -> u32 {
        let addr = GuestAddress(address);
        let value = match size {
            AccessSize::Byte => self.vram.read_obj::<u8>(addr).map(u32::from),
            AccessSize::Word => self.vram.read_obj::<u16>(addr).map(u32::from),
            AccessSize::Dword => self.vram.read_obj::<u32>(addr),
        };
        value.unwrap_or_else(|e| {
            warn!("VRAM read at {address:#x} failed: {e}");
            0
        })
    }

    fn write_vram(&mut self, address: u64, value: u32, size: AccessSize) {
        let addr = GuestAddress(address);
        let result = match size {
            AccessSize::Byte => self.vram.write_obj(value as u8, addr),
            AccessSize::Word => self.vram.write_obj(value as u16, addr),
            AccessSize::Dword => self.vram.write_obj(value, addr),
        };
        if let Err(e) = result {
            warn!("VRAM write at {address:#x} failed: {e}");
        }
    }
}
