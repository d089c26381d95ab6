// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Physical GPU reached through its sysfs PCI resources.
//!
//! `resource0`, `resource1` and `resource3` of the device directory are
//! mapped shared. VRAM is not mapped directly: it is reached through the
//! PRAMIN window of BAR0, whose 64 KiB aligned base lives in register
//! `0x1700`.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use log::{info, warn};
use vm_memory::{ByteValued, FileOffset, MmapRegion, VolatileMemory};

use super::{Error, Hardware, Result};
use crate::{
    bit_mask::BitField,
    command::{AccessSize, Aperture},
    registers::{PRAMIN_BASE, PRAMIN_WINDOW},
};

#[derive(Debug)]
struct Resource {
    region: MmapRegion,
    path: PathBuf,
}

impl Resource {
    fn map(dir: &Path, index: u32) -> Result<Self> {
        let path = dir.join(format!("resource{index}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::OpenResource(path.clone(), e))?;
        let size = resource_size(&file, &path)?;
        let region = MmapRegion::<()>::from_file(FileOffset::new(file, 0), size)
            .map_err(|e| Error::MapResource(path.clone(), e.to_string()))?;
        info!("Mapped {} ({} KiB)", path.display(), size >> 10);

        Ok(Self { region, path })
    }

    fn load<T: ByteValued>(&self, offset: u64) -> Option<T> {
        match self.region.get_ref::<T>(offset as usize) {
            Ok(r) => Some(r.load()),
            Err(e) => {
                warn!("{}: read at {offset:#x} failed: {e}", self.path.display());
                None
            }
        }
    }

    fn store<T: ByteValued>(&self, offset: u64, value: T) {
        match self.region.get_ref::<T>(offset as usize) {
            Ok(r) => r.store(value),
            Err(e) => warn!("{}: write at {offset:#x} failed: {e}", self.path.display()),
        }
    }

    fn read(&self, offset: u64, size: AccessSize) -> u32 {
        let value = match size {
            AccessSize::Byte => self.load::<u8>(offset).map(u32::from),
            AccessSize::Word => self.load::<u16>(offset).map(u32::from),
            AccessSize::Dword => self.load::<u32>(offset),
        };
        value.unwrap_or(0)
    }

    fn write(&self, offset: u64, value: u32, size: AccessSize) {
        match size {
            AccessSize::Byte => self.store(offset, value as u8),
            AccessSize::Word => self.store(offset, value as u16),
            AccessSize::Dword => self.store(offset, value),
        }
    }
}

fn resource_size(file: &File, path: &Path) -> Result<usize> {
    let len = file
        .metadata()
        .map_err(|e| Error::OpenResource(path.to_path_buf(), e))?
        .len();
    Ok(len as usize)
}

#[derive(Debug)]
pub struct PciGpu {
    bar0: Resource,
    bar1: Resource,
    bar3: Resource,
}

impl PciGpu {
    /// Maps the BARs of the PCI device whose sysfs directory is `dir`
    /// (e.g. `/sys/bus/pci/devices/0000:01:00.0`).
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            bar0: Resource::map(dir, 0)?,
            bar1: Resource::map(dir, 1)?,
            bar3: Resource::map(dir, 3)?,
        })
    }

    fn resource(&self, aperture: Aperture) -> &Resource {
        match aperture {
            Aperture::General => &self.bar0,
            Aperture::Vram => &self.bar1,
            Aperture::Instance => &self.bar3,
        }
    }

    /// Points the PRAMIN window at `address`, runs `f` with the offset of
    /// `address` inside BAR0, then restores the previous window base.
    fn with_pramin<T>(&self, address: u64, f: impl FnOnce(&Resource, u64) -> T) -> T {
        let saved = self.bar0.read(PRAMIN_BASE, AccessSize::Dword);
        self.bar0
            .write(PRAMIN_BASE, (address >> 16) as u32, AccessSize::Dword);
        let result = f(&self.bar0, PRAMIN_WINDOW + address.bit_mask::<16>());
        self.bar0.write(PRAMIN_BASE, saved, AccessSize::Dword);
        result
    }
}

impl Hardware for PciGpu {
    fn read(&mut self, aperture: Aperture, offset: u64, size: AccessSize) -> u32 {
        self.resource(aperture).read(offset, size)
    }

    fn write(&mut self, aperture: Aperture, offset: u64, value: u32, size: AccessSize) {
        self.resource(aperture).write(offset, value, size)
    }

    fn read_vram(&mut self, address: u64, size: AccessSize) -> u32 {
        self.with_pramin(address, |bar0, offset| bar0.read(offset, size))
    }

    fn write_vram(&mut self, address: u64, value: u32, size: AccessSize) {
        self.with_pramin(address, |bar0, offset| bar0.write(offset, value, size))
    }
}
