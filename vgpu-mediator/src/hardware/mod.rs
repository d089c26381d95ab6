// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Physical GPU backends.
//!
//! The mediator only needs two kinds of raw access: aperture reads/writes
//! (registers and BAR windows) and VRAM reads/writes by physical address.
//! Everything above this layer reaches a backend through
//! [`crate::registers::Accessor`], which can only be obtained while holding
//! the device lock.

pub mod emulated;
pub mod pci;

use std::{io, path::PathBuf};

use thiserror::Error as ThisError;

pub use self::{
    emulated::{EmulatedGpu, RegisterWrite, WriteLog},
    pci::PciGpu,
};
use crate::{
    command::{AccessSize, Aperture},
    HardwareKind, MediatorConfig,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to allocate emulated VRAM: {0}")]
    VramAllocation(String),
    #[error("Failed to open {0}: {1}")]
    OpenResource(PathBuf, io::Error),
    #[error("Failed to map {0}: {1}")]
    MapResource(PathBuf, String),
    #[error("PCI backend selected but no device path configured")]
    MissingPciDevice,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Hardware: Send {
    /// Reads `size` bytes at `offset` inside `aperture`.
    fn read(&mut self, aperture: Aperture, offset: u64, size: AccessSize) -> u32;

    /// Writes the low `size` bytes of `value` at `offset` inside `aperture`.
    fn write(&mut self, aperture: Aperture, offset: u64, value: u32, size: AccessSize);

    /// Reads `size` bytes of VRAM at physical `address`.
    fn read_vram(&mut self, address: u64, size: AccessSize) -> u32;

    /// Writes the low `size` bytes of `value` to VRAM at physical `address`.
    fn write_vram(&mut self, address: u64, value: u32, size: AccessSize);
}

/// Opens the backend selected by `config`.
pub fn open(config: &MediatorConfig) -> Result<Box<dyn Hardware>> {
    match config.hardware() {
        HardwareKind::Emulated => Ok(Box::new(EmulatedGpu::new(config.vram_size())?)),
        HardwareKind::Pci => {
            let path = config.pci_device().ok_or(Error::MissingPciDevice)?;
            Ok(Box::new(PciGpu::open(path)?))
        }
    }
}
