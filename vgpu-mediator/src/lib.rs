// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod bar1;
pub mod barrier;
pub mod bit_mask;
pub mod channel;
pub mod command;
pub mod context;
pub mod device;
// Physical GPU backends
pub mod hardware;
pub mod playlist;
pub mod registers;
pub mod session;
pub mod shadow_page_table;
#[cfg(test)]
pub(crate) mod testutils;

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::ValueEnum;
use log::info;
use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::{
    device::{VramLayout, PLAYLIST_RESERVE},
    registers::CHANNELS,
};

pub const DEFAULT_VM_COUNT: u32 = 4;
pub const DEFAULT_GUEST_VRAM_SIZE: u64 = 512 << 20;
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vgpu-mediator.sock";

const MIB: u64 = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    /// Software model of the GPU, for testing
    Emulated,
    /// A physical GPU reached through its sysfs PCI resources
    Pci,
}

impl Display for HardwareKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emulated => write!(f, "emulated"),
            Self::Pci => write!(f, "pci"),
        }
    }
}

#[derive(Debug, Clone)]
/// This structure holds the configuration for the mediator
pub struct MediatorConfig {
    socket_path: PathBuf,
    hardware: HardwareKind,
    pci_device: Option<PathBuf>,
    vm_count: u32,
    guest_vram_size: u64,
    through: bool,
}

#[derive(Debug, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    #[error("The number of virtual GPUs must be between 1 and {CHANNELS}, got {0}")]
    InvalidVmCount(u32),
    #[error("Guest VRAM size {0:#x} must be a nonzero multiple of 1 MiB")]
    InvalidGuestVramSize(u64),
    #[error("The pci backend requires a device path")]
    MissingPciDevice,
}

impl MediatorConfig {
    /// Create a new instance of the `MediatorConfig` struct, containing the
    /// parameters to be fed into the mediator.
    pub fn new(
        socket_path: PathBuf,
        hardware: HardwareKind,
        pci_device: Option<PathBuf>,
        vm_count: u32,
        guest_vram_size: u64,
        through: bool,
    ) -> Result<Self, ConfigError> {
        if vm_count == 0 || vm_count > CHANNELS {
            return Err(ConfigError::InvalidVmCount(vm_count));
        }
        let total = guest_vram_size
            .checked_mul(u64::from(vm_count))
            .and_then(|arenas| arenas.checked_add(u64::from(vm_count) * PLAYLIST_RESERVE));
        if guest_vram_size == 0 || guest_vram_size % MIB != 0 || total.is_none() {
            return Err(ConfigError::InvalidGuestVramSize(guest_vram_size));
        }
        if hardware == HardwareKind::Pci && pci_device.is_none() {
            return Err(ConfigError::MissingPciDevice);
        }

        Ok(Self {
            socket_path,
            hardware,
            pci_device,
            vm_count,
            guest_vram_size,
            through,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub const fn hardware(&self) -> HardwareKind {
        self.hardware
    }

    pub fn pci_device(&self) -> Option<&Path> {
        self.pci_device.as_deref()
    }

    pub const fn vm_count(&self) -> u32 {
        self.vm_count
    }

    pub const fn guest_vram_size(&self) -> u64 {
        self.guest_vram_size
    }

    /// VRAM the physical device must provide for this layout.
    pub const fn vram_size(&self) -> u64 {
        VramLayout::new(self.vm_count, self.guest_vram_size).total_size()
    }

    /// Whether guest accesses bypass mediation.
    pub const fn through(&self) -> bool {
        self.through
    }
}

#[derive(Debug, ThisError)]
pub enum StartError {
    #[error("Could not open hardware: {0}")]
    OpenHardware(hardware::Error),
    #[error("Fatal error: {0}")]
    ServeFailed(session::Error),
}

pub fn start_mediator(config: &MediatorConfig) -> Result<(), StartError> {
    info!("Starting mediator with {} hardware", config.hardware());
    if config.through() {
        info!("Through mode: guest accesses are not mediated");
    }
    let hardware = hardware::open(config).map_err(StartError::OpenHardware)?;
    let device = Arc::new(device::Device::new(config, hardware));

    session::serve(config, device).map_err(StartError::ServeFailed)
}
