// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{convert::TryFrom, path::PathBuf, process::exit};

use clap::Parser;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use log::error;
use serde::Deserialize;
use thiserror::Error as ThisError;
use vgpu_mediator::{
    start_mediator, ConfigError, HardwareKind, MediatorConfig, DEFAULT_GUEST_VRAM_SIZE,
    DEFAULT_SOCKET_PATH, DEFAULT_VM_COUNT,
};

#[derive(Debug, ThisError)]
enum CliError {
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Config(ConfigError),
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct MediatorArgs {
    /// Unix socket the guest adapters connect to.
    #[arg(short, long, value_name = "SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,

    /// Which GPU backend to drive
    #[arg(long, value_enum, default_value_t = HardwareKind::Emulated)]
    hardware: HardwareKind,

    /// Sysfs directory of the physical GPU, e.g. /sys/bus/pci/devices/0000:01:00.0
    #[arg(long)]
    pci_device: Option<PathBuf>,

    /// Number of virtual GPUs the device is split into
    #[arg(long, default_value_t = DEFAULT_VM_COUNT)]
    vm_count: u32,

    /// VRAM given to each virtual GPU, in MiB
    #[arg(long, default_value_t = DEFAULT_GUEST_VRAM_SIZE >> 20)]
    guest_vram_mib: u64,

    /// Forward guest accesses to the hardware without mediation
    #[arg(long)]
    through: bool,

    /// Load from a given configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ConfigFile {
    socket_path: Option<PathBuf>,
    hardware: Option<HardwareKind>,
    pci_device: Option<PathBuf>,
    vm_count: Option<u32>,
    guest_vram_mib: Option<u64>,
    through: Option<bool>,
}

impl MediatorArgs {
    fn parse_config(&self) -> Result<ConfigFile, CliError> {
        match &self.config {
            Some(path) => Figment::new()
                .merge(Yaml::file(path))
                .extract::<ConfigFile>()
                .map_err(|e| CliError::ConfigParse(Box::new(e))),
            None => Ok(ConfigFile::default()),
        }
    }
}

impl TryFrom<MediatorArgs> for MediatorConfig {
    type Error = CliError;

    fn try_from(args: MediatorArgs) -> Result<Self, CliError> {
        // values from the configuration file win over the command line
        let file = args.parse_config()?;
        let guest_vram_mib = file.guest_vram_mib.unwrap_or(args.guest_vram_mib);

        Self::new(
            file.socket_path.unwrap_or(args.socket_path),
            file.hardware.unwrap_or(args.hardware),
            file.pci_device.or(args.pci_device),
            file.vm_count.unwrap_or(args.vm_count),
            guest_vram_mib.checked_mul(1 << 20).unwrap_or(0),
            file.through.unwrap_or(args.through),
        )
        .map_err(CliError::Config)
    }
}

fn main() {
    env_logger::init();

    let config = match MediatorConfig::try_from(MediatorArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    if let Err(e) = start_mediator(&config) {
        error!("{e}");
        exit(1);
    }
}
