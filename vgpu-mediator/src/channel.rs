// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

/// Index of a shadow page table in its context's table arena.
pub type TableId = usize;

/// Pseudo-channel standing for the BAR1 (VRAM) aperture.
pub const BAR1_CHANNEL: i32 = -1;
/// Pseudo-channel standing for the BAR3 (instance) aperture.
pub const BAR3_CHANNEL: i32 = -3;

/// A guest-visible execution channel, or one of the two aperture
/// pseudo-channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    index: i32,
    enabled: bool,
    table: TableId,
    instance: Option<u64>,
}

impl Channel {
    pub const fn new(index: i32, table: TableId) -> Self {
        Self {
            index,
            enabled: false,
            table,
            instance: None,
        }
    }

    pub const fn index(&self) -> i32 {
        self.index
    }

    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub const fn table(&self) -> TableId {
        self.table
    }

    /// Host address of the bound instance block.
    pub const fn instance(&self) -> Option<u64> {
        self.instance
    }

    pub fn bind(&mut self, instance: Option<u64>) {
        self.instance = instance;
    }
}
