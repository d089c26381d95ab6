// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Guest command protocol.
//!
//! A command is one trapped guest access: an INIT carrying the guest domain
//! id, or a READ/WRITE of 1, 2 or 4 bytes at an offset inside one of the
//! three GPU apertures.

use std::fmt::{self, Display};

use thiserror::Error as ThisError;
use vm_memory::{ByteValued, Le32, Le64};

pub const TYPE_INIT: u32 = 0;
pub const TYPE_READ: u32 = 1;
pub const TYPE_WRITE: u32 = 2;

/// The three apertures a guest can program, keyed by PCI BAR index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Aperture {
    /// BAR0: general control registers.
    General,
    /// BAR1: VRAM window, remapped through the BAR1 virtual address space.
    Vram,
    /// BAR3: instance memory window.
    Instance,
}

impl Aperture {
    pub const fn bar(self) -> u32 {
        match self {
            Self::General => 0,
            Self::Vram => 1,
            Self::Instance => 3,
        }
    }

    pub const fn from_bar(bar: u32) -> Option<Self> {
        match bar {
            0 => Some(Self::General),
            1 => Some(Self::Vram),
            3 => Some(Self::Instance),
            _ => None,
        }
    }
}

impl Display for Aperture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BAR{}", self.bar())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessSize {
    Byte,
    Word,
    Dword,
}

impl AccessSize {
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    pub const fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            _ => None,
        }
    }
}

/// Wire layout of a command as carried by the transport.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RawCommand {
    pub kind: Le32,
    pub bar: Le32,
    pub offset: Le64,
    pub value: Le32,
    pub size: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for RawCommand {}

#[derive(Debug, PartialEq, Eq, ThisError)]
pub enum CommandDecodeError {
    #[error("Invalid command type {0}")]
    InvalidType(u32),
    #[error("Invalid aperture BAR{0}")]
    InvalidAperture(u32),
    #[error("Invalid access size {0}")]
    InvalidSize(u32),
    #[error("Access of {size} bytes at {offset:#x} is not naturally aligned")]
    Misaligned { offset: u64, size: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Init {
        domid: u32,
    },
    Read {
        aperture: Aperture,
        offset: u64,
        size: AccessSize,
    },
    Write {
        aperture: Aperture,
        offset: u64,
        value: u32,
        size: AccessSize,
    },
}

impl Command {
    pub fn decode(raw: &RawCommand) -> Result<Self, CommandDecodeError> {
        let kind = u32::from(raw.kind);
        if kind == TYPE_INIT {
            return Ok(Self::Init {
                domid: raw.value.into(),
            });
        }
        if kind != TYPE_READ && kind != TYPE_WRITE {
            return Err(CommandDecodeError::InvalidType(kind));
        }

        let bar = u32::from(raw.bar);
        let aperture = Aperture::from_bar(bar).ok_or(CommandDecodeError::InvalidAperture(bar))?;
        let bytes = u32::from(raw.size);
        let size = AccessSize::from_bytes(bytes).ok_or(CommandDecodeError::InvalidSize(bytes))?;
        let offset = u64::from(raw.offset);
        if offset % u64::from(bytes) != 0 {
            return Err(CommandDecodeError::Misaligned {
                offset,
                size: bytes,
            });
        }

        Ok(if kind == TYPE_READ {
            Self::Read {
                aperture,
                offset,
                size,
            }
        } else {
            Self::Write {
                aperture,
                offset,
                value: raw.value.into(),
                size,
            }
        })
    }

    pub fn encode(&self) -> RawCommand {
        match *self {
            Self::Init { domid } => RawCommand {
                kind: TYPE_INIT.into(),
                value: domid.into(),
                ..Default::default()
            },
            Self::Read {
                aperture,
                offset,
                size,
            } => RawCommand {
                kind: TYPE_READ.into(),
                bar: aperture.bar().into(),
                offset: offset.into(),
                value: 0.into(),
                size: size.bytes().into(),
            },
            Self::Write {
                aperture,
                offset,
                value,
                size,
            } => RawCommand {
                kind: TYPE_WRITE.into(),
                bar: aperture.bar().into(),
                offset: offset.into(),
                value: value.into(),
                size: size.bytes().into(),
            },
        }
    }

    pub const fn is_read(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use assert_matches::assert_matches;

    use super::*;

    fn raw(kind: u32, bar: u32, offset: u64, value: u32, size: u32) -> RawCommand {
        RawCommand {
            kind: kind.into(),
            bar: bar.into(),
            offset: offset.into(),
            value: value.into(),
            size: size.into(),
        }
    }

    #[test]
    fn test_raw_command_layout() {
        assert_eq!(size_of::<RawCommand>(), 24);
        let cmd = raw(TYPE_WRITE, 1, 0x1122_3344_5566_7788, 0xaabb_ccdd, 4);
        let bytes = cmd.as_slice();
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(
            &bytes[8..16],
            &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(&bytes[16..20], &[0xdd, 0xcc, 0xbb, 0xaa]);
    }

    #[test]
    fn test_decode_init_ignores_aperture_and_size() {
        let cmd = Command::decode(&raw(TYPE_INIT, 7, 0, 12, 0)).unwrap();
        assert_eq!(cmd, Command::Init { domid: 12 });
    }

    #[test]
    fn test_decode_read_write() {
        assert_eq!(
            Command::decode(&raw(TYPE_READ, 3, 0x40, 0, 2)).unwrap(),
            Command::Read {
                aperture: Aperture::Instance,
                offset: 0x40,
                size: AccessSize::Word,
            }
        );
        assert_eq!(
            Command::decode(&raw(TYPE_WRITE, 0, 0x2274, 0x01f0_0002, 4)).unwrap(),
            Command::Write {
                aperture: Aperture::General,
                offset: 0x2274,
                value: 0x01f0_0002,
                size: AccessSize::Dword,
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert_matches!(
            Command::decode(&raw(9, 0, 0, 0, 4)),
            Err(CommandDecodeError::InvalidType(9))
        );
        assert_matches!(
            Command::decode(&raw(TYPE_READ, 2, 0, 0, 4)),
            Err(CommandDecodeError::InvalidAperture(2))
        );
        assert_matches!(
            Command::decode(&raw(TYPE_WRITE, 0, 0, 0, 8)),
            Err(CommandDecodeError::InvalidSize(8))
        );
        assert_matches!(
            Command::decode(&raw(TYPE_READ, 1, 0x6, 0, 4)),
            Err(CommandDecodeError::Misaligned { offset: 6, size: 4 })
        );
    }

    #[test]
    fn test_encode_decode_agree() {
        let write = Command::Write {
            aperture: Aperture::Vram,
            offset: 0x1000,
            value: 0x55,
            size: AccessSize::Byte,
        };
        assert_eq!(Command::decode(&write.encode()).unwrap(), write);
        assert!(!write.is_read());
        assert!(Command::decode(&Command::Init { domid: 3 }.encode())
            .map(|c| !c.is_read())
            .unwrap());
    }
}
