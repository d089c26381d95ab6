// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Fixed-width bit-field helpers.
//!
//! Guest register writes pack addresses, counts and flags into 32-bit
//! words. These helpers are the only place where masks are built, so every
//! decoder in the crate agrees on what "the low 28 bits" means.

/// Bit-range extraction over unsigned register words.
///
/// `N` must not exceed the width of the implementing type.
pub trait BitField: Copy {
    /// Keeps the low `N` bits and clears everything above them.
    fn bit_mask<const N: u32>(self) -> Self;

    /// Clears the low `N` bits and keeps everything above them.
    fn bit_clear<const N: u32>(self) -> Self;

    /// Extracts the `N`-bit field starting at bit `SHIFT`.
    fn bit_field<const SHIFT: u32, const N: u32>(self) -> Self;
}

macro_rules! impl_bit_field {
    ($($t:ty),*) => {$(
        impl BitField for $t {
            #[inline]
            fn bit_mask<const N: u32>(self) -> Self {
                self & <$t>::MAX.checked_shr(<$t>::BITS - N).unwrap_or(0)
            }

            #[inline]
            fn bit_clear<const N: u32>(self) -> Self {
                self & !<$t>::MAX.checked_shr(<$t>::BITS - N).unwrap_or(0)
            }

            #[inline]
            fn bit_field<const SHIFT: u32, const N: u32>(self) -> Self {
                self.checked_shr(SHIFT).unwrap_or(0).bit_mask::<N>()
            }
        }
    )*};
}

impl_bit_field!(u32, u64);

#[inline]
pub const fn lower_32_bits(value: u64) -> u32 {
    value as u32
}

#[inline]
pub const fn upper_32_bits(value: u64) -> u32 {
    (value >> 32) as u32
}

#[inline]
const fn byte_mask(size: u32) -> u64 {
    match u64::MAX.checked_shr(64 - size * 8) {
        Some(mask) => mask,
        None => 0,
    }
}

/// Reads `size` bytes of `word` starting at byte `offset`.
///
/// `offset + size` must not exceed 8.
#[inline]
pub const fn extract_bytes(word: u64, offset: u32, size: u32) -> u64 {
    (word >> (offset * 8)) & byte_mask(size)
}

/// Replaces `size` bytes of `word` starting at byte `offset` with the low
/// bytes of `value`.
///
/// `offset + size` must not exceed 8.
#[inline]
pub const fn insert_bytes(word: u64, offset: u32, size: u32, value: u64) -> u64 {
    let mask = byte_mask(size) << (offset * 8);
    (word & !mask) | ((value << (offset * 8)) & mask)
}
