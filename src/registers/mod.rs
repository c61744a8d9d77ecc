//! Register access on top of the `stm32f4` device crate.
//!
//! Register blocks are the PAC's own types. Drivers reach them only through
//! the tokens in [`crate::peripherals`] and work on raw register words with
//! the bit positions in [`map`], via the macros below. Each `read_bits!` is
//! exactly one volatile load and each `write_bits!` exactly one volatile
//! store; the read-modify-write macros are one of each.

pub use stm32f4::stm32f407 as device;

pub mod map;

pub use map::*;

/// Raw value of a register
macro_rules! read_bits {
    ($reg:expr) => {
        $reg.read().bits()
    };
}

/// Store a raw value, ignoring the reset value
macro_rules! write_bits {
    ($reg:expr, $value:expr $(,)?) => {{
        let value: u32 = $value;
        $reg.write(|w| {
            #[allow(unused_unsafe)]
            let w = unsafe { w.bits(value) };
            w
        })
    }};
}

/// Read, transform the raw value, write back
macro_rules! modify_bits {
    ($reg:expr, |$old:ident| $new:expr) => {{
        $reg.modify(|r, w| {
            let $old: u32 = r.bits();
            #[allow(unused_unsafe)]
            let w = unsafe { w.bits($new) };
            w
        })
    }};
}

macro_rules! set_bits {
    ($reg:expr, $mask:expr $(,)?) => {{
        let mask: u32 = $mask;
        $crate::registers::modify_bits!($reg, |v| v | mask)
    }};
}

macro_rules! clear_bits {
    ($reg:expr, $mask:expr $(,)?) => {{
        let mask: u32 = $mask;
        $crate::registers::modify_bits!($reg, |v| v & !mask)
    }};
}

/// `true` when any bit of the mask is set
macro_rules! any_bits {
    ($reg:expr, $mask:expr $(,)?) => {
        ($reg.read().bits() & ($mask)) != 0
    };
}

/// Replace a `width`-bit field at `shift`
macro_rules! write_field {
    ($reg:expr, $shift:expr, $width:expr, $value:expr $(,)?) => {{
        let mask: u32 = $crate::registers::field_mask($width) << ($shift);
        let field: u32 = ($value) << ($shift);
        $crate::registers::modify_bits!($reg, |v| (v & !mask) | (field & mask))
    }};
}

/// Extract a `width`-bit field at `shift`
macro_rules! read_field {
    ($reg:expr, $shift:expr, $width:expr) => {
        ($reg.read().bits() >> ($shift)) & $crate::registers::field_mask($width)
    };
}

pub(crate) use {
    any_bits, clear_bits, modify_bits, read_bits, read_field, set_bits, write_bits, write_field,
};

#[inline(always)]
pub(crate) const fn field_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// Bus address of a register, for DMA peripheral-side pointers
#[inline(always)]
pub fn addr<T>(reg: &T) -> u32 {
    reg as *const T as usize as u32
}

/// Zeroed register block leaked on the host heap.
///
/// PAC registers are plain volatile cells, so all-zero is a valid state and
/// writes simply land in RAM.
#[cfg(test)]
pub(crate) fn fake<R>() -> &'static R {
    let layout = std::alloc::Layout::new::<R>();
    unsafe { &*(std::alloc::alloc_zeroed(layout) as *const R) }
}

/// Store into a host register block, including read-only registers
#[cfg(test)]
#[allow(invalid_reference_casting)]
pub(crate) fn poke<T>(reg: &T, value: u32) {
    unsafe { core::ptr::write_volatile(reg as *const T as *mut u32, value) }
}

/// Load from a host register block, including write-only registers
#[cfg(test)]
pub(crate) fn peek<T>(reg: &T) -> u32 {
    unsafe { core::ptr::read_volatile(reg as *const T as *const u32) }
}
