use std::fmt::{Debug, Display};

use num_traits::Float as NumFloat;

mod sealed {
    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Element type of every buffer, node and script in a [`Graph`](crate::Graph).
///
/// Sealed: only `f32` and `f64` implement it. Generic code is monomorphised
/// per element type, so the per-coordinate interpreter never dispatches on the
/// element type at runtime.
pub trait Numeric:
    sealed::Sealed
    + NumFloat
    + Copy
    + Send
    + Sync
    + Default
    + Debug
    + Display
    + 'static
{
    /// Size of one element in bytes.
    const BYTES: usize;

    /// Bit pattern used to intern scalar constants.
    fn to_key_bits(self) -> u64;
}

impl Numeric for f32 {
    const BYTES: usize = 4;

    #[inline]
    fn to_key_bits(self) -> u64 {
        self.to_bits() as u64
    }
}

impl Numeric for f64 {
    const BYTES: usize = 8;

    #[inline]
    fn to_key_bits(self) -> u64 {
        self.to_bits()
    }
}
