//! Math utilities

mod mod_group;

pub use mod_group::*;

/// A utility trait for the unsigned integer types usable as a [WrappingValue]
pub trait UnsignedNumber:
    Copy + PartialEq + Eq + PartialOrd + Ord + core::fmt::Debug
{
    /// the zero value
    const ZERO: Self;
    /// the 1 value
    const ONE: Self;

    /// Checked additon, returns `None` on an overflow
    fn checked_add(self, rhs: Self) -> Option<Self>;

    /// Checked subtraction, returns `None` on an underflow
    fn checked_sub(self, rhs: Self) -> Option<Self>;

    /// Calculates the remainder of `self / rhs`
    fn rem(self, rhs: Self) -> Self;
}

macro_rules! impl_unsigned_number {
    ($($typ:ident),*) => {
        $(
            impl UnsignedNumber for $typ {
                const ZERO: Self = 0;
                const ONE: Self = 1;

                #[inline]
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    $typ::checked_add(self, rhs)
                }

                #[inline]
                fn checked_sub(self, rhs: Self) -> Option<Self> {
                    $typ::checked_sub(self, rhs)
                }

                #[inline]
                fn rem(self, rhs: Self) -> Self {
                    self % rhs
                }
            }
        )*
    };
}

impl_unsigned_number!(u8, u16, u32, usize);
