//! Numbers in the additive group of integers modulo n.
//!
//! Used for ring buffer indices which are shared with a device and must never
//! leave `[0, n)`.

use core::{
    fmt,
    ops::{Add, AddAssign},
};

use super::UnsignedNumber;

/// A number that automatically wraps at its modulo.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrappingValue<T: UnsignedNumber> {
    value: T,
    modulo: T,
}

impl<T: UnsignedNumber> WrappingValue<T> {
    /// Creates a new [WrappingValue] with the value 0
    ///
    /// panics if `modulo` is 0
    #[track_caller]
    pub fn zero(modulo: T) -> Self {
        Self::new(T::ZERO, modulo)
    }

    /// Creates a new [WrappingValue]
    ///
    /// panics if `modulo` is 0 or `value` is not less than `modulo`
    #[track_caller]
    pub fn new(value: T, modulo: T) -> Self {
        assert!(modulo != T::ZERO, "modulo must not be 0");
        assert!(value < modulo, "value {value:?} must be less than {modulo:?}");
        Self { value, modulo }
    }

    /// The value
    pub fn value(self) -> T {
        self.value
    }

    /// Increments the value by 1.
    ///
    /// Returns `true` if the value wrapped around to 0.
    pub fn increment(&mut self) -> bool {
        *self += T::ONE;
        self.value == T::ZERO
    }
}

impl<T: UnsignedNumber> Add<T> for WrappingValue<T> {
    type Output = Self;

    fn add(self, rhs: T) -> Self::Output {
        let value = match self.value.checked_add(rhs) {
            Some(value) => value.rem(self.modulo),
            None => rhs
                .checked_sub(
                    self.modulo
                        .checked_sub(self.value)
                        .expect("value is always less than modulo"),
                )
                .expect("rhs should be larger than `modulo - value`")
                .rem(self.modulo),
        };
        Self {
            value,
            modulo: self.modulo,
        }
    }
}

impl<T: UnsignedNumber> AddAssign<T> for WrappingValue<T> {
    fn add_assign(&mut self, rhs: T) {
        *self = *self + rhs;
    }
}

impl<T: UnsignedNumber> fmt::Debug for WrappingValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?} % {:?})", self.value, self.modulo)
    }
}
