//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the target's virtual address space
///
/// Keeps code addresses, stack slots and sizes apart at the type level. All
/// arithmetic on addresses in the stepping engine goes through this type so
/// wrap-around behaviour is explicit: `+`/`-` wrap (the CPU does the same),
/// the `checked_*` helpers refuse to.
///
/// ## Example
///
/// ```rust
/// use stepwise_core::types::Address;
///
/// let call = Address::new(0x40_1000);
/// let return_address = call + 5;
/// assert_eq!(return_address.offset_from(call), Some(5));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address, used as the "no frame / end of stack" sentinel.
    pub const ZERO: Self = Address(0);

    /// Create a new address from a raw value. Usable in const contexts.
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw value of this address.
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// `true` for the null address.
    #[must_use]
    pub const fn is_zero(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Apply a signed displacement, as found in `rel32` and `disp8`
    /// instruction operands.
    #[must_use]
    pub const fn offset_by(self, displacement: i64) -> Self
    {
        Address(self.0.wrapping_add_signed(displacement))
    }

    /// Distance from `base` up to `self`, or `None` if `self` is below
    /// `base`.
    #[must_use]
    pub fn offset_from(self, base: Address) -> Option<u64>
    {
        self.0.checked_sub(base.0)
    }

    /// `true` if `self` lies in the half-open range `[start, end)`.
    #[must_use]
    pub fn within(self, start: Address, end: Address) -> bool
    {
        self >= start && self < end
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
