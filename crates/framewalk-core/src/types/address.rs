//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed virtual address in the target
///
/// Frame pointers, stack pointers, return addresses and library load bases
/// are all `Address`es. Keeping them apart from plain `u64` values stops a
/// register offset or a byte count from being passed where an address is
/// expected.
///
/// Arithmetic wraps, matching how the target machine computes addresses: a
/// DWARF offset of `-8` stored as an unsigned operand still lands eight bytes
/// below the base.
///
/// ## Example
///
/// ```rust
/// use framewalk_core::types::Address;
///
/// let cfa = Address::from(0x1010);
/// assert_eq!(cfa.offset(-8), Address::from(0x1008));
/// assert_eq!((cfa + 0x10).value(), 0x1020);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address, also the "no more frames" marker in unwound frames.
    pub const ZERO: Self = Address(0);

    /// Create a new address in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw `u64` value of this address.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_zero(self) -> bool
    {
        self.0 == 0
    }

    /// Apply a signed displacement, wrapping like the target would.
    pub const fn offset(self, displacement: i64) -> Self
    {
        Address(self.0.wrapping_add_signed(displacement))
    }

    /// Address of the `index`-th machine word after this one.
    pub const fn word(self, index: u64, word_size: u8) -> Self
    {
        Address(self.0.wrapping_add(index.wrapping_mul(word_size as u64)))
    }

    /// Distance from `base` to this address, if this address is not below it.
    ///
    /// ```rust
    /// use framewalk_core::types::Address;
    ///
    /// let base = Address::from(0x7f00_0000_0000);
    /// assert_eq!(Address::from(0x7f00_0000_1234).offset_from(base), Some(0x1234));
    /// assert_eq!(Address::from(0x10).offset_from(base), None);
    /// ```
    pub fn offset_from(self, base: Address) -> Option<u64>
    {
        self.0.checked_sub(base.0)
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
