use rand::Rng;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Width of a wrapping number space.
pub trait NumberSpace: Clone {
    const BITS: u32;
}

/// A number living in the wrapping space `0..2^BITS`.
///
/// The derived orderings compare raw values. Use the `-` operator to get the
/// signed distance between two numbers when the wrap matters.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct GenericSeqNumber<T: NumberSpace> {
    number: u32,
    space: PhantomData<T>,
}

impl<T: NumberSpace> GenericSeqNumber<T> {
    pub const MAX_NUMBER: u32 = u32::MAX >> (32 - T::BITS);

    fn masked(number: u32) -> Self {
        Self {
            number: number & Self::MAX_NUMBER,
            space: PhantomData,
        }
    }

    pub fn number(self) -> u32 {
        self.number
    }

    pub fn random() -> Self {
        Self::masked(rand::thread_rng().gen::<u32>())
    }

    pub fn zero() -> Self {
        Self::masked(0)
    }

    pub fn max() -> Self {
        Self::masked(u32::MAX)
    }

    /// True when `self` comes strictly after `other` in the wrapping space.
    #[cfg(test)]
    pub fn is_after(self, other: Self) -> bool {
        self - other > 0
    }
}

impl<T: NumberSpace> From<u32> for GenericSeqNumber<T> {
    fn from(number: u32) -> Self {
        Self::masked(number)
    }
}

/// Signed distance `self - other`, taking the shorter way around the space.
impl<T: NumberSpace> Sub for GenericSeqNumber<T> {
    type Output = i32;

    fn sub(self, other: Self) -> i32 {
        let shift = 32 - T::BITS;
        (self.number.wrapping_sub(other.number) << shift) as i32 >> shift
    }
}

impl<T: NumberSpace> Add<i32> for GenericSeqNumber<T> {
    type Output = Self;

    fn add(self, rhs: i32) -> Self {
        Self::masked(self.number.wrapping_add(rhs as u32))
    }
}

impl<T: NumberSpace> Sub<i32> for GenericSeqNumber<T> {
    type Output = Self;

    fn sub(self, rhs: i32) -> Self {
        Self::masked(self.number.wrapping_sub(rhs as u32))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct PacketSpace;
impl NumberSpace for PacketSpace {
    const BITS: u32 = 31;
}
/// Data packet sequence number.
pub type SeqNumber = GenericSeqNumber<PacketSpace>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct AckSpace;
impl NumberSpace for AckSpace {
    const BITS: u32 = 31;
}
/// Full ACK serial number, echoed back in ACK-ACK.
pub type AckSeqNumber = GenericSeqNumber<AckSpace>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct MessageSpace;
impl NumberSpace for MessageSpace {
    const BITS: u32 = 29;
}
pub type MsgNumber = GenericSeqNumber<MessageSpace>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_wraps_at_31_bits() {
        let last = SeqNumber::max();
        assert_eq!((last + 1).number(), 0);
        assert_eq!((SeqNumber::zero() - 1).number(), 0x7fffffff);
    }

    #[test]
    fn distance_across_wrap() {
        let before: SeqNumber = 0x7ffffffe.into();
        let after: SeqNumber = 3.into();
        assert_eq!(after - before, 5);
        assert_eq!(before - after, -5);
        assert!(after.is_after(before));
        assert!(!before.is_after(after));
    }

    #[test]
    fn from_masks_high_bits() {
        let seq: SeqNumber = 0xffff_ffff.into();
        assert_eq!(seq.number(), 0x7fffffff);
        let msg: MsgNumber = 0x2000_0001.into();
        assert_eq!(msg.number(), 1);
    }

    #[test]
    fn message_numbers_wrap_at_29_bits() {
        let last = MsgNumber::max();
        assert_eq!(last.number(), 0x1fffffff);
        assert_eq!((last + 2).number(), 1);
        assert_eq!((last + 2) - last, 2);
        assert_eq!(MsgNumber::zero() - 1, last);
    }
}
