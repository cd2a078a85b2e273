use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    cmp::Ordering,
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
};
use thiserror::Error;

/// Length of a `Kuid` in bytes.
pub const KUID_LEN: usize = 20;

/// Number of bits in a `Kuid`.
pub const KUID_BITS: usize = KUID_LEN * 8;

/// Kademlia unique identifier, used for both node ids and value keys.
///
/// The derived `Ord` is the plain big-endian byte order which, applied to the result of
/// `a ^ target`, is exactly the XOR distance order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Kuid(#[serde(with = "byte_array")] [u8; KUID_LEN]);

impl Kuid {
    pub const MIN: Kuid = Kuid([0u8; KUID_LEN]);
    pub const MAX: Kuid = Kuid([0xffu8; KUID_LEN]);

    /// Create a Kuid by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }

    /// Create a random Kuid.
    pub fn random() -> Self {
        rand::random()
    }

    /// Panics if index is out of bounds.
    pub fn flip_bit(self, index: usize) -> Self {
        let mut bytes = self.0;
        bytes[index / 8] ^= 0x80 >> (index % 8);
        bytes.into()
    }

    /// Value of the bit at `index`, counted from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros();

            if byte != 0 {
                break;
            }
        }

        bits
    }

    /// Number of leading bits `self` and `other` have in common.
    pub fn common_prefix_len(&self, other: &Kuid) -> usize {
        (*self ^ *other).leading_zeros() as usize
    }

    /// XOR distance between `self` and `other`.
    pub fn distance(&self, other: &Kuid) -> Kuid {
        *self ^ *other
    }

    /// Is `a` strictly closer to `self` than `b`?
    pub fn is_nearer_to(&self, a: &Kuid, b: &Kuid) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// Orders `a` and `b` by their distance to `self`. Distinct ids never tie, equal ids
    /// compare equal, so this is a total order over ids.
    pub fn cmp_distance(&self, a: &Kuid, b: &Kuid) -> Ordering {
        self.distance(a).cmp(&self.distance(b)).then_with(|| a.cmp(b))
    }

    pub fn as_bytes(&self) -> &[u8; KUID_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Kuid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Kuid> for [u8; KUID_LEN] {
    fn from(id: Kuid) -> [u8; KUID_LEN] {
        id.0
    }
}

impl From<[u8; KUID_LEN]> for Kuid {
    fn from(bytes: [u8; KUID_LEN]) -> Kuid {
        Self(bytes)
    }
}

#[derive(Debug, Error)]
#[error("invalid KUID length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for Kuid {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl BitXor for Kuid {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (dst, src) in self.0.iter_mut().zip(rhs.0.iter()) {
            *dst ^= *src;
        }

        self
    }
}

impl Distribution<Kuid> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Kuid {
        Kuid(rng.gen())
    }
}

impl fmt::LowerHex for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Debug for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

mod byte_array {
    use super::KUID_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; KUID_LEN], s: S) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KUID_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?.into_vec();
        let len = buf.len();

        buf.try_into()
            .map_err(|_| D::Error::invalid_length(len, &"a 20 byte identifier"))
    }
}
