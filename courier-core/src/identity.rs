//! Contact identity: long-term public keys, nospam cookies, friend addresses.

use std::fmt;

/// Long-term public key of a contact or device (32 bytes). Owned by the
/// transport for ourselves; opaque bytes for everyone else.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const SIZE: usize = 32;

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the bytes can be a curve point at all. The high bit of the
    /// last byte is never set in a valid key.
    pub fn is_valid(&self) -> bool {
        self.0[31] < 128
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for b in &self.0[..4] {
            write!(f, "{:02X}", b)?;
        }
        write!(f, "..)")
    }
}

/// Anti-spam cookie appended to the published friend address. Opaque four
/// bytes on the wire; rotating it invalidates cached invites.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub struct Nospam(pub [u8; 4]);

impl Nospam {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Nospam(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

/// Size of a full friend address: public key, nospam, checksum.
pub const FRIEND_ADDRESS_SIZE: usize = PublicKey::SIZE + 4 + 2;

/// XOR checksum over the first 36 address bytes, folded into two bytes.
pub(crate) fn address_checksum(address: &[u8]) -> [u8; 2] {
    let mut checksum = [0u8; 2];

    for (i, b) in address.iter().enumerate() {
        checksum[i % 2] ^= b;
    }

    checksum
}

/// Public friend address handed out to others:
/// `public_key(32) || nospam(4) || checksum(2)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FriendAddress {
    pub public_key: PublicKey,
    pub nospam: Nospam,
}

impl FriendAddress {
    pub fn new(public_key: PublicKey, nospam: Nospam) -> Self {
        FriendAddress { public_key, nospam }
    }

    /// Serialize to the 38-byte form, computing the checksum.
    pub fn to_bytes(&self) -> [u8; FRIEND_ADDRESS_SIZE] {
        let mut out = [0u8; FRIEND_ADDRESS_SIZE];
        out[..32].copy_from_slice(self.public_key.as_bytes());
        out[32..36].copy_from_slice(self.nospam.as_bytes());
        let checksum = address_checksum(&out[..36]);
        out[36..].copy_from_slice(&checksum);
        out
    }

    /// Parse and validate a 38-byte address.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != FRIEND_ADDRESS_SIZE {
            return Err(AddressError::BadLength(bytes.len()));
        }

        if address_checksum(&bytes[..36]) != [bytes[36], bytes[37]] {
            return Err(AddressError::BadChecksum);
        }

        let mut pk = [0u8; 32];
        pk.copy_from_slice(&bytes[..32]);
        let mut nospam = [0u8; 4];
        nospam.copy_from_slice(&bytes[32..36]);

        Ok(FriendAddress {
            public_key: PublicKey::from_bytes(pk),
            nospam: Nospam::from_bytes(nospam),
        })
    }
}

/// Error parsing a friend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address must be {FRIEND_ADDRESS_SIZE} bytes, got {0}")]
    BadLength(usize),
    #[error("address checksum mismatch")]
    BadChecksum,
}
