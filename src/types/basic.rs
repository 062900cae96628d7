/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior. These types follow
//! the newtype pattern and the API for using them is defined in this module.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, Sub},
    time::SystemTime,
};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use crate::error::{ErrorCode, ReplicationError};

/// Kind of a stream, encoded in the first byte of its [`StreamId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Space,
    Channel,
    Media,
    User,
    UserSettings,
    UserMetadata,
    UserInbox,
    Dm,
    Gdm,
}

impl StreamKind {
    pub const fn prefix(&self) -> u8 {
        match self {
            StreamKind::Space => 0x10,
            StreamKind::Channel => 0x20,
            StreamKind::Media => 0xff,
            StreamKind::User => 0xa8,
            StreamKind::UserSettings => 0xa5,
            StreamKind::UserMetadata => 0xad,
            StreamKind::UserInbox => 0xa1,
            StreamKind::Dm => 0x88,
            StreamKind::Gdm => 0x77,
        }
    }

    pub fn from_prefix(prefix: u8) -> Option<StreamKind> {
        match prefix {
            0x10 => Some(StreamKind::Space),
            0x20 => Some(StreamKind::Channel),
            0xff => Some(StreamKind::Media),
            0xa8 => Some(StreamKind::User),
            0xa5 => Some(StreamKind::UserSettings),
            0xad => Some(StreamKind::UserMetadata),
            0xa1 => Some(StreamKind::UserInbox),
            0x88 => Some(StreamKind::Dm),
            0x77 => Some(StreamKind::Gdm),
            _ => None,
        }
    }
}

/// Identifier of a stream. The first byte is the [`StreamKind`] prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct StreamId([u8; 32]);

impl StreamId {
    /// Build a stream id of the given kind from the remaining 31 bytes.
    pub fn new(kind: StreamKind, body: [u8; 31]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[0] = kind.prefix();
        bytes[1..].copy_from_slice(&body);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, ReplicationError> {
        if StreamKind::from_prefix(bytes[0]).is_none() {
            return Err(
                ReplicationError::new(ErrorCode::InvalidArgument, "unknown stream kind prefix")
                    .tag("prefix", bytes[0]),
            );
        }
        Ok(Self(bytes))
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn kind(&self) -> Option<StreamKind> {
        StreamKind::from_prefix(self.0[0])
    }

    pub fn is_media(&self) -> bool {
        self.kind() == Some(StreamKind::Media)
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Identity of a node: the bytes of its Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct NodeAddress([u8; 32]);

impl NodeAddress {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, ReplicationError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| {
            ReplicationError::new(ErrorCode::InvalidArgument, "node address is not a valid Ed25519 key")
                .tag("address", self)
        })
    }
}

impl From<&VerifyingKey> for NodeAddress {
    fn from(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A SHA-256 digest. The all-zero hash stands for "no hash".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for CryptoHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Sequence number of a miniblock in its stream. The genesis miniblock has number 0.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct MiniblockNum(u64);

impl MiniblockNum {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn genesis() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for MiniblockNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for MiniblockNum {
    type Output = MiniblockNum;
    fn add(self, rhs: u64) -> Self::Output {
        MiniblockNum(self.0 + rhs)
    }
}

impl Sub<MiniblockNum> for MiniblockNum {
    type Output = u64;
    fn sub(self, rhs: MiniblockNum) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// A `(hash, number)` pointer to a miniblock. Callers use it to assert "I observed the chain up to here".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct MiniblockRef {
    pub hash: CryptoHash,
    pub num: MiniblockNum,
}

impl MiniblockRef {
    pub const fn new(hash: CryptoHash, num: MiniblockNum) -> Self {
        Self { hash, num }
    }
}

impl Display for MiniblockRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.num)
    }
}

/// Opaque bytes carried by an event.
#[derive(Clone, PartialEq, Eq, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct Datum(Vec<u8>);

impl Datum {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> &Vec<u8> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Datum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Datum({} bytes)", self.0.len())
    }
}

/// Signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub(crate) fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes(..)")
    }
}

/// Milliseconds since the Unix Epoch, zero if the clock is set before it.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
