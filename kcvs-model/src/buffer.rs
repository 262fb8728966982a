use std::fmt::{self, Display};
use std::sync::Arc;

/// Immutable, cheaply cloneable byte sequence used for keys, columns and values.
///
/// Ordering is lexicographic over the unsigned bytes, which is the order every
/// ordered backend iterates in.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(from = "Vec<u8>", into = "Vec<u8>")
)]
pub struct StaticBuffer(Arc<[u8]>);

impl StaticBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    /// A buffer of `len` bytes, all `0x00`.
    pub fn zero(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// A buffer of `len` bytes, all `0xFF`.
    pub fn one(len: usize) -> Self {
        Self::new(vec![u8::MAX; len])
    }

    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Big-endian encoding, so numeric order matches byte order.
    pub fn from_u64(value: u64) -> Self {
        Self::new(value.to_be_bytes().to_vec())
    }

    /// Decodes a buffer produced by [`StaticBuffer::from_u64`].
    pub fn to_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_all_zeros(&self) -> bool {
        !self.is_empty() && self.0.iter().all(|b| *b == 0)
    }

    pub fn is_all_ones(&self) -> bool {
        !self.is_empty() && self.0.iter().all(|b| *b == u8::MAX)
    }
}

impl Default for StaticBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl AsRef<[u8]> for StaticBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for StaticBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<StaticBuffer> for Vec<u8> {
    fn from(buffer: StaticBuffer) -> Self {
        buffer.0.to_vec()
    }
}

impl From<&[u8]> for StaticBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for StaticBuffer {
    fn from(value: &str) -> Self {
        Self::from(value.as_bytes())
    }
}

impl Display for StaticBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StaticBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticBuffer({self})")
    }
}
