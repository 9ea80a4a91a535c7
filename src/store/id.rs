//! Fixed-width object identities.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Width of an [`ObjectId`] in bytes.
pub const OBJECT_ID_SIZE: usize = 20;

/// Seed counter for [`ObjectId::random`].
static RANDOM_SEED: AtomicU64 = AtomicU64::new(0);

/// Store key: a fixed-width byte array.
///
/// Two ids are equal iff their bytes are identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; OBJECT_ID_SIZE]);

impl ObjectId {
    /// Id from raw bytes.
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Id from an arbitrary byte string, zero-padded or truncated to
    /// [`OBJECT_ID_SIZE`] bytes.
    ///
    /// Names longer than the width collide if their first
    /// [`OBJECT_ID_SIZE`] bytes agree.
    ///
    /// ```rust
    /// use shmtensor::store::ObjectId;
    ///
    /// let id = ObjectId::from_name("weights");
    /// assert_eq!(&id.as_bytes()[..7], b"weights");
    /// assert!(id.as_bytes()[7..].iter().all(|&b| b == 0));
    /// ```
    pub fn from_name(name: impl AsRef<[u8]>) -> Self {
        let name = name.as_ref();
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        let n = name.len().min(OBJECT_ID_SIZE);
        bytes[..n].copy_from_slice(&name[..n]);
        Self(bytes)
    }

    /// Pseudo-random id.
    ///
    /// Each call seeds a fresh generator from a per-process counter, so the
    /// sequence is deterministic within a process and two processes produce
    /// the same ids. Uniqueness is best-effort; supply explicit ids when
    /// collisions across processes matter.
    pub fn random() -> Self {
        let seed = RANDOM_SEED.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Id drawn from the thread-local, OS-seeded generator.
    ///
    /// Unlike [`random`](Self::random), separate processes do not share a
    /// sequence, so ids minted independently by several producers on one
    /// store do not collide in practice.
    pub fn random_unique() -> Self {
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}
