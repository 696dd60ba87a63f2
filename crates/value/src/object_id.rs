use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        LazyLock,
    },
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use errors::ErrorMetadata;

/// A 12-byte bucket document identifier.
///
/// Layout: a 4-byte big-endian seconds-since-epoch timestamp, a 5-byte
/// per-process random "instance" value, and a 3-byte incrementing counter.
/// The catalog overwrites the timestamp with the bucket's rounded time
/// window and perturbs the instance bytes to spread ids generated within a
/// single rounding window; see the bucket module.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

static PROCESS_INSTANCE: LazyLock<[u8; 5]> = LazyLock::new(rand::random);
static COUNTER: LazyLock<AtomicU32> = LazyLock::new(|| AtomicU32::new(rand::random()));

impl ObjectId {
    /// Generate a fresh id stamped with the current time.
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before the epoch")
            .as_secs() as u32;
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_INSTANCE);
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Seconds-since-epoch timestamp stored in the leading four bytes.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().expect("slice of fixed length"))
    }

    pub fn set_timestamp(&mut self, secs: u32) {
        self.0[0..4].copy_from_slice(&secs.to_be_bytes());
    }

    /// Add `delta` into the low four instance bytes with wrapping arithmetic.
    /// Ids stamped with the same rounded timestamp stay distinct as long as
    /// their unrounded times differ.
    pub fn perturb_instance(&mut self, delta: u32) {
        let current = u32::from_be_bytes(self.0[5..9].try_into().expect("slice of fixed length"));
        self.0[5..9].copy_from_slice(&current.wrapping_add(delta).to_be_bytes());
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let decoded = hex::decode(s).map_err(|e| {
            ErrorMetadata::bad_value("InvalidObjectId", format!("{s:?} is not hex: {e}"))
        })?;
        let bytes: [u8; 12] = decoded.try_into().map_err(|_| {
            ErrorMetadata::bad_value("InvalidObjectId", format!("{s:?} is not 12 bytes"))
        })?;
        Ok(Self(bytes))
    }
}
