use std::fmt;
use std::io::Read;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

macro_rules! sha256_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const fn from_digest(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(text: &str) -> Option<Self> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(text, &mut bytes).ok()?;
                Some(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_hex(&text).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "invalid {} `{text}`",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

sha256_newtype!(
    /// SHA-256 of a file's bytes.
    ContentHash
);
sha256_newtype!(
    /// Hash of a pip's declared surface.
    WeakFingerprint
);
sha256_newtype!(
    /// Weak fingerprint extended with one execution's observed inputs.
    StrongFingerprint
);
sha256_newtype!(PathSetHash);
sha256_newtype!(
    /// Hash of a directory's (filtered) member names.
    MembershipFingerprint
);

impl ContentHash {
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(bytes.as_ref()).into())
    }

    /// Stream `reader` through SHA-256 without buffering it whole.
    pub fn from_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hasher.finalize().into()))
    }
}

/// Incremental SHA-256 over tagged, length-prefixed fields.
///
/// Every field is written as `tag \0 len value`, so adjacent fields can never alias
/// (`["ab", "c"]` and `["a", "bc"]` hash differently).
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.str("domain", domain);
        builder
    }

    pub fn bytes(&mut self, tag: &str, value: &[u8]) -> &mut Self {
        self.hasher.update(tag.as_bytes());
        self.hasher.update([0]);
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    pub fn str(&mut self, tag: &str, value: &str) -> &mut Self {
        self.bytes(tag, value.as_bytes())
    }

    pub fn u64(&mut self, tag: &str, value: u64) -> &mut Self {
        self.bytes(tag, &value.to_le_bytes())
    }

    pub fn bool(&mut self, tag: &str, value: bool) -> &mut Self {
        self.bytes(tag, &[u8::from(value)])
    }

    pub fn digest(&mut self, tag: &str, value: &[u8; 32]) -> &mut Self {
        self.bytes(tag, value)
    }

    pub fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}
