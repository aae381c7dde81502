use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::Error;

pub const HASH_LEN: usize = 20;

/// The SHA-1 content hash addressing a compressed catalog blob.
/// Always rendered as 40 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CatalogHash([u8; HASH_LEN]);

impl CatalogHash {
    /// Calculates the hash of the given (compressed) blob contents.
    pub fn of(contents: &[u8]) -> Self {
        Self(Sha1::digest(contents).into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Path of the blob relative to the repository base, in the sharded
    /// `data/xx/yyyy…C` layout.
    pub fn storage_key(&self) -> String {
        let hex = HEXLOWER.encode(&self.0);
        format!("data/{}/{}C", &hex[..2], &hex[2..])
    }
}

impl std::str::FromStr for CatalogHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_LEN * 2 {
            return Err(Error::InvalidHash(format!(
                "expected {} hex characters, got {}",
                HASH_LEN * 2,
                s.len()
            )));
        }

        let decoded = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| Error::InvalidHash(format!("not hexadecimal: {}", s)))?;

        // the length check above ensures this can't fail.
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&decoded);
        Ok(Self(out))
    }
}

impl TryFrom<String> for CatalogHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CatalogHash> for String {
    fn from(value: CatalogHash) -> Self {
        value.to_string()
    }
}

impl From<[u8; HASH_LEN]> for CatalogHash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for CatalogHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for CatalogHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CatalogHash({})", self)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::CatalogHash;
    use crate::Error;

    #[rstest]
    #[case::lower("0123456789abcdef0123456789abcdef01234567", true)]
    #[case::upper("0123456789ABCDEF0123456789ABCDEF01234567", true)]
    #[case::too_short("0123456789abcdef", false)]
    #[case::too_long("0123456789abcdef0123456789abcdef0123456789", false)]
    #[case::suffixed("0123456789abcdef0123456789abcdef01234567-rmd160", false)]
    #[case::non_hex("0123456789abcdef0123456789abcdef0123456z", false)]
    #[case::empty("", false)]
    fn parse(#[case] input: &str, #[case] exp_ok: bool) {
        let res = input.parse::<CatalogHash>();
        if exp_ok {
            assert_eq!(input.to_lowercase(), res.expect("must parse").to_string());
        } else {
            assert!(matches!(res, Err(Error::InvalidHash(_))), "{:?}", res);
        }
    }

    #[test]
    fn storage_key() {
        let hash: CatalogHash = "abcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        assert_eq!(
            "data/ab/cdef0123456789abcdef0123456789abcdef01C",
            hash.storage_key()
        );
    }

    #[test]
    fn of_is_sha1() {
        // sha1("")
        assert_eq!(
            "da39a3ee5e6b4b0d3255bfef95601890afd80709",
            CatalogHash::of(b"").to_string()
        );
    }

    #[test]
    fn serde_as_string() {
        let hash: CatalogHash = "abcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!("\"abcdef0123456789abcdef0123456789abcdef01\"", json);
        assert_eq!(hash, serde_json::from_str::<CatalogHash>(&json).unwrap());
        assert!(serde_json::from_str::<CatalogHash>("\"abc\"").is_err());
    }
}
