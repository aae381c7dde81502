use tracing::instrument;

use crate::catalogstore::CatalogStore;
use crate::{CatalogHash, Error};

/// The parts of a repository manifest (`.cvmfspublished`) needed to find
/// the root catalog.
///
/// The manifest is a list of lines, each starting with a single-letter key
/// immediately followed by the value. A line consisting of `--` ends the
/// key/value section, what follows is the signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// `C`: hash of the root catalog.
    pub root_hash: CatalogHash,
    /// `N`: fully qualified repository name.
    pub name: Option<String>,
    /// `S`: revision number.
    pub revision: Option<u64>,
    /// `T`: publish timestamp, seconds since the epoch.
    pub timestamp: Option<i64>,
    /// `B`: size of the root catalog in bytes.
    pub root_size: Option<u64>,
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::Schema(format!("malformed manifest: {}", reason))
}

impl Manifest {
    pub fn parse(input: &[u8]) -> Result<Self, Error> {
        let mut root_hash = None;
        let mut name = None;
        let mut revision = None;
        let mut timestamp = None;
        let mut root_size = None;

        for line in input.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line == b"--" {
                break;
            }

            let line = std::str::from_utf8(line).map_err(malformed)?;
            let mut chars = line.chars();
            let key = match chars.next() {
                Some(key) => key,
                None => continue,
            };
            let value = chars.as_str();

            match key {
                'C' => root_hash = Some(value.parse::<CatalogHash>().map_err(malformed)?),
                'N' => name = Some(value.to_string()),
                'S' => revision = Some(value.parse().map_err(malformed)?),
                'T' => timestamp = Some(value.parse().map_err(malformed)?),
                'B' => root_size = Some(value.parse().map_err(malformed)?),
                // root path hash, certificate, history, TTL, …
                _ => {}
            }
        }

        Ok(Self {
            root_hash: root_hash.ok_or_else(|| malformed("no root catalog hash"))?,
            name,
            revision,
            timestamp,
            root_size,
        })
    }
}

/// Retrieves and parses the manifest of the repository behind `store`.
#[instrument(skip_all, err)]
pub async fn resolve_root<S: CatalogStore + ?Sized>(store: &S) -> Result<Manifest, Error> {
    let raw = store
        .manifest()
        .await
        .map_err(|e| Error::Fetch(format!("unable to retrieve manifest: {}", e)))?
        .ok_or_else(|| Error::NotFound("repository has no manifest".to_string()))?;

    Manifest::parse(&raw)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{resolve_root, Manifest};
    use crate::catalogstore::MemoryCatalogStore;
    use crate::fixtures::{manifest_text, DUMMY_HASH_1};
    use crate::Error;

    #[test]
    fn parse_full() {
        let manifest =
            Manifest::parse(manifest_text(&DUMMY_HASH_1, "atlas.cern.ch", 42).as_bytes())
                .expect("must parse");

        assert_eq!(
            Manifest {
                root_hash: DUMMY_HASH_1.clone(),
                name: Some("atlas.cern.ch".into()),
                revision: Some(42),
                timestamp: Some(1700000000),
                root_size: Some(1024),
            },
            manifest
        );
    }

    #[test]
    fn parse_stops_at_signature() {
        // the signature after -- may contain anything, including a C line.
        let input = format!(
            "C{}\n--\nC{}\nsignature",
            *DUMMY_HASH_1, "0000000000000000000000000000000000000000"
        );
        let manifest = Manifest::parse(input.as_bytes()).unwrap();
        assert_eq!(*DUMMY_HASH_1, manifest.root_hash);
    }

    #[rstest]
    #[case::no_root("Natlas.cern.ch\nS1\n--\n")]
    #[case::bad_root("Cabc\n--\n")]
    #[case::bad_revision("C0101010101010101010101010101010101010101\nSx\n--\n")]
    #[case::empty("")]
    fn parse_fail(#[case] input: &str) {
        assert!(matches!(
            Manifest::parse(input.as_bytes()),
            Err(Error::Schema(_))
        ));
    }

    #[tokio::test]
    async fn resolve() {
        let store = MemoryCatalogStore::default();
        assert!(matches!(resolve_root(&store).await, Err(Error::NotFound(_))));

        store.set_manifest(manifest_text(&DUMMY_HASH_1, "test", 1));
        assert_eq!(*DUMMY_HASH_1, resolve_root(&store).await.unwrap().root_hash);
    }
}
