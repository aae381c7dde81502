//! Which repositories to process, and how.
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cvmfs_catalog::WalkConfig;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),
}

/// A repository to visualise, given by its base location: an `http(s)://`
/// URL of a stratum server, a `file://` URL, or a plain path to a local
/// copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Display name. Falls back to the manifest, then the last path segment
    /// of the location.
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
}

impl RepositoryConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
        }
    }

    /// The name to use when nothing better is known.
    pub fn fallback_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        let (path, host) = match Url::parse(&self.url) {
            Ok(url) => (url.path().to_string(), url.host_str().map(str::to_string)),
            Err(_) => (self.url.clone(), None),
        };

        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or(host)
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Parses `name=url` or just `url`.
impl FromStr for RepositoryConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidRepository("empty".to_string()));
        }

        // an '=' before any "://" separates the name.
        match s.split_once('=') {
            Some((name, url)) if !name.contains('/') && !name.contains(':') => {
                if name.is_empty() || url.is_empty() {
                    return Err(Error::InvalidRepository(s.to_string()));
                }
                Ok(Self {
                    name: Some(name.to_string()),
                    url: url.to_string(),
                })
            }
            _ => Ok(Self::new(s)),
        }
    }
}

/// The contents of a repositories file, in TOML:
///
/// ```toml
/// [[repository]]
/// name = "atlas.cern.ch"
/// url = "http://cvmfs-stratum-one.cern.ch/cvmfs/atlas.cern.ch"
///
/// [walk]
/// stop_threshold = 4194304
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReposFile {
    #[serde(rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
    pub walk: WalkConfig,
}

impl ReposFile {
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;

        toml::from_str(&contents).map_err(|source| Error::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Makes sure ignore paths are absolute, the way mount paths are.
pub fn normalize_ignore_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Parses a human-readable size like `2MB`, `500K` or `1.5g` into bytes.
/// Units are powers of 1024. Without a unit, the value is in bytes.
pub fn parse_size(input: &str) -> Result<u64, Error> {
    let s = input.trim().to_ascii_uppercase();
    let invalid = || Error::InvalidSize(input.to_string());

    // longer suffixes first, so "MB" doesn't match as "B".
    const UNITS: [(&str, u64); 7] = [
        ("KB", 1 << 10),
        ("MB", 1 << 20),
        ("GB", 1 << 30),
        ("B", 1),
        ("K", 1 << 10),
        ("M", 1 << 20),
        ("G", 1 << 30),
    ];

    for (suffix, multiplier) in UNITS {
        if let Some(number) = s.strip_suffix(suffix) {
            let number: f64 = number.trim().parse().map_err(|_| invalid())?;
            if !number.is_finite() || number < 0.0 {
                return Err(invalid());
            }
            return Ok((number * multiplier as f64) as u64);
        }
    }

    s.parse().map_err(|_| invalid())
}
