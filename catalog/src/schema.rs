//! Reads the relational contents of a decompressed catalog.
//!
//! A catalog is an SQLite database. Two tables are of interest here:
//! `nested_catalogs`, listing the catalogs mounted below this one, and
//! `catalog`, holding one row per directory entry. Entries are keyed by the
//! MD5 of their absolute path, split into two little-endian i64 halves,
//! and point to their parent the same way.
use std::collections::VecDeque;
use std::io::Write;

use bytes::Bytes;
use md5::{Digest, Md5};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

use crate::{CatalogHash, Error};

/// Bits of the `flags` column of the `catalog` table.
pub mod flags {
    pub const DIRECTORY: i64 = 1;
    pub const NESTED_MOUNTPOINT: i64 = 2;
    pub const FILE: i64 = 4;
    pub const SYMLINK: i64 = 8;
    pub const NESTED_ROOT: i64 = 32;
}

/// A row of the `nested_catalogs` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NestedCatalog {
    pub mount_path: String,
    pub hash: CatalogHash,
    /// Compressed size in bytes. 0 if the schema doesn't record it.
    pub size: u64,
}

/// A directory entry of a catalog, with its absolute path reconstructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub is_mountpoint: bool,
}

/// The entries of a catalog, along with the mount path they live under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogListing {
    /// `""` for the root catalog of a repository.
    pub mount_path: String,
    pub entries: Vec<DirectoryEntry>,
}

/// Computes the (md5path_1, md5path_2) key of an absolute path.
pub fn md5_path(path: &str) -> (i64, i64) {
    let digest = Md5::digest(path.as_bytes());
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&digest[..8]);
    hi.copy_from_slice(&digest[8..]);
    (i64::from_le_bytes(lo), i64::from_le_bytes(hi))
}

/// An opened catalog database. SQLite wants a file, so the raw bytes are
/// materialised into a temporary one, which lives as long as this struct.
struct CatalogDatabase {
    conn: Connection,
    _file: NamedTempFile,
}

impl CatalogDatabase {
    fn open(raw: &[u8]) -> Result<Self, Error> {
        let mut file = NamedTempFile::new()?;
        file.write_all(raw)?;
        file.flush()?;

        let conn = Connection::open_with_flags(
            file.path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // SQLite only looks at the header once the first statement runs.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| {
            warn!(err = %e, "payload is not an SQLite database");
            Error::Schema(format!("not a catalog database: {}", e))
        })?;

        Ok(Self { conn, _file: file })
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, Error> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2",
                (table, column),
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn require_table(&self, table: &str) -> Result<(), Error> {
        self.conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?
            .ok_or_else(|| Error::Schema(format!("missing table {}", table)))
    }

    fn nested_catalogs(&self) -> Result<Vec<NestedCatalog>, Error> {
        self.require_table("nested_catalogs")?;

        // Older schema revisions don't record the size of nested catalogs.
        let query = if self.has_column("nested_catalogs", "size")? {
            "SELECT path, sha1, size FROM nested_catalogs ORDER BY rowid"
        } else {
            "SELECT path, sha1, NULL FROM nested_catalogs ORDER BY rowid"
        };

        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;

        let mut nested = Vec::new();
        for row in rows {
            let (mount_path, sha1, size) = row?;

            if !mount_path.starts_with('/') {
                return Err(Error::Schema(format!(
                    "nested catalog mount path is not absolute: {:?}",
                    mount_path
                )));
            }

            let hash: CatalogHash = sha1.parse().map_err(|e| {
                Error::Schema(format!("nested catalog {}: {}", mount_path, e))
            })?;

            let size = match size {
                None => 0,
                Some(size) => u64::try_from(size).map_err(|_| {
                    Error::Schema(format!(
                        "nested catalog {} has negative size {}",
                        mount_path, size
                    ))
                })?,
            };

            nested.push(NestedCatalog {
                mount_path,
                hash,
                size,
            });
        }

        Ok(nested)
    }

    fn property(&self, key: &str) -> Result<Option<String>, Error> {
        let has_properties = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'properties'",
                [],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !has_properties {
            return Ok(None);
        }

        Ok(self
            .conn
            .query_row(
                "SELECT value FROM properties WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    /// Works out the mount path of this catalog. A nested catalog has a
    /// root entry flagged [flags::NESTED_ROOT] and records its mount path
    /// in the `root_prefix` property. A catalog without such an entry is
    /// the root catalog of its repository.
    ///
    /// `expected` is checked against what the catalog says, and fills in
    /// for catalogs that don't record a prefix.
    fn mount_path(&self, expected: Option<&str>) -> Result<String, Error> {
        self.require_table("catalog")?;

        let nested_root = self
            .conn
            .query_row(
                "SELECT md5path_1, md5path_2 FROM catalog WHERE (flags & ?1) != 0 LIMIT 1",
                [flags::NESTED_ROOT],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let root_key = match nested_root {
            Some(key) => key,
            None => {
                return match expected {
                    Some(path) if !path.is_empty() => Err(Error::InvalidRequest(format!(
                        "catalog is a repository root, not mounted at {}",
                        path
                    ))),
                    _ => Ok(String::new()),
                };
            }
        };

        let recorded = self.property("root_prefix")?.filter(|p| !p.is_empty());
        if let Some(recorded) = &recorded {
            if md5_path(recorded) != root_key {
                return Err(Error::Schema(format!(
                    "root_prefix {} doesn't match the catalog root entry",
                    recorded
                )));
            }
        }

        if let Some(expected) = expected {
            if md5_path(expected) != root_key {
                return Err(Error::InvalidRequest(match &recorded {
                    Some(recorded) => format!(
                        "catalog is mounted at {}, not at {:?}",
                        recorded, expected
                    ),
                    None => format!("catalog is not mounted at {:?}", expected),
                }));
            }
        }

        recorded
            .or_else(|| expected.map(str::to_string))
            .ok_or_else(|| {
                Error::InvalidRequest(
                    "catalog doesn't record its mount path, it needs to be given".to_string(),
                )
            })
    }

    /// Lists all entries below `under`, breadth-first, ordered by name
    /// within each directory. Doesn't descend into nested mountpoints,
    /// their contents live in another catalog.
    fn directory_entries(&self, under: &str) -> Result<Vec<DirectoryEntry>, Error> {
        self.require_table("catalog")?;

        let mut stmt = self.conn.prepare(
            "SELECT name, flags, md5path_1, md5path_2 FROM catalog \
             WHERE parent_1 = ?1 AND parent_2 = ?2 ORDER BY name",
        )?;

        let mut entries = Vec::new();
        let mut queue = VecDeque::from([(under.to_string(), md5_path(under))]);

        while let Some((parent_path, parent_key)) = queue.pop_front() {
            let rows = stmt.query_map(parent_key, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    (row.get::<_, i64>(2)?, row.get::<_, i64>(3)?),
                ))
            })?;

            for row in rows {
                let (name, entry_flags, key) = row?;

                // The repository root entry is its own parent.
                if key == parent_key || name.is_empty() {
                    continue;
                }

                let path = format!("{}/{}", parent_path, name);
                let is_directory = entry_flags & flags::DIRECTORY != 0;
                let is_mountpoint = entry_flags & flags::NESTED_MOUNTPOINT != 0;

                if is_directory && !is_mountpoint {
                    queue.push_back((path.clone(), key));
                }

                entries.push(DirectoryEntry {
                    name,
                    path,
                    is_directory,
                    is_mountpoint,
                });
            }
        }

        Ok(entries)
    }
}

/// Lists the catalogs nested directly in the given (decompressed) catalog,
/// in the order they're recorded.
#[instrument(skip_all, fields(catalog.raw_size = raw.len()), err)]
pub async fn list_nested_catalogs(raw: Bytes) -> Result<Vec<NestedCatalog>, Error> {
    let nested =
        tokio::task::spawn_blocking(move || CatalogDatabase::open(&raw)?.nested_catalogs())
            .await??;

    debug!(count = nested.len(), "listed nested catalogs");
    Ok(nested)
}

/// Lists the directory entries of the given (decompressed) catalog below
/// its own mount path, which is read from the catalog. If `expected` is
/// given, it has to agree with the catalog.
#[instrument(skip_all, fields(catalog.raw_size = raw.len(), expected = ?expected), err)]
pub async fn list_catalog_entries(raw: Bytes, expected: Option<&str>) -> Result<CatalogListing, Error> {
    let expected = expected.map(str::to_string);
    let listing = tokio::task::spawn_blocking(move || {
        let db = CatalogDatabase::open(&raw)?;
        let mount_path = db.mount_path(expected.as_deref())?;
        let entries = db.directory_entries(&mount_path)?;
        Ok::<_, Error>(CatalogListing {
            mount_path,
            entries,
        })
    })
    .await??;

    debug!(
        mount_path = %listing.mount_path,
        count = listing.entries.len(),
        "listed catalog entries"
    );
    Ok(listing)
}
