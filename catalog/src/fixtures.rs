//! Builders for real catalog databases and small repositories backed by a
//! [MemoryCatalogStore], used in tests across the workspace.
use std::collections::HashMap;

use async_compression::tokio::bufread::ZlibEncoder;
use bytes::Bytes;
use lazy_static::lazy_static;
use rusqlite::Connection;
use tokio::io::AsyncReadExt;

use crate::catalogstore::MemoryCatalogStore;
use crate::nodes::is_strict_descendant;
use crate::schema::{flags, md5_path};
use crate::CatalogHash;

lazy_static! {
    pub static ref DUMMY_HASH_1: CatalogHash = [0x01; 20].into();
    pub static ref DUMMY_HASH_2: CatalogHash = [0x02; 20].into();
    pub static ref DUMMY_HASH_3: CatalogHash = [0x03; 20].into();

    /// A root catalog with a file `/a`, and a directory `/b` containing two
    /// files.
    pub static ref CATALOG_SMALL: Vec<u8> = CatalogBuilder::new("")
        .file("/a")
        .dir("/b")
        .file("/b/c")
        .file("/b/d")
        .build();

    /// A root catalog with nothing nested.
    pub static ref CATALOG_EMPTY: Vec<u8> = CatalogBuilder::new("").build();
}

/// Compresses the given bytes with zlib, the way catalogs are stored.
pub async fn compress(raw: &[u8]) -> Bytes {
    let mut encoder = ZlibEncoder::new(raw);
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .await
        .expect("compressing from memory must succeed");
    out.into()
}

/// Compresses a raw catalog and inserts it into the store, returning its
/// hash and compressed size.
pub async fn put_catalog(store: &MemoryCatalogStore, raw: &[u8]) -> (CatalogHash, u64) {
    let compressed = compress(raw).await;
    let hash = CatalogHash::of(&compressed);
    let size = compressed.len() as u64;
    store.put(hash.clone(), compressed);
    (hash, size)
}

/// Renders a `.cvmfspublished` manifest pointing to the given root catalog.
pub fn manifest_text(root: &CatalogHash, name: &str, revision: u64) -> String {
    format!(
        "C{}\nB1024\nRd41d8cd98f00b204e9800998ecf8427e\nN{}\nS{}\nT1700000000\n--\n0123456789abcdef\n",
        root, name, revision
    )
}

struct Entry {
    path: String,
    flags: i64,
}

struct NestedRow {
    path: String,
    sha1: String,
    size: Option<i64>,
}

/// Builds an (uncompressed) catalog database with the tables and columns
/// the schema reader looks at.
pub struct CatalogBuilder {
    root_path: String,
    root_prefix: Option<String>,
    entries: Vec<Entry>,
    nested: Vec<NestedRow>,
    size_column: bool,
    catalog_table: bool,
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

impl CatalogBuilder {
    /// `root_path` is the mount path of the catalog, `""` for the root
    /// catalog of a repository.
    pub fn new(root_path: &str) -> Self {
        Self {
            root_path: root_path.to_string(),
            root_prefix: (!root_path.is_empty()).then(|| root_path.to_string()),
            entries: vec![],
            nested: vec![],
            size_column: true,
            catalog_table: true,
        }
    }

    fn entry(mut self, path: &str, flags: i64) -> Self {
        self.entries.push(Entry {
            path: path.to_string(),
            flags,
        });
        self
    }

    pub fn file(self, path: &str) -> Self {
        self.entry(path, flags::FILE)
    }

    pub fn symlink(self, path: &str) -> Self {
        self.entry(path, flags::SYMLINK)
    }

    pub fn dir(self, path: &str) -> Self {
        self.entry(path, flags::DIRECTORY)
    }

    /// Adds the directory entry a nested catalog is mounted on.
    pub fn mountpoint(self, path: &str) -> Self {
        self.entry(path, flags::DIRECTORY | flags::NESTED_MOUNTPOINT)
    }

    /// Adds a row to the nested_catalogs table.
    pub fn nested(self, path: &str, hash: &CatalogHash, size: u64) -> Self {
        self.nested_raw(path, &hash.to_string(), Some(size as i64))
    }

    /// Adds a row to the nested_catalogs table, without any validation.
    pub fn nested_raw(mut self, path: &str, sha1: &str, size: Option<i64>) -> Self {
        self.nested.push(NestedRow {
            path: path.to_string(),
            sha1: sha1.to_string(),
            size,
        });
        self
    }

    /// Produces the older nested_catalogs layout, without a size column.
    pub fn without_size_column(mut self) -> Self {
        self.size_column = false;
        self
    }

    /// Overrides the `root_prefix` property, which normally holds the
    /// mount path of nested catalogs.
    pub fn root_prefix(mut self, root_prefix: &str) -> Self {
        self.root_prefix = Some(root_prefix.to_string());
        self
    }

    pub fn without_root_prefix(mut self) -> Self {
        self.root_prefix = None;
        self
    }

    pub fn without_catalog_table(mut self) -> Self {
        self.catalog_table = false;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let file = tempfile::NamedTempFile::new().expect("create tempfile");
        {
            let conn = Connection::open(file.path()).expect("open database");
            self.populate(&conn).expect("populate database");
            conn.close().map_err(|(_, e)| e).expect("close database");
        }
        std::fs::read(file.path()).expect("read back database")
    }

    fn populate(&self, conn: &Connection) -> rusqlite::Result<()> {
        if self.size_column {
            conn.execute_batch(
                "CREATE TABLE nested_catalogs (path TEXT, sha1 TEXT, size INTEGER, \
                 CONSTRAINT pk_nested_catalogs PRIMARY KEY (path));",
            )?;
        } else {
            conn.execute_batch(
                "CREATE TABLE nested_catalogs (path TEXT, sha1 TEXT, \
                 CONSTRAINT pk_nested_catalogs PRIMARY KEY (path));",
            )?;
        }

        for row in &self.nested {
            if self.size_column {
                conn.execute(
                    "INSERT INTO nested_catalogs (path, sha1, size) VALUES (?1, ?2, ?3)",
                    (&row.path, &row.sha1, row.size),
                )?;
            } else {
                conn.execute(
                    "INSERT INTO nested_catalogs (path, sha1) VALUES (?1, ?2)",
                    (&row.path, &row.sha1),
                )?;
            }
        }

        conn.execute_batch(
            "CREATE TABLE properties (key TEXT, value TEXT, \
             CONSTRAINT pk_properties PRIMARY KEY (key)); \
             INSERT INTO properties (key, value) VALUES ('schema', '2.5');",
        )?;
        if let Some(root_prefix) = &self.root_prefix {
            conn.execute(
                "INSERT INTO properties (key, value) VALUES ('root_prefix', ?1)",
                [root_prefix],
            )?;
        }

        if !self.catalog_table {
            return Ok(());
        }

        conn.execute_batch(
            "CREATE TABLE catalog (md5path_1 INTEGER, md5path_2 INTEGER, \
             parent_1 INTEGER, parent_2 INTEGER, hardlinks INTEGER, hash BLOB, \
             size INTEGER, mode INTEGER, mtime INTEGER, flags INTEGER, name TEXT, \
             symlink TEXT, uid INTEGER, gid INTEGER, xattr BLOB, \
             CONSTRAINT pk_catalog PRIMARY KEY (md5path_1, md5path_2));",
        )?;

        // The root entry. For the repository root, it's its own parent.
        let (root_flags, root_parent) = if self.root_path.is_empty() {
            (flags::DIRECTORY, md5_path(""))
        } else {
            (
                flags::DIRECTORY | flags::NESTED_ROOT,
                md5_path(parent_of(&self.root_path)),
            )
        };
        let root_name = self.root_path.rsplit('/').next().unwrap_or_default();
        insert_entry(conn, &self.root_path, root_name, root_parent, root_flags)?;

        for entry in &self.entries {
            let name = entry.path.rsplit('/').next().unwrap_or_default();
            insert_entry(
                conn,
                &entry.path,
                name,
                md5_path(parent_of(&entry.path)),
                entry.flags,
            )?;
        }

        Ok(())
    }
}

fn insert_entry(
    conn: &Connection,
    path: &str,
    name: &str,
    parent: (i64, i64),
    entry_flags: i64,
) -> rusqlite::Result<()> {
    let (md5_1, md5_2) = md5_path(path);
    conn.execute(
        "INSERT INTO catalog (md5path_1, md5path_2, parent_1, parent_2, hardlinks, \
         size, mode, mtime, flags, name, symlink, uid, gid) \
         VALUES (?1, ?2, ?3, ?4, 1, 0, 420, 1700000000, ?5, ?6, '', 0, 0)",
        (md5_1, md5_2, parent.0, parent.1, entry_flags, name),
    )?;
    Ok(())
}

/// What to do with a catalog when materialising a [RepositoryBuilder].
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    /// Store bytes that aren't zlib (under their correct hash).
    Corrupt,
    /// Don't store the blob at all.
    Missing,
}

/// Describes a repository by the mount paths of its catalogs. Parents are
/// built after their children, so every catalog references the real hash
/// of its nested catalogs.
pub struct RepositoryBuilder {
    name: String,
    catalogs: Vec<(String, Fault)>,
    unknown_sizes: bool,
    duplicate: Option<String>,
}

/// A materialised [RepositoryBuilder].
pub struct RepositoryFixture {
    pub store: MemoryCatalogStore,
    pub root: CatalogHash,
    /// Hash and compressed size per mount path, including the root at `""`.
    pub catalogs: HashMap<String, (CatalogHash, u64)>,
}

impl RepositoryFixture {
    pub fn hash(&self, mount_path: &str) -> &CatalogHash {
        &self.catalogs[mount_path].0
    }

    pub fn size(&self, mount_path: &str) -> u64 {
        self.catalogs[mount_path].1
    }
}

impl RepositoryBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            catalogs: vec![],
            unknown_sizes: false,
            duplicate: None,
        }
    }

    /// Adds a nested catalog. Siblings are listed in insertion order.
    pub fn catalog(mut self, mount_path: &str) -> Self {
        self.catalogs.push((mount_path.to_string(), Fault::None));
        self
    }

    /// Adds a nested catalog whose blob can't be decompressed.
    pub fn corrupt_catalog(mut self, mount_path: &str) -> Self {
        self.catalogs.push((mount_path.to_string(), Fault::Corrupt));
        self
    }

    /// Adds a nested catalog that is referenced, but absent from the store.
    pub fn missing_catalog(mut self, mount_path: &str) -> Self {
        self.catalogs.push((mount_path.to_string(), Fault::Missing));
        self
    }

    /// Makes parents record size 0 for their nested catalogs.
    pub fn unknown_sizes(mut self) -> Self {
        self.unknown_sizes = true;
        self
    }

    /// Makes the root catalog additionally list the (deeper) nested catalog
    /// at `mount_path`, so it's reachable through two parents.
    pub fn duplicate_in_root(mut self, mount_path: &str) -> Self {
        self.duplicate = Some(mount_path.to_string());
        self
    }

    fn parent_of(&self, mount_path: &str) -> String {
        self.catalogs
            .iter()
            .map(|(p, _)| p.as_str())
            .filter(|p| is_strict_descendant(mount_path, p))
            .max_by_key(|p| p.len())
            .unwrap_or("")
            .to_string()
    }

    pub async fn build(self) -> RepositoryFixture {
        let store = MemoryCatalogStore::default();
        let mut catalogs: HashMap<String, (CatalogHash, u64)> = HashMap::new();

        // deepest first, so children exist before their parents.
        let mut order: Vec<(String, Fault)> = self.catalogs.clone();
        order.push((String::new(), Fault::None));
        order.sort_by_key(|(p, _)| std::cmp::Reverse(p.matches('/').count()));

        for (mount_path, fault) in order {
            let mut builder = CatalogBuilder::new(&mount_path)
                .file(&format!("{}/README", mount_path))
                .dir(&format!("{}/share", mount_path))
                .file(&format!("{}/share/data", mount_path));

            for (child, _) in self
                .catalogs
                .iter()
                .filter(|(p, _)| self.parent_of(p) == mount_path)
            {
                let (hash, size) = &catalogs[child];
                let size = if self.unknown_sizes { 0 } else { *size };
                builder = builder.mountpoint(child).nested(child, hash, size);
            }

            if mount_path.is_empty() {
                if let Some(dup) = &self.duplicate {
                    let (hash, size) = &catalogs[dup];
                    builder = builder.nested(dup, hash, *size);
                }
            }

            let raw = builder.build();
            let entry = match fault {
                Fault::None => put_catalog(&store, &raw).await,
                Fault::Corrupt => {
                    let garbage = Bytes::from(format!("not zlib: {}", mount_path));
                    let hash = CatalogHash::of(&garbage);
                    let size = garbage.len() as u64;
                    store.put(hash.clone(), garbage);
                    (hash, size)
                }
                Fault::Missing => {
                    let compressed = compress(&raw).await;
                    (CatalogHash::of(&compressed), compressed.len() as u64)
                }
            };
            catalogs.insert(mount_path, entry);
        }

        let root = catalogs[""].0.clone();
        store.set_manifest(manifest_text(&root, &self.name, 1));

        RepositoryFixture {
            store,
            root,
            catalogs,
        }
    }
}
