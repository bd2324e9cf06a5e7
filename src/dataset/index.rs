//! The sled-backed store behind one index.
//!
//! Two trees: `objects` maps an object path to the object's JSON, `meta`
//! records which commit the objects reflect and which spec list produced
//! them. The store is a cache; deleting its directory only costs a rebuild.

use std::path::{Path, PathBuf};

use quire_git::GitOid;
use serde_json::Value;

use crate::codec::ObjectMap;
use crate::error::{EngineError, Result};

const SCHEMA_VERSION: &[u8] = b"1";
const META_SCHEMA: &[u8] = b"schema";
const META_COMMIT: &[u8] = b"indexed_commit";
const META_FINGERPRINT: &[u8] = b"fingerprint";

fn index_err(operation: &'static str) -> impl FnOnce(sled::Error) -> EngineError {
    move |source| EngineError::Index { operation, source }
}

/// An open index store.
#[derive(Debug)]
pub struct IndexStore {
    path: PathBuf,
    db: sled::Db,
    objects: sled::Tree,
    meta: sled::Tree,
}

impl IndexStore {
    /// Open (or create) the store at `path`. A store written with another
    /// schema version is cleared.
    ///
    /// # Errors
    /// [`EngineError::Io`] when the directory cannot be created,
    /// [`EngineError::Index`] when sled fails.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| EngineError::io(path, e))?;
        let db = sled::open(path).map_err(index_err("open"))?;
        let objects = db.open_tree("objects").map_err(index_err("open"))?;
        let meta = db.open_tree("meta").map_err(index_err("open"))?;
        let store = Self {
            path: path.to_path_buf(),
            db,
            objects,
            meta,
        };

        let schema = store.meta.get(META_SCHEMA).map_err(index_err("read meta"))?;
        if schema.as_deref() != Some(SCHEMA_VERSION) {
            if schema.is_some() {
                tracing::info!(path = %path.display(), "index schema changed, clearing");
            }
            store.objects.clear().map_err(index_err("clear"))?;
            store.meta.clear().map_err(index_err("clear"))?;
            store
                .meta
                .insert(META_SCHEMA, SCHEMA_VERSION)
                .map_err(index_err("write meta"))?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The commit the stored objects reflect; `None` before the first build.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure or a corrupt value.
    pub fn indexed_commit(&self) -> Result<Option<GitOid>> {
        let Some(raw) = self.meta.get(META_COMMIT).map_err(index_err("read meta"))? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&raw);
        match text.parse::<GitOid>() {
            Ok(oid) => Ok(Some(oid)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt indexed commit");
                Ok(None)
            }
        }
    }

    /// The spec fingerprint the objects were built with.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure.
    pub fn fingerprint(&self) -> Result<Option<String>> {
        Ok(self
            .meta
            .get(META_FINGERPRINT)
            .map_err(index_err("read meta"))?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Record the commit and fingerprint the objects now reflect.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure.
    pub fn mark(&self, commit: Option<GitOid>, fingerprint: &str) -> Result<()> {
        match commit {
            Some(oid) => self
                .meta
                .insert(META_COMMIT, oid.to_string().as_bytes())
                .map(drop),
            None => self.meta.remove(META_COMMIT).map(drop),
        }
        .map_err(index_err("write meta"))?;
        self.meta
            .insert(META_FINGERPRINT, fingerprint.as_bytes())
            .map_err(index_err("write meta"))?;
        Ok(())
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The object at `path`, if indexed.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure, [`EngineError::Codec`] when
    /// the stored JSON is corrupt.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        self.objects
            .get(path.as_bytes())
            .map_err(index_err("get"))?
            .map(|raw| decode(path, &raw))
            .transpose()
    }

    /// Apply upserts and removals in one batch.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure.
    pub fn apply<'a>(
        &self,
        upserts: impl IntoIterator<Item = (&'a str, &'a Value)>,
        removals: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut batch = sled::Batch::default();
        for path in removals {
            batch.remove(path.as_bytes());
        }
        for (path, value) in upserts {
            batch.insert(path.as_bytes(), encode(value));
        }
        self.objects.apply_batch(batch).map_err(index_err("apply batch"))
    }

    /// Drop the commit and fingerprint marks, persist that, then drop every
    /// object. A store left in this state by an interrupted rebuild reads as
    /// never built, so the next load rebuilds it.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure.
    pub fn begin_rebuild(&self) -> Result<()> {
        self.meta.remove(META_COMMIT).map_err(index_err("write meta"))?;
        self.meta
            .remove(META_FINGERPRINT)
            .map_err(index_err("write meta"))?;
        self.flush()?;
        self.objects.clear().map_err(index_err("clear"))
    }

    /// Replace every stored object. The store stays unmarked until the
    /// caller calls [`IndexStore::mark`].
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure.
    pub fn replace_all(&self, objects: &ObjectMap) -> Result<()> {
        self.begin_rebuild()?;
        self.apply(objects.iter().map(|(p, v)| (p.as_str(), v)), [])
    }

    /// Every stored object in path order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(String, Value)>> + '_ {
        self.objects.iter().map(|item| {
            let (key, raw) = item.map_err(index_err("iterate"))?;
            let path = String::from_utf8_lossy(&key).into_owned();
            let value = decode(&path, &raw)?;
            Ok((path, value))
        })
    }

    /// Flush to disk.
    ///
    /// # Errors
    /// [`EngineError::Index`] on a sled failure.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map(drop).map_err(index_err("flush"))
    }
}

fn encode(value: &Value) -> Vec<u8> {
    // Serializing a `Value` to a Vec cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

fn decode(path: &str, raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw)
        .map_err(|e| EngineError::codec(path, format!("corrupt index entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_store_is_empty_and_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("default")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.indexed_commit().unwrap(), None);
        assert_eq!(store.fingerprint().unwrap(), None);
    }

    #[test]
    fn apply_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let a = json!({"n": 1});
        let b = json!({"n": 2});
        store.apply([("/a.json", &a), ("/b.json", &b)], []).unwrap();
        assert_eq!(store.len(), 2);
        store.apply([], ["/a.json"]).unwrap();
        assert_eq!(store.get("/a.json").unwrap(), None);
        assert_eq!(store.get("/b.json").unwrap(), Some(b));
    }

    #[test]
    fn replacing_objects_clears_marks_until_remarked() {
        let dir = tempfile::tempdir().unwrap();
        let oid: GitOid = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        store.mark(Some(oid), "specs").unwrap();

        store
            .replace_all(&ObjectMap::from([("/x".to_owned(), json!(1))]))
            .unwrap();
        assert_eq!(store.indexed_commit().unwrap(), None);
        assert_eq!(store.fingerprint().unwrap(), None);

        store.mark(Some(oid), "specs").unwrap();
        assert_eq!(store.indexed_commit().unwrap(), Some(oid));
    }

    #[test]
    fn marks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let oid: GitOid = "0123456789abcdef0123456789abcdef01234567".parse().unwrap();
        {
            let store = IndexStore::open(dir.path()).unwrap();
            store
                .replace_all(&ObjectMap::from([("/x".to_owned(), json!(true))]))
                .unwrap();
            store.mark(Some(oid), "specs").unwrap();
            store.flush().unwrap();
        }
        let store = IndexStore::open(dir.path()).unwrap();
        assert_eq!(store.indexed_commit().unwrap(), Some(oid));
        assert_eq!(store.fingerprint().unwrap().as_deref(), Some("specs"));
        let all: Vec<_> = store.iter().collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![("/x".to_owned(), json!(true))]);
    }
}
