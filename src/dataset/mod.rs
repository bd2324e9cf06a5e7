//! Dataset Index: persistent, per-dataset object indexes.
//!
//! A dataset is a directory of a working copy together with the ordered spec
//! list that turns its files into objects. Loading a dataset opens (or builds)
//! its `default` index, which holds every object of the dataset as of `HEAD`.
//! Named filtered indexes hold the subset of the default index accepted by a
//! caller-supplied predicate.
//!
//! Indexes are built from committed history, never from the working tree, so
//! a build reads an immutable snapshot and needs no lock. After `HEAD` moves
//! (commit, pull) [`DatasetRegistry::refresh`] diffs the indexed commit
//! against the new one and re-reads only the objects that own changed paths.
//!
//! The registry lives on a working copy's reader thread and is never shared.

pub mod index;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quire_git::{GitOid, GitRepo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use index::IndexStore;

use crate::buffers::{BufferMap, History};
use crate::codec::{ObjectMap, SpecRegistry};
use crate::error::{EngineError, Result};
use crate::paths;
use crate::status::{StatusChannel, StatusStream, Throttled};

/// Name of the index every loaded dataset has.
pub const DEFAULT_INDEX: &str = "default";

/// Objects between progress reports during a full build.
const PROGRESS_EVERY: usize = 256;

/// Predicate selecting the objects of a filtered index.
pub type IndexFilter = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Build progress of an index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProgress {
    pub loaded: u64,
    pub total: u64,
}

/// Status of one index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub object_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_commit: Option<String>,
    pub indexing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<IndexProgress>,
}

impl Throttled for IndexStatus {
    fn coalesces_with(&self, previous: &Self) -> bool {
        self.indexing && previous.indexing
    }
}

/// An open index and its status stream.
struct Index {
    store: IndexStore,
    filter: Option<IndexFilter>,
    status: StatusChannel<IndexStatus>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("store", &self.store.path())
            .field("filtered", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

impl Index {
    fn current_status(&self) -> Result<IndexStatus> {
        Ok(IndexStatus {
            object_count: self.store.len() as u64,
            indexed_commit: self.store.indexed_commit()?.map(|oid| oid.to_string()),
            indexing: false,
            progress: None,
        })
    }

    fn publish(&self) -> Result<IndexStatus> {
        let status = self.current_status()?;
        self.status.update(status.clone());
        Ok(status)
    }

    fn accepts(&self, path: &str, value: &Value) -> bool {
        self.filter.as_ref().is_none_or(|f| f(path, value))
    }
}

#[derive(Debug)]
struct Dataset {
    dir: String,
    specs: SpecRegistry,
    cache_dir: PathBuf,
    indexes: BTreeMap<String, Index>,
}

/// Every loaded dataset of one working copy.
#[derive(Debug)]
pub struct DatasetRegistry {
    work_dir: PathBuf,
    cache_root: PathBuf,
    status_window: Duration,
    datasets: BTreeMap<String, Dataset>,
}

fn hex_digest(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut hex = String::with_capacity(64);
    for b in &digest {
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

/// The directory holding every index store of a dataset.
#[must_use]
pub fn dataset_cache_dir(cache_root: &Path, work_dir: &Path, dataset_dir: &str) -> PathBuf {
    cache_root
        .join(hex_digest(work_dir.as_os_str().as_encoded_bytes()))
        .join(hex_digest(dataset_dir.as_bytes()))
}

fn validate_index_id(index_id: &str) -> Result<()> {
    let valid = !index_id.is_empty()
        && index_id != "."
        && index_id != ".."
        && index_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::validation(format!("invalid index id {index_id:?}")))
    }
}

impl DatasetRegistry {
    #[must_use]
    pub fn new(work_dir: &Path, cache_root: PathBuf, status_window: Duration) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            cache_root,
            status_window,
            datasets: BTreeMap::new(),
        }
    }

    fn not_loaded(&self, dataset_dir: &str, message: impl Into<String>) -> EngineError {
        EngineError::IndexState {
            work_dir: self.work_dir.clone(),
            dataset_dir: dataset_dir.to_owned(),
            message: message.into(),
        }
    }

    fn dataset(&self, dataset_dir: &str) -> Result<&Dataset> {
        let dir = paths::canonical(dataset_dir)?;
        self.datasets
            .get(&dir)
            .ok_or_else(|| self.not_loaded(&dir, "dataset is not loaded"))
    }

    fn index(&self, dataset_dir: &str, index_id: &str) -> Result<&Index> {
        let dataset = self.dataset(dataset_dir)?;
        dataset
            .indexes
            .get(index_id)
            .ok_or_else(|| self.not_loaded(&dataset.dir, format!("index {index_id} does not exist")))
    }

    /// Load `dataset_dir` with `specs`, replacing any previous load, and
    /// bring its default index up to date with `HEAD`.
    ///
    /// # Errors
    /// [`EngineError::Index`] or [`EngineError::VersionControl`] when the
    /// index cannot be opened or built; the dataset is left unloaded.
    pub fn load(
        &mut self,
        repo: &dyn GitRepo,
        dataset_dir: &str,
        specs: SpecRegistry,
    ) -> Result<IndexStatus> {
        let dir = paths::canonical(dataset_dir)?;
        self.unload(&dir);

        let cache_dir = dataset_cache_dir(&self.cache_root, &self.work_dir, &dir);
        let mut dataset = Dataset {
            dir: dir.clone(),
            specs,
            cache_dir,
            indexes: BTreeMap::new(),
        };
        let index = self.open_index(&dataset, DEFAULT_INDEX, None)?;
        dataset.indexes.insert(DEFAULT_INDEX.to_owned(), index);
        let head = History::new(repo, &self.work_dir).head()?;
        self.sync_dataset(repo, &dataset, head)?;
        let status = dataset.indexes[DEFAULT_INDEX].publish()?;
        tracing::info!(
            work_dir = %self.work_dir.display(),
            dataset = %dir,
            objects = status.object_count,
            "dataset loaded"
        );
        self.datasets.insert(dir, dataset);
        Ok(status)
    }

    fn open_index(&self, dataset: &Dataset, index_id: &str, filter: Option<IndexFilter>) -> Result<Index> {
        let store = IndexStore::open(&dataset.cache_dir.join(index_id))?;
        let initial = IndexStatus {
            object_count: store.len() as u64,
            indexed_commit: store.indexed_commit()?.map(|oid| oid.to_string()),
            indexing: false,
            progress: None,
        };
        let status = StatusChannel::spawn(index_id, initial, self.status_window)
            .map_err(|e| EngineError::io(&dataset.cache_dir, e))?;
        Ok(Index {
            store,
            filter,
            status,
        })
    }

    /// Close every index of `dataset_dir` and complete their status streams.
    /// Returns whether the dataset was loaded.
    pub fn unload(&mut self, dataset_dir: &str) -> bool {
        let Ok(dir) = paths::canonical(dataset_dir) else {
            return false;
        };
        let Some(dataset) = self.datasets.remove(&dir) else {
            return false;
        };
        for (id, index) in &dataset.indexes {
            if let Err(e) = index.store.flush() {
                tracing::warn!(index = %id, error = %e, "index flush failed on unload");
            }
        }
        drop(dataset);
        tracing::info!(work_dir = %self.work_dir.display(), dataset = %dir, "dataset unloaded");
        true
    }

    /// Unload every dataset.
    pub fn unload_all(&mut self) {
        let dirs: Vec<String> = self.datasets.keys().cloned().collect();
        for dir in dirs {
            self.unload(&dir);
        }
    }

    #[must_use]
    pub fn is_loaded(&self, dataset_dir: &str) -> bool {
        self.dataset(dataset_dir).is_ok()
    }

    /// The spec list `dataset_dir` was loaded with.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset is not loaded.
    pub fn specs(&self, dataset_dir: &str) -> Result<SpecRegistry> {
        Ok(self.dataset(dataset_dir)?.specs.clone())
    }

    /// Return the status of `index_id`, creating it first when needed.
    ///
    /// A new filtered index is filled from the default index. Supplying a
    /// filter for an existing index replaces its filter and refills it.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset is not loaded,
    /// [`EngineError::Validation`] for a bad id or a filter on the default
    /// index.
    pub fn get_or_create_index(
        &mut self,
        dataset_dir: &str,
        index_id: &str,
        filter: Option<IndexFilter>,
    ) -> Result<IndexStatus> {
        validate_index_id(index_id)?;
        let dir = self.dataset(dataset_dir)?.dir.clone();
        if index_id == DEFAULT_INDEX {
            if filter.is_some() {
                return Err(EngineError::validation("the default index cannot be filtered"));
            }
            return self.index(&dir, DEFAULT_INDEX)?.current_status();
        }
        if filter.is_none()
            && let Ok(index) = self.index(&dir, index_id)
        {
            return index.current_status();
        }

        // Replacing a filter reopens the store, so the old handle goes first.
        if let Some(dataset) = self.datasets.get_mut(&dir) {
            drop(dataset.indexes.remove(index_id));
        }
        let dataset = self.dataset(&dir)?;
        let index = self.open_index(dataset, index_id, filter)?;
        fill_from_default(&dataset.indexes[DEFAULT_INDEX], &index, &dataset.specs)?;
        let status = index.publish()?;
        tracing::debug!(dataset = %dir, index = index_id, objects = status.object_count, "index created");
        if let Some(dataset) = self.datasets.get_mut(&dir) {
            dataset.indexes.insert(index_id.to_owned(), index);
        }
        Ok(status)
    }

    /// The status of an existing index.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn describe_index(&self, dataset_dir: &str, index_id: &str) -> Result<IndexStatus> {
        self.index(dataset_dir, index_id)?.current_status()
    }

    /// Number of objects in an index.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn count_objects(&self, dataset_dir: &str, index_id: &str) -> Result<u64> {
        Ok(self.index(dataset_dir, index_id)?.store.len() as u64)
    }

    /// The indexed object at `object_path`, or `None`.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing;
    /// [`EngineError::Index`] on a store failure.
    pub fn get_object(&self, dataset_dir: &str, index_id: &str, object_path: &str) -> Result<Option<Value>> {
        self.index(dataset_dir, index_id)?.store.get(object_path)
    }

    /// Subscribe to an index's status.
    ///
    /// # Errors
    /// [`EngineError::IndexState`] when the dataset or index is missing.
    pub fn subscribe(&self, dataset_dir: &str, index_id: &str) -> Result<StatusStream<IndexStatus>> {
        Ok(self.index(dataset_dir, index_id)?.status.subscribe())
    }

    /// Every object of an index accepted by `predicate`, in path order.
    ///
    /// # Errors
    /// As for [`DatasetRegistry::get_object`].
    pub fn scan(
        &self,
        dataset_dir: &str,
        index_id: &str,
        mut predicate: impl FnMut(&str, &Value) -> bool,
    ) -> Result<Vec<(String, Value)>> {
        let index = self.index(dataset_dir, index_id)?;
        let mut out = Vec::new();
        for item in index.store.iter() {
            let (path, value) = item?;
            if predicate(&path, &value) {
                out.push((path, value));
            }
        }
        Ok(out)
    }

    /// Map every object of an index and fold the mapped values. Objects for
    /// which `map` returns `None` are skipped.
    ///
    /// # Errors
    /// As for [`DatasetRegistry::get_object`].
    pub fn map_reduce<M, R>(
        &self,
        dataset_dir: &str,
        index_id: &str,
        mut map: impl FnMut(&str, &Value) -> Option<M>,
        init: R,
        mut reduce: impl FnMut(R, M) -> R,
    ) -> Result<R> {
        let index = self.index(dataset_dir, index_id)?;
        let mut acc = init;
        for item in index.store.iter() {
            let (path, value) = item?;
            if let Some(mapped) = map(&path, &value) {
                acc = reduce(acc, mapped);
            }
        }
        Ok(acc)
    }

    /// Bring every loaded index up to date with `HEAD`.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when history cannot be read, or
    /// [`EngineError::Index`] on a store failure.
    pub fn refresh(&self, repo: &dyn GitRepo) -> Result<()> {
        let head = History::new(repo, &self.work_dir).head()?;
        for dataset in self.datasets.values() {
            self.sync_dataset(repo, dataset, head)?;
            for index in dataset.indexes.values() {
                index.publish()?;
            }
        }
        Ok(())
    }

    /// Make the default index of `dataset` reflect `head`, then carry the
    /// same object changes into its filtered indexes.
    fn sync_dataset(&self, repo: &dyn GitRepo, dataset: &Dataset, head: Option<GitOid>) -> Result<()> {
        let default = &dataset.indexes[DEFAULT_INDEX];
        let fingerprint = dataset.specs.fingerprint();
        let indexed = default.store.indexed_commit()?;
        let same_specs = default.store.fingerprint()?.as_deref() == Some(fingerprint.as_str());

        if same_specs && indexed == head {
            tracing::debug!(dataset = %dataset.dir, "index already current");
            return Ok(());
        }
        let Some(head) = head else {
            default.store.replace_all(&ObjectMap::new())?;
            default.store.mark(None, &fingerprint)?;
            return Ok(());
        };

        let history = History::new(repo, &self.work_dir);
        let incremental = match indexed {
            Some(old) if same_specs => self.changed_roots(repo, dataset, old, head)?,
            _ => None,
        };
        let Some(roots) = incremental else {
            rebuild(&history, dataset, head, &fingerprint)?;
            for (id, index) in &dataset.indexes {
                if id != DEFAULT_INDEX {
                    fill_from_default(default, index, &dataset.specs)?;
                }
            }
            return Ok(());
        };

        let mut upserts = ObjectMap::new();
        let mut removals = BTreeSet::new();
        for root in roots {
            match read_object(&history, dataset, &root, head)? {
                Some(value) => {
                    upserts.insert(root, value);
                }
                None => {
                    removals.insert(root);
                }
            }
        }
        tracing::debug!(
            dataset = %dataset.dir,
            upserts = upserts.len(),
            removals = removals.len(),
            "incremental index refresh"
        );
        for index in dataset.indexes.values() {
            let (keep, rejected): (Vec<_>, Vec<_>) = upserts
                .iter()
                .partition(|(path, value)| index.accepts(path, value));
            index.store.apply(
                keep.into_iter().map(|(p, v)| (p.as_str(), v)),
                removals
                    .iter()
                    .map(String::as_str)
                    .chain(rejected.into_iter().map(|(p, _)| p.as_str())),
            )?;
            index.store.mark(Some(head), &fingerprint)?;
        }
        Ok(())
    }

    /// Object roots owning paths that changed between `old` and `new`, or
    /// `None` when the old commit can no longer be read.
    fn changed_roots(
        &self,
        repo: &dyn GitRepo,
        dataset: &Dataset,
        old: GitOid,
        new: GitOid,
    ) -> Result<Option<BTreeSet<String>>> {
        let vcs = |e: quire_git::GitError| EngineError::vcs(&self.work_dir, "diff index commits", e);
        let old_tree = match repo.read_commit(old) {
            Ok(info) => info.tree_oid,
            Err(e) if e.is_not_found() => {
                tracing::info!(%old, "indexed commit is gone, rebuilding");
                return Ok(None);
            }
            Err(e) => return Err(vcs(e)),
        };
        let new_tree = repo.read_commit(new).map_err(vcs)?.tree_oid;
        let mut roots = BTreeSet::new();
        for changed in repo.diff_trees(Some(old_tree), new_tree).map_err(vcs)? {
            let path = format!("/{}", changed.path);
            if !paths::is_descendant(&dataset.dir, &path) {
                continue;
            }
            let rel = paths::relative_to(&dataset.dir, &path);
            if let Some(root) = dataset.specs.object_root_for(&rel) {
                roots.insert(root);
            }
        }
        Ok(Some(roots))
    }
}

/// Rebuild the default index of `dataset` from the tree at `head`.
fn rebuild(history: &History<'_>, dataset: &Dataset, head: GitOid, fingerprint: &str) -> Result<()> {
    let default = &dataset.indexes[DEFAULT_INDEX];
    let buffers = history.read_all_at(&dataset.dir, head)?;
    let groups = dataset.specs.group(&buffers);
    let total = groups.len() as u64;
    tracing::info!(dataset = %dataset.dir, objects = total, %head, "building index");

    let mut objects = ObjectMap::new();
    for (n, group) in groups.into_iter().enumerate() {
        let value = dataset.specs.deserialize_group(&group)?;
        objects.insert(group.root, value);
        if n % PROGRESS_EVERY == 0 {
            default.status.update(IndexStatus {
                object_count: n as u64,
                indexed_commit: None,
                indexing: true,
                progress: Some(IndexProgress {
                    loaded: n as u64,
                    total,
                }),
            });
        }
    }
    default.store.replace_all(&objects)?;
    default.store.mark(Some(head), fingerprint)?;
    Ok(())
}

/// Read the object rooted at `root` (dataset-relative) as of `commit`.
fn read_object(history: &History<'_>, dataset: &Dataset, root: &str, commit: GitOid) -> Result<Option<Value>> {
    let absolute = paths::join(&dataset.dir, root);
    let mut buffers = BufferMap::new();
    if root.ends_with('/') {
        for (key, data) in history.read_all_at(&absolute, commit)? {
            buffers.insert(paths::join(root, &key), data);
        }
    } else if let Some(data) = history.read_at(&absolute, commit)? {
        buffers.insert(root.to_owned(), data);
    }
    let mut objects = dataset.specs.to_object_dataset(&buffers)?;
    Ok(objects.remove(root))
}

/// Refill a filtered index from the default index.
fn fill_from_default(default: &Index, index: &Index, specs: &SpecRegistry) -> Result<()> {
    let mut selected = ObjectMap::new();
    for item in default.store.iter() {
        let (path, value) = item?;
        if index.accepts(&path, &value) {
            selected.insert(path, value);
        }
    }
    index.store.replace_all(&selected)?;
    index
        .store
        .mark(default.store.indexed_commit()?, &specs.fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, ObjectSpec, PathMatcher};
    use quire_git::{EntryMode, GixRepo, RefEdit, RefName, Signature, TreeEdit};
    use serde_json::json;

    fn specs() -> SpecRegistry {
        SpecRegistry::new(vec![ObjectSpec::new(
            PathMatcher::any().with_extensions(["json"]),
            JsonCodec,
        )])
    }

    fn commit(repo: &GixRepo, files: &[(&str, Option<&str>)]) -> GitOid {
        let head = repo.head_commit().unwrap();
        let base = match head {
            Some(h) => repo.read_commit(h).unwrap().tree_oid,
            None => repo.empty_tree().unwrap(),
        };
        let edits: Vec<TreeEdit> = files
            .iter()
            .map(|(path, content)| match content {
                Some(c) => TreeEdit::Upsert {
                    path: (*path).to_owned(),
                    mode: EntryMode::Blob,
                    oid: repo.write_blob(c.as_bytes()).unwrap(),
                },
                None => TreeEdit::Remove {
                    path: (*path).to_owned(),
                },
            })
            .collect();
        let tree = repo.edit_tree(base, &edits).unwrap();
        let parents: Vec<GitOid> = head.into_iter().collect();
        let oid = repo
            .create_commit(tree, &parents, "test", &Signature::new("T", "t@example.com"))
            .unwrap();
        repo.atomic_ref_update(
            &[RefEdit {
                name: RefName::branch("main").unwrap(),
                new_oid: oid,
                expected_old_oid: head.unwrap_or(GitOid::ZERO),
                log_message: "test".to_owned(),
            }],
            &Signature::new("T", "t@example.com"),
        )
        .unwrap();
        oid
    }

    struct Fixture {
        _work: tempfile::TempDir,
        _cache: tempfile::TempDir,
        repo: GixRepo,
        registry: DatasetRegistry,
    }

    fn fixture() -> Fixture {
        let work = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let repo = GixRepo::init(work.path(), &RefName::branch("main").unwrap()).unwrap();
        let registry = DatasetRegistry::new(
            work.path(),
            cache.path().to_path_buf(),
            Duration::from_millis(10),
        );
        Fixture {
            _work: work,
            _cache: cache,
            repo,
            registry,
        }
    }

    #[test]
    fn load_indexes_head() {
        let mut f = fixture();
        commit(
            &f.repo,
            &[
                ("data/a.json", Some(r#"{"n": 1}"#)),
                ("data/b.json", Some(r#"{"n": 2}"#)),
                ("other/c.json", Some("{}")),
            ],
        );
        let status = f.registry.load(&f.repo, "/data", specs()).unwrap();
        assert_eq!(status.object_count, 2);
        assert_eq!(
            f.registry.get_object("/data", DEFAULT_INDEX, "/a.json").unwrap(),
            Some(json!({"n": 1}))
        );
        assert_eq!(f.registry.get_object("/data", DEFAULT_INDEX, "/c.json").unwrap(), None);
    }

    #[test]
    fn empty_repository_loads_empty_index() {
        let mut f = fixture();
        let status = f.registry.load(&f.repo, "/", specs()).unwrap();
        assert_eq!(status.object_count, 0);
        assert_eq!(status.indexed_commit, None);
    }

    #[test]
    fn operations_require_loaded_dataset() {
        let f = fixture();
        let err = f.registry.count_objects("/data", DEFAULT_INDEX).unwrap_err();
        assert!(matches!(err, EngineError::IndexState { .. }));
    }

    #[test]
    fn unload_completes_stream_and_blocks_reads() {
        let mut f = fixture();
        f.registry.load(&f.repo, "/", specs()).unwrap();
        let stream = f.registry.subscribe("/", DEFAULT_INDEX).unwrap();
        assert!(f.registry.unload("/"));
        let remaining: Vec<IndexStatus> = stream.collect();
        assert!(!remaining.is_empty());
        assert!(matches!(
            f.registry.get_object("/", DEFAULT_INDEX, "/a.json").unwrap_err(),
            EngineError::IndexState { .. }
        ));
    }

    #[test]
    fn refresh_applies_only_changes() {
        let mut f = fixture();
        commit(&f.repo, &[("a.json", Some("1")), ("b.json", Some("2"))]);
        f.registry.load(&f.repo, "/", specs()).unwrap();

        commit(&f.repo, &[("a.json", Some("10")), ("b.json", None), ("c.json", Some("3"))]);
        f.registry.refresh(&f.repo).unwrap();

        assert_eq!(f.registry.get_object("/", DEFAULT_INDEX, "/a.json").unwrap(), Some(json!(10)));
        assert_eq!(f.registry.get_object("/", DEFAULT_INDEX, "/b.json").unwrap(), None);
        assert_eq!(f.registry.get_object("/", DEFAULT_INDEX, "/c.json").unwrap(), Some(json!(3)));
        let head = f.repo.head_commit().unwrap().map(|o| o.to_string());
        assert_eq!(f.registry.describe_index("/", DEFAULT_INDEX).unwrap().indexed_commit, head);
    }

    #[test]
    fn filtered_index_follows_default() {
        let mut f = fixture();
        commit(&f.repo, &[("a.json", Some("1")), ("b.json", Some("5"))]);
        f.registry.load(&f.repo, "/", specs()).unwrap();
        let big: IndexFilter = Arc::new(|_: &str, v: &Value| v.as_i64().is_some_and(|n| n > 2));
        let status = f.registry.get_or_create_index("/", "big", Some(big)).unwrap();
        assert_eq!(status.object_count, 1);

        commit(&f.repo, &[("a.json", Some("7")), ("b.json", Some("0"))]);
        f.registry.refresh(&f.repo).unwrap();
        let big: Vec<String> = f
            .registry
            .scan("/", "big", |_, _| true)
            .unwrap()
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(big, vec!["/a.json".to_owned()]);
    }

    #[test]
    fn map_reduce_sums() {
        let mut f = fixture();
        commit(&f.repo, &[("a.json", Some("1")), ("b.json", Some("2")), ("c.json", Some("3"))]);
        f.registry.load(&f.repo, "/", specs()).unwrap();
        let sum = f
            .registry
            .map_reduce("/", DEFAULT_INDEX, |_, v| v.as_i64(), 0, |acc, n| acc + n)
            .unwrap();
        assert_eq!(sum, 6);
    }

    #[test]
    fn persisted_index_is_reused() {
        let mut f = fixture();
        commit(&f.repo, &[("a.json", Some("1"))]);
        f.registry.load(&f.repo, "/", specs()).unwrap();
        f.registry.unload_all();
        let status = f.registry.load(&f.repo, "/", specs()).unwrap();
        assert_eq!(status.object_count, 1);
    }

    #[test]
    fn interrupted_rebuild_is_not_served() {
        let mut f = fixture();
        commit(&f.repo, &[("a.json", Some("1"))]);
        f.registry.load(&f.repo, "/", specs()).unwrap();
        // What a rebuild leaves behind when it stops before refilling.
        f.registry.dataset("/").unwrap().indexes[DEFAULT_INDEX]
            .store
            .begin_rebuild()
            .unwrap();
        f.registry.unload_all();

        let status = f.registry.load(&f.repo, "/", specs()).unwrap();
        assert_eq!(status.object_count, 1);
        assert_eq!(f.registry.get_object("/", DEFAULT_INDEX, "/a.json").unwrap(), Some(json!(1)));
    }

    #[test]
    fn index_ids_are_validated() {
        let mut f = fixture();
        f.registry.load(&f.repo, "/", specs()).unwrap();
        assert!(f.registry.get_or_create_index("/", "../x", None).is_err());
        assert!(f.registry.get_or_create_index("/", "", None).is_err());
    }
}
