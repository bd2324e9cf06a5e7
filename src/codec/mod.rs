//! Object Codec Registry.
//!
//! An [`ObjectSpec`] pairs a [`PathMatcher`] with an [`ObjectCodec`]. A
//! [`SpecRegistry`] holds specs in registration order; the first spec whose
//! matcher accepts a path owns it.
//!
//! # Grouping
//!
//! [`SpecRegistry::to_object_dataset`] rebuilds objects from a flat buffer
//! set in one pass over sorted paths. The set is extended with every
//! ancestor directory (written with a trailing slash), so sorting yields:
//!
//! ```text
//! /meta.json
//! /units/
//! /units/a/
//! /units/a/body.md
//! /units/a/meta.yaml
//! /units/b.json
//! ```
//!
//! A path opens an object when nothing is open (or it is outside the open
//! root) and some spec matches it. Paths below the open root accumulate into
//! it, the root's own content under `/`. The first path outside closes the
//! object, and the last open object is closed at the end. Paths matching no
//! spec while nothing is open are dropped.
//!
//! Object keys are the root paths as they appear in that listing: a
//! directory object keeps its trailing slash (`/units/a/`), a file object
//! does not (`/units/b.json`).

pub mod builtin;
pub mod matcher;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use builtin::{FileTreeCodec, JsonCodec, TomlCodec};
pub use matcher::{MatcherDescriptor, PathMatcher};

use crate::buffers::BufferMap;
use crate::error::{EngineError, Result};
use crate::paths;

/// Key under which an object root's own content is stored.
pub const SELF_KEY: &str = "/";

/// Deserialized objects keyed by object path.
pub type ObjectMap = BTreeMap<String, Value>;

/// A codec failure, without location. The registry attaches the object path.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CodecError {
    message: String,
}

impl CodecError {
    /// A codec error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("json: {e}"))
    }
}

/// Converts between an object and the buffers it occupies.
///
/// Buffer keys are relative to the object root; the root's own content is
/// under [`SELF_KEY`].
pub trait ObjectCodec: Send + Sync {
    /// Short name used in descriptors and logs.
    fn name(&self) -> &str;

    /// Expand an object into relative buffers.
    ///
    /// # Errors
    /// [`CodecError`] when the object has the wrong shape.
    fn serialize(&self, object: &Value) -> Result<BufferMap, CodecError>;

    /// Build an object from relative buffers.
    ///
    /// # Errors
    /// [`CodecError`] when the buffers cannot be parsed.
    fn deserialize(&self, buffers: &BufferMap) -> Result<Value, CodecError>;
}

/// A matcher plus the codec for the paths it selects.
#[derive(Clone)]
pub struct ObjectSpec {
    /// Which object roots this spec owns.
    pub matcher: PathMatcher,
    /// How those objects are stored.
    pub codec: Arc<dyn ObjectCodec>,
}

impl ObjectSpec {
    /// Pair a matcher with a codec.
    pub fn new(matcher: PathMatcher, codec: impl ObjectCodec + 'static) -> Self {
        Self {
            matcher,
            codec: Arc::new(codec),
        }
    }
}

impl fmt::Debug for ObjectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSpec")
            .field("matcher", &self.matcher)
            .field("codec", &self.codec.name())
            .finish()
    }
}

/// Names of the built-in codecs, for descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecKind {
    /// [`JsonCodec`].
    Json,
    /// [`TomlCodec`].
    Toml,
    /// [`FileTreeCodec`].
    FileTree,
}

/// Serializable description of an [`ObjectSpec`] built from a built-in codec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecDescriptor {
    /// Which paths the spec owns.
    #[serde(default)]
    pub matcher: MatcherDescriptor,
    /// Which built-in codec stores them.
    pub codec: CodecKind,
}

impl SpecDescriptor {
    /// Compile into a spec.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for a matcher that does not compile.
    pub fn build(&self) -> Result<ObjectSpec> {
        let matcher = PathMatcher::from_descriptor(&self.matcher)
            .map_err(|e| EngineError::validation(e.to_string()))?;
        Ok(match self.codec {
            CodecKind::Json => ObjectSpec::new(matcher, JsonCodec),
            CodecKind::Toml => ObjectSpec::new(matcher, TomlCodec),
            CodecKind::FileTree => ObjectSpec::new(matcher, FileTreeCodec),
        })
    }
}

/// One object found by the grouping pass, before deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectGroup {
    /// The object path (directory roots keep their trailing slash).
    pub root: String,
    /// Index of the owning spec in registration order.
    pub spec: usize,
    /// Buffers relative to `root`.
    pub buffers: BufferMap,
}

/// An ordered, immutable list of specs. Cloning shares the list.
#[derive(Clone, Debug, Default)]
pub struct SpecRegistry {
    specs: Arc<[ObjectSpec]>,
}

impl SpecRegistry {
    /// A registry over `specs`, in priority order.
    #[must_use]
    pub fn new(specs: Vec<ObjectSpec>) -> Self {
        Self {
            specs: specs.into(),
        }
    }

    /// Build a registry from descriptors.
    ///
    /// # Errors
    /// [`EngineError::Validation`] when any descriptor fails to compile.
    pub fn from_descriptors(descriptors: &[SpecDescriptor]) -> Result<Self> {
        Ok(Self::new(
            descriptors
                .iter()
                .map(SpecDescriptor::build)
                .collect::<Result<_>>()?,
        ))
    }

    /// Number of registered specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no specs are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// A textual description of every spec, in order. A persisted index
    /// built under a different fingerprint is stale.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.specs
            .iter()
            .map(|spec| format!("{spec:?}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn position(&self, path: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.matcher.matches(path))
    }

    /// The first spec, in registration order, whose matcher accepts `path`.
    #[must_use]
    pub fn find_spec(&self, path: &str) -> Option<&ObjectSpec> {
        self.position(path).map(|i| &self.specs[i])
    }

    /// The object root that would own `path` when grouping: the shallowest
    /// ancestor directory, or `path` itself, that some spec matches.
    #[must_use]
    pub fn object_root_for(&self, path: &str) -> Option<String> {
        paths::ancestor_dirs(path)
            .chain(std::iter::once(path))
            .find(|candidate| self.position(candidate).is_some())
            .map(str::to_owned)
    }

    /// Split a flat buffer set into object groups (see the module docs).
    #[must_use]
    pub fn group(&self, buffers: &BufferMap) -> Vec<ObjectGroup> {
        let mut listing: BTreeSet<&str> = BTreeSet::new();
        for path in buffers.keys() {
            listing.insert(path);
            listing.extend(paths::ancestor_dirs(path));
        }

        let mut groups = Vec::new();
        let mut open: Option<ObjectGroup> = None;
        for path in listing {
            if let Some(current) = open.as_mut() {
                if paths::is_descendant(&current.root, path) {
                    if let Some(data) = buffers.get(path) {
                        current
                            .buffers
                            .insert(paths::relative_to(&current.root, path), data.clone());
                    }
                    continue;
                }
                groups.extend(open.take());
            }

            if let Some(spec) = self.position(path) {
                let mut buffers_for_root = BufferMap::new();
                if let Some(data) = buffers.get(path) {
                    buffers_for_root.insert(SELF_KEY.to_owned(), data.clone());
                }
                open = Some(ObjectGroup {
                    root: path.to_owned(),
                    spec,
                    buffers: buffers_for_root,
                });
            }
        }
        groups.extend(open);
        groups
    }

    /// Deserialize a grouped object.
    ///
    /// # Errors
    /// [`EngineError::Codec`] naming the object path.
    pub fn deserialize_group(&self, group: &ObjectGroup) -> Result<Value> {
        self.specs[group.spec]
            .codec
            .deserialize(&group.buffers)
            .map_err(|e| EngineError::codec(&group.root, e.to_string()))
    }

    /// Rebuild objects from a flat buffer set.
    ///
    /// # Errors
    /// [`EngineError::Codec`] when an object fails to deserialize.
    pub fn to_object_dataset(&self, buffers: &BufferMap) -> Result<ObjectMap> {
        self.group(buffers)
            .into_iter()
            .map(|group| {
                let value = self.deserialize_group(&group)?;
                Ok((group.root, value))
            })
            .collect()
    }

    /// Expand one object into buffers at absolute (dataset-relative) paths.
    ///
    /// # Errors
    /// [`EngineError::Codec`] when no spec owns `object_path` or the codec
    /// rejects the object.
    pub fn serialize_object(&self, object_path: &str, object: &Value) -> Result<BufferMap> {
        let spec = self.find_spec(object_path).ok_or_else(|| {
            EngineError::codec(object_path, "no object spec matches this path")
        })?;
        let relative = spec
            .codec
            .serialize(object)
            .map_err(|e| EngineError::codec(object_path, e.to_string()))?;
        Ok(relative
            .into_iter()
            .map(|(key, data)| (paths::join(object_path, &key), data))
            .collect())
    }

    /// Expand every object into buffers at absolute paths.
    ///
    /// # Errors
    /// Same as [`SpecRegistry::serialize_object`].
    pub fn to_buffer_dataset(&self, objects: &ObjectMap) -> Result<BufferMap> {
        let mut out = BufferMap::new();
        for (path, object) in objects {
            out.extend(self.serialize_object(path, object)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SpecRegistry {
        SpecRegistry::new(vec![
            ObjectSpec::new(PathMatcher::glob("/units/*/").unwrap(), FileTreeCodec),
            ObjectSpec::new(PathMatcher::any().with_extensions(["json"]), JsonCodec),
            ObjectSpec::new(PathMatcher::any().with_extensions(["toml"]), TomlCodec),
        ])
    }

    fn buffers(entries: &[(&str, &str)]) -> BufferMap {
        entries
            .iter()
            .map(|(p, d)| ((*p).to_owned(), d.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn find_spec_uses_registration_order() {
        let reg = SpecRegistry::new(vec![
            ObjectSpec::new(PathMatcher::prefix("/a/"), FileTreeCodec),
            ObjectSpec::new(PathMatcher::any(), JsonCodec),
        ]);
        assert_eq!(reg.find_spec("/a/x.json").unwrap().codec.name(), "file-tree");
        assert_eq!(reg.find_spec("/b/x.json").unwrap().codec.name(), "json");
    }

    #[test]
    fn groups_directories_and_files() {
        let reg = registry();
        let input = buffers(&[
            ("/meta.json", "{\"v\":1}"),
            ("/units/a/body.md", "body"),
            ("/units/a/sub/note.txt", "note"),
            ("/units/b/body.md", "b"),
            ("/readme.md", "dropped"),
            ("/z.json", "{\"last\":true}"),
        ]);
        let groups = reg.group(&input);
        let roots: Vec<&str> = groups.iter().map(|g| g.root.as_str()).collect();
        assert_eq!(roots, vec!["/meta.json", "/units/a/", "/units/b/", "/z.json"]);

        let unit_a = &groups[1];
        let keys: Vec<&str> = unit_a.buffers.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/body.md", "/sub/note.txt"]);
    }

    #[test]
    fn last_object_is_emitted() {
        let reg = registry();
        let objects = reg
            .to_object_dataset(&buffers(&[("/only.json", "{\"a\":1}")]))
            .unwrap();
        assert_eq!(objects.get("/only.json"), Some(&json!({"a": 1})));
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_absorbed() {
        let reg = SpecRegistry::new(vec![ObjectSpec::new(
            PathMatcher::any().with_extensions(["json"]),
            JsonCodec,
        )]);
        let objects = reg
            .to_object_dataset(&buffers(&[("/a.json", "1"), ("/a.json.bak/x.json", "2")]))
            .unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn bad_object_reports_its_path() {
        let reg = registry();
        let err = reg
            .to_object_dataset(&buffers(&[("/broken.json", "{not json")]))
            .unwrap_err();
        match err {
            EngineError::Codec { path, .. } => assert_eq!(path, "/broken.json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn serialization_prefixes_object_root() {
        let reg = registry();
        let objects = ObjectMap::from([
            ("/units/a/".to_owned(), json!({"/body.md": "hello"})),
            ("/cfg.toml".to_owned(), json!({"k": "v"})),
        ]);
        let out = reg.to_buffer_dataset(&objects).unwrap();
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/cfg.toml", "/units/a/body.md"]);
        assert_eq!(reg.to_object_dataset(&out).unwrap(), objects);
    }

    #[test]
    fn serialization_without_spec_is_codec_error() {
        let reg = registry();
        let err = reg
            .serialize_object("/notes.txt", &json!("x"))
            .unwrap_err();
        assert_eq!(err.kind(), "codec");
    }

    #[test]
    fn object_root_for_prefers_shallowest() {
        let reg = registry();
        assert_eq!(
            reg.object_root_for("/units/a/sub/note.txt").as_deref(),
            Some("/units/a/")
        );
        assert_eq!(reg.object_root_for("/x/y.json").as_deref(), Some("/x/y.json"));
        assert_eq!(reg.object_root_for("/readme.md"), None);
    }

    #[test]
    fn descriptors_build_registry() {
        let descriptors: Vec<SpecDescriptor> = serde_json::from_value(json!([
            {"matcher": {"glob": "/units/*/"}, "codec": "file-tree"},
            {"matcher": {"extensions": ["json"]}, "codec": "json"},
        ]))
        .unwrap();
        let reg = SpecRegistry::from_descriptors(&descriptors).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.find_spec("/units/q/").unwrap().codec.name(), "file-tree");
    }
}
