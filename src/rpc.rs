//! JSON request/response surface over an [`Engine`].
//!
//! A request is an object with a `method` name and its `params`; the reply is
//! a JSON value (`{}`, `{"newCommitHash": ..}`, `{"conflicts": {path: true}}`,
//! a buffer map, an object, `null`) or `{"error": {"kind", "message"}}`.
//!
//! Byte values travel as text when the declared encoding is `utf-8` and as
//! standard base64 otherwise.
//!
//! Status streams are not request/response shaped and are exposed by the
//! engine and the CLI directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quire_git::transport::RemoteAuth;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::buffers::BufferMap;
use crate::codec::{SpecDescriptor, SpecRegistry};
use crate::commit::{Change, Changeset, CommitOutcome, Encoding};
use crate::dataset::IndexFilter;
use crate::engine::{CommitMeta, Engine, ObjectChange};
use crate::error::{EngineError, Result};
use crate::vcs::{Author, RemoteSettings};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Remote credentials as supplied by the caller.
#[derive(Clone, Deserialize)]
pub struct WireAuth {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for WireAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl From<WireAuth> for RemoteAuth {
    fn from(a: WireAuth) -> Self {
        Self {
            username: a.username,
            password: a.password,
        }
    }
}

/// One change with its values encoded per `encoding`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChange {
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

impl WireChange {
    /// Decode the values.
    ///
    /// # Errors
    /// [`EngineError::Validation`] for an unsupported encoding or bad base64.
    pub fn decode(self, path: &str) -> Result<Change> {
        let encoding = parse_encoding(self.encoding.as_deref())?;
        let decode = |value: Option<String>| -> Result<Option<Vec<u8>>> {
            value.map(|v| decode_bytes(path, &v, encoding)).transpose()
        };
        Ok(Change {
            old: decode(self.old_value)?,
            new: decode(self.new_value)?,
            encoding,
        })
    }
}

/// A typed index filter: keep objects whose value at a JSON pointer equals
/// `equals`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FieldFilter {
    pub pointer: String,
    pub equals: Value,
}

impl FieldFilter {
    #[must_use]
    pub fn into_filter(self) -> IndexFilter {
        Arc::new(move |_: &str, object: &Value| object.pointer(&self.pointer) == Some(&self.equals))
    }
}

fn decode_bytes(path: &str, value: &str, encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(value.as_bytes().to_vec()),
        Encoding::Binary => BASE64
            .decode(value)
            .map_err(|e| EngineError::validation(format!("{path}: invalid base64: {e}"))),
    }
}

fn encode_bytes(path: &str, data: Vec<u8>, encoding: Encoding) -> Result<Value> {
    match encoding {
        Encoding::Utf8 => String::from_utf8(data).map(Value::String).map_err(|_| {
            EngineError::validation(format!("{path}: content is not valid utf-8; request binary encoding"))
        }),
        Encoding::Binary => Ok(Value::String(BASE64.encode(data))),
    }
}

fn parse_encoding(encoding: Option<&str>) -> Result<Encoding> {
    encoding.map_or(Ok(Encoding::Binary), str::parse)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request, tagged by `method`.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    InitRepo {
        work_dir: PathBuf,
        branch: String,
    },
    DescribeRemote {
        url: String,
        #[serde(default)]
        auth: Option<WireAuth>,
    },
    CloneRepo {
        work_dir: PathBuf,
        url: String,
        #[serde(default)]
        auth: Option<WireAuth>,
        branch: String,
    },
    PushRepo {
        work_dir: PathBuf,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        auth: Option<WireAuth>,
    },
    PullRepo {
        work_dir: PathBuf,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        auth: Option<WireAuth>,
    },
    AddOrigin {
        work_dir: PathBuf,
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        write_access: bool,
    },
    DeleteOrigin {
        work_dir: PathBuf,
    },
    DeleteRepo {
        work_dir: PathBuf,
        #[serde(default)]
        force: bool,
    },
    UpdateBuffers {
        work_dir: PathBuf,
        changeset: BTreeMap<String, WireChange>,
        #[serde(default)]
        author: Option<Author>,
        commit_message: String,
        #[serde(default, alias = "skipValidation")]
        ignore_conflicts: bool,
    },
    ReadBuffers {
        work_dir: PathBuf,
        paths: Vec<String>,
        #[serde(default)]
        commit: Option<String>,
        #[serde(default)]
        encoding: Option<String>,
    },
    ReadTree {
        work_dir: PathBuf,
        root: String,
        #[serde(default)]
        commit: Option<String>,
        #[serde(default)]
        encoding: Option<String>,
    },
    DeleteTree {
        work_dir: PathBuf,
        root: String,
        #[serde(default)]
        author: Option<Author>,
        commit_message: String,
    },
    LoadDataset {
        work_dir: PathBuf,
        dataset_dir: String,
        specs: Vec<SpecDescriptor>,
    },
    UnloadDataset {
        work_dir: PathBuf,
        dataset_dir: String,
    },
    GetOrCreateIndex {
        work_dir: PathBuf,
        dataset_dir: String,
        index_id: String,
        #[serde(default)]
        filter: Option<FieldFilter>,
    },
    DescribeIndex {
        work_dir: PathBuf,
        dataset_dir: String,
        index_id: String,
    },
    CountIndexedObjects {
        work_dir: PathBuf,
        dataset_dir: String,
        index_id: String,
    },
    GetIndexedObject {
        work_dir: PathBuf,
        dataset_dir: String,
        index_id: String,
        object_path: String,
    },
    UpdateObjects {
        work_dir: PathBuf,
        dataset_dir: String,
        changes: BTreeMap<String, ObjectChange>,
        #[serde(default)]
        author: Option<Author>,
        commit_message: String,
        #[serde(default, alias = "skipValidation")]
        ignore_conflicts: bool,
    },
    DescribeWorkingCopy {
        work_dir: PathBuf,
    },
    SetAuthor {
        work_dir: PathBuf,
        author: Author,
    },
    DiscardUncommittedChanges {
        work_dir: PathBuf,
    },
}

impl Request {
    /// The wire name of the method, for logging.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::InitRepo { .. } => "initRepo",
            Self::DescribeRemote { .. } => "describeRemote",
            Self::CloneRepo { .. } => "cloneRepo",
            Self::PushRepo { .. } => "pushRepo",
            Self::PullRepo { .. } => "pullRepo",
            Self::AddOrigin { .. } => "addOrigin",
            Self::DeleteOrigin { .. } => "deleteOrigin",
            Self::DeleteRepo { .. } => "deleteRepo",
            Self::UpdateBuffers { .. } => "updateBuffers",
            Self::ReadBuffers { .. } => "readBuffers",
            Self::ReadTree { .. } => "readTree",
            Self::DeleteTree { .. } => "deleteTree",
            Self::LoadDataset { .. } => "loadDataset",
            Self::UnloadDataset { .. } => "unloadDataset",
            Self::GetOrCreateIndex { .. } => "getOrCreateIndex",
            Self::DescribeIndex { .. } => "describeIndex",
            Self::CountIndexedObjects { .. } => "countIndexedObjects",
            Self::GetIndexedObject { .. } => "getIndexedObject",
            Self::UpdateObjects { .. } => "updateObjects",
            Self::DescribeWorkingCopy { .. } => "describeWorkingCopy",
            Self::SetAuthor { .. } => "setAuthor",
            Self::DiscardUncommittedChanges { .. } => "discardUncommittedChanges",
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// The wire form of an error.
#[must_use]
pub fn error_response(err: &EngineError) -> Value {
    json!({ "error": { "kind": err.kind(), "message": err.to_string() } })
}

fn ok() -> Value {
    Value::Object(Map::new())
}

fn commit_response(outcome: &CommitOutcome) -> Value {
    match outcome {
        CommitOutcome::Committed { commit, .. } => json!({ "newCommitHash": commit.to_string() }),
        CommitOutcome::Conflicts(paths) => {
            let conflicts: Map<String, Value> = paths.iter().map(|p| (p.clone(), Value::Bool(true))).collect();
            json!({ "conflicts": conflicts })
        }
    }
}

fn to_value(value: impl Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::codec("<response>", e.to_string()))
}

fn buffers_response(buffers: BTreeMap<String, Option<Vec<u8>>>, encoding: Encoding) -> Result<Value> {
    let mut out = Map::new();
    for (path, data) in buffers {
        let value = match data {
            Some(data) => encode_bytes(&path, data, encoding)?,
            None => Value::Null,
        };
        out.insert(path, value);
    }
    Ok(Value::Object(out))
}

fn tree_response(buffers: BufferMap, encoding: Encoding) -> Result<Value> {
    buffers_response(buffers.into_iter().map(|(k, v)| (k, Some(v))).collect(), encoding)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Parse and run one JSON request. Never fails: errors become
/// `{"error": ..}` values.
#[must_use]
pub fn handle_json(engine: &Engine, request: &str) -> Value {
    let parsed: Request = match serde_json::from_str(request) {
        Ok(r) => r,
        Err(e) => {
            return error_response(&EngineError::validation(format!("malformed request: {e}")));
        }
    };
    let method = parsed.method();
    match dispatch(engine, parsed) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(method, kind = e.kind(), error = %e, "request failed");
            error_response(&e)
        }
    }
}

/// Run a parsed request.
///
/// # Errors
/// Whatever the engine operation returns.
#[allow(clippy::too_many_lines)]
pub fn dispatch(engine: &Engine, request: Request) -> Result<Value> {
    tracing::debug!(method = request.method(), "dispatching");
    match request {
        Request::InitRepo { work_dir, branch } => {
            engine.init_repo(&work_dir, &branch)?;
            Ok(ok())
        }
        Request::DescribeRemote { url, auth } => {
            let auth = auth.map(RemoteAuth::from);
            let d = engine.describe_remote(&url, auth.as_ref())?;
            Ok(json!({ "isBlank": d.is_blank, "canPush": d.can_push }))
        }
        Request::CloneRepo {
            work_dir,
            url,
            auth,
            branch,
        } => {
            engine.clone_repo(&work_dir, &url, auth.map(Into::into), &branch)?;
            Ok(ok())
        }
        Request::PushRepo { work_dir, url, auth } => {
            engine.push_repo(&work_dir, url, auth.map(Into::into))?;
            Ok(ok())
        }
        Request::PullRepo { work_dir, url, auth } => {
            let outcome = engine.pull_repo(&work_dir, url, auth.map(Into::into))?;
            Ok(outcome
                .new_head
                .map_or_else(ok, |head| json!({ "newCommitHash": head.to_string() })))
        }
        Request::AddOrigin {
            work_dir,
            url,
            username,
            write_access,
        } => {
            engine.add_origin(
                &work_dir,
                RemoteSettings {
                    url,
                    username,
                    write_access,
                },
            )?;
            Ok(ok())
        }
        Request::DeleteOrigin { work_dir } => {
            engine.delete_origin(&work_dir)?;
            Ok(ok())
        }
        Request::DeleteRepo { work_dir, force } => {
            engine.delete_repo(&work_dir, force)?;
            Ok(ok())
        }
        Request::UpdateBuffers {
            work_dir,
            changeset,
            author,
            commit_message,
            ignore_conflicts,
        } => {
            let changeset = changeset
                .into_iter()
                .map(|(path, change)| {
                    let decoded = change.decode(&path)?;
                    Ok((path, decoded))
                })
                .collect::<Result<Changeset>>()?;
            let meta = CommitMeta {
                author,
                message: commit_message,
                ignore_conflicts,
            };
            Ok(commit_response(&engine.update_buffers(&work_dir, changeset, meta)?))
        }
        Request::ReadBuffers {
            work_dir,
            paths,
            commit,
            encoding,
        } => {
            let encoding = parse_encoding(encoding.as_deref())?;
            let buffers = engine.read_buffers(&work_dir, &paths, commit)?;
            buffers_response(buffers, encoding)
        }
        Request::ReadTree {
            work_dir,
            root,
            commit,
            encoding,
        } => {
            let encoding = parse_encoding(encoding.as_deref())?;
            tree_response(engine.read_tree(&work_dir, &root, commit)?, encoding)
        }
        Request::DeleteTree {
            work_dir,
            root,
            author,
            commit_message,
        } => {
            let meta = CommitMeta::new(author, commit_message);
            Ok(commit_response(&engine.delete_tree(&work_dir, &root, meta)?))
        }
        Request::LoadDataset {
            work_dir,
            dataset_dir,
            specs,
        } => {
            let specs = SpecRegistry::from_descriptors(&specs)?;
            to_value(engine.load_dataset(&work_dir, &dataset_dir, specs)?)
        }
        Request::UnloadDataset { work_dir, dataset_dir } => {
            engine.unload_dataset(&work_dir, &dataset_dir)?;
            Ok(ok())
        }
        Request::GetOrCreateIndex {
            work_dir,
            dataset_dir,
            index_id,
            filter,
        } => {
            let filter = filter.map(FieldFilter::into_filter);
            to_value(engine.get_or_create_index(&work_dir, &dataset_dir, &index_id, filter)?)
        }
        Request::DescribeIndex {
            work_dir,
            dataset_dir,
            index_id,
        } => to_value(engine.describe_index(&work_dir, &dataset_dir, &index_id)?),
        Request::CountIndexedObjects {
            work_dir,
            dataset_dir,
            index_id,
        } => {
            let count = engine.count_indexed_objects(&work_dir, &dataset_dir, &index_id)?;
            Ok(json!({ "count": count }))
        }
        Request::GetIndexedObject {
            work_dir,
            dataset_dir,
            index_id,
            object_path,
        } => Ok(engine
            .get_indexed_object(&work_dir, &dataset_dir, &index_id, &object_path)?
            .unwrap_or(Value::Null)),
        Request::UpdateObjects {
            work_dir,
            dataset_dir,
            changes,
            author,
            commit_message,
            ignore_conflicts,
        } => {
            let meta = CommitMeta {
                author,
                message: commit_message,
                ignore_conflicts,
            };
            Ok(commit_response(&engine.update_objects(
                &work_dir,
                &dataset_dir,
                changes,
                meta,
            )?))
        }
        Request::DescribeWorkingCopy { work_dir } => to_value(engine.describe_working_copy(&work_dir)?),
        Request::SetAuthor { work_dir, author } => {
            engine.set_author(&work_dir, author)?;
            Ok(ok())
        }
        Request::DiscardUncommittedChanges { work_dir } => {
            engine.discard_uncommitted_changes(&work_dir)?;
            Ok(ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn requests_parse_with_camel_case_params() {
        let req: Request = serde_json::from_value(json!({
            "method": "updateBuffers",
            "params": {
                "workDir": "/tmp/wc",
                "changeset": { "/a.txt": { "newValue": "hello", "encoding": "utf-8" } },
                "author": { "name": "A", "email": "a@example.com" },
                "commitMessage": "add a",
            }
        }))
        .unwrap();
        let Request::UpdateBuffers {
            changeset,
            ignore_conflicts,
            ..
        } = req
        else {
            panic!("wrong variant");
        };
        assert!(!ignore_conflicts);
        let change = changeset["/a.txt"].clone().decode("/a.txt").unwrap();
        assert_eq!(change.new.as_deref(), Some(&b"hello"[..]));
        assert_eq!(change.old, None);
        assert_eq!(change.encoding, Encoding::Utf8);
    }

    #[test]
    fn skip_validation_names_the_conflict_override() {
        for field in ["ignoreConflicts", "skipValidation"] {
            let req: Request = serde_json::from_value(json!({
                "method": "updateBuffers",
                "params": {
                    "workDir": "/tmp/wc",
                    "changeset": { "/a.txt": { "newValue": "x", "encoding": "utf-8" } },
                    "commitMessage": "m",
                    field: true,
                }
            }))
            .unwrap();
            assert!(
                matches!(req, Request::UpdateBuffers { ignore_conflicts: true, .. }),
                "{field}"
            );
        }
    }

    #[test]
    fn binary_values_are_base64() {
        let change = WireChange {
            old_value: None,
            new_value: Some(BASE64.encode([0u8, 159, 146, 150])),
            encoding: None,
        }
        .decode("/bin")
        .unwrap();
        assert_eq!(change.new.unwrap(), vec![0u8, 159, 146, 150]);

        let bad = WireChange {
            new_value: Some("not base64!".to_owned()),
            ..WireChange::default()
        };
        assert!(matches!(bad.decode("/bin"), Err(EngineError::Validation { .. })));
    }

    #[test]
    fn unsupported_encoding_is_rejected() {
        let change = WireChange {
            new_value: Some("x".to_owned()),
            encoding: Some("latin-1".to_owned()),
            ..WireChange::default()
        };
        let err = change.decode("/x").unwrap_err();
        assert_eq!(err.to_string(), "invalid request: Supplied encoding is not supported");
    }

    #[test]
    fn conflicts_render_as_path_set() {
        let outcome = CommitOutcome::Conflicts(BTreeSet::from(["/a.txt".to_owned()]));
        assert_eq!(commit_response(&outcome), json!({ "conflicts": { "/a.txt": true } }));
    }

    #[test]
    fn absent_buffers_are_null() {
        let buffers = BTreeMap::from([
            ("/a.txt".to_owned(), Some(b"hi".to_vec())),
            ("/b.txt".to_owned(), None),
        ]);
        assert_eq!(
            buffers_response(buffers, Encoding::Utf8).unwrap(),
            json!({ "/a.txt": "hi", "/b.txt": null })
        );
    }

    #[test]
    fn utf8_read_of_binary_content_is_refused() {
        let buffers = BTreeMap::from([("/logo.bin".to_owned(), Some(vec![0xff, 0xfe, 0x00]))]);
        let err = buffers_response(buffers.clone(), Encoding::Utf8).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }), "{err:?}");
        assert!(err.to_string().contains("/logo.bin"));
        assert_eq!(
            buffers_response(buffers, Encoding::Binary).unwrap(),
            json!({ "/logo.bin": BASE64.encode([0xff, 0xfe, 0x00]) })
        );
    }

    #[test]
    fn malformed_request_is_a_validation_error() {
        let engine = Engine::default();
        let reply = handle_json(&engine, r#"{"method": "noSuchMethod"}"#);
        assert_eq!(reply["error"]["kind"], "validation");
        let reply = handle_json(&engine, "not json");
        assert_eq!(reply["error"]["kind"], "validation");
    }

    #[test]
    fn relative_work_dir_is_reported() {
        let engine = Engine::default();
        let reply = handle_json(
            &engine,
            r#"{"method": "describeWorkingCopy", "params": {"workDir": "relative"}}"#,
        );
        assert_eq!(reply["error"]["kind"], "validation");
    }

    #[test]
    fn field_filter_matches_pointer() {
        let filter = FieldFilter {
            pointer: "/kind".to_owned(),
            equals: json!("task"),
        }
        .into_filter();
        assert!(filter("/a", &json!({"kind": "task"})));
        assert!(!filter("/b", &json!({"kind": "note"})));
        assert!(!filter("/c", &json!(3)));
    }
}
