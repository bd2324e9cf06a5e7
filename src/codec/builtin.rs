//! Built-in codecs.
//!
//! - [`JsonCodec`]: a single file holding a JSON document.
//! - [`TomlCodec`]: a single file holding a TOML table.
//! - [`FileTreeCodec`]: any object root (usually a directory) whose value is
//!   a map of relative path → UTF-8 text, or `{"base64": "..."}` for content
//!   that is not valid UTF-8.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

use super::{CodecError, ObjectCodec, SELF_KEY};
use crate::buffers::BufferMap;

fn self_buffer<'a>(buffers: &'a BufferMap, codec: &str) -> Result<&'a [u8], CodecError> {
    buffers
        .get(SELF_KEY)
        .map(Vec::as_slice)
        .ok_or_else(|| CodecError::new(format!("{codec} object has no content at its root")))
}

/// A single JSON file. Serialized pretty-printed with a trailing newline.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl ObjectCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, object: &Value) -> Result<BufferMap, CodecError> {
        let mut data = serde_json::to_vec_pretty(object)?;
        data.push(b'\n');
        Ok(BufferMap::from([(SELF_KEY.to_owned(), data)]))
    }

    fn deserialize(&self, buffers: &BufferMap) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(self_buffer(buffers, "json")?)?)
    }
}

/// A single TOML file. The object must be a table without nulls.
#[derive(Clone, Copy, Debug, Default)]
pub struct TomlCodec;

impl ObjectCodec for TomlCodec {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn serialize(&self, object: &Value) -> Result<BufferMap, CodecError> {
        if !object.is_object() {
            return Err(CodecError::new("toml objects must be tables"));
        }
        let text = toml::to_string_pretty(object)
            .map_err(|e| CodecError::new(format!("toml serialization: {e}")))?;
        Ok(BufferMap::from([(SELF_KEY.to_owned(), text.into_bytes())]))
    }

    fn deserialize(&self, buffers: &BufferMap) -> Result<Value, CodecError> {
        let text = std::str::from_utf8(self_buffer(buffers, "toml")?)
            .map_err(|e| CodecError::new(format!("toml file is not UTF-8: {e}")))?;
        let table: toml::Table =
            toml::from_str(text).map_err(|e| CodecError::new(format!("toml parse: {e}")))?;
        Ok(serde_json::to_value(table)?)
    }
}

/// Every buffer of the object, keyed by its relative path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileTreeCodec;

const BASE64_FIELD: &str = "base64";

impl ObjectCodec for FileTreeCodec {
    fn name(&self) -> &'static str {
        "file-tree"
    }

    fn serialize(&self, object: &Value) -> Result<BufferMap, CodecError> {
        let Some(entries) = object.as_object() else {
            return Err(CodecError::new("file-tree objects must be maps of path to content"));
        };
        let mut out = BufferMap::new();
        for (key, value) in entries {
            let data = match value {
                Value::String(text) => text.clone().into_bytes(),
                Value::Object(wrapped) => {
                    let encoded = wrapped
                        .get(BASE64_FIELD)
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            CodecError::new(format!("entry {key}: expected {{\"base64\": ...}}"))
                        })?;
                    STANDARD
                        .decode(encoded)
                        .map_err(|e| CodecError::new(format!("entry {key}: {e}")))?
                }
                other => {
                    return Err(CodecError::new(format!(
                        "entry {key}: expected text or base64, got {other}"
                    )));
                }
            };
            let key = if key.starts_with('/') {
                key.clone()
            } else {
                format!("/{key}")
            };
            out.insert(key, data);
        }
        Ok(out)
    }

    fn deserialize(&self, buffers: &BufferMap) -> Result<Value, CodecError> {
        let mut map = Map::new();
        for (key, data) in buffers {
            let value = match std::str::from_utf8(data) {
                Ok(text) => Value::String(text.to_owned()),
                Err(_) => {
                    let mut wrapped = Map::new();
                    wrapped.insert(BASE64_FIELD.to_owned(), Value::String(STANDARD.encode(data)));
                    Value::Object(wrapped)
                }
            };
            map.insert(key.clone(), value);
        }
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip() {
        let obj = json!({"name": "a", "n": [1, 2, 3]});
        let buffers = JsonCodec.serialize(&obj).unwrap();
        assert!(buffers[SELF_KEY].ends_with(b"\n"));
        assert_eq!(JsonCodec.deserialize(&buffers).unwrap(), obj);
    }

    #[test]
    fn json_without_root_is_an_error() {
        assert!(JsonCodec.deserialize(&BufferMap::new()).is_err());
    }

    #[test]
    fn toml_roundtrip_and_rejects_scalars() {
        let obj = json!({"title": "x", "nested": {"k": 1}});
        let buffers = TomlCodec.serialize(&obj).unwrap();
        assert_eq!(TomlCodec.deserialize(&buffers).unwrap(), obj);
        assert!(TomlCodec.serialize(&json!(5)).is_err());
    }

    #[test]
    fn file_tree_wraps_binary() {
        let buffers = BufferMap::from([
            ("/readme.md".to_owned(), b"# hi".to_vec()),
            ("/img.bin".to_owned(), vec![0xff, 0x00, 0xfe]),
        ]);
        let obj = FileTreeCodec.deserialize(&buffers).unwrap();
        assert_eq!(obj["/readme.md"], json!("# hi"));
        assert!(obj["/img.bin"]["base64"].is_string());
        assert_eq!(FileTreeCodec.serialize(&obj).unwrap(), buffers);
    }

    #[test]
    fn file_tree_normalizes_keys() {
        let out = FileTreeCodec.serialize(&json!({"a.txt": "a"})).unwrap();
        assert_eq!(out.get("/a.txt").map(Vec::as_slice), Some(&b"a"[..]));
    }
}
