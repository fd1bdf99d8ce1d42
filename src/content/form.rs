//! `application/x-www-form-urlencoded` with dotted-key nesting.
//!
//! Serializing `{"user": {"name": "ann"}, "tag": ["a", "b"]}` produces
//! `user.name=ann&tag=a&tag=b`; deserializing reverses it.

use bytes::Bytes;
use serde_json::{Map, Value};

use super::{Body, ContentError, ContentHandler};
use crate::url::decode_component;

pub struct FormContent;

impl ContentHandler for FormContent {
    fn serialize(&self, value: &Value) -> Result<Bytes, ContentError> {
        let Value::Object(map) = value else {
            return Err(ContentError::Form(
                "only objects can be form encoded".to_owned(),
            ));
        };
        let mut pairs = Vec::new();
        for (key, value) in map {
            flatten(key, value, &mut pairs);
        }
        Ok(Bytes::from(pairs.join("&")))
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Body, ContentError> {
        let text = std::str::from_utf8(raw)?;
        let mut root = Map::new();
        for pair in text.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key);
            let value = decode_component(value);
            insert_dotted(&mut root, &key, value.into_owned())?;
        }
        Ok(Body::Json(Value::Object(root)))
    }
}

fn flatten(key: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (child, value) in map {
                flatten(&format!("{key}.{child}"), value, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(key, item, out);
            }
        }
        Value::Null => out.push(format!("{}=", urlencoding::encode(key))),
        Value::String(text) => out.push(format!(
            "{}={}",
            urlencoding::encode(key),
            urlencoding::encode(text)
        )),
        other => out.push(format!(
            "{}={}",
            urlencoding::encode(key),
            urlencoding::encode(&other.to_string())
        )),
    }
}

fn insert_dotted(root: &mut Map<String, Value>, key: &str, value: String) -> Result<(), ContentError> {
    let mut parts = key.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            match current.get_mut(part) {
                Some(Value::Array(items)) => items.push(Value::String(value)),
                Some(slot @ Value::String(_)) => {
                    let first = slot.take();
                    *slot = Value::Array(vec![first, Value::String(value)]);
                }
                Some(_) => {
                    return Err(ContentError::Form(format!(
                        "key `{key}` collides with a nested key"
                    )));
                }
                None => {
                    current.insert(part.to_owned(), Value::String(value));
                }
            }
            return Ok(());
        }
        let next = current
            .entry(part.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match next {
            Value::Object(map) => map,
            _ => {
                return Err(ContentError::Form(format!(
                    "key `{key}` nests under a plain value"
                )));
            }
        };
    }
    Ok(())
}
