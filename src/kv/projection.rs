//! Projection of partial documents.
//!
//! Small projection lists become sub-document lookups; anything over the
//! spec budget falls back to fetching the whole document and filtering the
//! requested paths locally. Paths are dotted, with `[n]` array indices.

use serde_json::Value;

use crate::error::KvError;
use crate::proto::MAX_SPECS;

/// Whether the projection plus the optional expiry spec no longer fits a
/// single multi-lookup.
pub fn needs_full_fetch(project_len: usize, include_expiry: bool) -> bool {
    project_len + usize::from(include_expiry) > MAX_SPECS
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, KvError> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(KvError::InvalidArgument {
                reason: format!("projection path `{path}` has an empty segment"),
            });
        }
        let mut rest = part;
        if let Some(bracket) = part.find('[') {
            let (name, indices) = part.split_at(bracket);
            if !name.is_empty() {
                segments.push(Segment::Field(name.to_string()));
            }
            rest = indices;
            for index in rest.split('[').filter(|s| !s.is_empty()) {
                let index = index.strip_suffix(']').ok_or_else(|| KvError::InvalidArgument {
                    reason: format!("projection path `{path}` has an unterminated index"),
                })?;
                let index = index.parse().map_err(|_| KvError::InvalidArgument {
                    reason: format!("projection path `{path}` has a non-numeric index"),
                })?;
                segments.push(Segment::Index(index));
            }
        } else {
            segments.push(Segment::Field(rest.to_string()));
        }
    }
    Ok(segments)
}

fn lookup<'doc>(doc: &'doc Value, segments: &[Segment]) -> Option<&'doc Value> {
    let mut current = doc;
    for segment in segments {
        current = match segment {
            Segment::Field(name) => current.get(name.as_str())?,
            Segment::Index(index) => current.get(index)?,
        };
    }
    Some(current)
}

fn insert(target: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    match head {
        Segment::Field(name) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let entry = target
                .as_object_mut()
                .expect("just ensured object")
                .entry(name.clone())
                .or_insert(Value::Null);
            insert(entry, rest, value);
        }
        Segment::Index(index) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            let array = target.as_array_mut().expect("just ensured array");
            while array.len() <= *index {
                array.push(Value::Null);
            }
            insert(&mut array[*index], rest, value);
        }
    }
}

/// Filter a full document down to the requested paths. Paths missing from
/// the document are skipped.
pub fn project_document(doc: &Value, paths: &[String]) -> Result<Value, KvError> {
    let mut out = Value::Object(serde_json::Map::new());
    for path in paths {
        let segments = parse_path(path)?;
        if let Some(found) = lookup(doc, &segments) {
            insert(&mut out, &segments, found.clone());
        }
    }
    Ok(out)
}

/// Rebuild a partial document from per-path sub-document results.
pub fn assemble(paths: &[String], values: Vec<Option<Value>>) -> Result<Value, KvError> {
    debug_assert_eq!(paths.len(), values.len());
    let mut out = Value::Object(serde_json::Map::new());
    for (path, value) in paths.iter().zip(values) {
        let Some(value) = value else { continue };
        let segments = parse_path(path)?;
        insert(&mut out, &segments, value);
    }
    Ok(out)
}
