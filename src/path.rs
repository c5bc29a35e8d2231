//! Path engine (spec §4.1): get/set/delete/exists/move over a heterogeneous
//! JSON-shaped tree using paths like `a.b[0].c`.
//!
//! Grounded on `holonic_engine/agent.py`'s `_parse_path`/`_get_value_at_path`/
//! `_set_value_at_path`/`_delete_at_path`, generalized into one path module
//! shared by knowledge, purpose, and self-state operations (spec §9 open
//! question 3: numeric index wins over string key when the container is a
//! sequence).

use serde_json::Value;

use crate::error::PathError;

/// One segment of a parsed path: a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A `.word` or `[word]` map key.
    Key(String),
    /// A `[n]` sequence index.
    Index(usize),
}

/// A parsed path: an ordered list of segments. The empty list denotes root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path(pub Vec<Segment>);

impl Path {
    /// The empty (root) path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// True if this path denotes the root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a path string of the form `word(.word|[index]|[word])*`.
    ///
    /// An empty string parses to the root path.
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            return Self::root();
        }

        let mut segments = Vec::new();
        let mut chars = path.char_indices().peekable();
        let bytes = path.as_bytes();
        let mut cursor = 0usize;

        while cursor < bytes.len() {
            if bytes[cursor] == b'.' {
                cursor += 1;
                continue;
            }
            if bytes[cursor] == b'[' {
                let end = path[cursor..]
                    .find(']')
                    .map(|i| cursor + i)
                    .unwrap_or(path.len());
                let inner = &path[cursor + 1..end.min(path.len())];
                if let Ok(n) = inner.parse::<usize>() {
                    segments.push(Segment::Index(n));
                } else {
                    segments.push(Segment::Key(inner.to_owned()));
                }
                cursor = end + 1;
                continue;
            }
            // Bare word segment up to the next '.' or '['.
            let rest = &path[cursor..];
            let word_end = rest
                .find(['.', '['])
                .map(|i| cursor + i)
                .unwrap_or(path.len());
            segments.push(Segment::Key(path[cursor..word_end].to_owned()));
            cursor = word_end;
        }

        let _ = chars.peek(); // silence unused mut warnings on some toolchains
        Self(segments)
    }
}

/// Traverse `root` by `path`, returning a reference to the value found.
///
/// # Errors
///
/// Returns [`PathError::NotFound`] if any segment cannot be resolved.
pub fn get<'a>(root: &'a Value, path: &Path) -> Result<&'a Value, PathError> {
    let mut current = root;
    for segment in &path.0 {
        current = step(current, segment)?;
    }
    Ok(current)
}

fn step<'a>(current: &'a Value, segment: &Segment) -> Result<&'a Value, PathError> {
    match (current, segment) {
        (Value::Object(map), Segment::Key(k)) => map
            .get(k)
            .ok_or_else(|| PathError::NotFound(k.clone())),
        (Value::Array(arr), Segment::Index(i)) => {
            arr.get(*i).ok_or_else(|| PathError::NotFound(format!("[{i}]")))
        }
        // A numeric-looking key against a map still resolves by string key
        // (spec §9 open question 3: numeric index wins only when the
        // container is actually a sequence).
        (Value::Object(map), Segment::Index(i)) => map
            .get(&i.to_string())
            .ok_or_else(|| PathError::NotFound(format!("[{i}]"))),
        (_, seg) => Err(PathError::NotFound(format!("{seg:?}"))),
    }
}

/// Check whether `path` resolves within `root`.
pub fn exists(root: &Value, path: &Path) -> bool {
    get(root, path).is_ok()
}

/// Set `value` at `path` within `root`, creating intermediate maps as
/// needed. Indices into sequences must already exist.
///
/// # Errors
///
/// Returns [`PathError::Empty`] if `path` is the root, or
/// [`PathError::NotFound`] if an intermediate sequence index is missing.
pub fn set(root: &mut Value, path: &Path, value: Value) -> Result<(), PathError> {
    if path.is_root() {
        return Err(PathError::Empty);
    }

    let mut current = root;
    let (last, init) = path.0.split_last().expect("non-empty path");

    for segment in init {
        current = step_mut_create(current, segment)?;
    }

    match (current, last) {
        (Value::Object(map), Segment::Key(k)) => {
            map.insert(k.clone(), value);
        }
        (Value::Object(map), Segment::Index(i)) => {
            map.insert(i.to_string(), value);
        }
        (Value::Array(arr), Segment::Index(i)) => {
            if *i >= arr.len() {
                return Err(PathError::NotFound(format!("[{i}]")));
            }
            arr[*i] = value;
        }
        (Value::Array(_), Segment::Key(k)) => {
            return Err(PathError::NotFound(k.clone()));
        }
        (other, seg) => {
            // A scalar/null in the way of a set is replaced by a fresh map,
            // mirroring the Python original's implicit dict creation.
            let mut map = serde_json::Map::new();
            match seg {
                Segment::Key(k) => {
                    map.insert(k.clone(), value);
                }
                Segment::Index(i) => {
                    map.insert(i.to_string(), value);
                }
            }
            *other = Value::Object(map);
        }
    }

    Ok(())
}

fn step_mut_create<'a>(current: &'a mut Value, segment: &Segment) -> Result<&'a mut Value, PathError> {
    if matches!(current, Value::Null) {
        *current = Value::Object(serde_json::Map::new());
    }

    match (current, segment) {
        (Value::Object(map), Segment::Key(k)) => Ok(map.entry(k.clone()).or_insert(Value::Null)),
        (Value::Object(map), Segment::Index(i)) => {
            Ok(map.entry(i.to_string()).or_insert(Value::Null))
        }
        (Value::Array(arr), Segment::Index(i)) => {
            arr.get_mut(*i).ok_or_else(|| PathError::NotFound(format!("[{i}]")))
        }
        (_, seg) => Err(PathError::NotFound(format!("{seg:?}"))),
    }
}

/// Delete the value at `path` within `root`.
///
/// # Errors
///
/// Returns [`PathError::Empty`] for the root path, or
/// [`PathError::NotFound`] if the path does not resolve.
pub fn delete(root: &mut Value, path: &Path) -> Result<(), PathError> {
    if path.is_root() {
        return Err(PathError::Empty);
    }

    let (last, init) = path.0.split_last().expect("non-empty path");
    let mut current = root;
    for segment in init {
        current = step_mut(current, segment)?;
    }

    match (current, last) {
        (Value::Object(map), Segment::Key(k)) => {
            map.remove(k).map(|_| ()).ok_or_else(|| PathError::NotFound(k.clone()))
        }
        (Value::Object(map), Segment::Index(i)) => map
            .remove(&i.to_string())
            .map(|_| ())
            .ok_or_else(|| PathError::NotFound(format!("[{i}]"))),
        (Value::Array(arr), Segment::Index(i)) => {
            if *i < arr.len() {
                arr.remove(*i);
                Ok(())
            } else {
                Err(PathError::NotFound(format!("[{i}]")))
            }
        }
        (_, seg) => Err(PathError::NotFound(format!("{seg:?}"))),
    }
}

fn step_mut<'a>(current: &'a mut Value, segment: &Segment) -> Result<&'a mut Value, PathError> {
    match (current, segment) {
        (Value::Object(map), Segment::Key(k)) => {
            map.get_mut(k).ok_or_else(|| PathError::NotFound(k.clone()))
        }
        (Value::Array(arr), Segment::Index(i)) => {
            arr.get_mut(*i).ok_or_else(|| PathError::NotFound(format!("[{i}]")))
        }
        (Value::Object(map), Segment::Index(i)) => map
            .get_mut(&i.to_string())
            .ok_or_else(|| PathError::NotFound(format!("[{i}]"))),
        (_, seg) => Err(PathError::NotFound(format!("{seg:?}"))),
    }
}

/// Move the value at `from` to `to`: get, then set, then delete. Atomic in
/// the sense that if `get` or `set` fails, `from` is left untouched.
///
/// # Errors
///
/// Propagates [`PathError`] from any of the three underlying steps.
pub fn move_path(root: &mut Value, from: &Path, to: &Path) -> Result<(), PathError> {
    let value = get(root, from)?.clone();
    set(root, to, value)?;
    delete(root, from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_dotted_and_bracketed_paths() {
        let p = Path::parse("a.b[0].c");
        assert_eq!(
            p.0,
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(0),
                Segment::Key("c".into()),
            ]
        );
    }

    #[test]
    fn parse_bracketed_string_key() {
        let p = Path::parse("users[alice].email");
        assert_eq!(
            p.0,
            vec![
                Segment::Key("users".into()),
                Segment::Key("alice".into()),
                Segment::Key("email".into()),
            ]
        );
    }

    #[test]
    fn empty_path_is_root() {
        assert!(Path::parse("").is_root());
    }

    #[test]
    fn get_set_roundtrip() {
        let mut root = json!({"a": {"b": [1, 2, 3]}});
        let p = Path::parse("a.b[1]");
        set(&mut root, &p, json!(42)).unwrap();
        assert_eq!(get(&root, &p).unwrap(), &json!(42));
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut root = json!({});
        let p = Path::parse("x.y.z");
        set(&mut root, &p, json!("hi")).unwrap();
        assert_eq!(root, json!({"x": {"y": {"z": "hi"}}}));
    }

    #[test]
    fn set_into_sequence_requires_existing_index() {
        let mut root = json!({"a": []});
        let p = Path::parse("a[0]");
        let err = set(&mut root, &p, json!(1)).unwrap_err();
        assert_eq!(err, PathError::NotFound("[0]".into()));
    }

    #[test]
    fn delete_then_exists_false() {
        let mut root = json!({"a": {"b": 1}});
        let p = Path::parse("a.b");
        delete(&mut root, &p).unwrap();
        assert!(!exists(&root, &p));
    }

    #[test]
    fn empty_path_rejected_by_set_and_delete() {
        let mut root = json!({});
        assert_eq!(set(&mut root, &Path::root(), json!(1)), Err(PathError::Empty));
        assert_eq!(delete(&mut root, &Path::root()), Err(PathError::Empty));
    }

    #[test]
    fn move_relocates_value() {
        let mut root = json!({"a": 1});
        let from = Path::parse("a");
        let to = Path::parse("b");
        move_path(&mut root, &from, &to).unwrap();
        assert_eq!(root, json!({"b": 1}));
    }

    #[test]
    fn numeric_index_wins_over_string_key_on_sequences() {
        let mut root = json!({"arr": [10, 20, 30]});
        let p = Path::parse("arr[1]");
        assert_eq!(get(&root, &p).unwrap(), &json!(20));
        set(&mut root, &p, json!(99)).unwrap();
        assert_eq!(root["arr"][1], json!(99));
    }

    #[test]
    fn numeric_looking_key_against_map_falls_back_to_string_key() {
        let root = json!({"m": {"3": "three"}});
        let p = Path::parse("m[3]");
        assert_eq!(get(&root, &p).unwrap(), &json!("three"));
    }

    #[test]
    fn not_found_on_missing_key() {
        let root = json!({"a": 1});
        let err = get(&root, &Path::parse("missing")).unwrap_err();
        assert_eq!(err, PathError::NotFound("missing".into()));
    }
}
