//! Binding container (purpose/self state holders).
//!
//! Grounded on `holon_ai/containers.py`'s `HolonBinding`/`HolonPurpose`/
//! `HolonSelf`: an ordered list of bindings, each either a static value or a
//! zero-argument callable resolved at read time, each optionally keyed.
//! `serialize()` picks list/dict/mixed shape from the keyedness of the
//! items, exactly as the original does for both purpose and self (the two
//! Python classes are structurally identical beyond nested-agent
//! resolution, which this module folds into one `Source::Agent` variant).

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Where a binding's value comes from.
#[derive(Clone)]
pub enum Source {
    /// A static value, returned as-is.
    Literal(Value),
    /// A zero-argument callable resolved on every read.
    Dynamic(Arc<dyn Fn() -> Value + Send + Sync>),
    /// A reference to a nested agent, resolved via its HUD snapshot by the
    /// caller (stored as the agent's id; `crate::agent` supplies the
    /// resolver since `Binding` itself has no access to the tree).
    AgentRef(String),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Self::Dynamic(_) => f.debug_tuple("Dynamic").field(&"<fn>").finish(),
            Self::AgentRef(id) => f.debug_tuple("AgentRef").field(id).finish(),
        }
    }
}

/// One entry in a [`Bindings`] container.
#[derive(Debug, Clone)]
pub struct Binding {
    source: Source,
    key: Option<String>,
}

impl Binding {
    /// A static-value binding.
    pub fn literal(value: Value, key: Option<String>) -> Self {
        Self {
            source: Source::Literal(value),
            key,
        }
    }

    /// A dynamic, callable binding resolved fresh on every read.
    pub fn dynamic(f: Arc<dyn Fn() -> Value + Send + Sync>, key: Option<String>) -> Self {
        Self {
            source: Source::Dynamic(f),
            key,
        }
    }

    /// A binding to a nested agent's HUD, resolved by id.
    pub fn agent_ref(agent_id: String, key: Option<String>) -> Self {
        Self {
            source: Source::AgentRef(agent_id),
            key,
        }
    }

    /// This binding's key, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Resolve this binding's value. Agent references resolve through
    /// `resolve_agent_ref`, which the caller supplies (normally a closure
    /// looking up the agent's HUD snapshot in the tree).
    pub fn resolve(&self, resolve_agent_ref: &dyn Fn(&str) -> Value) -> Value {
        match &self.source {
            Source::Literal(v) => v.clone(),
            Source::Dynamic(f) => f(),
            Source::AgentRef(id) => resolve_agent_ref(id),
        }
    }
}

/// An ordered collection of [`Binding`]s, shared by purpose and self state.
///
/// Serialization shape depends on keyedness of the items:
/// - all items keyed → a JSON object
/// - no items keyed → a JSON array
/// - mixed → a JSON array with keyed items wrapped as single-key objects
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    items: Vec<Binding>,
}

impl Bindings {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding, returning `self` for chained construction.
    pub fn add(mut self, binding: Binding) -> Self {
        self.items.push(binding);
        self
    }

    /// Append a binding in place.
    pub fn push(&mut self, binding: Binding) {
        self.items.push(binding);
    }

    /// Number of bindings held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if no bindings are held.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn has_any_keys(&self) -> bool {
        self.items.iter().any(|b| b.key.is_some())
    }

    fn all_have_keys(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|b| b.key.is_some())
    }

    /// Get the literal value stored under `key`, if any binding carries it.
    pub fn get_literal(&self, key: &str) -> Option<Value> {
        self.items.iter().find(|b| b.key() == Some(key)).and_then(|b| match &b.source {
            Source::Literal(v) => Some(v.clone()),
            _ => None,
        })
    }

    /// True if some binding carries `key`.
    pub fn exists_literal(&self, key: &str) -> bool {
        self.items.iter().any(|b| b.key() == Some(key))
    }

    /// Insert or overwrite the literal binding under `key`.
    pub fn set_literal(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.items.retain(|b| b.key() != Some(key.as_str()));
        self.items.push(Binding::literal(value, Some(key)));
    }

    /// Remove the binding under `key`, if any. Returns `true` if removed.
    pub fn delete_literal(&mut self, key: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|b| b.key() != Some(key));
        self.items.len() != before
    }

    /// Resolve every binding in order, as a plain list.
    pub fn resolve_all(&self, resolve_agent_ref: &dyn Fn(&str) -> Value) -> Vec<Value> {
        self.items.iter().map(|b| b.resolve(resolve_agent_ref)).collect()
    }

    /// Smart-serialize this container to list, dict, or mixed shape.
    pub fn serialize(&self, resolve_agent_ref: &dyn Fn(&str) -> Value) -> Value {
        if self.items.is_empty() {
            return Value::Array(Vec::new());
        }

        if self.all_have_keys() {
            let mut map = serde_json::Map::new();
            for item in &self.items {
                let key = item.key().expect("all_have_keys guarantees Some").to_owned();
                map.insert(key, item.resolve(resolve_agent_ref));
            }
            return Value::Object(map);
        }

        if !self.has_any_keys() {
            return Value::Array(self.resolve_all(resolve_agent_ref));
        }

        let mut result = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let value = item.resolve(resolve_agent_ref);
            match item.key() {
                Some(key) => {
                    let mut map = serde_json::Map::new();
                    map.insert(key.to_owned(), value);
                    result.push(Value::Object(map));
                }
                None => result.push(value),
            }
        }
        Value::Array(result)
    }

    /// Serialize only the literal leaves, in the same list/dict/mixed shape
    /// as [`serialize`](Self::serialize), dropping dynamic callables and
    /// agent references. This is the lossy-by-design persistence view: a
    /// store round-trip only ever needs to reproduce static state, since
    /// dynamic leaves are re-registered by the agent constructor on restore.
    pub fn to_static_json(&self) -> Value {
        let literals: Vec<&Binding> = self
            .items
            .iter()
            .filter(|b| matches!(b.source, Source::Literal(_)))
            .collect();

        if literals.is_empty() {
            return Value::Array(Vec::new());
        }

        let all_keyed = literals.iter().all(|b| b.key().is_some());
        let any_keyed = literals.iter().any(|b| b.key().is_some());

        let value_of = |b: &Binding| match &b.source {
            Source::Literal(v) => v.clone(),
            _ => unreachable!("filtered to literals only"),
        };

        if all_keyed {
            let mut map = serde_json::Map::new();
            for item in &literals {
                map.insert(item.key().expect("all_keyed guarantees Some").to_owned(), value_of(item));
            }
            return Value::Object(map);
        }

        if !any_keyed {
            return Value::Array(literals.iter().map(|b| value_of(b)).collect());
        }

        let mut result = Vec::with_capacity(literals.len());
        for item in &literals {
            let value = value_of(item);
            match item.key() {
                Some(key) => {
                    let mut map = serde_json::Map::new();
                    map.insert(key.to_owned(), value);
                    result.push(Value::Object(map));
                }
                None => result.push(value),
            }
        }
        Value::Array(result)
    }

    /// Reconstruct a literal-only `Bindings` from a value previously
    /// produced by [`to_static_json`](Self::to_static_json).
    pub fn from_static_json(value: &Value) -> Self {
        let mut bindings = Self::new();
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    bindings.push(Binding::literal(v.clone(), Some(key.clone())));
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(map) = item {
                        if map.len() == 1 {
                            let (key, v) = map.iter().next().expect("len == 1");
                            bindings.push(Binding::literal(v.clone(), Some(key.clone())));
                            continue;
                        }
                    }
                    bindings.push(Binding::literal(item.clone(), None));
                }
            }
            other => bindings.push(Binding::literal(other.clone(), None)),
        }
        bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_agents(_: &str) -> Value {
        Value::Null
    }

    #[test]
    fn empty_container_serializes_to_empty_array() {
        let bindings = Bindings::new();
        assert_eq!(bindings.serialize(&no_agents), json!([]));
    }

    #[test]
    fn unkeyed_items_serialize_as_list() {
        let bindings = Bindings::new()
            .add(Binding::literal(json!("a"), None))
            .add(Binding::literal(json!("b"), None));
        assert_eq!(bindings.serialize(&no_agents), json!(["a", "b"]));
    }

    #[test]
    fn fully_keyed_items_serialize_as_dict() {
        let bindings = Bindings::new()
            .add(Binding::literal(json!(1), Some("x".into())))
            .add(Binding::literal(json!(2), Some("y".into())));
        assert_eq!(bindings.serialize(&no_agents), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn mixed_keys_serialize_as_list_with_embedded_dicts() {
        let bindings = Bindings::new()
            .add(Binding::literal(json!("bare"), None))
            .add(Binding::literal(json!(42), Some("answer".into())));
        assert_eq!(
            bindings.serialize(&no_agents),
            json!(["bare", {"answer": 42}])
        );
    }

    #[test]
    fn dynamic_binding_resolves_fresh_each_call() {
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let c = counter.clone();
        let binding = Binding::dynamic(
            Arc::new(move || {
                let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                json!(n)
            }),
            None,
        );
        assert_eq!(binding.resolve(&no_agents), json!(0));
        assert_eq!(binding.resolve(&no_agents), json!(1));
    }

    #[test]
    fn set_literal_upserts_in_place() {
        let mut bindings = Bindings::new();
        bindings.set_literal("x", json!(1));
        bindings.set_literal("x", json!(2));
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.get_literal("x"), Some(json!(2)));
    }

    #[test]
    fn delete_literal_removes_matching_key() {
        let mut bindings = Bindings::new();
        bindings.set_literal("x", json!(1));
        assert!(bindings.delete_literal("x"));
        assert!(!bindings.exists_literal("x"));
        assert!(!bindings.delete_literal("x"));
    }

    #[test]
    fn agent_ref_resolves_through_supplied_lookup() {
        let binding = Binding::agent_ref("child-1".into(), Some("child".into()));
        let resolver = |id: &str| json!({"id": id});
        assert_eq!(binding.resolve(&resolver), json!({"id": "child-1"}));
    }
}
