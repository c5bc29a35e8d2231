//! Action registry.
//!
//! Grounded on `holon_ai/action.py`'s `HolonAction`/`ActionSignature`:
//! there, a signature is derived from Python's runtime introspection of the
//! callback. Rust has no such introspection, so callers declare the
//! signature explicitly at registration time — the shape (`ActionParameter`,
//! `ActionSignature`) is carried over unchanged so the HUD converter
//! (`crate::hud`) emits the same fields either way.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ActionError;

/// A single parameter in an action's declared signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionParameter {
    /// Parameter name.
    pub name: String,
    /// Optional human-readable type hint (e.g. `"string"`, `"int"`).
    pub type_hint: Option<String>,
    /// Default value, if any, serialized as JSON.
    pub default: Option<Value>,
}

impl ActionParameter {
    /// A required parameter with no default.
    pub fn required(name: impl Into<String>, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: Some(type_hint.into()),
            default: None,
        }
    }

    /// An optional parameter with a default value.
    pub fn optional(name: impl Into<String>, type_hint: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            type_hint: Some(type_hint.into()),
            default: Some(default),
        }
    }

    /// Whether this parameter has a default (making it optional).
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// Declared signature of an action's callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSignature {
    /// Ordered parameters.
    pub parameters: Vec<ActionParameter>,
    /// Optional return type hint.
    pub return_type: Option<String>,
    /// Optional human-readable description of the action.
    pub doc: Option<String>,
}

impl ActionSignature {
    /// Build a signature from parameters, with no return type or doc.
    pub fn new(parameters: Vec<ActionParameter>) -> Self {
        Self {
            parameters,
            return_type: None,
            doc: None,
        }
    }

    /// Attach a return type hint.
    pub fn with_return_type(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = Some(return_type.into());
        self
    }

    /// Attach a doc string.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

/// An action's callback: receives keyword-style arguments, returns a JSON
/// result or an execution failure.
pub type ActionCallback = Arc<dyn Fn(&BTreeMap<String, Value>) -> Result<Value, String> + Send + Sync>;

/// A named, callable action with declared metadata for AI consumption.
#[derive(Clone)]
pub struct Action {
    name: String,
    purpose: Option<String>,
    signature: ActionSignature,
    callback: ActionCallback,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("purpose", &self.purpose)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl Action {
    /// Construct a new action.
    pub fn new(
        name: impl Into<String>,
        purpose: Option<String>,
        signature: ActionSignature,
        callback: ActionCallback,
    ) -> Self {
        Self {
            name: name.into(),
            purpose,
            signature,
            callback,
        }
    }

    /// This action's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This action's human-readable purpose, if any.
    pub fn purpose(&self) -> Option<&str> {
        self.purpose.as_deref()
    }

    /// This action's declared signature.
    pub fn signature(&self) -> &ActionSignature {
        &self.signature
    }

    /// Execute this action's callback with the given keyword arguments,
    /// first checking that every non-defaulted parameter was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::MissingParameter`] if a required parameter is
    /// absent, or [`ActionError::Failed`] if the callback itself errors.
    pub fn execute(&self, kwargs: &BTreeMap<String, Value>) -> Result<Value, ActionError> {
        for param in &self.signature.parameters {
            if !param.has_default() && !kwargs.contains_key(&param.name) {
                return Err(ActionError::MissingParameter {
                    action: self.name.clone(),
                    param: param.name.clone(),
                });
            }
        }

        (self.callback)(kwargs).map_err(|reason| ActionError::Failed {
            action: self.name.clone(),
            reason,
        })
    }
}

/// An ordered, name-indexed collection of actions available to an agent.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    order: Vec<String>,
    actions: BTreeMap<String, Action>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, replacing any existing action of the same name
    /// in place (preserving its position in iteration order).
    pub fn add(&mut self, action: Action) {
        let name = action.name().to_owned();
        if !self.actions.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.actions.insert(name, action);
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// Iterate actions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.order.iter().filter_map(move |name| self.actions.get(name))
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True if no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Dispatch a call to the named action with the given keyword arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] if no action is registered under
    /// `name`, or propagates [`Action::execute`]'s errors.
    pub fn dispatch(&self, name: &str, kwargs: &BTreeMap<String, Value>) -> Result<Value, ActionError> {
        self.get(name)
            .ok_or_else(|| ActionError::NotFound(name.to_owned()))?
            .execute(kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_action() -> Action {
        Action::new(
            "echo",
            Some("echoes its input".into()),
            ActionSignature::new(vec![ActionParameter::required("text", "string")])
                .with_return_type("string"),
            Arc::new(|kwargs| {
                Ok(kwargs.get("text").cloned().unwrap_or(Value::Null))
            }),
        )
    }

    #[test]
    fn dispatch_calls_registered_action() {
        let mut registry = ActionRegistry::new();
        registry.add(echo_action());
        let mut kwargs = BTreeMap::new();
        kwargs.insert("text".into(), json!("hi"));
        assert_eq!(registry.dispatch("echo", &kwargs).unwrap(), json!("hi"));
    }

    #[test]
    fn dispatch_unknown_action_errors() {
        let registry = ActionRegistry::new();
        let err = registry.dispatch("missing", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ActionError::NotFound(name) if name == "missing"));
    }

    #[test]
    fn missing_required_parameter_errors() {
        let mut registry = ActionRegistry::new();
        registry.add(echo_action());
        let err = registry.dispatch("echo", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ActionError::MissingParameter { .. }));
    }

    #[test]
    fn optional_parameter_may_be_omitted() {
        let mut registry = ActionRegistry::new();
        registry.add(Action::new(
            "greet",
            None,
            ActionSignature::new(vec![ActionParameter::optional(
                "name",
                "string",
                json!("world"),
            )]),
            Arc::new(|kwargs| {
                let name = kwargs.get("name").cloned().unwrap_or(json!("world"));
                Ok(json!(format!("hello {}", name.as_str().unwrap_or("world"))))
            }),
        ));
        assert_eq!(
            registry.dispatch("greet", &BTreeMap::new()).unwrap(),
            json!("hello world")
        );
    }

    #[test]
    fn re_registering_same_name_replaces_in_place() {
        let mut registry = ActionRegistry::new();
        registry.add(echo_action());
        registry.add(Action::new(
            "echo",
            Some("v2".into()),
            ActionSignature::default(),
            Arc::new(|_| Ok(json!("v2"))),
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().purpose(), Some("v2"));
    }
}
