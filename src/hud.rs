//! HUD converter.
//!
//! Grounded on `holonic_engine/converter.py`'s `HolonConverter.unstructure_holon`
//! and `agent.py`'s `to_dict` (the latter is where `hud_tokens` is computed,
//! over the JSON-serialized HUD body *before* `hud_tokens` itself is
//! inserted — that ordering is load-bearing and preserved here exactly).

use serde_json::Value;

use crate::action::{Action, ActionParameter, ActionRegistry, ActionSignature};
use crate::tokens::TokenCounter;

/// Convert a declared action parameter to its HUD field shape.
///
/// Field omission mirrors the original: `type` is omitted with no type
/// hint, `default` is omitted unless the parameter has one.
fn action_parameter_to_json(param: &ActionParameter) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("name".into(), Value::String(param.name.clone()));
    if let Some(type_hint) = &param.type_hint {
        map.insert("type".into(), Value::String(type_hint.clone()));
    }
    if let Some(default) = &param.default {
        map.insert("default".into(), default.clone());
    }
    Value::Object(map)
}

fn signature_fields(sig: &ActionSignature) -> (Value, Option<&str>, Option<&str>) {
    let params = Value::Array(sig.parameters.iter().map(action_parameter_to_json).collect());
    (params, sig.return_type.as_deref(), sig.doc.as_deref())
}

/// Convert a single action to its HUD field shape: `name`, optional
/// `purpose`, `parameters`, optional `returns`/`docstring`.
pub fn action_to_json(action: &Action) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("name".into(), Value::String(action.name().to_owned()));
    if let Some(purpose) = action.purpose() {
        map.insert("purpose".into(), Value::String(purpose.to_owned()));
    }

    let (params, returns, docstring) = signature_fields(action.signature());
    map.insert("parameters".into(), params);
    if let Some(returns) = returns {
        map.insert("returns".into(), Value::String(returns.to_owned()));
    }
    if let Some(docstring) = docstring {
        map.insert("docstring".into(), Value::String(docstring.to_owned()));
    }

    Value::Object(map)
}

fn actions_to_json(actions: &ActionRegistry) -> Option<Value> {
    if actions.is_empty() {
        return None;
    }
    Some(Value::Array(actions.iter().map(action_to_json).collect()))
}

/// Build an agent's HUD: `{purpose?, self?, actions?}` plus a trailing
/// `hud_tokens` field counting the tokens of the HUD body computed *before*
/// `hud_tokens` is added.
///
/// `purpose` and `self_state` are pre-serialized `Value`s (typically the
/// output of `crate::binding::Bindings::serialize`); an empty array/object
/// is treated as absent, matching the original's `if purpose_data:` /
/// `if self_data:` truthiness checks.
pub fn build_hud(
    purpose: &Value,
    self_state: &Value,
    actions: &ActionRegistry,
    counter: &dyn TokenCounter,
) -> Value {
    let mut map = serde_json::Map::new();

    if !is_empty_collection(purpose) {
        map.insert("purpose".into(), purpose.clone());
    }
    if !is_empty_collection(self_state) {
        map.insert("self".into(), self_state.clone());
    }
    if let Some(actions_json) = actions_to_json(actions) {
        map.insert("actions".into(), actions_json);
    }

    let body = Value::Object(map);
    let hud_tokens = counter.count(&body.to_string());

    let mut with_tokens = match body {
        Value::Object(m) => m,
        _ => unreachable!("body is always an object"),
    };
    with_tokens.insert("hud_tokens".into(), Value::from(hud_tokens));
    Value::Object(with_tokens)
}

fn is_empty_collection(value: &Value) -> bool {
    match value {
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn empty_holon_has_only_hud_tokens() {
        let actions = ActionRegistry::new();
        let counter = HeuristicTokenCounter::default();
        let hud = build_hud(&json!([]), &json!([]), &actions, &counter);
        let obj = hud.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("hud_tokens"));
    }

    #[test]
    fn hud_tokens_reflects_body_without_itself() {
        let actions = ActionRegistry::new();
        let counter = HeuristicTokenCounter::default();
        let purpose = json!(["be helpful"]);
        let hud = build_hud(&purpose, &json!([]), &actions, &counter);

        let mut body_without_tokens = hud.as_object().unwrap().clone();
        body_without_tokens.remove("hud_tokens");
        let expected = counter.count(&Value::Object(body_without_tokens).to_string());

        assert_eq!(hud["hud_tokens"], json!(expected));
    }

    #[test]
    fn actions_include_parameters_and_omit_absent_fields() {
        let mut actions = ActionRegistry::new();
        actions.add(Action::new(
            "sleep",
            Some("pause the next heartbeat".into()),
            ActionSignature::new(vec![ActionParameter::required("seconds", "int")]),
            Arc::new(|_| Ok(json!(null))),
        ));
        let counter = HeuristicTokenCounter::default();
        let hud = build_hud(&json!([]), &json!([]), &actions, &counter);

        let action_json = &hud["actions"][0];
        assert_eq!(action_json["name"], json!("sleep"));
        assert_eq!(action_json["purpose"], json!("pause the next heartbeat"));
        assert!(action_json.get("returns").is_none());
        assert!(action_json.get("docstring").is_none());
    }
}
