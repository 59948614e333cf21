//! Owner scoping for multi-tenant capabilities. Terminal session ids are
//! rewritten to `<owner_id>/<raw_id>` before a payload leaves the console
//! and stripped back before a result is persisted, so one owner can never
//! name another owner's terminal sessions.

use boxgrid_common::model::is_terminal_capability;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Field {0} has an unexpected shape")]
    UnexpectedShape(&'static str),
    #[error("Payload references a session outside the owner scope")]
    ForeignScope,
}

pub fn scoped_session_id(owner_id: &str, session_id: &str) -> String {
    format!("{owner_id}/{session_id}")
}

/// Rewrites a submitted input payload before dispatch.
pub fn scope_input(capability: &str, owner_id: &str, mut input: Value) -> Result<Value, ScopeError> {
    if !is_terminal_capability(capability) {
        return Ok(input);
    }
    let Value::Object(fields) = &mut input else {
        return Err(ScopeError::NotAnObject);
    };
    match fields.get("session_id") {
        None | Some(Value::Null) => Ok(input),
        Some(Value::String(session_id)) if session_id.is_empty() => Ok(input),
        Some(Value::String(session_id)) => {
            let scoped = scoped_session_id(owner_id, session_id);
            fields.insert("session_id".to_string(), Value::String(scoped));
            Ok(input)
        }
        Some(_) => Err(ScopeError::UnexpectedShape("session_id")),
    }
}

/// Rewrites a worker result payload before persistence. A payload that
/// cannot be re-scoped must not be persisted; callers fail the task with
/// `invalid_scoped_payload` instead.
pub fn unscope_result(
    capability: &str,
    owner_id: &str,
    payload_json: &str,
) -> Result<String, ScopeError> {
    if !is_terminal_capability(capability) {
        return Ok(payload_json.to_string());
    }
    let mut payload: Value =
        serde_json::from_str(payload_json).map_err(|_| ScopeError::NotAnObject)?;
    let Value::Object(fields) = &mut payload else {
        return Err(ScopeError::NotAnObject);
    };
    match fields.get("session_id") {
        None | Some(Value::Null) => Ok(payload.to_string()),
        Some(Value::String(session_id)) => {
            let prefix = format!("{owner_id}/");
            let raw = session_id
                .strip_prefix(&prefix)
                .ok_or(ScopeError::ForeignScope)?
                .to_string();
            fields.insert("session_id".to_string(), Value::String(raw));
            Ok(payload.to_string())
        }
        Some(_) => Err(ScopeError::UnexpectedShape("session_id")),
    }
}
