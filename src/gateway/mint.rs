//! Mint endpoint request validation
//!
//! Validation is ordered and strict: the rules below are checked top to
//! bottom and the first failure is returned verbatim as a 400. Rule order
//! and messages are part of the observable API, which is why this works on
//! a raw JSON map instead of a derived struct.

use serde_json::Value;

use crate::scopes::{Permission, PermissionSpec, ScopeRegistry};
use crate::{Error, Result};

/// Top-level keys the mint endpoint understands.
const KNOWN_KEYS: &[&str] = &["token", "scope", "scopes", "allowed"];

/// Validated parameters for a mint request.
#[derive(Debug)]
pub struct MintRequest {
    /// The upstream API secret to hide inside the token.
    pub upstream_secret: String,
    /// Named scopes, when the caller chose the scope form.
    pub scopes: Option<Vec<String>>,
    /// Inline permissions, when the caller chose the allowed form.
    pub allowed: Option<Vec<PermissionSpec>>,
}

/// Validate a mint request body.
///
/// Enforced in order, first failure wins:
/// 1. the body is a non-empty JSON object,
/// 2. `token` is present and a string,
/// 3. exactly one of `allowed` and `scope`/`scopes` is present,
/// 4. every named scope exists on this proxy,
/// 5. every `allowed` entry parses as `"METHOD path_regex"`,
/// 6. no unrecognized top-level keys.
pub fn validate(registry: &ScopeRegistry, body: &Value) -> Result<MintRequest> {
    let Some(params) = body.as_object().filter(|map| !map.is_empty()) else {
        return Err(Error::MintRequest("Request must be json".to_string()));
    };

    let Some(token) = params.get("token") else {
        return Err(Error::MintRequest(
            "We need a token for the API behind, in the 'token' field".to_string(),
        ));
    };
    let Some(upstream_secret) = token.as_str() else {
        return Err(Error::MintRequest("token must be a string".to_string()));
    };

    let has_scope_form = params.contains_key("scope") || params.contains_key("scopes");
    if has_scope_form && params.contains_key("allowed") {
        return Err(Error::MintRequest(
            "allowed (spelling out the allowed requests) \
             OR scope/scopes (naming one or more scopes configured on the proxy), not both"
                .to_string(),
        ));
    }

    let mut scopes = None;
    let mut allowed = None;

    if has_scope_form {
        scopes = Some(validate_scope_names(registry, params)?);
    } else if let Some(value) = params.get("allowed") {
        allowed = Some(validate_allowed(value)?);
    } else {
        return Err(Error::MintRequest(
            "need one of allowed (spelling out the allowed requests) \
             OR scopes (naming a scope configured on the proxy)"
                .to_string(),
        ));
    }

    if let Some(unknown) = params.keys().find(|key| !KNOWN_KEYS.contains(&key.as_str())) {
        return Err(Error::MintRequest(format!(
            "unrecognized field {unknown:?}"
        )));
    }

    Ok(MintRequest {
        upstream_secret: upstream_secret.to_string(),
        scopes,
        allowed,
    })
}

fn validate_scope_names(
    registry: &ScopeRegistry,
    params: &serde_json::Map<String, Value>,
) -> Result<Vec<String>> {
    let mut names = Vec::new();

    if let Some(value) = params.get("scope") {
        let Some(name) = value.as_str() else {
            return Err(Error::MintRequest("scope must be a string".to_string()));
        };
        names.push(name.to_string());
    }

    if let Some(value) = params.get("scopes") {
        let Some(list) = value.as_array() else {
            return Err(Error::MintRequest(
                "scopes must be a list of strings".to_string(),
            ));
        };
        for item in list {
            let Some(name) = item.as_str() else {
                return Err(Error::MintRequest("scope must be a string".to_string()));
            };
            names.push(name.to_string());
        }
    }

    for name in &names {
        if !registry.contains(name) {
            return Err(Error::MintRequest(format!(
                "scope must be configured on the proxy (valid: {})",
                registry.sorted_names().join(" ")
            )));
        }
    }

    Ok(names)
}

fn validate_allowed(value: &Value) -> Result<Vec<PermissionSpec>> {
    let Some(list) = value.as_array() else {
        return Err(Error::MintRequest(
            "allowed must be a list of strings".to_string(),
        ));
    };

    let mut rules = Vec::new();
    for item in list {
        let Some(rule) = item.as_str() else {
            return Err(Error::MintRequest(
                "allowed must be a list of strings".to_string(),
            ));
        };
        let permission =
            Permission::parse(rule).map_err(|e| Error::MintRequest(e.to_string()))?;
        rules.push(PermissionSpec::from(&permission));
    }
    Ok(rules)
}
