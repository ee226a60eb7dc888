//! Request authorization against token capabilities

use tracing::debug;

use crate::scopes::{Permission, ScopeRegistry};
use crate::token::Claims;

/// Decide whether decoded token claims permit `(method, path)`.
///
/// An inline `allowed` list is consulted first; otherwise every named scope
/// is resolved in the registry and its permissions tested. The request is
/// permitted iff any permission across the relevant set matches. A token
/// naming a scope this proxy does not know is denied outright: the registry
/// may have changed since the token was issued, and a five-year token must
/// not silently gain whatever a same-named future scope grants.
pub fn validate_request(
    registry: &ScopeRegistry,
    method: &str,
    path: &str,
    claims: &Claims,
) -> bool {
    if let Some(allowed) = &claims.allowed {
        return allowed.iter().any(|spec| match Permission::try_from(spec) {
            Ok(permission) => permission.matches(method, path),
            Err(e) => {
                debug!(error = %e, "Skipping malformed permission in token");
                false
            }
        });
    }

    if let Some(scopes) = &claims.scopes {
        let mut permitted = false;
        for name in scopes {
            let Some(scope) = registry.get(name) else {
                debug!(scope = %name, "Token names a scope not configured on this proxy");
                return false;
            };
            permitted = permitted
                || scope
                    .permissions()
                    .iter()
                    .any(|permission| permission.matches(method, path));
        }
        return permitted;
    }

    false
}
