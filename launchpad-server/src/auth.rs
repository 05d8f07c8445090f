//! Caller identity, resolved from headers set by the fronting identity
//! proxy. The server never authenticates users itself.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::HeaderMap;
use axum::http::request::Parts;

use launchpad_models::{Identity, Role};

use crate::api::AppError;

const EMAIL_HEADER: &str = "x-user-email";
const NAME_HEADER: &str = "x-user-name";
const ROLES_HEADER: &str = "x-user-roles";

/// Extracts the authenticated caller from proxy headers.
pub struct Caller(pub Identity);

pub fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, AppError> {
    let email = headers
        .get(EMAIL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AppError::Unauthenticated(format!("missing {EMAIL_HEADER} header"))
        })?
        .to_string();

    let name = headers
        .get(NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(&email)
        .to_string();

    let mut roles = vec![Role::User];
    if let Some(raw) = headers.get(ROLES_HEADER).and_then(|v| v.to_str().ok()) {
        for role in raw.split(',') {
            if role.trim().eq_ignore_ascii_case("approver") {
                roles.push(Role::Approver);
            }
        }
    }

    Ok(Identity { email, name, roles })
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers).map(Caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_and_roles() {
        let mut headers = HeaderMap::new();
        headers.insert(EMAIL_HEADER, "dev@example.com".parse().unwrap());
        headers.insert(NAME_HEADER, "Dev".parse().unwrap());
        headers.insert(ROLES_HEADER, "user, Approver".parse().unwrap());

        let identity = identity_from_headers(&headers).unwrap();
        assert_eq!(identity.email, "dev@example.com");
        assert_eq!(identity.name, "Dev");
        assert!(identity.is_approver());
    }

    #[test]
    fn missing_email_is_rejected() {
        let headers = HeaderMap::new();
        assert!(identity_from_headers(&headers).is_err());
    }

    #[test]
    fn name_falls_back_to_email() {
        let mut headers = HeaderMap::new();
        headers.insert(EMAIL_HEADER, "dev@example.com".parse().unwrap());

        let identity = identity_from_headers(&headers).unwrap();
        assert_eq!(identity.name, "dev@example.com");
        assert!(!identity.is_approver());
    }
}
