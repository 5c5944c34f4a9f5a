//! Bearer-token authentication and per-type authorization.

use std::fmt;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Filter, FilterContext, ACCESS_TOKEN};
use crate::error::{AuthError, Rejection};

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Validates a credential string.
pub trait AuthProvider: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            roles: claims.roles,
        }
    }
}

/// HS256 JWT validation against a shared signing key.
///
/// Expiry is enforced with no clock skew allowance. Issuer and audience
/// are not checked.
pub struct JwtAuthProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthProvider {
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl AuthProvider for JwtAuthProvider {
    fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims.into())
    }
}

impl fmt::Debug for JwtAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthProvider")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

/// Reads `Authorization: Bearer <token>` from the frame headers.
///
/// A valid token sets the principal and stores the raw token under
/// [`ACCESS_TOKEN`]. An invalid one rejects the exchange, and so does a
/// bearer header with no token. No header at all passes, leaving the
/// decision to [`AuthorizeFilter`].
#[derive(Clone)]
pub struct JwtAuthFilter {
    provider: Arc<dyn AuthProvider>,
}

impl JwtAuthFilter {
    pub const NAME: &'static str = "jwt-auth";

    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self { provider }
    }

    fn bearer<'c>(&self, ctx: &'c FilterContext<'_>) -> Result<Option<&'c str>, AuthError> {
        let Some(header) = ctx.header("authorization") else {
            return Ok(None);
        };
        let header = header.trim();
        let (scheme, token) = header.split_once(' ').unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::Malformed);
        }
        match token.trim() {
            "" => Err(AuthError::Missing),
            token => Ok(Some(token)),
        }
    }
}

impl Filter for JwtAuthFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_inbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        let reject = |err: AuthError| Rejection::new(Self::NAME, err.to_string());

        let Some(token) = self.bearer(ctx).map_err(reject)? else {
            return Ok(());
        };
        let token = token.to_owned();
        let principal = self.provider.validate(&token).map_err(reject)?;

        tracing::trace!(subject = %principal.subject, instance = %ctx.instance, "authenticated");
        ctx.principal = Some(principal);
        ctx.attributes.insert(ACCESS_TOKEN.to_owned(), Value::String(token));
        Ok(())
    }
}

impl fmt::Debug for JwtAuthFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthFilter").finish_non_exhaustive()
    }
}

/// Enforces the target type's [`AccessPolicy`](crate::vm::AccessPolicy).
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizeFilter;

impl AuthorizeFilter {
    pub const NAME: &'static str = "authorize";
}

impl Filter for AuthorizeFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_inbound(&self, ctx: &mut FilterContext<'_>) -> Result<(), Rejection> {
        if ctx.policy.permits(ctx.principal.as_ref()) {
            return Ok(());
        }
        let who = ctx
            .principal
            .as_ref()
            .map_or("anonymous", |principal| principal.subject.as_str());
        Err(Rejection::new(
            Self::NAME,
            format!("{}: {who} may not access `{}`", AuthError::Forbidden, ctx.vm_type),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterPipeline, Verb};
    use crate::ids::{ConnectionId, InstanceId};
    use crate::vm::AccessPolicy;
    use jsonwebtoken::{EncodingKey, Header};
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"a-signing-key-of-reasonable-length";

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn token(secret: &[u8], sub: &str, exp: u64, roles: &[&str]) -> String {
        let claims = Claims {
            sub: sub.into(),
            exp,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn bearer(token: &str) -> HashMap<String, String> {
        HashMap::from([("Authorization".to_owned(), format!("Bearer {token}"))])
    }

    fn pipeline() -> FilterPipeline {
        FilterPipeline::new()
            .with(JwtAuthFilter::new(Arc::new(JwtAuthProvider::hs256(SECRET))))
            .with(AuthorizeFilter)
    }

    fn run(headers: &HashMap<String, String>, policy: AccessPolicy) -> Result<Option<Principal>, Rejection> {
        let id = InstanceId::new("Secure");
        let mut ctx = FilterContext::new(ConnectionId::from(1), &id, Verb::Request, "Secure", headers)
            .with_policy(policy);
        pipeline().run_inbound(&mut ctx)?;
        if ctx.principal.is_some() {
            assert!(ctx.attribute(ACCESS_TOKEN).is_some());
        }
        Ok(ctx.principal)
    }

    #[test]
    fn valid_token_sets_the_principal() {
        let headers = bearer(&token(SECRET, "ada", now() + 300, &["admin"]));
        let principal = run(&headers, AccessPolicy::Authenticated).unwrap().unwrap();
        assert_eq!(principal.subject, "ada");
        assert!(principal.has_role("admin"));
    }

    #[test]
    fn token_signed_with_another_key_is_rejected() {
        let headers = bearer(&token(b"some-other-signing-key", "ada", now() + 300, &[]));
        let rejection = run(&headers, AccessPolicy::Anonymous).unwrap_err();
        assert_eq!(rejection.filter, JwtAuthFilter::NAME);
        assert_eq!(rejection.to_string(), "access denied");
    }

    #[test]
    fn expired_token_is_rejected() {
        let headers = bearer(&token(SECRET, "ada", now() - 10, &[]));
        assert!(run(&headers, AccessPolicy::Anonymous).is_err());
    }

    #[test]
    fn malformed_header_is_rejected() {
        let headers = HashMap::from([("Authorization".to_owned(), "Basic abc".to_owned())]);
        let rejection = run(&headers, AccessPolicy::Anonymous).unwrap_err();
        assert!(rejection.detail.contains("malformed"));
    }

    #[test]
    fn empty_bearer_is_rejected() {
        let headers = HashMap::from([("Authorization".to_owned(), "Bearer   ".to_owned())]);
        let rejection = run(&headers, AccessPolicy::Anonymous).unwrap_err();
        assert_eq!(rejection.filter, JwtAuthFilter::NAME);
        assert_eq!(rejection.detail, AuthError::Missing.to_string());
    }

    #[test]
    fn missing_token_passes_authentication() {
        let headers = HashMap::new();
        assert_eq!(run(&headers, AccessPolicy::Anonymous).unwrap(), None);
    }

    #[test]
    fn anonymous_access_to_protected_type_is_rejected() {
        let headers = HashMap::new();
        let rejection = run(&headers, AccessPolicy::Authenticated).unwrap_err();
        assert_eq!(rejection.filter, AuthorizeFilter::NAME);
    }

    #[test]
    fn missing_role_is_rejected() {
        let headers = bearer(&token(SECRET, "bob", now() + 300, &["viewer"]));
        let policy = AccessPolicy::Roles(vec!["admin".into()]);
        assert!(run(&headers, policy).is_err());
    }
}
