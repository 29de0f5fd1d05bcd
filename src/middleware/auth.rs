//! Authentication and authorization middleware.
//!
//! A composite authenticator tries each configured authenticator in order,
//! stopping at the first that both claims support for the request and yields
//! success. On failure the call gets an anonymous identity when permitted,
//! else an `unauthorized` tool-error. The authorizer is then consulted with
//! `(identity, "tool:" + tool_id, "call")`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;

use super::{CallResult, ToolCall, ToolProvider};
use crate::errors::{ErrorKind, ErrorObject};
use crate::model::{AuthMethod, Identity, Tool};

/// Case-insensitive header lookup; transports differ in casing.
fn header_get<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// One credential scheme. `supports` is a cheap shape check on the headers;
/// `authenticate` does the real verification.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, headers: &HashMap<String, String>) -> bool;
    async fn authenticate(&self, headers: &HashMap<String, String>) -> Result<Identity, String>;
}

/// Tries each authenticator in order; the first supporting + succeeding one wins.
pub struct CompositeAuthenticator {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl CompositeAuthenticator {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    pub async fn authenticate(&self, headers: &HashMap<String, String>) -> Option<Identity> {
        for authenticator in &self.authenticators {
            if !authenticator.supports(headers) {
                continue;
            }
            match authenticator.authenticate(headers).await {
                Ok(identity) => return Some(identity),
                Err(reason) => {
                    debug!(
                        authenticator = authenticator.name(),
                        reason = %reason,
                        "authenticator rejected credentials"
                    );
                }
            }
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    iat: Option<u64>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Bearer-JWT authenticator (HS256 shared secret).
pub struct JwtAuthenticator {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    fn name(&self) -> &str {
        "jwt"
    }

    fn supports(&self, headers: &HashMap<String, String>) -> bool {
        header_get(headers, "authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            // Shape check only: three dot-separated segments.
            .is_some_and(|token| token.split('.').count() == 3)
    }

    async fn authenticate(&self, headers: &HashMap<String, String>) -> Result<Identity, String> {
        let token = header_get(headers, "authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| "missing bearer token".to_string())?;

        let data = decode::<JwtClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| format!("jwt validation failed: {e}"))?;
        let claims = data.claims;

        Ok(Identity {
            principal: claims.sub,
            tenant: claims.tenant,
            roles: claims.roles,
            permissions: claims.permissions,
            method: AuthMethod::Jwt,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

/// Static API-key principal table.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyPrincipal {
    pub principal: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

pub struct ApiKeyAuthenticator {
    header: String,
    keys: HashMap<String, ApiKeyPrincipal>,
}

impl ApiKeyAuthenticator {
    pub fn new(header: Option<String>, keys: HashMap<String, ApiKeyPrincipal>) -> Self {
        Self {
            header: header.unwrap_or_else(|| "x-api-key".to_string()),
            keys,
        }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    fn name(&self) -> &str {
        "api_key"
    }

    fn supports(&self, headers: &HashMap<String, String>) -> bool {
        header_get(headers, &self.header).is_some()
    }

    async fn authenticate(&self, headers: &HashMap<String, String>) -> Result<Identity, String> {
        let key = header_get(headers, &self.header).ok_or_else(|| "missing api key".to_string())?;
        let entry = self.keys.get(key).ok_or_else(|| "unknown api key".to_string())?;
        Ok(Identity {
            principal: entry.principal.clone(),
            tenant: entry.tenant.clone(),
            roles: entry.roles.clone(),
            permissions: entry.permissions.clone(),
            method: AuthMethod::ApiKey,
            issued_at: None,
            expires_at: None,
        })
    }
}

/// Decides whether an identity may perform an action on a resource.
#[async_trait]
pub trait Authorizer: Send + Sync {
    fn name(&self) -> &str;
    async fn authorize(&self, identity: &Identity, resource: &str, action: &str) -> bool;
}

/// The default authorizer: everything goes.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    fn name(&self) -> &str {
        "allow_all"
    }

    async fn authorize(&self, _identity: &Identity, _resource: &str, _action: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleDef {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

/// Role-based authorizer. Roles may inherit other roles; inheritance is
/// resolved by DFS with a visited set, so a cycle terminates rather than
/// erroring.
pub struct RbacAuthorizer {
    roles: HashMap<String, RoleDef>,
}

impl RbacAuthorizer {
    pub fn new(roles: HashMap<String, RoleDef>) -> Self {
        Self { roles }
    }

    fn effective_permissions(&self, identity: &Identity) -> HashSet<String> {
        let mut permissions: HashSet<String> = identity.permissions.iter().cloned().collect();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = identity.roles.iter().map(String::as_str).collect();

        while let Some(role_name) = stack.pop() {
            if !visited.insert(role_name) {
                continue;
            }
            if let Some(role) = self.roles.get(role_name) {
                permissions.extend(role.permissions.iter().cloned());
                stack.extend(role.inherits.iter().map(String::as_str));
            }
        }
        permissions
    }
}

fn permission_matches(pattern: &str, needed: &str) -> bool {
    if pattern == "*" || pattern == needed {
        return true;
    }
    pattern
        .strip_suffix('*')
        .is_some_and(|prefix| needed.starts_with(prefix))
}

#[async_trait]
impl Authorizer for RbacAuthorizer {
    fn name(&self) -> &str {
        "rbac"
    }

    async fn authorize(&self, identity: &Identity, resource: &str, action: &str) -> bool {
        let needed = format!("{resource}:{action}");
        self.effective_permissions(identity)
            .iter()
            .any(|p| permission_matches(p, &needed))
    }
}

/// The auth middleware: authenticate, then authorize, then install the
/// identity into the call for everything downstream.
pub struct AuthMiddleware {
    inner: Arc<dyn ToolProvider>,
    authenticator: CompositeAuthenticator,
    authorizer: Arc<dyn Authorizer>,
    allow_anonymous: bool,
}

impl AuthMiddleware {
    pub fn new(
        inner: Arc<dyn ToolProvider>,
        authenticator: CompositeAuthenticator,
        authorizer: Arc<dyn Authorizer>,
        allow_anonymous: bool,
    ) -> Self {
        Self {
            inner,
            authenticator,
            authorizer,
            allow_anonymous,
        }
    }
}

#[async_trait]
impl ToolProvider for AuthMiddleware {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    fn tool(&self) -> Option<Tool> {
        self.inner.tool()
    }

    async fn handle(&self, mut call: ToolCall) -> CallResult {
        let identity = match self.authenticator.authenticate(&call.headers).await {
            Some(identity) => identity,
            None if self.allow_anonymous => Identity::anonymous(),
            None => {
                return Err(ErrorObject::new(
                    ErrorKind::Unauthorized,
                    "authentication required",
                )
                .with_tool(&call.tool_id)
                .with_op("auth"));
            }
        };

        let resource = format!("tool:{}", call.tool_id);
        if !self.authorizer.authorize(&identity, &resource, "call").await {
            return Err(ErrorObject::new(
                ErrorKind::Forbidden,
                format!("principal '{}' may not call '{}'", identity.principal, call.tool_id),
            )
            .with_tool(&call.tool_id)
            .with_op("auth"));
        }

        call.identity = Some(identity);
        self.inner.handle(call).await
    }
}
