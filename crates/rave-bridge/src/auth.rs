use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use rave_core::{time, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Capabilities granted through role membership.
pub const CAP_ADMIN: &str = "agent:admin";
pub const CAP_START: &str = "agent:start";
pub const CAP_STOP: &str = "agent:stop";
pub const CAP_STATUS: &str = "agent:status";

const LOCKOUT_WINDOW_SECS: f64 = 300.0;
const MAX_FAILED_ATTEMPTS: usize = 5;
const JWT_LEEWAY_SECS: u64 = 30;
const OIDC_CONFIG_TTL: Duration = Duration::from_secs(3600);

/// Validated user identity with derived capabilities.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub name: String,
    pub groups: Vec<String>,
    pub roles: HashSet<String>,
    pub claims: HashMap<String, Value>,
    pub validated_at: f64,
    pub expires_at: f64,
}

impl UserInfo {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.roles.contains(capability)
    }
}

/// Raw user record from the IdP user-lookup API.
#[derive(Debug, Clone, Deserialize)]
pub struct IdpUser {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub created_at: String,
}

/// IdP lookups behind a seam so the validator is testable and the wire
/// format stays in one adapter.
#[async_trait::async_trait]
pub trait IdpDirectory: Send + Sync {
    async fn lookup_user(&self, username: &str) -> Result<IdpUser>;
    async fn user_groups(&self, user_id: i64) -> Result<Vec<String>>;
}

/// GitLab-flavored directory adapter over HTTP.
pub struct HttpIdpDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIdpDirectory {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("rave-bridge/1.0")
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl IdpDirectory for HttpIdpDirectory {
    async fn lookup_user(&self, username: &str) -> Result<IdpUser> {
        let url = format!("{}/api/v4/users?username={username}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::transient(format!("IdP request failed: {e}")))?;

        match response.status().as_u16() {
            200 => {}
            404 => return Err(Error::authentication(format!("user not found: {username}"))),
            status if status >= 500 => {
                return Err(Error::transient(format!("IdP API error: {status}")))
            }
            status => return Err(Error::authentication(format!("IdP API error: {status}"))),
        }

        let users: Vec<IdpUser> = response
            .json()
            .await
            .map_err(|e| Error::authentication(format!("malformed IdP response: {e}")))?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| Error::authentication(format!("user not found: {username}")))
    }

    async fn user_groups(&self, user_id: i64) -> Result<Vec<String>> {
        let url = format!("{}/api/v4/users/{user_id}/memberships", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::transient(format!("IdP request failed: {e}")))?;

        if !response.status().is_success() {
            warn!(user_id, status = %response.status(), "failed to fetch user groups");
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        struct Membership {
            #[serde(default)]
            source: Option<MembershipSource>,
        }
        #[derive(Deserialize)]
        struct MembershipSource {
            #[serde(default)]
            kind: String,
            #[serde(default)]
            name: String,
        }

        let memberships: Vec<Membership> = response.json().await.unwrap_or_default();
        Ok(memberships
            .into_iter()
            .filter_map(|m| m.source)
            .filter(|s| s.kind == "group" && !s.name.is_empty())
            .map(|s| s.name)
            .collect())
    }
}

/// Validator configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub idp_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Group allowlist; `None` admits every known user.
    pub allowed_groups: Option<HashSet<String>>,
    pub cache_ttl: Duration,
    pub max_cache_size: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            idp_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            allowed_groups: None,
            cache_ttl: Duration::from_secs(300),
            max_cache_size: 1000,
        }
    }
}

struct OidcKeys {
    issuer: String,
    jwks: jsonwebtoken::jwk::JwkSet,
    fetched_at: std::time::Instant,
}

/// Chat identity validator: subject → IdP user → groups → capabilities,
/// with TTL+LRU caching and per-subject failure lockout.
pub struct IdentityValidator {
    config: AuthConfig,
    directory: Box<dyn IdpDirectory>,
    cache: Mutex<LruCache<String, UserInfo>>,
    failed: Mutex<HashMap<String, Vec<f64>>>,
    http: reqwest::Client,
    oidc_keys: Mutex<Option<OidcKeys>>,
}

impl IdentityValidator {
    pub fn new(config: AuthConfig, directory: Box<dyn IdpDirectory>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        info!(
            idp_url = %config.idp_url,
            allowed_groups = ?config.allowed_groups,
            cache_ttl_s = config.cache_ttl.as_secs(),
            "identity validator initialized"
        );
        Ok(Self {
            config,
            directory,
            cache: Mutex::new(LruCache::unbounded()),
            failed: Mutex::new(HashMap::new()),
            http,
            oidc_keys: Mutex::new(None),
        })
    }

    pub fn over_http(config: AuthConfig) -> Result<Self> {
        let directory = Box::new(HttpIdpDirectory::new(&config.idp_url)?);
        Self::new(config, directory)
    }

    /// Validate a chat subject (`@name:host` or plain username) against
    /// the IdP, deriving roles from group membership.
    pub async fn validate_user(&self, subject: &str) -> Result<UserInfo> {
        let now = time::unix_now();
        self.check_lockout(subject, now)?;

        if let Some(cached) = self.cached_user(subject, now) {
            debug!(subject, "using cached user info");
            return Ok(cached);
        }

        let result = self.validate_uncached(subject, now).await;
        if matches!(
            &result,
            Err(Error::Authentication(_)) | Err(Error::Authorization(_))
        ) {
            self.record_failure(subject, now);
        }
        result
    }

    async fn validate_uncached(&self, subject: &str, now: f64) -> Result<UserInfo> {
        let username = extract_username(subject)?;
        let user = self.directory.lookup_user(&username).await?;
        let groups = self.directory.user_groups(user.id).await?;

        if let Some(allowed) = &self.config.allowed_groups {
            if !groups.iter().any(|g| allowed.contains(g)) {
                return Err(Error::authorization(format!(
                    "user not in any allowed group (groups: {groups:?})"
                )));
            }
        }

        let roles = derive_roles(&groups);
        let mut claims = HashMap::new();
        claims.insert("id".to_string(), Value::from(user.id));
        claims.insert("state".to_string(), Value::from(user.state.clone()));
        claims.insert("created_at".to_string(), Value::from(user.created_at.clone()));

        let info = UserInfo {
            user_id: subject.to_string(),
            username: user.username,
            email: user.email,
            name: user.name,
            groups,
            roles,
            claims,
            validated_at: now,
            expires_at: now + self.config.cache_ttl.as_secs_f64(),
        };

        self.cache_user(subject, info.clone(), now);
        info!(
            subject,
            username = %info.username,
            groups = ?info.groups,
            "user validation successful"
        );
        Ok(info)
    }

    // -----------------------------------------------------------------
    // Cache

    fn cached_user(&self, subject: &str, now: f64) -> Option<UserInfo> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(subject) {
            Some(info) if info.expires_at > now => Some(info.clone()),
            Some(_) => {
                cache.pop(subject);
                None
            }
            None => None,
        }
    }

    fn cache_user(&self, subject: &str, info: UserInfo, now: f64) {
        let mut cache = self.cache.lock().unwrap();

        // Drop expired entries first, then LRU-evict 20% if still full.
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, v)| v.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            cache.pop(&key);
        }
        if cache.len() >= self.config.max_cache_size {
            let evict = (self.config.max_cache_size / 5).max(1);
            for _ in 0..evict {
                if cache.pop_lru().is_none() {
                    break;
                }
            }
        }

        cache.push(subject.to_string(), info);
    }

    // -----------------------------------------------------------------
    // Lockout

    fn check_lockout(&self, subject: &str, now: f64) -> Result<()> {
        let mut failed = self.failed.lock().unwrap();
        if let Some(timestamps) = failed.get_mut(subject) {
            timestamps.retain(|t| now - *t < LOCKOUT_WINDOW_SECS);
            if timestamps.len() >= MAX_FAILED_ATTEMPTS {
                return Err(Error::authentication(format!(
                    "too many failed authentication attempts; try again in {} seconds",
                    LOCKOUT_WINDOW_SECS as u64
                )));
            }
        }
        Ok(())
    }

    fn record_failure(&self, subject: &str, now: f64) {
        let mut failed = self.failed.lock().unwrap();
        let entry = failed.entry(subject.to_string()).or_default();
        entry.push(now);
        entry.retain(|t| now - *t < LOCKOUT_WINDOW_SECS);
        failed.retain(|_, v| !v.is_empty());
    }

    // -----------------------------------------------------------------
    // JWT path (optional)

    /// Validate an RS256 JWT issued by the configured IdP.
    pub async fn validate_jwt(&self, token: &str) -> Result<HashMap<String, Value>> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::authentication(format!("invalid token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::authentication("token missing key ID"))?;

        let (issuer, jwk) = self.signing_key(&kid).await?;
        let key = jsonwebtoken::DecodingKey::from_jwk(&jwk)
            .map_err(|e| Error::authentication(format!("unusable signing key: {e}")))?;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.set_audience(&[&self.config.client_id]);
        validation.set_issuer(&[&issuer]);
        validation.leeway = JWT_LEEWAY_SECS;
        validation.set_required_spec_claims(&["sub", "iat", "exp", "aud"]);

        let data = jsonwebtoken::decode::<HashMap<String, Value>>(token, &key, &validation)
            .map_err(|e| Error::authentication(format!("invalid token: {e}")))?;
        validate_claims(&data.claims, &self.config.client_id)?;
        Ok(data.claims)
    }

    async fn signing_key(&self, kid: &str) -> Result<(String, jsonwebtoken::jwk::Jwk)> {
        {
            let cached = self.oidc_keys.lock().unwrap();
            if let Some(keys) = cached.as_ref() {
                if keys.fetched_at.elapsed() < OIDC_CONFIG_TTL {
                    if let Some(jwk) = keys.jwks.find(kid) {
                        return Ok((keys.issuer.clone(), jwk.clone()));
                    }
                }
            }
        }

        #[derive(Deserialize)]
        struct Discovery {
            issuer: String,
            jwks_uri: String,
        }

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.config.idp_url.trim_end_matches('/')
        );
        let discovery: Discovery = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| Error::transient(format!("OIDC discovery failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::authentication(format!("malformed discovery document: {e}")))?;

        let jwks: jsonwebtoken::jwk::JwkSet = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| Error::transient(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::authentication(format!("malformed JWKS: {e}")))?;

        let jwk = jwks
            .find(kid)
            .cloned()
            .ok_or_else(|| Error::authentication(format!("no signing key with kid {kid}")))?;
        let issuer = discovery.issuer.clone();

        *self.oidc_keys.lock().unwrap() = Some(OidcKeys {
            issuer: issuer.clone(),
            jwks,
            fetched_at: std::time::Instant::now(),
        });
        Ok((issuer, jwk))
    }
}

/// Extract and validate the username from a chat subject.
/// Matrix-style `@name:host` IDs yield `name`; anything else is taken as
/// a plain username.
pub fn extract_username(subject: &str) -> Result<String> {
    let username = if let Some(stripped) = subject.strip_prefix('@') {
        let (name, _host) = stripped
            .split_once(':')
            .ok_or_else(|| Error::authentication("invalid chat user ID format"))?;
        name.to_string()
    } else {
        subject.to_string()
    };

    if username.is_empty() {
        return Err(Error::authentication("empty username in chat user ID"));
    }
    if username.len() > 255
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::authentication(format!(
            "invalid username format: {username}"
        )));
    }
    Ok(username)
}

/// Map group names onto capability sets. Admin ⊃ maintainer ⊃ developer ⊃
/// viewer; users with no recognized group get viewer.
pub fn derive_roles(groups: &[String]) -> HashSet<String> {
    let admin: [&str; 4] = [CAP_ADMIN, CAP_START, CAP_STOP, CAP_STATUS];
    let developer: [&str; 3] = [CAP_START, CAP_STOP, CAP_STATUS];
    let viewer: [&str; 1] = [CAP_STATUS];

    let mut roles = HashSet::new();
    for group in groups {
        let lower = group.to_lowercase();
        if lower.contains("admin") || lower.contains("maintainer") {
            roles.extend(admin.iter().map(|s| s.to_string()));
        } else if lower.contains("developer") {
            roles.extend(developer.iter().map(|s| s.to_string()));
        } else {
            roles.extend(viewer.iter().map(|s| s.to_string()));
        }
    }
    if roles.is_empty() {
        roles.extend(viewer.iter().map(|s| s.to_string()));
    }
    roles
}

fn validate_claims(claims: &HashMap<String, Value>, client_id: &str) -> Result<()> {
    for required in ["sub", "iat", "exp", "aud"] {
        if !claims.contains_key(required) {
            return Err(Error::authentication(format!(
                "token missing required claim: {required}"
            )));
        }
    }
    let aud_ok = match &claims["aud"] {
        Value::String(aud) => aud == client_id,
        Value::Array(auds) => auds.iter().any(|a| a.as_str() == Some(client_id)),
        _ => false,
    };
    if !aud_ok {
        return Err(Error::authentication("token audience mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use std::sync::Arc;

    struct MockDirectory {
        lookups: Arc<AtomicU32>,
        fail: bool,
        groups: Vec<String>,
    }

    impl MockDirectory {
        fn ok(groups: &[&str]) -> Self {
            Self {
                lookups: Arc::new(AtomicU32::new(0)),
                fail: false,
                groups: groups.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn failing() -> Self {
            Self {
                lookups: Arc::new(AtomicU32::new(0)),
                fail: true,
                groups: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl IdpDirectory for MockDirectory {
        async fn lookup_user(&self, username: &str) -> Result<IdpUser> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::authentication(format!("user not found: {username}")));
            }
            Ok(IdpUser {
                id: 7,
                username: username.to_string(),
                email: format!("{username}@example.com"),
                name: "Test User".to_string(),
                state: "active".to_string(),
                created_at: "2024-01-01".to_string(),
            })
        }

        async fn user_groups(&self, _user_id: i64) -> Result<Vec<String>> {
            Ok(self.groups.clone())
        }
    }

    fn validator(directory: MockDirectory, config: AuthConfig) -> IdentityValidator {
        IdentityValidator::new(config, Box::new(directory)).unwrap()
    }

    #[test]
    fn test_extract_username() {
        assert_eq!(extract_username("@alice:example.com").unwrap(), "alice");
        assert_eq!(extract_username("bob").unwrap(), "bob");
        assert!(extract_username("@nohost").is_err());
        assert!(extract_username("@:host").is_err());
        assert!(extract_username("bad user").is_err());
        assert!(extract_username(&"a".repeat(300)).is_err());
    }

    #[test]
    fn test_role_derivation_hierarchy() {
        let admin = derive_roles(&["platform-admins".to_string()]);
        assert!(admin.contains(CAP_ADMIN));
        assert!(admin.contains(CAP_START));

        let maintainer = derive_roles(&["maintainers".to_string()]);
        assert!(maintainer.contains(CAP_ADMIN));

        let dev = derive_roles(&["developer-team".to_string()]);
        assert!(dev.contains(CAP_START));
        assert!(!dev.contains(CAP_ADMIN));

        let viewer = derive_roles(&["random-group".to_string()]);
        assert_eq!(viewer.len(), 1);
        assert!(viewer.contains(CAP_STATUS));

        // No groups at all still floors at viewer.
        assert!(derive_roles(&[]).contains(CAP_STATUS));
    }

    #[tokio::test]
    async fn test_validate_user_and_cache_hit() {
        let mock = MockDirectory::ok(&["developers"]);
        let lookups = Arc::clone(&mock.lookups);
        let v = validator(mock, AuthConfig::default());

        let first = v.validate_user("@alice:example.com").await.unwrap();
        assert_eq!(first.username, "alice");
        assert!(first.has_capability(CAP_START));
        assert!(!first.has_capability(CAP_ADMIN));

        let second = v.validate_user("@alice:example.com").await.unwrap();
        assert_eq!(second.username, "alice");
        // Second call served from cache: exactly one directory lookup.
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_group_allowlist_enforced() {
        let config = AuthConfig {
            allowed_groups: Some(HashSet::from(["ops".to_string()])),
            ..AuthConfig::default()
        };
        let v = validator(MockDirectory::ok(&["developers"]), config);
        let err = v.validate_user("@alice:example.com").await.unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let v = validator(MockDirectory::failing(), AuthConfig::default());
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = v.validate_user("@mallory:example.com").await.unwrap_err();
            assert!(matches!(err, Error::Authentication(_)));
        }
        // Sixth attempt refused by lockout without reaching the IdP.
        let before = v
            .cache
            .lock()
            .unwrap()
            .len();
        let err = v.validate_user("@mallory:example.com").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("too many failed authentication attempts"), "{msg}");
        assert_eq!(before, 0);
    }

    #[tokio::test]
    async fn test_lockout_is_per_subject() {
        let v = validator(MockDirectory::failing(), AuthConfig::default());
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = v.validate_user("@mallory:example.com").await;
        }
        // A different subject still reaches the directory.
        let err = v.validate_user("@alice:example.com").await.unwrap_err();
        assert!(!err.to_string().contains("too many failed"));
    }

    #[tokio::test]
    async fn test_cache_expiry_and_lru_eviction() {
        let config = AuthConfig {
            cache_ttl: Duration::from_secs(300),
            max_cache_size: 5,
            ..AuthConfig::default()
        };
        let v = validator(MockDirectory::ok(&["developers"]), config);

        for i in 0..5 {
            v.validate_user(&format!("user{i}")).await.unwrap();
        }
        assert_eq!(v.cache.lock().unwrap().len(), 5);

        // Inserting one more evicts 20% (one entry) before the push.
        v.validate_user("user5").await.unwrap();
        assert!(v.cache.lock().unwrap().len() <= 5);

        // Expired entries fall out on read.
        {
            let mut cache = v.cache.lock().unwrap();
            if let Some(entry) = cache.peek_mut("user5") {
                entry.expires_at = 0.0;
            }
        }
        assert!(v.cached_user("user5", time::unix_now()).is_none());
    }

    #[test]
    fn test_claim_requirements() {
        let mut claims: HashMap<String, Value> = HashMap::from([
            ("sub".to_string(), Value::from("user")),
            ("iat".to_string(), Value::from(1)),
            ("exp".to_string(), Value::from(2)),
            ("aud".to_string(), Value::from("client-1")),
        ]);
        assert!(validate_claims(&claims, "client-1").is_ok());
        assert!(validate_claims(&claims, "other").is_err());
        claims.remove("iat");
        assert!(validate_claims(&claims, "client-1").is_err());
    }
}
