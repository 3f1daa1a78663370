//! Token issuance and validation (spec §3 `JWT Claims`, §4.E `JWT Manager`).
//!
//! Signing is HMAC (HS256, default) or RSA (RS256) via the `jsonwebtoken`
//! crate, which also gives us the signing-method and exp/nbf/iss/aud checks
//! for free through [`jsonwebtoken::Validation`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use fleetd_storage::{RelationalStore, StorageError};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::model::{Role, User};

const ACCESS_TOKEN_TTL: Duration = Duration::minutes(15);
const REFRESH_TOKEN_TTL: Duration = Duration::days(7);
const DEVICE_TOKEN_TTL: Duration = Duration::days(365);
const BLACKLIST_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
    Device,
    Service,
}

/// Standard claims (iss/sub/aud/exp/nbf/iat/jti) plus the fleet-specific
/// identity fields carried on every issued token (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub token_type: TokenType,
}

fn new_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Chains a primary blacklist with a fallback consulted only when the
/// primary errors, per spec §4.E: "A manager may chain primary→fallback
/// blacklists." Writes go to both so either can answer `contains` later.
pub struct ChainedRelationalStore {
    primary: Arc<dyn RelationalStore>,
    fallback: Arc<dyn RelationalStore>,
}

impl ChainedRelationalStore {
    #[must_use]
    pub fn new(primary: Arc<dyn RelationalStore>, fallback: Arc<dyn RelationalStore>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait::async_trait]
impl RelationalStore for ChainedRelationalStore {
    async fn blacklist_insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        let primary_result = self.primary.blacklist_insert(jti, expires_at).await;
        let fallback_result = self.fallback.blacklist_insert(jti, expires_at).await;
        primary_result.or(fallback_result)
    }

    async fn blacklist_contains(&self, jti: &str) -> Result<bool, StorageError> {
        match self.primary.blacklist_contains(jti).await {
            Ok(found) => Ok(found),
            Err(primary_err) => {
                tracing::warn!(error = %primary_err, "primary blacklist check failed, falling back");
                self.fallback.blacklist_contains(jti).await
            }
        }
    }

    async fn blacklist_sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let primary = self.primary.blacklist_sweep_expired(now).await.unwrap_or(0);
        let fallback = self.fallback.blacklist_sweep_expired(now).await.unwrap_or(0);
        Ok(primary + fallback)
    }
}

/// Signing key material for either HMAC or RSA signing.
pub enum SigningKey {
    Hmac(Vec<u8>),
    Rsa { private_pem: Vec<u8>, public_pem: Vec<u8> },
}

impl SigningKey {
    fn algorithm(&self) -> Algorithm {
        match self {
            Self::Hmac(_) => Algorithm::HS256,
            Self::Rsa { .. } => Algorithm::RS256,
        }
    }

    fn encoding_key(&self) -> Result<EncodingKey, AuthError> {
        match self {
            Self::Hmac(secret) => Ok(EncodingKey::from_secret(secret)),
            Self::Rsa { private_pem, .. } => {
                EncodingKey::from_rsa_pem(private_pem).map_err(|e| AuthError::Key(e.to_string()))
            }
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match self {
            Self::Hmac(secret) => Ok(DecodingKey::from_secret(secret)),
            Self::Rsa { public_pem, .. } => {
                DecodingKey::from_rsa_pem(public_pem).map_err(|e| AuthError::Key(e.to_string()))
            }
        }
    }
}

/// Issues and validates JWTs per spec §4.E. Holds an optional blacklist —
/// without one, `validate` skips step 4 (revocation check) entirely.
pub struct JwtManager {
    signing_key: SigningKey,
    issuer: String,
    audience: String,
    blacklist: Option<Arc<dyn RelationalStore>>,
}

impl JwtManager {
    #[must_use]
    pub fn new(signing_key: SigningKey, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self { signing_key, issuer: issuer.into(), audience: audience.into(), blacklist: None }
    }

    #[must_use]
    pub fn with_blacklist(mut self, blacklist: Arc<dyn RelationalStore>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    /// Spawns the periodic blacklist cleanup task (spec §4.E: "periodic
    /// cleanup every 15 minutes removes expired entries"). A no-op if no
    /// blacklist is configured.
    pub fn spawn_blacklist_cleanup(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let blacklist = self.blacklist.clone()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BLACKLIST_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match blacklist.blacklist_sweep_expired(Utc::now()).await {
                    Ok(removed) if removed > 0 => tracing::debug!(removed, "swept expired blacklist entries"),
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "blacklist sweep failed"),
                }
            }
        }))
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = Header::new(self.signing_key.algorithm());
        encode(&header, claims, &self.signing_key.encoding_key()?).map_err(|e| AuthError::Key(e.to_string()))
    }

    fn build_claims(&self, user: &User, token_type: TokenType, ttl: Duration, device_id: Option<String>) -> Claims {
        let now = Utc::now();
        Claims {
            iss: self.issuer.clone(),
            sub: user.id.clone(),
            aud: self.audience.clone(),
            exp: (now + ttl).timestamp(),
            nbf: now.timestamp(),
            iat: now.timestamp(),
            jti: new_jti(),
            user_id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.iter().cloned().collect(),
            permissions: user.effective_permissions().into_iter().collect(),
            device_id,
            token_type,
        }
    }

    /// Produces an access token (15 min TTL) and refresh token (7 day TTL)
    /// for `user` (spec §4.E `generate-token-pair`).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Key`] if signing fails.
    pub fn generate_token_pair(&self, user: &User) -> Result<(String, String), AuthError> {
        let access = self.build_claims(user, TokenType::Access, ACCESS_TOKEN_TTL, None);
        let refresh = self.build_claims(user, TokenType::Refresh, REFRESH_TOKEN_TTL, None);
        Ok((self.sign(&access)?, self.sign(&refresh)?))
    }

    /// Issues a long-lived (1 year) device token with `role = device`
    /// (spec §4.E `generate-device-token`).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Key`] if signing fails.
    pub fn generate_device_token(&self, device_id: impl Into<String>) -> Result<String, AuthError> {
        let device_id = device_id.into();
        let device_user = User::new(device_id.clone(), device_id.clone(), String::new()).with_role(Role::Device);
        let claims = self.build_claims(&device_user, TokenType::Device, DEVICE_TOKEN_TTL, Some(device_id));
        self.sign(&claims)
    }

    /// The five-step validation algorithm of spec §4.E:
    /// 1. parse, rejecting a signing-method mismatch;
    /// 2. verify the signature;
    /// 3. verify `exp`/`nbf`/`iss`/`aud`;
    /// 4. if `jti` is present and a blacklist is configured, check it —
    ///    revoked tokens fail with [`AuthError::TokenRevoked`]; a blacklist
    ///    check failure is logged and treated as not-revoked (best-effort);
    /// 5. return the claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] on a malformed or mis-signed
    /// token, [`AuthError::TokenExpired`] once past `exp`, or
    /// [`AuthError::TokenRevoked`] if the token's `jti` is blacklisted.
    pub async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(self.signing_key.algorithm());
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.validate_nbf = true;

        let token_data = decode::<Claims>(token, &self.signing_key.decoding_key()?, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        let claims = token_data.claims;

        if let Some(blacklist) = &self.blacklist {
            match blacklist.blacklist_contains(&claims.jti).await {
                Ok(true) => return Err(AuthError::TokenRevoked),
                Ok(false) => {}
                Err(error) => tracing::warn!(%error, jti = %claims.jti, "blacklist check failed, treating as not revoked"),
            }
        }

        Ok(claims)
    }

    /// Validates `refresh_token`, requires `token-type = refresh`, then
    /// issues a new pair (spec §4.E `refresh`).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::WrongTokenType`] if the presented token isn't a
    /// refresh token, otherwise propagates [`JwtManager::validate`]'s errors.
    pub async fn refresh(&self, refresh_token: &str, user: &User) -> Result<(String, String), AuthError> {
        let claims = self.validate(refresh_token).await?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::WrongTokenType { expected: "refresh".to_owned(), actual: format!("{:?}", claims.token_type) });
        }
        self.generate_token_pair(user)
    }

    /// Inserts `jti` into the blacklist so it fails validation until
    /// `expires_at` (spec §4.E `revoke`). A no-op if no blacklist is
    /// configured — revocation then degrades to "unsupported", which
    /// callers should treat as a configuration error upstream.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the blacklist write fails.
    pub async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), AuthError> {
        match &self.blacklist {
            Some(blacklist) => Ok(blacklist.blacklist_insert(jti, expires_at).await?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_storage::MemoryRelationalStore;

    fn manager() -> JwtManager {
        JwtManager::new(SigningKey::Hmac(b"test-secret-key-do-not-use-in-prod".to_vec()), "fleetd", "fleetd-clients")
    }

    fn manager_with_blacklist() -> JwtManager {
        manager().with_blacklist(Arc::new(MemoryRelationalStore::new()))
    }

    fn sample_user() -> User {
        User::new("u1", "alice", "a@x.com").with_role(Role::Operator)
    }

    #[tokio::test]
    async fn token_pair_round_trips() {
        let mgr = manager();
        let user = sample_user();
        let (access, refresh) = mgr.generate_token_pair(&user).unwrap();

        let access_claims = mgr.validate(&access).await.unwrap();
        assert_eq!(access_claims.token_type, TokenType::Access);
        assert_eq!(access_claims.user_id, "u1");

        let refresh_claims = mgr.validate(&refresh).await.unwrap();
        assert_eq!(refresh_claims.token_type, TokenType::Refresh);
        assert!(refresh_claims.exp > access_claims.exp);
    }

    #[tokio::test]
    async fn device_token_carries_device_role() {
        let mgr = manager();
        let token = mgr.generate_device_token("device-123").unwrap();
        let claims = mgr.validate(&token).await.unwrap();
        assert_eq!(claims.token_type, TokenType::Device);
        assert_eq!(claims.device_id.as_deref(), Some("device-123"));
        assert!(claims.roles.contains(&Role::Device));
    }

    #[tokio::test]
    async fn wrong_signing_key_is_rejected() {
        let mgr = manager();
        let other = JwtManager::new(SigningKey::Hmac(b"a-completely-different-secret".to_vec()), "fleetd", "fleetd-clients");
        let (access, _) = mgr.generate_token_pair(&sample_user()).unwrap();
        assert!(matches!(other.validate(&access).await, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let mgr = manager();
        let other = JwtManager::new(SigningKey::Hmac(b"test-secret-key-do-not-use-in-prod".to_vec()), "fleetd", "a-different-audience");
        let (access, _) = mgr.generate_token_pair(&sample_user()).unwrap();
        assert!(other.validate(&access).await.is_err());
    }

    #[tokio::test]
    async fn revoked_token_fails_validation_after_revoke() {
        let mgr = manager_with_blacklist();
        let (access, _) = mgr.generate_token_pair(&sample_user()).unwrap();
        let claims = mgr.validate(&access).await.unwrap();

        mgr.revoke(&claims.jti, Utc::now() + Duration::hours(1)).await.unwrap();

        assert!(matches!(mgr.validate(&access).await, Err(AuthError::TokenRevoked)));
    }

    #[tokio::test]
    async fn refresh_rejects_access_token() {
        let mgr = manager();
        let user = sample_user();
        let (access, _) = mgr.generate_token_pair(&user).unwrap();
        assert!(matches!(mgr.refresh(&access, &user).await, Err(AuthError::WrongTokenType { .. })));
    }

    #[tokio::test]
    async fn refresh_issues_new_pair_from_refresh_token() {
        let mgr = manager();
        let user = sample_user();
        let (_, refresh) = mgr.generate_token_pair(&user).unwrap();
        let (new_access, new_refresh) = mgr.refresh(&refresh, &user).await.unwrap();
        assert!(mgr.validate(&new_access).await.is_ok());
        assert!(mgr.validate(&new_refresh).await.is_ok());
    }

    #[tokio::test]
    async fn validate_without_blacklist_configured_skips_revocation_check() {
        let mgr = manager();
        let (access, _) = mgr.generate_token_pair(&sample_user()).unwrap();
        assert!(mgr.validate(&access).await.is_ok());
    }

    #[tokio::test]
    async fn chained_blacklist_falls_back_on_primary_error() {
        struct AlwaysErrors;
        #[async_trait::async_trait]
        impl RelationalStore for AlwaysErrors {
            async fn blacklist_insert(&self, _jti: &str, _expires_at: DateTime<Utc>) -> Result<(), StorageError> {
                Err(StorageError::Query("primary down".to_owned()))
            }
            async fn blacklist_contains(&self, _jti: &str) -> Result<bool, StorageError> {
                Err(StorageError::Query("primary down".to_owned()))
            }
            async fn blacklist_sweep_expired(&self, _now: DateTime<Utc>) -> Result<u64, StorageError> {
                Err(StorageError::Query("primary down".to_owned()))
            }
        }

        let fallback = Arc::new(MemoryRelationalStore::new());
        let chained = ChainedRelationalStore::new(Arc::new(AlwaysErrors), fallback.clone());
        fallback.blacklist_insert("jti-1", Utc::now() + Duration::hours(1)).await.unwrap();

        assert!(chained.blacklist_contains("jti-1").await.unwrap());
    }
}
