use sha2::{Digest, Sha256};

use threadloom_core::config::{ApiKeyRole, GatewayConfig};

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

fn signature(secret: &str, subject: &str, expires_at: i64) -> String {
    let digest = Sha256::digest(format!("{secret}:{subject}:{expires_at}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Mint a token `<subject>.<expiresAtUnix>.<sha256 hex>`.
pub fn mint_token(secret: &str, subject: &str, ttl_secs: u64, now: i64) -> String {
    let expires_at = now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
    format!("{subject}.{expires_at}.{}", signature(secret, subject, expires_at))
}

/// Subject of a valid, unexpired token.
pub fn verify_token(secret: &str, token: &str, now: i64) -> Option<String> {
    let mut parts = token.rsplitn(3, '.');
    let sig = parts.next()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;
    let subject = parts.next()?;
    if subject.is_empty() || expires_at <= now {
        return None;
    }
    let expected = signature(secret, subject, expires_at);
    constant_time_eq(expected.as_bytes(), sig.as_bytes()).then(|| subject.to_string())
}

fn match_credential(config: &GatewayConfig, credential: &str, now: i64) -> Option<AuthResult> {
    if let Some(ak) = config.api_keys.iter().find(|ak| ak.key == credential) {
        return Some(AuthResult {
            name: ak.name.clone(),
            role: ak.role.clone(),
        });
    }
    let secret = config.token_secret.as_deref()?;
    verify_token(secret, credential, now).map(|subject| AuthResult {
        name: subject,
        role: ApiKeyRole::Operator,
    })
}

/// Full validation: Bearer header -> query token -> anonymous.
///
/// A credential is an api key or a signed token. Anonymous access is only
/// granted when neither a token secret nor api keys are configured.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
    now: i64,
) -> Option<AuthResult> {
    if let Some(credential) = bearer.or(query_token) {
        return match_credential(config, credential, now);
    }

    config.is_open().then(|| AuthResult {
        name: "anonymous".into(),
        role: ApiKeyRole::Admin,
    })
}

/// Extract and decode the token from a query string (`?token=...`).
pub fn extract_token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .and_then(|raw| urlencoding::decode(raw).ok())
        .map(|decoded| decoded.into_owned())
}

pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Operators may stream and edit graphs.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}
