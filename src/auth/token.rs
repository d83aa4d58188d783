use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

const ISSUER: &str = "gantry";

/// Lifetime of interactive login tokens.
const LOGIN_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
#[error("invalid token")]
pub struct InvalidToken;

/// Claims of a user login token.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginClaims {
    pub iss: String,
    /// User uuid.
    pub sub: String,
    pub login: String,
    pub exp: u64,
}

/// Claims of a per-pipeline hook token. Long-lived, scoped to one repo.
#[derive(Debug, Serialize, Deserialize)]
pub struct HookClaims {
    pub iss: String,
    pub sub: String,
    pub owner: String,
    pub repo: String,
}

pub fn issue_login_token(
    secret: &str,
    user_id: &str,
    login: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = LoginClaims {
        iss: ISSUER.into(),
        sub: user_id.into(),
        login: login.into(),
        exp: now_secs() + LOGIN_TOKEN_TTL_SECS,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Signed token embedded in a pipeline's hook callback URL; authenticates
/// webhook deliveries and workload status callbacks for that repo.
pub fn issue_hook_token(
    secret: &str,
    owner: &str,
    repo: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = HookClaims {
        iss: ISSUER.into(),
        sub: "hook".into(),
        owner: owner.into(),
        repo: repo.into(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_login_token(secret: &str, token: &str) -> Result<LoginClaims, InvalidToken> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    jsonwebtoken::decode::<LoginClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| InvalidToken)
}

pub fn verify_hook_token(secret: &str, token: &str) -> Result<HookClaims, InvalidToken> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<HookClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| InvalidToken)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
