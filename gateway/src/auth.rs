use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Header inner handlers read the authenticated agent id from.
pub const AGENT_HEADER: &str = "x-wardgate-agent";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingCredentials,
    #[error("bearer token rejected")]
    InvalidToken,
    #[error("operator key rejected")]
    InvalidOperator,
}

#[derive(Debug, Error)]
pub enum AuthConfigError {
    #[error("invalid auth config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Static agent keys; each maps one bearer token to an agent id.
    #[serde(default)]
    pub static_keys: Vec<StaticKey>,
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    /// Keys accepted on the operator approval surface.
    #[serde(default)]
    pub operator_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticKey {
    pub key: String,
    pub agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

fn default_algorithm() -> String {
    "HS256".into()
}

/// Validates agent bearer tokens: the static key table first, then JWT.
#[derive(Debug)]
pub struct Authenticator {
    static_keys: Vec<StaticKey>,
    jwt: Option<JwtValidator>,
    operator_keys: Vec<String>,
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthConfigError> {
        let jwt = config.jwt.as_ref().map(JwtValidator::new).transpose()?;
        if config.static_keys.is_empty() && jwt.is_none() {
            return Err(AuthConfigError::Invalid(
                "no agent credentials configured: provide static_keys or jwt".into(),
            ));
        }
        Ok(Self {
            static_keys: config.static_keys.clone(),
            jwt,
            operator_keys: config.operator_keys.clone(),
        })
    }

    /// Resolve a bearer token to an agent id, or fail with 401 semantics.
    pub fn authenticate_agent(&self, token: &str) -> Result<String, AuthError> {
        for entry in &self.static_keys {
            if constant_time_eq(&entry.key, token) {
                return Ok(entry.agent.clone());
            }
        }
        if let Some(jwt) = &self.jwt {
            return jwt.verify(token);
        }
        Err(AuthError::InvalidToken)
    }

    pub fn authenticate_operator(&self, token: &str) -> Result<(), AuthError> {
        if self
            .operator_keys
            .iter()
            .any(|key| constant_time_eq(key, token))
        {
            Ok(())
        } else {
            Err(AuthError::InvalidOperator)
        }
    }
}

fn constant_time_eq(expected: &str, candidate: &str) -> bool {
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}

/// Strip the `Bearer ` prefix from an Authorization header value.
pub fn bearer_token(header: &str) -> Result<&str, AuthError> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingCredentials)
}

struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator").finish_non_exhaustive()
    }
}

impl JwtValidator {
    fn new(config: &JwtConfig) -> Result<Self, AuthConfigError> {
        if config.secret.is_empty() {
            return Err(AuthConfigError::Invalid("jwt secret is empty".into()));
        }
        let algorithm = match config.algorithm.to_ascii_uppercase().as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(AuthConfigError::Invalid(format!(
                    "unsupported jwt algorithm: {other}"
                )))
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer.clone()]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience.clone()]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        })
    }

    fn verify(&self, token: &str) -> Result<String, AuthError> {
        decode::<AgentClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.sub)
            .map_err(|_| AuthError::InvalidToken)
    }
}

#[derive(Debug, Deserialize)]
struct AgentClaims {
    sub: String,
    #[allow(dead_code)]
    exp: u64,
}
