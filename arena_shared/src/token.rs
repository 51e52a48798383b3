//! Access-token validation.
//!
//! The identity provider and its key distribution live outside this
//! workspace; the gateway only consumes a [`TokenValidator`] capability.
//! [`HsValidator`] is the in-tree implementation: HS256 over a shared
//! secret, enough for development and tests. Validators that refresh key
//! material do so behind the same trait.

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Registered claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub aud: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
}

/// Token validation capability consumed by the gateway.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> anyhow::Result<Claims>;
}

/// HS256 validator over a static shared secret.
pub struct HsValidator {
    secret: Vec<u8>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl HsValidator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            audience: None,
        }
    }

    pub fn with_issuer(mut self, iss: impl Into<String>) -> Self {
        self.issuer = Some(iss.into());
        self
    }

    pub fn with_audience(mut self, aud: impl Into<String>) -> Self {
        self.audience = Some(aud.into());
        self
    }

    fn check_claims(&self, claims: &Claims) -> anyhow::Result<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if claims.exp != 0 && claims.exp < now {
            bail!("token expired");
        }
        if let Some(iss) = &self.issuer {
            if &claims.iss != iss {
                bail!("issuer mismatch");
            }
        }
        if let Some(aud) = &self.audience {
            if &claims.aud != aud {
                bail!("audience mismatch");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TokenValidator for HsValidator {
    async fn validate(&self, token: &str) -> anyhow::Result<Claims> {
        let mut parts = token.split('.');
        let (header_b64, claims_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(c), Some(s), None) => (h, c, s),
                _ => bail!("invalid token format"),
            };

        let header = URL_SAFE_NO_PAD
            .decode(header_b64)
            .context("decode token header")?;
        let header: serde_json::Value =
            serde_json::from_slice(&header).context("parse token header")?;
        if header.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
            bail!("unsupported token algorithm");
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .context("decode token signature")?;
        if mac.verify_slice(&sig).is_err() {
            bail!("token signature mismatch");
        }

        let claims = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .context("decode token claims")?;
        let claims: Claims = serde_json::from_slice(&claims).context("parse token claims")?;
        self.check_claims(&claims)?;
        Ok(claims)
    }
}

/// Signs claims with HS256. Development and test helper; production tokens
/// come from the identity provider.
pub fn mint_hs256(secret: &[u8], claims: &Claims) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{body}.{sig}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            sub: "42".to_string(),
            iss: "https://id.example".to_string(),
            aud: "arena".to_string(),
            exp: i64::MAX,
            jti: "j-1".to_string(),
        }
    }

    #[tokio::test]
    async fn minted_token_validates() {
        let v = HsValidator::new("secret")
            .with_issuer("https://id.example")
            .with_audience("arena");
        let token = mint_hs256(b"secret", &claims());
        let got = v.validate(&token).await.unwrap();
        assert_eq!(got, claims());
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let v = HsValidator::new("secret");
        let token = mint_hs256(b"other", &claims());
        assert!(v.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let v = HsValidator::new("secret");
        let mut c = claims();
        c.exp = 1;
        let token = mint_hs256(b"secret", &c);
        assert!(v.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn issuer_mismatch_is_rejected() {
        let v = HsValidator::new("secret").with_issuer("https://id.example");
        let mut c = claims();
        c.iss = "https://evil.example".to_string();
        let token = mint_hs256(b"secret", &c);
        assert!(v.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let v = HsValidator::new("secret");
        assert!(v.validate("not-a-token").await.is_err());
    }
}
