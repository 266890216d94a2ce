//! Unsubscribe link signing.
//!
//! Links carry the address, the subscriber's token and
//! `HMAC-SHA256(secret, email + "\n" + token)` as lowercase hex.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::warn;

use crate::config::UnsubscribeConfig;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies unsubscribe parameters with the process-wide secret.
#[derive(Clone)]
pub struct UnsubscribeSigner {
    secret: SecretString,
    base_url: String,
    path: String,
}

impl std::fmt::Debug for UnsubscribeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsubscribeSigner")
            .field("base_url", &self.base_url)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl UnsubscribeSigner {
    pub fn new(config: &UnsubscribeConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            base_url: config.public_base_url.clone(),
            path: config.path.clone(),
        }
    }

    fn mac(&self, email: &str, token: &str) -> HmacSha256 {
        // HMAC accepts keys of any length, so this never fails.
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(email.as_bytes());
        mac.update(b"\n");
        mac.update(token.as_bytes());
        mac
    }

    /// Hex signature over `(email, token)`.
    pub fn sign(&self, email: &str, token: &str) -> String {
        hex::encode(self.mac(email, token).finalize().into_bytes())
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, email: &str, token: &str, signature: &str) -> bool {
        let Ok(bytes) = hex::decode(signature.trim()) else {
            warn!(signature_length = signature.len(), "unsubscribe_signature_not_hex");
            return false;
        };
        self.mac(email, token).verify_slice(&bytes).is_ok()
    }

    /// Path the unsubscribe endpoint is served on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full self-service link for one subscriber.
    pub fn link(&self, email: &str, token: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("e", email)
            .append_pair("t", token)
            .append_pair("s", &self.sign(email, token))
            .finish();
        format!("{}{}?{query}", self.base_url, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UnsubscribeSigner {
        UnsubscribeSigner::new(&UnsubscribeConfig {
            public_base_url: "https://news.example.com".into(),
            path: "/unsub".into(),
            secret: SecretString::from("test-secret"),
        })
    }

    #[test]
    fn sign_then_verify() {
        let s = signer();
        let sig = s.sign("a@x.com", "tok-A");
        assert_eq!(sig.len(), 64);
        assert!(s.verify("a@x.com", "tok-A", &sig));
    }

    #[test]
    fn tampering_breaks_signature() {
        let s = signer();
        let sig = s.sign("a@x.com", "tok-A");
        assert!(!s.verify("b@x.com", "tok-A", &sig));
        assert!(!s.verify("a@x.com", "tok-B", &sig));
        assert_ne!(sig, s.sign("a@x.com", "tok-B"));
        assert_ne!(sig, s.sign("a@x.com\ntok-A", ""));
    }

    #[test]
    fn garbage_signature_rejected() {
        let s = signer();
        assert!(!s.verify("a@x.com", "tok-A", "not-hex"));
        assert!(!s.verify("a@x.com", "tok-A", ""));
    }

    #[test]
    fn different_secret_different_signature() {
        let other = UnsubscribeSigner::new(&UnsubscribeConfig {
            public_base_url: "https://news.example.com".into(),
            path: "/unsub".into(),
            secret: SecretString::from("another-secret"),
        });
        assert_ne!(signer().sign("a@x.com", "t"), other.sign("a@x.com", "t"));
    }

    #[test]
    fn link_encodes_query() {
        let s = signer();
        let link = s.link("a+b@x.com", "tok A");
        let expected_sig = s.sign("a+b@x.com", "tok A");
        assert_eq!(
            link,
            format!("https://news.example.com/unsub?e=a%2Bb%40x.com&t=tok+A&s={expected_sig}")
        );
    }
}
