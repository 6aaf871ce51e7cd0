//! HMAC-SHA256 signer for the connect handshake

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub trait Signer: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

pub struct HmacSigner {
    api_key: String,
    api_secret: String,
}

impl HmacSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Hex signature over `api_key + timestamp_ms`
    pub fn handshake_signature(&self, timestamp_ms: i64) -> String {
        let message = format!("{}{}", self.api_key, timestamp_ms);
        hex::encode(self.sign(message.as_bytes()))
    }
}

impl Signer for HmacSigner {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, new_from_slice cannot fail here
        let mut mac = match HmacSha256::new_from_slice(self.api_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
