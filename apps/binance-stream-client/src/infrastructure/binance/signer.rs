//! Request Signing
//!
//! Signed REST endpoints carry an HMAC-SHA256 of their query string, keyed
//! with the API secret and encoded as lowercase hex.

use ring::hmac;

use crate::infrastructure::config::Credentials;

/// Signs query strings with one API secret.
pub struct Signer {
    api_key: String,
    key: hmac::Key,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Create a signer for a set of credentials.
    #[must_use]
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            api_key: credentials.api_key().to_string(),
            key: hmac::Key::new(hmac::HMAC_SHA256, credentials.api_secret().as_bytes()),
        }
    }

    /// API key sent in the `X-MBX-APIKEY` header.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Hex HMAC-SHA256 of `payload`.
    #[must_use]
    pub fn sign(&self, payload: &str) -> String {
        hex::encode(hmac::sign(&self.key, payload.as_bytes()).as_ref())
    }

    /// Append `timestamp`, `recvWindow` and `signature` to a query string.
    #[must_use]
    pub fn signed_query(&self, query: &str, timestamp_ms: i64, recv_window_ms: u64) -> String {
        let mut payload = String::with_capacity(query.len() + 48);
        if !query.is_empty() {
            payload.push_str(query);
            payload.push('&');
        }
        payload.push_str(&format!("recvWindow={recv_window_ms}&timestamp={timestamp_ms}"));

        let signature = self.sign(&payload);
        payload.push_str("&signature=");
        payload.push_str(&signature);
        payload
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    // Published venue test vectors
    const SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";

    fn signer() -> Signer {
        Signer::new(&Credentials::new("key".to_string(), SECRET.to_string()))
    }

    #[test_case(
        "timestamp=1578963600000",
        "d84e6641b1e328e7b418fff030caed655c266299c9355e36ce801ed14631eed4";
        "timestamp only"
    )]
    #[test_case(
        "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559",
        "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71";
        "limit order"
    )]
    fn matches_reference_signatures(payload: &str, expected: &str) {
        assert_eq!(signer().sign(payload), expected);
    }

    #[test]
    fn signed_query_appends_fields_in_order() {
        let signer = signer();
        let query = signer.signed_query("symbol=BTCUSDT", 1_499_827_319_559, 5000);

        let (payload, signature) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(
            payload,
            "symbol=BTCUSDT&recvWindow=5000&timestamp=1499827319559"
        );
        assert_eq!(signature, signer.sign(payload));
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn signed_query_without_parameters() {
        let query = signer().signed_query("", 1, 5000);
        assert!(query.starts_with("recvWindow=5000&timestamp=1&signature="));
    }

    #[test]
    fn debug_redacts_key() {
        let signer = Signer::new(&Credentials::new("visible-key".to_string(), SECRET.to_string()));
        let debug = format!("{signer:?}");
        assert!(!debug.contains("visible-key"));
        assert!(debug.contains("[REDACTED]"));
    }
}
