//! Canonical cache keys.
//!
//! A fingerprint is a 128-bit digest over the request method and the
//! canonical URL. Two requests with the same canonical method+URL produce
//! the same *public* key; a *private* key additionally carries the serial of
//! the selector that minted it and therefore never matches across selectors,
//! no matter how equal the URLs are.

use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher13};

use crate::url::RequestUrl;

/// Fixed digest keys. Keys are not secret; the digest only has to be stable
/// within one process generation.
const KEY0: u64 = 0x6e61_6170_7572_6931;
const KEY1: u64 = 0x6b65_795f_6469_6733;

/// Whether a key may be shared between transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Matches any other public key with the same digest.
    Public,
    /// Only ever equal to itself; tagged with the owning selector serial.
    Private(u64),
}

/// A 128-bit cache key with a public/private marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    digest: u128,
    visibility: Visibility,
}

fn digest_of(method: &str, url: &RequestUrl) -> u128 {
    let mut hasher = SipHasher13::new_with_keys(KEY0, KEY1);
    hasher.write(method.as_bytes());
    hasher.write(b" ");
    hasher.write(url.scheme().as_bytes());
    hasher.write(b"://");
    hasher.write(url.host().as_bytes());
    hasher.write(&url.port().to_be_bytes());
    hasher.write(url.path().as_bytes());
    hasher.finish128().as_u128()
}

impl Fingerprint {
    /// Key for a cacheable request; equal for identical canonical inputs.
    pub fn public(method: &str, url: &RequestUrl) -> Self {
        Fingerprint {
            digest: digest_of(method, url),
            visibility: Visibility::Public,
        }
    }

    /// Key for a non-shareable object, unique to the minting selector.
    pub fn private(method: &str, url: &RequestUrl, selector_serial: u64) -> Self {
        Fingerprint {
            digest: digest_of(method, url),
            visibility: Visibility::Private(selector_serial),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self.visibility, Visibility::Public)
    }

    pub fn digest(&self) -> u128 {
        self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> RequestUrl {
        RequestUrl::parse(s).unwrap()
    }

    #[test]
    fn identical_requests_share_a_public_key() {
        let a = Fingerprint::public("GET", &url("http://Example.com/a"));
        let b = Fingerprint::public("GET", &url("HTTP://example.COM:80/a"));
        assert_eq!(a, b);
    }

    #[test]
    fn method_and_path_separate_keys() {
        let base = Fingerprint::public("GET", &url("http://ex.com/a"));
        assert_ne!(base, Fingerprint::public("HEAD", &url("http://ex.com/a")));
        assert_ne!(base, Fingerprint::public("GET", &url("http://ex.com/A")));
        assert_ne!(base, Fingerprint::public("GET", &url("http://ex.com:81/a")));
    }

    #[test]
    fn private_keys_never_match() {
        let u = url("http://ex.com/a");
        let a = Fingerprint::private("GET", &u, 1);
        let b = Fingerprint::private("GET", &u, 2);
        let public = Fingerprint::public("GET", &u);
        assert_ne!(a, b);
        assert_ne!(a, public);
        assert_eq!(a, a);
        assert!(!a.is_public());
    }
}
