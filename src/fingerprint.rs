use http::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::descriptor::RequestDescriptor;
use crate::util::url_without_query;

/// Deterministic cache and dedup key for a logical request.
///
/// Two descriptors with the same method, normalized URL, canonical body and
/// idempotency key produce equal fingerprints regardless of how they were
/// built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    key: String,
    resource: String,
}

impl Fingerprint {
    pub fn of(descriptor: &RequestDescriptor) -> Self {
        let canonical_body = descriptor.body.canonical_bytes();
        let idempotency_key = descriptor
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .map(|value| value.as_bytes())
            .unwrap_or_default();

        let mut key = format!("{} {}", descriptor.method, descriptor.url);
        if !canonical_body.is_empty() || !idempotency_key.is_empty() {
            let mut hasher = Sha256::new();
            hasher.update(&canonical_body);
            hasher.update([0_u8]);
            hasher.update(idempotency_key);
            key.push(' ');
            key.push_str(&hex::encode(hasher.finalize()));
        }

        Self {
            key,
            resource: resource_key(&descriptor.method, &descriptor.url),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Method and URL without query or body; groups every variant of one
    /// endpoint for invalidation.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.key)
    }
}

pub(crate) fn resource_key(method: &Method, url: &Url) -> String {
    format!("{method} {}", url_without_query(url))
}
