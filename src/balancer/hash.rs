//! Consistent-hash key computation.

use std::collections::HashMap;
use std::net::IpAddr;

use super::config::{HashInput, Upstream};

/// Request attributes the hash key can be derived from.
///
/// Filled by the request pipeline before peer resolution. Header names
/// are matched case-insensitively; store them lowercased.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated consumer id, if any.
    pub consumer_id: Option<String>,
    /// Authenticated credential id, if any.
    pub credential_id: Option<String>,
    /// Remote client address.
    pub client_addr: Option<IpAddr>,
    /// Request headers, lowercased names, values in wire order.
    pub headers: HashMap<String, Vec<String>>,
}

impl RequestContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authenticated consumer.
    #[must_use]
    pub fn with_consumer(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = Some(id.into());
        self
    }

    /// Set the authenticated credential.
    #[must_use]
    pub fn with_credential(mut self, id: impl Into<String>) -> Self {
        self.credential_id = Some(id.into());
        self
    }

    /// Set the client address.
    #[must_use]
    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Append a header value.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }
}

/// Compute the 32-bit hash key for a request, or `None` when the
/// upstream does not hash or no input attribute is present.
///
/// The primary input is tried first; if it yields no identifier the
/// fallback input (and fallback header) gets one more pass. The key is
/// the CRC32 of the identifier bytes, so every worker derives the same
/// key from the same request.
#[must_use]
pub fn create_hash(upstream: &Upstream, ctx: &RequestContext) -> Option<u32> {
    if upstream.hash_on == HashInput::None {
        return None;
    }

    if let Some(identifier) =
        identifier_for(upstream.hash_on, upstream.hash_on_header.as_deref(), ctx)
    {
        return Some(crc32fast::hash(identifier.as_bytes()));
    }

    if upstream.hash_fallback == HashInput::None {
        return None;
    }
    identifier_for(
        upstream.hash_fallback,
        upstream.hash_fallback_header.as_deref(),
        ctx,
    )
    .map(|identifier| crc32fast::hash(identifier.as_bytes()))
}

fn identifier_for(
    input: HashInput,
    header_name: Option<&str>,
    ctx: &RequestContext,
) -> Option<String> {
    match input {
        HashInput::None => None,
        HashInput::Consumer => ctx
            .consumer_id
            .clone()
            .or_else(|| ctx.credential_id.clone()),
        HashInput::Ip => ctx.client_addr.map(|addr| addr.to_string()),
        HashInput::Header => {
            let values = ctx.headers.get(&header_name?.to_ascii_lowercase())?;
            if values.is_empty() {
                None
            } else {
                // Multi-valued headers concatenate in wire order.
                Some(values.concat())
            }
        },
    }
}
