//! Stored references and how the engine turns them into a descriptor.

use facegate_core::{
    Descriptor, DescriptorExtractor, ExtractorError, ReferenceError, ReferenceSource,
};
use reqwest::blocking::Client;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{redirect, StatusCode};
use std::io::Read;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// What an account was registered with.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredReference {
    /// Descriptor extracted from an uploaded image at registration.
    Descriptor(Descriptor),
    /// Remote image, downloaded and re-extracted on every verification.
    Url(String),
}

impl StoredReference {
    pub fn kind(&self) -> &'static str {
        match self {
            StoredReference::Descriptor(_) => "descriptor",
            StoredReference::Url(_) => "url",
        }
    }
}

/// Bounds on remote reference downloads.
///
/// Reference URLs come from unauthenticated registration requests, so the
/// daemon treats them as untrusted: only `http`/`https`, no redirects, a hard
/// body cap, and no private, loopback or link-local destinations unless
/// `allow_private_hosts` is set.
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_bytes: u64,
    pub allow_private_hosts: bool,
}

/// Blocking HTTP client for reference images.
///
/// Lives on the engine thread; `reqwest::blocking` must not be used from
/// inside the async runtime.
pub struct ImageFetcher {
    client: Client,
    limits: FetchLimits,
}

impl ImageFetcher {
    pub fn new(limits: FetchLimits) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .timeout(limits.timeout)
            .redirect(redirect::Policy::none())
            .user_agent(concat!("facegated/", env!("CARGO_PKG_VERSION")));
        if !limits.allow_private_hosts {
            builder = builder.dns_resolver(Arc::new(PublicResolver));
        }
        Ok(Self {
            client: builder.build()?,
            limits,
        })
    }

    /// Download an image. Anything other than 200 is a fetch failure,
    /// including redirects.
    pub fn fetch(&self, url: &str) -> Result<Vec<u8>, ReferenceError> {
        let url = validate_url(url, self.limits.allow_private_hosts)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| ReferenceError::Fetch(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ReferenceError::Fetch(format!("{url} returned {status}")));
        }

        let max = self.limits.max_bytes;
        if response.content_length().is_some_and(|len| len > max) {
            return Err(ReferenceError::Fetch(format!("{url} is larger than {max} bytes")));
        }

        // Content-Length may be absent or wrong
        let mut body = Vec::new();
        response
            .take(max + 1)
            .read_to_end(&mut body)
            .map_err(|e| ReferenceError::Fetch(e.to_string()))?;
        if body.len() as u64 > max {
            return Err(ReferenceError::Fetch(format!("{url} is larger than {max} bytes")));
        }
        tracing::debug!(bytes = body.len(), "reference image downloaded");
        Ok(body)
    }
}

/// Parse a reference URL and check it against the fetch policy.
///
/// Hostnames are checked again after DNS resolution by [`PublicResolver`].
pub fn validate_url(url: &str, allow_private_hosts: bool) -> Result<reqwest::Url, ReferenceError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ReferenceError::Fetch(format!("invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ReferenceError::Fetch(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    let Some(host) = parsed.host_str() else {
        return Err(ReferenceError::Fetch("URL has no host".into()));
    };
    if allow_private_hosts {
        return Ok(parsed);
    }

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let blocked = match host.parse::<IpAddr>() {
        Ok(ip) => !is_public(ip),
        Err(_) => {
            let host = host.to_ascii_lowercase();
            host == "localhost" || host.ends_with(".localhost")
        }
    };
    if blocked {
        return Err(ReferenceError::Fetch(format!("{host} is not a public host")));
    }
    Ok(parsed)
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            // 100.64.0.0/10 is carrier-grade NAT
            let shared = a == 100 && (b & 0xC0) == 64;
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || shared)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xFE00) == 0xFC00;
            let link_local = (first & 0xFFC0) == 0xFE80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// Resolver that drops private addresses, so a public hostname cannot be
/// pointed at an internal service.
struct PublicResolver;

impl Resolve for PublicResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(public_addrs(name.as_str().to_string()))
    }
}

async fn public_addrs(host: String) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let lookup = host.clone();
    let resolved = tokio::task::spawn_blocking(move || (lookup.as_str(), 0).to_socket_addrs())
        .await??;
    let addrs: Vec<SocketAddr> = resolved.filter(|addr| is_public(addr.ip())).collect();
    if addrs.is_empty() {
        return Err(format!("{host} has no public address").into());
    }
    Ok(Box::new(addrs.into_iter()))
}

/// A [`StoredReference`] paired with the fetcher needed to resolve it.
pub struct ResolvableReference<'a> {
    pub stored: StoredReference,
    pub fetcher: &'a ImageFetcher,
}

impl ReferenceSource for ResolvableReference<'_> {
    fn resolve(
        self,
        extractor: &mut dyn DescriptorExtractor,
    ) -> Result<Descriptor, ReferenceError> {
        match self.stored {
            StoredReference::Descriptor(descriptor) => Ok(descriptor),
            StoredReference::Url(url) => {
                let image = self.fetcher.fetch(&url)?;
                match extractor.extract(&image) {
                    Ok(frame) => Ok(frame.ok_or(ReferenceError::NoFace)?.descriptor),
                    Err(ExtractorError::Decode(err)) => {
                        tracing::debug!(error = %err, "reference image is not readable");
                        Err(ReferenceError::NoFace)
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}
