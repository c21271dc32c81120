use axum::{
    extract::connect_info::ConnectInfo,
    http::{request::Parts, HeaderMap},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::identity::{Identity, IdentityResolver};

/// Extract client IP from proxy headers and optional transport metadata.
pub fn extract_ip_from_headers(headers: &HeaderMap, fallback: Option<IpAddr>) -> IpAddr {
    if let Some(h) = headers.get("x-forwarded-for").and_then(|hv| hv.to_str().ok()) {
        if let Some(first) = h.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    if let Some(h) = headers.get("x-real-ip").and_then(|hv| hv.to_str().ok()) {
        if let Ok(ip) = h.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    if let Some(ip) = fallback {
        return ip;
    }
    IpAddr::from([127, 0, 0, 1])
}

/// Remote socket address recorded by `into_make_service_with_connect_info`, if any.
pub fn remote_addr(parts: &Parts) -> Option<SocketAddr> {
    parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0)
}

/// Derives the rate-limit key for a request.
///
/// Precedence: an [`Identity`] already attached by the identity stage, then the
/// configured resolver (for limiters that run before identity resolution), then the
/// caller's network address. Keys are namespaced so a login can never collide with an
/// address. Callers behind one NAT without an identity share a bucket.
#[derive(Clone, Default)]
pub struct CallerKeys {
    resolver: Option<Arc<dyn IdentityResolver>>,
    trust_proxy_headers: bool,
}

impl CallerKeys {
    pub fn new(trust_proxy_headers: bool) -> Self {
        Self { resolver: None, trust_proxy_headers }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub async fn key_for(&self, parts: &Parts) -> String {
        if let Some(identity) = parts.extensions.get::<Identity>() {
            return identity_key(identity);
        }
        if let Some(resolver) = &self.resolver {
            if let Ok(identity) = resolver.resolve(parts).await {
                return identity_key(&identity);
            }
        }
        format!("ip:{}", self.client_ip(parts))
    }

    /// Network address of the caller. Proxy headers are only honored when the service
    /// is configured to sit behind a trusted proxy.
    pub fn client_ip(&self, parts: &Parts) -> IpAddr {
        let remote = remote_addr(parts).map(|addr| addr.ip());
        if self.trust_proxy_headers {
            extract_ip_from_headers(&parts.headers, remote)
        } else {
            remote.unwrap_or(IpAddr::from([127, 0, 0, 1]))
        }
    }
}

fn identity_key(identity: &Identity) -> String {
    format!("id:{}", identity.login)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::identity::HeaderIdentityResolver;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn falls_back_to_remote_address() {
        let mut p = parts(Request::builder().uri("/"));
        p.extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 5555))));
        assert_eq!(CallerKeys::new(false).key_for(&p).await, "ip:10.0.0.7");
    }

    #[tokio::test]
    async fn ignores_forwarded_for_unless_trusted() {
        let mut p = parts(Request::builder().uri("/").header("x-forwarded-for", "203.0.113.9, 10.0.0.1"));
        p.extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 5555))));

        assert_eq!(CallerKeys::new(false).key_for(&p).await, "ip:10.0.0.7");
        assert_eq!(CallerKeys::new(true).key_for(&p).await, "ip:203.0.113.9");
    }

    #[tokio::test]
    async fn prefers_attached_identity() {
        let mut p = parts(Request::builder().uri("/"));
        p.extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 5555))));
        p.extensions.insert(Identity { login: "alice@example.com".into(), display_name: None });
        assert_eq!(CallerKeys::new(false).key_for(&p).await, "id:alice@example.com");
    }

    #[tokio::test]
    async fn consults_resolver_before_address() {
        let resolver = Arc::new(HeaderIdentityResolver::new("Tailscale-User-Login", None).unwrap());
        let keys = CallerKeys::new(false).with_resolver(resolver);

        let p = parts(Request::builder().uri("/").header("tailscale-user-login", "bob@example.com"));
        assert_eq!(keys.key_for(&p).await, "id:bob@example.com");

        let anonymous = parts(Request::builder().uri("/"));
        assert_eq!(keys.key_for(&anonymous).await, "ip:127.0.0.1");
    }

    #[tokio::test]
    async fn untrusted_identity_headers_fall_back_to_address() {
        let resolver = HeaderIdentityResolver::new("Tailscale-User-Login", None)
            .unwrap()
            .with_trusted_peers([IpAddr::from([127, 0, 0, 1])]);
        let keys = CallerKeys::new(false).with_resolver(Arc::new(resolver));

        let mut p = parts(Request::builder().uri("/").header("tailscale-user-login", "mallory@example.com"));
        p.extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 5555))));
        assert_eq!(keys.key_for(&p).await, "ip:10.0.0.7");

        let mut p = parts(Request::builder().uri("/").header("tailscale-user-login", "bob@example.com"));
        p.extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 5555))));
        assert_eq!(keys.key_for(&p).await, "id:bob@example.com");
    }

    #[test]
    fn test_extract_ip_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_ip_from_headers(&headers, None), IpAddr::from([127, 0, 0, 1]));

        headers.insert("x-real-ip", "192.0.2.4".parse().unwrap());
        assert_eq!(extract_ip_from_headers(&headers, None), IpAddr::from([192, 0, 2, 4]));

        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(extract_ip_from_headers(&headers, None), IpAddr::from([192, 0, 2, 4]));
    }
}
