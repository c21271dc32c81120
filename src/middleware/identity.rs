//! Caller identity as resolved by the upstream authentication layer.
//!
//! Authentication itself happens outside this service (for example `tailscale serve`
//! injecting `Tailscale-User-Login`). This module only consumes the result: it attaches
//! an [`Identity`] to the request and gates the authenticated and admin pipelines.

use std::{collections::HashSet, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::ip::remote_addr;
use crate::error::{AppError, AppResult, IdentityError};

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable login, used as the rate-limit key and for admin checks.
    pub login: String,
    pub display_name: Option<String>,
}

/// Maps a request to a stable caller identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    async fn resolve(&self, parts: &Parts) -> Result<Identity, IdentityError>;
}

/// Reads the identity from headers set by a trusted authenticating proxy.
///
/// With a trusted-peer list, the headers are only believed when the connection comes
/// from one of those addresses; anyone else could set them. Without a list every peer
/// is trusted, which is only sound when the proxy is the sole way in.
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    login_header: HeaderName,
    name_header: Option<HeaderName>,
    trusted_peers: Option<Arc<HashSet<IpAddr>>>,
}

impl HeaderIdentityResolver {
    pub fn new(login_header: &str, name_header: Option<&str>) -> AppResult<Self> {
        let parse = |name: &str| {
            HeaderName::try_from(name)
                .map_err(|e| AppError::InvalidInput(format!("invalid header name {:?}: {}", name, e)))
        };
        Ok(Self {
            login_header: parse(login_header)?,
            name_header: name_header.map(parse).transpose()?,
            trusted_peers: None,
        })
    }

    pub fn with_trusted_peers(mut self, peers: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_peers = Some(Arc::new(peers.into_iter().collect()));
        self
    }

    fn check_peer(&self, parts: &Parts) -> Result<(), IdentityError> {
        let Some(trusted) = &self.trusted_peers else {
            return Ok(());
        };
        match remote_addr(parts).map(|addr| addr.ip()) {
            Some(ip) if trusted.contains(&ip) => Ok(()),
            Some(ip) => Err(IdentityError::UntrustedPeer(ip.to_string())),
            None => Err(IdentityError::UntrustedPeer("unknown".into())),
        }
    }
}

#[async_trait]
impl IdentityResolver for HeaderIdentityResolver {
    async fn resolve(&self, parts: &Parts) -> Result<Identity, IdentityError> {
        let raw = parts.headers.get(&self.login_header).ok_or(IdentityError::Absent)?;
        self.check_peer(parts)?;
        let login = raw
            .to_str()
            .map_err(|e| IdentityError::Malformed(e.to_string()))?
            .trim();
        if login.is_empty() {
            return Err(IdentityError::Absent);
        }
        let display_name = self
            .name_header
            .as_ref()
            .and_then(|h| parts.headers.get(h))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(Identity { login: login.to_string(), display_name })
    }
}

/// Attaches the resolved [`Identity`] to the request, if there is one. Requests without
/// an identity continue; the gates below decide whether that is acceptable.
pub async fn identity_middleware(
    State(resolver): State<Arc<dyn IdentityResolver>>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    match resolver.resolve(&parts).await {
        Ok(identity) => {
            parts.extensions.insert(identity);
        }
        Err(IdentityError::Absent) => {}
        Err(e) => {
            tracing::warn!(method = %parts.method, path = %parts.uri.path(), "identity not resolved: {}", e);
        }
    }
    next.run(Request::from_parts(parts, body)).await
}

/// Rejects requests that reached an authenticated pipeline without an identity.
pub async fn require_identity_middleware(req: Request, next: Next) -> Response {
    if req.extensions().get::<Identity>().is_none() {
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "unauthenticated request rejected");
        return AppError::Unauthorized("identity required".into()).into_response();
    }
    next.run(req).await
}

/// Logins allowed through the admin pipeline.
#[derive(Debug, Clone, Default)]
pub struct AdminList(Arc<HashSet<String>>);

impl AdminList {
    pub fn new<I, S>(logins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(logins.into_iter().map(Into::into).collect()))
    }

    pub fn contains(&self, login: &str) -> bool {
        self.0.contains(login)
    }
}

/// Rejects callers that are not listed admins.
pub async fn require_admin_middleware(State(admins): State<AdminList>, req: Request, next: Next) -> Response {
    let allowed = req
        .extensions()
        .get::<Identity>()
        .map(|id| admins.contains(&id.login))
        .unwrap_or(false);
    if !allowed {
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "admin access denied");
        return AppError::Forbidden("admin only".into()).into_response();
    }
    next.run(req).await
}

/// Extractor for handlers behind the authenticated pipeline.
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("identity required".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn resolves_login_and_name() {
        let resolver = HeaderIdentityResolver::new("Tailscale-User-Login", Some("Tailscale-User-Name")).unwrap();
        let p = parts(
            HttpRequest::builder()
                .header("tailscale-user-login", " carol@example.com ")
                .header("tailscale-user-name", "Carol"),
        );
        let id = resolver.resolve(&p).await.unwrap();
        assert_eq!(id.login, "carol@example.com");
        assert_eq!(id.display_name.as_deref(), Some("Carol"));
    }

    #[tokio::test]
    async fn missing_or_blank_login_is_absent() {
        let resolver = HeaderIdentityResolver::new("Tailscale-User-Login", None).unwrap();
        assert_eq!(resolver.resolve(&parts(HttpRequest::builder())).await, Err(IdentityError::Absent));

        let blank = parts(HttpRequest::builder().header("tailscale-user-login", "   "));
        assert_eq!(resolver.resolve(&blank).await, Err(IdentityError::Absent));
    }

    fn from_peer(builder: axum::http::request::Builder, peer: [u8; 4]) -> Parts {
        let mut p = parts(builder);
        p.extensions.insert(axum::extract::ConnectInfo(std::net::SocketAddr::from((peer, 4000))));
        p
    }

    #[tokio::test]
    async fn headers_only_trusted_from_listed_peers() {
        let resolver = HeaderIdentityResolver::new("Tailscale-User-Login", None)
            .unwrap()
            .with_trusted_peers([IpAddr::from([127, 0, 0, 1])]);
        let login = || HttpRequest::builder().header("tailscale-user-login", "dave@example.com");

        let id = resolver.resolve(&from_peer(login(), [127, 0, 0, 1])).await.unwrap();
        assert_eq!(id.login, "dave@example.com");

        assert_eq!(
            resolver.resolve(&from_peer(login(), [203, 0, 113, 5])).await,
            Err(IdentityError::UntrustedPeer("203.0.113.5".into()))
        );
        assert!(matches!(resolver.resolve(&parts(login())).await, Err(IdentityError::UntrustedPeer(_))));

        // No header at all is still plain absence
        assert_eq!(
            resolver.resolve(&from_peer(HttpRequest::builder(), [203, 0, 113, 5])).await,
            Err(IdentityError::Absent)
        );
    }

    #[test]
    fn rejects_invalid_header_names() {
        assert!(HeaderIdentityResolver::new("bad header", None).is_err());
    }

    #[test]
    fn admin_list_membership() {
        let admins = AdminList::new(["root@example.com"]);
        assert!(admins.contains("root@example.com"));
        assert!(!admins.contains("guest@example.com"));
    }
}
