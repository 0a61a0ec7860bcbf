//! ABOUTME: Auth boundary (§6.6) - the contract lives in the core binary, the implementation doesn't
//! ABOUTME: Default impl is permissive; a real deployment swaps in a bearer check against security.auth_endpoint

use actix_web::HttpRequest;
use async_trait::async_trait;
use cronmesh_core::{Error, Result};

/// Gate checked before the thin operator surface acts on a request. §1 treats the delegated
/// auth service as an external collaborator out of scope for this crate; this trait is the
/// seam a deployment wires a real implementation into.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn check(&self, req: &HttpRequest) -> Result<()>;
}

/// Permissive default (§6.6): always allows. Never use this in a deployment that has
/// `security.auth_endpoint` configured — it exists so the crate runs end-to-end without one.
pub struct PermissiveAuthGate;

#[async_trait]
impl AuthGate for PermissiveAuthGate {
    async fn check(&self, _req: &HttpRequest) -> Result<()> {
        Ok(())
    }
}

/// Minimal bearer-presence check: rejects requests with no `Authorization: Bearer ...` header
/// when an auth endpoint is configured, without actually calling out to it. A real deployment
/// replaces this with one that validates the token against `security.auth_endpoint`.
pub struct BearerPresenceAuthGate;

#[async_trait]
impl AuthGate for BearerPresenceAuthGate {
    async fn check(&self, req: &HttpRequest) -> Result<()> {
        let has_bearer = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("Bearer "))
            .unwrap_or(false);

        if has_bearer {
            Ok(())
        } else {
            Err(Error::BadRequest("missing bearer token".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[tokio::test]
    async fn permissive_gate_allows_anything() {
        let req = TestRequest::default().to_http_request();
        assert!(PermissiveAuthGate.check(&req).await.is_ok());
    }

    #[tokio::test]
    async fn bearer_presence_gate_rejects_missing_header() {
        let req = TestRequest::default().to_http_request();
        assert!(BearerPresenceAuthGate.check(&req).await.is_err());
    }

    #[tokio::test]
    async fn bearer_presence_gate_accepts_bearer_header() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer abc123"))
            .to_http_request();
        assert!(BearerPresenceAuthGate.check(&req).await.is_ok());
    }
}
