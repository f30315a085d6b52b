//! axum integration.
//!
//! ```rust,ignore
//! let route_guard = RouteGuard::new(guard.clone(), ScopePolicy::all_of(["read"]));
//! let app = Router::new()
//!     .route("/items", get(list_items))
//!     .layer(axum::middleware::from_fn_with_state(route_guard, require_scopes));
//! ```

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::extract::RequestMetadata;
use crate::decision::Guard;
use crate::models::policy::ScopePolicy;
use crate::models::verdict::AuthorizationVerdict;

/// Largest form body buffered when form tokens are enabled.
const MAX_FORM_BODY: usize = 64 * 1024;

/// Middleware state: the shared guard plus one route's scope policy.
#[derive(Clone)]
pub struct RouteGuard {
    guard: Arc<Guard>,
    policy: Arc<ScopePolicy>,
    realm: Option<String>,
}

impl RouteGuard {
    pub fn new(guard: impl Into<Arc<Guard>>, policy: ScopePolicy) -> Self {
        Self {
            guard: guard.into(),
            policy: Arc::new(policy),
            realm: None,
        }
    }

    /// Realm advertised in `WWW-Authenticate` challenges.
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }
}

/// Middleware: authorizes the request, then passes it on with the verified
/// [`TokenClaims`](crate::TokenClaims) in its extensions. Denials become
/// RFC 6750 responses (401 / 403 / 503 with `WWW-Authenticate`).
pub async fn require_scopes(State(route): State<RouteGuard>, req: Request, next: Next) -> Response {
    let (req, metadata) = match request_metadata(&route.guard, req).await {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    match route.guard.decide(&metadata, &route.policy).await {
        AuthorizationVerdict::Allow(claims) => {
            let mut req = req;
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        AuthorizationVerdict::Deny(reason) => {
            tracing::info!(
                method = %req.method(),
                path = %req.uri().path(),
                reason = %reason,
                "request denied"
            );
            reason.into_response_with_scopes(route.realm.as_deref(), route.policy.scopes())
        }
    }
}

/// Collect headers, plus the query string and form body when the guard
/// accepts tokens there. A buffered body is put back into the request.
async fn request_metadata(guard: &Guard, req: Request) -> Result<(Request, RequestMetadata), Response> {
    let extractor = guard.extractor();
    let mut metadata = RequestMetadata::from_headers(req.headers().clone());

    if extractor.allows_query() {
        if let Some(query) = req.uri().query() {
            metadata = metadata.with_query(query);
        }
    }

    if !extractor.allows_form() || !is_form(&req) {
        return Ok((req, metadata));
    }

    let (parts, body) = req.into_parts();
    let bytes: Bytes = axum::body::to_bytes(body, MAX_FORM_BODY).await.map_err(|e| {
        tracing::debug!(error = %e, "form body rejected");
        StatusCode::PAYLOAD_TOO_LARGE.into_response()
    })?;
    let metadata = metadata.with_form(&bytes);
    Ok((Request::from_parts(parts, Body::from(bytes)), metadata))
}

fn is_form(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}
