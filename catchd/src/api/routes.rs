//! Router wiring for the web surface.
//!
//! One mux carries the `/api/v0` tree (peer-authorized), the registry at
//! `/v2`, and static UI assets at the root with conditional-request
//! handling.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::warn;
use tower_http::trace::TraceLayer;

use super::{handlers, ws};
use crate::daemon::Daemon;
use crate::registry::Registry;

#[derive(Clone)]
pub struct ApiState {
    pub daemon: Arc<Daemon>,
}

/// Build the full web router: API, registry, static assets.
pub fn router(daemon: Arc<Daemon>, registry: Registry) -> Router {
    let state = ApiState {
        daemon: daemon.clone(),
    };
    let api = Router::new()
        .route("/api/v0/info", get(handlers::info))
        .route("/api/v0/services", get(handlers::services))
        .route("/api/v0/run-command", get(ws::run_command))
        .route("/api/v0/events", get(ws::events))
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .with_state(state.clone());

    Router::new()
        .merge(api)
        .merge(registry.router())
        .fallback(get(static_asset).with_state(state))
        .layer(TraceLayer::new_for_http())
}

/// Peer-identity gate for the API tree.
async fn authorize(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>().copied()
    else {
        return (StatusCode::UNAUTHORIZED, "unknown caller\n").into_response();
    };
    if let Err(err) = state.daemon.authorizer.authorize(addr).await {
        warn!("api caller {addr} rejected: {err:#}");
        return (StatusCode::UNAUTHORIZED, "unauthorized connection\n").into_response();
    }
    next.run(req).await
}

/// Serve UI assets with a weak ETag derived from mtime and size, honoring
/// `If-None-Match`.
async fn static_asset(State(state): State<ApiState>, uri: Uri, req_headers: axum::http::HeaderMap) -> Response {
    let Some(assets_dir) = state.daemon.settings.assets_dir.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let rel = uri.path().trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    let Some(path) = sanitize(&assets_dir, rel) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let Ok(meta) = std::fs::metadata(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !meta.is_file() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let etag = weak_etag(&meta);
    if let Some(candidate) = req_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if candidate == etag {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }
    let Ok(content) = std::fs::read(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    (
        [
            (header::ETAG.as_str(), etag),
            (header::CONTENT_TYPE.as_str(), content_type(&path).to_string()),
        ],
        content,
    )
        .into_response()
}

fn weak_etag(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("W/\"{}-{}\"", mtime, meta.len())
}

fn sanitize(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for part in Path::new(rel).components() {
        match part {
            std::path::Component::Normal(c) => clean.push(c),
            _ => return None,
        }
    }
    Some(root.join(clean))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use crate::settings::Settings;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir, allow: bool) -> Router {
        let assets = dir.path().join("web");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("index.html"), "<html>catch</html>").unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            assets_dir: Some(assets),
            ..Settings::default()
        };
        let store = Store::open(settings.paths().db_file()).unwrap();
        let authorizer: Arc<dyn crate::authz::Authorizer> = if allow {
            Arc::new(StaticAuthorizer::allow_all())
        } else {
            Arc::new(StaticAuthorizer::deny_all())
        };
        let daemon = Daemon::new(settings, store, authorizer);
        let registry = Registry::new(daemon.clone()).unwrap();
        router(daemon, registry)
    }

    fn get_req(uri: &str, addr: &str) -> HttpRequest<Body> {
        let mut req = HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(addr.parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn info_requires_authorization() {
        let dir = TempDir::new().unwrap();
        let res = app(&dir, false)
            .oneshot(get_req("/api/v0/info", "100.64.0.9:1"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let dir = TempDir::new().unwrap();
        let res = app(&dir, true)
            .oneshot(get_req("/api/v0/info", "100.64.0.9:1"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_command_validates_parameters() {
        let dir = TempDir::new().unwrap();
        let res = app(&dir, true)
            .oneshot(get_req("/api/v0/run-command?service=web", "100.64.0.9:1"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_command_rejects_path_like_service_names() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, true);
        for service in ["..%2F..%2Fetc", "a.b", "Web"] {
            let res = app
                .clone()
                .oneshot(get_req(
                    &format!("/api/v0/run-command?service={service}&command=status"),
                    "100.64.0.9:1",
                ))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{service}");
        }
    }

    #[tokio::test]
    async fn static_assets_serve_with_etag_and_304() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, true);
        let res = app.clone().oneshot(get_req("/", "100.64.0.9:1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let etag = res
            .headers()
            .get(header::ETAG)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(etag.starts_with("W/\""));

        let mut req = get_req("/", "100.64.0.9:1");
        req.headers_mut()
            .insert(header::IF_NONE_MATCH, etag.parse().unwrap());
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn asset_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let res = app(&dir, true)
            .oneshot(get_req("/../db.json", "100.64.0.9:1"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
