//! Embedded OCI container registry.
//!
//! Speaks enough of the distribution API for `docker push` from a
//! workstation: blob existence checks, chunked uploads, and manifests.
//! Manifest writes with the `latest` or `run` tag hand the service to the
//! installer; the manifest itself persists whether or not the triggered
//! deploy succeeds.

mod blobs;

pub use blobs::BlobStore;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path as UrlPath, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use dashmap::DashMap;
use futures::StreamExt;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::daemon::Daemon;
use crate::installer::{InstallRequest, Installer};
use crate::store::{ArtifactName, ImageManifest, ImageRepo, REF_RUN, REF_STAGED};

/// Canonical (virtual) host name images are known by on this host.
pub const INTERNAL_REGISTRY_HOST: &str = "catchit.dev";

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("static regex"));

#[derive(Clone)]
pub struct Registry {
    daemon: Arc<Daemon>,
    blobs: BlobStore,
    manifest_dir: PathBuf,
    uploads_dir: PathBuf,
    uploads: Arc<DashMap<String, PathBuf>>,
}

impl Registry {
    pub fn new(daemon: Arc<Daemon>) -> Result<Registry> {
        let root = daemon.paths.registry_root();
        let manifest_dir = root.join("manifests").join("sha256");
        let uploads_dir = root.join("uploads");
        std::fs::create_dir_all(&manifest_dir).context("creating manifest directory")?;
        std::fs::create_dir_all(&uploads_dir).context("creating uploads directory")?;
        let blobs = BlobStore::new(root.join("blobs"))?;
        Ok(Registry {
            daemon,
            blobs,
            manifest_dir,
            uploads_dir,
            uploads: Arc::new(DashMap::new()),
        })
    }

    /// Router for the `/v2` tree, with the registry authorization rule
    /// applied to every request.
    pub fn router(self) -> Router {
        Router::new()
            .route("/v2/", get(api_version).head(api_version))
            .route(
                "/v2/{svc}/{container}/blobs/{digest}",
                get(get_blob).head(head_blob),
            )
            .route(
                "/v2/{svc}/{container}/blobs/uploads/",
                post(start_upload),
            )
            .route(
                "/v2/{svc}/{container}/blobs/uploads/{session}",
                put(finish_upload).patch(patch_upload),
            )
            .route(
                "/v2/{svc}/{container}/manifests/{reference}",
                get(get_manifest).head(get_manifest).put(put_manifest),
            )
            .layer(middleware::from_fn_with_state(self.clone(), guard))
            .with_state(self)
    }

    fn manifest_path(&self, hash: &str) -> PathBuf {
        self.manifest_dir.join(hash)
    }

    fn store_manifest(&self, content: &[u8]) -> Result<String> {
        use sha2::Digest;
        let hash = hex::encode(sha2::Sha256::digest(content));
        let path = self.manifest_path(&hash);
        if !path.exists() {
            std::fs::write(&path, content)
                .with_context(|| format!("writing manifest {hash}"))?;
        }
        Ok(hash)
    }

    fn read_manifest(&self, hash: &str) -> Result<Vec<u8>> {
        std::fs::read(self.manifest_path(hash)).with_context(|| format!("reading manifest {hash}"))
    }
}

/// References under which a pushed tag is stored, plus whether the write
/// commits a deploy.
///
/// `latest` is accepted but stored as `staged`; `run` is stored as both
/// `staged` and `run` and deploys; anything else is stored verbatim.
pub fn tag_references(tag: &str) -> (Vec<&'static str>, bool) {
    match tag {
        "run" => (vec![REF_RUN, REF_STAGED], true),
        "latest" => (vec![REF_STAGED], false),
        _ => (Vec::new(), false),
    }
}

/// Validate a pushed repository name: exactly `<service>/<container>`.
pub fn parse_repo(svc: &str, container: &str) -> Option<String> {
    if !crate::valid_service_name(svc) || !TAG_RE.is_match(container) || container.contains('/') {
        return None;
    }
    Some(format!("{svc}/{container}"))
}

/// The deploy-triggering callback's validation: bad repo names and tags
/// that are neither `latest` nor `run` (including digest pushes) never
/// trigger anything.
pub fn deployable_tag(reference: &str) -> bool {
    reference == "latest" || reference == "run"
}

/// Registry authorization: loopback callers get read-only access; everyone
/// else must pass the peer identity check.
async fn guard(State(reg): State<Registry>, req: Request, next: Next) -> Response {
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>().copied()
    else {
        return (StatusCode::UNAUTHORIZED, "unknown caller\n").into_response();
    };
    if addr.ip().is_loopback() {
        if !matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                "registry is read-only from this host\n",
            )
                .into_response();
        }
    } else if let Err(err) = reg.daemon.authorizer.authorize(addr).await {
        warn!("registry caller {addr} rejected: {err:#}");
        return (StatusCode::UNAUTHORIZED, "unauthorized connection\n").into_response();
    }
    next.run(req).await
}

async fn api_version() -> Response {
    ([(header::CONTENT_TYPE, "application/json")], "{}").into_response()
}

async fn head_blob(
    State(reg): State<Registry>,
    UrlPath((svc, container, digest)): UrlPath<(String, String, String)>,
) -> Response {
    if parse_repo(&svc, &container).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match reg.blobs.size(&digest) {
        Ok(size) => (
            [
                (header::CONTENT_LENGTH.as_str(), size.to_string()),
                ("Docker-Content-Digest", digest),
            ],
            StatusCode::OK,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_blob(
    State(reg): State<Registry>,
    UrlPath((svc, container, digest)): UrlPath<(String, String, String)>,
) -> Response {
    if parse_repo(&svc, &container).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let file = match reg.blobs.open(&digest) {
        Ok(f) => tokio::fs::File::from_std(f),
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let stream = tokio_util::io::ReaderStream::new(file);
    (
        [("Docker-Content-Digest", digest)],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    digest: Option<String>,
}

async fn start_upload(
    State(reg): State<Registry>,
    UrlPath((svc, container)): UrlPath<(String, String)>,
    Query(query): Query<UploadQuery>,
    req: Request,
) -> Response {
    let Some(repo) = parse_repo(&svc, &container) else {
        return (
            StatusCode::BAD_REQUEST,
            "containers should follow the 'service/container' format\n",
        )
            .into_response();
    };
    let session = Uuid::new_v4().to_string();
    let staged = reg.uploads_dir.join(&session);
    if let Err(err) = write_body(&staged, req, false).await {
        warn!("starting upload for {repo}: {err:#}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // A monolithic POST carries the digest up front.
    if let Some(digest) = query.digest {
        return match reg.blobs.put_file(&digest, &staged) {
            Ok(()) => (
                StatusCode::CREATED,
                [
                    (header::LOCATION.as_str(), format!("/v2/{repo}/blobs/{digest}")),
                    ("Docker-Content-Digest", digest),
                ],
            )
                .into_response(),
            Err(err) => (StatusCode::BAD_REQUEST, format!("{err:#}\n")).into_response(),
        };
    }

    reg.uploads.insert(session.clone(), staged);
    (
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION.as_str(),
                format!("/v2/{repo}/blobs/uploads/{session}"),
            ),
            (header::RANGE.as_str(), "0-0".to_string()),
            ("Docker-Upload-UUID", session),
        ],
    )
        .into_response()
}

async fn patch_upload(
    State(reg): State<Registry>,
    UrlPath((svc, container, session)): UrlPath<(String, String, String)>,
    req: Request,
) -> Response {
    let Some(repo) = parse_repo(&svc, &container) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(staged) = reg.uploads.get(&session).map(|p| p.clone()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match write_body(&staged, req, true).await {
        Ok(total) => (
            StatusCode::ACCEPTED,
            [
                (
                    header::LOCATION.as_str(),
                    format!("/v2/{repo}/blobs/uploads/{session}"),
                ),
                (
                    header::RANGE.as_str(),
                    format!("0-{}", total.saturating_sub(1)),
                ),
                ("Docker-Upload-UUID", session),
            ],
        )
            .into_response(),
        Err(err) => {
            warn!("upload chunk for {repo}: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn finish_upload(
    State(reg): State<Registry>,
    UrlPath((svc, container, session)): UrlPath<(String, String, String)>,
    Query(query): Query<UploadQuery>,
    req: Request,
) -> Response {
    let Some(repo) = parse_repo(&svc, &container) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(digest) = query.digest else {
        return (StatusCode::BAD_REQUEST, "missing digest\n").into_response();
    };
    let Some((_, staged)) = reg.uploads.remove(&session) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Err(err) = write_body(&staged, req, true).await {
        warn!("final upload chunk for {repo}: {err:#}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match reg.blobs.put_file(&digest, &staged) {
        Ok(()) => (
            StatusCode::CREATED,
            [
                (header::LOCATION.as_str(), format!("/v2/{repo}/blobs/{digest}")),
                ("Docker-Content-Digest", digest),
            ],
        )
            .into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, format!("{err:#}\n")).into_response(),
    }
}

async fn get_manifest(
    State(reg): State<Registry>,
    UrlPath((svc, container, reference)): UrlPath<(String, String, String)>,
) -> Response {
    let Some(repo) = parse_repo(&svc, &container) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let data = reg.daemon.store.get();
    let Some(image) = data.images.get(&repo) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let found = if let Some(hash) = reference.strip_prefix("sha256:") {
        image
            .refs
            .values()
            .find(|m| m.blob_hash == hash)
            .map(|m| (m.content_type.clone(), m.blob_hash.clone()))
    } else {
        image
            .refs
            .get(&reference)
            .map(|m| (m.content_type.clone(), m.blob_hash.clone()))
    };
    let Some((content_type, hash)) = found else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match reg.read_manifest(&hash) {
        Ok(blob) => (
            [
                (header::CONTENT_TYPE.as_str(), content_type),
                ("Docker-Content-Digest", format!("sha256:{hash}")),
            ],
            blob,
        )
            .into_response(),
        Err(err) => {
            warn!("manifest {hash} for {repo}: {err:#}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn put_manifest(
    State(reg): State<Registry>,
    UrlPath((svc, container, reference)): UrlPath<(String, String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(repo) = parse_repo(&svc, &container) else {
        return (
            StatusCode::BAD_REQUEST,
            "containers should follow the 'service/container' format\n",
        )
            .into_response();
    };
    if !deployable_tag(&reference) {
        // Digest pushes and arbitrary tags are accepted into the index but
        // never deploy anything. A digest reference is not a tag at all.
        if reference.starts_with("sha256:") {
            return (StatusCode::BAD_REQUEST, "invalid tag\n").into_response();
        }
        if !TAG_RE.is_match(&reference) {
            return (StatusCode::BAD_REQUEST, "invalid tag\n").into_response();
        }
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.oci.image.manifest.v1+json")
        .to_string();

    let hash = match reg.store_manifest(&body) {
        Ok(hash) => hash,
        Err(err) => {
            warn!("storing manifest for {repo}: {err:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (references, should_install) = tag_references(&reference);
    let stored_refs: Vec<String> = if references.is_empty() {
        vec![reference.clone()]
    } else {
        references.iter().map(|r| r.to_string()).collect()
    };
    let manifest = ImageManifest {
        content_type,
        blob_hash: hash.clone(),
    };
    let update = reg.daemon.store.mutate(|data| {
        let image = data.images.entry(repo.clone()).or_insert_with(ImageRepo::default);
        for r in &stored_refs {
            image.refs.insert(r.clone(), manifest.clone());
        }
        Ok(())
    });
    if let Err(err) = update {
        warn!("recording manifest for {repo}: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if deployable_tag(&reference) {
        // The deploy runs after the OCI response; its failure does not undo
        // the manifest write.
        let tracker = reg.daemon.tracker.clone();
        let reg = reg.clone();
        let repo = repo.clone();
        let service = svc.clone();
        tracker.spawn(async move {
            if let Err(err) = deploy_image(&reg, &service, &repo, should_install).await {
                warn!("deploy of {repo} failed: {err:#}");
            }
        });
    }

    (
        StatusCode::CREATED,
        [("Docker-Content-Digest", format!("sha256:{hash}"))],
    )
        .into_response()
}

/// Hand the pushed image to the installer: carry the previous generation's
/// compose file forward, or synthesize the default one around the canonical
/// image reference.
async fn deploy_image(reg: &Registry, service: &str, repo: &str, run: bool) -> Result<()> {
    info!("image received for {repo}; {} install", if run { "commit" } else { "staged" });
    let compose = match previous_compose(reg, service) {
        Some(content) => content,
        None => crate::render::render_default_compose(
            service,
            &format!("{INTERNAL_REGISTRY_HOST}/{repo}:latest"),
            &reg.daemon.paths.service_data_dir(service),
        ),
    };

    let installer = Installer::new(reg.daemon.clone(), crate::runner::quiet_commands());
    let req = InstallRequest {
        stage_only: !run,
        restart: run,
        ..InstallRequest::new(service)
    };
    installer
        .install_stream(&req, &mut compose.as_bytes(), None)
        .await?;
    Ok(())
}

fn previous_compose(reg: &Registry, service: &str) -> Option<String> {
    let svc = reg.daemon.store.get().services.get(service).cloned()?;
    let path = svc.artifacts.latest(ArtifactName::ComposeFile)?;
    match std::fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(err) => {
            warn!("reading previous compose for {service}: {err}");
            None
        }
    }
}

/// Stream a request body into `path`. Returns the resulting file length.
async fn write_body(path: &std::path::Path, req: Request, append: bool) -> Result<u64> {
    use tokio::io::AsyncWriteExt;
    let mut opts = tokio::fs::OpenOptions::new();
    opts.create(true);
    if append {
        opts.append(true);
    } else {
        opts.write(true).truncate(true);
    }
    let mut file = opts.open(path).await.context("opening upload file")?;
    let mut stream = req.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading upload body")?;
        file.write_all(&chunk).await.context("writing upload")?;
    }
    file.flush().await?;
    Ok(file.metadata().await?.len())
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

    fn registry(dir: &TempDir, allow: bool) -> Registry {
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let store = Store::open(settings.paths().db_file()).unwrap();
        let authorizer: Arc<dyn crate::authz::Authorizer> = if allow {
            Arc::new(StaticAuthorizer::allow_all())
        } else {
            Arc::new(StaticAuthorizer::deny_all())
        };
        let daemon = Daemon::new(settings, store, authorizer);
        Registry::new(daemon).unwrap()
    }

    fn request(method: &str, uri: &str, addr: &str, body: &[u8]) -> HttpRequest<Body> {
        let mut req = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_vec()))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(addr.parse().unwrap()));
        req
    }

    #[test]
    fn tag_mapping() {
        assert_eq!(tag_references("latest"), (vec![REF_STAGED], false));
        assert_eq!(tag_references("run"), (vec![REF_RUN, REF_STAGED], true));
        assert_eq!(tag_references("v1.2"), (Vec::new(), false));
    }

    #[test]
    fn repo_names_require_exactly_one_slash() {
        assert_eq!(parse_repo("myapp", "web"), Some("myapp/web".to_string()));
        assert!(parse_repo("My_App", "web").is_none());
        assert!(parse_repo("myapp", "we/b").is_none());
        assert!(parse_repo("", "web").is_none());
    }

    #[tokio::test]
    async fn loopback_writes_are_method_not_allowed() {
        let dir = TempDir::new().unwrap();
        let app = registry(&dir, true).router();
        let res = app
            .oneshot(request(
                "PUT",
                "/v2/myapp/web/manifests/latest",
                "127.0.0.1:9",
                b"{}",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn loopback_reads_are_allowed() {
        let dir = TempDir::new().unwrap();
        let app = registry(&dir, false).router();
        let res = app
            .oneshot(request("GET", "/v2/", "127.0.0.1:9", b""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unauthorized_peers_get_401_regardless_of_method() {
        let dir = TempDir::new().unwrap();
        let app = registry(&dir, false).router();
        for method in ["GET", "PUT"] {
            let res = app
                .clone()
                .oneshot(request(
                    method,
                    "/v2/myapp/web/manifests/latest",
                    "100.64.1.2:9",
                    b"{}",
                ))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{method}");
        }
    }

    #[tokio::test]
    async fn latest_push_stores_staged_ref_and_stages_service() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, true);
        let daemon = reg.daemon.clone();
        let app = reg.router();
        let res = app
            .oneshot(request(
                "PUT",
                "/v2/myapp/web/manifests/latest",
                "100.64.1.2:9",
                br#"{"schemaVersion": 2}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let data = daemon.store.get();
        let image = data.images.get("myapp/web").unwrap();
        assert_eq!(image.refs.len(), 1);
        assert!(image.refs.contains_key(REF_STAGED));

        // The triggered install runs asynchronously; wait for it.
        daemon.tracker.close();
        daemon.tracker.wait().await;
        let svc = daemon.store.service("myapp").unwrap();
        assert_eq!(svc.latest_generation, 1);
        assert_eq!(svc.generation, 0);
        let compose = svc.artifacts.staged(ArtifactName::ComposeFile).unwrap();
        let content = std::fs::read_to_string(compose).unwrap();
        assert!(content.contains("image: catchit.dev/myapp/web:latest"));
        assert!(content.contains("restart: unless-stopped"));
    }

    #[tokio::test]
    async fn run_push_stores_both_refs() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, true);
        let daemon = reg.daemon.clone();
        let app = reg.router();
        let res = app
            .oneshot(request(
                "PUT",
                "/v2/myapp/web/manifests/run",
                "100.64.1.2:9",
                br#"{"schemaVersion": 2}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let image = daemon.store.get().images.get("myapp/web").cloned().unwrap();
        assert!(image.refs.contains_key(REF_RUN));
        assert!(image.refs.contains_key(REF_STAGED));
        assert_eq!(image.refs[REF_RUN].blob_hash, image.refs[REF_STAGED].blob_hash);
    }

    #[tokio::test]
    async fn bad_repo_shape_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, true);
        let daemon = reg.daemon.clone();
        let app = reg.router();
        let before = daemon.store.get();
        let res = app
            .oneshot(request(
                "PUT",
                "/v2/My_App/web/manifests/latest",
                "100.64.1.2:9",
                b"{}",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(daemon.store.get(), before);
    }

    #[tokio::test]
    async fn blob_upload_round_trip() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, true);
        let app = reg.router();
        use sha2::Digest;
        let content = b"layer-bytes";
        let digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(content)));

        let res = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/v2/myapp/web/blobs/uploads/?digest={digest}"),
                "100.64.1.2:9",
                content,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = app
            .clone()
            .oneshot(request(
                "HEAD",
                &format!("/v2/myapp/web/blobs/{digest}"),
                "127.0.0.1:9",
                b"",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("Docker-Content-Digest").unwrap(),
            digest.as_str()
        );
    }
}
