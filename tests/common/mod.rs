// An in-memory registry speaking enough of the V2 protocol for the client
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Extension, Router,
};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use jib_registry::{ClientConfig, EndpointConfig, RegistryClient};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

pub const DIGEST_HEADER: &str = "Docker-Content-Digest";

pub fn sha256(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// A request as the registry saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    /// Whether the request arrived over TLS
    pub over_tls: bool,
    pub method: Method,
    /// Path and query
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// How the registry misbehaves or protects itself
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// `WWW-Authenticate` value sent with a 401 from `/v2/`; `{realm}` is
    /// replaced with the URL of the token realm
    pub challenge: Option<String>,
    /// `Authorization` value required on repository requests
    pub required_authorization: Option<String>,
    /// Body of the token realm
    pub token_response: Option<String>,
    /// Serve blobs with their last byte flipped
    pub corrupt_blobs: bool,
    /// Advertise this digest instead of the real one for manifests
    pub manifest_digest_override: Option<String>,
    /// Refuse manifests with this status and error code
    pub reject_manifests: Option<(StatusCode, &'static str)>,
    /// Answer upload starts with this status and no `Location`
    pub upload_start_status: Option<StatusCode>,
    /// Point uploads started over TLS at an address refusing connections
    pub tls_uploads_unreachable: bool,
}

/// How a connection reached the registry
#[derive(Debug, Clone, Copy)]
struct Connection {
    tls: bool,
}

#[derive(Default)]
struct Storage {
    blobs: HashMap<(String, String), Vec<u8>>,
    manifests: HashMap<(String, String), (String, Vec<u8>)>,
    uploads: HashMap<u32, (String, Vec<u8>)>,
    next_upload: u32,
    requests: Vec<Recorded>,
}

struct Shared {
    address: SocketAddr,
    /// Nothing listens here
    unreachable: SocketAddr,
    behavior: Behavior,
    storage: Mutex<Storage>,
}

pub struct MockRegistry {
    handle: JoinHandle<()>,
    shared: Arc<Shared>,
    pub server: String,
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        self.handle.abort()
    }
}

impl MockRegistry {
    pub async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub async fn with_behavior(behavior: Behavior) -> Self {
        let (listener, shared) = bind(behavior).await;
        let app = router(&shared).layer(Extension(Connection { tls: false }));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self::running(handle, shared)
    }

    /// A registry answering both TLS, with a self-signed certificate, and
    /// plain HTTP on the same port
    pub async fn with_tls(behavior: Behavior) -> Self {
        let (listener, shared) = bind(behavior).await;
        let app = router(&shared);
        let acceptor = self_signed_acceptor();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                tokio::spawn(serve_sniffed(stream, acceptor.clone(), app.clone()));
            }
        });
        Self::running(handle, shared)
    }

    fn running(handle: JoinHandle<()>, shared: Arc<Shared>) -> Self {
        let server = shared.address.to_string();
        Self {
            handle,
            shared,
            server,
        }
    }

    /// The URL of the token realm served next to the registry
    pub fn realm(&self) -> String {
        format!("http://{}/token", self.shared.address)
    }

    pub fn endpoint(&self, image: &str) -> EndpointConfig {
        EndpointConfig::new(self.server.clone(), image).unwrap()
    }

    /// A client reaching the registry over plain HTTP
    pub fn client(&self, image: &str) -> RegistryClient {
        RegistryClient::new(self.endpoint(image), plain_http_config()).unwrap()
    }

    pub fn put_blob(&self, repository: &str, content: &[u8]) -> String {
        let digest = sha256(content);
        self.storage()
            .blobs
            .insert((repository.to_string(), digest.clone()), content.to_vec());
        digest
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.storage()
            .blobs
            .contains_key(&(repository.to_string(), digest.to_string()))
    }

    pub fn put_manifest(&self, repository: &str, reference: &str, media_type: &str, body: &[u8]) {
        self.storage().manifests.insert(
            (repository.to_string(), reference.to_string()),
            (media_type.to_string(), body.to_vec()),
        );
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.storage().requests.clone()
    }

    /// Requests other than the `/v2/` probe and the token realm
    pub fn repository_requests(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.target != "/v2/" && !r.target.starts_with("/token"))
            .collect()
    }

    fn storage(&self) -> std::sync::MutexGuard<'_, Storage> {
        self.shared.storage.lock().unwrap()
    }
}

async fn bind(behavior: Behavior) -> (TcpListener, Arc<Shared>) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let unreachable = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .unwrap()
        .local_addr()
        .unwrap();
    let shared = Arc::new(Shared {
        address: listener.local_addr().unwrap(),
        unreachable,
        behavior,
        storage: Mutex::new(Storage::default()),
    });
    (listener, shared)
}

fn router(shared: &Arc<Shared>) -> Router {
    Router::new().fallback(handle).with_state(shared.clone())
}

fn self_signed_acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Serves one connection, over TLS when it opens with a handshake record
async fn serve_sniffed(stream: TcpStream, acceptor: TlsAcceptor, app: Router) {
    let mut first = [0u8; 1];
    if !matches!(stream.peek(&mut first).await, Ok(1)) {
        return;
    }
    if first[0] == 0x16 {
        // a client refusing the certificate aborts the handshake
        let Ok(stream) = acceptor.accept(stream).await else {
            return;
        };
        serve_connection(stream, app.layer(Extension(Connection { tls: true }))).await
    } else {
        serve_connection(stream, app.layer(Extension(Connection { tls: false }))).await
    }
}

async fn serve_connection<S>(stream: S, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app))
        .await;
}

pub fn plain_http_config() -> ClientConfig {
    ClientConfig {
        allow_insecure_registries: true,
        send_credentials_over_http: true,
        ..Default::default()
    }
}

fn error_envelope(status: StatusCode, code: &str) -> Response {
    let body = json!({"errors": [{"code": code, "message": code.to_lowercase()}]});
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn with_digest(mut response: Response, digest: &str) -> Response {
    response
        .headers_mut()
        .insert(DIGEST_HEADER, HeaderValue::from_str(digest).unwrap());
    response
}

async fn handle(
    State(shared): State<Arc<Shared>>,
    Extension(connection): Extension<Connection>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_default();
    shared.storage.lock().unwrap().requests.push(Recorded {
        over_tls: connection.tls,
        method: method.clone(),
        target,
        headers: headers.clone(),
        body: body.clone(),
    });

    let path = uri.path();
    let query: HashMap<String, String> = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    let behavior = &shared.behavior;

    if path == "/token" {
        return match &behavior.token_response {
            Some(token) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                token.clone(),
            )
                .into_response(),
            None => StatusCode::UNAUTHORIZED.into_response(),
        };
    }

    if path == "/v2/" {
        return match &behavior.challenge {
            Some(challenge) => (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    challenge.replace("{realm}", &format!("http://{}/token", shared.address)),
                )],
            )
                .into_response(),
            None => StatusCode::OK.into_response(),
        };
    }

    if let Some(required) = &behavior.required_authorization {
        let sent = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if sent != Some(required.as_str()) {
            return error_envelope(StatusCode::UNAUTHORIZED, "UNAUTHORIZED");
        }
    }

    if let Some(id) = path.strip_prefix("/upload-sessions/") {
        let Ok(id) = id.parse::<u32>() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        return upload_step(&shared, method, id, &query, body);
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(repository) = rest.strip_suffix("/blobs/uploads/") {
        return start_upload(&shared, connection, method, repository, &query);
    }
    if let Some((repository, reference)) = rest.rsplit_once("/manifests/") {
        return manifest(&shared, method, repository, reference, &headers, body);
    }
    if let Some((repository, digest)) = rest.rsplit_once("/blobs/") {
        return blob(&shared, method, repository, digest);
    }
    StatusCode::NOT_FOUND.into_response()
}

fn manifest(
    shared: &Shared,
    method: Method,
    repository: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let behavior = &shared.behavior;
    let mut storage = shared.storage.lock().unwrap();
    match method {
        Method::PUT => {
            if let Some((status, code)) = behavior.reject_manifests {
                return error_envelope(status, code);
            }
            let media_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let digest = sha256(&body);
            let stored = (media_type, body.to_vec());
            storage
                .manifests
                .insert((repository.to_string(), digest.clone()), stored.clone());
            storage
                .manifests
                .insert((repository.to_string(), reference.to_string()), stored);
            with_digest(StatusCode::CREATED.into_response(), &digest)
        }
        Method::GET => {
            let key = (repository.to_string(), reference.to_string());
            let Some((media_type, content)) = storage.manifests.get(&key).cloned() else {
                return error_envelope(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN");
            };
            let digest = behavior
                .manifest_digest_override
                .clone()
                .unwrap_or_else(|| sha256(&content));
            let response = ([(header::CONTENT_TYPE, media_type)], content).into_response();
            with_digest(response, &digest)
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn blob(shared: &Shared, method: Method, repository: &str, digest: &str) -> Response {
    let storage = shared.storage.lock().unwrap();
    let key = (repository.to_string(), digest.to_string());
    let Some(mut content) = storage.blobs.get(&key).cloned() else {
        return match method {
            Method::HEAD => StatusCode::NOT_FOUND.into_response(),
            _ => error_envelope(StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
        };
    };
    if shared.behavior.corrupt_blobs {
        if let Some(last) = content.last_mut() {
            *last ^= 0xff;
        }
    }
    let length = content.len().to_string();
    let response = match method {
        Method::HEAD => ([(header::CONTENT_LENGTH, length)], content).into_response(),
        Method::GET => content.into_response(),
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    with_digest(response, digest)
}

fn start_upload(
    shared: &Shared,
    connection: Connection,
    method: Method,
    repository: &str,
    query: &HashMap<String, String>,
) -> Response {
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if let Some(status) = shared.behavior.upload_start_status {
        return status.into_response();
    }
    let mut storage = shared.storage.lock().unwrap();
    if let (Some(digest), Some(from)) = (query.get("mount"), query.get("from")) {
        let source = (from.clone(), digest.clone());
        if let Some(content) = storage.blobs.get(&source).cloned() {
            storage
                .blobs
                .insert((repository.to_string(), digest.clone()), content);
            return StatusCode::CREATED.into_response();
        }
    }
    let id = storage.next_upload;
    storage.next_upload += 1;
    storage
        .uploads
        .insert(id, (repository.to_string(), Vec::new()));
    let address = if connection.tls && shared.behavior.tls_uploads_unreachable {
        shared.unreachable
    } else {
        shared.address
    };
    // absolute, on a path outside of /v2/
    let location = format!("http://{address}/upload-sessions/{id}?_state=started");
    (StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response()
}

fn upload_step(
    shared: &Shared,
    method: Method,
    id: u32,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Response {
    let mut storage = shared.storage.lock().unwrap();
    let state = query.get("_state").map(String::as_str);
    match (method, state) {
        (Method::PATCH, Some("started")) => {
            let Some((_, content)) = storage.uploads.get_mut(&id) else {
                return error_envelope(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN");
            };
            content.extend_from_slice(&body);
            // relative, resolved against the PATCH URL
            let location = format!("/upload-sessions/{id}?_state=written");
            (StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response()
        }
        (Method::PUT, Some("written")) => {
            let Some((repository, content)) = storage.uploads.remove(&id) else {
                return error_envelope(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN");
            };
            let Some(digest) = query.get("digest") else {
                return error_envelope(StatusCode::BAD_REQUEST, "DIGEST_INVALID");
            };
            if &sha256(&content) != digest {
                return error_envelope(StatusCode::BAD_REQUEST, "DIGEST_INVALID");
            }
            storage.blobs.insert((repository, digest.clone()), content);
            with_digest(StatusCode::CREATED.into_response(), digest)
        }
        _ => error_envelope(StatusCode::BAD_REQUEST, "BLOB_UPLOAD_INVALID"),
    }
}
