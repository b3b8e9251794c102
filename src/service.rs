//! HTTP command client for the background service, over its Unix socket or
//! TCP loopback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{Endpoint, ServiceConfig};
use crate::error::{AppError, Result};
use crate::models::{
    ConnectRequest, LiveStatus, ProfileIdBody, RawLiveStatus, ServiceState, SystemProfile,
    TokenRequest, TokenResponse,
};

// ── Auth token ────────────────────────────────────────────────────────────────

/// Service auth token, re-read from disk by a background poller. Readers
/// always see the latest value; `subscribe` reports rotation.
#[derive(Debug, Clone)]
pub struct AuthToken {
    value: Arc<watch::Sender<String>>,
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::fixed(String::new())
    }
}

impl AuthToken {
    pub fn fixed(token: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(token.into());
        Self { value: Arc::new(tx) }
    }

    pub fn get(&self) -> String {
        self.value.borrow().clone()
    }

    pub(crate) fn set(&self, token: String) {
        self.value.send_replace(token);
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.value.subscribe()
    }

    /// Poll `path` every `poll` until a token appears, then every `refresh`
    /// to pick up rotation.
    pub fn spawn_poller(&self, path: PathBuf, poll: Duration, refresh: Duration) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            loop {
                match tokio::fs::read_to_string(&path).await {
                    Ok(data) => {
                        let data = data.trim().to_string();
                        if !data.is_empty() && data != token.get() {
                            debug!(path = %path.display(), "Service auth token loaded");
                            token.set(data);
                        }
                    }
                    Err(e) => debug!(path = %path.display(), "Service auth token unavailable: {}", e),
                }
                let wait = if token.get().is_empty() { poll } else { refresh };
                tokio::time::sleep(wait).await;
            }
        })
    }

    /// Wait until the poller has found a token.
    pub async fn ready(&self, poll: Duration, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        while self.get().is_empty() {
            if start.elapsed() >= timeout {
                return Err(AppError::Timeout("Service auth token not available".into()));
            }
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }
}

// ── Service API ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait ServiceApi: Send + Sync {
    /// `GET /profile`: live status of every active profile, keyed by id.
    async fn profiles_status(&self) -> Result<HashMap<String, LiveStatus>>;
    async fn connect(&self, req: &ConnectRequest) -> Result<()>;
    async fn disconnect(&self, profile_id: &str) -> Result<()>;

    async fn system_profiles(&self) -> Result<Vec<SystemProfile>>;
    async fn put_system_profile(&self, sprfl: &SystemProfile) -> Result<()>;
    async fn delete_system_profile(&self, profile_id: &str) -> Result<()>;
    async fn system_profile_log(&self, profile_id: &str) -> Result<String>;
    async fn clear_system_profile_log(&self, profile_id: &str) -> Result<()>;

    async fn service_log(&self) -> Result<String>;
    async fn clear_service_log(&self) -> Result<()>;

    /// `PUT /token`, returns whether the stored device token is valid.
    async fn token_update(&self, req: &TokenRequest<'_>) -> Result<bool>;
    async fn token_delete(&self, profile_id: &str) -> Result<()>;

    async fn ping(&self) -> Result<bool>;
    async fn wakeup(&self) -> Result<bool>;
    async fn state(&self) -> Result<ServiceState>;
    async fn restart(&self) -> Result<()>;
}

enum Transport {
    Tcp { http: reqwest::Client, host: String },
    Unix { socket: PathBuf, timeout: Duration },
}

pub struct ServiceClient {
    transport: Transport,
    token: AuthToken,
}

impl ServiceClient {
    pub fn new(cfg: &ServiceConfig, token: AuthToken) -> Result<Self> {
        let transport = match cfg.endpoint() {
            Endpoint::Tcp(host) => {
                let http = reqwest::Client::builder()
                    .timeout(cfg.request_timeout())
                    .build()?;
                Transport::Tcp { http, host }
            }
            Endpoint::Unix(socket) => Transport::Unix { socket, timeout: cfg.request_timeout() },
        };
        Ok(Self { transport, token })
    }

    /// One round trip, returning status and body.
    async fn exchange(&self, method: Method, path: &str, body: Option<String>) -> Result<(u16, String)> {
        let headers = [("User-Agent", "pritunl".to_string()), ("Auth-Token", self.token.get())];
        match &self.transport {
            Transport::Tcp { http, host } => {
                let mut req = http.request(method, format!("{}{}", host, path));
                for (name, value) in &headers {
                    req = req.header(*name, value.as_str());
                }
                if let Some(body) = body {
                    req = req.header("Content-Type", "application/json").body(body);
                }
                let resp = req.send().await?;
                let status = resp.status().as_u16();
                Ok((status, resp.text().await?))
            }
            Transport::Unix { socket, timeout } => {
                tokio::time::timeout(*timeout, unix_exchange(socket, method, path, &headers, body))
                    .await
                    .map_err(|_| AppError::Timeout(format!("Service request {}", path)))?
            }
        }
    }

    /// Send and return the body of a 2xx response; anything else becomes a
    /// request error labelled `what`.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        what: &str,
    ) -> Result<String> {
        let body = body.map(serde_json::to_string).transpose()?;
        let (status, text) = self.exchange(method, path, body).await.map_err(|e| AppError::Request {
            msg: format!("Service: {}", what),
            error_msg: Some(e.to_string()),
        })?;
        if !(200..300).contains(&status) {
            return Err(AppError::from_response(format!("Service: {}", what), status, &text));
        }
        Ok(text)
    }

    async fn send_empty(&self, method: Method, path: &str, what: &str) -> Result<String> {
        self.send::<()>(method, path, None, what).await
    }
}

#[cfg(unix)]
async fn unix_exchange(
    socket: &Path,
    method: Method,
    path: &str,
    headers: &[(&'static str, String)],
    body: Option<String>,
) -> Result<(u16, String)> {
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use hyper_util::rt::TokioIo;

    let stream = tokio::net::UnixStream::connect(socket).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(socket_error)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Service socket connection closed: {}", e);
        }
    });

    let mut req = hyper::Request::builder()
        .method(method)
        .uri(path)
        .header("Host", "localhost");
    for (name, value) in headers {
        req = req.header(*name, value.as_str());
    }
    if body.is_some() {
        req = req.header("Content-Type", "application/json");
    }
    let req = req
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| AppError::Process(format!("Service request {}: {}", path, e)))?;

    let resp = sender.send_request(req).await.map_err(socket_error)?;
    let status = resp.status().as_u16();
    let data = resp.into_body().collect().await.map_err(socket_error)?.to_bytes();
    Ok((status, String::from_utf8_lossy(&data).into_owned()))
}

#[cfg(not(unix))]
async fn unix_exchange(
    socket: &Path,
    _method: Method,
    _path: &str,
    _headers: &[(&'static str, String)],
    _body: Option<String>,
) -> Result<(u16, String)> {
    Err(AppError::Process(format!("Unix socket {} not supported here", socket.display())))
}

#[cfg(unix)]
fn socket_error(e: hyper::Error) -> AppError {
    AppError::request(format!("Service socket: {}", e))
}

#[async_trait]
impl ServiceApi for ServiceClient {
    async fn profiles_status(&self) -> Result<HashMap<String, LiveStatus>> {
        let body = self.send_empty(Method::GET, "/profile", "Status error").await?;
        let raw: HashMap<String, RawLiveStatus> = serde_json::from_str(&body)
            .map_err(|e| AppError::Parse(format!("Profile status: {}", e)))?;
        Ok(raw.into_iter().map(|(id, s)| (id, LiveStatus::from_raw(s))).collect())
    }

    async fn connect(&self, req: &ConnectRequest) -> Result<()> {
        self.send(Method::POST, "/profile", Some(req), "Connect failed").await?;
        Ok(())
    }

    async fn disconnect(&self, profile_id: &str) -> Result<()> {
        let body = ProfileIdBody { id: profile_id };
        self.send(Method::DELETE, "/profile", Some(&body), "Disconnect failed").await?;
        Ok(())
    }

    async fn system_profiles(&self) -> Result<Vec<SystemProfile>> {
        let body = self.send_empty(Method::GET, "/sprofile", "System profiles error").await?;
        let prfls: Option<Vec<SystemProfile>> = serde_json::from_str(&body)
            .map_err(|e| AppError::Parse(format!("System profiles: {}", e)))?;
        let mut prfls = prfls.unwrap_or_default();
        for p in &mut prfls {
            p.profile.system = true;
        }
        Ok(prfls)
    }

    async fn put_system_profile(&self, sprfl: &SystemProfile) -> Result<()> {
        self.send(Method::PUT, "/sprofile", Some(sprfl), "System profile save failed").await?;
        Ok(())
    }

    async fn delete_system_profile(&self, profile_id: &str) -> Result<()> {
        let body = ProfileIdBody { id: profile_id };
        self.send(Method::DELETE, "/sprofile", Some(&body), "System profile delete failed").await?;
        Ok(())
    }

    async fn system_profile_log(&self, profile_id: &str) -> Result<String> {
        let path = format!("/sprofile/{}/log", profile_id);
        self.send_empty(Method::GET, &path, "Profile log error").await
    }

    async fn clear_system_profile_log(&self, profile_id: &str) -> Result<()> {
        let path = format!("/sprofile/{}/log", profile_id);
        self.send_empty(Method::DELETE, &path, "Profile log clear failed").await?;
        Ok(())
    }

    async fn service_log(&self) -> Result<String> {
        self.send_empty(Method::GET, "/log/service", "Service log error").await
    }

    async fn clear_service_log(&self) -> Result<()> {
        self.send_empty(Method::DELETE, "/log/service", "Service log clear failed").await?;
        Ok(())
    }

    async fn token_update(&self, req: &TokenRequest<'_>) -> Result<bool> {
        let body = self.send(Method::PUT, "/token", Some(req), "Token update failed").await?;
        let resp: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Parse(format!("Token response: {}", e)))?;
        Ok(resp.valid)
    }

    async fn token_delete(&self, profile_id: &str) -> Result<()> {
        let body = TokenRequest {
            profile: profile_id,
            server_public_key: None,
            server_box_public_key: None,
            ttl: None,
        };
        self.send(Method::DELETE, "/token", Some(&body), "Token delete failed").await?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        match self.send_empty(Method::GET, "/ping", "Ping failed").await {
            Ok(_) => Ok(true),
            Err(AppError::Request { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn wakeup(&self) -> Result<bool> {
        let (status, _) = self
            .exchange(Method::POST, "/wakeup", None)
            .await
            .map_err(|e| AppError::Request { msg: "Service: Wakeup failed".into(), error_msg: Some(e.to_string()) })?;
        let awake = (200..300).contains(&status);
        if !awake {
            warn!(status, "Service did not answer wakeup");
        }
        Ok(awake)
    }

    async fn state(&self) -> Result<ServiceState> {
        let body = self.send_empty(Method::GET, "/state", "State error").await?;
        serde_json::from_str(&body).map_err(|e| AppError::Parse(format!("Service state: {}", e)))
    }

    async fn restart(&self) -> Result<()> {
        self.send_empty(Method::POST, "/restart", "Restart failed").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn serve_once(status: u16, body: &'static str) -> (String, std::thread::JoinHandle<(String, String, Option<String>, String)>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = std::thread::spawn(move || {
            let mut req = server.recv().unwrap();
            let method = req.method().as_str().to_string();
            let url = req.url().to_string();
            let token = req
                .headers()
                .iter()
                .find(|h| h.field.equiv("Auth-Token"))
                .map(|h| h.value.as_str().to_string());
            let mut content = String::new();
            req.as_reader().read_to_string(&mut content).unwrap();
            req.respond(tiny_http::Response::from_string(body).with_status_code(status)).unwrap();
            (method, url, token, content)
        });
        (format!("http://127.0.0.1:{}", port), handle)
    }

    fn client(host: String, token: &AuthToken) -> ServiceClient {
        let cfg = ServiceConfig { host, unix_path: None, ..Default::default() };
        ServiceClient::new(&cfg, token.clone()).unwrap()
    }

    #[tokio::test]
    async fn token_is_read_at_send_time() {
        let (host, handle) = serve_once(200, r#"{"valid":true}"#);
        let token = AuthToken::fixed("old");
        let svc = client(host, &token);
        token.set("rotated".into());

        let req = TokenRequest {
            profile: "p1",
            server_public_key: Some("a\nb".into()),
            server_box_public_key: Some("box"),
            ttl: Some(60),
        };
        assert!(svc.token_update(&req).await.unwrap());

        let (method, url, auth, body) = handle.join().unwrap();
        assert_eq!(method, "PUT");
        assert_eq!(url, "/token");
        assert_eq!(auth.as_deref(), Some("rotated"));
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["profile"], "p1");
        assert_eq!(body["ttl"], 60);
    }

    #[tokio::test]
    async fn error_body_surfaces_error_msg() {
        let (host, handle) = serve_once(400, r#"{"error":"parse_error","error_msg":"Invalid profile ID"}"#);
        let svc = client(host, &AuthToken::fixed("t"));
        let err = svc.disconnect("").await.unwrap_err();
        handle.join().unwrap();
        assert!(err.to_string().contains("Invalid profile ID"));
    }

    #[tokio::test]
    async fn profile_status_map_decodes() {
        let (host, handle) = serve_once(
            200,
            r#"{"p1":{"id":"p1","status":"connecting","timestamp":5,"server_addr":"","client_addr":""}}"#,
        );
        let svc = client(host, &AuthToken::fixed("t"));
        let status = svc.profiles_status().await.unwrap();
        handle.join().unwrap();
        assert_eq!(status["p1"].status, crate::models::ProfileStatus::Connecting);
        assert_eq!(status["p1"].timestamp, 5);
    }

    #[tokio::test]
    async fn poller_picks_up_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pritunl.auth");
        let token = AuthToken::default();
        let task = token.spawn_poller(path.clone(), Duration::from_millis(10), Duration::from_millis(20));

        assert!(token.ready(Duration::from_millis(5), Duration::from_millis(30)).await.is_err());
        std::fs::write(&path, "secret-token\n").unwrap();
        token.ready(Duration::from_millis(5), Duration::from_secs(2)).await.unwrap();
        assert_eq!(token.get(), "secret-token");

        std::fs::write(&path, "rotated-token").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(token.get(), "rotated-token");
        task.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn requests_go_over_unix_socket() {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("pritunl.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                head.push(line.trim_end().to_string());
            }
            let len = head
                .iter()
                .find_map(|h| {
                    h.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            let mut body = vec![0; len];
            reader.read_exact(&mut body).await.unwrap();

            let reply = r#"{"valid":false}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                reply.len(),
                reply
            );
            reader.get_mut().write_all(resp.as_bytes()).await.unwrap();
            (head, String::from_utf8(body).unwrap())
        });

        let cfg = ServiceConfig {
            host: "http://127.0.0.1:1".into(),
            unix_path: Some(socket),
            ..Default::default()
        };
        let svc = ServiceClient::new(&cfg, AuthToken::fixed("sock-token")).unwrap();
        let req = TokenRequest {
            profile: "p1",
            server_public_key: None,
            server_box_public_key: None,
            ttl: Some(60),
        };
        assert!(!svc.token_update(&req).await.unwrap());

        let (head, body) = server.await.unwrap();
        assert_eq!(head[0], "PUT /token HTTP/1.1");
        assert!(head.iter().any(|h| h.eq_ignore_ascii_case("auth-token: sock-token")));
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["profile"], "p1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_socket_fails_ping() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServiceConfig { unix_path: Some(dir.path().join("gone.sock")), ..Default::default() };
        let svc = ServiceClient::new(&cfg, AuthToken::fixed("t")).unwrap();
        assert!(!svc.ping().await.unwrap());
        assert!(matches!(svc.state().await, Err(AppError::Request { .. })));
    }
}
