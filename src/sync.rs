//! Signed configuration sync against a profile's sync hosts.
//!
//! Hosts are tried one at a time in the order the profile lists them. A sync
//! never fails from the caller's point of view: every outcome other than a
//! verified update resolves to [`SyncOutcome::Unchanged`].

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use tracing::{debug, info, warn};

use crate::document::ConfigDocument;
use crate::error::Result;
use crate::models::{unix_now, Profile, SyncEnvelope};

type HmacSha512 = Hmac<Sha512>;

// ── Signing ───────────────────────────────────────────────────────────────────

/// Base64 HMAC-SHA512 of `message` keyed by `secret`.
pub fn sign(secret: &str, message: &str) -> String {
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(message.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a base64 conf signature.
pub fn verify_signature(secret: &str, conf: &str, signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(conf.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Headers for a request signed with the profile's sync credentials.
///
/// The signed string is `token&timestamp&nonce&METHOD&path[&body]`.
pub fn sign_request(
    token: &str,
    secret: &str,
    method: &str,
    path: &str,
    body: Option<&str>,
    timestamp: i64,
    nonce: &str,
) -> Vec<(&'static str, String)> {
    let timestamp = timestamp.to_string();
    let method = method.to_uppercase();
    let mut parts = vec![token, timestamp.as_str(), nonce, method.as_str(), path];
    if let Some(body) = body {
        parts.push(body);
    }
    let signature = sign(secret, &parts.join("&"));

    let mut headers = vec![
        ("User-Agent", "pritunl".to_string()),
        ("Auth-Token", token.to_string()),
        ("Auth-Timestamp", timestamp),
        ("Auth-Nonce", nonce.to_string()),
        ("Auth-Signature", signature),
    ];
    if body.is_some() {
        headers.push(("Content-Type", "application/json".to_string()));
    }
    headers
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SyncTransport {
    /// Issue a GET and return the status code and body text.
    async fn get(&self, url: &str, headers: &[(&'static str, String)]) -> Result<(u16, String)>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        // sync hosts commonly run self-signed certificates
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SyncTransport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &[(&'static str, String)]) -> Result<(u16, String)> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok((status, body))
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Updated(ConfigDocument),
    Unchanged,
}

pub struct SyncClient<T> {
    transport: T,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn sync(&self, profile: &Profile, local: &ConfigDocument) -> SyncOutcome {
        let (Some(org), Some(user), Some(server), Some(hash), Some(token), Some(secret)) = (
            profile.organization_id.as_deref(),
            profile.user_id.as_deref(),
            profile.server_id.as_deref(),
            profile.sync_hash.as_deref(),
            profile.sync_token.as_deref(),
            profile.sync_secret.as_deref(),
        ) else {
            if profile.sync_hosts.is_empty() {
                debug!(profile_id = %profile.id, "Sync skipped, profile has no sync hosts");
            } else {
                warn!(
                    profile_id = %profile.id,
                    "Sync skipped, profile has sync hosts but incomplete sync credentials"
                );
            }
            return SyncOutcome::Unchanged;
        };
        let path = format!("/key/sync/{}/{}/{}/{}", org, user, server, hash);

        let mut last_status = None;
        for host in &profile.sync_hosts {
            let url = format!("{}{}", host.trim_end_matches('/'), path);
            let nonce = uuid::Uuid::new_v4().simple().to_string();
            let headers = sign_request(token, secret, "GET", &path, None, unix_now(), &nonce);

            let (status, body) = match self.transport.get(&url, &headers).await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(profile_id = %profile.id, host = %host, "Sync request failed: {}", e);
                    last_status = None;
                    continue;
                }
            };

            match status {
                200 => {
                    let env: SyncEnvelope = match serde_json::from_str(&body) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!(profile_id = %profile.id, host = %host, "Sync response unreadable: {}", e);
                            last_status = Some(status);
                            continue;
                        }
                    };
                    if env.conf.is_empty() {
                        return SyncOutcome::Unchanged;
                    }
                    match local.merge(&profile.id, &env.conf, secret, &env.signature) {
                        Ok(doc) => {
                            info!(profile_id = %profile.id, host = %host, "Profile config synced");
                            return SyncOutcome::Updated(doc);
                        }
                        Err(e) => {
                            warn!(profile_id = %profile.id, host = %host, "Sync rejected: {}", e);
                            last_status = Some(status);
                        }
                    }
                }
                480 => {
                    info!(profile_id = %profile.id, "Sync skipped, no active subscription");
                    return SyncOutcome::Unchanged;
                }
                404 => {
                    warn!(profile_id = %profile.id, "Sync failed, user not found");
                    return SyncOutcome::Unchanged;
                }
                401 => {
                    warn!(profile_id = %profile.id, "Sync failed, authentication error");
                    return SyncOutcome::Unchanged;
                }
                other => {
                    debug!(profile_id = %profile.id, host = %host, status = other, "Sync host returned error");
                    last_status = Some(other);
                }
            }
        }

        match last_status {
            Some(status) => warn!(profile_id = %profile.id, "Failed to sync config ({})", status),
            None => warn!(profile_id = %profile.id, "Failed to sync config"),
        }
        SyncOutcome::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeTransport {
        replies: Mutex<VecDeque<Result<(u16, String)>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(replies: Vec<Result<(u16, String)>>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) }
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTransport for FakeTransport {
        async fn get(&self, url: &str, _headers: &[(&'static str, String)]) -> Result<(u16, String)> {
            self.calls.lock().unwrap().push(url.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::request("no reply scripted")))
        }
    }

    fn prfl(hosts: &[&str]) -> Profile {
        Profile {
            id: "p1".into(),
            organization_id: Some("o1".into()),
            user_id: Some("u1".into()),
            server_id: Some("s1".into()),
            sync_hash: Some("h1".into()),
            sync_token: Some("tok".into()),
            sync_secret: Some("secret".into()),
            sync_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    fn local() -> ConfigDocument {
        ConfigDocument::parse("client\nsetenv UV_ID local\nremote a 1194\n")
    }

    fn signed_body(conf: &str) -> String {
        serde_json::json!({ "conf": conf, "signature": sign("secret", conf) }).to_string()
    }

    #[tokio::test]
    async fn falls_back_across_hosts_in_order() {
        let conf = "client\nsetenv UV_ID remote\nremote b 443\n";
        let fake = FakeTransport::new(vec![
            Err(AppError::request("connection refused")),
            Err(AppError::request("timed out")),
            Ok((200, signed_body(conf))),
        ]);
        let client = SyncClient::new(fake);
        let outcome = client.sync(&prfl(&["https://h1", "https://h2/", "https://h3"]), &local()).await;

        assert_eq!(
            client.transport.calls(),
            vec![
                "https://h1/key/sync/o1/u1/s1/h1",
                "https://h2/key/sync/o1/u1/s1/h1",
                "https://h3/key/sync/o1/u1/s1/h1",
            ]
        );
        match outcome {
            SyncOutcome::Updated(doc) => {
                assert_eq!(doc.directives, vec!["client", "setenv UV_ID local", "remote b 443"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn no_subscription_stops_without_changes() {
        let fake = FakeTransport::new(vec![Ok((480, String::new())), Ok((200, signed_body("x")))]);
        let client = SyncClient::new(fake);
        let outcome = client.sync(&prfl(&["https://h1", "https://h2"]), &local()).await;
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(client.transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn user_not_found_and_auth_error_stop_at_first_host() {
        for status in [404, 401] {
            let fake = FakeTransport::new(vec![Ok((status, String::new())), Ok((200, signed_body("x")))]);
            let client = SyncClient::new(fake);
            let outcome = client.sync(&prfl(&["https://h1", "https://h2"]), &local()).await;
            assert_eq!(outcome, SyncOutcome::Unchanged, "{}", status);
            assert_eq!(client.transport.calls(), vec!["https://h1/key/sync/o1/u1/s1/h1"], "{}", status);
        }
    }

    #[tokio::test]
    async fn missing_sync_hash_sends_nothing() {
        let fake = FakeTransport::new(vec![Ok((200, signed_body("x")))]);
        let client = SyncClient::new(fake);
        let mut p = prfl(&["https://h1"]);
        p.sync_hash = None;
        assert_eq!(client.sync(&p, &local()).await, SyncOutcome::Unchanged);
        assert!(client.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn bad_signature_tries_next_host() {
        let bad = serde_json::json!({ "conf": "remote evil 1\n", "signature": "AAAA" }).to_string();
        let fake = FakeTransport::new(vec![Ok((200, bad)), Ok((500, String::new()))]);
        let client = SyncClient::new(fake);
        let outcome = client.sync(&prfl(&["https://h1", "https://h2"]), &local()).await;
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(client.transport.calls().len(), 2);
    }

    #[test]
    fn request_signature_covers_method_and_path() {
        let headers = sign_request("tok", "secret", "get", "/key/sync/a", None, 100, "n1");
        let sig = headers.iter().find(|(k, _)| *k == "Auth-Signature").unwrap();
        assert_eq!(sig.1, sign("secret", "tok&100&n1&GET&/key/sync/a"));
        assert!(!headers.iter().any(|(k, _)| *k == "Content-Type"));
    }

    #[tokio::test]
    async fn signed_headers_reach_the_host() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = std::thread::spawn(move || {
            let req = server.recv().unwrap();
            let url = req.url().to_string();
            let headers: Vec<(String, String)> = req
                .headers()
                .iter()
                .map(|h| (h.field.as_str().as_str().to_ascii_lowercase(), h.value.as_str().to_string()))
                .collect();
            req.respond(tiny_http::Response::from_string("").with_status_code(480)).unwrap();
            (url, headers)
        });

        let transport = ReqwestTransport::new(Duration::from_secs(3)).unwrap();
        let client = SyncClient::new(transport);
        let outcome = client
            .sync(&prfl(&[&format!("http://127.0.0.1:{}", port)]), &local())
            .await;
        assert_eq!(outcome, SyncOutcome::Unchanged);

        let (url, headers) = handle.join().unwrap();
        assert_eq!(url, "/key/sync/o1/u1/s1/h1");
        let get = |name: &str| {
            headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()).unwrap()
        };
        assert_eq!(get("user-agent"), "pritunl");
        assert_eq!(get("auth-token"), "tok");
        let expected = sign(
            "secret",
            &format!("tok&{}&{}&GET&{}", get("auth-timestamp"), get("auth-nonce"), url),
        );
        assert_eq!(get("auth-signature"), expected);
    }
}
