//! One connect attempt: sync the document, settle the device token, collect
//! auth factors and hand the assembled request to the service.

use tracing::{debug, info, warn};

use crate::auth::{FactorPrompt, Negotiator};
use crate::document::ConfigDocument;
use crate::error::{AppError, Result};
use crate::models::{ConnectRequest, Profile, TokenRequest};
use crate::profiles::ProfileManager;
use crate::service::ServiceApi;
use crate::sync::{SyncClient, SyncOutcome, SyncTransport};

pub const DEFAULT_MODE: &str = "ovpn";

/// Pull a newer document from the profile's sync hosts and store it. Never
/// fails: on any problem the stored document stays in use.
pub async fn sync_profile<S: ServiceApi, T: SyncTransport>(
    mgr: &ProfileManager<S>,
    sync: &SyncClient<T>,
    profile: Profile,
) -> Profile {
    if profile.system || profile.sync_hosts.is_empty() {
        return profile;
    }
    let local = match mgr.full_data(&profile) {
        Ok(data) => ConfigDocument::parse(&data),
        Err(e) => {
            warn!(profile_id = %profile.id, "Sync skipped, document unavailable: {}", e);
            return profile;
        }
    };
    match sync.sync(&profile, &local).await {
        SyncOutcome::Updated(doc) => match mgr.apply_sync(&profile, &doc).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(profile_id = %profile.id, "Failed to store synced config: {}", e);
                profile
            }
        },
        SyncOutcome::Unchanged => profile,
    }
}

/// Returns whether the device token is valid. A profile without token auth
/// gets any stale service-side token dropped.
async fn settle_token<S: ServiceApi>(service: &S, profile: &Profile) -> Result<bool> {
    if !profile.token {
        if let Err(e) = service.token_delete(&profile.id).await {
            debug!(profile_id = %profile.id, "Token delete failed: {}", e);
        }
        return Ok(false);
    }
    let req = TokenRequest {
        profile: &profile.id,
        server_public_key: profile.server_public_key_joined(),
        server_box_public_key: profile.server_box_public_key.as_deref(),
        ttl: profile.token_ttl,
    };
    let valid = service.token_update(&req).await?;
    debug!(profile_id = %profile.id, valid, "Device token checked");
    Ok(valid)
}

fn build_request(profile: &Profile, mode: &str, username: String, password: String, data: String) -> ConnectRequest {
    ConnectRequest {
        id: profile.id.clone(),
        mode: mode.to_string(),
        org_id: profile.organization_id.clone(),
        user_id: profile.user_id.clone(),
        server_id: profile.server_id.clone(),
        sync_hosts: profile.sync_hosts.clone(),
        sync_token: profile.sync_token.clone(),
        sync_secret: profile.sync_secret.clone(),
        username,
        password,
        dynamic_firewall: profile.dynamic_firewall,
        disable_gateway: profile.disable_gateway,
        sso_auth: profile.sso_auth,
        server_public_key: profile.server_public_key_joined(),
        server_box_public_key: profile.server_box_public_key.clone(),
        token_ttl: profile.token_ttl,
        reconnect: !profile.disable_reconnect,
        timeout: true,
        data,
    }
}

/// Run a full connect attempt for `id`. Token failures and a cancelled
/// prompt abort before anything is sent to the service.
pub async fn connect<S, T, P>(
    mgr: &ProfileManager<S>,
    sync: &SyncClient<T>,
    prompt: &mut P,
    id: &str,
    mode: Option<&str>,
) -> Result<ConnectRequest>
where
    S: ServiceApi,
    T: SyncTransport,
    P: FactorPrompt + ?Sized,
{
    let profile = mgr.require(id)?;
    if profile.is_connected() {
        return Err(AppError::Process(format!(
            "Profile {} is already {}",
            profile.formatted_name(),
            profile.live.status.as_str()
        )));
    }

    let mut profile = sync_profile(mgr, sync, profile).await;
    let mode = mode
        .map(str::to_string)
        .or_else(|| profile.last_mode.clone())
        .unwrap_or_else(|| DEFAULT_MODE.to_string());
    if !profile.system && profile.last_mode.as_deref() != Some(mode.as_str()) {
        profile.last_mode = Some(mode.clone());
        if let Err(e) = mgr.save_conf(&profile).await {
            warn!(profile_id = %profile.id, "Failed to store last mode: {}", e);
        }
    }

    let data = mgr.full_data(&profile)?;
    let doc = ConfigDocument::parse(&data);
    let name = profile.formatted_name();
    if let Some(msg) = profile.pre_connect_msg.as_deref().filter(|m| !m.is_empty()) {
        info!(profile_id = %profile.id, "{}", msg);
    }

    let mut neg = Negotiator::new();
    neg.determine(&profile, &doc);
    let valid = match settle_token(mgr.service(), &profile).await {
        Ok(valid) => valid,
        Err(e) => {
            neg.cancel();
            return Err(e);
        }
    };
    neg.apply_token(valid);

    let creds = neg.collect(prompt, &name).await?;
    let req = build_request(&profile, &mode, creds.username, creds.secret, data);
    mgr.service().connect(&req).await?;
    neg.submit()?;
    info!(profile_id = %profile.id, mode = %mode, "Connect requested");
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Factor;
    use crate::error::AppError;
    use crate::models::ProfileMeta;
    use crate::profiles::tests::{manager, FakeService};
    use crate::sync::sign;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        answers: VecDeque<&'static str>,
        asked: Vec<Factor>,
    }

    impl Scripted {
        fn new(answers: &[&'static str]) -> Self {
            Self { answers: answers.iter().copied().collect(), asked: Vec::new() }
        }
    }

    #[async_trait]
    impl FactorPrompt for Scripted {
        async fn collect(&mut self, factor: Factor, _profile_name: &str) -> Option<String> {
            self.asked.push(factor);
            self.answers.pop_front().map(str::to_string)
        }
    }

    struct OneReply(Mutex<Option<(u16, String)>>);

    #[async_trait]
    impl SyncTransport for OneReply {
        async fn get(&self, _url: &str, _headers: &[(&'static str, String)]) -> Result<(u16, String)> {
            self.0.lock().unwrap().take().ok_or_else(|| AppError::request("no reply"))
        }
    }

    fn no_sync() -> SyncClient<OneReply> {
        SyncClient::new(OneReply(Mutex::new(None)))
    }

    async fn imported(mgr: &ProfileManager<FakeService>, json: &str) -> Profile {
        let meta: ProfileMeta = serde_json::from_str(json).unwrap();
        mgr.import_document(&meta, "client\nremote vpn 1194\n").await.unwrap()
    }

    #[tokio::test]
    async fn valid_token_leaves_only_username() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = imported(&mgr, r#"{"name":"office","token":true,"password_mode":"duo_otp_username","server_public_key":["a","b"]}"#).await;
        *mgr.service().token_valid.lock().unwrap() = Some(true);

        let mut prompt = Scripted::new(&["alice"]);
        let req = connect(&mgr, &no_sync(), &mut prompt, &p.id, None).await.unwrap();

        assert_eq!(prompt.asked, vec![Factor::Username]);
        assert_eq!(req.username, "alice");
        assert_eq!(req.password, "");
        assert_eq!(req.mode, "ovpn");
        assert_eq!(req.server_public_key.as_deref(), Some("a\nb"));
        assert!(req.timeout && req.reconnect);
        assert_eq!(mgr.service().connects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_token_update_aborts_before_prompting() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = imported(&mgr, r#"{"name":"office","token":true,"password_mode":"otp"}"#).await;

        let mut prompt = Scripted::new(&["123456"]);
        let err = connect(&mgr, &no_sync(), &mut prompt, &p.id, None).await.unwrap_err();

        assert!(matches!(err, AppError::Request { .. }));
        assert!(prompt.asked.is_empty());
        assert!(mgr.service().connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_token_is_deleted_and_factors_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = imported(&mgr, r#"{"name":"office","password_mode":"pin_otp","disable_reconnect":true}"#).await;

        let mut prompt = Scripted::new(&["1111", "222333"]);
        let req = connect(&mgr, &no_sync(), &mut prompt, &p.id, Some("wg")).await.unwrap();

        assert_eq!(*mgr.service().token_deletes.lock().unwrap(), vec![p.id.clone()]);
        assert_eq!(req.password, "1111222333");
        assert_eq!(req.username, "pritunl");
        assert!(!req.reconnect);
        assert_eq!(mgr.require(&p.id).unwrap().last_mode.as_deref(), Some("wg"));
    }

    #[tokio::test]
    async fn cancelled_prompt_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = imported(&mgr, r#"{"name":"office","password_mode":"username_password"}"#).await;

        let mut prompt = Scripted::new(&["alice", ""]);
        let err = connect(&mgr, &no_sync(), &mut prompt, &p.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(mgr.service().connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn synced_document_is_what_gets_sent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = imported(
            &mgr,
            r#"{"name":"office","organization_id":"o1","user_id":"u1","server_id":"s1",
                "sync_hash":"h1","sync_token":"tok","sync_secret":"secret",
                "sync_hosts":["https://sync.example.com"]}"#,
        )
        .await;

        let conf = "client\nremote fresh 443\n";
        let body = serde_json::json!({ "conf": conf, "signature": sign("secret", conf) }).to_string();
        let sync = SyncClient::new(OneReply(Mutex::new(Some((200, body)))));

        let req = connect(&mgr, &sync, &mut Scripted::new(&[]), &p.id, None).await.unwrap();
        assert!(req.data.contains("remote fresh 443"));
        assert!(!req.data.contains("remote vpn 1194"));
        assert_eq!(req.sync_hosts, vec!["https://sync.example.com"]);
    }

    #[tokio::test]
    async fn unknown_profile_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = connect(&mgr, &no_sync(), &mut Scripted::new(&[]), "nope", None).await.unwrap_err();
        assert!(matches!(err, AppError::NoProfile(_)));
    }
}
