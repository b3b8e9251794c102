//! Multi-factor handshake run before each connect.
//!
//! The factor chain comes from the profile's `password_mode`, or is inferred
//! from an `auth-user-pass` directive. Factors are collected one at a time
//! through a [`FactorPrompt`]; an empty answer cancels the whole handshake.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::document::ConfigDocument;
use crate::error::{AppError, Result};
use crate::models::Profile;

const DEFAULT_USERNAME: &str = "pritunl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Username,
    Password,
    Pin,
    Otp,
    Duo,
    Onelogin,
    Okta,
    Yubikey,
}

impl Factor {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "username" => Some(Self::Username),
            "password" => Some(Self::Password),
            "pin"      => Some(Self::Pin),
            "otp"      => Some(Self::Otp),
            "duo"      => Some(Self::Duo),
            "onelogin" => Some(Self::Onelogin),
            "okta"     => Some(Self::Okta),
            "yubikey"  => Some(Self::Yubikey),
            _          => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Username => "username",
            Self::Password => "password",
            Self::Pin      => "pin",
            Self::Otp      => "otp",
            Self::Duo      => "duo",
            Self::Onelogin => "onelogin",
            Self::Okta     => "okta",
            Self::Yubikey  => "yubikey",
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Username => "Username",
            Self::Password => "Password",
            Self::Pin      => "Pin",
            Self::Otp      => "Authenticator Passcode",
            Self::Duo      => "Duo Passcode",
            Self::Onelogin => "OneLogin Passcode",
            Self::Okta     => "Okta Passcode",
            Self::Yubikey  => "YubiKey",
        }
    }

    /// Whether a valid device token stands in for this factor.
    pub fn token_satisfiable(&self) -> bool {
        matches!(
            self,
            Self::Pin | Self::Otp | Self::Duo | Self::Onelogin | Self::Okta | Self::Yubikey
        )
    }

    /// Echo-free entry for anything other than the username.
    pub fn is_secret(&self) -> bool {
        *self != Self::Username
    }
}

/// Ordered factor chain for a profile.
pub fn determine_factors(profile: &Profile, doc: &ConfigDocument) -> Vec<Factor> {
    if let Some(mode) = profile.password_mode.as_deref().filter(|m| !m.is_empty()) {
        return parse_mode(mode);
    }
    match doc.directive_args("auth-user-pass") {
        // credentials file given inline
        Some(args) if !args.is_empty() => Vec::new(),
        Some(_) if profile.user.as_deref().is_some_and(|u| !u.is_empty()) => vec![Factor::Otp],
        Some(_) => vec![Factor::Username, Factor::Password],
        None => Vec::new(),
    }
}

fn parse_mode(mode: &str) -> Vec<Factor> {
    mode.split('_')
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let f = Factor::from_str(s);
            if f.is_none() {
                warn!(factor = s, "Unknown auth factor ignored");
            }
            f
        })
        .collect()
}

// ── Negotiator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    DeterminingFactors,
    CollectingFactor(Factor),
    Ready,
    Submitted,
    Cancelled,
}

#[async_trait]
pub trait FactorPrompt: Send {
    /// Ask for one factor. `None` or an empty answer abandons the handshake.
    async fn collect(&mut self, factor: Factor, profile_name: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

#[derive(Debug)]
pub struct Negotiator {
    state: HandshakeState,
    factors: Vec<Factor>,
    token_valid: bool,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self { state: HandshakeState::Idle, factors: Vec::new(), token_valid: false }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn determine(&mut self, profile: &Profile, doc: &ConfigDocument) -> &[Factor] {
        self.state = HandshakeState::DeterminingFactors;
        self.factors = determine_factors(profile, doc);
        debug!(
            profile_id = %profile.id,
            factors = ?self.factors.iter().map(Factor::as_str).collect::<Vec<_>>(),
            "Auth factors determined"
        );
        &self.factors
    }

    /// Record the outcome of the device-token check. A valid token drops
    /// every factor it can stand in for.
    pub fn apply_token(&mut self, valid: bool) {
        self.token_valid = valid;
        if valid {
            self.factors.retain(|f| !f.token_satisfiable());
        }
    }

    pub fn cancel(&mut self) {
        self.state = HandshakeState::Cancelled;
    }

    /// Collect every remaining factor in order.
    pub async fn collect<P: FactorPrompt + ?Sized>(
        &mut self,
        prompt: &mut P,
        profile_name: &str,
    ) -> Result<Credentials> {
        let mut username: Option<String> = None;
        let mut secret = String::new();

        for factor in self.factors.clone() {
            self.state = HandshakeState::CollectingFactor(factor);
            let value = match prompt.collect(factor, profile_name).await {
                Some(v) if !v.is_empty() => v,
                _ => {
                    debug!(factor = factor.as_str(), "Auth handshake cancelled");
                    self.cancel();
                    return Err(AppError::Cancelled);
                }
            };
            if factor == Factor::Username {
                username = Some(value);
            } else {
                secret.push_str(&value);
            }
        }

        let username = match username {
            Some(u) => u,
            None if secret.is_empty() && !self.token_valid => String::new(),
            None => DEFAULT_USERNAME.to_string(),
        };
        self.state = HandshakeState::Ready;
        Ok(Credentials { username, secret })
    }

    pub fn submit(&mut self) -> Result<()> {
        if self.state != HandshakeState::Ready {
            return Err(AppError::Process(format!("Handshake not ready ({:?})", self.state)));
        }
        self.state = HandshakeState::Submitted;
        Ok(())
    }
}
