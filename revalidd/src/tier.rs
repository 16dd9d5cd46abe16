use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::store::cache_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    /// Auth and onboarding: always network, never cached or queued.
    OnlineMandatory,
    /// Network required, but successful reads are still cached.
    FreeOnlineOnly,
    /// Cache-first reads, queued writes when disconnected.
    OfflineCapable,
}

/// Subscription flags. Both can be false for a lapsed premium account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierState {
    pub is_free: bool,
    pub offline_entitled: bool,
}

impl TierState {
    pub const FREE: TierState = TierState {
        is_free: true,
        offline_entitled: false,
    };
    pub const ENTITLED: TierState = TierState {
        is_free: false,
        offline_entitled: true,
    };
    pub const LAPSED: TierState = TierState {
        is_free: false,
        offline_entitled: false,
    };

    /// Reads `subscription_tier` (and `subscription_status`) from a current-user
    /// payload, looking inside `data` first. `None` if the payload has no tier.
    pub fn from_user_payload(payload: &Value) -> Option<Self> {
        let user = payload
            .get("data")
            .filter(|data| data.is_object())
            .unwrap_or(payload);
        let tier = string_field(user, &["subscription_tier", "subscriptionTier"])?;
        let status = string_field(user, &["subscription_status", "subscriptionStatus"]);

        if tier.eq_ignore_ascii_case("free") {
            return Some(TierState::FREE);
        }
        match status.map(str::to_ascii_lowercase).as_deref() {
            None | Some("active") | Some("trialing") => Some(TierState::ENTITLED),
            Some(_) => Some(TierState::LAPSED),
        }
    }
}

impl Default for TierState {
    fn default() -> Self {
        TierState::FREE
    }
}

fn string_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
}

/// Endpoints that must always reach the network, whatever the tier.
pub const ONLINE_MANDATORY_PREFIXES: &[(&str, &str)] = &[
    ("/api/v1/auth/login", "login"),
    ("/api/v1/auth/register", "registration"),
    ("/api/v1/auth/forgot-password", "password reset request"),
    ("/api/v1/auth/reset-password", "password reset"),
    ("/api/v1/auth/verify-email", "email verification"),
    ("/api/v1/auth/resend-verification", "email verification"),
    ("/api/v1/onboarding", "onboarding"),
];

#[derive(Debug, Clone)]
pub struct TierPolicy {
    online_mandatory: Vec<String>,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(ONLINE_MANDATORY_PREFIXES.iter().map(|(prefix, _)| *prefix))
    }
}

impl TierPolicy {
    pub fn new<I, S>(online_mandatory: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            online_mandatory: online_mandatory
                .into_iter()
                .map(|prefix| cache_key(&prefix.into()))
                .collect(),
        }
    }

    pub fn classify(&self, endpoint: &str, tier: &TierState) -> TierDecision {
        if self.is_online_mandatory(endpoint) {
            TierDecision::OnlineMandatory
        } else if tier.offline_entitled {
            TierDecision::OfflineCapable
        } else {
            TierDecision::FreeOnlineOnly
        }
    }

    pub fn is_online_mandatory(&self, endpoint: &str) -> bool {
        let key = cache_key(endpoint);
        let path = key.split('?').next().unwrap_or(&key);
        self.online_mandatory
            .iter()
            .any(|prefix| matches_segment_prefix(path, prefix))
    }
}

fn matches_segment_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Shared, refreshable tier flags. Written only from the current-user probe.
#[derive(Debug, Clone, Default)]
pub struct TierCell {
    inner: Arc<RwLock<TierState>>,
}

impl TierCell {
    pub fn new(state: TierState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn get(&self) -> TierState {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, state: TierState) {
        match self.inner.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}
