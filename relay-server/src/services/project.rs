use std::collections::HashMap;

use chrono::{DateTime, Utc};
use relay_auth::PublicKey;
use relay_common::{ProjectId, ProjectKey};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::extractors::RequestMeta;

/// The reason an event is discarded before forwarding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscardReason {
    /// The project does not exist upstream.
    ProjectId,
    /// The project state could not be fetched from the upstream.
    ProjectState,
    /// The project exists but ingestion is disabled.
    DisabledProject,
    /// The public key used for authentication is disabled.
    DisabledKey,
    /// The public key is not known for this project.
    UnknownKey,
    /// The request origin is not in the project's allowed domains.
    Cors,
}

impl DiscardReason {
    /// Returns the reason name used in outcome logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Self::ProjectId => "project_id",
            Self::ProjectState => "project_state",
            Self::DisabledProject => "disabled_project",
            Self::DisabledKey => "disabled_key",
            Self::UnknownKey => "unknown_key",
            Self::Cors => "cors",
        }
    }
}

/// The state of a public key within a project.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublicKeyStatus {
    /// The key is not listed in the project state.
    Unknown,
    /// The key is listed and disabled.
    Disabled,
    /// The key is listed and enabled.
    Enabled,
}

/// Per-project settings received from the upstream.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    /// URLs that are permitted to send events to this project. An entry of `"*"` allows all
    /// origins, an empty list rejects all browser origins.
    pub allowed_domains: Vec<String>,
    /// Public keys of relays that this project trusts for pre-authenticated traffic.
    pub trusted_relays: Vec<PublicKey>,
    /// Opaque PII scrubbing configuration, forwarded verbatim.
    pub pii_config: Option<serde_json::Value>,
}

/// The project state snapshot fetched from the upstream.
///
/// The wire shape matches the upstream's project config endpoint. A project that does not exist
/// is cached as a disabled "missing" state, and a failed fetch as an `invalid` state; both reject
/// events without killing the cache.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    /// The numeric project id, if known.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    /// Whether ingestion for this project is disabled.
    #[serde(default)]
    pub disabled: bool,
    /// The project's public keys and whether each is enabled.
    #[serde(default)]
    pub public_keys: HashMap<ProjectKey, bool>,
    /// The revision of the project config, if reported by the upstream.
    #[serde(default)]
    pub rev: Option<String>,
    /// Timestamp of the last upstream fetch.
    #[serde(default)]
    pub last_fetch: Option<DateTime<Utc>>,
    /// Timestamp of the last config change upstream.
    #[serde(default)]
    pub last_change: Option<DateTime<Utc>>,
    /// Per-project settings.
    #[serde(default)]
    pub config: ProjectConfig,
    /// The project slug, if known.
    #[serde(default)]
    pub slug: Option<String>,
    /// Set when the upstream fetch failed and no usable state exists.
    #[serde(skip)]
    pub invalid: bool,
}

impl ProjectState {
    /// Creates a state for a project that does not exist upstream.
    pub fn missing() -> Self {
        ProjectState {
            project_id: None,
            disabled: true,
            public_keys: HashMap::new(),
            rev: None,
            last_fetch: Some(Utc::now()),
            last_change: None,
            config: ProjectConfig::default(),
            slug: None,
            invalid: false,
        }
    }

    /// Creates a state for a project whose fetch failed.
    pub fn err() -> Self {
        let mut state = Self::missing();
        state.invalid = true;
        state
    }

    /// Returns `true` if the state stems from a failed fetch.
    pub fn invalid(&self) -> bool {
        self.invalid
    }

    /// Returns `true` if this is the negative-cache state for a missing project.
    pub fn is_missing(&self) -> bool {
        self.project_id.is_none() && self.disabled && !self.invalid
    }

    /// Returns the status of the given public key in this project.
    pub fn get_public_key_status(&self, public_key: ProjectKey) -> PublicKeyStatus {
        match self.public_keys.get(&public_key) {
            Some(true) => PublicKeyStatus::Enabled,
            Some(false) => PublicKeyStatus::Disabled,
            None => PublicKeyStatus::Unknown,
        }
    }

    /// Returns `true` if the given origin is allowed to send events.
    pub fn is_valid_origin(&self, origin: Option<&Url>) -> bool {
        // Requests without an origin header are not browser requests and pass.
        let Some(origin) = origin else { return true };

        if self.config.allowed_domains.iter().any(|x| x == "*") {
            return true;
        }

        let Some(host) = origin.host_str() else {
            return false;
        };

        self.config.allowed_domains.iter().any(|x| x == host)
    }

    /// Validates a store request against this project state.
    pub fn check_request(&self, meta: &RequestMeta) -> Result<(), DiscardReason> {
        if self.invalid {
            return Err(DiscardReason::ProjectState);
        }

        if self.is_missing() {
            return Err(DiscardReason::ProjectId);
        }

        if self.disabled {
            return Err(DiscardReason::DisabledProject);
        }

        match self.get_public_key_status(meta.public_key()) {
            PublicKeyStatus::Enabled => (),
            PublicKeyStatus::Disabled => return Err(DiscardReason::DisabledKey),
            PublicKeyStatus::Unknown => return Err(DiscardReason::UnknownKey),
        }

        if !self.is_valid_origin(meta.origin()) {
            return Err(DiscardReason::Cors);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> ProjectKey {
        ProjectKey::parse("31a5a894b4524f74a9a8d0e27e21ba91").unwrap()
    }

    fn enabled_state() -> ProjectState {
        let mut state = ProjectState::missing();
        state.project_id = Some(ProjectId::new(42));
        state.disabled = false;
        state.public_keys.insert(test_key(), true);
        state
    }

    fn test_meta() -> RequestMeta {
        RequestMeta::for_test(ProjectId::new(42), test_key())
    }

    #[test]
    fn test_parse_wire_shape() {
        let state: ProjectState = serde_json::from_str(
            r#"{
                "projectId": 42,
                "publicKeys": {"31a5a894b4524f74a9a8d0e27e21ba91": true},
                "rev": "0f0b1d9b",
                "disabled": false,
                "lastFetch": "2026-08-01T00:00:00Z",
                "slug": "backend",
                "config": {"allowedDomains": ["*"]}
            }"#,
        )
        .unwrap();

        assert_eq!(state.project_id, Some(ProjectId::new(42)));
        assert!(!state.disabled);
        assert_eq!(state.get_public_key_status(test_key()), PublicKeyStatus::Enabled);
        assert_eq!(state.slug.as_deref(), Some("backend"));
    }

    #[test]
    fn test_check_request_accepts() {
        assert_eq!(enabled_state().check_request(&test_meta()), Ok(()));
    }

    #[test]
    fn test_check_request_disabled_project() {
        let mut state = enabled_state();
        state.disabled = true;
        assert_eq!(
            state.check_request(&test_meta()),
            Err(DiscardReason::DisabledProject)
        );
    }

    #[test]
    fn test_check_request_key_states() {
        let mut state = enabled_state();
        state.public_keys.insert(test_key(), false);
        assert_eq!(
            state.check_request(&test_meta()),
            Err(DiscardReason::DisabledKey)
        );

        state.public_keys.clear();
        assert_eq!(
            state.check_request(&test_meta()),
            Err(DiscardReason::UnknownKey)
        );
    }

    #[test]
    fn test_check_request_missing_and_invalid() {
        assert_eq!(
            ProjectState::missing().check_request(&test_meta()),
            Err(DiscardReason::ProjectId)
        );
        assert_eq!(
            ProjectState::err().check_request(&test_meta()),
            Err(DiscardReason::ProjectState)
        );
    }

    #[test]
    fn test_origin_validation() {
        let mut state = enabled_state();
        assert!(state.is_valid_origin(None));

        let origin: Url = "https://app.example.com/".parse().unwrap();

        // No allowed domains rejects browser origins.
        assert!(!state.is_valid_origin(Some(&origin)));

        state.config.allowed_domains = vec!["app.example.com".to_owned()];
        assert!(state.is_valid_origin(Some(&origin)));

        state.config.allowed_domains = vec!["*".to_owned()];
        assert!(state.is_valid_origin(Some(&origin)));
    }
}
