//! Worker data model: persisted configuration plus live runtime state.

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Highest scheduling priority a worker may carry.
pub const MAX_PRIORITY: u8 = 10;

fn default_max_concurrent() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Worker ids become URL path segments on the sidecar.
fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Persisted configuration for one automation identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable identifier.
    pub id: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Account handle on the external service (phone/login).
    pub credential_ref: String,
    /// Scheduling priority, 1–10.
    pub priority: u8,
    /// Concurrent job capacity.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Models this worker is known to handle well. Empty means no preference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, credential_ref: impl Into<String>, priority: u8) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            credential_ref: credential_ref.into(),
            priority,
            max_concurrent: default_max_concurrent(),
            is_active: true,
            models: Vec::new(),
        }
    }

    pub fn with_capacity(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let reject = |reason: &str| RegistryError::InvalidWorker {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(reject("id must not be empty"));
        }
        if !self.id.chars().all(is_id_char) || self.id.chars().all(|c| c == '.') {
            return Err(reject(
                "id may only contain letters, digits, '-', '_' and '.'",
            ));
        }
        if self.credential_ref.trim().is_empty() {
            return Err(reject("credential_ref must not be empty"));
        }
        if !(1..=MAX_PRIORITY).contains(&self.priority) {
            return Err(reject("priority must be between 1 and 10"));
        }
        Ok(())
    }
}

/// Live, in-memory state of a worker. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerState {
    /// Jobs currently held (processing or generating).
    pub current_load: u32,
    /// Set only after a live session check succeeds.
    pub session_verified: bool,
    /// Last credit balance reported by the external service.
    pub remaining_credits: Option<u32>,
}

/// Partial update applied through the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
}

impl WorkerPatch {
    pub fn apply_to(&self, config: &mut WorkerConfig) {
        if let Some(label) = &self.label {
            config.label = label.clone();
        }
        if let Some(credential_ref) = &self.credential_ref {
            config.credential_ref = credential_ref.clone();
        }
        if let Some(priority) = self.priority {
            config.priority = priority;
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent = max_concurrent;
        }
        if let Some(models) = &self.models {
            config.models = models.clone();
        }
    }

    /// Whether the patch changes the account the session is bound to.
    pub fn changes_credential(&self, config: &WorkerConfig) -> bool {
        self.credential_ref
            .as_ref()
            .is_some_and(|c| *c != config.credential_ref)
    }
}

/// Point-in-time view of a worker, as exposed to the admin layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub label: String,
    pub credential_ref: String,
    pub priority: u8,
    pub is_active: bool,
    pub load: u32,
    pub capacity: u32,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_credits: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

impl WorkerStatus {
    pub fn from_parts(config: &WorkerConfig, state: &WorkerState) -> Self {
        Self {
            id: config.id.clone(),
            label: config.label.clone(),
            credential_ref: config.credential_ref.clone(),
            priority: config.priority,
            is_active: config.is_active,
            load: state.current_load,
            capacity: config.max_concurrent,
            verified: state.session_verified,
            remaining_credits: state.remaining_credits,
            models: config.models.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_from_json() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"id":"w1","credential_ref":"+15550001","priority":7}"#)
                .unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert!(config.is_active);
        assert!(config.models.is_empty());
        assert_eq!(config.label, "");
    }

    #[test]
    fn priority_bounds_enforced() {
        assert!(WorkerConfig::new("w", "acct", 1).validate().is_ok());
        assert!(WorkerConfig::new("w", "acct", 10).validate().is_ok());
        assert!(WorkerConfig::new("w", "acct", 0).validate().is_err());
        assert!(WorkerConfig::new("w", "acct", 11).validate().is_err());
        assert!(WorkerConfig::new(" ", "acct", 5).validate().is_err());
    }

    #[test]
    fn ids_must_be_path_safe() {
        assert!(WorkerConfig::new("acct-7_b.main", "acct", 5).validate().is_ok());
        for id in ["a/b", "..", ".", "w 1", "w?x", "w%2F"] {
            assert!(WorkerConfig::new(id, "acct", 5).validate().is_err(), "{id}");
        }
    }

    #[test]
    fn patch_applies_only_given_fields() {
        let mut config = WorkerConfig::new("w", "acct", 5);
        let patch = WorkerPatch {
            priority: Some(8),
            max_concurrent: Some(1),
            ..Default::default()
        };
        assert!(!patch.changes_credential(&config));
        patch.apply_to(&mut config);
        assert_eq!(config.priority, 8);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.credential_ref, "acct");
    }
}
