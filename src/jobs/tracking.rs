//! Tracking tokens: correlate anonymous external output back to a job.
//!
//! The token is derived from the job id and appended to the submitted
//! prompt. When the external service later renders that prompt next to a
//! finished artifact, the scanner extracts the token and recovers the id.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)#GP([0-9a-f]{32})\b").expect("tracking token pattern is valid")
});

/// Marker embedded in submitted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackingToken(Uuid);

impl TrackingToken {
    /// Deterministic token for a job.
    pub fn for_job(job_id: Uuid) -> Self {
        Self(job_id)
    }

    pub fn job_id(&self) -> Uuid {
        self.0
    }

    /// Append the token to prompt text.
    pub fn embed(&self, prompt: &str) -> String {
        let trimmed = prompt.trim_end();
        if trimmed.is_empty() {
            self.to_string()
        } else {
            format!("{trimmed} {self}")
        }
    }

    /// Extract the first token found in scanned text.
    pub fn extract(text: &str) -> Option<Self> {
        let caps = TOKEN_PATTERN.captures(text)?;
        Uuid::parse_str(&caps[1].to_ascii_lowercase()).ok().map(Self)
    }
}

impl fmt::Display for TrackingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#GP{}", self.0.simple())
    }
}
