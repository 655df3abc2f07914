//! Content-safety gate applied to generated replies before they are stored
//! or spoken.

use crate::error::AdapterError;

/// Shown to the user in place of a reply that failed the safety check.
pub const FALLBACK_REPLY: &str = "I'm sorry, I can't help with that right now. \
If you are in danger or thinking about harming yourself, please contact your local \
emergency services or a crisis line.";

/// Case-insensitive blocked-term policy.
#[derive(Debug, Clone, Default)]
pub struct SafetyPolicy {
    blocked_terms: Vec<String>,
}

impl SafetyPolicy {
    pub fn new<I, S>(blocked_terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked_terms: blocked_terms
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn check(&self, reply: &str) -> Result<(), AdapterError> {
        if self.blocked_terms.is_empty() {
            return Ok(());
        }
        let lowered = reply.to_lowercase();
        match self.blocked_terms.iter().find(|t| lowered.contains(t.as_str())) {
            Some(term) => {
                tracing::warn!(term = %term, "generated reply blocked by safety policy");
                Err(AdapterError::SafetyRejected)
            }
            None => Ok(()),
        }
    }
}
