use std::time::Duration;
use thiserror::Error;

/// Failures raised by a portal session. Only `Login` is fatal for a run;
/// the workflow turns every other variant into a per-claim result.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal login failed: {0}")]
    Login(String),

    #[error("claim {claim_id} returned no results")]
    NotFound { claim_id: String },

    #[error("navigation step '{step}' exceeded {budget:?}")]
    NavigationTimeout { step: &'static str, budget: Duration },

    #[error("submission step '{step}' exceeded {budget:?}")]
    SubmissionTimeout { step: &'static str, budget: Duration },

    #[error("unexpected page state: {0}")]
    Page(String),

    #[error("webdriver command failed: {0}")]
    WebDriver(#[from] fantoccini::error::CmdError),
}

impl PortalError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no portal credentials available (tried: {})", tried.join(", "))]
    Exhausted { tried: Vec<&'static str> },
}
