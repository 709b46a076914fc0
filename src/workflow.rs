use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::{fmt, io, time::Duration};
use tracing::Instrument;

use crate::{
    claims::ClaimRecord, credentials::Credential, error::PortalError, output::LookupOutput,
    pending::PendingQueue, portal::Portal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Found,
    NotFound,
    Error,
}

impl LookupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Found => "FOUND",
            Self::NotFound => "NOT_FOUND",
            Self::Error => "ERROR",
        }
    }

    /// FOUND and NOT_FOUND are final; only ERROR keeps a claim pending.
    pub fn is_conclusive(self) -> bool {
        !matches!(self, Self::Error)
    }
}

impl fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub claim_id: String,
    pub phone: Option<String>,
    pub status: LookupStatus,
    pub error: Option<String>,
}

impl LookupResult {
    fn found(claim_id: &str, phone: String) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            phone: Some(phone),
            status: LookupStatus::Found,
            error: None,
        }
    }

    fn not_found(claim_id: &str) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            phone: None,
            status: LookupStatus::NotFound,
            error: None,
        }
    }

    fn failed(claim_id: &str, err: &PortalError) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            phone: None,
            status: LookupStatus::Error,
            error: Some(err.to_string()),
        }
    }
}

fn apply_lookup_progress_style(progress: &ProgressBar) {
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{pos}/{len} ({percent}%) eta {eta_precise} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
}

async fn lookup_claim<P: Portal>(portal: &mut P, claim_id: &str) -> LookupResult {
    let hit = match portal.search(claim_id).await {
        Ok(hit) => hit,
        Err(err) if err.is_not_found() => {
            tracing::info!("No search results");
            return LookupResult::not_found(claim_id);
        }
        Err(err) => {
            tracing::warn!("Search failed: {err}");
            return LookupResult::failed(claim_id, &err);
        }
    };

    match portal.read_phone(hit).await {
        Ok(Some(phone)) => {
            tracing::info!(phone = %phone, "Phone found");
            LookupResult::found(claim_id, phone)
        }
        Ok(None) => {
            tracing::info!("Claim file has no mobile phone");
            LookupResult::not_found(claim_id)
        }
        Err(err) => {
            tracing::warn!("Reading the claim file failed: {err}");
            LookupResult::failed(claim_id, &err)
        }
    }
}

/// What a lookup run produced once the portal session is over.
pub struct RunReport<W: io::Write> {
    pub results: Vec<LookupResult>,
    pub output: LookupOutput<W>,
    /// Set when recording a result failed and the run stopped early. The
    /// pending queue still holds every update made before the failure.
    pub interrupted: Option<anyhow::Error>,
}

/// Logs in once and looks up every claim in order.
///
/// A failed login aborts before any claim is touched: `pending` is left as
/// it was and `open_output` is never called, so a previous output file
/// survives. Per-claim failures never abort: they become ERROR rows and the
/// claim is re-queued. The portal is closed on every path.
pub async fn run<P, W, F>(
    mut portal: P,
    credential: &Credential,
    claims: &[ClaimRecord],
    pending: &mut PendingQueue,
    open_output: F,
) -> Result<RunReport<W>>
where
    P: Portal,
    W: io::Write,
    F: FnOnce() -> Result<LookupOutput<W>>,
{
    if let Err(err) = portal.login(credential).await {
        close_portal(portal).await;
        return Err(err).context("Portal login failed; no claims were processed");
    }
    let mut output = match open_output() {
        Ok(output) => output,
        Err(err) => {
            close_portal(portal).await;
            return Err(err);
        }
    };

    let progress = ProgressBar::new(claims.len() as u64);
    progress.set_prefix("ePAC");
    apply_lookup_progress_style(&progress);
    progress.enable_steady_tick(Duration::from_millis(250));

    let mut results = Vec::with_capacity(claims.len());
    let mut interrupted = None;
    let (mut found, mut not_found, mut failed) = (0usize, 0usize, 0usize);

    for (idx, claim) in claims.iter().enumerate() {
        let span = tracing::info_span!("claim", claim_id = %claim.claim_id);
        let result = lookup_claim(&mut portal, &claim.claim_id)
            .instrument(span.clone())
            .await;

        match result.status {
            LookupStatus::Found => found += 1,
            LookupStatus::NotFound => not_found += 1,
            LookupStatus::Error => failed += 1,
        }
        if let Err(err) = record_result(claim, &result, pending, &mut output) {
            tracing::error!(claim_id = %claim.claim_id, "Stopping the run: {err:#}");
            results.push(result);
            interrupted = Some(err);
            break;
        }
        results.push(result);

        progress.inc(1);
        progress.set_message(format!("found={found} not_found={not_found} error={failed}"));

        if idx + 1 < claims.len()
            && let Err(err) = portal.return_to_search().instrument(span).await
        {
            tracing::warn!(claim_id = %claim.claim_id, "Could not return to the search form: {err}");
        }
    }
    progress.finish_with_message(format!("found={found} not_found={not_found} error={failed}"));

    close_portal(portal).await;
    tracing::info!(
        processed = results.len(),
        found,
        not_found,
        failed,
        interrupted = interrupted.is_some(),
        "Lookup run finished"
    );
    Ok(RunReport {
        results,
        output,
        interrupted,
    })
}

fn record_result<W: io::Write>(
    claim: &ClaimRecord,
    result: &LookupResult,
    pending: &mut PendingQueue,
    output: &mut LookupOutput<W>,
) -> Result<()> {
    if result.status.is_conclusive() {
        pending.resolve(&claim.claim_id);
    } else {
        pending.requeue(claim)?;
        let attempts = pending.get(&claim.claim_id).map_or(0, |e| e.attempts);
        tracing::info!(claim_id = %claim.claim_id, attempts, "Claim kept pending");
    }
    output.write(claim, result)
}

async fn close_portal<P: Portal>(portal: P) {
    if let Err(err) = portal.close().await {
        tracing::warn!("Failed closing the browser: {err}");
    }
}
