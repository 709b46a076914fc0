mod args;
mod claims;
mod common;
mod config;
mod constants;
mod credentials;
mod db;
mod error;
mod output;
mod pacing;
mod pending;
mod phone;
mod portal;
mod workflow;

use anyhow::{Context, Result, bail, ensure};
use chrono::{Local, NaiveDate};
use clap::Parser;
use sqlx::Connection;
use std::path::PathBuf;

use args::Args;
use claims::{ClaimRecord, SelectionRules, export_claims, fetch_claims, read_claims_csv, select_claims};
use config::Config;
use credentials::{resolve_credentials, strategies_for};
use output::LookupOutput;
use pending::PendingQueue;
use portal::epac::EpacPortal;
use workflow::LookupStatus;

async fn load_claims(config: &Config, target_day: NaiveDate) -> Result<Vec<ClaimRecord>> {
    if let Some(path) = &config.run.claims_csv {
        let claims = read_claims_csv(path)?;
        tracing::info!(rows = claims.len(), path = %path.display(), "Loaded claims file");
        return Ok(claims);
    }

    let Some(db) = &config.db else {
        bail!("Database settings (DB_HOST, DB_USER, DB_PASS, DB_NAME) are required unless --claims-csv is given");
    };
    let mut conn = db::connect(db).await?;
    let claims = fetch_claims(&mut conn, target_day).await?;
    if let Err(err) = conn.close().await {
        tracing::warn!("Failed closing the database connection: {err}");
    }

    let written = export_claims(&config.paths.export_csv, &claims)?;
    ensure!(
        written == claims.len(),
        "Export wrote {written} rows for {} claims",
        claims.len()
    );
    tracing::info!(
        rows = written,
        day = %target_day,
        path = %config.paths.export_csv.display(),
        "Exported claims"
    );
    Ok(claims)
}

/// Loads `--env-file`, or `.env` from the working directory when present.
/// Variables already set in the process environment win.
fn load_env_file() -> Result<Option<PathBuf>> {
    if let Some(path) = args::env_file_from_argv(std::env::args_os()) {
        dotenvy::from_path(&path)
            .with_context(|| format!("Failed loading env file {}", path.display()))?;
        return Ok(Some(path));
    }
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err).context("Failed loading .env"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = load_env_file()?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if let Some(path) = &env_file {
        tracing::info!(path = %path.display(), "Loaded environment file");
    }

    let args = Args::parse();
    let config = Config::from_args(args, std::env::var_os("DISPLAY").is_some())?;
    let target_day = config
        .run
        .target_day
        .unwrap_or_else(|| Local::now().date_naive());

    tracing::info!(
        data_dir = %config.paths.data_dir.display(),
        day = %target_day,
        headless = config.browser.headless,
        "Starting claim phone run"
    );

    let fresh = load_claims(&config, target_day)
        .await
        .context("Failed loading claims")?;
    if config.run.skip_lookup {
        tracing::info!("Lookup skipped; export only");
        return Ok(());
    }

    let mut pending = PendingQueue::load(&config.paths.pending)?;
    let rules = SelectionRules {
        min_claim_len: config.run.min_claim_len,
        skip_insurer: config.run.skip_insurer.as_deref(),
        max_claims: config.run.max_claims,
    };
    let claims = select_claims(fresh, pending.claims(), &rules);
    let retried = claims
        .iter()
        .filter(|c| pending.contains(&c.claim_id))
        .count();
    tracing::info!(
        selected = claims.len(),
        retried,
        pending = pending.len(),
        "Claims ready for lookup"
    );
    if claims.is_empty() {
        tracing::info!("Nothing to look up");
        return Ok(());
    }

    let credential = resolve_credentials(&strategies_for(&config))
        .await
        .context("Failed resolving portal credentials")?;

    let http = reqwest::Client::builder()
        .user_agent("claim-phones/0.1")
        .build()
        .context("Failed creating HTTP client")?;
    let client = portal::webdriver::connect(&http, &config.browser).await?;
    let session = EpacPortal::new(client, &config.browser);

    let output_path = &config.paths.output_csv;
    let report = workflow::run(session, &credential, &claims, &mut pending, || {
        LookupOutput::create(output_path)
    })
    .await?;
    pending
        .save()
        .with_context(|| format!("Failed saving pending queue {}", pending.path().display()))?;
    if let Some(err) = report.interrupted {
        return Err(err).context("Lookup run stopped before every claim was processed");
    }
    let results = report.results;

    for failed in results.iter().filter(|r| r.status == LookupStatus::Error) {
        tracing::warn!(
            claim_id = %failed.claim_id,
            error = failed.error.as_deref().unwrap_or_default(),
            "Lookup failed; retried next run"
        );
    }

    let count = |status: LookupStatus| results.iter().filter(|r| r.status == status).count();
    tracing::info!(
        found = count(LookupStatus::Found),
        not_found = count(LookupStatus::NotFound),
        error = count(LookupStatus::Error),
        rows = report.output.rows(),
        still_pending = pending.len(),
        output = %config.paths.output_csv.display(),
        "Done"
    );
    Ok(())
}
