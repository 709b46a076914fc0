use anyhow::{Context, Result, bail};
use futures::{FutureExt, future::BoxFuture};
use sqlx::Row;
use std::{fmt, process::Stdio, time::Duration};
use tokio::process::Command;

use crate::{
    common::{non_blank, truncate_for_log},
    config::{Config, DbSettings, PortalFallback},
    db,
    error::CredentialError,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub portal_url: String,
}

impl Credential {
    /// Builds a credential only when all three fields carry a value.
    pub fn complete(
        username: Option<&str>,
        password: Option<&str>,
        portal_url: Option<&str>,
    ) -> Option<Self> {
        Some(Self {
            username: non_blank(username)?,
            password: non_blank(password)?,
            portal_url: non_blank(portal_url)?,
        })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .field("portal_url", &self.portal_url)
            .finish()
    }
}

/// One tier of the credential fallback chain.
pub trait CredentialStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the tier answered but had nothing usable.
    fn fetch(&self) -> BoxFuture<'_, Result<Option<Credential>>>;
}

fn credentials_sql(company_ids: &[u32]) -> String {
    format!(
        "SELECT url, user, pass FROM softline_aseguradoras_claves_web WHERE id_cia IN ({}) LIMIT 1",
        db::placeholders(company_ids.len())
    )
}

fn credentials_sql_inline(company_ids: &[u32]) -> String {
    let ids: Vec<String> = company_ids.iter().map(u32::to_string).collect();
    format!(
        "SELECT url, user, pass FROM softline_aseguradoras_claves_web WHERE id_cia IN ({}) LIMIT 1",
        ids.join(",")
    )
}

pub struct DatabaseCredentials {
    db: DbSettings,
    company_ids: Vec<u32>,
}

impl DatabaseCredentials {
    pub fn new(db: DbSettings, company_ids: Vec<u32>) -> Self {
        Self { db, company_ids }
    }

    async fn query(&self) -> Result<Option<Credential>> {
        let mut conn = db::connect(&self.db).await?;
        let sql = credentials_sql(&self.company_ids);
        let mut query = sqlx::query(&sql);
        for id in &self.company_ids {
            query = query.bind(*id);
        }
        let row = query
            .fetch_optional(&mut conn)
            .await
            .context("Failed querying portal credentials")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let url: Option<String> = row.try_get("url").context("Failed reading url")?;
        let user: Option<String> = row.try_get("user").context("Failed reading user")?;
        let pass: Option<String> = row.try_get("pass").context("Failed reading pass")?;
        Ok(Credential::complete(
            user.as_deref(),
            pass.as_deref(),
            url.as_deref(),
        ))
    }
}

impl CredentialStrategy for DatabaseCredentials {
    fn name(&self) -> &'static str {
        "database"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<Option<Credential>>> {
        self.query().boxed()
    }
}

/// Runs the local `mysql` client with the same query, for hosts where the
/// driver cannot negotiate the server's TLS setup.
pub struct LocalClientCredentials {
    binary: String,
    db: DbSettings,
    company_ids: Vec<u32>,
}

impl LocalClientCredentials {
    pub fn new(binary: String, db: DbSettings, company_ids: Vec<u32>) -> Self {
        Self {
            binary,
            db,
            company_ids,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--batch")
            .arg("--skip-column-names")
            .arg("--connect-timeout=10")
            .arg(format!("--host={}", self.db.host))
            .arg(format!("--port={}", self.db.port))
            .arg(format!("--user={}", self.db.user))
            .arg(format!("--database={}", self.db.name));
        if let Some(ca) = &self.db.ssl_ca {
            cmd.arg(format!("--ssl-ca={}", ca.display()));
        }
        if let Some(cert) = &self.db.ssl_cert {
            cmd.arg(format!("--ssl-cert={}", cert.display()));
        }
        if let Some(key) = &self.db.ssl_key {
            cmd.arg(format!("--ssl-key={}", key.display()));
        }
        cmd.arg(format!("--execute={}", credentials_sql_inline(&self.company_ids)))
            .env("MYSQL_PWD", &self.db.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self) -> Result<Option<Credential>> {
        let output = tokio::time::timeout(CLIENT_TIMEOUT, self.command().output())
            .await
            .with_context(|| format!("{} timed out after {:?}", self.binary, CLIENT_TIMEOUT))?
            .with_context(|| format!("Failed starting {}", self.binary))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                truncate_for_log(&String::from_utf8_lossy(&output.stderr))
            );
        }
        Ok(parse_client_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl CredentialStrategy for LocalClientCredentials {
    fn name(&self) -> &'static str {
        "local-client"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<Option<Credential>>> {
        self.run().boxed()
    }
}

/// First `url<TAB>user<TAB>pass` line of `mysql --batch --skip-column-names`.
fn parse_client_output(stdout: &str) -> Option<Credential> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split('\t').map(|f| match f.trim() {
        "NULL" => "",
        other => other,
    });
    let url = fields.next();
    let user = fields.next();
    let pass = fields.next();
    Credential::complete(user, pass, url)
}

pub struct EnvironmentCredentials {
    fallback: PortalFallback,
}

impl EnvironmentCredentials {
    pub fn new(fallback: PortalFallback) -> Self {
        Self { fallback }
    }
}

impl CredentialStrategy for EnvironmentCredentials {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<Option<Credential>>> {
        let credential = Credential::complete(
            self.fallback.username.as_deref(),
            self.fallback.password.as_deref(),
            self.fallback.url.as_deref(),
        );
        async move { Ok(credential) }.boxed()
    }
}

/// The fallback chain for this configuration. The database tiers are only
/// included when the connection settings are complete.
pub fn strategies_for(config: &Config) -> Vec<Box<dyn CredentialStrategy>> {
    let mut chain: Vec<Box<dyn CredentialStrategy>> = Vec::new();
    if let Some(db) = &config.db {
        chain.push(Box::new(DatabaseCredentials::new(
            db.clone(),
            config.company_ids.clone(),
        )));
        chain.push(Box::new(LocalClientCredentials::new(
            config.db_client_bin.clone(),
            db.clone(),
            config.company_ids.clone(),
        )));
    }
    chain.push(Box::new(EnvironmentCredentials::new(
        config.portal_fallback.clone(),
    )));
    chain
}

/// Tries each strategy once, in order, and returns the first usable credential.
pub async fn resolve_credentials(
    strategies: &[Box<dyn CredentialStrategy>],
) -> Result<Credential, CredentialError> {
    let mut tried = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        tried.push(strategy.name());
        match strategy.fetch().await {
            Ok(Some(credential)) => {
                tracing::info!(source = strategy.name(), "Portal credentials resolved");
                return Ok(credential);
            }
            Ok(None) => {
                tracing::info!(source = strategy.name(), "No portal credentials from this source");
            }
            Err(err) => {
                tracing::warn!(source = strategy.name(), "Credential source failed: {err:#}");
            }
        }
    }
    Err(CredentialError::Exhausted { tried })
}
