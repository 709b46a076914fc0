use anyhow::{Result, bail, ensure};
use chrono::NaiveDate;
use std::{path::PathBuf, time::Duration};

use crate::{
    args::Args,
    common::non_blank,
    constants::{EXPORT_FILE_NAME, OUTPUT_FILE_NAME, PENDING_FILE_NAME},
};

/// Immutable run configuration, built once in `main` and handed to each component.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: Option<DbSettings>,
    pub db_client_bin: String,
    pub company_ids: Vec<u32>,
    pub portal_fallback: PortalFallback,
    pub browser: BrowserSettings,
    pub run: RunSettings,
    pub paths: RunPaths,
}

#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_ca: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub verify_server_cert: bool,
}

/// Portal credentials supplied through the environment, used as the last resort.
#[derive(Debug, Clone, Default)]
pub struct PortalFallback {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub keep_open: bool,
    pub slow_mo: Duration,
    pub navigation_timeout: Duration,
    pub submission_timeout: Duration,
    pub min_action_delay: Duration,
    pub max_action_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub target_day: Option<NaiveDate>,
    pub claims_csv: Option<PathBuf>,
    pub skip_lookup: bool,
    pub max_claims: Option<usize>,
    pub min_claim_len: usize,
    pub skip_insurer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub data_dir: PathBuf,
    pub export_csv: PathBuf,
    pub output_csv: PathBuf,
    pub pending: PathBuf,
}

impl Config {
    /// `display_available` reflects whether a graphical display exists; without
    /// one the browser is forced headless unless `--headed` was given.
    pub fn from_args(args: Args, display_available: bool) -> Result<Self> {
        ensure!(
            !args.company_ids.is_empty(),
            "At least one company id is required to look up portal credentials"
        );
        if args.min_action_delay_s < 0.0 || args.max_action_delay_s < 0.0 {
            bail!(
                "Action delays must be non-negative (min={}, max={})",
                args.min_action_delay_s,
                args.max_action_delay_s
            );
        }
        let (min_delay, max_delay) = if args.min_action_delay_s > args.max_action_delay_s {
            (args.max_action_delay_s, args.min_action_delay_s)
        } else {
            (args.min_action_delay_s, args.max_action_delay_s)
        };

        let db = match (
            non_blank(args.db_host.as_deref()),
            non_blank(args.db_user.as_deref()),
            non_blank(args.db_pass.as_deref()),
            non_blank(Some(args.db_name.as_str())),
        ) {
            (Some(host), Some(user), Some(password), Some(name)) => Some(DbSettings {
                host,
                port: args.db_port,
                user,
                password,
                name,
                ssl_ca: args.db_ssl_ca.clone(),
                ssl_cert: args.db_ssl_cert.clone(),
                ssl_key: args.db_ssl_key.clone(),
                verify_server_cert: args.db_ssl_verify,
            }),
            _ => None,
        };

        let data_dir = args.data_dir.clone();
        let paths = RunPaths {
            export_csv: args
                .export_csv
                .clone()
                .unwrap_or_else(|| data_dir.join(EXPORT_FILE_NAME)),
            output_csv: args
                .output_csv
                .clone()
                .unwrap_or_else(|| data_dir.join(OUTPUT_FILE_NAME)),
            pending: args
                .pending_path
                .clone()
                .unwrap_or_else(|| data_dir.join(PENDING_FILE_NAME)),
            data_dir,
        };

        Ok(Self {
            db,
            db_client_bin: args.db_client_bin,
            company_ids: args.company_ids,
            portal_fallback: PortalFallback {
                url: non_blank(args.epac_url.as_deref()),
                username: non_blank(args.epac_username.as_deref()),
                password: non_blank(args.epac_password.as_deref()),
            },
            browser: BrowserSettings {
                webdriver_url: args.webdriver_url,
                headless: effective_headless(args.headless, args.headed, display_available),
                keep_open: args.keep_browser_open,
                slow_mo: Duration::from_millis(args.slow_mo_ms),
                navigation_timeout: Duration::from_millis(args.nav_timeout_ms),
                submission_timeout: Duration::from_millis(args.submit_timeout_ms),
                min_action_delay: Duration::from_secs_f64(min_delay),
                max_action_delay: Duration::from_secs_f64(max_delay),
            },
            run: RunSettings {
                target_day: args.date,
                claims_csv: args.claims_csv,
                skip_lookup: args.skip_lookup,
                max_claims: (args.max > 0).then_some(args.max),
                min_claim_len: args.min_claim_len,
                skip_insurer: non_blank(args.skip_insurer.as_deref()),
            },
            paths,
        })
    }
}

fn effective_headless(headless: bool, headed: bool, display_available: bool) -> bool {
    if headed {
        return false;
    }
    headless || !display_available
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["claim_phones"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("args parse")
    }

    #[test]
    fn swaps_inverted_action_delays() {
        let args = parse(&["--min-action-delay-s", "3.0", "--max-action-delay-s", "1.0"]);
        let config = Config::from_args(args, true).unwrap();
        assert_eq!(config.browser.min_action_delay, Duration::from_secs(1));
        assert_eq!(config.browser.max_action_delay, Duration::from_secs(3));
    }

    #[test]
    fn database_settings_require_host_user_and_password() {
        let args = parse(&["--db-host", "db.internal", "--db-user", "reader"]);
        let config = Config::from_args(args, true).unwrap();
        assert!(config.db.is_none());

        let args = parse(&[
            "--db-host",
            "db.internal",
            "--db-user",
            "reader",
            "--db-pass",
            "secret",
        ]);
        let config = Config::from_args(args, true).unwrap();
        let db = config.db.expect("db settings");
        assert_eq!(db.host, "db.internal");
        assert_eq!(db.port, 3306);
    }

    #[test]
    fn derives_file_paths_from_data_dir() {
        let args = parse(&["--data-dir", "/srv/claims"]);
        let config = Config::from_args(args, true).unwrap();
        assert_eq!(
            config.paths.pending,
            PathBuf::from("/srv/claims/pending_claims.jsonl")
        );
        assert_eq!(
            config.paths.output_csv,
            PathBuf::from("/srv/claims/claims_phones.csv")
        );
    }

    #[test]
    fn zero_max_means_unbounded() {
        let config = Config::from_args(parse(&["--max", "0"]), true).unwrap();
        assert_eq!(config.run.max_claims, None);
        let config = Config::from_args(parse(&["--max", "5"]), true).unwrap();
        assert_eq!(config.run.max_claims, Some(5));
    }

    #[test]
    fn headless_is_forced_without_display_unless_headed() {
        assert!(effective_headless(false, false, false));
        assert!(!effective_headless(false, false, true));
        assert!(effective_headless(true, false, true));
        assert!(!effective_headless(true, true, false));
    }
}
