use clap::{Parser, builder::FalseyValueParser};
use std::{ffi::OsString, path::PathBuf};

use crate::constants::{
    DEFAULT_COMPANY_IDS, DEFAULT_DB_CLIENT_BIN, DEFAULT_DB_NAME, DEFAULT_DB_PORT,
    DEFAULT_WEBDRIVER_URL,
};

#[derive(Debug, Parser)]
#[command(name = "claim_phones")]
#[command(about = "Export pending Allianz claims and look up their contact phones in ePAC")]
pub struct Args {
    /// Environment file read before any other option, so its variables feed
    /// the `env` fallbacks below. Defaults to `.env` when one exists.
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Working directory for the export, output and pending-queue files.
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Export CSV path. Defaults to <data-dir>/claims_export.csv.
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Lookup output CSV path. Defaults to <data-dir>/claims_phones.csv.
    #[arg(long)]
    pub output_csv: Option<PathBuf>,

    /// Pending queue JSONL path. Defaults to <data-dir>/pending_claims.jsonl.
    #[arg(long, env = "PENDING_QUEUE_PATH")]
    pub pending_path: Option<PathBuf>,

    /// Use an existing export CSV instead of querying the database.
    #[arg(long)]
    pub claims_csv: Option<PathBuf>,

    /// Target day (YYYY-MM-DD) for the claims query. Defaults to today.
    #[arg(long)]
    pub date: Option<chrono::NaiveDate>,

    /// Only export claims; skip the portal lookup.
    #[arg(long, default_value_t = false)]
    pub skip_lookup: bool,

    /// Look up at most N claims this run (0 = all).
    #[arg(long, env = "MAX_CLAIMS", default_value_t = 0)]
    pub max: usize,

    /// Minimum number of digits for a claim id to be looked up.
    #[arg(long, env = "MIN_CLAIM_LEN", default_value_t = 9)]
    pub min_claim_len: usize,

    /// Insurer name whose claims are skipped during lookup (e.g. AllianzBBVA).
    #[arg(long, env = "SKIP_INSURER")]
    pub skip_insurer: Option<String>,

    #[arg(long, env = "DB_HOST")]
    pub db_host: Option<String>,

    #[arg(long, env = "DB_PORT", default_value_t = DEFAULT_DB_PORT)]
    pub db_port: u16,

    #[arg(long, env = "DB_USER")]
    pub db_user: Option<String>,

    #[arg(long, env = "DB_PASS", hide_env_values = true)]
    pub db_pass: Option<String>,

    #[arg(long, env = "DB_NAME", default_value = DEFAULT_DB_NAME)]
    pub db_name: String,

    #[arg(long, env = "DB_SSL_CA")]
    pub db_ssl_ca: Option<PathBuf>,

    #[arg(long, env = "DB_SSL_CERT")]
    pub db_ssl_cert: Option<PathBuf>,

    #[arg(long, env = "DB_SSL_KEY")]
    pub db_ssl_key: Option<PathBuf>,

    /// Verify the server certificate against DB_SSL_CA.
    #[arg(long, env = "DB_SSL_VERIFY", value_parser = FalseyValueParser::new())]
    pub db_ssl_verify: bool,

    /// Local database client used when the driver query yields no credentials.
    #[arg(long, env = "DB_CLIENT_BIN", default_value = DEFAULT_DB_CLIENT_BIN)]
    pub db_client_bin: String,

    /// Company ids (comma-separated) whose portal credentials are looked up.
    #[arg(long, env = "EPAC_COMPANY_IDS", default_value = DEFAULT_COMPANY_IDS, value_delimiter = ',')]
    pub company_ids: Vec<u32>,

    #[arg(long, env = "EPAC_URL")]
    pub epac_url: Option<String>,

    #[arg(long, env = "EPAC_USERNAME")]
    pub epac_username: Option<String>,

    #[arg(long, env = "EPAC_PASSWORD", hide_env_values = true)]
    pub epac_password: Option<String>,

    /// WebDriver endpoint (chromedriver) driving the browser.
    #[arg(long, env = "WEBDRIVER_URL", default_value = DEFAULT_WEBDRIVER_URL)]
    pub webdriver_url: String,

    /// Run the browser without a window.
    #[arg(long, env = "APP_HEADLESS", value_parser = FalseyValueParser::new())]
    pub headless: bool,

    /// Force a visible browser even without a detected display.
    #[arg(long, default_value_t = false)]
    pub headed: bool,

    /// Fixed delay added to every browser action, in milliseconds.
    #[arg(long, env = "APP_SLOW_MO_MS", default_value_t = 250)]
    pub slow_mo_ms: u64,

    /// Leave the browser session open when the run ends.
    #[arg(long, env = "APP_KEEP_BROWSER_OPEN", value_parser = FalseyValueParser::new())]
    pub keep_browser_open: bool,

    #[arg(long, env = "APP_NAV_TIMEOUT_MS", default_value_t = 30_000)]
    pub nav_timeout_ms: u64,

    #[arg(long, env = "APP_SUBMIT_TIMEOUT_MS", default_value_t = 120_000)]
    pub submit_timeout_ms: u64,

    /// Lower bound of the randomized pause between portal actions, in seconds.
    #[arg(long, env = "APP_MIN_ACTION_DELAY_S", default_value_t = 0.6)]
    pub min_action_delay_s: f64,

    /// Upper bound of the randomized pause between portal actions, in seconds.
    #[arg(long, env = "APP_MAX_ACTION_DELAY_S", default_value_t = 2.4)]
    pub max_action_delay_s: f64,
}

/// Finds `--env-file` in the raw argv ahead of clap, which resolves `env`
/// fallbacks while parsing and would otherwise miss the file's variables.
pub fn env_file_from_argv<I>(argv: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = OsString>,
{
    let mut argv = argv.into_iter().skip(1);
    while let Some(arg) = argv.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return argv.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
