pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";
pub const DEFAULT_DB_PORT: u16 = 3306;
pub const DEFAULT_DB_NAME: &str = "criteria_peritoline";
pub const DEFAULT_DB_CLIENT_BIN: &str = "mysql";

/// Company ids of the two Allianz channels in the credentials and claims tables.
pub const DEFAULT_COMPANY_IDS: &str = "42,399";

/// Landing page of the portal once logged in; used to recover a lost search screen.
pub const EPAC_PRIVATE_APP_URL: &str = "https://www.e-pacallianz.com/ngx-epac-professional/private/";

pub const EXPORT_FILE_NAME: &str = "claims_export.csv";
pub const OUTPUT_FILE_NAME: &str = "claims_phones.csv";
pub const PENDING_FILE_NAME: &str = "pending_claims.jsonl";
