use anyhow::{Context, Result};
use sqlx::{
    Connection,
    mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode},
};
use std::time::Duration;

use crate::config::DbSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn connect_options(db: &DbSettings) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(&db.password)
        .database(&db.name);

    let has_tls_material = db.ssl_ca.is_some() || db.ssl_cert.is_some() || db.ssl_key.is_some();
    let ssl_mode = match (has_tls_material, db.verify_server_cert) {
        (_, true) => MySqlSslMode::VerifyCa,
        (true, false) => MySqlSslMode::Required,
        (false, false) => MySqlSslMode::Preferred,
    };
    options = options.ssl_mode(ssl_mode);

    if let Some(ca) = &db.ssl_ca {
        options = options.ssl_ca(ca);
    }
    if let Some(cert) = &db.ssl_cert {
        options = options.ssl_client_cert(cert);
    }
    if let Some(key) = &db.ssl_key {
        options = options.ssl_client_key(key);
    }
    options
}

pub async fn connect(db: &DbSettings) -> Result<MySqlConnection> {
    let options = connect_options(db);
    tokio::time::timeout(CONNECT_TIMEOUT, MySqlConnection::connect_with(&options))
        .await
        .with_context(|| format!("Timed out connecting to MySQL at {}:{}", db.host, db.port))?
        .with_context(|| format!("Failed connecting to MySQL at {}:{}", db.host, db.port))
}

/// `?, ?, ?` for binding an `IN (...)` list.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_match_bind_count() {
        assert_eq!(placeholders(2), "?, ?");
        assert_eq!(placeholders(1), "?");
    }
}
