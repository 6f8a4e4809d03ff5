//! SQL Server connection settings.

use std::time::Duration;

use tiberius::{AuthMethod, Config, EncryptionLevel};

use super::DatabaseError;
use crate::config::AppConfig;

pub const DEFAULT_PORT: u16 = 1433;

/// Where to reach the server, parsed from the `server` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: Option<u16>,
    pub instance: Option<String>,
}

impl ServerAddress {
    /// Accepts `host`, `host,port`, `host\instance` and an optional `tcp:` prefix.
    pub fn parse(server: &str) -> Result<Self, DatabaseError> {
        let trimmed = server.trim();
        let without_proto = match trimmed.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("tcp:") => &trimmed[4..],
            _ => trimmed,
        };

        if without_proto.is_empty() {
            return Err(DatabaseError::InvalidConfiguration {
                message: "database server cannot be empty".to_string(),
            });
        }

        if let Some((host, port)) = without_proto.split_once(',') {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| DatabaseError::InvalidConfiguration {
                    message: format!("invalid port in server '{}'", server),
                })?;
            return Ok(Self {
                host: host.trim().to_string(),
                port: Some(port),
                instance: None,
            });
        }

        if let Some((host, instance)) = without_proto.split_once('\\') {
            return Ok(Self {
                host: host.trim().to_string(),
                port: None,
                instance: Some(instance.trim().to_string()),
            });
        }

        Ok(Self {
            host: without_proto.to_string(),
            port: None,
            instance: None,
        })
    }
}

/// Connection settings for one SQL Server database.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// ODBC driver name; only rendered into [`DatabaseConfig::connection_string`]
    pub driver: String,
    pub server: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub trust_server_certificate: bool,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn new(
        driver: impl Into<String>,
        server: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            server: server.into(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
            trust_server_certificate: true,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Build from `BIZTOOLS_DB_*` settings; server, database, user and password are required.
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, DatabaseError> {
        let db = &cfg.database;
        let required = |value: &Option<String>, key: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| DatabaseError::InvalidConfiguration {
                    message: format!("{} is not set; set BIZTOOLS_{}", key, key),
                })
        };

        Ok(Self {
            driver: db.driver.clone(),
            server: required(&db.server, "DB_SERVER")?,
            database: required(&db.database, "DB_DATABASE")?,
            user: required(&db.user, "DB_USER")?,
            password: required(&db.password, "DB_PASS")?,
            trust_server_certificate: db.trust_server_certificate,
            max_connections: db.max_connections,
            acquire_timeout: Duration::from_millis(db.acquire_timeout_ms),
        })
    }

    /// ODBC-style connection string.
    pub fn connection_string(&self) -> String {
        self.render_connection_string(&self.password)
    }

    /// Connection string with the password masked, safe to log.
    pub fn redacted_connection_string(&self) -> String {
        self.render_connection_string("[REDACTED]")
    }

    fn render_connection_string(&self, password: &str) -> String {
        let mut rendered = format!(
            "Driver={};Server={};Database={};UID={};PWD={};",
            self.driver, self.server, self.database, self.user, password
        );
        if self.trust_server_certificate {
            rendered.push_str("TrustServerCertificate=yes;");
        }
        rendered
    }

    /// Native TDS client configuration for these settings.
    pub fn tds_config(&self) -> Result<Config, DatabaseError> {
        let address = ServerAddress::parse(&self.server)?;

        let mut config = Config::new();
        config.host(&address.host);
        match (&address.instance, address.port) {
            (_, Some(port)) => config.port(port),
            (Some(instance), None) => config.instance_name(instance),
            (None, None) => config.port(DEFAULT_PORT),
        }
        config.database(&self.database);
        config.authentication(AuthMethod::sql_server(&self.user, &self.password));
        config.encryption(EncryptionLevel::Required);
        if self.trust_server_certificate {
            config.trust_cert();
        }
        config.application_name("biztools");
        Ok(config)
    }

    pub(crate) fn uses_named_instance(&self) -> bool {
        ServerAddress::parse(&self.server)
            .map(|a| a.instance.is_some() && a.port.is_none())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatabaseConfig {
        DatabaseConfig::new(
            "ODBC Driver 18 for SQL Server",
            "db.example.com,1444",
            "sales",
            "report_user",
            "s3cret!",
        )
    }

    #[test]
    fn test_connection_string_format() {
        assert_eq!(
            sample().connection_string(),
            "Driver=ODBC Driver 18 for SQL Server;Server=db.example.com,1444;Database=sales;UID=report_user;PWD=s3cret!;TrustServerCertificate=yes;"
        );
    }

    #[test]
    fn test_redacted_connection_string_hides_password() {
        let redacted = sample().redacted_connection_string();
        assert!(redacted.contains("PWD=[REDACTED];"));
        assert!(!redacted.contains("s3cret!"));
        assert!(!format!("{:?}", sample()).contains("s3cret!"));
    }

    #[test]
    fn test_server_address_forms() {
        assert_eq!(
            ServerAddress::parse("db.example.com").unwrap(),
            ServerAddress {
                host: "db.example.com".to_string(),
                port: None,
                instance: None
            }
        );
        assert_eq!(
            ServerAddress::parse("tcp:db.example.com, 1444").unwrap().port,
            Some(1444)
        );
        let named = ServerAddress::parse(r"SQLHOST\REPORTING").unwrap();
        assert_eq!(named.host, "SQLHOST");
        assert_eq!(named.instance.as_deref(), Some("REPORTING"));

        assert!(ServerAddress::parse("db,notaport").is_err());
        assert!(ServerAddress::parse("  ").is_err());
    }

    #[test]
    fn test_tds_config_address() {
        assert_eq!(sample().tds_config().unwrap().get_addr(), "db.example.com:1444");

        let mut default_port = sample();
        default_port.server = "db.example.com".to_string();
        assert_eq!(default_port.tds_config().unwrap().get_addr(), "db.example.com:1433");
        assert!(!default_port.uses_named_instance());

        let mut named = sample();
        named.server = r"SQLHOST\REPORTING".to_string();
        assert!(named.uses_named_instance());
    }

    #[test]
    fn test_from_app_config_requires_server() {
        let cfg = AppConfig::default();
        match DatabaseConfig::from_app_config(&cfg) {
            Err(DatabaseError::InvalidConfiguration { message }) => {
                assert!(message.contains("DB_SERVER"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
