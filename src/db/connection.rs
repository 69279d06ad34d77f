use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{NoTls, Socket};
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in Prefer/Require modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a PEM bundle of CA certificates.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    4
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::from("Local PostgreSQL"),
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedConnections {
    #[serde(default)]
    connections: Vec<ConnectionConfig>,
}

pub fn connections_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nlsql")
        .join("connections.toml")
}

pub fn load_saved_connections() -> Result<Vec<ConnectionConfig>> {
    let path = connections_path();
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_saved_connections(&content).with_context(|| format!("Invalid {}", path.display()))
}

fn parse_saved_connections(content: &str) -> Result<Vec<ConnectionConfig>> {
    let saved: SavedConnections = toml::from_str(content)?;
    Ok(saved.connections)
}

/// Look up a saved connection by name.
pub fn find_saved_connection(name: &str) -> Result<ConnectionConfig> {
    load_saved_connections()?
        .into_iter()
        .find(|c| c.name == name)
        .with_context(|| {
            format!(
                "No saved connection named '{}' in {}",
                name,
                connections_path().display()
            )
        })
}

/// Build a connection pool and check that the server answers.
pub async fn create_client_pool(config: &ConnectionConfig) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = config
        .connection_string()
        .parse()
        .context("Invalid connection parameters")?;

    let pool = match config.ssl_mode {
        SslMode::Disable => build_pool(pg_config, NoTls, config.pool_size)?,
        SslMode::Prefer | SslMode::Require => {
            let tls = build_tls_connector(config, false)?;
            build_pool(pg_config, tls, config.pool_size)?
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let tls = build_tls_connector(config, true)?;
            build_pool(pg_config, tls, config.pool_size)?
        }
    };

    let client = tokio::time::timeout(CONNECT_TIMEOUT, pool.get())
        .await
        .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
        .with_context(|| format!("Failed to connect to {}", config.display_string()))?;
    drop(client);

    info!(server = %config.display_string(), size = config.pool_size, "connection pool ready");
    Ok(pool)
}

fn build_pool<T>(pg_config: tokio_postgres::Config, tls: T, size: usize) -> Result<Pool>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let manager = Manager::from_config(
        pg_config,
        tls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(size.max(1))
        .build()
        .context("Failed to build connection pool")
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `strict_verify` forces certificate verification (verify-ca/verify-full).
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for pem in split_pem_certificates(&ca_data)? {
            let cert = native_tls::Certificate::from_pem(pem.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into its individual certificate blocks.
fn split_pem_certificates(pem_data: &[u8]) -> Result<Vec<String>> {
    let pem_str =
        std::str::from_utf8(pem_data).context("CA certificate file is not valid UTF-8")?;

    let mut certs = Vec::new();
    let mut current: Option<String> = None;
    for line in pem_str.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            current = Some(format!("{line}\n"));
        } else if line == "-----END CERTIFICATE-----" {
            if let Some(mut block) = current.take() {
                block.push_str(line);
                block.push('\n');
                certs.push(block);
            }
        } else if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }

    if certs.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }
    debug!(count = certs.len(), "loaded CA certificates");
    Ok(certs)
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
