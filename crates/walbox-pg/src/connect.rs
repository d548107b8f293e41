//! Shared Postgres connection utilities with TLS support.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio_postgres::config::SslMode as PgSslMode;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use walbox_config::{ConnectionParams, SslMode};

use crate::error::{PgError, PgResult};

pub(crate) const APPLICATION_NAME: &str = "walbox";

/// Connect to Postgres with TLS settings taken from the resolved sslmode.
/// Spawns the connection task and returns only the client.
pub async fn connect_postgres(params: &ConnectionParams, connect_timeout: Duration) -> PgResult<Client> {
    let config = pg_config(params, connect_timeout);

    if params.ssl_mode.attempts_tls() {
        let (client, connection) = config
            .connect(tls_connector()?)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    } else {
        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    }
}

fn pg_config(params: &ConnectionParams, connect_timeout: Duration) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&params.host)
        .port(params.port)
        .dbname(&params.dbname)
        .user(&params.user)
        .application_name(APPLICATION_NAME)
        .connect_timeout(connect_timeout)
        .ssl_mode(match params.ssl_mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
        });

    if let Some(password) = &params.password {
        config.password(password);
    }

    config
}

/// Build the rustls connector used by both the storage and replication connections.
pub(crate) fn tls_connector() -> PgResult<MakeRustlsConnect> {
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_certs())
        .with_no_client_auth();

    Ok(MakeRustlsConnect::new(config))
}

/// Get root certificates from webpki-roots.
fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}
