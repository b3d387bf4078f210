//! TLS configuration for HTTPS serving

use axum_server::tls_rustls::RustlsConfig;
use std::path::Path;
use tracing::info;

/// Create RustlsConfig from certificate files
pub async fn create_rustls_config_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<RustlsConfig, Box<dyn std::error::Error + Send + Sync>> {
    let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    info!("Loaded TLS certificate from {:?}", cert_path);
    Ok(config)
}
