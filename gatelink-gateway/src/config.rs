//! Gateway configuration and credential loading
//!
//! Config lives in `$GATELINK_HOME/config.json` (default `~/.gatelink`).
//! A missing file means defaults; relative credential paths resolve
//! against the directory holding the config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gatelink_crypto::IdentityKeys;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway identity certificate (DER or PEM)
    pub certificate: PathBuf,
    /// Gateway identity private key (SEC1 or PKCS#8, PEM or DER)
    pub private_key: PathBuf,
    /// Pinned root CA the edge certificate must chain to
    pub root_ca: PathBuf,
    pub command_timeout_ms: u64,
    pub handshake_chunk_size: usize,
    /// MTU assumed until the device reports its own
    pub default_mtu: usize,
    /// Re-dispatch attempts for a failed or timed out command
    pub retry_limit: u32,
    pub auto_reconnect: bool,
    /// Substring of the advertised name or address to connect to
    pub device_name_filter: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("gateway_cert.der"),
            private_key: PathBuf::from("gateway_key.pem"),
            root_ca: PathBuf::from("root_ca.der"),
            command_timeout_ms: 5000,
            handshake_chunk_size: gatelink_proto::HANDSHAKE_CHUNK_SIZE,
            default_mtu: 23,
            retry_limit: 0,
            auto_reconnect: false,
            device_name_filter: None,
        }
    }
}

impl GatewayConfig {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => gatelink_home()?.join("config.json"),
        };

        if !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            let mut config = Self::default();
            if let Some(dir) = path.parent() {
                config.resolve_paths(dir);
            }
            return Ok(config);
        }

        let data = std::fs::read_to_string(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&data).map_err(|source| Error::Config {
            path: path.clone(),
            source,
        })?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.certificate, &mut self.private_key, &mut self.root_ca] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// `GATELINK_HOME`, or `~/.gatelink`
pub fn gatelink_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("GATELINK_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".gatelink"))
        .ok_or(Error::NoHome)
}

/// Everything the gateway presents or pins during the handshake
#[derive(Debug)]
pub struct Credentials {
    pub identity: IdentityKeys,
    /// DER certificate sent at stage 1
    pub certificate: Vec<u8>,
    /// DER root CA used to check the edge certificate
    pub root_ca: Vec<u8>,
}

impl Credentials {
    pub fn new(identity: IdentityKeys, certificate: Vec<u8>, root_ca: Vec<u8>) -> Self {
        Self {
            identity,
            certificate,
            root_ca,
        }
    }

    pub fn load(config: &GatewayConfig) -> Result<Self> {
        let identity = IdentityKeys::load(&read(&config.private_key)?)?;
        let certificate = to_der(read(&config.certificate)?, &config.certificate)?;
        let root_ca = to_der(read(&config.root_ca)?, &config.root_ca)?;
        log::info!(
            "loaded gateway certificate ({} bytes) and root CA ({} bytes)",
            certificate.len(),
            root_ca.len()
        );
        Ok(Self::new(identity, certificate, root_ca))
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// The edge expects DER on the wire, so PEM files are converted on load
fn to_der(bytes: Vec<u8>, path: &Path) -> Result<Vec<u8>> {
    if !bytes.starts_with(b"-----BEGIN") {
        return Ok(bytes);
    }
    let cert = gatelink_crypto::cert::parse(&bytes)
        .map_err(gatelink_crypto::CryptoError::from)?;
    log::debug!("converted PEM certificate {} to DER", path.display());
    gatelink_crypto::cert::to_der(&cert).map_err(Error::from)
}
