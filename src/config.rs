//! SMC connection settings
//!
//! Command-line flags and `SMC_*` environment variables win over the
//! `[smc]` section of `~/.smcrc`, the file smc-python reads.

use crate::cli::SmcArgs;
use crate::error::SmcError;
use ::config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SMC_PORT: &str = "8082";
pub const DEFAULT_SMC_TIMEOUT: u64 = 30;

/// `[smc]` section of an smcrc file
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SmcRc {
    pub smc_address: Option<String>,
    pub smc_apikey: Option<String>,
    pub api_version: Option<String>,
    pub smc_port: Option<String>,
    pub smc_ssl: Option<String>,
    pub verify_ssl: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub timeout: Option<String>,
    pub domain: Option<String>,
}

impl SmcRc {
    /// Full URL built from address, port and ssl flag
    fn url(&self) -> Option<String> {
        let address = self.smc_address.as_deref()?.trim();
        if address.is_empty() {
            return None;
        }
        if address.starts_with("http://") || address.starts_with("https://") {
            return Some(address.to_string());
        }

        let scheme = if self.smc_ssl.as_deref().map(parse_bool).unwrap_or(false) {
            "https"
        } else {
            "http"
        };
        let port = self.smc_port.as_deref().unwrap_or(DEFAULT_SMC_PORT);
        Some(format!("{}://{}:{}", scheme, address, port))
    }
}

/// Read the `[smc]` section of `path`. A missing file or section is not an error.
pub fn load_smcrc(path: &Path) -> Result<Option<SmcRc>, SmcError> {
    if !path.exists() {
        return Ok(None);
    }

    let cfg = Config::builder()
        .add_source(File::from(path).format(FileFormat::Ini))
        .build()?;

    match cfg.get::<SmcRc>("smc") {
        Ok(rc) => Ok(Some(rc)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn default_smcrc() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".smcrc"))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmcSettings {
    pub address: String,
    pub api_key: String,
    pub api_version: Option<String>,
    pub domain: Option<String>,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub ca_cert: Option<PathBuf>,
}

impl SmcSettings {
    /// Resolve settings from flags/environment and the smcrc file
    pub fn resolve(args: &SmcArgs) -> Result<Self, SmcError> {
        let rc = match args.config.clone().or_else(default_smcrc) {
            Some(path) => {
                let rc = load_smcrc(&path)?;
                if rc.is_some() {
                    tracing::debug!("Loaded SMC settings from {}", path.display());
                }
                rc
            }
            None => None,
        };
        Self::from_sources(args, rc.unwrap_or_default())
    }

    pub fn from_sources(args: &SmcArgs, rc: SmcRc) -> Result<Self, SmcError> {
        let address = args
            .address
            .clone()
            .filter(|a| !a.trim().is_empty())
            .or_else(|| rc.url())
            .ok_or_else(|| {
                SmcError::Config("SMC address not set (SMC_ADDRESS or smc_address in ~/.smcrc)".into())
            })?;

        let api_key = args
            .api_key
            .clone()
            .or_else(|| rc.smc_apikey.clone())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                SmcError::Config("SMC API key not set (SMC_API_KEY or smc_apikey in ~/.smcrc)".into())
            })?;

        let timeout = match (args.timeout, rc.timeout.as_deref()) {
            (Some(secs), _) => secs,
            (None, Some(raw)) => raw
                .trim()
                .parse()
                .map_err(|_| SmcError::Config(format!("invalid timeout in smcrc: {}", raw)))?,
            (None, None) => DEFAULT_SMC_TIMEOUT,
        };

        let verify_ssl = !args.insecure && rc.verify_ssl.as_deref().map(parse_bool).unwrap_or(true);

        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            api_key,
            api_version: args.api_version.clone().or(rc.api_version).filter(|v| !v.is_empty()),
            domain: args.domain.clone().or(rc.domain).filter(|d| !d.is_empty()),
            timeout: Duration::from_secs(timeout),
            verify_ssl,
            ca_cert: args
                .client_cert
                .clone()
                .or_else(|| rc.ssl_cert_file.map(PathBuf::from)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rc(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn smcrc_section_is_loaded() {
        let file = write_rc(
            "[smc]\nsmc_address=192.168.1.10\nsmc_apikey=secret\napi_version=6.10\nsmc_port=8085\nsmc_ssl=True\nverify_ssl=False\ntimeout=45\n",
        );

        let rc = load_smcrc(file.path()).unwrap().unwrap();
        let settings = SmcSettings::from_sources(&SmcArgs::default(), rc).unwrap();

        assert_eq!(settings.address, "https://192.168.1.10:8085");
        assert_eq!(settings.api_key, "secret");
        assert_eq!(settings.api_version.as_deref(), Some("6.10"));
        assert_eq!(settings.timeout, Duration::from_secs(45));
        assert!(!settings.verify_ssl);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_smcrc(&dir.path().join(".smcrc")).unwrap().is_none());
    }

    #[test]
    fn flags_override_smcrc() {
        let rc = SmcRc {
            smc_address: Some("10.0.0.5".into()),
            smc_apikey: Some("from-file".into()),
            timeout: Some("10".into()),
            ..Default::default()
        };
        let args = SmcArgs {
            address: Some("http://smc.example:8082/".into()),
            api_key: Some("from-env".into()),
            timeout: Some(5),
            insecure: true,
            ..Default::default()
        };

        let settings = SmcSettings::from_sources(&args, rc).unwrap();

        assert_eq!(settings.address, "http://smc.example:8082");
        assert_eq!(settings.api_key, "from-env");
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert!(!settings.verify_ssl);
    }

    #[test]
    fn plain_address_defaults_to_http_8082() {
        let rc = SmcRc {
            smc_address: Some("10.0.0.5".into()),
            smc_apikey: Some("k".into()),
            ..Default::default()
        };

        let settings = SmcSettings::from_sources(&SmcArgs::default(), rc).unwrap();

        assert_eq!(settings.address, "http://10.0.0.5:8082");
        assert_eq!(settings.timeout, Duration::from_secs(DEFAULT_SMC_TIMEOUT));
        assert!(settings.verify_ssl);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let args = SmcArgs {
            address: Some("http://smc:8082".into()),
            ..Default::default()
        };

        let err = SmcSettings::from_sources(&args, SmcRc::default()).unwrap_err();
        assert!(matches!(err, SmcError::Config(_)));
    }
}
