//! Signer server and provisioning client configuration.
//!
//! # Format (TOML)
//!
//! ```toml
//! cacert = "tls/ca.pem"
//! servercert = "tls/server.pem"
//! serverkey = "tls/server.key"
//! listen = "0.0.0.0:1337"
//! vendorapphash = "f8234089..."
//! mode = "sigsum-deferred"   # or "signature", "sigsum"
//! ```
//!
//! A client uses `clientcert`, `clientkey` and `server` instead. Relative
//! paths are taken from the directory of the config file.

use crate::appbins::AppHash;
use crate::error::AttestError;
use crate::hexutil::decode_array;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What the signer produces for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignerMode {
    /// Vendor ed25519 signature
    #[default]
    Signature,
    /// Sigsum proof, logged while the client waits
    Sigsum,
    /// Sigsum submission for the batch processor
    SigsumDeferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub cacert: Option<PathBuf>,
    pub servercert: Option<PathBuf>,
    pub serverkey: Option<PathBuf>,
    pub clientcert: Option<PathBuf>,
    pub clientkey: Option<PathBuf>,
    pub listen: Option<String>,
    pub server: Option<String>,
    pub vendorapphash: Option<String>,
    pub signatures_dir: Option<PathBuf>,
    pub submissions_dir: Option<PathBuf>,
    pub log_url: Option<String>,
    pub mode: Option<SignerMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub cacert: PathBuf,
    pub servercert: PathBuf,
    pub serverkey: PathBuf,
    pub listen: String,
    pub vendor_app_hash: AppHash,
    pub signatures_dir: PathBuf,
    pub submissions_dir: PathBuf,
    pub log_url: Option<String>,
    pub mode: SignerMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub cacert: PathBuf,
    pub clientcert: PathBuf,
    pub clientkey: PathBuf,
    pub server: String,
}

fn required<T: Clone>(value: &Option<T>, key: &str) -> Result<T, AttestError> {
    value
        .clone()
        .ok_or_else(|| AttestError::ConfigError(format!("missing '{}'", key)))
}

fn forbidden(set: &[(&str, bool)], role: &str) -> Result<(), AttestError> {
    let keys: Vec<&str> = set.iter().filter(|(_, s)| *s).map(|(k, _)| *k).collect();
    if !keys.is_empty() {
        return Err(AttestError::ConfigError(format!(
            "{} not used by the {}",
            keys.join(", "),
            role
        )));
    }
    Ok(())
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, AttestError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AttestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AttestError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for p in [
            &mut self.cacert,
            &mut self.servercert,
            &mut self.serverkey,
            &mut self.clientcert,
            &mut self.clientkey,
            &mut self.signatures_dir,
            &mut self.submissions_dir,
        ]
        .into_iter()
        .flatten()
        {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    pub fn for_server(&self) -> Result<ServerSettings, AttestError> {
        forbidden(
            &[
                ("clientcert", self.clientcert.is_some()),
                ("clientkey", self.clientkey.is_some()),
                ("server", self.server.is_some()),
            ],
            "signer server",
        )?;
        let mode = self.mode.unwrap_or_default();
        if mode == SignerMode::Signature && self.log_url.is_some() {
            return Err(AttestError::ConfigError(
                "log_url needs a Sigsum mode".to_string(),
            ));
        }
        Ok(ServerSettings {
            cacert: required(&self.cacert, "cacert")?,
            servercert: required(&self.servercert, "servercert")?,
            serverkey: required(&self.serverkey, "serverkey")?,
            listen: required(&self.listen, "listen")?,
            vendor_app_hash: decode_array(&required(&self.vendorapphash, "vendorapphash")?, "vendor app digest")?,
            signatures_dir: self
                .signatures_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("signatures")),
            submissions_dir: self
                .submissions_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("submissions")),
            log_url: self.log_url.clone(),
            mode,
        })
    }

    pub fn for_client(&self) -> Result<ClientSettings, AttestError> {
        forbidden(
            &[
                ("servercert", self.servercert.is_some()),
                ("serverkey", self.serverkey.is_some()),
                ("listen", self.listen.is_some()),
                ("vendorapphash", self.vendorapphash.is_some()),
                ("signatures_dir", self.signatures_dir.is_some()),
                ("submissions_dir", self.submissions_dir.is_some()),
                ("log_url", self.log_url.is_some()),
                ("mode", self.mode.is_some()),
            ],
            "provisioning client",
        )?;
        Ok(ClientSettings {
            cacert: required(&self.cacert, "cacert")?,
            clientcert: required(&self.clientcert, "clientcert")?,
            clientkey: required(&self.clientkey, "clientkey")?,
            server: required(&self.server, "server")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = r#"
cacert = "tls/ca.pem"
servercert = "tls/server.pem"
serverkey = "/etc/devattest/server.key"
listen = "127.0.0.1:1337"
vendorapphash = "f8234089ed650f839da3ae92d611295a2a2ea83a2d765e7ba5009a8273b9b02503c78dd7a1bf25f9fc5f91832595ac9a757e477404870a47f99b4ed3a90f4d5b"
mode = "sigsum-deferred"
"#;

    const CLIENT: &str = r#"
cacert = "ca.pem"
clientcert = "client.pem"
clientkey = "client.key"
server = "localhost:1337"
"#;

    #[test]
    fn test_server() {
        let mut config = Config::from_toml(SERVER).unwrap();
        config.resolve_paths(Path::new("/srv/signer"));
        let s = config.for_server().unwrap();
        assert_eq!(s.mode, SignerMode::SigsumDeferred);
        assert_eq!(s.cacert, PathBuf::from("/srv/signer/tls/ca.pem"));
        assert_eq!(s.serverkey, PathBuf::from("/etc/devattest/server.key"));
        assert_eq!(s.signatures_dir, PathBuf::from("signatures"));
        assert_eq!(s.vendor_app_hash[0], 0xf8);
        assert!(config.for_client().is_err());
    }

    #[test]
    fn test_client() {
        let config = Config::from_toml(CLIENT).unwrap();
        let c = config.for_client().unwrap();
        assert_eq!(c.server, "localhost:1337");
        assert!(config.for_server().is_err());
    }

    #[test]
    fn test_rejected() {
        assert!(Config::from_toml("cacert = \"a\"\nbogus = 1\n").is_err());
        assert!(Config::from_toml("mode = \"fast\"\n").is_err());

        let config = Config::from_toml(&format!("{CLIENT}mode = \"sigsum\"\n")).unwrap();
        let err = config.for_client().unwrap_err();
        assert!(err.to_string().contains("mode"));

        let config = Config::from_toml(&SERVER.replace("mode = \"sigsum-deferred\"", "log_url = \"https://log\"")).unwrap();
        assert!(config.for_server().is_err());

        let config = Config::from_toml(&SERVER.replace("listen", "# listen")).unwrap();
        assert!(config.for_server().unwrap_err().to_string().contains("listen"));
    }
}
