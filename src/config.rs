use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default)]
    pub listeners: Vec<ListenerEntry>,

    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenerEntry {
    pub bind_addr: String,

    #[serde(default)]
    pub encryption: EncryptionLevel,

    /// PEM certificate chain; required unless encryption is "none".
    pub certs: Option<PathBuf>,
    /// PEM private key; required unless encryption is "none".
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionLevel {
    #[default]
    None,
    Starttls,
    Tls,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    /// TOML table of `username = { password = "<argon2 hash>" }`.
    pub user_list: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoreConfig {
    /// Folder handed to `notmuch insert`; falls back to NOTMUCH_MAILDIR.
    pub maildir: Option<String>,
}

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_max_clients() -> usize {
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [[listeners]]
            bind_addr = "[::]:143"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].encryption, EncryptionLevel::None);
        assert!(config.store.maildir.is_none());
    }

    #[test]
    fn starttls_listener_parses() {
        let config: Config = toml::from_str(
            r#"
            max_clients = 64

            [[listeners]]
            bind_addr = "[::]:1993"
            encryption = "starttls"
            certs = "/etc/missive/cert.pem"
            key = "/etc/missive/key.pem"

            [auth]
            user_list = "/etc/missive/users.toml"

            [store]
            maildir = "/var/mail/maildir"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_clients, 64);
        assert_eq!(config.listeners[0].encryption, EncryptionLevel::Starttls);
        assert!(config.auth.is_some());
        assert_eq!(config.store.maildir.as_deref(), Some("/var/mail/maildir"));
    }
}
