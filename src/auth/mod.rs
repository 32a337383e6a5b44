use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// The authentication backend contract.
///
/// `authenticate` is the only operation the protocol core uses; the rest
/// exist for user management tooling.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Checks the given plaintext credentials.
    async fn authenticate(&self, username: &str, plain_password: &str) -> Result<bool>;

    async fn create_user(&self, username: &str, plain_password: &str) -> Result<()>;

    async fn reset_password(&self, username: &str, plain_password: &str) -> Result<()>;

    async fn list_users(&self) -> Result<Vec<String>>;

    async fn delete_user(&self, username: &str) -> Result<()>;
}

pub type ArcAuthStore = Arc<dyn AuthStore>;

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Argon2 error: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Argon2 hash of the user's password.
    pub password: String,
}

type UserTable = HashMap<String, UserEntry>;

/// An AuthStore over a TOML user table on disk.
pub struct StaticAuthStore {
    path: PathBuf,
    users: RwLock<UserTable>,
}

impl StaticAuthStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let raw = tokio::fs::read_to_string(&path).await?;
        let users: UserTable = toml::from_str(&raw)?;
        tracing::info!(path = %path.display(), count = users.len(), "users loaded");
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    /// An empty store that will create its file on first write.
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            users: RwLock::new(UserTable::new()),
        }
    }

    async fn persist(&self, users: &UserTable) -> Result<()> {
        let serialized = toml::to_string(users)?;
        tokio::fs::write(&self.path, serialized).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthStore for StaticAuthStore {
    async fn authenticate(&self, username: &str, plain_password: &str) -> Result<bool> {
        let users = self.users.read().await;
        let entry = match users.get(username) {
            Some(e) => e.clone(),
            None => {
                tracing::debug!(user = %username, "unknown user");
                return Ok(false);
            }
        };
        drop(users);

        // The hash check is deliberately slow; don't hold the table lock.
        verify_password(plain_password, &entry.password)
    }

    async fn create_user(&self, username: &str, plain_password: &str) -> Result<()> {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            bail!("user {} already exists", username);
        }
        let hash = hash_password(plain_password)?;
        users.insert(username.to_string(), UserEntry { password: hash });
        self.persist(&users).await
    }

    async fn reset_password(&self, username: &str, plain_password: &str) -> Result<()> {
        let mut users = self.users.write().await;
        let entry = users
            .get_mut(username)
            .ok_or_else(|| anyhow!("user {} does not exist", username))?;
        entry.password = hash_password(plain_password)?;
        self.persist(&users).await
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        let users = self.users.read().await;
        let mut names: Vec<String> = users.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let mut users = self.users.write().await;
        if users.remove(username).is_none() {
            bail!("user {} does not exist", username);
        }
        self.persist(&users).await
    }
}

/// Accepts any credentials; stands in when no auth backend is configured.
pub struct DummyAuthStore;

#[async_trait]
impl AuthStore for DummyAuthStore {
    async fn authenticate(&self, _username: &str, _plain_password: &str) -> Result<bool> {
        Ok(true)
    }

    async fn create_user(&self, _username: &str, _plain_password: &str) -> Result<()> {
        Ok(())
    }

    async fn reset_password(&self, _username: &str, _plain_password: &str) -> Result<()> {
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn delete_user(&self, _username: &str) -> Result<()> {
        Ok(())
    }
}
