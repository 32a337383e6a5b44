use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use missive::auth::StaticAuthStore;
use missive::config::{read_config, EncryptionLevel};
use missive::mail::notmuch::NotmuchMailstore;
use missive::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("missive=info")),
        )
        .init();

    let config_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "missive.toml".to_string());
    let config = read_config(PathBuf::from(&config_file))
        .with_context(|| format!("reading configuration from {}", config_file))?;

    let mut server = Server::new()
        .max_clients(config.max_clients)
        .store(Arc::new(NotmuchMailstore::new(config.store.maildir.clone())));

    if let Some(auth) = &config.auth {
        let store = StaticAuthStore::open(auth.user_list.clone()).await?;
        server = server.auth(Arc::new(store));
    }

    for listener in &config.listeners {
        server = match listener.encryption {
            EncryptionLevel::None => server.listen(&listener.bind_addr),
            EncryptionLevel::Starttls | EncryptionLevel::Tls => {
                let (Some(certs), Some(key)) = (&listener.certs, &listener.key) else {
                    bail!(
                        "listener {} needs certs and key for {:?}",
                        listener.bind_addr,
                        listener.encryption
                    );
                };
                if listener.encryption == EncryptionLevel::Starttls {
                    server.listen_starttls(&listener.bind_addr, certs, key)?
                } else {
                    server.listen_tls(&listener.bind_addr, certs, key)?
                }
            }
        };
    }

    let bound = server.bind().await?;

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            let _ = exit_tx.send(true);
        }
    });

    bound.run(exit_rx).await
}
