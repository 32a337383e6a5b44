use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio_rustls::TlsAcceptor;

use crate::auth::{ArcAuthStore, DummyAuthStore};
use crate::connection::{AnyStream, Connection};
use crate::imap::flow::Encryption;
use crate::imap::session::Session;
use crate::mail::ArcMailstore;

/// The listener used when none is configured.
pub const DEFAULT_LISTENER: &str = "0.0.0.0:143";

const DEFAULT_MAX_CLIENTS: usize = 8;

struct ListenerConfig {
    addr: String,
    encryption: Encryption,
    acceptor: Option<TlsAcceptor>,
}

/// Server under construction. The option set is closed: listeners, the
/// client cap, one mailstore and one authstore.
pub struct Server {
    listeners: Vec<ListenerConfig>,
    max_clients: usize,
    store: Option<ArcMailstore>,
    auth: Option<ArcAuthStore>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            max_clients: DEFAULT_MAX_CLIENTS,
            store: None,
            auth: None,
        }
    }

    /// Adds a cleartext listener.
    pub fn listen(mut self, addr: &str) -> Self {
        self.listeners.push(ListenerConfig {
            addr: addr.to_string(),
            encryption: Encryption::None,
            acceptor: None,
        });
        self
    }

    /// Adds a cleartext listener that accepts STARTTLS upgrades with the
    /// given certificate chain and key.
    pub fn listen_starttls(mut self, addr: &str, certs: &Path, key: &Path) -> Result<Self> {
        let acceptor = load_tls(certs, key)?;
        self.listeners.push(ListenerConfig {
            addr: addr.to_string(),
            encryption: Encryption::StartTls,
            acceptor: Some(acceptor),
        });
        Ok(self)
    }

    /// Adds a TLS-from-the-first-byte listener.
    pub fn listen_tls(mut self, addr: &str, certs: &Path, key: &Path) -> Result<Self> {
        let acceptor = load_tls(certs, key)?;
        self.listeners.push(ListenerConfig {
            addr: addr.to_string(),
            encryption: Encryption::Tls,
            acceptor: Some(acceptor),
        });
        Ok(self)
    }

    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn store(mut self, store: ArcMailstore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auth(mut self, auth: ArcAuthStore) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Binds every listener. The bound server reports its local addresses,
    /// which matters when a listener was configured on port 0.
    pub async fn bind(mut self) -> Result<BoundServer> {
        if self.listeners.is_empty() {
            self = self.listen(DEFAULT_LISTENER);
        }
        let store = self
            .store
            .ok_or_else(|| anyhow!("can't run without a mailstore"))?;
        let auth = self.auth.unwrap_or_else(|| Arc::new(DummyAuthStore));

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for config in self.listeners {
            let tcp = TcpListener::bind(&config.addr)
                .await
                .with_context(|| format!("cannot listen on {}", config.addr))?;
            listeners.push(BoundListener {
                tcp,
                encryption: config.encryption,
                acceptor: config.acceptor,
            });
        }

        Ok(BoundServer {
            listeners,
            clients: Arc::new(Semaphore::new(self.max_clients)),
            store,
            auth,
        })
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

struct BoundListener {
    tcp: TcpListener,
    encryption: Encryption,
    acceptor: Option<TlsAcceptor>,
}

/// A server with its sockets bound, ready to accept.
pub struct BoundServer {
    listeners: Vec<BoundListener>,
    clients: Arc<Semaphore>,
    store: ArcMailstore,
    auth: ArcAuthStore,
}

impl BoundServer {
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.tcp.local_addr().ok())
            .collect()
    }

    /// Accepts connections until `must_exit` flips, then drains the
    /// in-flight sessions.
    pub async fn run(self, must_exit: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = FuturesUnordered::new();
        for (id, listener) in self.listeners.into_iter().enumerate() {
            tasks.push(tokio::spawn(run_listener(
                id,
                listener,
                self.store.clone(),
                self.auth.clone(),
                self.clients.clone(),
                must_exit.clone(),
            )));
        }

        while let Some(finished) = tasks.next().await {
            if let Err(e) = finished? {
                tracing::error!(error = %e, "listener failed");
            }
        }
        Ok(())
    }
}

async fn run_listener(
    id: usize,
    listener: BoundListener,
    store: ArcMailstore,
    auth: ArcAuthStore,
    clients: Arc<Semaphore>,
    mut must_exit: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.tcp.local_addr()?;
    tracing::info!(listener = id, addr = %local_addr, "IMAP server listening");

    let mut connections = FuturesUnordered::new();
    let mut client_number = 0u64;

    while !*must_exit.borrow() {
        let wait_conn_finished = async {
            if connections.is_empty() {
                futures::future::pending().await
            } else {
                connections.next().await
            }
        };
        let (socket, remote_addr) = tokio::select! {
            accepted = listener.tcp.accept() => accepted?,
            _ = wait_conn_finished => continue,
            _ = must_exit.changed() => continue,
        };

        let permit = match clients.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(addr = %remote_addr, "too many clients, refusing connection");
                continue;
            }
        };

        client_number += 1;
        let session_id = format!("{}/{}", id, client_number);
        tracing::info!(session = %session_id, addr = %remote_addr, "accepted connection");

        // TLS listeners negotiate before the greeting; STARTTLS listeners
        // hand the acceptor to the connection for a later upgrade.
        let stream = match (listener.encryption, listener.acceptor.clone()) {
            (Encryption::Tls, Some(acceptor)) => match acceptor.accept(socket).await {
                Ok(tls) => AnyStream::Tls(Box::new(tls)),
                Err(e) => {
                    tracing::error!(addr = %remote_addr, error = %e, "TLS negotiation failed");
                    continue;
                }
            },
            _ => AnyStream::Plain(socket),
        };

        let session = Session::new(
            session_id.clone(),
            listener.encryption,
            store.clone(),
            auth.clone(),
        );
        let connection = Connection::new(session_id.clone(), session, listener.acceptor.clone());
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = connection.handle(stream).await {
                tracing::error!(session = %session_id, error = %e, "connection error");
            }
        });
        connections.push(handle);
    }

    tracing::info!(listener = id, "shutting down, draining remaining connections");
    while connections.next().await.is_some() {}
    Ok(())
}

fn load_tls(certs_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let loaded_certs = certs(&mut BufReader::new(
        File::open(certs_path).with_context(|| format!("opening {}", certs_path.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut BufReader::new(
        File::open(key_path).with_context(|| format!("opening {}", key_path.display()))?,
    ))?;
    let loaded_key = match loaded_key {
        Some(key) => key,
        None => bail!("no private key in {}", key_path.display()),
    };

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
