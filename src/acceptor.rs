//! TCP accept loop: one task per connection, graceful shutdown on Ctrl-C
//! that stops accepting and closes out every live session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use crate::server::ServerSession;

/// Listens on `bind_addr`, spawning one task per accepted connection, until
/// Ctrl-C is received. Each session is registered by id so that on shutdown
/// the acceptor can abort every still-running session rather than merely
/// wait on it.
pub struct Acceptor {
    listener: TcpListener,
    sessions: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_id: AtomicU64,
}

impl Acceptor {
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        info!("listening on {bind_addr}");
        Ok(Self {
            listener,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until Ctrl-C, spawning a `ServerSession` per
    /// connection and racing the accept future against the signal so a
    /// pending `accept()` never blocks shutdown. On shutdown, every
    /// still-registered session is aborted so its socket closes too.
    pub async fn serve(&self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accepting connection")?;
                    info!("accepted connection from {peer}");
                    self.spawn_session(stream);
                }
                _ = tokio::signal::ctrl_c() => {
                    let live: Vec<AbortHandle> = self.sessions.lock().unwrap().drain().map(|(_, h)| h).collect();
                    info!("shutdown signal received, closing {} live session(s)", live.len());
                    for handle in live {
                        handle.abort();
                    }
                    return Ok(());
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sessions = self.sessions.clone();
        let handle = tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            let mut session = ServerSession::new(reader, writer);
            if let Err(e) = session.run().await {
                error!("session error: {e:#}");
            }
            sessions.lock().unwrap().remove(&id);
        });
        self.sessions.lock().unwrap().insert(id, handle.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSession;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_one_connection_and_runs_a_session() {
        let acceptor = Acceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let server_dir = tempdir().unwrap();
        let target = server_dir.path().to_string_lossy().to_string();

        let serve_task = tokio::spawn(async move {
            tokio::select! {
                r = acceptor.serve() => r,
                _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => Ok(()),
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        let mut client = ClientSession::new(r, w);

        let report = client
            .sync(&target, 512, &BTreeMap::new(), server_dir.path())
            .await
            .unwrap();
        assert!(report.deleted.is_empty() && report.updated.is_empty());

        drop(client);
        serve_task.await.unwrap().unwrap();
    }
}
