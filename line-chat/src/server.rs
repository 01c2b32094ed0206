use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
};
use tracing::{info, warn};

use crate::{
    registry::Registry,
    session::{Session, SessionConfig},
};

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: SessionConfig,
}

impl Server {
    pub async fn bind<A>(address: A, config: SessionConfig) -> std::io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(address).await?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: SessionConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves, then closes every live
    /// session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &config).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(registry: &Registry) {
    let closed = registry.close_all().await;
    info!(closed, "server shutting down");
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: &SessionConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, config).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Registers the connection before spawning its read loop, so sessions join
/// the registry in accept order.
async fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &SessionConfig,
) {
    let (reader, writer) = stream.into_split();
    let session = Session::open(writer, Some(peer), Arc::clone(registry), config).await;
    let id = session.id();

    tokio::spawn(async move {
        if let Err(err) = session.run(reader).await {
            warn!(peer = %peer, session = %id, error = %err, "session closed with error");
        }
    });
}
