//! Server side of one client connection.
//!
//! A session is split across two tasks. The read loop decodes commands and
//! hands them to the [`Registry`]; a writer task drains the session's outbound
//! queue onto the transport. Both stop once the session's state turns
//! [`SessionState::Closed`], which drops their half of the transport.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader},
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::CodecError,
    protocol::{Command, read_command, write_command},
    registry::{Registration, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Named,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Commands that may wait in a session's outbound queue. A peer whose
    /// queue is full when a broadcast arrives is dropped.
    pub outbound_capacity: usize,
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    EndOfStream,
    /// Closed from the outside by a failed write or server shutdown.
    Evicted,
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    registry: Arc<Registry>,
    state: watch::Receiver<SessionState>,
}

impl Session {
    pub async fn open<W>(
        writer: W,
        peer: Option<SocketAddr>,
        registry: Arc<Registry>,
        config: &SessionConfig,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let Registration { id, state } = registry.register(outbound_tx).await;
        info!(?peer, session = %id, "session connected");

        tokio::spawn(run_writer(
            id,
            writer,
            outbound_rx,
            state.clone(),
            Arc::clone(&registry),
            config.write_timeout,
        ));

        Self {
            id,
            peer,
            registry,
            state,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The session is unregistered on every exit path.
    pub async fn run<R>(self, reader: R) -> Result<Closure, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let Session {
            id,
            peer,
            registry,
            mut state,
        } = self;

        let mut reader = BufReader::new(reader);
        let result = read_loop(id, &mut reader, &mut state, &registry).await;
        registry.unregister(id).await;

        if let Ok(closure) = &result {
            info!(?peer, session = %id, ?closure, "session closed");
        }
        result
    }
}

async fn read_loop<R>(
    id: SessionId,
    reader: &mut R,
    state: &mut watch::Receiver<SessionState>,
    registry: &Registry,
) -> Result<Closure, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            command = read_command(reader) => match command {
                Ok(Some(command)) => handle_command(id, command, registry).await,
                Ok(None) => return Ok(Closure::EndOfStream),
                Err(err) if err.is_recoverable() => {
                    warn!(session = %id, error = %err, "dropping undecodable command");
                }
                Err(err) => return Err(err),
            },
            _ = closed(state) => return Ok(Closure::Evicted),
        }
    }
}

async fn handle_command(id: SessionId, command: Command, registry: &Registry) {
    match command {
        Command::Send { message } => match registry.broadcast(id, message).await {
            Ok(delivered) => debug!(session = %id, delivered, "message broadcast"),
            Err(err) => warn!(session = %id, error = %err, "broadcast failed"),
        },
        Command::Name { name } => match registry.set_name(id, &name).await {
            Ok(()) => info!(session = %id, %name, "session named"),
            Err(err) => warn!(session = %id, error = %err, "rejected name"),
        },
        Command::Message(_) => {
            warn!(session = %id, "clients may not send MESSAGE commands; dropping");
        }
    }
}

async fn run_writer<W>(
    id: SessionId,
    mut writer: W,
    mut outbound: mpsc::Receiver<Command>,
    mut state: watch::Receiver<SessionState>,
    registry: Arc<Registry>,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let command = select! {
            biased;
            _ = closed(&mut state) => break,
            command = outbound.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match timeout(write_timeout, write_command(&mut writer, &command)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(session = %id, error = %err, "failed to deliver command");
                registry.unregister(id).await;
                break;
            }
            Err(_) => {
                warn!(session = %id, ?write_timeout, "peer stopped reading; closing session");
                registry.unregister(id).await;
                break;
            }
        }
    }
}

// A dropped state sender counts as closed.
async fn closed(state: &mut watch::Receiver<SessionState>) {
    while *state.borrow_and_update() != SessionState::Closed {
        if state.changed().await.is_err() {
            return;
        }
    }
}
