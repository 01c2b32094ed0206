//! Client side of the protocol.
//!
//! [`Connector`] owns the write half of the connection. The read half lives in
//! a background task that forwards every `MESSAGE` on [`Deliveries::messages`]
//! and finally reports why the connection ended on [`Deliveries::closed`].
//! Presentation is left entirely to the caller.

use std::io;

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, ToSocketAddrs, tcp::OwnedWriteHalf},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{
    error::{CodecError, Disconnect},
    protocol::{ChatMessage, Command, read_command, validate_name, write_command},
    session::SessionState,
};

/// Receiving ends handed to the presentation layer.
pub struct Deliveries {
    pub messages: mpsc::UnboundedReceiver<ChatMessage>,
    /// Fires once, after the last message has been queued.
    pub closed: oneshot::Receiver<Disconnect>,
}

pub struct Connector<W = OwnedWriteHalf> {
    writer: W,
    name: Option<String>,
    state: SessionState,
}

impl Connector<OwnedWriteHalf> {
    pub async fn dial<A>(address: A) -> io::Result<(Self, Deliveries)>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(address).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(reader, writer))
    }
}

impl<W> Connector<W>
where
    W: AsyncWrite + Unpin,
{
    /// Runs the client over an already established transport.
    pub fn from_parts<R>(reader: R, writer: W) -> (Self, Deliveries)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (closed_tx, closed) = oneshot::channel();

        tokio::spawn(async move {
            let disconnect = read_loop(BufReader::new(reader), messages_tx).await;
            debug!(%disconnect, "client read loop stopped");
            let _ = closed_tx.send(disconnect);
        });

        let connector = Self {
            writer,
            name: None,
            state: SessionState::Connected,
        };
        (connector, Deliveries { messages, closed })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn set_name(&mut self, name: &str) -> Result<(), CodecError> {
        let name = name.trim_matches(' ');
        validate_name(name)?;
        self.send(&Command::Name {
            name: name.to_string(),
        })
        .await?;

        self.name = Some(name.to_string());
        self.state = SessionState::Named;
        Ok(())
    }

    pub async fn send_message(&mut self, text: &str) -> Result<(), CodecError> {
        self.send(&Command::Send {
            message: text.to_string(),
        })
        .await
    }

    /// Shuts down the write half. The server answers by closing the
    /// connection, which ends the read loop with [`Disconnect::EndOfStream`].
    pub async fn close(mut self) -> io::Result<()> {
        self.state = SessionState::Closed;
        self.writer.shutdown().await
    }

    async fn send(&mut self, command: &Command) -> Result<(), CodecError> {
        if self.state == SessionState::Closed {
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }

        let result = write_command(&mut self.writer, command).await;
        if let Err(CodecError::Io(_)) = &result {
            self.state = SessionState::Closed;
        }
        result
    }
}

async fn read_loop<R>(mut reader: R, messages: mpsc::UnboundedSender<ChatMessage>) -> Disconnect
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_command(&mut reader).await {
            Ok(Some(Command::Message(message))) => {
                if messages.send(message).is_err() {
                    debug!("message receiver dropped; discarding message");
                }
            }
            Ok(Some(other)) => {
                warn!(command = other.keyword(), "ignoring unexpected command from server");
            }
            Ok(None) => return Disconnect::EndOfStream,
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "dropping undecodable command from server");
            }
            Err(err) => return Disconnect::Failed(err),
        }
    }
}
