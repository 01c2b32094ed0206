use std::{io::BufRead, thread};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    connector::{Connector, Deliveries},
    error::Disconnect,
    protocol::ChatMessage,
    registry::DEFAULT_NAME,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut connector, mut deliveries) = Connector::dial(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let mut stdin = spawn_stdin_reader();

    let name = match args.name {
        Some(name) => name,
        None => prompt_name(&mut stdin).await?,
    };
    connector
        .set_name(&name)
        .await
        .with_context(|| format!("failed to register name '{name}'"))?;
    let registered = connector.name().unwrap_or(DEFAULT_NAME);
    write_stdout(&format!("*** connected as {registered}")).await?;

    let outcome = run_client_loop(&mut connector, &mut deliveries, &mut stdin).await;
    shutdown_connection(connector).await;

    outcome
}

/// Reads stdin on a plain thread. A blocked read there does not keep the
/// runtime alive once `main` returns, unlike `tokio::io::stdin`.
fn spawn_stdin_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        loop {
            let mut line = String::new();
            let read = match stdin.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
                Err(err) => Err(err),
            };
            let failed = read.is_err();
            if tx.blocking_send(read).is_err() || failed {
                break;
            }
        }
        debug!("stdin reader finished");
    });
    rx
}

async fn prompt_name(stdin: &mut mpsc::Receiver<io::Result<String>>) -> Result<String> {
    write_stdout("*** what is your name?").await?;
    match stdin.recv().await {
        Some(line) => Ok(line?),
        None => bail!("stdin closed before a name was entered"),
    }
}

async fn run_client_loop(
    connector: &mut Connector,
    deliveries: &mut Deliveries,
    stdin: &mut mpsc::Receiver<io::Result<String>>,
) -> Result<()> {
    loop {
        select! {
            biased;
            message = deliveries.messages.recv() => match message {
                Some(message) => render_message(message).await?,
                None => {
                    let disconnect = (&mut deliveries.closed).await;
                    return handle_disconnect(disconnect.ok()).await;
                }
            },
            disconnect = &mut deliveries.closed => {
                return handle_disconnect(disconnect.ok()).await;
            }
            line = stdin.recv() => {
                if !handle_stdin_input(line, connector).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_disconnect(disconnect: Option<Disconnect>) -> Result<()> {
    match disconnect {
        Some(Disconnect::Failed(err)) => Err(err).context("lost connection to server"),
        Some(Disconnect::EndOfStream) | None => {
            write_stdout("*** connection closed by server").await?;
            Ok(())
        }
    }
}

async fn handle_stdin_input(
    line: Option<io::Result<String>>,
    connector: &mut Connector,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    let text = line?;
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    connector
        .send_message(&text)
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(connector: Connector) {
    if let Err(error) = connector.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_message(message: ChatMessage) -> io::Result<()> {
    write_stdout(&format!("{}: {}", message.name, message.message)).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
