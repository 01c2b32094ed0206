use std::{net::SocketAddr, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::timeout,
};

const STEP: Duration = Duration::from_secs(5);

/// A running `line-chat` process. Its stdout is pumped into `lines` by a
/// background task so the pipe never fills up.
struct Running {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<String>,
}

impl Running {
    fn spawn(args: &[&str], log_level: &str) -> Result<Self> {
        let mut child = Command::new(assert_cmd::cargo::cargo_bin!("line-chat"))
            .args(args)
            .env("RUST_LOG", log_level)
            .env("RUST_LOG_STYLE", "never")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning line-chat {args:?}"))?;

        let stdout = child.stdout.take().context("stdout not captured")?;
        let (tx, lines) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = stdout.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            stdin: child.stdin.take(),
            child,
            lines,
        })
    }

    async fn server() -> Result<(Self, SocketAddr)> {
        let mut server = Self::spawn(&["server", "--listen", "127.0.0.1:0"], "info")?;
        let banner = server.line_containing("listening on").await?;
        let addr = banner
            .rsplit(' ')
            .next()
            .and_then(|token| token.parse().ok())
            .with_context(|| format!("no address in {banner:?}"))?;
        Ok((server, addr))
    }

    async fn client(addr: SocketAddr, name: Option<&str>) -> Result<Self> {
        let addr = addr.to_string();
        let mut args = vec!["client", "--server", addr.as_str()];
        if let Some(name) = name {
            args.extend(["--name", name]);
        }
        // Client logs would interleave with the chat output on stdout.
        Self::spawn(&args, "warn")
    }

    async fn next_line(&mut self) -> Result<String> {
        match timeout(STEP, self.lines.recv()).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => bail!("stdout closed"),
            Err(_) => bail!("no output within {STEP:?}"),
        }
    }

    async fn line_containing(&mut self, needle: &str) -> Result<String> {
        loop {
            let line = self.next_line().await?;
            if line.contains(needle) {
                return Ok(line);
            }
        }
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = self.next_line().await?;
        if line != expected {
            bail!("expected {expected:?}, got {line:?}");
        }
        Ok(())
    }

    async fn type_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().context("stdin already closed")?;
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Waits for the process to exit on its own and checks its status.
    async fn exits_cleanly(mut self) -> Result<()> {
        let status = timeout(STEP, self.child.wait())
            .await
            .context("process did not exit")??;
        if !status.success() {
            bail!("process exited with {status}");
        }
        Ok(())
    }

    async fn kill(mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[tokio::test]
async fn two_clients_chat_through_the_binary() -> Result<()> {
    let (server, addr) = Running::server().await?;

    let mut alice = Running::client(addr, Some("  alice  ")).await?;
    // The banner shows the name the server was given, after trimming.
    alice.expect_line("*** connected as alice").await?;
    let mut bob = Running::client(addr, Some("bob")).await?;
    bob.expect_line("*** connected as bob").await?;

    bob.type_line("Hi Alice!").await?;
    alice.expect_line("bob: Hi Alice!").await?;

    alice.type_line("Hello from Alice").await?;
    bob.expect_line("alice: Hello from Alice").await?;

    alice.type_line("/quit").await?;
    alice.expect_line("*** leaving chat").await?;
    alice.exits_cleanly().await?;

    // Bob's stdin stays open: losing the server alone must end the client.
    server.kill().await?;
    bob.expect_line("*** connection closed by server").await?;
    bob.exits_cleanly().await?;

    Ok(())
}

#[tokio::test]
async fn client_prompts_for_a_name_when_none_is_given() -> Result<()> {
    let (server, addr) = Running::server().await?;

    let mut carol = Running::client(addr, None).await?;
    carol.expect_line("*** what is your name?").await?;
    carol.type_line("carol").await?;
    carol.expect_line("*** connected as carol").await?;

    let mut dave = Running::client(addr, Some("dave")).await?;
    dave.expect_line("*** connected as dave").await?;
    dave.type_line("hey").await?;
    carol.expect_line("dave: hey").await?;

    // End of input leaves the chat like /quit does.
    carol.stdin = None;
    carol.exits_cleanly().await?;

    drop(dave);
    server.kill().await?;
    Ok(())
}
