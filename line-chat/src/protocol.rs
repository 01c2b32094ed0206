use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::CodecError;

/// Width of the space-padded name field in a `MESSAGE` line.
pub const NAME_SIZE: usize = 30;

pub const MAX_LINE_BYTES: usize = 64 * 1024;

const SEPARATOR: u8 = b' ';
const LINE_ENDINGS: &[char] = &['\n', '\r'];
const PADDING: u8 = b' ';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { message: String },
    Name { name: String },
    Message(ChatMessage),
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Send { .. } => "SEND",
            Command::Name { .. } => "NAME",
            Command::Message(_) => "MESSAGE",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut line = Vec::with_capacity(self.keyword().len() + NAME_SIZE + 16);
        line.extend_from_slice(self.keyword().as_bytes());
        line.push(SEPARATOR);

        match self {
            Command::Send { message } => {
                reject_newline(message)?;
                line.extend_from_slice(message.as_bytes());
            }
            Command::Name { name } => {
                validate_name(name)?;
                line.extend_from_slice(name.as_bytes());
            }
            Command::Message(ChatMessage { name, message }) => {
                validate_name(name)?;
                reject_newline(message)?;
                line.extend_from_slice(name.as_bytes());
                line.resize(line.len() + NAME_SIZE - name.len(), PADDING);
                line.push(SEPARATOR);
                line.extend_from_slice(message.as_bytes());
            }
        }

        line.push(b'\n');
        Ok(line)
    }
}

pub fn validate_name(name: &str) -> Result<(), CodecError> {
    reject_newline(name)?;
    if name.len() > NAME_SIZE {
        return Err(CodecError::NameTooLong {
            len: name.len(),
            limit: NAME_SIZE,
        });
    }
    Ok(())
}

fn reject_newline(text: &str) -> Result<(), CodecError> {
    if text.contains(LINE_ENDINGS) {
        return Err(CodecError::EmbeddedNewline);
    }
    Ok(())
}

pub fn decode_line(line: &[u8]) -> Result<Command, CodecError> {
    let Some(split) = line.iter().position(|&byte| byte == SEPARATOR) else {
        return Err(match line {
            b"SEND" | b"NAME" | b"MESSAGE" => CodecError::Malformed {
                command: keyword_name(line),
                reason: "missing space after the keyword",
            },
            _ => CodecError::UnknownCommand {
                token: String::from_utf8_lossy(line).into_owned(),
            },
        });
    };

    let (keyword, rest) = (&line[..split], &line[split + 1..]);
    match keyword {
        b"SEND" => Ok(Command::Send {
            message: utf8(rest, "SEND")?,
        }),
        b"NAME" => {
            let name = utf8(rest, "NAME")?;
            validate_name(&name)?;
            Ok(Command::Name { name })
        }
        b"MESSAGE" => decode_message(rest).map(Command::Message),
        _ => Err(CodecError::UnknownCommand {
            token: String::from_utf8_lossy(keyword).into_owned(),
        }),
    }
}

fn decode_message(rest: &[u8]) -> Result<ChatMessage, CodecError> {
    if rest.len() < NAME_SIZE + 1 {
        return Err(CodecError::Malformed {
            command: "MESSAGE",
            reason: "line is shorter than the name field",
        });
    }

    let (field, body) = rest.split_at(NAME_SIZE);
    if body[0] != SEPARATOR {
        return Err(CodecError::Malformed {
            command: "MESSAGE",
            reason: "missing separator after the name field",
        });
    }

    let name = std::str::from_utf8(field).map_err(|_| CodecError::Malformed {
        command: "MESSAGE",
        reason: "name field is not valid UTF-8",
    })?;

    Ok(ChatMessage {
        name: name.trim_matches(' ').to_string(),
        message: utf8(&body[1..], "MESSAGE")?,
    })
}

fn keyword_name(keyword: &[u8]) -> &'static str {
    match keyword {
        b"SEND" => "SEND",
        b"NAME" => "NAME",
        _ => "MESSAGE",
    }
}

fn utf8(bytes: &[u8], command: &'static str) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Malformed {
        command,
        reason: "payload is not valid UTF-8",
    })
}

/// `Ok(None)` means the stream ended cleanly between commands. Undecodable
/// lines are consumed whole, so the reader stays in sync after a recoverable
/// error.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<Command>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_BYTES as u64 + 1;
    let mut line = Vec::new();
    let bytes = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut line)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }

    if line.last() != Some(&b'\n') {
        if line.len() as u64 >= limit {
            return Err(CodecError::LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }
        return Err(CodecError::Truncated);
    }

    line.pop();
    // Telnet-style clients terminate lines with \r\n.
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    decode_line(&line).map(Some)
}

pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = command.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
pub struct ReadAll {
    pub commands: Vec<Command>,
    pub error: Option<CodecError>,
}

/// Decodes until the end of the stream, skipping undecodable lines. The first
/// fatal error ends the batch and is returned next to the partial list.
pub async fn read_all<R>(reader: &mut R) -> ReadAll
where
    R: AsyncBufRead + Unpin,
{
    let mut commands = Vec::new();
    loop {
        match read_command(reader).await {
            Ok(Some(command)) => commands.push(command),
            Ok(None) => return ReadAll { commands, error: None },
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "skipping undecodable command");
            }
            Err(err) => {
                return ReadAll {
                    commands,
                    error: Some(err),
                }
            }
        }
    }
}
