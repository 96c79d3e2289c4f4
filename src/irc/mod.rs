//! Minimal IRC client used by the ping responder.
//!
//! Connects over plain TCP or TLS, registers, joins the configured channels
//! and keeps the connection alive. Channel and private messages are handed to
//! the sink; outgoing messages are queued and written by the connection loop.
//! The first connection is made by [`IrcClient::connect`] and its failure is
//! returned to the caller; connections lost afterwards are re-established.

pub mod line;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};

use crate::{
    configuration::IrcConfig,
    time::now,
    transport::{Envelope, EnvelopeSink, Transport, TransportError},
};

pub use line::Line;

/// Default port for plain connections.
pub const DEFAULT_PORT: u16 = 6667;

/// Default port for TLS connections.
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// Capacity of the outgoing message queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Time allowed between connecting and the server's welcome.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors of the IRC client.
#[derive(Error, Debug)]
pub enum IrcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Invalid server address: {0}")]
    InvalidServer(String),
    #[error("Malformed line: {0:?}")]
    Parse(String),
    #[error("Registration failed: {0}")]
    Registration(String),
    #[error("Connection closed by server")]
    Closed,
}

impl From<IrcError> for TransportError {
    fn from(e: IrcError) -> Self {
        TransportError::Connection(e.to_string())
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A registered connection.
struct Connection {
    reader: BufReader<ReadHalf<Box<dyn Stream>>>,
    writer: WriteHalf<Box<dyn Stream>>,
    buf: Vec<u8>,
    nick: String,
}

impl Connection {
    /// Reads the next line. Invalid UTF-8 is replaced rather than rejected.
    ///
    /// Cancel safe: bytes of an interrupted read stay in the buffer and the
    /// next call completes the line.
    async fn read_line(&mut self) -> Result<String, IrcError> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Err(IrcError::Closed);
        }
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.buf.clear();
        Ok(line)
    }

    async fn write(&mut self, line: &Line) -> Result<(), IrcError> {
        write_line(&mut self.writer, line).await
    }
}

/// An IRC connection usable as a transport.
pub struct IrcClient {
    name: String,
    config: IrcConfig,
    outbound: mpsc::Sender<String>,
    queue: Mutex<mpsc::Receiver<String>>,
    established: Mutex<Option<Connection>>,
}

impl IrcClient {
    /// Creates a client for network `name`. Nothing is connected until
    /// [`IrcClient::connect`] or [`Transport::listen`] runs.
    pub fn new(name: impl Into<String>, config: IrcConfig) -> IrcClient {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        IrcClient {
            name: name.into(),
            config,
            outbound: tx,
            queue: Mutex::new(rx),
            established: Mutex::new(None),
        }
    }

    /// Connects and registers, keeping the connection for [`Transport::listen`].
    pub async fn connect(&self) -> Result<(), IrcError> {
        let conn = self.open().await?;
        *self.established.lock().await = Some(conn);
        Ok(())
    }

    /// Splits `host[:port]` into host and port.
    pub fn server_address(&self) -> Result<(String, u16), IrcError> {
        let server = self.config.server.trim();
        let default_port = if self.config.tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        };

        match server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| IrcError::InvalidServer(server.to_string()))?;
                Ok((host.to_string(), port))
            }
            Some(_) => Err(IrcError::InvalidServer(server.to_string())),
            None if server.is_empty() => Err(IrcError::InvalidServer(server.to_string())),
            None => Ok((server.to_string(), default_port)),
        }
    }

    async fn dial(&self) -> Result<Box<dyn Stream>, IrcError> {
        let (host, port) = self.server_address()?;
        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;

        if !self.config.tls {
            return Ok(Box::new(tcp));
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| IrcError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let server_name =
            ServerName::try_from(host.clone()).map_err(|_| IrcError::InvalidServer(host))?;
        let stream = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await?;
        Ok(Box::new(stream))
    }

    /// Dials, registers and joins the configured channels.
    async fn open(&self) -> Result<Connection, IrcError> {
        let stream = self.dial().await?;
        let (reader, writer) = tokio::io::split(stream);
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
            buf: Vec::new(),
            nick: self.config.nick.clone(),
        };

        tokio::time::timeout(REGISTRATION_TIMEOUT, self.register(&mut conn))
            .await
            .map_err(|_| IrcError::Registration("no welcome from server".to_string()))??;

        log::info!("Connected to {} as {}", self.name, conn.nick);
        for channel in &self.config.channels {
            conn.write(&Line::new("JOIN", [channel.as_str()])).await?;
        }
        Ok(conn)
    }

    /// Sends NICK and USER and waits for the welcome.
    async fn register(&self, conn: &mut Connection) -> Result<(), IrcError> {
        let nick = conn.nick.clone();
        conn.write(&Line::new("NICK", [nick.as_str()])).await?;
        conn.write(&Line::new("USER", [nick.as_str(), "0", "*", self.config.realname()]))
            .await?;

        loop {
            let raw = conn.read_line().await?;
            let Ok(line) = Line::parse(&raw) else {
                continue;
            };
            log::trace!("{} <- {}", self.name, raw);

            match line.command.as_str() {
                "PING" => conn.write(&Line::new("PONG", line.params)).await?,
                // RPL_WELCOME
                "001" => {
                    if let Some(confirmed) = line.param(0) {
                        conn.nick = confirmed.to_string();
                    }
                    return Ok(());
                }
                // ERR_NICKNAMEINUSE
                "433" => {
                    conn.nick.push('_');
                    log::warn!("{}: nickname in use, trying {}", self.name, conn.nick);
                    let nick = conn.nick.clone();
                    conn.write(&Line::new("NICK", [nick.as_str()])).await?;
                }
                // ERR_ERRONEUSNICKNAME, ERR_YOUREBANNEDCREEP
                "432" | "465" | "ERROR" => {
                    let reason = line.params.last().cloned().unwrap_or_default();
                    return Err(IrcError::Registration(reason));
                }
                _ => {}
            }
        }
    }

    /// Serves a registered connection until it fails.
    async fn run(&self, mut conn: Connection, sink: &dyn EnvelopeSink) -> Result<(), IrcError> {
        let mut queue = self.queue.lock().await;

        loop {
            tokio::select! {
                raw = conn.read_line() => {
                    let raw = raw?;
                    let line = match Line::parse(&raw) {
                        Ok(line) => line,
                        Err(e) => {
                            log::debug!("{}: {}", self.name, e);
                            continue;
                        }
                    };
                    log::trace!("{} <- {}", self.name, raw);

                    match line.command.as_str() {
                        "PING" => conn.write(&Line::new("PONG", line.params)).await?,
                        "JOIN" if line.source_nick() == Some(conn.nick.as_str()) => {
                            log::info!("Joined {} on {}", line.param(0).unwrap_or_default(), self.name);
                        }
                        "NICK" if line.source_nick() == Some(conn.nick.as_str()) => {
                            if let Some(new_nick) = line.param(0) {
                                conn.nick = new_nick.to_string();
                            }
                        }
                        "PRIVMSG" => {
                            if let Some(envelope) = message_envelope(&line, &conn.nick, now()) {
                                sink.deliver(envelope);
                            }
                        }
                        "ERROR" => {
                            log::error!("{}: {}", self.name, line.param(0).unwrap_or_default());
                            return Err(IrcError::Closed);
                        }
                        _ => {}
                    }
                }
                Some(text) = queue.recv() => {
                    log::trace!("{} -> {}", self.name, text);
                    conn.writer.write_all(text.as_bytes()).await?;
                    conn.writer.write_all(b"\r\n").await?;
                    conn.writer.flush().await?;
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &Line) -> Result<(), IrcError> {
    writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Turns a PRIVMSG into an envelope. Private messages are addressed to the
/// sender so that replies go back to them.
fn message_envelope(line: &Line, own_nick: &str, received_at: DateTime<Utc>) -> Option<Envelope> {
    let target = line.param(0)?;
    let text = line.param(1)?;
    let sender = line.source_nick()?;

    let destination = if target.eq_ignore_ascii_case(own_nick) {
        sender
    } else {
        target
    };
    let relayed_at = line
        .tag("time")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    Some(Envelope {
        destination: destination.to_string(),
        text: text.to_string(),
        relayed_at,
        received_at,
    })
}

#[async_trait]
impl Transport for IrcClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        if text.contains(['\r', '\n']) {
            return Err(TransportError::Send {
                destination: destination.to_string(),
                reason: "message contains a line break".to_string(),
            });
        }
        let line = Line::new("PRIVMSG", [destination, text]);
        self.outbound
            .send(line.to_string())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn listen(&self, sink: Arc<dyn EnvelopeSink>) -> Result<(), TransportError> {
        // An invalid address will never connect
        self.server_address()?;

        let mut established = self.established.lock().await.take();
        loop {
            let conn = match established.take() {
                Some(conn) => Ok(conn),
                None => self.open().await,
            };
            let result = match conn {
                Ok(conn) => self.run(conn, sink.as_ref()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::error!("Connection to {} lost: {}", self.name, e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
