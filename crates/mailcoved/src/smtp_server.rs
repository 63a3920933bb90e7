use crate::address::EnvelopeAddress;
use crate::manager::MessageManager;
use crate::metrics_helper::{CONN_DENIED, CONN_GAUGE, TOTAL_CONN, TOTAL_MSGS_RECVD};
use crate::policy::PolicyError;
use anyhow::Context;
use mailcove_lifecycle::{SessionGuard, Shutdown};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;

#[derive(Clone)]
pub struct SmtpParams {
    pub listen: String,
    pub hostname: String,
    pub max_recipients: usize,
    pub max_message_bytes: usize,
    pub max_connections: usize,
    pub command_timeout: Duration,
    pub data_timeout: Duration,
    /// Accept a lone LF where CRLF is expected, including in the DATA
    /// terminator. On by default; plenty of test clients are sloppy.
    pub permissive_newlines: bool,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl Default for SmtpParams {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2500".to_string(),
            hostname: "mailcove.local".to_string(),
            max_recipients: 200,
            max_message_bytes: 10 * 1024 * 1024,
            max_connections: 64,
            command_timeout: Duration::from_secs(5 * 60),
            data_timeout: Duration::from_secs(10 * 60),
            permissive_newlines: true,
            tls: None,
        }
    }
}

/// Bind the SMTP listener and spawn the accept loop.
pub async fn start_smtp_listener(
    params: SmtpParams,
    manager: Arc<MessageManager>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&params.listen)
        .await
        .with_context(|| format!("binding smtp listener on {}", params.listen))?;
    tracing::info!("smtp listener on {}", listener.local_addr()?);
    let params = Arc::new(params);
    let limit = Arc::new(Semaphore::new(params.max_connections));

    tokio::spawn(async move {
        let mut shutdown = Shutdown::subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::debug!("smtp listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            handle_connection(socket, peer, params.clone(), manager.clone(), &limit);
                        }
                        Err(err) => {
                            tracing::error!("smtp accept failed: {err:#}");
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    params: Arc<SmtpParams>,
    manager: Arc<MessageManager>,
    limit: &Arc<Semaphore>,
) {
    let Ok(permit) = limit.clone().try_acquire_owned() else {
        CONN_DENIED.with_label_values(&["smtp"]).inc();
        tokio::spawn(async move {
            let mut socket = socket;
            socket
                .write_all(b"421 too many concurrent sessions, try again later\r\n")
                .await
                .ok();
        });
        return;
    };
    let Ok(session) = SessionGuard::begin() else {
        tokio::spawn(async move {
            let mut socket = socket;
            socket.write_all(b"421 shutting down\r\n").await.ok();
        });
        return;
    };
    TOTAL_CONN.with_label_values(&["smtp"]).inc();
    tokio::spawn(async move {
        let _permit = permit;
        let _session = session;
        let gauge = CONN_GAUGE.with_label_values(&["smtp"]);
        gauge.inc();
        if let Err(err) = run_session(socket, peer, params, manager).await {
            tracing::debug!("smtp session from {peer}: {err:#}");
        }
        gauge.dec();
    });
}

pub async fn run_session<T>(
    socket: T,
    peer: SocketAddr,
    params: Arc<SmtpParams>,
    manager: Arc<MessageManager>,
) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut server = SmtpServer::new(socket, peer, params.clone(), manager.clone(), false);
    match server.process().await? {
        Disposition::Closed => Ok(()),
        Disposition::StartTls => {
            let tls = params
                .tls
                .clone()
                .expect("STARTTLS is only offered when TLS is configured");
            let stream = server.into_stream();
            let stream = TlsAcceptor::from(tls)
                .accept(stream)
                .await
                .context("tls handshake")?;
            let mut server = SmtpServer::new(stream, peer, params, manager, true);
            server.process().await?;
            Ok(())
        }
    }
}

enum Disposition {
    Closed,
    StartTls,
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

#[derive(Debug)]
struct TransactionState {
    sender: EnvelopeAddress,
    recipients: Vec<EnvelopeAddress>,
}

pub struct SmtpServer<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    peer: SocketAddr,
    params: Arc<SmtpParams>,
    manager: Arc<MessageManager>,
    state: Option<TransactionState>,
    said_hello: Option<String>,
    tls_active: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SmtpServer<T> {
    pub fn new(
        socket: T,
        peer: SocketAddr,
        params: Arc<SmtpParams>,
        manager: Arc<MessageManager>,
        tls_active: bool,
    ) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            peer,
            params,
            manager,
            state: None,
            said_hello: None,
            tls_active,
        }
    }

    fn into_stream(self) -> T {
        self.reader.into_inner().unsplit(self.writer.into_inner())
    }

    async fn write_response<S: AsRef<str>>(
        &mut self,
        status: u16,
        message: S,
    ) -> anyhow::Result<()> {
        let mut lines = message.as_ref().lines().peekable();
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            self.writer
                .write_all(format!("{status}{sep}{line}\r\n").as_bytes())
                .await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one command line. None on EOF. Non-UTF8 junk is replaced
    /// rather than killing the session.
    async fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut line = vec![];
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&line).to_string()))
    }

    async fn process(&mut self) -> anyhow::Result<Disposition> {
        // RFC 3207: after a TLS handshake the server does not greet
        // again; the client opens with a fresh EHLO.
        if !self.tls_active {
            self.write_response(220, format!("{} mailcove ESMTP ready", self.params.hostname))
                .await?;
        }
        loop {
            let line = match tokio::time::timeout(self.params.command_timeout, self.read_line())
                .await
            {
                Err(_) => {
                    self.write_response(421, "idle too long, closing connection")
                        .await
                        .ok();
                    return Ok(Disposition::Closed);
                }
                Ok(result) => match result? {
                    None => return Ok(Disposition::Closed),
                    Some(line) => line,
                },
            };
            let line = line.trim_end();

            match Command::parse(line) {
                Err(err) => {
                    self.write_response(501, format!("Syntax error in command or arguments: {err}"))
                        .await?;
                }
                Ok(Command::Quit) => {
                    self.write_response(221, "closing connection").await?;
                    return Ok(Disposition::Closed);
                }
                Ok(Command::Ehlo(domain)) => {
                    let mut caps = format!(
                        "{} greets {domain}\nPIPELINING\n8BITMIME\nSIZE {}",
                        self.params.hostname, self.params.max_message_bytes
                    );
                    if self.params.tls.is_some() && !self.tls_active {
                        caps.push_str("\nSTARTTLS");
                    }
                    self.write_response(250, caps).await?;
                    self.said_hello.replace(domain);
                    self.state.take();
                }
                Ok(Command::Helo(domain)) => {
                    self.write_response(250, format!("{} greets {domain}", self.params.hostname))
                        .await?;
                    self.said_hello.replace(domain);
                    self.state.take();
                }
                Ok(Command::StartTls) => {
                    if self.tls_active {
                        self.write_response(503, "TLS already active").await?;
                        continue;
                    }
                    if self.params.tls.is_none() {
                        self.write_response(502, "STARTTLS not offered").await?;
                        continue;
                    }
                    self.write_response(220, "ready to start TLS").await?;
                    // The pre-TLS hello and any transaction are void.
                    return Ok(Disposition::StartTls);
                }
                Ok(Command::Mail { address, size_hint }) => {
                    if self.said_hello.is_none() {
                        self.write_response(503, "say EHLO first").await?;
                        continue;
                    }
                    if self.state.is_some() {
                        self.write_response(503, "MAIL FROM already issued; you must RSET first")
                            .await?;
                        continue;
                    }
                    if size_hint.unwrap_or(0) > self.params.max_message_bytes {
                        self.write_response(552, "5.3.4 message exceeds maximum size")
                            .await?;
                        continue;
                    }
                    self.write_response(250, "sender ok").await?;
                    self.state.replace(TransactionState {
                        sender: address,
                        recipients: vec![],
                    });
                }
                Ok(Command::Rcpt { address }) => {
                    let Some(state) = self.state.as_mut() else {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    };
                    if state.recipients.len() >= self.params.max_recipients {
                        self.write_response(452, "too many recipients").await?;
                        continue;
                    }
                    match self.manager.policy().evaluate(&address) {
                        Err(PolicyError::BadAddress(addr)) => {
                            self.write_response(553, format!("malformed address: {addr}"))
                                .await?;
                        }
                        Ok(verdict) if !verdict.accept || !verdict.store => {
                            self.write_response(550, "mailbox unavailable").await?;
                        }
                        Ok(_) => {
                            self.write_response(250, "recipient ok").await?;
                            // Deduplication happens at delivery, after
                            // normalization.
                            self.state
                                .as_mut()
                                .expect("checked state above")
                                .recipients
                                .push(address);
                        }
                    }
                }
                Ok(Command::Data) => {
                    if self.state.is_none() {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    }
                    if self
                        .state
                        .as_ref()
                        .map(|s| s.recipients.is_empty())
                        .unwrap_or(true)
                    {
                        self.write_response(503, "RCPT TO must be issued first")
                            .await?;
                        continue;
                    }
                    self.write_response(354, "send body; end with CRLF.CRLF")
                        .await?;

                    let outcome =
                        match tokio::time::timeout(self.params.data_timeout, self.read_data())
                            .await
                        {
                            Err(_) => {
                                self.write_response(421, "DATA took too long, closing connection")
                                    .await
                                    .ok();
                                return Ok(Disposition::Closed);
                            }
                            Ok(outcome) => outcome?,
                        };

                    let state = self.state.take().expect("checked state above");
                    match outcome {
                        DataOutcome::TooLarge => {
                            self.write_response(552, "5.3.4 message exceeds maximum size")
                                .await?;
                        }
                        DataOutcome::Complete(data) => {
                            TOTAL_MSGS_RECVD.with_label_values(&["smtp"]).inc();
                            let origin = self.peer.ip().to_string();
                            match self
                                .manager
                                .deliver(&origin, &state.sender, &state.recipients, &data)
                                .await
                            {
                                Ok(_) => {
                                    self.write_response(250, "2.0.0 ok, message stored").await?;
                                }
                                Err(err) if err.only_policy_rejections() => {
                                    // Already reported per recipient at
                                    // RCPT time; the transaction stands.
                                    self.write_response(250, "2.0.0 ok, message stored").await?;
                                }
                                Err(err) if err.is_store_full() => {
                                    self.write_response(452, "4.3.1 insufficient system storage")
                                        .await?;
                                }
                                Err(err) => {
                                    tracing::error!("delivery from {} failed: {err}", self.peer);
                                    self.write_response(451, "4.3.0 error storing message")
                                        .await?;
                                }
                            }
                        }
                    }
                }
                Ok(Command::Rset) => {
                    self.state.take();
                    self.write_response(250, "state reset").await?;
                }
                Ok(Command::Noop) => {
                    self.write_response(250, "ok").await?;
                }
                Ok(Command::Unknown(cmd)) => {
                    self.write_response(502, format!("Command unrecognized/unimplemented: {cmd}"))
                        .await?;
                }
            }
        }
    }

    /// Consume the DATA payload through its terminator, reversing dot
    /// stuffing as we go. When the size limit is crossed we keep
    /// consuming to stay in protocol sync, but the payload is dropped.
    async fn read_data(&mut self) -> anyhow::Result<DataOutcome> {
        let mut data: Vec<u8> = vec![];
        let mut truncated = false;
        loop {
            let mut line: Vec<u8> = vec![];
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                anyhow::bail!("connection closed during DATA");
            }
            if is_data_terminator(&line, self.params.permissive_newlines) {
                break;
            }
            let line = unstuff(&line);
            if data.len() + line.len() > self.params.max_message_bytes {
                truncated = true;
                data.clear();
            }
            if !truncated {
                data.extend_from_slice(line);
            }
        }
        Ok(if truncated {
            DataOutcome::TooLarge
        } else {
            DataOutcome::Complete(data)
        })
    }
}

fn is_data_terminator(line: &[u8], permissive: bool) -> bool {
    line == b".\r\n" || (permissive && line == b".\n")
}

/// Reverse RFC 5321 4.5.2 transparency: a leading dot that escaped
/// another dot comes off here.
fn unstuff(line: &[u8]) -> &[u8] {
    match line.first() {
        Some(b'.') => &line[1..],
        _ => line,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ehlo(String),
    Helo(String),
    Mail {
        address: EnvelopeAddress,
        size_hint: Option<usize>,
    },
    Rcpt {
        address: EnvelopeAddress,
    },
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Self> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            if line.len() < candidate.len() {
                false
            } else {
                line[..candidate.len()].eq_ignore_ascii_case(candidate)
            }
        }

        fn extract_envelope(line: &str) -> anyhow::Result<(&str, &str)> {
            let line = line.trim_start();
            if !line.starts_with('<') {
                anyhow::bail!("expected <: {line:?}");
            }
            let rangle = line
                .bytes()
                .position(|c| c == b'>')
                .ok_or_else(|| anyhow::anyhow!("expected >: {line:?}"))?;

            Ok((&line[1..rangle], &line[rangle + 1..]))
        }

        fn parse_size_param(params: &str) -> anyhow::Result<Option<usize>> {
            for param in params.split_whitespace() {
                let Some((name, value)) = param.split_once('=') else {
                    continue;
                };
                if name.eq_ignore_ascii_case("SIZE") {
                    let size = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid SIZE parameter: {value:?}"))?;
                    return Ok(Some(size));
                }
            }
            Ok(None)
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if line.eq_ignore_ascii_case("NOOP") || prefix_match(line, "NOOP ") {
            Self::Noop
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].trim().to_string())
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].trim().to_string())
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, params) = extract_envelope(&line[10..])?;
            Self::Mail {
                address: EnvelopeAddress::parse(address)?,
                size_hint: parse_size_param(params)?,
            }
        } else if prefix_match(line, "RCPT TO:") {
            let (address, _params) = extract_envelope(&line[8..])?;
            if address.is_empty() {
                anyhow::bail!("null sender not permitted as a recipient");
            }
            Self::Rcpt {
                address: EnvelopeAddress::parse(address)?,
            }
        } else {
            Self::Unknown(line.to_string())
        })
    }
}
