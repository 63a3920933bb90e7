//! Read-only POP3 surface over the manager. USER picks the mailbox
//! (any password is accepted), RETR marks messages seen, and deletes
//! staged with DELE are applied through the manager on QUIT.

use crate::manager::MessageManager;
use crate::metrics_helper::{CONN_DENIED, CONN_GAUGE, TOTAL_CONN};
use anyhow::Context;
use mailcove_lifecycle::{SessionGuard, Shutdown};
use msgstore::MessageSummary;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct Pop3Params {
    pub listen: String,
    pub hostname: String,
    pub max_connections: usize,
    pub command_timeout: Duration,
}

impl Default for Pop3Params {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1100".to_string(),
            hostname: "mailcove.local".to_string(),
            max_connections: 64,
            command_timeout: Duration::from_secs(10 * 60),
        }
    }
}

pub async fn start_pop3_listener(
    params: Pop3Params,
    manager: Arc<MessageManager>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&params.listen)
        .await
        .with_context(|| format!("binding pop3 listener on {}", params.listen))?;
    tracing::info!("pop3 listener on {}", listener.local_addr()?);
    let params = Arc::new(params);
    let limit = Arc::new(Semaphore::new(params.max_connections));

    tokio::spawn(async move {
        let mut shutdown = Shutdown::subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    tracing::debug!("pop3 listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            handle_connection(socket, peer, params.clone(), manager.clone(), &limit);
                        }
                        Err(err) => {
                            tracing::error!("pop3 accept failed: {err:#}");
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
    params: Arc<Pop3Params>,
    manager: Arc<MessageManager>,
    limit: &Arc<Semaphore>,
) {
    let Ok(permit) = limit.clone().try_acquire_owned() else {
        CONN_DENIED.with_label_values(&["pop3"]).inc();
        tokio::spawn(async move {
            let mut socket = socket;
            socket
                .write_all(b"-ERR too many concurrent sessions\r\n")
                .await
                .ok();
        });
        return;
    };
    let Ok(session) = SessionGuard::begin() else {
        tokio::spawn(async move {
            let mut socket = socket;
            socket.write_all(b"-ERR shutting down\r\n").await.ok();
        });
        return;
    };
    TOTAL_CONN.with_label_values(&["pop3"]).inc();
    tokio::spawn(async move {
        let _permit = permit;
        let _session = session;
        let gauge = CONN_GAUGE.with_label_values(&["pop3"]);
        gauge.inc();
        if let Err(err) = run_session(socket, peer, params, manager).await {
            tracing::debug!("pop3 session from {peer}: {err:#}");
        }
        gauge.dec();
    });
}

pub async fn run_session<T>(
    socket: T,
    peer: SocketAddr,
    params: Arc<Pop3Params>,
    manager: Arc<MessageManager>,
) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut server = Pop3Server::new(socket, peer, params, manager);
    server.process().await
}

struct Pop3Server<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    peer: SocketAddr,
    params: Arc<Pop3Params>,
    manager: Arc<MessageManager>,
    pending_user: Option<String>,
    /// Set once PASS succeeds; the session snapshot of the maildrop.
    mailbox: Option<String>,
    messages: Vec<MessageSummary>,
    /// 1-based message numbers staged for deletion at QUIT.
    deleted: BTreeSet<usize>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Pop3Server<T> {
    fn new(
        socket: T,
        peer: SocketAddr,
        params: Arc<Pop3Params>,
        manager: Arc<MessageManager>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            peer,
            params,
            manager,
            pending_user: None,
            mailbox: None,
            messages: vec![],
            deleted: BTreeSet::new(),
        }
    }

    async fn ok<S: AsRef<str>>(&mut self, message: S) -> anyhow::Result<()> {
        self.writer
            .write_all(format!("+OK {}\r\n", message.as_ref()).as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn err<S: AsRef<str>>(&mut self, message: S) -> anyhow::Result<()> {
        self.writer
            .write_all(format!("-ERR {}\r\n", message.as_ref()).as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Write a multi-line payload with POP3 byte stuffing and the
    /// terminating dot line.
    async fn write_multiline(&mut self, data: &[u8]) -> anyhow::Result<()> {
        for line in data.split_inclusive(|&b| b == b'\n') {
            if line.first() == Some(&b'.') {
                self.writer.write_all(b".").await?;
            }
            self.writer.write_all(line).await?;
        }
        if !data.is_empty() && !data.ends_with(b"\n") {
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.write_all(b".\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut line = vec![];
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&line).trim_end().to_string()))
    }

    fn live_messages(&self) -> impl Iterator<Item = (usize, &MessageSummary)> + '_ {
        self.messages
            .iter()
            .enumerate()
            .map(|(idx, msg)| (idx + 1, msg))
            .filter(|(num, _)| !self.deleted.contains(num))
    }

    fn message_by_number(&self, num: usize) -> Option<&MessageSummary> {
        if num == 0 || num > self.messages.len() || self.deleted.contains(&num) {
            return None;
        }
        Some(&self.messages[num - 1])
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        self.ok(format!("{} POP3 server ready", self.params.hostname.clone()))
            .await?;
        loop {
            let line =
                match tokio::time::timeout(self.params.command_timeout, self.read_line()).await {
                    Err(_) => {
                        self.err("idle too long, closing connection").await.ok();
                        return Ok(());
                    }
                    Ok(result) => match result? {
                        None => return Ok(()),
                        Some(line) => line,
                    },
                };

            let command = Pop3Command::parse(&line);
            if self.mailbox.is_none() {
                if self.handle_authorization(command).await? {
                    return Ok(());
                }
            } else if self.handle_transaction(command).await? {
                return Ok(());
            }
        }
    }

    /// Returns true when the session is over.
    async fn handle_authorization(&mut self, command: Pop3Command) -> anyhow::Result<bool> {
        match command {
            Pop3Command::Capa => self.capabilities().await?,
            Pop3Command::User(name) => {
                self.pending_user = Some(name);
                self.ok("send PASS").await?;
            }
            Pop3Command::Pass(_) => {
                let Some(user) = self.pending_user.take() else {
                    self.err("send USER first").await?;
                    return Ok(false);
                };
                match self.manager.policy().resolve_name(&user) {
                    Err(err) => {
                        self.err(format!("{err}")).await?;
                    }
                    Ok(mailbox) => {
                        self.messages = self.manager.get_messages(&mailbox).await?;
                        tracing::debug!(
                            "pop3 {} opened {mailbox} with {} messages",
                            self.peer,
                            self.messages.len()
                        );
                        self.mailbox = Some(mailbox);
                        self.ok(format!("maildrop has {} messages", self.messages.len()))
                            .await?;
                    }
                }
            }
            Pop3Command::Quit => {
                self.ok("goodbye").await?;
                return Ok(true);
            }
            Pop3Command::Noop => self.ok("").await?,
            _ => self.err("not authenticated").await?,
        }
        Ok(false)
    }

    /// Returns true when the session is over.
    async fn handle_transaction(&mut self, command: Pop3Command) -> anyhow::Result<bool> {
        match command {
            Pop3Command::Capa => self.capabilities().await?,
            Pop3Command::Stat => {
                let (count, octets) = self
                    .live_messages()
                    .fold((0usize, 0u64), |(c, o), (_, m)| (c + 1, o + m.size));
                self.ok(format!("{count} {octets}")).await?;
            }
            Pop3Command::List(Some(num)) => match self.message_by_number(num) {
                Some(msg) => self.ok(format!("{num} {}", msg.size)).await?,
                None => self.err("no such message").await?,
            },
            Pop3Command::List(None) => {
                let lines: Vec<String> = self
                    .live_messages()
                    .map(|(num, msg)| format!("{num} {}", msg.size))
                    .collect();
                self.ok(format!("{} messages", lines.len())).await?;
                self.write_multiline(lines.join("\r\n").as_bytes()).await?;
            }
            Pop3Command::Uidl(Some(num)) => match self.message_by_number(num) {
                Some(msg) => self.ok(format!("{num} {}", msg.id)).await?,
                None => self.err("no such message").await?,
            },
            Pop3Command::Uidl(None) => {
                let lines: Vec<String> = self
                    .live_messages()
                    .map(|(num, msg)| format!("{num} {}", msg.id))
                    .collect();
                self.ok("unique ids follow").await?;
                self.write_multiline(lines.join("\r\n").as_bytes()).await?;
            }
            Pop3Command::Retr(num) => {
                let Some(summary) = self.message_by_number(num).cloned() else {
                    self.err("no such message").await?;
                    return Ok(false);
                };
                let mailbox = self.mailbox.clone().expect("in transaction state");
                match self.manager.get_message(&mailbox, &summary.id).await {
                    Ok(msg) => {
                        self.manager.mark_seen(&mailbox, &summary.id).await.ok();
                        self.ok(format!("{} octets", msg.source.len())).await?;
                        self.write_multiline(&msg.source).await?;
                    }
                    Err(err) => {
                        self.err(format!("{err}")).await?;
                    }
                }
            }
            Pop3Command::Top(num, lines) => {
                let Some(summary) = self.message_by_number(num).cloned() else {
                    self.err("no such message").await?;
                    return Ok(false);
                };
                let mailbox = self.mailbox.clone().expect("in transaction state");
                match self.manager.get_message(&mailbox, &summary.id).await {
                    Ok(msg) => {
                        let head = message_top(&msg.source, lines);
                        self.ok("top follows").await?;
                        self.write_multiline(&head).await?;
                    }
                    Err(err) => {
                        self.err(format!("{err}")).await?;
                    }
                }
            }
            Pop3Command::Dele(num) => {
                if self.message_by_number(num).is_some() {
                    self.deleted.insert(num);
                    self.ok(format!("message {num} deleted")).await?;
                } else {
                    self.err("no such message").await?;
                }
            }
            Pop3Command::Rset => {
                self.deleted.clear();
                self.ok("deletions forgotten").await?;
            }
            Pop3Command::Noop => self.ok("").await?,
            Pop3Command::Quit => {
                let mailbox = self.mailbox.clone().expect("in transaction state");
                for num in self.deleted.clone() {
                    let id = self.messages[num - 1].id.clone();
                    if let Err(err) = self.manager.remove_message(&mailbox, &id).await {
                        tracing::error!("pop3 delete of {id} in {mailbox} failed: {err:#}");
                    }
                }
                self.ok("goodbye").await?;
                return Ok(true);
            }
            Pop3Command::User(_) | Pop3Command::Pass(_) => {
                self.err("already authenticated").await?;
            }
            Pop3Command::Unknown(cmd) => {
                self.err(format!("unrecognized command: {cmd}")).await?;
            }
        }
        Ok(false)
    }

    async fn capabilities(&mut self) -> anyhow::Result<()> {
        self.ok("capabilities follow").await?;
        self.write_multiline(b"USER\r\nUIDL\r\nTOP").await
    }
}

/// The header block plus the first `lines` body lines, for TOP.
fn message_top(source: &[u8], lines: usize) -> Vec<u8> {
    let mut out = vec![];
    let mut body_lines = 0;
    let mut in_body = false;
    for line in source.split_inclusive(|&b| b == b'\n') {
        if in_body {
            if body_lines >= lines {
                break;
            }
            body_lines += 1;
        } else if line == b"\r\n" || line == b"\n" {
            in_body = true;
        }
        out.extend_from_slice(line);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Pop3Command {
    User(String),
    Pass(String),
    Capa,
    Stat,
    List(Option<usize>),
    Uidl(Option<usize>),
    Retr(usize),
    Top(usize, usize),
    Dele(usize),
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl Pop3Command {
    fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg1 = parts.next();
        let arg2 = parts.next();

        fn number(arg: Option<&str>) -> Option<usize> {
            arg.and_then(|a| a.parse().ok())
        }

        match verb.as_str() {
            "USER" => match arg1 {
                Some(name) => Self::User(name.to_string()),
                None => Self::Unknown(line.to_string()),
            },
            "PASS" => Self::Pass(arg1.unwrap_or("").to_string()),
            "CAPA" => Self::Capa,
            "STAT" => Self::Stat,
            "LIST" => match arg1 {
                Some(_) => match number(arg1) {
                    Some(num) => Self::List(Some(num)),
                    None => Self::Unknown(line.to_string()),
                },
                None => Self::List(None),
            },
            "UIDL" => match arg1 {
                Some(_) => match number(arg1) {
                    Some(num) => Self::Uidl(Some(num)),
                    None => Self::Unknown(line.to_string()),
                },
                None => Self::Uidl(None),
            },
            "RETR" => match number(arg1) {
                Some(num) => Self::Retr(num),
                None => Self::Unknown(line.to_string()),
            },
            "TOP" => match (number(arg1), number(arg2)) {
                (Some(num), Some(lines)) => Self::Top(num, lines),
                _ => Self::Unknown(line.to_string()),
            },
            "DELE" => match number(arg1) {
                Some(num) => Self::Dele(num),
                None => Self::Unknown(line.to_string()),
            },
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::EnvelopeAddress;
    use crate::hub::Hub;
    use crate::policy::AddressPolicy;
    use k9::assert_equal;
    use msgstore::{MemoryStore, Store};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    #[test]
    fn command_parser() {
        assert_equal!(
            Pop3Command::parse("user Bob"),
            Pop3Command::User("Bob".to_string())
        );
        assert_equal!(Pop3Command::parse("STAT"), Pop3Command::Stat);
        assert_equal!(Pop3Command::parse("LIST"), Pop3Command::List(None));
        assert_equal!(Pop3Command::parse("LIST 2"), Pop3Command::List(Some(2)));
        assert_equal!(Pop3Command::parse("retr 1"), Pop3Command::Retr(1));
        assert_equal!(Pop3Command::parse("TOP 1 5"), Pop3Command::Top(1, 5));
        assert_equal!(
            Pop3Command::parse("RETR banana"),
            Pop3Command::Unknown("RETR banana".to_string())
        );
    }

    #[test]
    fn top_truncates_the_body() {
        let source = b"Subject: x\r\n\r\none\r\ntwo\r\nthree\r\n";
        assert_equal!(message_top(source, 1), b"Subject: x\r\n\r\none\r\n".to_vec());
        assert_equal!(message_top(source, 99), source.to_vec());
        assert_equal!(message_top(source, 0), b"Subject: x\r\n\r\n".to_vec());
    }

    struct TestSession {
        client: BufReader<DuplexStream>,
        manager: Arc<MessageManager>,
    }

    impl TestSession {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.client.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        async fn expect_ok(&mut self) -> String {
            let line = self.line().await;
            assert!(line.starts_with("+OK"), "expected +OK, got {line:?}");
            line
        }

        async fn expect_err(&mut self) -> String {
            let line = self.line().await;
            assert!(line.starts_with("-ERR"), "expected -ERR, got {line:?}");
            line
        }

        /// Read multi-line payload lines up to the dot terminator.
        async fn body(&mut self) -> Vec<String> {
            let mut lines = vec![];
            loop {
                let line = self.line().await;
                if line == "." {
                    return lines;
                }
                lines.push(line.strip_prefix('.').unwrap_or(&line).to_string());
            }
        }

        async fn send(&mut self, text: &str) {
            self.client
                .get_mut()
                .write_all(format!("{text}\r\n").as_bytes())
                .await
                .unwrap();
        }
    }

    async fn session_with_messages(count: usize) -> TestSession {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(0, 0));
        let manager = MessageManager::new(
            store,
            Arc::new(Hub::new(64)),
            AddressPolicy::default(),
            0,
        );
        for n in 0..count {
            manager
                .deliver(
                    "origin",
                    &EnvelopeAddress::parse("a@x.example").unwrap(),
                    &[EnvelopeAddress::parse("u@y.example").unwrap()],
                    format!("Subject: m{n}\r\n\r\nbody {n}\r\n").as_bytes(),
                )
                .await
                .unwrap();
        }
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let session_manager = manager.clone();
        tokio::spawn(async move {
            run_session(
                server_side,
                "127.0.0.1:0".parse().unwrap(),
                Arc::new(Pop3Params::default()),
                session_manager,
            )
            .await
            .ok();
        });
        let mut session = TestSession {
            client: BufReader::new(client),
            manager,
        };
        session.expect_ok().await;
        session
    }

    async fn authenticate(session: &mut TestSession) {
        session.send("USER u").await;
        session.expect_ok().await;
        session.send("PASS whatever").await;
        session.expect_ok().await;
    }

    #[tokio::test]
    async fn stat_list_and_uidl() {
        let mut session = session_with_messages(3).await;
        authenticate(&mut session).await;

        session.send("STAT").await;
        let stat = session.expect_ok().await;
        assert!(stat.starts_with("+OK 3 "));

        session.send("LIST").await;
        session.expect_ok().await;
        assert_equal!(session.body().await.len(), 3);

        session.send("UIDL").await;
        session.expect_ok().await;
        let uidls = session.body().await;
        assert_equal!(uidls.len(), 3);
        assert!(uidls[0].starts_with("1 "));
    }

    #[tokio::test]
    async fn retr_returns_source_and_marks_seen() {
        let mut session = session_with_messages(1).await;
        authenticate(&mut session).await;

        session.send("RETR 1").await;
        session.expect_ok().await;
        let body = session.body().await;
        assert_equal!(body, vec!["Subject: m0", "", "body 0"]);

        let listing = session.manager.get_messages("u").await.unwrap();
        assert!(listing[0].seen);
    }

    #[tokio::test]
    async fn dele_applies_on_quit_only() {
        let mut session = session_with_messages(2).await;
        authenticate(&mut session).await;

        session.send("DELE 1").await;
        session.expect_ok().await;
        // Deleted messages vanish from the session view...
        session.send("STAT").await;
        let stat = session.expect_ok().await;
        assert!(stat.starts_with("+OK 1 "));
        session.send("RETR 1").await;
        session.expect_err().await;
        // ...but stay in the store until QUIT.
        assert_equal!(session.manager.get_messages("u").await.unwrap().len(), 2);

        session.send("QUIT").await;
        session.expect_ok().await;
        let listing = session.manager.get_messages("u").await.unwrap();
        assert_equal!(listing.len(), 1);
        assert_equal!(listing[0].subject, "m1");
    }

    #[tokio::test]
    async fn rset_unstages_deletions() {
        let mut session = session_with_messages(1).await;
        authenticate(&mut session).await;

        session.send("DELE 1").await;
        session.expect_ok().await;
        session.send("RSET").await;
        session.expect_ok().await;
        session.send("QUIT").await;
        session.expect_ok().await;
        assert_equal!(session.manager.get_messages("u").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commands_require_authentication() {
        let mut session = session_with_messages(1).await;
        session.send("STAT").await;
        session.expect_err().await;
        session.send("PASS x").await;
        session.expect_err().await;
        session.send("QUIT").await;
        session.expect_ok().await;
    }
}
