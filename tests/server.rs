use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

use missive::auth::AuthStore;
use missive::imap::fetch::FetchArg;
use missive::imap::search::SearchArg;
use missive::mail::{
    FetchItem, FlagMode, Mailbox, MailboxId, Mailstore, MessageFetchResponse, NOINFERIORS,
};
use missive::server::Server;

struct ScriptedMailstore;

#[async_trait]
impl Mailstore for ScriptedMailstore {
    async fn get_mailbox(&self, path: &[String]) -> Result<Option<Mailbox>> {
        if path == ["missing".to_string()] {
            return Ok(None);
        }
        Ok(Some(Mailbox {
            name: path.join("/"),
            path: path.to_vec(),
            id: MailboxId(path.join("/")),
            uid_validity: 7,
            flags: NOINFERIORS,
        }))
    }

    async fn get_mailboxes(&self, _path: &[String]) -> Result<Vec<Mailbox>> {
        Ok(Vec::new())
    }

    async fn first_unseen(&self, _mbox: &MailboxId) -> Result<i64> {
        Ok(1)
    }

    async fn total_messages(&self, _mbox: &MailboxId) -> Result<i64> {
        Ok(2)
    }

    async fn recent_messages(&self, _mbox: &MailboxId) -> Result<i64> {
        Ok(0)
    }

    async fn next_uid(&self, _mbox: &MailboxId) -> Result<i64> {
        Ok(0)
    }

    async fn count_unseen(&self, _mbox: &MailboxId) -> Result<i64> {
        Ok(1)
    }

    async fn append_message(
        &self,
        _mailbox: &str,
        _flags: &[String],
        _date_time: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    ) -> Result<()> {
        assert_eq!(message, b"hello");
        Ok(())
    }

    async fn search(
        &self,
        _mbox: &MailboxId,
        _args: &[SearchArg],
        _return_uid: bool,
    ) -> Result<Vec<usize>> {
        Ok(vec![1, 2])
    }

    async fn fetch(
        &self,
        _mbox: &MailboxId,
        _sequence_set: &str,
        _args: &[FetchArg],
        _use_uids: bool,
    ) -> Result<Vec<MessageFetchResponse>> {
        Ok(vec![MessageFetchResponse {
            id: "1".to_string(),
            items: vec![FetchItem::single("FLAGS", "(\\Seen)")],
        }])
    }

    async fn flag(
        &self,
        _mode: FlagMode,
        _mbox: &MailboxId,
        _sequence_set: &str,
        _use_uids: bool,
        _flags: &[String],
    ) -> Result<Vec<MessageFetchResponse>> {
        Ok(Vec::new())
    }
}

struct ScriptedAuthStore;

#[async_trait]
impl AuthStore for ScriptedAuthStore {
    async fn authenticate(&self, username: &str, plain_password: &str) -> Result<bool> {
        Ok(username == "lx" && plain_password == "plop")
    }
    async fn create_user(&self, _u: &str, _p: &str) -> Result<()> {
        Ok(())
    }
    async fn reset_password(&self, _u: &str, _p: &str) -> Result<()> {
        Ok(())
    }
    async fn list_users(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn delete_user(&self, _u: &str) -> Result<()> {
        Ok(())
    }
}

async fn start_server() -> (SocketAddr, watch::Sender<bool>) {
    let server = Server::new()
        .listen("127.0.0.1:0")
        .store(Arc::new(ScriptedMailstore))
        .auth(Arc::new(ScriptedAuthStore));
    let bound = server.bind().await.expect("bind on an ephemeral port");
    let addr = bound.local_addrs()[0];

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn(bound.run(exit_rx));
    (addr, exit_tx)
}

async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut stream = BufReader::new(stream);
    let greeting = read_line(&mut stream).await;
    assert_eq!(greeting, "* OK IMAP4rev1 Service Ready");
    stream
}

async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    stream.read_line(&mut line).await.expect("read line");
    line.trim_end().to_string()
}

async fn send(stream: &mut BufReader<TcpStream>, line: &str) {
    stream
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .expect("write line");
}

#[tokio::test]
async fn session_walkthrough() {
    let (addr, _exit) = start_server().await;
    let mut stream = connect(addr).await;

    send(&mut stream, "a1 CAPABILITY").await;
    assert_eq!(read_line(&mut stream).await, "* CAPABILITY IMAP4rev1");
    assert_eq!(read_line(&mut stream).await, "a1 OK CAPABILITY completed");

    // Not selected yet: FETCH is inadmissible, no state change.
    send(&mut stream, "a2 FETCH 1 FLAGS").await;
    assert_eq!(read_line(&mut stream).await, "a2 BAD FETCH not selected");

    send(&mut stream, "a3 LOGIN lx wrong").await;
    assert_eq!(read_line(&mut stream).await, "a3 NO LOGIN failure");

    send(&mut stream, "a4 LOGIN lx plop").await;
    assert_eq!(read_line(&mut stream).await, "a4 OK LOGIN completed");

    send(&mut stream, "a5 LOGIN lx plop").await;
    assert_eq!(read_line(&mut stream).await, "a5 BAD LOGIN already logged in");

    send(&mut stream, "a6 SELECT INBOX").await;
    assert_eq!(read_line(&mut stream).await, "* 2 EXISTS");
    assert_eq!(read_line(&mut stream).await, "* 0 RECENT");
    assert_eq!(
        read_line(&mut stream).await,
        "* OK [PERMANENTFLAGS (\\*)] Limited"
    );
    assert_eq!(
        read_line(&mut stream).await,
        "* OK [UNSEEN 1] Message 1 is first unseen"
    );
    assert_eq!(read_line(&mut stream).await, "* OK [UIDVALIDITY 7] UIDs valid");
    assert_eq!(
        read_line(&mut stream).await,
        "a6 OK [READ-WRITE] SELECT completed"
    );

    send(&mut stream, "a7 SEARCH ALL").await;
    assert_eq!(read_line(&mut stream).await, "* SEARCH 1 2");
    assert_eq!(read_line(&mut stream).await, "a7 OK SEARCH completed");

    send(&mut stream, "a8 FETCH 1 FLAGS").await;
    assert_eq!(read_line(&mut stream).await, "* 1 FETCH (FLAGS (\\Seen))");
    assert_eq!(read_line(&mut stream).await, "a8 OK FETCH completed");

    send(&mut stream, "a9 LOGOUT").await;
    assert_eq!(
        read_line(&mut stream).await,
        "* BYE IMAP4rev1 Server logging out"
    );
    assert_eq!(read_line(&mut stream).await, "a9 OK LOGOUT completed");

    // The server closed the connection.
    assert_eq!(read_line(&mut stream).await, "");
}

#[tokio::test]
async fn append_round_trips_through_a_continuation() {
    let (addr, _exit) = start_server().await;
    let mut stream = connect(addr).await;

    send(&mut stream, "a1 LOGIN lx plop").await;
    assert_eq!(read_line(&mut stream).await, "a1 OK LOGIN completed");

    send(&mut stream, "a2 APPEND saved {5}").await;
    assert_eq!(read_line(&mut stream).await, "+ Ready for literal data");

    send(&mut stream, "hello").await;
    assert_eq!(read_line(&mut stream).await, "a2 OK APPEND completed");
}

#[tokio::test]
async fn unparseable_input_is_fatal() {
    let (addr, _exit) = start_server().await;
    let mut stream = connect(addr).await;

    // '(' can never start a tag; the server answers once and hangs up.
    send(&mut stream, "((( NOOP").await;
    assert_eq!(read_line(&mut stream).await, "* BAD Invalid input");
    assert_eq!(read_line(&mut stream).await, "");
}

#[tokio::test]
async fn malformed_arguments_get_a_tagged_bad_and_the_session_survives() {
    let (addr, _exit) = start_server().await;
    let mut stream = connect(addr).await;

    send(&mut stream, "a1 STORE x FLAGS (\\Seen)").await;
    assert_eq!(read_line(&mut stream).await, "a1 BAD no sequence set");

    send(&mut stream, "a2 NOOP").await;
    assert_eq!(read_line(&mut stream).await, "a2 OK NOOP Completed");
}

#[tokio::test]
async fn unknown_commands_get_a_tagged_bad() {
    let (addr, _exit) = start_server().await;
    let mut stream = connect(addr).await;

    send(&mut stream, "a1 FROBNICATE").await;
    assert_eq!(read_line(&mut stream).await, "a1 BAD FROBNICATE unknown command");

    // The connection survives.
    send(&mut stream, "a2 NOOP").await;
    assert_eq!(read_line(&mut stream).await, "a2 OK NOOP Completed");
}
