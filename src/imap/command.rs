use chrono::{DateTime, FixedOffset};
use tokio::io::AsyncBufRead;

use crate::imap::fetch::FetchArg;
use crate::imap::flow::{Encryption, State};
use crate::imap::lexer::Lexer;
use crate::imap::response::Response;
use crate::imap::search::aggregate_search_arguments;
use crate::imap::session::{path_to_slice, Session, PATH_DELIMITER};
use crate::mail::{FlagMode, MessageFetchResponse};

/// APPEND is a two-phase command: the first execution answers the literal
/// continuation, the second reads the message body and stores it.
#[derive(Debug)]
pub struct Append {
    pub tag: String,
    pub mailbox: String,
    pub flags: Vec<String>,
    pub date_time: Option<DateTime<FixedOffset>>,
    pub message_length: u64,
    pub ready: bool,
}

/// SEARCH arguments may carry literals, so the argument bytes are
/// aggregated across continuation lines before parsing.
#[derive(Debug)]
pub struct Search {
    pub tag: String,
    pub return_uid: bool,
    pub full_line: Vec<u8>,
    pub continuing: bool,
}

/// A parsed IMAP command, one case per verb.
#[derive(Debug)]
pub enum Command {
    Noop {
        tag: String,
    },
    Check {
        tag: String,
    },
    Capability {
        tag: String,
    },
    StartTls {
        tag: String,
    },
    Login {
        tag: String,
        user_id: String,
        password: String,
    },
    Logout {
        tag: String,
    },
    Select {
        tag: String,
        mailbox: String,
    },
    Status {
        tag: String,
        mailbox: String,
        params: Vec<String>,
    },
    List {
        tag: String,
        reference: String,
        pattern: String,
    },
    Append(Append),
    Search(Search),
    Fetch {
        tag: String,
        sequence_set: String,
        args: Vec<FetchArg>,
        use_uids: bool,
    },
    Store {
        tag: String,
        sequence_set: String,
        mode: FlagMode,
        silent: bool,
        flags: Vec<String>,
        use_uids: bool,
    },
    Unknown {
        tag: String,
        name: String,
    },
}

impl Command {
    pub fn tag(&self) -> &str {
        match self {
            Command::Noop { tag }
            | Command::Check { tag }
            | Command::Capability { tag }
            | Command::StartTls { tag }
            | Command::Login { tag, .. }
            | Command::Logout { tag }
            | Command::Select { tag, .. }
            | Command::Status { tag, .. }
            | Command::List { tag, .. }
            | Command::Fetch { tag, .. }
            | Command::Store { tag, .. }
            | Command::Unknown { tag, .. } => tag,
            Command::Append(ac) => &ac.tag,
            Command::Search(sc) => &sc.tag,
        }
    }

    /// Executes the command against the session, producing the response.
    /// Multi-phase commands keep their state on the command value and
    /// report `done == false` until they have finished.
    pub async fn execute<R>(&mut self, sess: &mut Session, lexer: &mut Lexer, rd: &mut R) -> Response
    where
        R: AsyncBufRead + Unpin + Send,
    {
        match self {
            Command::Noop { tag } => Response::ok(tag, "NOOP Completed"),

            Command::Check { tag } => Response::ok(tag, "CHECK Completed"),

            Command::Capability { tag } => capability(sess, tag),

            Command::StartTls { tag } => starttls(sess, tag),

            Command::Login {
                tag,
                user_id,
                password,
            } => login(sess, tag, user_id, password).await,

            Command::Logout { tag } => {
                sess.state = State::Unauthenticated;
                Response::ok(tag, "LOGOUT completed")
                    .extra("BYE IMAP4rev1 Server logging out")
                    .should_close()
            }

            Command::Select { tag, mailbox } => select(sess, tag, mailbox).await,

            Command::Status {
                tag,
                mailbox,
                params,
            } => status(sess, tag, mailbox, params).await,

            Command::List {
                tag,
                reference,
                pattern,
            } => list(sess, tag, reference, pattern).await,

            Command::Append(ac) => append(sess, ac, lexer, rd).await,

            Command::Search(sc) => search(sess, sc, lexer, rd).await,

            Command::Fetch {
                tag,
                sequence_set,
                args,
                use_uids,
            } => {
                if sess.state < State::Selected {
                    return must_select(sess, tag, "FETCH");
                }
                if *use_uids {
                    args.push(FetchArg::text("UID"));
                }
                let mailbox_id = match &sess.mailbox {
                    Some(m) => m.id.clone(),
                    None => return must_select(sess, tag, "FETCH"),
                };
                match sess
                    .store
                    .fetch(&mailbox_id, sequence_set, args, *use_uids)
                    .await
                {
                    Ok(result) => fetch_lines(Response::ok(tag, "FETCH completed"), &result),
                    Err(e) => internal_error(sess, tag, "FETCH", e),
                }
            }

            Command::Store {
                tag,
                sequence_set,
                mode,
                silent,
                flags,
                use_uids,
            } => {
                if sess.state < State::Selected {
                    return must_select(sess, tag, "STORE");
                }
                let mailbox_id = match &sess.mailbox {
                    Some(m) => m.id.clone(),
                    None => return must_select(sess, tag, "STORE"),
                };
                match sess
                    .store
                    .flag(*mode, &mailbox_id, sequence_set, *use_uids, flags)
                    .await
                {
                    Ok(result) => {
                        let res = Response::ok(tag, "STORE completed");
                        if *silent {
                            res
                        } else {
                            fetch_lines(res, &result)
                        }
                    }
                    Err(e) => internal_error(sess, tag, "STORE", e),
                }
            }

            Command::Unknown { tag, name } => {
                let message = format!("{} unknown command", name);
                tracing::info!(session = %sess.id, "{}", message);
                Response::bad(tag, &message)
            }
        }
    }
}

fn capability(sess: &Session, tag: &str) -> Response {
    let mut commands: Vec<&str> = Vec::new();

    match sess.listener_encryption {
        Encryption::None => {}
        Encryption::StartTls => {
            if sess.encryption == Encryption::Tls {
                commands.push("AUTH=PLAIN");
            } else {
                commands.push("STARTTLS");
                commands.push("LOGINDISABLED");
            }
        }
        Encryption::Tls => commands.push("AUTH=PLAIN"),
    }

    let mut line = String::from("CAPABILITY IMAP4rev1");
    for c in commands {
        line.push(' ');
        line.push_str(c);
    }
    Response::ok(tag, "CAPABILITY completed").extra(line)
}

fn starttls(sess: &mut Session, tag: &str) -> Response {
    if sess.listener_encryption != Encryption::StartTls {
        return Response::bad(tag, "STARTTLS not supported");
    }
    if sess.encryption == Encryption::Tls {
        return Response::bad(tag, "STARTTLS TLS is already active");
    }

    // The driver performs the handshake right after writing this line and
    // drops any cleartext read-ahead.
    sess.encryption = Encryption::Tls;
    Response::ok(tag, "Begin TLS negotiation now").replace_buffers()
}

async fn login(sess: &mut Session, tag: &str, user_id: &str, password: &str) -> Response {
    if sess.state > State::Unauthenticated {
        let message = "LOGIN already logged in";
        tracing::info!(session = %sess.id, "{}", message);
        return Response::bad(tag, message);
    }

    match sess.auth.authenticate(user_id, password).await {
        Ok(true) => {
            sess.state = State::Authenticated;
            tracing::info!(session = %sess.id, user = %user_id, "connected");
            Response::ok(tag, "LOGIN completed")
        }
        Ok(false) => {
            tracing::info!(session = %sess.id, user = %user_id, "authentication failed");
            Response::no(tag, "LOGIN failure")
        }
        Err(e) => {
            tracing::warn!(session = %sess.id, user = %user_id, error = %e, "auth backend failure");
            Response::no(tag, "LOGIN failure")
        }
    }
}

async fn select(sess: &mut Session, tag: &str, mailbox: &str) -> Response {
    if sess.state < State::Authenticated {
        return must_authenticate(sess, tag, "SELECT");
    }

    let mbox = path_to_slice(mailbox);
    match sess.select_mailbox(&mbox).await {
        Err(e) => internal_error(sess, tag, "SELECT", e),
        Ok(false) => Response::no(tag, "SELECT No such mailbox"),
        Ok(true) => {
            sess.state = State::Selected;
            let res = Response::ok(tag, "[READ-WRITE] SELECT completed");
            match sess.add_mailbox_info(res).await {
                Ok(res) => res,
                Err(e) => internal_error(sess, tag, "SELECT", e),
            }
        }
    }
}

async fn status(sess: &mut Session, tag: &str, mailbox: &str, params: &[String]) -> Response {
    if sess.state < State::Authenticated {
        return must_authenticate(sess, tag, "STATUS");
    }

    let mbox = path_to_slice(mailbox);
    match sess.status_mailbox(&mbox).await {
        Err(e) => internal_error(sess, tag, "STATUS", e),
        Ok(false) => Response::no(tag, "STATUS No such mailbox"),
        Ok(true) => {
            let res = Response::ok(tag, "STATUS completed");
            match sess.add_status_mailbox_info(res, mailbox, params).await {
                Ok(res) => res,
                Err(e) => internal_error(sess, tag, "STATUS", e),
            }
        }
    }
}

async fn list(sess: &mut Session, tag: &str, reference: &str, pattern: &str) -> Response {
    if sess.state < State::Authenticated {
        return must_authenticate(sess, tag, "LIST");
    }

    // An empty pattern asks for the delimiter and the reference root.
    if pattern.is_empty() {
        return Response::ok(tag, "LIST completed").extra(format!(
            "LIST () \"{}\" {}",
            PATH_DELIMITER, reference
        ));
    }

    let reference = path_to_slice(reference);
    let pattern = path_to_slice(pattern);

    match sess.list(&reference, &pattern).await {
        Err(e) => internal_error(sess, tag, "LIST", e),
        Ok(mboxes) if mboxes.is_empty() => Response::no(tag, "LIST no results"),
        Ok(mboxes) => {
            let mut res = Response::ok(tag, "LIST completed");
            for mbox in mboxes {
                res = res.extra(format!(
                    "LIST ({}) \"{}\" {}",
                    mbox.flag_names(),
                    PATH_DELIMITER,
                    mbox.path.join(&PATH_DELIMITER.to_string())
                ));
            }
            res
        }
    }
}

async fn append<R>(sess: &mut Session, ac: &mut Append, lexer: &mut Lexer, rd: &mut R) -> Response
where
    R: AsyncBufRead + Unpin + Send,
{
    if sess.state < State::Authenticated {
        return must_authenticate(sess, &ac.tag, "APPEND");
    }

    if !ac.ready {
        ac.ready = true;
        return Response::continuation("Ready for literal data");
    }

    let message = match lexer.literal_rest(rd, ac.message_length).await {
        Ok(m) => m,
        Err(e) => return Response::no(&ac.tag, &format!("Couldn't read message: {}", e)),
    };

    match sess
        .store
        .append_message(&ac.mailbox, &ac.flags, ac.date_time, message)
        .await
    {
        Ok(()) => Response::ok(&ac.tag, "APPEND completed"),
        Err(e) => {
            tracing::warn!(session = %sess.id, error = %e, "couldn't append message");
            Response::bad(&ac.tag, "Couldn't APPEND message")
        }
    }
}

async fn search<R>(sess: &mut Session, sc: &mut Search, lexer: &mut Lexer, rd: &mut R) -> Response
where
    R: AsyncBufRead + Unpin + Send,
{
    if sess.state < State::Selected {
        return must_select(sess, &sc.tag, "SEARCH");
    }

    if sc.continuing {
        if lexer.new_line(rd).await.is_err() {
            return Response::bad(&sc.tag, "SEARCH could not read continuation");
        }
    }

    // Aggregate the raw argument bytes; linefeeds separate the chunks the
    // same way they did on the wire.
    sc.full_line.extend_from_slice(lexer.rest_of_line());
    sc.full_line.push(b'\n');
    if lexer.line_ends_with(b'}') {
        sc.continuing = true;
        return Response::continuation("Continue");
    }
    sc.continuing = false;

    let args = match aggregate_search_arguments(&sc.full_line).await {
        Ok(args) => args,
        Err(e) => {
            tracing::debug!(session = %sess.id, error = %e, "couldn't parse search arguments");
            return Response::bad(&sc.tag, "SEARCH error with args");
        }
    };

    let mailbox_id = match &sess.mailbox {
        Some(m) => m.id.clone(),
        None => return must_select(sess, &sc.tag, "SEARCH"),
    };

    match sess.store.search(&mailbox_id, &args, sc.return_uid).await {
        Ok(messages) => {
            let list = messages
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            Response::ok(&sc.tag, "SEARCH completed").extra(format!("SEARCH {}", list))
        }
        Err(e) => internal_error(sess, &sc.tag, "SEARCH", e),
    }
}

/// Renders untagged FETCH lines for a backend answer.
fn fetch_lines(mut res: Response, result: &[MessageFetchResponse]) -> Response {
    for message_response in result {
        let line_elems: Vec<String> = message_response
            .items
            .iter()
            .map(|item| {
                let value = if item.values.len() == 1 {
                    item.values[0].clone()
                } else {
                    format!("({})", item.values.join(" "))
                };
                format!("{} {}", item.key, value)
            })
            .collect();
        res = res.extra(format!(
            "{} FETCH ({})",
            message_response.id,
            line_elems.join(" ")
        ));
    }
    res
}

//------ helpers --------------------------------------------------------------

/// Logs an internal failure and closes the connection after a NO. The
/// client only ever sees the one-line error description.
fn internal_error(sess: &Session, tag: &str, command_name: &str, err: anyhow::Error) -> Response {
    tracing::error!(session = %sess.id, command = command_name, error = %err, "internal error");
    Response::no(tag, &format!("{} {}", command_name, err)).should_close()
}

fn must_authenticate(sess: &Session, tag: &str, command_name: &str) -> Response {
    let message = format!("{} not authenticated", command_name);
    tracing::info!(session = %sess.id, "{}", message);
    Response::bad(tag, &message)
}

fn must_select(sess: &Session, tag: &str, command_name: &str) -> Response {
    let message = format!("{} not selected", command_name);
    tracing::info!(session = %sess.id, "{}", message);
    Response::bad(tag, &message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::io::BufReader;

    use crate::auth::{AuthStore, DummyAuthStore};
    use crate::imap::response::Status;
    use crate::mail::{
        FetchItem, FlagMode, Mailbox, MailboxId, Mailstore, MessageFetchResponse, NOINFERIORS,
    };

    struct TestMailstore;

    #[async_trait]
    impl Mailstore for TestMailstore {
        async fn get_mailbox(&self, path: &[String]) -> Result<Option<Mailbox>> {
            if path == ["missing".to_string()] {
                return Ok(None);
            }
            Ok(Some(Mailbox {
                name: path.join("/"),
                path: path.to_vec(),
                id: MailboxId(path.join("/")),
                uid_validity: 42,
                flags: NOINFERIORS,
            }))
        }

        async fn get_mailboxes(&self, path: &[String]) -> Result<Vec<Mailbox>> {
            if !path.is_empty() {
                return Ok(Vec::new());
            }
            Ok(["INBOX", "spam"]
                .iter()
                .map(|name| Mailbox {
                    name: name.to_string(),
                    path: vec![name.to_string()],
                    id: MailboxId(name.to_string()),
                    uid_validity: 42,
                    flags: NOINFERIORS,
                })
                .collect())
        }

        async fn first_unseen(&self, _mbox: &MailboxId) -> Result<i64> {
            Ok(4)
        }

        async fn total_messages(&self, _mbox: &MailboxId) -> Result<i64> {
            Ok(8)
        }

        async fn recent_messages(&self, _mbox: &MailboxId) -> Result<i64> {
            Ok(0)
        }

        async fn next_uid(&self, _mbox: &MailboxId) -> Result<i64> {
            Ok(0)
        }

        async fn count_unseen(&self, _mbox: &MailboxId) -> Result<i64> {
            Ok(3)
        }

        async fn append_message(
            &self,
            _mailbox: &str,
            _flags: &[String],
            _date_time: Option<DateTime<FixedOffset>>,
            _message: Vec<u8>,
        ) -> Result<()> {
            Ok(())
        }

        async fn search(
            &self,
            _mbox: &MailboxId,
            _args: &[crate::imap::search::SearchArg],
            _return_uid: bool,
        ) -> Result<Vec<usize>> {
            Ok(vec![2, 5])
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

    struct RejectingAuthStore;

    #[async_trait]
    impl AuthStore for RejectingAuthStore {
        async fn authenticate(&self, _u: &str, _p: &str) -> Result<bool> {
            Ok(false)
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

    fn test_session(listener_encryption: Encryption) -> Session {
        Session::new(
            "test".to_string(),
            listener_encryption,
            Arc::new(TestMailstore),
            Arc::new(DummyAuthStore),
        )
    }

    async fn run(sess: &mut Session, mut cmd: Command) -> Response {
        let mut lexer = Lexer::new();
        let mut rd = BufReader::new(&b""[..]);
        cmd.execute(sess, &mut lexer, &mut rd).await
    }

    #[tokio::test]
    async fn login_moves_to_authenticated() {
        let mut sess = test_session(Encryption::None);
        let resp = run(
            &mut sess,
            Command::Login {
                tag: "a1".into(),
                user_id: "lx".into(),
                password: "plop".into(),
            },
        )
        .await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(sess.state, State::Authenticated);
    }

    #[tokio::test]
    async fn login_twice_is_rejected_without_state_change() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        let resp = run(
            &mut sess,
            Command::Login {
                tag: "a2".into(),
                user_id: "lx".into(),
                password: "plop".into(),
            },
        )
        .await;
        assert_eq!(resp.status, Status::Bad);
        assert_eq!(sess.state, State::Authenticated);
    }

    #[tokio::test]
    async fn bad_credentials_get_a_no() {
        let mut sess = test_session(Encryption::None);
        sess.auth = Arc::new(RejectingAuthStore);
        let resp = run(
            &mut sess,
            Command::Login {
                tag: "a3".into(),
                user_id: "lx".into(),
                password: "wrong".into(),
            },
        )
        .await;
        assert_eq!(resp.status, Status::No);
        assert_eq!(sess.state, State::Unauthenticated);
    }

    #[tokio::test]
    async fn fetch_requires_a_selected_mailbox() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        let resp = run(
            &mut sess,
            Command::Fetch {
                tag: "a4".into(),
                sequence_set: "1".into(),
                args: vec![FetchArg::text("FLAGS")],
                use_uids: false,
            },
        )
        .await;
        assert_eq!(resp.status, Status::Bad);
        assert_eq!(sess.state, State::Authenticated);
    }

    #[tokio::test]
    async fn select_moves_to_selected_and_reports_the_mailbox() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        let resp = run(
            &mut sess,
            Command::Select {
                tag: "a5".into(),
                mailbox: "INBOX".into(),
            },
        )
        .await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(sess.state, State::Selected);
        assert!(resp.untagged.iter().any(|l| l == "8 EXISTS"));
        assert!(resp.untagged.iter().any(|l| l.contains("UIDVALIDITY 42")));
        // The backend cannot predict UIDNEXT, so the line is absent.
        assert!(!resp.untagged.iter().any(|l| l.contains("UIDNEXT")));
    }

    #[tokio::test]
    async fn select_missing_mailbox_is_a_no() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        let resp = run(
            &mut sess,
            Command::Select {
                tag: "a6".into(),
                mailbox: "missing".into(),
            },
        )
        .await;
        assert_eq!(resp.status, Status::No);
        assert_eq!(sess.state, State::Authenticated);
    }

    #[tokio::test]
    async fn capability_depends_on_encryption() {
        let mut sess = test_session(Encryption::StartTls);
        let resp = run(&mut sess, Command::Capability { tag: "a7".into() }).await;
        assert_eq!(
            resp.untagged,
            vec!["CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED".to_string()]
        );

        let resp = run(&mut sess, Command::StartTls { tag: "a8".into() }).await;
        assert_eq!(resp.status, Status::Ok);
        assert!(resp.replace_buffers);
        assert_eq!(sess.encryption, Encryption::Tls);

        let resp = run(&mut sess, Command::Capability { tag: "a9".into() }).await;
        assert_eq!(
            resp.untagged,
            vec!["CAPABILITY IMAP4rev1 AUTH=PLAIN".to_string()]
        );
    }

    #[tokio::test]
    async fn starttls_is_rejected_on_plain_listeners() {
        let mut sess = test_session(Encryption::None);
        let resp = run(&mut sess, Command::StartTls { tag: "a10".into() }).await;
        assert_eq!(resp.status, Status::Bad);
    }

    #[tokio::test]
    async fn logout_says_bye_and_closes() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        let resp = run(&mut sess, Command::Logout { tag: "a11".into() }).await;
        assert_eq!(resp.status, Status::Ok);
        assert!(resp.close_after);
        assert_eq!(resp.untagged, vec!["BYE IMAP4rev1 Server logging out".to_string()]);
        assert_eq!(sess.state, State::Unauthenticated);
    }

    #[tokio::test]
    async fn search_renders_the_id_list() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        run(
            &mut sess,
            Command::Select {
                tag: "a12".into(),
                mailbox: "INBOX".into(),
            },
        )
        .await;

        let mut cmd = Command::Search(Search {
            tag: "a13".into(),
            return_uid: false,
            full_line: Vec::new(),
            continuing: false,
        });
        // The lexer sits where the parser left it: on the argument bytes.
        let mut lexer = Lexer::new();
        let mut rd = BufReader::new(&b"ALL\r\n"[..]);
        lexer.new_line(&mut rd).await.unwrap();
        let resp = cmd.execute(&mut sess, &mut lexer, &mut rd).await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.untagged, vec!["SEARCH 2 5".to_string()]);
    }

    #[tokio::test]
    async fn fetch_renders_item_lines() {
        let mut sess = test_session(Encryption::None);
        sess.state = State::Authenticated;
        run(
            &mut sess,
            Command::Select {
                tag: "a14".into(),
                mailbox: "INBOX".into(),
            },
        )
        .await;
        let resp = run(
            &mut sess,
            Command::Fetch {
                tag: "a15".into(),
                sequence_set: "1".into(),
                args: vec![FetchArg::text("FLAGS")],
                use_uids: false,
            },
        )
        .await;
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.untagged, vec!["1 FETCH (FLAGS (\\Seen))".to_string()]);
    }
}
