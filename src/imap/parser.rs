use chrono::{DateTime, FixedOffset};
use tokio::io::AsyncBufRead;

use crate::imap::command::{Append, Command, Search};
use crate::imap::fetch;
use crate::imap::lexer::{Lexer, ParseError};
use crate::imap::sequence;
use crate::mail::FlagMode;

const DATETIME_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// Recognizes command verbs and drives the per-command argument parsers.
/// Owns the lexer; the connection driver owns the transport.
pub struct Parser {
    pub lexer: Lexer,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            lexer: Lexer::new(),
        }
    }

    /// Reads the next command. Commands always start on a fresh line with
    /// a tag and a verb; an unrecognized verb still parses, as `Unknown`,
    /// so it can be answered with a tagged BAD.
    ///
    /// A syntax failure past the tag leaves the stream line-synchronized
    /// (the lexer buffers whole lines), so it is reported as a recoverable
    /// `Bad` carrying the tag. Literal and I/O failures stay fatal.
    pub async fn next<R>(&mut self, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.lexer.new_line(rd).await?;
        let tag = self.expect_tag()?;

        match self.command(tag.clone(), rd).await {
            Err(ParseError::Syntax(message)) => Err(ParseError::Bad { tag, message }),
            other => other,
        }
    }

    async fn command<R>(&mut self, tag: String, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let raw_command = self.expect_astring(rd).await?;

        let mut command = raw_command.to_lowercase();
        let mut uid_mod = false;
        if command == "uid" {
            uid_mod = true;
            command = self.expect_astring(rd).await?.to_lowercase();
        }

        match command.as_str() {
            "noop" => Ok(Command::Noop { tag }),
            "check" => Ok(Command::Check { tag }),
            "capability" => Ok(Command::Capability { tag }),
            "starttls" => Ok(Command::StartTls { tag }),
            "login" => self.login(tag, rd).await,
            "logout" => Ok(Command::Logout { tag }),
            "select" => self.select(tag, rd).await,
            "status" => self.status(tag, rd).await,
            "list" => self.list(tag, rd).await,
            "append" => self.append(tag, rd).await,
            "search" => self.search(tag, uid_mod),
            "fetch" => self.fetch(tag, uid_mod, rd).await,
            "store" => self.store(tag, uid_mod, rd).await,
            _ => Ok(Command::Unknown {
                tag,
                name: raw_command,
            }),
        }
    }

    async fn login<R>(&mut self, tag: String, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let user_id = self.expect_astring(rd).await?;
        let password = self.expect_astring(rd).await?;
        Ok(Command::Login {
            tag,
            user_id,
            password,
        })
    }

    async fn select<R>(&mut self, tag: String, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mailbox = self.expect_astring(rd).await?;
        Ok(Command::Select { tag, mailbox })
    }

    async fn status<R>(&mut self, tag: String, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mailbox = self.expect_astring(rd).await?;
        let elements = self
            .lexer
            .list_strings()
            .ok_or_else(|| ParseError::syntax("invalid list of status items"))?;
        let params = elements.into_iter().map(|e| e.string_value).collect();
        Ok(Command::Status {
            tag,
            mailbox,
            params,
        })
    }

    async fn list<R>(&mut self, tag: String, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut reference = self.expect_astring(rd).await?;
        if reference.eq_ignore_ascii_case("inbox") {
            reference = "INBOX".to_string();
        }
        let pattern = self
            .lexer
            .list_mailbox(rd)
            .await
            .ok_or_else(|| self.unexpected())?;
        Ok(Command::List {
            tag,
            reference,
            pattern,
        })
    }

    async fn append<R>(&mut self, tag: String, rd: &mut R) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mailbox = self.expect_astring(rd).await?;

        let mut flags = Vec::new();
        let mut date_time: Option<DateTime<FixedOffset>> = None;
        let message_length;

        // Optional flag list and datetime, then the message literal whose
        // body arrives after the continuation.
        loop {
            self.lexer.skip_space();
            self.lexer.start_token();

            match self.lexer.current() {
                b'(' => {
                    let elements = self
                        .lexer
                        .list_strings()
                        .ok_or_else(|| ParseError::syntax("invalid flag list"))?;
                    flags = elements.into_iter().map(|e| e.string_value).collect();
                }
                b'"' => {
                    self.lexer.consume();
                    let raw = self.lexer.qstring()?;
                    let parsed = DateTime::parse_from_str(&raw, DATETIME_FORMAT)
                        .map_err(|e| ParseError::Syntax(format!("invalid datetime: {}", e)))?;
                    date_time = Some(parsed);
                }
                b'{' => {
                    self.lexer.consume();
                    message_length = self.lexer.literal_length()?;
                    break;
                }
                c => {
                    return Err(ParseError::Syntax(format!(
                        "parser unexpected {:?}",
                        c as char
                    )));
                }
            }
        }

        Ok(Command::Append(Append {
            tag,
            mailbox,
            flags,
            date_time,
            message_length,
            ready: false,
        }))
    }

    fn search(&mut self, tag: String, return_uid: bool) -> Result<Command, ParseError> {
        // Argument parsing happens at execution time: the arguments may
        // span continuation lines when they carry literals.
        self.lexer.skip_space();
        Ok(Command::Search(Search {
            tag,
            return_uid,
            full_line: Vec::new(),
            continuing: false,
        }))
    }

    async fn fetch<R>(
        &mut self,
        tag: String,
        use_uids: bool,
        rd: &mut R,
    ) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let (sequence_set, args) = fetch::fetch_arguments(&mut self.lexer, rd).await?;
        Ok(Command::Fetch {
            tag,
            sequence_set,
            args,
            use_uids,
        })
    }

    async fn store<R>(
        &mut self,
        tag: String,
        use_uids: bool,
        rd: &mut R,
    ) -> Result<Command, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.lexer.skip_space();

        let sequence_set = self
            .lexer
            .nonquoted(b" ")
            .filter(|s| sequence::is_valid(s))
            .ok_or_else(|| ParseError::syntax("no sequence set"))?;

        self.lexer.skip_space();
        let item_name = self
            .lexer
            .astring(rd)
            .await
            .ok_or_else(|| ParseError::syntax("invalid item name"))?;
        let (mode, silent) = parse_store_item(&item_name)?;

        self.lexer.skip_space();
        let elements = self
            .lexer
            .list_strings()
            .ok_or_else(|| ParseError::syntax("no flags"))?;
        let flags = elements.into_iter().map(|e| e.string_value).collect();

        Ok(Command::Store {
            tag,
            sequence_set,
            mode,
            silent,
            flags,
            use_uids,
        })
    }

    fn expect_tag(&mut self) -> Result<String, ParseError> {
        self.lexer.tag().ok_or_else(|| self.unexpected())
    }

    async fn expect_astring<R>(&mut self, rd: &mut R) -> Result<String, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        match self.lexer.astring(rd).await {
            Some(s) => Ok(s),
            None => Err(self.unexpected()),
        }
    }

    fn unexpected(&self) -> ParseError {
        ParseError::Syntax(format!(
            "parser unexpected {:?}",
            self.lexer.current() as char
        ))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a STORE data item name to the flag mode and its silent variant.
fn parse_store_item(item_name: &str) -> Result<(FlagMode, bool), ParseError> {
    let upper = item_name.to_ascii_uppercase();
    let (mode, rest) = match upper.strip_prefix('+') {
        Some(rest) => (FlagMode::Add, rest),
        None => match upper.strip_prefix('-') {
            Some(rest) => (FlagMode::Remove, rest),
            None => (FlagMode::Set, upper.as_str()),
        },
    };
    match rest {
        "FLAGS" => Ok((mode, false)),
        "FLAGS.SILENT" => Ok((mode, true)),
        _ => Err(ParseError::Syntax(format!(
            "invalid STORE item: {:?}",
            item_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(input: &'static [u8]) -> Result<Command, ParseError> {
        let mut rd = BufReader::new(input);
        let mut parser = Parser::new();
        parser.next(&mut rd).await
    }

    #[tokio::test]
    async fn bare_commands() {
        assert!(matches!(
            parse(b"a1 NOOP\r\n").await.unwrap(),
            Command::Noop { .. }
        ));
        assert!(matches!(
            parse(b"a2 capability\r\n").await.unwrap(),
            Command::Capability { .. }
        ));
        assert!(matches!(
            parse(b"a3 LOGOUT\r\n").await.unwrap(),
            Command::Logout { .. }
        ));
    }

    #[tokio::test]
    async fn login_with_quoted_and_literal_arguments() {
        match parse(b"a1 LOGIN \"l x\" {4}\r\nplop\r\n").await.unwrap() {
            Command::Login {
                tag,
                user_id,
                password,
            } => {
                assert_eq!(tag, "a1");
                assert_eq!(user_id, "l x");
                assert_eq!(password, "plop");
            }
            other => panic!("expected LOGIN, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn select_takes_a_mailbox() {
        match parse(b"a2 SELECT INBOX\r\n").await.unwrap() {
            Command::Select { mailbox, .. } => assert_eq!(mailbox, "INBOX"),
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_takes_an_item_list() {
        match parse(b"a3 STATUS INBOX (MESSAGES UNSEEN)\r\n").await.unwrap() {
            Command::Status {
                mailbox, params, ..
            } => {
                assert_eq!(mailbox, "INBOX");
                assert_eq!(params, vec!["MESSAGES".to_string(), "UNSEEN".to_string()]);
            }
            other => panic!("expected STATUS, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_normalizes_the_inbox_reference() {
        match parse(b"a4 LIST inbox *\r\n").await.unwrap() {
            Command::List {
                reference, pattern, ..
            } => {
                assert_eq!(reference, "INBOX");
                assert_eq!(pattern, "*");
            }
            other => panic!("expected LIST, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn append_with_flags_datetime_and_literal() {
        match parse(b"a5 APPEND saved (\\Seen) \"05-Jan-2016 12:30:00 +0100\" {310}\r\n")
            .await
            .unwrap()
        {
            Command::Append(ac) => {
                assert_eq!(ac.mailbox, "saved");
                assert_eq!(ac.flags, vec!["\\Seen".to_string()]);
                assert!(ac.date_time.is_some());
                assert_eq!(ac.message_length, 310);
                assert!(!ac.ready);
            }
            other => panic!("expected APPEND, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn append_rejects_garbage_arguments() {
        assert!(parse(b"a5 APPEND saved bogus {10}\r\n").await.is_err());
        assert!(parse(b"a5 APPEND saved \"not a date\" {10}\r\n").await.is_err());
    }

    #[tokio::test]
    async fn uid_prefix_marks_the_command() {
        match parse(b"a6 UID FETCH 1:* FLAGS\r\n").await.unwrap() {
            Command::Fetch { use_uids, .. } => assert!(use_uids),
            other => panic!("expected FETCH, got {:?}", other),
        }
        match parse(b"a7 UID SEARCH\r\n").await.unwrap() {
            Command::Search(sc) => assert!(sc.return_uid),
            other => panic!("expected SEARCH, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn store_modes() {
        match parse(b"a8 STORE 2:4 +FLAGS (\\Deleted)\r\n").await.unwrap() {
            Command::Store {
                mode,
                silent,
                flags,
                sequence_set,
                ..
            } => {
                assert_eq!(mode, FlagMode::Add);
                assert!(!silent);
                assert_eq!(sequence_set, "2:4");
                assert_eq!(flags, vec!["\\Deleted".to_string()]);
            }
            other => panic!("expected STORE, got {:?}", other),
        }

        match parse(b"a9 STORE 1 FLAGS.SILENT (\\Seen)\r\n").await.unwrap() {
            Command::Store { mode, silent, .. } => {
                assert_eq!(mode, FlagMode::Set);
                assert!(silent);
            }
            other => panic!("expected STORE, got {:?}", other),
        }

        assert!(parse(b"a10 STORE 1 WRONG (\\Seen)\r\n").await.is_err());
        assert!(parse(b"a11 STORE x FLAGS (\\Seen)\r\n").await.is_err());
    }

    #[tokio::test]
    async fn unknown_commands_keep_their_tag() {
        match parse(b"a12 FROBNICATE x\r\n").await.unwrap() {
            Command::Unknown { tag, name } => {
                assert_eq!(tag, "a12");
                assert_eq!(name, "FROBNICATE");
            }
            other => panic!("expected UNKNOWN, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn end_of_stream_is_eof() {
        assert!(matches!(parse(b"").await, Err(ParseError::Eof)));
    }

    #[tokio::test]
    async fn syntax_failures_past_the_tag_are_recoverable() {
        match parse(b"a13 LOGIN useronly\r\n").await {
            Err(ParseError::Bad { tag, .. }) => assert_eq!(tag, "a13"),
            other => panic!("expected a recoverable BAD, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn a_missing_tag_is_fatal() {
        assert!(matches!(
            parse(b"((( NOOP\r\n").await,
            Err(ParseError::Syntax(_))
        ));
    }
}
