use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Errors surfaced by the lexer and the command parser.
///
/// `Eof` means the peer closed the stream between commands; the driver
/// closes the connection without a response. `Bad` is a malformed command
/// whose line boundary is intact: the driver answers a tagged BAD and
/// keeps the connection. Everything else prevents resynchronization and
/// gets a single fatal BAD line before the connection drops.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("end of stream")]
    Eof,
    #[error("{0}")]
    Syntax(String),
    #[error("{message}")]
    Bad { tag: String, message: String },
    #[error("{0}")]
    Literal(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }
}

const CR: u8 = 0x0d;
const LF: u8 = 0x0a;
const SPACE: u8 = 0x20;
const DOUBLE_QUOTE: u8 = 0x22;
const LEFT_CURLY: u8 = 0x7b;
const RIGHT_CURLY: u8 = 0x7d;
const LEFT_PARENTHESIS: u8 = 0x28;
const RIGHT_PARENTHESIS: u8 = 0x29;
const BACKSLASH: u8 = 0x5c;

/// Chars excluded from the astring charset.
const ASTRING_EXCEPTIONS: &[u8] = b" ()%*\\{";
/// Chars excluded from the tag charset.
const TAG_EXCEPTIONS: &[u8] = b" ()%*\\{+";
/// Chars excluded from the list-mailbox charset (wildcards stay in).
const LIST_MAILBOX_EXCEPTIONS: &[u8] = b" ()]\\{";
/// Chars that delimit search string tokens.
const SEARCH_STRING_EXCEPTIONS: &[u8] = b" ()%\\{";

/// A single cell in a parenthesized list as defined by RFC 3501 4.4:
/// either a string value or a nested list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub string_value: String,
    pub children: Vec<Element>,
}

/// Line-buffered byte cursor over the connection.
///
/// The lexer owns the current line and its cursor but not the transport:
/// every operation that may pull bytes takes the reader as an argument, so
/// the connection driver keeps ownership of the stream (it needs it back
/// for the STARTTLS rewrap). Past the end of the line, `current` and
/// `consume` yield LF as an in-band sentinel; `consume` never crosses a
/// line boundary.
pub struct Lexer {
    /// The current line, CRLF stripped.
    line: Vec<u8>,
    /// Index of the current byte.
    idx: usize,
    /// Start positions of tokens, for rewinding.
    tokens: Vec<usize>,
    /// True once the line has been entirely consumed.
    done: bool,
}

impl Lexer {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            idx: 0,
            tokens: Vec::new(),
            done: true,
        }
    }

    //-------- IMAP tokens ----------------------------------------------------

    /// Reads an astring: bare atom, quoted string or literal.
    pub async fn astring<R>(&mut self, rd: &mut R) -> Option<String>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.skip_space();
        self.start_token();
        self.general_string(rd, ASTRING_EXCEPTIONS).await
    }

    /// Reads a search token. `(` and `)` are emitted as their own tokens.
    pub async fn search_string<R>(&mut self, rd: &mut R) -> Option<String>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.skip_space();
        self.start_token();

        match self.current() {
            LEFT_PARENTHESIS => {
                self.consume();
                Some("(".to_string())
            }
            RIGHT_PARENTHESIS => {
                self.consume();
                Some(")".to_string())
            }
            _ => self.general_string(rd, SEARCH_STRING_EXCEPTIONS).await,
        }
    }

    /// Reads a command tag.
    pub fn tag(&mut self) -> Option<String> {
        self.skip_space();
        self.start_token();
        self.nonquoted(TAG_EXCEPTIONS)
    }

    /// Reads a list-mailbox pattern (wildcards allowed).
    pub async fn list_mailbox<R>(&mut self, rd: &mut R) -> Option<String>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.skip_space();
        self.start_token();
        self.general_string(rd, LIST_MAILBOX_EXCEPTIONS).await
    }

    /// Parses a parenthesized, space-separated list of atoms or nested
    /// lists. Returns `None` if the input is not a well-formed list.
    pub fn list_strings(&mut self) -> Option<Vec<Element>> {
        self.skip_space();
        self.start_token();

        if self.current() != LEFT_PARENTHESIS {
            return None;
        }
        self.consume();

        let mut elements = Vec::new();
        let mut e = Element::default();

        loop {
            match self.current() {
                // Parsing should end naturally at the last ')'.
                LF => return None,
                LEFT_PARENTHESIS => {
                    e.children = self.list_strings()?;
                    elements.push(std::mem::take(&mut e));
                }
                SPACE => {
                    elements.push(std::mem::take(&mut e));
                }
                RIGHT_PARENTHESIS => {
                    if !e.string_value.is_empty() || !e.children.is_empty() {
                        elements.push(e);
                    }
                    break;
                }
                b => {
                    e.string_value.push(b as char);
                }
            }
            self.consume();
        }

        // Discard the closing ')'.
        self.consume();
        Some(elements)
    }

    /// Reads a quoted string; the opening quote is already consumed.
    /// Backslash escapes exactly one byte; raw CR or LF is an error.
    pub fn qstring(&mut self) -> Result<String, ParseError> {
        let mut buffer = Vec::with_capacity(16);

        loop {
            match self.current() {
                DOUBLE_QUOTE => break,
                CR | LF => {
                    return Err(ParseError::syntax("unexpected CR/LF in quoted string"));
                }
                BACKSLASH => {
                    let escaped = self.consume();
                    if escaped == LF {
                        return Err(ParseError::syntax("unexpected CR/LF in quoted string"));
                    }
                    buffer.push(escaped);
                }
                b => buffer.push(b),
            }
            self.consume();
        }

        // Ignore the closing quote.
        self.consume();
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Reads the length of a literal; the opening `{` is already consumed.
    /// Stops one byte past the closing `}`.
    pub fn literal_length(&mut self) -> Result<u64, ParseError> {
        let mut digits = Vec::with_capacity(8);

        loop {
            match self.current() {
                RIGHT_CURLY => break,
                b if b.is_ascii_digit() => digits.push(b),
                b => {
                    return Err(ParseError::Literal(format!(
                        "unexpected character {:?} in literal length",
                        b as char
                    )));
                }
            }
            self.consume();
        }
        self.consume();

        let length: u64 = std::str::from_utf8(&digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ParseError::Literal("invalid literal length".to_string()))?;
        if length == 0 {
            return Err(ParseError::Literal("literal length must be positive".to_string()));
        }
        Ok(length)
    }

    /// Reads the body of a literal whose length is already known: first
    /// drains what is left of the current line, then reads the remainder
    /// from the stream, then resets the cursor onto a fresh line. Short
    /// reads are errors.
    pub async fn literal_rest<R>(&mut self, rd: &mut R, length: u64) -> Result<Vec<u8>, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let want = length as usize;
        let mut out = Vec::with_capacity(want);

        while self.current() != LF && out.len() < want {
            out.push(self.current());
            self.consume();
        }

        if out.len() < want {
            let from = out.len();
            out.resize(want, 0);
            rd.read_exact(&mut out[from..]).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ParseError::Literal(format!("short read in literal of {} bytes", length))
                } else {
                    ParseError::Io(e)
                }
            })?;
        }

        // Reinstall the cursor on a fresh line; end of stream right after a
        // literal is fine, the next command read will report it.
        match self.new_line(rd).await {
            Ok(()) | Err(ParseError::Eof) => {}
            Err(e) => return Err(e),
        }

        Ok(out)
    }

    /// Reads a full literal: `{n}` length plus `n` bytes of body.
    pub async fn literal<R>(&mut self, rd: &mut R) -> Result<Vec<u8>, ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let length = self.literal_length()?;
        self.literal_rest(rd, length).await
    }

    //-------- token helpers --------------------------------------------------

    /// Dispatches on the first byte: quoted string, literal, or bare atom
    /// with the given exception set.
    async fn general_string<R>(&mut self, rd: &mut R, exceptions: &[u8]) -> Option<String>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        match self.current() {
            DOUBLE_QUOTE => {
                self.consume();
                match self.qstring() {
                    Ok(s) => Some(s),
                    Err(e) => {
                        tracing::debug!(error = %e, "invalid quoted string");
                        None
                    }
                }
            }
            LEFT_CURLY => {
                self.consume();
                match self.literal(rd).await {
                    Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                    Err(e) => {
                        tracing::debug!(error = %e, "invalid literal");
                        None
                    }
                }
            }
            _ => self.nonquoted(exceptions),
        }
    }

    /// Reads a bare atom: bytes above SPACE, below DEL, outside the
    /// exception set. Empty atoms are a failure.
    pub(crate) fn nonquoted(&mut self, exceptions: &[u8]) -> Option<String> {
        let mut buffer = Vec::with_capacity(16);

        let mut c = self.current();
        while c > SPACE && c < 0x7f && !exceptions.contains(&c) {
            buffer.push(c);
            c = self.consume();
        }

        if buffer.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&buffer).into_owned())
        }
    }

    //-------- low level cursor -----------------------------------------------

    /// Reads the next line into the buffer and resets the cursor. The
    /// token-start stack does not survive line boundaries.
    pub async fn new_line<R>(&mut self, rd: &mut R) -> Result<(), ParseError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut line = Vec::new();
        rd.read_until(LF, &mut line).await?;

        while line.last() == Some(&LF) || line.last() == Some(&CR) {
            line.pop();
        }
        if line.is_empty() {
            return Err(ParseError::Eof);
        }

        self.line = line;
        self.idx = 0;
        self.tokens.clear();
        self.done = false;
        Ok(())
    }

    /// The current byte, or LF once the line is exhausted.
    pub fn current(&self) -> u8 {
        if self.done || self.idx >= self.line.len() {
            LF
        } else {
            self.line[self.idx]
        }
    }

    /// Advances one byte within the line and returns the new current byte.
    /// Does not cross line boundaries.
    pub fn consume(&mut self) -> u8 {
        if self.idx + 1 >= self.line.len() {
            self.done = true;
            return LF;
        }
        self.idx += 1;
        self.current()
    }

    /// Skips any spaces.
    pub fn skip_space(&mut self) {
        while self.current() == SPACE {
            self.consume();
        }
    }

    /// Marks the start of a new token.
    pub fn start_token(&mut self) {
        self.tokens.push(self.idx);
    }

    /// Rewinds to the start of the previous token.
    pub fn push_back(&mut self) {
        if let Some(start) = self.tokens.pop() {
            self.idx = start;
            self.done = false;
        }
    }

    /// The unconsumed remainder of the current line.
    pub fn rest_of_line(&self) -> &[u8] {
        if self.done {
            &[]
        } else {
            &self.line[self.idx..]
        }
    }

    /// True if the current line's final byte is `b`.
    pub fn line_ends_with(&self, b: u8) -> bool {
        self.line.last() == Some(&b)
    }
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn lexer_over(input: &'static [u8]) -> (Lexer, BufReader<&'static [u8]>) {
        let mut rd = BufReader::new(input);
        let mut lexer = Lexer::new();
        lexer.new_line(&mut rd).await.unwrap();
        (lexer, rd)
    }

    #[tokio::test]
    async fn qstring_reads_until_closing_quote() {
        let (mut lexer, _rd) = lexer_over(b"quoted string\"\r\n").await;
        assert_eq!(lexer.qstring().unwrap(), "quoted string");
    }

    #[tokio::test]
    async fn qstring_rejects_embedded_newline() {
        let (mut lexer, _rd) = lexer_over(b"no closing quote\r\n").await;
        assert!(lexer.qstring().is_err());
    }

    #[tokio::test]
    async fn empty_literal_is_rejected() {
        let (mut lexer, mut rd) = lexer_over(b"0}\r\n\r\n").await;
        assert!(lexer.literal(&mut rd).await.is_err());
    }

    #[tokio::test]
    async fn astring_accepts_every_form() {
        // (input, expected astring)
        let passing: &[(&[u8], &str)] = &[
            (b"a\r\n", "a"),
            (b"this\r\n", "this"),
            (b"burb)\r\n", "burb"),
            (b"\"\"\r\n", ""),
            (b"[\r\n", "["),
            (b"{5}\r\n abcd\n", " abcd"),
            (b"]\n", "]"),
        ];
        for (input, expected) in passing {
            let (mut lexer, mut rd) = lexer_over(input).await;
            let got = lexer.astring(&mut rd).await;
            assert_eq!(got.as_deref(), Some(*expected), "input {:?}", input);
        }

        let failing: &[&[u8]] = &[b" \r\n", b"\\\r\n", b"%\r\n", b"*\r\n", b")\r\n", b"(\r\n"];
        for input in failing {
            let (mut lexer, mut rd) = lexer_over(input).await;
            assert_eq!(lexer.astring(&mut rd).await, None, "input {:?}", input);
        }
    }

    #[tokio::test]
    async fn skip_space_stops_at_next_token() {
        let (mut lexer, mut rd) = lexer_over(b"abc one\r\n").await;
        lexer.astring(&mut rd).await.unwrap();
        lexer.skip_space();
        assert_eq!(lexer.current(), b'o');
    }

    #[tokio::test]
    async fn consume_stays_on_the_line() {
        let (mut lexer, _rd) = lexer_over(b"abc\none").await;
        lexer.consume();
        assert_eq!(lexer.current(), b'b');
    }

    #[tokio::test]
    async fn astring_stops_at_delimiter() {
        let (mut lexer, mut rd) = lexer_over(b"a0001)\r\n").await;
        assert_eq!(lexer.astring(&mut rd).await.as_deref(), Some("a0001"));
    }

    #[tokio::test]
    async fn astring_reads_quoted_form() {
        let (mut lexer, mut rd) = lexer_over(b"\"A12312\"\r\n").await;
        assert_eq!(lexer.astring(&mut rd).await.as_deref(), Some("A12312"));
    }

    #[tokio::test]
    async fn astring_reads_literal_form() {
        let (mut lexer, mut rd) = lexer_over(b"{11}\nFRED FOOBAR {7}\n").await;
        let token = lexer.astring(&mut rd).await.unwrap();
        assert_eq!(token.len(), 11);
        assert_eq!(token, "FRED FOOBAR");
    }

    #[tokio::test]
    async fn literal_leaves_cursor_on_the_tail() {
        let (mut lexer, mut rd) = lexer_over(b"{3}\r\nab\nabc").await;
        assert_eq!(lexer.astring(&mut rd).await.as_deref(), Some("ab\n"));
        assert_eq!(lexer.astring(&mut rd).await.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn list_strings_parses_nested_lists() {
        let (mut lexer, _rd) = lexer_over(b"(ELEM1 (SUB1) ELEM2)\r\n").await;
        let elements = lexer.list_strings().unwrap();

        assert_eq!(
            elements,
            vec![
                Element {
                    string_value: "ELEM1".into(),
                    children: vec![],
                },
                Element {
                    string_value: "".into(),
                    children: vec![Element {
                        string_value: "SUB1".into(),
                        children: vec![],
                    }],
                },
                Element {
                    string_value: "ELEM2".into(),
                    children: vec![],
                },
            ]
        );
    }

    #[tokio::test]
    async fn list_strings_rejects_invalid_lists() {
        let (mut lexer, _rd) = lexer_over(b" \r\n").await;
        assert_eq!(lexer.list_strings(), None);

        let (mut lexer, _rd) = lexer_over(b"A B\r\n").await;
        assert_eq!(lexer.list_strings(), None);

        let (mut lexer, _rd) = lexer_over(b"(MISSING CLOSE\r\n").await;
        assert_eq!(lexer.list_strings(), None);
    }

    #[tokio::test]
    async fn search_string_emits_parentheses_as_tokens() {
        let (mut lexer, mut rd) = lexer_over(b"(ALL)\r\n").await;
        assert_eq!(lexer.search_string(&mut rd).await.as_deref(), Some("("));
        assert_eq!(lexer.search_string(&mut rd).await.as_deref(), Some("ALL"));
        assert_eq!(lexer.search_string(&mut rd).await.as_deref(), Some(")"));
    }

    #[tokio::test]
    async fn tag_rejects_plus() {
        let (mut lexer, _rd) = lexer_over(b"+tag\r\n").await;
        assert_eq!(lexer.tag(), None);
    }
}
