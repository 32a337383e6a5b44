use tokio::io::AsyncBufRead;

use crate::imap::lexer::{Lexer, ParseError};
use crate::imap::sequence;

const LF: u8 = 0x0a;

/// One parsed fetch-att.
///
/// `fields` is non-empty exactly when `section` is HEADER.FIELDS or
/// HEADER.FIELDS.NOT. `part` is the dot-separated MIME part path. An
/// `offset` of -1 means no partial range; a present range has
/// `offset >= 0` and, when a length was given, `length > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchArg {
    pub text: String,
    pub section: String,
    pub fields: Vec<String>,
    pub part: Vec<u32>,
    pub offset: i64,
    pub length: u64,
}

impl Default for FetchArg {
    fn default() -> Self {
        Self {
            text: String::new(),
            section: String::new(),
            fields: Vec::new(),
            part: Vec::new(),
            offset: -1,
            length: 0,
        }
    }
}

impl FetchArg {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }
}

const KNOWN_BODY_SECTIONS: &[&str] =
    &["", "HEADER", "HEADER.FIELDS", "HEADER.FIELDS.NOT", "TEXT", "MIME"];

/// Parses the argument list of a FETCH command: a sequence-set followed by
/// one fetch-att or a parenthesized list of them. The macros ALL, FAST and
/// FULL expand to their fixed attribute lists here, at parse time.
pub async fn fetch_arguments<R>(
    lexer: &mut Lexer,
    rd: &mut R,
) -> Result<(String, Vec<FetchArg>), ParseError>
where
    R: AsyncBufRead + Unpin + Send,
{
    lexer.skip_space();
    lexer.start_token();

    let sequence_set = lexer
        .nonquoted(b" ")
        .filter(|s| sequence::is_valid(s))
        .ok_or_else(|| ParseError::syntax("no sequence set"))?;

    let mut args = Vec::new();
    let mut has_list = false;
    let mut num_fields = 0;

    loop {
        lexer.skip_space();
        match lexer.current() {
            b'(' => {
                has_list = true;
                lexer.consume();
                continue;
            }
            b')' | LF => break,
            _ => {}
        }

        let next = lexer
            .nonquoted(b"[)")
            .ok_or_else(|| ParseError::syntax("error getting next fetch-att"))?
            .to_ascii_uppercase();
        num_fields += 1;

        match next.as_str() {
            "ENVELOPE" | "FLAGS" | "INTERNALDATE" | "RFC822" | "RFC822.HEADER" | "RFC822.SIZE"
            | "RFC822.TEXT" | "BODYSTRUCTURE" | "UID" => args.push(FetchArg::text(&next)),
            "ALL" => {
                args.push(FetchArg::text("FLAGS"));
                args.push(FetchArg::text("INTERNALDATE"));
                args.push(FetchArg::text("RFC822.SIZE"));
                args.push(FetchArg::text("ENVELOPE"));
            }
            "FAST" => {
                args.push(FetchArg::text("FLAGS"));
                args.push(FetchArg::text("INTERNALDATE"));
                args.push(FetchArg::text("RFC822.SIZE"));
            }
            "FULL" => {
                args.push(FetchArg::text("FLAGS"));
                args.push(FetchArg::text("INTERNALDATE"));
                args.push(FetchArg::text("RFC822.SIZE"));
                args.push(FetchArg::text("ENVELOPE"));
                args.push(FetchArg::text("BODY"));
            }
            "BODY" | "BODY.PEEK" => {
                if lexer.current() != b'[' {
                    // Only plain BODY may appear without a section.
                    if next == "BODY" {
                        args.push(FetchArg::text(&next));
                        continue;
                    }
                    return Err(ParseError::Syntax(format!(
                        "expected '[' after {}, got {:?}",
                        next,
                        lexer.current() as char
                    )));
                }
                let mut section = section_args(lexer, rd).await?;
                section.text = next;
                args.push(section);
            }
            _ => {
                return Err(ParseError::Syntax(format!(
                    "unknown fetch-att: {:?}",
                    next
                )));
            }
        }
    }

    if !has_list && num_fields > 1 {
        return Err(ParseError::syntax("multiple fetch-atts without parenthesis"));
    }
    Ok((sequence_set, args))
}

/// Parses a section specifier `[ part . section-text (fields)? ]` followed
/// by an optional partial range `< offset . length >`.
async fn section_args<R>(lexer: &mut Lexer, rd: &mut R) -> Result<FetchArg, ParseError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut s = FetchArg::default();

    // Elide '['.
    lexer.consume();

    // Section-part: dot-separated positive integers.
    let mut part_string = String::new();
    loop {
        let c = lexer.current();
        if c.is_ascii_digit() || c == b'.' {
            part_string.push(c as char);
        } else {
            break;
        }
        lexer.consume();
    }

    if !part_string.is_empty() {
        // The dot before the section-text lands in the part string.
        let trimmed = part_string.strip_suffix('.').unwrap_or(&part_string);
        for piece in trimmed.split('.') {
            let n: u32 = piece
                .parse()
                .map_err(|_| ParseError::Syntax(format!("invalid section-part: {:?}", part_string)))?;
            s.part.push(n);
        }
    }

    // Section-text; it may legitimately be empty, as in BODY[1].
    let section_name = match lexer.nonquoted(b" ]") {
        Some(name) => name.to_ascii_uppercase(),
        None => {
            if lexer.current() != b']' {
                return Err(ParseError::syntax("invalid section-text"));
            }
            String::new()
        }
    };
    if !KNOWN_BODY_SECTIONS.contains(&section_name.as_str()) {
        return Err(ParseError::Syntax(format!(
            "unknown section-text: {:?}",
            section_name
        )));
    }
    if section_name == "MIME" && s.part.is_empty() {
        return Err(ParseError::syntax("MIME is invalid at top level"));
    }
    s.section = section_name;

    lexer.skip_space();

    // Header field identifiers, when present.
    if lexer.current() == b'(' {
        lexer.consume();
        loop {
            lexer.skip_space();
            if lexer.current() == b')' {
                break;
            }
            let field = lexer
                .astring(rd)
                .await
                .ok_or_else(|| ParseError::syntax("invalid header field"))?;
            s.fields.push(field);
        }
        lexer.consume();
    }

    let wants_fields = s.section == "HEADER.FIELDS" || s.section == "HEADER.FIELDS.NOT";
    if !s.fields.is_empty() && !wants_fields {
        return Err(ParseError::Syntax(format!(
            "unexpected field list for section {:?}",
            s.section
        )));
    }
    if s.fields.is_empty() && wants_fields {
        return Err(ParseError::Syntax(format!(
            "missing field list for {:?}",
            s.section
        )));
    }

    // Elide ']'.
    lexer.consume();

    // Partial range.
    if lexer.current() == b'<' {
        lexer.consume();
        let offset = lexer
            .nonquoted(b".>")
            .and_then(|o| o.parse::<i64>().ok())
            .ok_or_else(|| ParseError::syntax("expected number as range offset"))?;
        s.offset = offset;

        match lexer.current() {
            b'>' => {
                lexer.consume();
                return Ok(s);
            }
            b'.' => {
                lexer.consume();
            }
            c => {
                return Err(ParseError::Syntax(format!(
                    "expected dot between offset and length, got {:?}",
                    c as char
                )));
            }
        }

        let length = lexer
            .nonquoted(b">")
            .and_then(|l| l.parse::<u64>().ok())
            .ok_or_else(|| ParseError::syntax("expected number as range length"))?;
        if length == 0 {
            return Err(ParseError::syntax("range length must be positive"));
        }
        s.length = length;
        lexer.consume();
    }

    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(input: &'static [u8]) -> Result<(String, Vec<FetchArg>), ParseError> {
        let mut rd = BufReader::new(input);
        let mut lexer = Lexer::new();
        lexer.new_line(&mut rd).await?;
        fetch_arguments(&mut lexer, &mut rd).await
    }

    #[tokio::test]
    async fn single_attribute() {
        let (set, args) = parse(b"10 INTERNALDATE\r\n").await.unwrap();
        assert_eq!(set, "10");
        assert_eq!(args, vec![FetchArg::text("INTERNALDATE")]);
    }

    #[tokio::test]
    async fn all_macro_expands_in_order() {
        let (_, args) = parse(b"10 ALL\r\n").await.unwrap();
        assert_eq!(
            args,
            vec![
                FetchArg::text("FLAGS"),
                FetchArg::text("INTERNALDATE"),
                FetchArg::text("RFC822.SIZE"),
                FetchArg::text("ENVELOPE"),
            ]
        );
    }

    #[tokio::test]
    async fn fast_and_full_macros() {
        let (_, fast) = parse(b"1 FAST\r\n").await.unwrap();
        assert_eq!(fast.len(), 3);
        let (_, full) = parse(b"1 FULL\r\n").await.unwrap();
        assert_eq!(full.len(), 5);
        assert_eq!(full[4], FetchArg::text("BODY"));
    }

    #[tokio::test]
    async fn body_section_with_fields_and_range() {
        let (set, args) = parse(b"10 BODY[1.4.HEADER.FIELDS (DATE FROM)]<10.28>\r\n")
            .await
            .unwrap();
        assert_eq!(set, "10");
        assert_eq!(
            args,
            vec![FetchArg {
                text: "BODY".into(),
                section: "HEADER.FIELDS".into(),
                fields: vec!["DATE".into(), "FROM".into()],
                part: vec![1, 4],
                offset: 10,
                length: 28,
            }]
        );
    }

    #[tokio::test]
    async fn body_part_without_section() {
        let (_, args) = parse(b"10 BODY[1]\r\n").await.unwrap();
        assert_eq!(
            args,
            vec![FetchArg {
                text: "BODY".into(),
                part: vec![1],
                ..Default::default()
            }]
        );
        assert_eq!(args[0].offset, -1);
    }

    #[tokio::test]
    async fn offset_without_length_is_legal() {
        let (_, args) = parse(b"10 BODY[TEXT]<42>\r\n").await.unwrap();
        assert_eq!(args[0].offset, 42);
        assert_eq!(args[0].length, 0);
    }

    #[tokio::test]
    async fn parenthesized_attribute_list() {
        let (_, args) = parse(b"3:5 (FLAGS UID)\r\n").await.unwrap();
        assert_eq!(args, vec![FetchArg::text("FLAGS"), FetchArg::text("UID")]);
    }

    #[tokio::test]
    async fn malformed_inputs_are_rejected() {
        let failing: &[&[u8]] = &[
            b"x INTERNALDATE\r\n",
            b"INTERNALDATE\r\n",
            b"10 BODY[MIME]\r\n",
            b"10 BODY[HEADER.FIELDS]\r\n",
            b"10 BODY[HEADER (DATE)]\r\n",
            b"10 BODY[1]<1.>\r\n",
            b"10 BODY[1]<.1>\r\n",
            b"10 BODY[1]<1,1>\r\n",
            b"10 BODY[1]<1.0>\r\n",
            b"10 FLAGS UID\r\n",
            b"10 NONSENSE\r\n",
            b"10 BODY.PEEK\r\n",
        ];
        for input in failing {
            assert!(parse(input).await.is_err(), "input {:?} should fail", input);
        }
    }
}
