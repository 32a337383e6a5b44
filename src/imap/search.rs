use chrono::NaiveDate;
use tokio::io::BufReader;

use crate::imap::lexer::{Lexer, ParseError};
use crate::imap::sequence;

const LF: u8 = 0x0a;

/// One node of a SEARCH expression.
///
/// `or` implies exactly two children; `group` marks a parenthesized
/// conjunction; `not` may decorate any form. `depth` only carries meaning
/// while the flat token list is being folded into a tree.
#[derive(Debug, Clone, Default)]
pub struct SearchArg {
    pub key: String,
    pub values: Vec<String>,
    pub children: Vec<SearchArg>,
    pub not: bool,
    pub or: bool,
    pub group: bool,
    pub(crate) depth: i32,
}

impl PartialEq for SearchArg {
    fn eq(&self, other: &Self) -> bool {
        // depth is transient bookkeeping, not part of the tree shape
        self.key == other.key
            && self.values == other.values
            && self.not == other.not
            && self.or == other.or
            && self.group == other.group
            && self.children == other.children
    }
}
impl Eq for SearchArg {}

const ZERO_ARG_KEYS: &[&str] = &[
    "ALL",
    "ANSWERED",
    "DELETED",
    "FLAGGED",
    "NEW",
    "OLD",
    "RECENT",
    "SEEN",
    "UNANSWERED",
    "UNDELETED",
    "UNFLAGGED",
    "UNSEEN",
    "DRAFT",
    "UNDRAFT",
];

const ASTRING_ARG_KEYS: &[&str] = &[
    "KEYWORD", "UNKEYWORD", "BCC", "BODY", "CC", "FROM", "SUBJECT", "TEXT", "TO",
];

const DATE_ARG_KEYS: &[&str] = &["BEFORE", "ON", "SINCE", "SENTBEFORE", "SENTON", "SENTSINCE"];

const NUMBER_ARG_KEYS: &[&str] = &["LARGER", "SMALLER"];

/// Parses the full argument string of a SEARCH command (already aggregated
/// across continuation lines) into a list of `SearchArg` under an implicit
/// top-level conjunction.
///
/// The scan is a single left-to-right pass: parentheses move a depth
/// counter, OR opens a logical depth with an arity-two quota (quotas nest
/// on a stack), NOT flags the next emitted argument. A reverse-order fold
/// then absorbs every argument into the nearest shallower predecessor,
/// preserving source order at each level.
pub async fn aggregate_search_arguments(full_line: &[u8]) -> Result<Vec<SearchArg>, ParseError> {
    let mut rd = BufReader::new(full_line);
    let mut lexer = Lexer::new();
    lexer.new_line(&mut rd).await?;

    let mut args: Vec<SearchArg> = Vec::new();
    let mut depth = 0i32;
    let mut current = SearchArg::default();

    // Each OR introduces a quota of two argument-emitting tokens; once a
    // quota runs out, its logical depth closes. Quotas nest.
    let mut all_ors: Vec<u32> = Vec::new();

    loop {
        lexer.skip_space();

        if lexer.current() == LF {
            if depth != 0 {
                return Err(ParseError::syntax("uneven parentheses"));
            }
            break;
        }

        let next = match lexer.search_string(&mut rd).await {
            Some(t) => t.to_ascii_uppercase(),
            None => return Err(ParseError::syntax("couldn't parse search arguments")),
        };

        match next.as_str() {
            "(" => {
                current.group = true;
                emit(&mut args, &mut current, depth);
                depth += 1;
                current.depth = depth;
                continue;
            }
            ")" => {
                depth -= 1;
            }
            key if ZERO_ARG_KEYS.contains(&key) => {
                current.key = next;
                emit(&mut args, &mut current, depth);
            }
            key if ASTRING_ARG_KEYS.contains(&key) => {
                current.key = next.clone();
                let value = lexer.astring(&mut rd).await.ok_or_else(|| {
                    ParseError::Syntax(format!("couldn't parse argument to {}", next))
                })?;
                current.values = vec![value];
                emit(&mut args, &mut current, depth);
            }
            key if DATE_ARG_KEYS.contains(&key) => {
                current.key = next.clone();
                let value = lexer.astring(&mut rd).await.ok_or_else(|| {
                    ParseError::Syntax(format!("couldn't parse argument to {}", next))
                })?;
                // The date stays a string, but it must be a real date.
                if NaiveDate::parse_from_str(&value, "%d-%b-%Y").is_err() {
                    return Err(ParseError::Syntax(format!("invalid date: {:?}", value)));
                }
                current.values = vec![value];
                emit(&mut args, &mut current, depth);
            }
            key if NUMBER_ARG_KEYS.contains(&key) => {
                current.key = next.clone();
                let value = lexer.astring(&mut rd).await.ok_or_else(|| {
                    ParseError::Syntax(format!("couldn't parse argument to {}", next))
                })?;
                if value.parse::<u64>().is_err() {
                    return Err(ParseError::Syntax(format!("invalid number: {:?}", value)));
                }
                current.values = vec![value];
                emit(&mut args, &mut current, depth);
            }
            "HEADER" => {
                current.key = next;
                let field = lexer
                    .astring(&mut rd)
                    .await
                    .ok_or_else(|| ParseError::syntax("couldn't parse header field for HEADER"))?;
                let value = lexer
                    .astring(&mut rd)
                    .await
                    .ok_or_else(|| ParseError::syntax("couldn't parse header value for HEADER"))?;
                current.values = vec![field, value];
                emit(&mut args, &mut current, depth);
            }
            "NOT" => {
                current.not = true;
                continue;
            }
            "OR" => {
                all_ors.push(2);
                current.or = true;
                emit(&mut args, &mut current, depth);
                depth += 1;
                current.depth = depth;
                continue;
            }
            "UID" => {
                current.key = next;
                let set = lexer
                    .astring(&mut rd)
                    .await
                    .filter(|s| sequence::is_valid(s))
                    .ok_or_else(|| ParseError::syntax("couldn't parse sequence set to UID"))?;
                current.values = vec![set];
                emit(&mut args, &mut current, depth);
            }
            _ => {
                if sequence::is_valid(&next) {
                    // Fake key so bare sequence-sets flow like any predicate.
                    current.key = "SEQUENCESET".to_string();
                    current.values = vec![next];
                    emit(&mut args, &mut current, depth);
                } else {
                    return Err(ParseError::Syntax(format!(
                        "unrecognized search argument: {}",
                        next
                    )));
                }
            }
        }

        if let Some(quota) = all_ors.last_mut() {
            *quota -= 1;
            if *quota == 0 {
                depth -= 1;
                current.depth = depth;
                all_ors.pop();
            }
        }
    }

    Ok(fold(args))
}

fn emit(args: &mut Vec<SearchArg>, current: &mut SearchArg, depth: i32) {
    let mut arg = std::mem::take(current);
    arg.depth = depth;
    args.push(arg);
    current.depth = depth;
}

/// Folds the flat, depth-annotated list into a tree. Scanning right to
/// left, an argument absorbs every already-buffered argument whose depth is
/// strictly greater than its own; equal-depth neighbors stay siblings in
/// source order.
fn fold(args: Vec<SearchArg>) -> Vec<SearchArg> {
    let mut out_reverse: Vec<SearchArg> = Vec::new();

    for mut arg in args.into_iter().rev() {
        let mut slice_from = out_reverse.len();
        while slice_from > 0 && out_reverse[slice_from - 1].depth > arg.depth {
            slice_from -= 1;
        }
        for child in out_reverse.drain(slice_from..).rev() {
            arg.children.push(child);
        }
        out_reverse.push(arg);
    }

    out_reverse.reverse();
    out_reverse
}
