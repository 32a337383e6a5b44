use crate::imap::search::SearchArg;

/// Compiles a SEARCH argument tree into a notmuch query string.
///
/// The result is always wrapped in one pair of parentheses; the caller
/// strips the outermost pair before handing the query to the backend. An
/// empty conjunction compiles to `*`.
///
/// Known imprecisions, kept on purpose: CC and BCC approximate to `to:`,
/// and BODY/TEXT match the whole message rather than the body alone.
pub fn compile_search_args(args: &[SearchArg]) -> String {
    let mut query: Vec<String> = Vec::new();

    for arg in args {
        match arg.key.as_str() {
            // Matches everything; contributes nothing to the query.
            "ALL" => continue,
            "NEW" | "OLD" | "RECENT" | "HEADER" | "SMALLER" | "LARGER" | "SEQUENCESET"
            | "UID" => {
                tracing::warn!(key = %arg.key, "search key is not supported, ignoring");
                continue;
            }
            "ANSWERED" => query.push("tag:answered".to_string()),
            "UNANSWERED" => query.push("-tag:answered".to_string()),
            "DELETED" => query.push("tag:deleted".to_string()),
            "UNDELETED" => query.push("-tag:deleted".to_string()),
            "FLAGGED" => query.push("tag:starred".to_string()),
            "UNFLAGGED" => query.push("-tag:starred".to_string()),
            "SEEN" => query.push("-tag:unread".to_string()),
            "UNSEEN" => query.push("tag:unread".to_string()),
            "DRAFT" => query.push("tag:draft".to_string()),
            "UNDRAFT" => query.push("-tag:draft".to_string()),
            "KEYWORD" => query.push(format!("tag:{}", arg.values[0])),
            "UNKEYWORD" => query.push(format!("-tag:{}", arg.values[0])),
            "FROM" => query.push(format!("from:{}", arg.values[0])),
            "TO" | "CC" | "BCC" => query.push(format!("to:{}", arg.values[0])),

            // Internal date is when the server received the message, so
            // matching the Date header is technically wrong.
            "SENTON" | "ON" => query.push(format!("date:{}..!", arg.values[0])),
            "SENTSINCE" | "SINCE" => query.push(format!("date:{}..", arg.values[0])),
            "SENTBEFORE" | "BEFORE" => query.push(format!("date:..{}", arg.values[0])),

            "SUBJECT" => query.push(format!("subject:{}", quote(&arg.values[0]))),
            "BODY" | "TEXT" => query.push(quote(&arg.values[0])),
            _ => {}
        }

        if arg.group {
            let mut sub = compile_search_args(&arg.children);
            if arg.children.len() == 1 {
                // A single-child group needs no extra parentheses.
                sub = sub[1..sub.len() - 1].to_string();
            }
            query.push(sub);
        }

        if arg.or {
            if let [left_arg, right_arg] = arg.children.as_slice() {
                let left = compile_search_args(std::slice::from_ref(left_arg));
                let right = compile_search_args(std::slice::from_ref(right_arg));
                query.push(format!("{} OR {}", left, right));
            } else {
                tracing::warn!("OR without exactly two operands, ignoring");
            }
        }

        if query.is_empty() {
            continue;
        }
        if arg.not {
            let just_added = query.last_mut().expect("query is non-empty");
            if let Some(stripped) = just_added.strip_prefix('-') {
                *just_added = stripped.to_string();
            } else {
                *just_added = format!("-{}", just_added);
            }
        }
    }

    if query.is_empty() {
        query.push("*".to_string());
    }
    format!("({})", query.join(" "))
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::search::aggregate_search_arguments;

    async fn compile(input: &[u8]) -> String {
        let args = aggregate_search_arguments(input).await.unwrap();
        compile_search_args(&args)
    }

    #[tokio::test]
    async fn flag_predicates_map_to_tags() {
        assert_eq!(compile(b"SEEN FLAGGED").await, "(-tag:unread tag:starred)");
        assert_eq!(compile(b"KEYWORD deleted").await, "(tag:deleted)");
        assert_eq!(compile(b"SEEN").await, "(-tag:unread)");
        assert_eq!(compile(b"ANSWERED UNDRAFT").await, "(tag:answered -tag:draft)");
    }

    #[tokio::test]
    async fn not_toggles_the_leading_dash() {
        assert_eq!(compile(b"NOT SEEN").await, "(tag:unread)");
        assert_eq!(compile(b"NOT UNSEEN").await, "(-tag:unread)");
    }

    #[tokio::test]
    async fn dates_pick_the_range_syntax() {
        assert_eq!(
            compile(b"SENTSINCE 20-Jan-2012").await,
            "(date:20-Jan-2012..)"
        );
        assert_eq!(compile(b"ON 20-Jan-2012").await, "(date:20-Jan-2012..!)");
        assert_eq!(compile(b"BEFORE 20-Jan-2012").await, "(date:..20-Jan-2012)");
    }

    #[tokio::test]
    async fn text_predicates_are_quoted() {
        assert_eq!(
            compile(b"BODY \"How are you ?\"").await,
            "(\"How are you ?\")"
        );
        assert_eq!(compile(b"SUBJECT hello").await, "(subject:\"hello\")");
    }

    #[tokio::test]
    async fn or_compiles_both_branches() {
        assert_eq!(
            compile(b"OR DELETED SEEN").await,
            "((tag:deleted) OR (-tag:unread))"
        );
        assert_eq!(
            compile(b"OR DELETED NOT SEEN").await,
            "((tag:deleted) OR (tag:unread))"
        );
    }

    #[tokio::test]
    async fn nested_or_in_a_group() {
        assert_eq!(
            compile(b"OR DELETED (OR SUBJECT \"subject\" FROM \"a@b.com\")").await,
            "((tag:deleted) OR ((subject:\"subject\") OR (from:a@b.com)))"
        );
    }

    #[tokio::test]
    async fn unsupported_keys_are_omitted() {
        assert_eq!(compile(b"ALL").await, "(*)");
        assert_eq!(compile(b"LARGER 1024 SEEN").await, "(-tag:unread)");
    }
}
