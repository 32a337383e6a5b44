use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as Subprocess;
use tokio::sync::RwLock;
use xxhash_rust::xxh32::xxh32;

use crate::imap::fetch::FetchArg;
use crate::imap::search::SearchArg;
use crate::imap::sequence;
use crate::mail::bodystructure;
use crate::mail::query::compile_search_args;
use crate::mail::{
    FetchItem, FlagMode, Mailbox, MailboxId, Mailstore, MessageFetchResponse, NOINFERIORS,
};

const INTERNALDATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// IMAP system flag → notmuch tag.
fn mailbox_to_notmuch(flag: &str) -> Option<&'static str> {
    match flag {
        "INBOX" => Some("inbox"),
        "\\Flagged" => Some("starred"),
        "\\Deleted" => Some("deleted"),
        "\\Draft" => Some("draft"),
        "\\Answered" => Some("answered"),
        _ => None,
    }
}

/// notmuch tag → IMAP system flag.
fn tag_to_keyword(tag: &str) -> Option<&'static str> {
    match tag {
        "inbox" => Some("INBOX"),
        "starred" => Some("\\Flagged"),
        "deleted" => Some("\\Deleted"),
        "draft" => Some("\\Draft"),
        "answered" => Some("\\Answered"),
        _ => None,
    }
}

/// A message as notmuch reports it, plus the thread children notmuch
/// nests under it.
#[derive(Debug, Clone, Default)]
struct NotmuchMessage {
    id: String,
    tags: Vec<String>,
    header: MessageHeader,
    children: Vec<NotmuchMessage>,
}

#[derive(Debug, Clone, Default)]
struct MessageHeader {
    subject: String,
    from: String,
    to: String,
    cc: String,
    bcc: String,
    reply_to: String,
    /// "Mon, 2 Jan 2006 15:04:05 -0700"
    date: String,
}

/// Caches over the notmuch database. All entries live and die together:
/// any backend mutation clears the lot, and the next reader repopulates
/// what it needs.
#[derive(Default)]
struct Caches {
    threads: HashMap<String, Arc<Vec<NotmuchMessage>>>,
    uid_to_mid: Option<Arc<Vec<String>>>,
    mid_to_uid: Option<Arc<HashMap<String, usize>>>,
}

/// A Mailstore over the `notmuch` command line tool.
///
/// Mailboxes are tags; messages are identified by notmuch message ids;
/// UIDs are positions in the oldest-first enumeration of every message in
/// the database.
pub struct NotmuchMailstore {
    /// Serializes backend invocations: mutations take it exclusively,
    /// queries share it.
    backend: RwLock<()>,
    /// Guards the caches, independently of the backend lock.
    cache: RwLock<Caches>,
    /// Folder handed to `notmuch insert`.
    maildir: Option<String>,
}

impl NotmuchMailstore {
    pub fn new(maildir: Option<String>) -> Self {
        Self {
            backend: RwLock::new(()),
            cache: RwLock::new(Caches::default()),
            maildir,
        }
    }

    //------ subprocess plumbing ----------------------------------------------

    async fn raw(&self, args: &[&str]) -> Result<Vec<u8>> {
        let _guard = self.backend.read().await;
        let output = Subprocess::new("notmuch")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running notmuch {:?}", args))?;
        if !output.status.success() {
            tracing::error!(args = ?args, stderr = %String::from_utf8_lossy(&output.stderr), "notmuch failed");
            bail!("notmuch {:?} exited with {}", args, output.status);
        }
        Ok(output.stdout)
    }

    /// Runs a mutating notmuch command, feeding `input` to its stdin, and
    /// clears every cache once it completes. The backend lock is released
    /// before the cache lock is taken; holding both would deadlock against
    /// a cache reader waiting on the backend.
    async fn raw_write(&self, args: &[String], input: &[u8]) -> Result<()> {
        let result = self.run_write(args, input).await;

        let mut caches = self.cache.write().await;
        *caches = Caches::default();
        result
    }

    async fn run_write(&self, args: &[String], input: &[u8]) -> Result<()> {
        let _guard = self.backend.write().await;
        let mut child = Subprocess::new("notmuch")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning notmuch {:?}", args))?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        stdin.write_all(input).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            tracing::error!(args = ?args, stderr = %String::from_utf8_lossy(&output.stderr), "notmuch failed");
            bail!("notmuch {:?} exited with {}", args, output.status);
        }
        Ok(())
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let out = self.raw(args).await?;
        serde_json::from_slice(&out).with_context(|| format!("decoding notmuch {:?} output", args))
    }

    //------ database views ---------------------------------------------------

    /// All threads matching a query, as nested messages. Only tag-wide and
    /// database-wide queries are worth caching.
    async fn threads(&self, query: &str) -> Result<Arc<Vec<NotmuchMessage>>> {
        {
            let caches = self.cache.read().await;
            if let Some(threads) = caches.threads.get(query) {
                return Ok(threads.clone());
            }
        }

        let tids: Vec<String> = self
            .json(&[
                "search",
                "--format=json",
                "--output=threads",
                "--sort=oldest-first",
                query,
            ])
            .await?;

        let mut threads = Vec::new();
        for tid in &tids {
            let thread_query = format!("thread:{}", tid);
            let result: Value = self
                .json(&["show", "--format=json", "--body=false", "--", &thread_query])
                .await?;
            threads.extend(parse_thread_set(&result));
        }
        let threads = Arc::new(threads);

        let cacheable =
            !query.contains(' ') && (query.starts_with("tag:") || query == "*");
        if cacheable {
            let mut caches = self.cache.write().await;
            caches.threads.insert(query.to_string(), threads.clone());
        }

        Ok(threads)
    }

    /// Message ids of a mailbox, oldest first.
    async fn message_ids(&self, mailbox: &MailboxId) -> Result<Vec<String>> {
        let threads = self.threads(&format!("tag:{}", mailbox)).await?;
        let mut flat = flatten(&threads);
        flat.sort_by_key(|m| parse_header_date(&m.header.date));
        Ok(flat.into_iter().map(|m| m.id).collect())
    }

    /// Both sides of the UID ↔ message id bijection, built together from
    /// the oldest-first enumeration of every message in the database.
    async fn uid_maps(&self) -> Result<(Arc<Vec<String>>, Arc<HashMap<String, usize>>)> {
        let mut caches = self.cache.write().await;
        if let (Some(uid_to_mid), Some(mid_to_uid)) = (&caches.uid_to_mid, &caches.mid_to_uid) {
            return Ok((uid_to_mid.clone(), mid_to_uid.clone()));
        }

        let mids: Vec<String> = self
            .json(&[
                "search",
                "--format=json",
                "--output=messages",
                "--sort=oldest-first",
                "*",
            ])
            .await?;

        let (uid_to_mid, mid_to_uid) = uid_maps_from(mids);
        caches.uid_to_mid = Some(uid_to_mid.clone());
        caches.mid_to_uid = Some(mid_to_uid.clone());
        Ok((uid_to_mid, mid_to_uid))
    }

    async fn uid_to_mid(&self) -> Result<Arc<Vec<String>>> {
        Ok(self.uid_maps().await?.0)
    }

    async fn mid_to_uid(&self) -> Result<Arc<HashMap<String, usize>>> {
        Ok(self.uid_maps().await?.1)
    }

    /// One message with the union of the tags of its whole thread.
    async fn get_message(&self, mid: &str) -> Result<NotmuchMessage> {
        let threads = self.threads(&format!("id:{}", mid)).await?;
        let flat = flatten(&threads);

        let mut tags = std::collections::BTreeSet::new();
        let mut message = None;
        for msg in flat {
            tags.extend(msg.tags.iter().cloned());
            if msg.id == mid {
                message = Some(msg);
            }
        }

        let mut message = message.ok_or_else(|| anyhow!("no such message: {}", mid))?;
        message.tags = tags.into_iter().collect();
        Ok(message)
    }

    /// The raw RFC822 bytes of a message.
    async fn raw_message(&self, mid: &str) -> Result<Vec<u8>> {
        let id_query = format!("id:{}", mid);
        self.raw(&[
            "show",
            "--format=raw",
            "--part=0",
            "--entire-thread=false",
            &id_query,
        ])
        .await
    }

    async fn fetch_message_items(&self, mid: &str, args: &[FetchArg]) -> Result<Vec<FetchItem>> {
        let msg = self.get_message(mid).await?;

        let needs_raw = args.iter().any(|arg| {
            matches!(
                arg.text.as_str(),
                "RFC822.SIZE"
                    | "ENVELOPE"
                    | "BODYSTRUCTURE"
                    | "BODY"
                    | "BODY.PEEK"
                    | "RFC822"
                    | "RFC822.HEADER"
                    | "RFC822.TEXT"
            )
        });
        let raw = if needs_raw {
            self.raw_message(mid).await?
        } else {
            Vec::new()
        };

        let mut result = Vec::new();
        for arg in args {
            match arg.text.as_str() {
                "UID" => {
                    let map = self.mid_to_uid().await?;
                    let uid = map.get(&msg.id).copied().unwrap_or(0);
                    result.push(FetchItem::single("UID", uid.to_string()));
                }
                "FLAGS" => {
                    result.push(FetchItem::single("FLAGS", flags_from_tags(&msg.tags)));
                }
                "INTERNALDATE" => {
                    let date = parse_header_date(&msg.header.date)
                        .ok_or_else(|| anyhow!("invalid date: {:?}", msg.header.date))?;
                    result.push(FetchItem::single(
                        "INTERNALDATE",
                        format!("\"{}\"", date.format(INTERNALDATE_FORMAT)),
                    ));
                }
                "RFC822.SIZE" => {
                    result.push(FetchItem::single("RFC822.SIZE", raw.len().to_string()));
                }
                "ENVELOPE" => {
                    result.push(FetchItem::single("ENVELOPE", bodystructure::envelope(&raw)?));
                }
                "BODYSTRUCTURE" => {
                    result.push(FetchItem::single(
                        "BODYSTRUCTURE",
                        bodystructure::bodystructure(&raw)?,
                    ));
                }
                "BODY" | "BODY.PEEK" => match bodystructure::fetch_body_item(&raw, arg) {
                    Ok(item) => result.push(item),
                    Err(e) => {
                        tracing::warn!(error = %e, mid = %mid, "couldn't fetch body section");
                    }
                },
                other => {
                    let section = match other {
                        "RFC822.HEADER" => "HEADER",
                        "RFC822.TEXT" => "TEXT",
                        "RFC822" => "",
                        _ => {
                            tracing::warn!(att = %other, "fetch attribute is not handled");
                            continue;
                        }
                    };
                    let synthetic = FetchArg {
                        section: section.to_string(),
                        ..Default::default()
                    };
                    match bodystructure::fetch_body_item(&raw, &synthetic) {
                        Ok(mut item) => {
                            item.key = other.to_string();
                            result.push(item);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, mid = %mid, "couldn't fetch body section");
                        }
                    }
                }
            }
        }

        Ok(result)
    }
}

#[async_trait]
impl Mailstore for NotmuchMailstore {
    async fn get_mailbox(&self, path: &[String]) -> Result<Option<Mailbox>> {
        // The lastmod token moves on every database change; its hash is
        // the UIDVALIDITY clients compare across sessions.
        let line = self.raw(&["count", "--lastmod"]).await?;
        let line = String::from_utf8_lossy(&line);
        let parts: Vec<&str> = line.trim_end().split('\t').collect();
        if parts.len() != 3 {
            bail!("invalid UIDVALIDITY");
        }
        let uid_validity = xxh32(parts[1].as_bytes(), 0);

        let mut id = path.join("/");
        if id == "INBOX" {
            id = "inbox".to_string();
        }
        Ok(Some(Mailbox {
            name: path.join("/"),
            path: path.to_vec(),
            id: MailboxId(id),
            uid_validity,
            flags: NOINFERIORS,
        }))
    }

    async fn get_mailboxes(&self, path: &[String]) -> Result<Vec<Mailbox>> {
        // Tags form a flat namespace: only the root has children.
        if !path.is_empty() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = self
            .json(&["search", "--output=tags", "--format=json", "*"])
            .await?;
        names.sort();

        Ok(names
            .into_iter()
            .map(|tag| {
                let name = if tag == "inbox" {
                    "INBOX".to_string()
                } else {
                    tag.clone()
                };
                Mailbox {
                    name: name.clone(),
                    path: vec![name],
                    id: MailboxId(tag),
                    uid_validity: 0,
                    flags: NOINFERIORS,
                }
            })
            .collect())
    }

    async fn first_unseen(&self, _mbox: &MailboxId) -> Result<i64> {
        // Clients can find it through SEARCH; reporting 0 is allowed.
        Ok(0)
    }

    async fn total_messages(&self, mbox: &MailboxId) -> Result<i64> {
        Ok(self.message_ids(mbox).await?.len() as i64)
    }

    async fn recent_messages(&self, _mbox: &MailboxId) -> Result<i64> {
        // notmuch has no notion of recency.
        Ok(0)
    }

    async fn next_uid(&self, _mbox: &MailboxId) -> Result<i64> {
        // UIDNEXT must grow monotonically and only when a message arrives.
        // UIDs here are positions in the database-wide enumeration, so the
        // next one cannot be predicted; 0 makes the front-end omit it.
        Ok(0)
    }

    async fn count_unseen(&self, mbox: &MailboxId) -> Result<i64> {
        let threads = self.threads(&format!("tag:{}", mbox)).await?;
        let count = flatten(&threads)
            .iter()
            .filter(|m| m.tags.iter().any(|t| t == "unread"))
            .count();
        Ok(count as i64)
    }

    async fn append_message(
        &self,
        mailbox: &str,
        flags: &[String],
        _date_time: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    ) -> Result<()> {
        let mut tags = Vec::with_capacity(flags.len());
        let mut seen = false;
        for flag in flags {
            if flag.is_empty() {
                continue;
            }
            if flag == "\\Seen" {
                seen = true;
                continue;
            }
            let tag = mailbox_to_notmuch(flag).unwrap_or(flag.as_str());
            tags.push(format!("+{}", tag));
        }
        if !seen {
            tags.push("+unread".to_string());
        }
        if mailbox == "INBOX" {
            tags.push("+inbox".to_string());
        } else {
            tags.push(format!("+{}", mailbox));
        }

        let maildir = match &self.maildir {
            Some(dir) => dir.clone(),
            None => std::env::var("NOTMUCH_MAILDIR")
                .map_err(|_| anyhow!("missing maildir, set store.maildir or NOTMUCH_MAILDIR"))?,
        };

        let mut args = vec![
            "insert".to_string(),
            format!("--folder={}", maildir),
            "+new".to_string(),
        ];
        args.extend(tags);
        self.raw_write(&args, &message).await
    }

    async fn search(
        &self,
        mbox: &MailboxId,
        args: &[SearchArg],
        return_uid: bool,
    ) -> Result<Vec<usize>> {
        let mut args = args.to_vec();
        args.push(SearchArg {
            key: "KEYWORD".to_string(),
            values: vec![mbox.0.clone()],
            ..Default::default()
        });

        let compiled = compile_search_args(&args);
        // Strip the outermost parentheses before execution.
        let notmuch_query = &compiled[1..compiled.len() - 1];

        enum IdMap {
            Uid(Arc<HashMap<String, usize>>),
            Sequence(HashMap<String, usize>),
        }
        let id_map = if return_uid {
            IdMap::Uid(self.mid_to_uid().await?)
        } else {
            let mut by_seq = HashMap::new();
            for (i, mid) in self.message_ids(mbox).await?.into_iter().enumerate() {
                by_seq.insert(mid, i + 1);
            }
            IdMap::Sequence(by_seq)
        };

        let tids: Vec<String> = self
            .json(&[
                "search",
                "--format=json",
                "--output=threads",
                "--sort=oldest-first",
                notmuch_query,
            ])
            .await?;

        let mut ids = Vec::new();
        for tid in &tids {
            let thread_query = format!("thread:{}", tid);
            let result: Value = self
                .json(&["show", "--format=json", "--body=false", "--", &thread_query])
                .await?;
            for message in flatten(&parse_thread_set(&result)) {
                let mapped = match &id_map {
                    IdMap::Uid(map) => map.get(&message.id).copied(),
                    IdMap::Sequence(map) => map.get(&message.id).copied(),
                };
                match mapped {
                    Some(id) => ids.push(id),
                    None => {
                        tracing::debug!(mid = %message.id, mailbox = %mbox, "message not in mailbox");
                    }
                }
            }
        }

        // Sorting by id sorts by date: the id mappings are date-ordered.
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch(
        &self,
        mbox: &MailboxId,
        sequence_set: &str,
        args: &[FetchArg],
        use_uids: bool,
    ) -> Result<Vec<MessageFetchResponse>> {
        let mailbox_message_ids = self.message_ids(mbox).await?;

        let mut all_results = Vec::new();
        if use_uids {
            let uid_to_mid = self.uid_to_mid().await?;
            let max = uid_to_mid.len().saturating_sub(1);
            let wanted = sequence::to_list(sequence_set, max)?;

            let mid_to_seq: HashMap<&String, usize> = mailbox_message_ids
                .iter()
                .enumerate()
                .map(|(i, mid)| (mid, i + 1))
                .collect();

            for uid in wanted {
                let Some(mid) = uid_to_mid.get(uid) else { continue };
                let Some(sequence_id) = mid_to_seq.get(mid) else {
                    continue;
                };
                let items = self
                    .fetch_message_items(mid, args)
                    .await
                    .with_context(|| format!("couldn't fetch mid {}", mid))?;
                all_results.push(MessageFetchResponse {
                    id: sequence_id.to_string(),
                    items,
                });
            }
        } else {
            let max = mailbox_message_ids.len();
            let wanted = sequence::to_list(sequence_set, max)?;

            for id in wanted {
                let mid = mailbox_message_ids
                    .get(id.wrapping_sub(1))
                    .ok_or_else(|| {
                        anyhow!("invalid id {} when we have {} messages", id, max)
                    })?;
                let items = self
                    .fetch_message_items(mid, args)
                    .await
                    .with_context(|| format!("couldn't fetch mid {}", mid))?;
                all_results.push(MessageFetchResponse {
                    id: id.to_string(),
                    items,
                });
            }
        }

        Ok(all_results)
    }

    async fn flag(
        &self,
        mode: FlagMode,
        mbox: &MailboxId,
        sequence_set: &str,
        use_uids: bool,
        flags: &[String],
    ) -> Result<Vec<MessageFetchResponse>> {
        let max = self.total_messages(mbox).await? as usize;
        let wanted = sequence::to_list(sequence_set, max)?;

        let mut mids = Vec::with_capacity(wanted.len());
        if use_uids {
            let uid_to_mid = self.uid_to_mid().await?;
            for uid in wanted {
                let mid = uid_to_mid
                    .get(uid)
                    .ok_or_else(|| anyhow!("invalid message UID: {}", uid))?;
                mids.push(mid.clone());
            }
        } else {
            let mailbox_message_ids = self.message_ids(mbox).await?;
            for sequence_id in wanted {
                let mid = mailbox_message_ids
                    .get(sequence_id.wrapping_sub(1))
                    .ok_or_else(|| {
                        anyhow!("invalid sequence id: {} (max is {})", sequence_id, max)
                    })?;
                mids.push(mid.clone());
            }
        }

        let changes = tag_changes(mode, mbox, flags);

        if mode == FlagMode::Set {
            // --remove-all has no --batch support.
            for mid in &mids {
                let mut args = vec!["tag".to_string(), "--remove-all".to_string()];
                args.extend(changes.iter().cloned());
                args.push("--".to_string());
                args.push(format!("id:{}", mid));
                self.raw_write(&args, b"").await?;
            }
        } else {
            let mut batch = String::new();
            for mid in &mids {
                batch.push_str(&changes.join(" "));
                batch.push_str(&format!(" -- id:{}\n", mid));
            }
            let args = vec!["tag".to_string(), "--batch".to_string()];
            self.raw_write(&args, batch.as_bytes()).await?;
        }

        self.fetch(mbox, sequence_set, &[FetchArg::text("FLAGS")], use_uids)
            .await
    }
}

//------ pure helpers ---------------------------------------------------------

/// Builds the UID ↔ message id bijection. UIDs are 1-indexed; index 0 of
/// the forward map is a sentinel empty string.
fn uid_maps_from(mids: Vec<String>) -> (Arc<Vec<String>>, Arc<HashMap<String, usize>>) {
    let mid_to_uid: HashMap<String, usize> = mids
        .iter()
        .enumerate()
        .map(|(i, mid)| (mid.clone(), i + 1))
        .collect();

    let mut uid_to_mid = mids;
    uid_to_mid.insert(0, String::new());

    (Arc::new(uid_to_mid), Arc::new(mid_to_uid))
}

/// The tag operations a STORE translates to. SET first clears every tag
/// (`--remove-all` at invocation time) and re-adds like ADD does.
fn tag_changes(mode: FlagMode, mbox: &MailboxId, flags: &[String]) -> Vec<String> {
    let mut changes = Vec::new();

    match mode {
        FlagMode::Set | FlagMode::Add => {
            if mode == FlagMode::Set && !flags.iter().any(|f| f == "\\Seen") {
                changes.push("+unread".to_string());
            }
            for flag in flags {
                if flag == "\\Seen" {
                    changes.push("-unread".to_string());
                    continue;
                }
                if flag == "\\Deleted" {
                    changes.push(format!("-{}", mbox));
                    continue;
                }
                let keyword = mailbox_to_notmuch(flag).unwrap_or(flag.as_str());
                changes.push(format!("+{}", keyword));
            }
        }
        FlagMode::Remove => {
            for flag in flags {
                if flag == "\\Seen" {
                    changes.push("+unread".to_string());
                    continue;
                }
                if flag == "\\Deleted" {
                    changes.push(format!("+{}", mbox));
                    continue;
                }
                let keyword = mailbox_to_notmuch(flag).unwrap_or(flag.as_str());
                changes.push(format!("-{}", keyword));
            }
        }
    }
    changes
}

/// Renders a FLAGS value from notmuch tags. The unread tag inverts into
/// \Seen; every other unknown tag passes through as a keyword.
fn flags_from_tags(tags: &[String]) -> String {
    let mut flags = Vec::with_capacity(tags.len());
    let mut unread = false;
    for tag in tags {
        if tag == "unread" {
            unread = true;
            continue;
        }
        match tag_to_keyword(tag) {
            Some(keyword) => flags.push(keyword.to_string()),
            None => flags.push(tag.clone()),
        }
    }
    if !unread {
        flags.push("\\Seen".to_string());
    }
    format!("({})", flags.join(" "))
}

fn parse_header_date(date: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(date).ok()
}

/// Depth-first flattening of a thread forest into a message list.
fn flatten(threads: &[NotmuchMessage]) -> Vec<NotmuchMessage> {
    fn walk(out: &mut Vec<NotmuchMessage>, message: &NotmuchMessage) {
        let mut flat = message.clone();
        flat.children = Vec::new();
        out.push(flat);
        for child in &message.children {
            walk(out, child);
        }
    }

    let mut out = Vec::new();
    for thread in threads {
        walk(&mut out, thread);
    }
    out
}

/// Decodes the output of `notmuch show --format=json`: an array of
/// threads, each an array of `[message, [children...]]` pairs. See the
/// schemata file in the notmuch source.
fn parse_thread_set(value: &Value) -> Vec<NotmuchMessage> {
    let mut threads = Vec::new();
    let Some(thread_list) = value.as_array() else {
        return threads;
    };

    for thread in thread_list {
        let Some(top_level) = thread.as_array() else {
            continue;
        };
        let Some(mut root) = top_level.first().and_then(parse_message_pair) else {
            continue;
        };
        for sibling in &top_level[1..] {
            if let Some(child) = parse_message_pair(sibling) {
                root.children.push(child);
            }
        }
        threads.push(root);
    }
    threads
}

fn parse_message_pair(raw: &Value) -> Option<NotmuchMessage> {
    let pair = raw.as_array()?;
    let message = pair.first()?.as_object()?;
    let children = pair.get(1).and_then(Value::as_array);

    let string_of = |v: Option<&Value>| -> String {
        v.and_then(Value::as_str).unwrap_or_default().to_string()
    };

    let headers = message.get("headers").and_then(Value::as_object);
    let header = match headers {
        Some(h) => MessageHeader {
            subject: string_of(h.get("Subject")),
            from: string_of(h.get("From")),
            to: string_of(h.get("To")),
            cc: string_of(h.get("Cc")),
            bcc: string_of(h.get("Bcc")),
            reply_to: string_of(h.get("Reply-To")),
            date: string_of(h.get("Date")),
        },
        None => MessageHeader::default(),
    };

    let tags = message
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut msg = NotmuchMessage {
        id: message.get("id").and_then(Value::as_str)?.to_string(),
        tags,
        header,
        children: Vec::new(),
    };

    if let Some(children) = children {
        for child in children {
            if let Some(parsed) = parse_message_pair(child) {
                msg.children.push(parsed);
            }
        }
    }
    Some(msg)
}
