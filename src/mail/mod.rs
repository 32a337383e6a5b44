pub mod bodystructure;
pub mod notmuch;
pub mod query;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use crate::imap::fetch::FetchArg;
use crate::imap::search::SearchArg;

/// Opaque backend identifier of a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxId(pub String);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// It is not possible for any child level of hierarchy to exist under this
/// name; none exist now and none can be created.
pub const NOINFERIORS: u8 = 1 << 0;
/// It is not possible to use this name as a selectable mailbox.
pub const NOSELECT: u8 = 1 << 1;
/// The mailbox has been marked "interesting": it probably holds messages
/// added since it was last selected.
pub const MARKED: u8 = 1 << 2;
/// The mailbox holds no additional messages since it was last selected.
pub const UNMARKED: u8 = 1 << 3;

const MAILBOX_FLAG_NAMES: &[(u8, &str)] = &[
    (NOINFERIORS, "Noinferiors"),
    (NOSELECT, "Noselect"),
    (MARKED, "Marked"),
    (UNMARKED, "Unmarked"),
];

/// An IMAP mailbox as supplied by the backend.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub name: String,
    pub path: Vec<String>,
    pub id: MailboxId,
    pub uid_validity: u32,
    pub flags: u8,
}

impl Mailbox {
    /// Flag names for the LIST response, joined with commas.
    pub fn flag_names(&self) -> String {
        MAILBOX_FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// How STORE mutates the flag set of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMode {
    Set,
    Add,
    Remove,
}

/// One item of a per-message FETCH answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchItem {
    pub key: String,
    pub values: Vec<String>,
}

impl FetchItem {
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: vec![value.into()],
        }
    }
}

/// The per-message unit of a FETCH or STORE answer. `id` is the message
/// sequence number as it must appear on the wire.
#[derive(Debug, Clone)]
pub struct MessageFetchResponse {
    pub id: String,
    pub items: Vec<FetchItem>,
}

/// The mail backend contract consumed by the protocol core.
///
/// A `None` mailbox means does-not-exist, not an error. The ids returned
/// by `search` are UIDs when `return_uid` is set and sequence numbers
/// otherwise.
#[async_trait]
pub trait Mailstore: Send + Sync {
    async fn get_mailbox(&self, path: &[String]) -> Result<Option<Mailbox>>;

    /// Direct children of the given path.
    async fn get_mailboxes(&self, path: &[String]) -> Result<Vec<Mailbox>>;

    /// Sequence number of the first unseen message, 0 when unknown.
    async fn first_unseen(&self, mbox: &MailboxId) -> Result<i64>;

    async fn total_messages(&self, mbox: &MailboxId) -> Result<i64>;

    /// 0 when the backend does not track recency.
    async fn recent_messages(&self, mbox: &MailboxId) -> Result<i64>;

    /// Next UID, 0 when the backend cannot predict one.
    async fn next_uid(&self, mbox: &MailboxId) -> Result<i64>;

    async fn count_unseen(&self, mbox: &MailboxId) -> Result<i64>;

    async fn append_message(
        &self,
        mailbox: &str,
        flags: &[String],
        date_time: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    ) -> Result<()>;

    async fn search(
        &self,
        mbox: &MailboxId,
        args: &[SearchArg],
        return_uid: bool,
    ) -> Result<Vec<usize>>;

    async fn fetch(
        &self,
        mbox: &MailboxId,
        sequence_set: &str,
        args: &[FetchArg],
        use_uids: bool,
    ) -> Result<Vec<MessageFetchResponse>>;

    async fn flag(
        &self,
        mode: FlagMode,
        mbox: &MailboxId,
        sequence_set: &str,
        use_uids: bool,
        flags: &[String],
    ) -> Result<Vec<MessageFetchResponse>>;
}

pub type ArcMailstore = Arc<dyn Mailstore>;
