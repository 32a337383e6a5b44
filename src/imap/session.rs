use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};

use crate::auth::ArcAuthStore;
use crate::imap::flow::{Encryption, State};
use crate::imap::response::Response;
use crate::mail::{ArcMailstore, Mailbox};

/// The delimiter between folder levels in mailbox paths.
pub const PATH_DELIMITER: char = '/';

/// Per-connection protocol session.
///
/// Holds the protocol state, the selected mailbox and the shared backend
/// handles. The transport stays with the connection driver.
pub struct Session {
    pub id: String,
    pub state: State,
    pub mailbox: Option<Mailbox>,
    pub encryption: Encryption,
    pub listener_encryption: Encryption,
    pub store: ArcMailstore,
    pub auth: ArcAuthStore,
}

impl Session {
    pub fn new(
        id: String,
        listener_encryption: Encryption,
        store: ArcMailstore,
        auth: ArcAuthStore,
    ) -> Self {
        let encryption = match listener_encryption {
            Encryption::Tls => Encryption::Tls,
            _ => Encryption::None,
        };
        Self {
            id,
            state: State::Unauthenticated,
            mailbox: None,
            encryption,
            listener_encryption,
            store,
            auth,
        }
    }

    /// Selects a mailbox; returns whether it exists.
    pub async fn select_mailbox(&mut self, path: &[String]) -> Result<bool> {
        match self.store.get_mailbox(path).await? {
            Some(mbox) => {
                self.mailbox = Some(mbox);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Checks that a mailbox exists without selecting it.
    pub async fn status_mailbox(&self, path: &[String]) -> Result<bool> {
        Ok(self.store.get_mailbox(path).await?.is_some())
    }

    /// Adds the untagged SELECT information block for the selected mailbox.
    pub async fn add_mailbox_info(&self, resp: Response) -> Result<Response> {
        let mailbox = match &self.mailbox {
            Some(m) => m,
            None => anyhow::bail!("no mailbox selected"),
        };

        let first_unseen = self.store.first_unseen(&mailbox.id).await?;
        let total_messages = self.store.total_messages(&mailbox.id).await?;
        let recent_messages = self.store.recent_messages(&mailbox.id).await?;
        let next_uid = self.store.next_uid(&mailbox.id).await?;

        let mut resp = resp
            .extra(format!("{} EXISTS", total_messages))
            .extra(format!("{} RECENT", recent_messages))
            .extra("OK [PERMANENTFLAGS (\\*)] Limited")
            .extra(format!(
                "OK [UNSEEN {}] Message {} is first unseen",
                first_unseen, first_unseen
            ))
            .extra(format!("OK [UIDVALIDITY {}] UIDs valid", mailbox.uid_validity));

        // The backend cannot always predict the next UID; the line is
        // omitted rather than fabricated.
        if next_uid != 0 {
            resp = resp.extra(format!("OK [UIDNEXT {}] Predicted next UID", next_uid));
        }
        Ok(resp)
    }

    /// Adds the untagged STATUS line for the requested items.
    pub async fn add_status_mailbox_info(
        &self,
        resp: Response,
        mailbox_name: &str,
        params: &[String],
    ) -> Result<Response> {
        let path = vec![mailbox_name.to_string()];
        let mailbox = match self.store.get_mailbox(&path).await? {
            Some(m) => m,
            None => anyhow::bail!("mailbox {} disappeared", mailbox_name),
        };

        let mut param_responses = Vec::with_capacity(params.len());
        for param in params {
            match param.as_str() {
                "MESSAGES" => {
                    let total = self.store.total_messages(&mailbox.id).await?;
                    param_responses.push(format!("MESSAGES {}", total));
                }
                "RECENT" => {
                    let recent = self.store.recent_messages(&mailbox.id).await?;
                    param_responses.push(format!("RECENT {}", recent));
                }
                "UIDNEXT" => {
                    let next_uid = self.store.next_uid(&mailbox.id).await?;
                    if next_uid != 0 {
                        param_responses.push(format!("UIDNEXT {}", next_uid));
                    }
                }
                "UIDVALIDITY" => {
                    param_responses.push(format!("UIDVALIDITY {}", mailbox.uid_validity));
                }
                "UNSEEN" => {
                    let unseen = self.store.count_unseen(&mailbox.id).await?;
                    param_responses.push(format!("UNSEEN {}", unseen));
                }
                _ => {}
            }
        }

        Ok(resp.extra(format!(
            "STATUS {} ({})",
            mailbox.name,
            param_responses.join(" ")
        )))
    }

    /// Lists mailboxes matching the given pattern, rooted at `reference`.
    pub async fn list(&self, reference: &[String], pattern: &[String]) -> Result<Vec<Mailbox>> {
        let mut path: Vec<String> = reference.to_vec();

        // Walk the pattern up to the first wildcard; that prefix is a
        // plain path.
        let mut wildcard = None;
        for (i, dir) in pattern.iter().enumerate() {
            if dir == "%" || dir == "*" {
                wildcard = Some(i);
                break;
            }
            path.push(dir.clone());
        }

        match wildcard {
            None => {
                let mut ret = Vec::new();
                if let Some(mbox) = self.store.get_mailbox(&path).await? {
                    ret.push(mbox);
                }
                Ok(ret)
            }
            Some(i) => {
                self.depth_first_mailboxes(Vec::new(), path, pattern[i..].to_vec())
                    .await
            }
        }
    }

    /// Recursive listing: `%` matches one hierarchy level, `*` any number.
    fn depth_first_mailboxes(
        &self,
        results: Vec<Mailbox>,
        path: Vec<String>,
        pattern: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<Mailbox>>> {
        async move {
            // Stop when the pattern is exhausted or the path is absurd.
            if pattern.is_empty() || path.len() > 20 {
                return Ok(results);
            }

            let mut ret = results;
            match pattern[0].as_str() {
                "%" => {
                    for mbox in self.store.get_mailboxes(&path).await? {
                        let sub_path = mbox.path.clone();
                        ret.push(mbox);
                        ret = self
                            .depth_first_mailboxes(ret, sub_path, pattern[1..].to_vec())
                            .await?;
                    }
                }
                "*" => {
                    for mbox in self.store.get_mailboxes(&path).await? {
                        let sub_path = mbox.path.clone();
                        ret.push(mbox);
                        ret = self
                            .depth_first_mailboxes(ret, sub_path, pattern.clone())
                            .await?;
                    }
                }
                _ => {
                    if let Some(mbox) = self.store.get_mailbox(&path).await? {
                        let sub_path = mbox.path.clone();
                        ret.push(mbox);
                        ret = self
                            .depth_first_mailboxes(ret, sub_path, pattern[1..].to_vec())
                            .await?;
                    }
                }
            }
            Ok(ret)
        }
        .boxed()
    }
}

/// Splits a mailbox path on the delimiter, trimming blank leading and
/// trailing components.
pub fn path_to_slice(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = path.split(PATH_DELIMITER).map(|s| s.to_string()).collect();

    if parts.first().map(|s| s.is_empty()).unwrap_or(false) {
        if parts.len() > 1 {
            parts.remove(0);
        } else {
            return Vec::new();
        }
    }
    if parts.last().map(|s| s.is_empty()).unwrap_or(false) {
        if parts.len() > 1 {
            parts.pop();
        } else {
            return Vec::new();
        }
    }
    parts
}
