use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Completion class of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
    Continuation,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
            Status::PreAuth => "PREAUTH",
            Status::Bye => "BYE",
            Status::Continuation => "+",
        }
    }
}

/// A fully-built response: zero or more untagged lines followed by one
/// tagged completion line (or a bare continuation request).
///
/// `done == false` tells the connection driver the command wants another
/// execution phase once the continuation has been written.
/// `replace_buffers` asks the driver to rewrap its transport (STARTTLS).
#[derive(Debug)]
pub struct Response {
    pub tag: String,
    pub status: Status,
    pub message: String,
    pub untagged: Vec<String>,
    pub close_after: bool,
    pub done: bool,
    pub replace_buffers: bool,
}

impl Response {
    fn new(tag: &str, status: Status, message: &str, done: bool) -> Self {
        Self {
            tag: tag.to_string(),
            status,
            message: message.to_string(),
            untagged: Vec::new(),
            close_after: false,
            done,
            replace_buffers: false,
        }
    }

    pub fn ok(tag: &str, message: &str) -> Self {
        Self::new(tag, Status::Ok, message, true)
    }

    pub fn no(tag: &str, message: &str) -> Self {
        Self::new(tag, Status::No, message, true)
    }

    pub fn bad(tag: &str, message: &str) -> Self {
        Self::new(tag, Status::Bad, message, true)
    }

    /// A `+` continuation request; the command is not done yet.
    pub fn continuation(message: &str) -> Self {
        Self::new("", Status::Continuation, message, false)
    }

    /// Appends an untagged line.
    pub fn extra(mut self, line: impl Into<String>) -> Self {
        self.untagged.push(line.into());
        self
    }

    /// Closes the connection once this response has been written.
    pub fn should_close(mut self) -> Self {
        self.close_after = true;
        self
    }

    /// Asks the driver to rewrap the transport before reading on.
    pub fn replace_buffers(mut self) -> Self {
        self.replace_buffers = true;
        self
    }

    /// Serializes the response: untagged lines first, then the tagged (or
    /// continuation) line, all CRLF terminated.
    pub async fn write<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut out = Vec::new();
        for line in &self.untagged {
            out.extend_from_slice(b"* ");
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        match self.status {
            Status::Continuation => {
                out.extend_from_slice(b"+ ");
                out.extend_from_slice(self.message.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            status => {
                out.extend_from_slice(self.tag.as_bytes());
                out.push(b' ');
                out.extend_from_slice(status.as_str().as_bytes());
                out.push(b' ');
                out.extend_from_slice(self.message.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        w.write_all(&out).await?;
        w.flush().await
    }
}
