use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::imap::lexer::ParseError;
use crate::imap::parser::Parser;
use crate::imap::response::Response;
use crate::imap::session::Session;

/// The transport under a session: plain TCP, or TLS over it.
pub enum AnyStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Per-connection driver: greets, then loops reading one command, running
/// it and writing its response until the peer leaves or a response asks to
/// close. Multi-phase commands (literal continuations) re-execute until
/// they report done.
pub struct Connection {
    id: String,
    session: Session,
    /// TLS configuration for the STARTTLS upgrade, when the listener
    /// supports it.
    acceptor: Option<TlsAcceptor>,
}

impl Connection {
    pub fn new(id: String, session: Session, acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            id,
            session,
            acceptor,
        }
    }

    pub async fn handle(mut self, stream: AnyStream) -> Result<()> {
        let mut stream = BufReader::new(stream);
        let mut parser = Parser::new();

        Response::ok("*", "IMAP4rev1 Service Ready")
            .write(&mut stream)
            .await?;

        loop {
            let mut command = match parser.next(&mut stream).await {
                Ok(command) => command,
                Err(ParseError::Eof) => return Ok(()),
                Err(ParseError::Bad { tag, message }) => {
                    // Still line-synchronized: answer and read on.
                    tracing::debug!(session = %self.id, tag = %tag, error = %message, "malformed command");
                    Response::bad(&tag, &message).write(&mut stream).await?;
                    continue;
                }
                Err(e) => {
                    tracing::info!(session = %self.id, error = %e, "couldn't get next command");
                    // One fatal line; resynchronization is hopeless.
                    let _ = Response::bad("*", "Invalid input").write(&mut stream).await;
                    return Ok(());
                }
            };
            tracing::debug!(session = %self.id, tag = %command.tag(), "command");

            loop {
                let response = command
                    .execute(&mut self.session, &mut parser.lexer, &mut stream)
                    .await;
                response.write(&mut stream).await?;

                if response.replace_buffers {
                    stream = self.start_tls(stream).await?;
                    // The lexer state dies with the cleartext buffers.
                    parser = Parser::new();
                }
                if response.close_after {
                    return Ok(());
                }
                if response.done {
                    break;
                }
            }
        }
    }

    /// Rewraps the transport in TLS. Dropping the old buffered reader
    /// discards any cleartext bytes read past the STARTTLS command, as
    /// RFC 3501 6.2.1 requires.
    async fn start_tls(&self, stream: BufReader<AnyStream>) -> Result<BufReader<AnyStream>> {
        let acceptor = match &self.acceptor {
            Some(acceptor) => acceptor.clone(),
            None => bail!("no TLS acceptor configured"),
        };
        let tcp = match stream.into_inner() {
            AnyStream::Plain(tcp) => tcp,
            AnyStream::Tls(_) => bail!("connection is already TLS"),
        };

        let tls = acceptor.accept(tcp).await?;
        tracing::debug!(session = %self.id, "TLS established");
        Ok(BufReader::new(AnyStream::Tls(Box::new(tls))))
    }
}
