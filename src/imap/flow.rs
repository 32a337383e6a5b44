/// Protocol state of a session.
///
/// See RFC 3501 section 3: commands are admissible only in some states,
/// and LOGIN/SELECT/LOGOUT move between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Unauthenticated,
    Authenticated,
    Selected,
}

/// Encryption level of a listener or of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// Cleartext connection.
    None,
    /// Cleartext connection that may be upgraded with STARTTLS.
    StartTls,
    /// TLS from the first byte.
    Tls,
}
