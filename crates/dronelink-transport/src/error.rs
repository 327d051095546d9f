/// Errors that can occur in the link layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The driver recognised the URI but could not bring the link up.
    #[error("open failed: {0}")]
    OpenFailed(String),

    /// The link was closed.
    #[error("link closed: {0}")]
    ConnectionClosed(String),

    /// The URI is not of the form `scheme://address`.
    #[error("invalid link uri: {0}")]
    InvalidUri(String),

    /// The driver side of the link went away.
    #[error("link driver shut down")]
    Shutdown,
}
