#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// Lookup miss. A sentinel, not a failure: `find` and `find_tls_config`
    /// return this for requests and hosts the archive has never seen.
    NotFound,
    Io(String),
    Serialization(String),
    Parse(String),
    Encoding(String),
    Decoding(String),
    AlreadyClosed,
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::AlreadyClosed => f.write_str("archive already closed"),
            Self::Io(message)
            | Self::Serialization(message)
            | Self::Parse(message)
            | Self::Encoding(message)
            | Self::Decoding(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ArchiveError {}
