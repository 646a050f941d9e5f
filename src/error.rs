use std::io;

/// The primary error type for all operations in the `tributary` crate.
#[derive(Debug)]
pub enum StreamError {
    /// An I/O error occurred while reading or writing the container file.
    /// Includes a short tag naming the operation that failed.
    Io { source: io::Error, context: &'static str },

    /// A read or write ended before the requested byte count was transferred,
    /// typically because the file ended mid-chunk.
    ShortTransfer { wanted: u64, got: u64 },

    /// A back-end codec returned a non-recoverable error.
    Codec(String),

    /// The bytes on disk do not describe a valid chunk chain: a dirty initial
    /// header, an unknown codec tag, or a length that does not survive
    /// decompression.
    Format(String),

    /// Key derivation or cipher setup refused its input.
    Crypto(String),

    /// An allocation or thread-spawn failure that cannot be recovered by
    /// shrinking the working set.
    Resource(String),

    /// A worker thread failed earlier and its error was already reported;
    /// the container no longer accepts work.
    Poisoned,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Io { source, context } => write!(f, "I/O error in {}: {}", context, source),
            StreamError::ShortTransfer { wanted, got } => {
                write!(f, "short transfer: asked for {} bytes but got {}", wanted, got)
            }
            StreamError::Codec(msg) => write!(f, "codec error: {}", msg),
            StreamError::Format(msg) => write!(f, "container format error: {}", msg),
            StreamError::Crypto(msg) => write!(f, "crypto error: {}", msg),
            StreamError::Resource(msg) => write!(f, "resource error: {}", msg),
            StreamError::Poisoned => write!(f, "container poisoned by an earlier worker failure"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl StreamError {
    /// Wrap an `io::Error` with the name of the operation it interrupted.
    pub(crate) fn io(source: io::Error, context: &'static str) -> Self {
        StreamError::Io { source, context }
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io { source: err, context: "stream" }
    }
}
