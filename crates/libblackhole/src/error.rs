use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("required field {field} is not set entering {state}")]
    MissingField {
        state: &'static str,
        field: &'static str,
    },

    #[error("not a torrent or magnet file: {0:?}")]
    UnsupportedExtension(PathBuf),

    #[error("filename is not valid unicode: {0:?}")]
    InvalidFilename(PathBuf),

    #[error("error staging {path:?}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error reading {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a magnet file")]
    NotAMagnet,

    #[error("invalid magnet link: {0}")]
    Magnet(String),

    #[error("invalid torrent file: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("torrent file has no info dictionary")]
    NoInfoDict,

    #[error("invalid info-hash: {0}")]
    InfoHash(String),

    #[error("{url} -> {status}: {body}")]
    UpstreamStatus {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(
        #[from]
        #[source]
        reqwest::Error,
    ),

    #[error("not instantly available")]
    NotInstantlyAvailable,

    #[error("unexpected debrid status {0:?}")]
    UnexpectedDebridStatus(crate::debrid::DebridStatus),

    #[error("timed out")]
    Timeout,

    #[error("transition did not leave state {0}")]
    StuckTransition(&'static str),

    #[error("error {context}: {source}")]
    Filesystem {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("path escapes the mount entry: {0:?}")]
    PathTraversal(PathBuf),

    #[error("completion callback failed: {0}")]
    Callback(#[source] Box<Error>),
}

impl Error {
    /// Worth another attempt: transport hiccups and server-side errors.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_timeout() || e.is_connect(),
            Error::UpstreamStatus { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}
