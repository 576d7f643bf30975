//! Error types for virt2phys.

use std::io;
use thiserror::Error;

use crate::RECORD_SIZE;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidArgument(String),

    /// A listing, record table or platform query could not be opened. Fatal.
    #[error("can't open {what}: {source}")]
    ResourceUnavailable {
        what: String,
        #[source]
        source: io::Error,
    },

    /// Fewer bytes than a whole record. `offset` and `source` are set when
    /// the bytes came from a table read that failed; a decoder handed a
    /// short buffer has neither.
    #[error("{}", describe_malformed(.offset, .len, .source))]
    MalformedRecord {
        offset: Option<u64>,
        len: usize,
        #[source]
        source: Option<io::Error>,
    },

    #[error("can't write output: {0}")]
    Output(#[from] io::Error),
}

fn describe_malformed(offset: &Option<u64>, len: &usize, source: &Option<io::Error>) -> String {
    let mut msg = format!("malformed record: {} of {} bytes", len, RECORD_SIZE);
    if let Some(offset) = offset {
        msg.push_str(&format!(" at offset {:#x}", offset));
    }
    if let Some(source) = source {
        msg.push_str(&format!(": {}", source));
    }
    msg
}

impl Error {
    pub fn resource<S: Into<String>>(what: S, source: io::Error) -> Self {
        Error::ResourceUnavailable {
            what: what.into(),
            source,
        }
    }

    pub fn is_process_not_found(&self) -> bool {
        match self {
            Error::ResourceUnavailable { source, .. } => {
                source.kind() == io::ErrorKind::NotFound
                    || source.raw_os_error() == Some(libc::ESRCH)
            }
            _ => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::ResourceUnavailable { source, .. } => {
                source.kind() == io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }

    /// Process exit code: the platform errno for open failures, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ResourceUnavailable { source, .. } => match source.raw_os_error() {
                Some(code) if code > 0 => code,
                _ => 1,
            },
            _ => 1,
        }
    }
}
