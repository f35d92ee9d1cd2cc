use crate::record::SourceTag;
use thiserror::Error;

/// Failure of one enumeration source. Never aborts a scan on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("{tag} source unavailable: {reason}")]
    Unavailable { tag: SourceTag, reason: String },
    #[error("{tag} source requires elevated privileges: {reason}")]
    PermissionDenied { tag: SourceTag, reason: String },
}

impl SourceError {
    pub fn unavailable(tag: SourceTag, reason: impl ToString) -> Self {
        SourceError::Unavailable {
            tag,
            reason: reason.to_string(),
        }
    }

    pub fn permission_denied(tag: SourceTag, reason: impl ToString) -> Self {
        SourceError::PermissionDenied {
            tag,
            reason: reason.to_string(),
        }
    }

    pub fn tag(&self) -> SourceTag {
        match self {
            SourceError::Unavailable { tag, .. } | SourceError::PermissionDenied { tag, .. } => *tag,
        }
    }
}

/// Failure of a single raw SCSI query against one device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device reported status {status:#04x} ({} sense bytes)", .sense.len())]
    DeviceReported { status: u8, sense: Vec<u8> },
}

impl QueryError {
    /// Maps an OS error from opening or driving a device node.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => QueryError::NotFound(context.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                QueryError::PermissionDenied(context.to_string())
            }
            std::io::ErrorKind::TimedOut => {
                QueryError::Transport(format!("{}: timed out", context))
            }
            _ => QueryError::Transport(format!("{}: {}", context, err)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("no enumeration source could be reached ({} failed)", .failures.len())]
    NoSourcesReachable { failures: Vec<SourceError> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_io_errors_to_query_errors() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            QueryError::from_io("/dev/sdz", &missing),
            QueryError::NotFound(_)
        ));
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            QueryError::from_io("/dev/sdb", &denied),
            QueryError::PermissionDenied(_)
        ));
        let other = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(matches!(
            QueryError::from_io("/dev/sdb", &other),
            QueryError::Transport(_)
        ));
    }

    #[test]
    fn device_reported_keeps_sense() {
        let err = QueryError::DeviceReported {
            status: 0x02,
            sense: vec![0x70, 0, 0x05],
        };
        assert_eq!(err.to_string(), "device reported status 0x02 (3 sense bytes)");
    }
}
