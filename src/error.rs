use thiserror::Error;

/// Failure taxonomy for the migration workflow. Every fatal condition maps
/// onto one of these variants; `exit_code` converts the root cause into the
/// process exit status expected by operators and wrapper scripts.
#[derive(Debug, Error)]
pub enum CirrusError {
    #[error("lookup for '{name}' matched {count} records, expected exactly one")]
    LookupAmbiguity { name: String, count: usize },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("manual intervention required: {0}")]
    ManualIntervention(String),

    #[error("remote command failed on {host} (exit {exit_code}): {stderr}")]
    RemoteCommandFailed {
        host: String,
        exit_code: u32,
        stderr: String,
    },

    #[error("control-plane job {job_id} failed (code {code}): {text}")]
    JobFailed {
        job_id: String,
        code: i64,
        text: String,
    },

    #[error("control-plane API error: {0}")]
    ApiError(String),

    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(String),

    #[error("ssh error on {host}: {message}")]
    SshError { host: String, message: String },

    #[error("authentication failed for {0}")]
    AuthFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("migration cancelled at stage {0}")]
    Cancelled(String),

    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<CirrusError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CirrusError {
    /// Peel off the stage wrapper and return the underlying failure.
    pub fn root_cause(&self) -> &CirrusError {
        match self {
            CirrusError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Process exit status:
    ///   1 — bad request or unusable configuration
    ///   2 — lookup/remote/control-plane failure
    ///   4 — precondition that needs a human (e.g. multi-disk VM)
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            CirrusError::InvalidRequest(_) | CirrusError::ConfigError(_) => 1,
            CirrusError::ManualIntervention(_) => 4,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_taxonomy() {
        let bad_flags = CirrusError::InvalidRequest("nodestroy without hostname".into());
        assert_eq!(bad_flags.exit_code(), 1);

        let ambiguous = CirrusError::LookupAmbiguity {
            name: "web01".into(),
            count: 2,
        };
        assert_eq!(ambiguous.exit_code(), 2);

        let multi_disk = CirrusError::ManualIntervention("2 disks attached".into());
        assert_eq!(multi_disk.exit_code(), 4);
    }

    #[test]
    fn stage_wrapper_is_transparent_for_exit_codes() {
        let wrapped = CirrusError::StageFailed {
            stage: "ResolveImage".into(),
            source: Box::new(CirrusError::ManualIntervention("2 disks attached".into())),
        };
        assert_eq!(wrapped.exit_code(), 4);
        assert!(matches!(
            wrapped.root_cause(),
            CirrusError::ManualIntervention(_)
        ));
    }
}
