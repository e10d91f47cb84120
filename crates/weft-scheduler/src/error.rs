use serde::Serialize;
use weft_cache::CacheError;
use weft_config::ConfigValidationError;
use weft_core::{PathTable, PipId};
use weft_fingerprint::{FingerprintError, Violation, ViolationKind};
use weft_resource::CancelReason;

/// Why a pip did not complete. Every variant names the pip and the offending path or code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipFailure {
    #[error("{pip}: {} undeclared access(es), first {first_kind:?} on `{first_path}`", .violations.len())]
    DependencyViolation {
        pip: PipId,
        first_kind: ViolationKindName,
        first_path: String,
        violations: Vec<(ViolationKindName, String)>,
    },

    #[error("{pip}: `{path}` lies under untrackable mount `{mount}`")]
    UntrackableMount {
        pip: PipId,
        path: String,
        mount: String,
    },

    #[error("{pip}: cancelled ({reason}) after {retries} resource retries")]
    ResourceExhaustion {
        pip: PipId,
        reason: CancelReason,
        retries: u32,
    },

    #[error("{pip}: cache integrity error: {detail}")]
    CacheIntegrity { pip: PipId, detail: String },

    #[error("{pip}: process {}", describe_exit(.exit_code, .timed_out))]
    ProcessExit {
        pip: PipId,
        exit_code: Option<i32>,
        timed_out: bool,
        attempts: u32,
    },

    #[error("{pip}: declared output `{path}` was not produced")]
    MissingOutput { pip: PipId, path: String },

    #[error("{pip}: I/O error on `{path}`: {message}")]
    Io {
        pip: PipId,
        path: String,
        message: String,
    },

    #[error("{pip}: internal error: {message}")]
    Internal { pip: PipId, message: String },
}

/// Why build services could not be wired from a configuration.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid configuration: {0:?}")]
    InvalidConfig(Vec<ConfigValidationError>),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Serializable mirror of [`ViolationKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKindName {
    UndeclaredRead,
    UndeclaredWrite,
    SealMismatch,
}

impl From<ViolationKind> for ViolationKindName {
    fn from(kind: ViolationKind) -> Self {
        match kind {
            ViolationKind::UndeclaredRead => ViolationKindName::UndeclaredRead,
            ViolationKind::UndeclaredWrite => ViolationKindName::UndeclaredWrite,
            ViolationKind::SealMismatch => ViolationKindName::SealMismatch,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>, timed_out: &bool) -> String {
    match (*timed_out, *exit_code) {
        (true, _) => "timed out".to_string(),
        (false, Some(code)) => format!("exited with code {code}"),
        (false, None) => "was terminated by a signal".to_string(),
    }
}

impl PipFailure {
    pub fn pip(&self) -> PipId {
        match self {
            PipFailure::DependencyViolation { pip, .. }
            | PipFailure::UntrackableMount { pip, .. }
            | PipFailure::ResourceExhaustion { pip, .. }
            | PipFailure::CacheIntegrity { pip, .. }
            | PipFailure::ProcessExit { pip, .. }
            | PipFailure::MissingOutput { pip, .. }
            | PipFailure::Io { pip, .. }
            | PipFailure::Internal { pip, .. } => *pip,
        }
    }

    /// Failures that end the whole build rather than one branch of it.
    pub fn is_build_fatal(&self) -> bool {
        matches!(
            self,
            PipFailure::CacheIntegrity { .. }
                | PipFailure::ResourceExhaustion {
                    reason: CancelReason::DiskExhausted,
                    ..
                }
        )
    }

    pub(crate) fn internal(pip: PipId, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(target = "weft.scheduler", %pip, %message, "internal scheduler error");
        PipFailure::Internal { pip, message }
    }

    pub(crate) fn from_violations(pip: PipId, table: &PathTable, violations: &[Violation]) -> Self {
        let listed: Vec<(ViolationKindName, String)> = violations
            .iter()
            .map(|violation| (violation.kind.into(), table.expand(violation.path).to_string()))
            .collect();
        let (first_kind, first_path) = listed
            .first()
            .cloned()
            .unwrap_or((ViolationKindName::SealMismatch, String::new()));
        PipFailure::DependencyViolation {
            pip,
            first_kind,
            first_path,
            violations: listed,
        }
    }

    pub(crate) fn from_fingerprint(pip: PipId, err: FingerprintError) -> Self {
        match err {
            FingerprintError::UntrackableMount { path, mount } => {
                PipFailure::UntrackableMount { pip, path, mount }
            }
            FingerprintError::Io { path, source } => PipFailure::Io {
                pip,
                path,
                message: source.to_string(),
            },
            // A dependency's output that was never recorded: the producer did not deliver it.
            FingerprintError::UnknownArtifact { path, .. } => PipFailure::MissingOutput { pip, path },
            other => PipFailure::internal(pip, other.to_string()),
        }
    }

    pub(crate) fn from_cache(pip: PipId, err: CacheError) -> Self {
        match err {
            CacheError::Io { path, source } => PipFailure::Io {
                pip,
                path: path.display().to_string(),
                message: source.to_string(),
            },
            other => PipFailure::CacheIntegrity {
                pip,
                detail: other.to_string(),
            },
        }
    }
}
