use weft_core::{PathError, SealId};

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("`{path}` lies under untrackable mount `{mount}` and cannot be hashed")]
    UntrackableMount { path: String, mount: String },

    #[error("I/O error while hashing `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no content recorded for `{path}` (rewrite {rewrite_count})")]
    UnknownArtifact { path: String, rewrite_count: u32 },

    #[error("invalid enumeration pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("seal {0:?} is not part of the pip graph")]
    UnknownSeal(SealId),

    #[error(transparent)]
    Path(#[from] PathError),
}

impl FingerprintError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
