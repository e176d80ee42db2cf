use thiserror::Error;

/// Errors raised by the pipeline stages.
///
/// Structural errors abort the current stage before any output is written;
/// per-pixel numerical degeneracies (singular sub-pixel or plane fits) are
/// recovered locally inside the algorithms and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: shape mismatch, expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        /// (width, height, bands)
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("refine: unsupported direction ({dx}, {dy})")]
    UnsupportedDirection { dx: i32, dy: i32 },

    #[error("code table holds {got} codes, at most {max} supported")]
    TooManyCodes { got: usize, max: usize },

    #[error("merge: no input maps given")]
    EmptyInput,

    #[error("{context}: degenerate least-squares system")]
    DegenerateFit { context: &'static str },

    #[error("{path}: {message}")]
    Codec { path: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub(crate) fn codec(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Codec {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
