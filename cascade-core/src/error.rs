use std::io;

use thiserror::Error;

/// Failures reported by network construction, model I/O and the detection cascade.
///
/// Scores below a threshold, stages without survivors and crops that fall outside the image
/// are ordinary outcomes and never surface as errors.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Unknown layer type, missing parameter, or weight/bias counts that disagree with the
    /// declared layer geometry.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Missing or unreadable model/weight file, or a truncated binary stream.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    /// A window or kernel that does not fit its (padded) input.
    #[error("geometry error: {0}")]
    Geometry(String),
}

impl CascadeError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        CascadeError::Configuration(message.into())
    }

    pub(crate) fn geometry(message: impl Into<String>) -> Self {
        CascadeError::Geometry(message.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CascadeError::Io {
            context: context.into(),
            source,
        }
    }
}
