use thiserror::Error;

/// Failures the viewer reports instead of propagating.
///
/// Per-file and per-slot problems end up here; none of them stops a batch or
/// touches sibling viewports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    #[error("Could not read {file}: {reason}")]
    ExtractionFailed { file: String, reason: String },

    #[error("Series {0} has no images to display")]
    EmptySeries(String),

    #[error("Viewport {} is not ready", .0 + 1)]
    ViewportNotReady(usize),

    #[error("There is no viewport {}", .0 + 1)]
    UnknownSlot(usize),

    #[error("Series {0} is not loaded")]
    UnknownSeries(String),

    #[error("There is no window preset named {0}")]
    UnknownPreset(String),

    #[error("Image backend unavailable: {0}")]
    BackendUnavailable(String),
}
