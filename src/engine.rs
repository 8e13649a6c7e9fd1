//! Boundary to the image decoding and display collaborator.
//!
//! The viewer never decodes pixels or draws bitmaps itself. It goes through
//! [`ImageBackend`] to make files addressable and read their tags, and through
//! [`DisplayBackend`] to drive one display surface per viewport slot.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use dicom_object::Tag;

/// Opaque handle to a file registered with an [`ImageBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef(pub u32);

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "img:{}", self.0)
    }
}

/// Handle to a display surface owned by exactly one viewport slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub usize);

/// A raw file offered to the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub byte_size: u64,
}

impl SourceFile {
    pub fn new(path: PathBuf, byte_size: u64) -> Self {
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            path,
            file_name,
            byte_size,
        }
    }
}

/// Result of the collaborator's own geometric ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SpacingSort {
    pub sorted: Vec<ImageRef>,
    pub z_spacing: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevel {
    pub width: f32,
    pub center: f32,
}

pub mod tags {
    use dicom_object::Tag;

    pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
    pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
    pub const STUDY_DATE: Tag = Tag(0x0008, 0x0020);
    pub const MODALITY: Tag = Tag(0x0008, 0x0060);
    pub const STUDY_DESCRIPTION: Tag = Tag(0x0008, 0x1030);
    pub const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
    pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
    pub const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
    pub const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
    pub const INSTANCE_NUMBER: Tag = Tag(0x0020, 0x0013);
    pub const IMAGE_POSITION_PATIENT: Tag = Tag(0x0020, 0x0032);
    pub const IMAGE_ORIENTATION_PATIENT: Tag = Tag(0x0020, 0x0037);
    pub const SLICE_LOCATION: Tag = Tag(0x0020, 0x1041);
}

/// File registration, decoding and metadata access.
///
/// Implementations are shared between extraction workers, so every method
/// takes `&self`.
pub trait ImageBackend: Send + Sync {
    /// Makes a raw file addressable. Nothing is decoded yet.
    fn register_file(&self, file: &SourceFile) -> Result<ImageRef>;

    /// Populates the metadata and pixel cache for `image`. Tag reads are only
    /// valid after this succeeds.
    fn decode_and_cache(&self, image: ImageRef) -> Result<()>;

    /// Text value of `tag`, multi-valued elements joined with `\`.
    fn read_tag(&self, tag: Tag, image: ImageRef) -> Option<String>;

    /// Orders images along the stack normal derived from orientation and
    /// position. Fails when the geometry is missing or degenerate.
    fn sort_by_spacing(&self, images: &[ImageRef]) -> Result<SpacingSort>;

    /// Drops the cache entry for an image nobody will display.
    fn release(&self, image: ImageRef);
}

/// Per-viewport display surfaces.
pub trait DisplayBackend {
    fn create_surface(&mut self, slot: usize) -> Result<SurfaceHandle>;
    fn bind_image_list(
        &mut self,
        surface: SurfaceHandle,
        images: &[ImageRef],
        start_index: usize,
    ) -> Result<()>;
    fn set_current_index(&mut self, surface: SurfaceHandle, index: usize) -> Result<()>;
    fn set_window_level(&mut self, surface: SurfaceHandle, window: Option<WindowLevel>)
        -> Result<()>;
    fn reset_camera(&mut self, surface: SurfaceHandle) -> Result<()>;
    fn render(&mut self, surface: SurfaceHandle) -> Result<()>;
    fn destroy(&mut self, surface: SurfaceHandle);
}
