//! Turns raw files into self-describing [`ImageRecord`]s.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Context;
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::dicom::parse_decimal_list;
use crate::engine::{tags, ImageBackend, ImageRef, SourceFile};
use crate::error::ViewerError;

pub const UNKNOWN_PATIENT_ID: &str = "Unknown";
pub const UNKNOWN_PATIENT_NAME: &str = "Unknown Patient";
pub const UNKNOWN_STUDY: &str = "Unknown Study";
pub const UNKNOWN_SERIES: &str = "Unknown Series";
pub const UNKNOWN_MODALITY: &str = "UN";

const DICOM_EXTENSIONS: &[&str] = &["dcm", "dicom", "ima"];

/// Identifying tags of one file. Absent tags are already defaulted.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub patient_id: String,
    pub patient_name: String,
    pub study_instance_uid: String,
    pub study_description: String,
    pub study_date: String,
    pub series_instance_uid: String,
    pub series_description: String,
    pub series_number: i32,
    pub modality: String,
    pub instance_number: i32,
    pub image_position_patient: Option<[f64; 3]>,
    pub image_orientation_patient: Option<[f64; 6]>,
    pub slice_location: f64,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            patient_id: UNKNOWN_PATIENT_ID.to_string(),
            patient_name: UNKNOWN_PATIENT_NAME.to_string(),
            study_instance_uid: UNKNOWN_STUDY.to_string(),
            study_description: UNKNOWN_STUDY.to_string(),
            study_date: String::new(),
            series_instance_uid: UNKNOWN_SERIES.to_string(),
            series_description: UNKNOWN_SERIES.to_string(),
            series_number: 0,
            modality: UNKNOWN_MODALITY.to_string(),
            instance_number: 0,
            image_position_patient: None,
            image_orientation_patient: None,
            slice_location: 0.0,
        }
    }
}

impl ImageMetadata {
    pub fn read(backend: &dyn ImageBackend, image: ImageRef) -> Self {
        let text = |tag, default: &str| {
            backend
                .read_tag(tag, image)
                .unwrap_or_else(|| default.to_string())
        };
        let integer = |tag| {
            backend
                .read_tag(tag, image)
                .and_then(|value| parse_first_int(&value))
                .unwrap_or(0)
        };
        let decimals = |tag| {
            backend
                .read_tag(tag, image)
                .and_then(|value| parse_decimal_list(&value))
        };

        Self {
            patient_id: text(tags::PATIENT_ID, UNKNOWN_PATIENT_ID),
            patient_name: text(tags::PATIENT_NAME, UNKNOWN_PATIENT_NAME),
            study_instance_uid: text(tags::STUDY_INSTANCE_UID, UNKNOWN_STUDY),
            study_description: text(tags::STUDY_DESCRIPTION, UNKNOWN_STUDY),
            study_date: text(tags::STUDY_DATE, ""),
            series_instance_uid: text(tags::SERIES_INSTANCE_UID, UNKNOWN_SERIES),
            series_description: text(tags::SERIES_DESCRIPTION, UNKNOWN_SERIES),
            series_number: integer(tags::SERIES_NUMBER),
            modality: text(tags::MODALITY, UNKNOWN_MODALITY),
            instance_number: integer(tags::INSTANCE_NUMBER),
            image_position_patient: decimals(tags::IMAGE_POSITION_PATIENT)
                .filter(|values| values.len() == 3)
                .map(|v| [v[0], v[1], v[2]]),
            image_orientation_patient: decimals(tags::IMAGE_ORIENTATION_PATIENT)
                .filter(|values| values.len() == 6)
                .map(|v| [v[0], v[1], v[2], v[3], v[4], v[5]]),
            slice_location: decimals(tags::SLICE_LOCATION)
                .and_then(|values| values.first().copied())
                .unwrap_or(0.0),
        }
    }
}

/// One decoded file. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub image: ImageRef,
    pub file_name: String,
    pub byte_size: u64,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Default)]
pub struct ExtractedBatch {
    pub records: Vec<ImageRecord>,
    pub failures: Vec<ViewerError>,
}

impl ExtractedBatch {
    pub fn total(&self) -> usize {
        self.records.len() + self.failures.len()
    }
}

/// Expands files and folders into DICOM candidates.
///
/// Folders are walked recursively in file-name order. A path reachable twice
/// is only returned once.
pub fn expand_inputs(paths: &[PathBuf]) -> Vec<SourceFile> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    let mut push = |path: &Path| {
        if !is_dicom_candidate(path) {
            return;
        }
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !seen.insert(canonical.clone()) {
            return;
        }
        match fs::metadata(&canonical) {
            Ok(meta) => files.push(SourceFile::new(canonical, meta.len())),
            Err(err) => warn!("Skipping {}: {err}", canonical.display()),
        }
    };

    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                push(entry.path());
            }
        } else if path.is_file() {
            push(path);
        } else {
            warn!("Skipping {}: not a file or folder", path.display());
        }
    }

    files
}

/// Accepts the usual DICOM extensions and extension-less files, which is how
/// DICOMDIR-style media store images.
pub fn is_dicom_candidate(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        None => path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.') && !name.eq_ignore_ascii_case("DICOMDIR")),
        Some(ext) => DICOM_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known)),
    }
}

/// Registers, decodes and reads one file. A failed file is released again so
/// the backend never keeps a reference nobody owns.
pub fn extract_record(
    backend: &dyn ImageBackend,
    file: &SourceFile,
) -> Result<ImageRecord, ViewerError> {
    let failed = |err: anyhow::Error| ViewerError::ExtractionFailed {
        file: file.file_name.clone(),
        reason: format!("{err:#}"),
    };

    let image = backend
        .register_file(file)
        .with_context(|| format!("Could not register {}", file.path.display()))
        .map_err(failed)?;
    if let Err(err) = backend.decode_and_cache(image) {
        backend.release(image);
        return Err(failed(err));
    }

    let metadata = ImageMetadata::read(backend, image);
    debug!(
        "{} -> {image} series={} instance={}",
        file.file_name, metadata.series_instance_uid, metadata.instance_number
    );
    Ok(ImageRecord {
        image,
        file_name: file.file_name.clone(),
        byte_size: file.byte_size,
        metadata,
    })
}

/// Extracts a batch with at most `max_workers` decodes in flight.
///
/// Records come back in input order whatever order the workers finish in.
pub fn extract_batch(
    backend: &dyn ImageBackend,
    files: &[SourceFile],
    max_workers: usize,
) -> ExtractedBatch {
    if files.is_empty() {
        return ExtractedBatch::default();
    }
    let worker_count = max_workers.clamp(1, 32).min(files.len());

    let mut results = thread::scope(|scope| {
        let workers = (0..worker_count)
            .map(|worker_id| {
                scope.spawn(move || {
                    (worker_id..files.len())
                        .step_by(worker_count)
                        .map(|index| (index, extract_record(backend, &files[index])))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        workers
            .into_iter()
            .zip(0..)
            .flat_map(|(worker, worker_id)| match worker.join() {
                Ok(results) => results,
                Err(_) => (worker_id..files.len())
                    .step_by(worker_count)
                    .map(|index| {
                        (
                            index,
                            Err(ViewerError::ExtractionFailed {
                                file: files[index].file_name.clone(),
                                reason: "extraction worker panicked".to_string(),
                            }),
                        )
                    })
                    .collect(),
            })
            .collect::<Vec<_>>()
    });
    results.sort_by_key(|(index, _)| *index);

    let mut batch = ExtractedBatch::default();
    for (_, result) in results {
        match result {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                warn!("{err}");
                batch.failures.push(err);
            }
        }
    }
    info!(
        "Extracted {} of {} files with {} workers",
        batch.records.len(),
        files.len(),
        worker_count
    );
    batch
}

fn parse_first_int(value: &str) -> Option<i32> {
    let first = value.split('\\').next()?.trim();
    first
        .parse::<i32>()
        .ok()
        .or_else(|| first.parse::<f64>().ok().map(|v| v.round() as i32))
}
