use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::{fs, io::Cursor};

use anyhow::{anyhow, bail, Context, Result};
use dicom_object::{from_reader, open_file, DefaultDicomObject, ReadError, Tag};
use dicom_pixeldata::PixelDecoder;

use crate::engine::{tags, ImageBackend, ImageRef, SourceFile, SpacingSort, WindowLevel};

/// Tags kept after decoding. Everything else, pixel data included, is dropped
/// with the parsed object.
const SNAPSHOT_TAGS: &[Tag] = &[
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    Tag(0x0010, 0x0030),
    Tag(0x0010, 0x0040),
    tags::STUDY_DATE,
    Tag(0x0008, 0x0030),
    tags::MODALITY,
    Tag(0x0008, 0x0070),
    Tag(0x0008, 0x0080),
    tags::STUDY_DESCRIPTION,
    tags::SERIES_DESCRIPTION,
    Tag(0x0008, 0x0018),
    Tag(0x0018, 0x0015),
    Tag(0x0018, 0x0050),
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::SERIES_NUMBER,
    tags::INSTANCE_NUMBER,
    tags::IMAGE_POSITION_PATIENT,
    tags::IMAGE_ORIENTATION_PATIENT,
    tags::SLICE_LOCATION,
    Tag(0x0028, 0x0004),
    Tag(0x0028, 0x0010),
    Tag(0x0028, 0x0011),
    Tag(0x0028, 0x0030),
    Tag(0x0028, 0x1050),
    Tag(0x0028, 0x1051),
];

const PHOTOMETRIC_INTERPRETATION: Tag = Tag(0x0028, 0x0004);
const ROWS: Tag = Tag(0x0028, 0x0010);
const COLUMNS: Tag = Tag(0x0028, 0x0011);
const WINDOW_CENTER: Tag = Tag(0x0028, 0x1050);
const WINDOW_WIDTH: Tag = Tag(0x0028, 0x1051);

#[derive(Debug, Clone)]
pub enum ImagePixels {
    Monochrome(Arc<[i32]>),
    Rgb {
        samples_per_pixel: u16,
        data: Arc<[u8]>,
    },
}

/// First frame of a decoded file, ready for window/level mapping.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: usize,
    pub height: usize,
    pub pixels: ImagePixels,
    pub invert: bool,
    pub default_window: WindowLevel,
    pub min_value: i32,
    pub max_value: i32,
}

impl DecodedImage {
    pub fn is_monochrome(&self) -> bool {
        matches!(self.pixels, ImagePixels::Monochrome(_))
    }
}

struct CachedImage {
    tags: HashMap<Tag, String>,
    image: Arc<DecodedImage>,
}

struct BackendEntry {
    file: SourceFile,
    cached: Option<Arc<CachedImage>>,
}

/// [`ImageBackend`] over local DICOM files.
///
/// References index into an append-only table; released slots stay empty so a
/// stale reference never aliases a newer file.
#[derive(Default)]
pub struct DicomBackend {
    entries: Mutex<Vec<Option<BackendEntry>>>,
}

impl DicomBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, image: ImageRef) -> Option<Arc<DecodedImage>> {
        self.cached(image).map(|cached| Arc::clone(&cached.image))
    }

    #[cfg(test)]
    fn registered_count(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.iter().filter(|entry| entry.is_some()).count())
            .unwrap_or(0)
    }

    fn cached(&self, image: ImageRef) -> Option<Arc<CachedImage>> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(image.0 as usize)?
            .as_ref()?
            .cached
            .as_ref()
            .map(Arc::clone)
    }

    fn source_path(&self, image: ImageRef) -> Result<std::path::PathBuf> {
        let entries = self
            .entries
            .lock()
            .map_err(|err| anyhow!("Image table lock poisoned: {err}"))?;
        entries
            .get(image.0 as usize)
            .and_then(Option::as_ref)
            .map(|entry| entry.file.path.clone())
            .with_context(|| format!("{image} is not registered"))
    }

    fn geometry(&self, image: ImageRef) -> Result<([f64; 6], [f64; 3])> {
        let orientation = self
            .read_tag(tags::IMAGE_ORIENTATION_PATIENT, image)
            .and_then(|value| parse_decimal_list(&value))
            .filter(|values| values.len() == 6)
            .with_context(|| format!("{image} has no ImageOrientationPatient"))?;
        let position = self
            .read_tag(tags::IMAGE_POSITION_PATIENT, image)
            .and_then(|value| parse_decimal_list(&value))
            .filter(|values| values.len() == 3)
            .with_context(|| format!("{image} has no ImagePositionPatient"))?;

        let mut iop = [0.0; 6];
        iop.copy_from_slice(&orientation);
        Ok((iop, [position[0], position[1], position[2]]))
    }
}

impl ImageBackend for DicomBackend {
    fn register_file(&self, file: &SourceFile) -> Result<ImageRef> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| anyhow!("Image table lock poisoned: {err}"))?;
        let index = u32::try_from(entries.len()).context("Image table is full")?;
        entries.push(Some(BackendEntry {
            file: file.clone(),
            cached: None,
        }));
        Ok(ImageRef(index))
    }

    fn decode_and_cache(&self, image: ImageRef) -> Result<()> {
        let path = self.source_path(image)?;
        let obj = open_dicom_object(&path)?;
        let decoded = decode_first_frame(&obj)
            .with_context(|| format!("Could not decode {}", path.display()))?;
        let cached = Arc::new(CachedImage {
            tags: snapshot_tags(&obj),
            image: Arc::new(decoded),
        });

        let mut entries = self
            .entries
            .lock()
            .map_err(|err| anyhow!("Image table lock poisoned: {err}"))?;
        match entries.get_mut(image.0 as usize).and_then(Option::as_mut) {
            Some(entry) => {
                entry.cached = Some(cached);
                Ok(())
            }
            None => bail!("{image} was released while decoding"),
        }
    }

    fn read_tag(&self, tag: Tag, image: ImageRef) -> Option<String> {
        self.cached(image)?.tags.get(&tag).cloned()
    }

    fn sort_by_spacing(&self, images: &[ImageRef]) -> Result<SpacingSort> {
        let slices = images
            .iter()
            .map(|image| {
                self.geometry(*image)
                    .map(|(orientation, position)| (*image, orientation, position))
            })
            .collect::<Result<Vec<_>>>()?;
        order_along_normal(&slices)
    }

    fn release(&self, image: ImageRef) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(slot) = entries.get_mut(image.0 as usize) {
                *slot = None;
            }
        }
    }
}

/// Projects every position onto the normal of the first slice's orientation
/// and sorts by that distance.
pub fn order_along_normal(slices: &[(ImageRef, [f64; 6], [f64; 3])]) -> Result<SpacingSort> {
    let Some((_, orientation, _)) = slices.first() else {
        bail!("No images to sort");
    };
    let row = [orientation[0], orientation[1], orientation[2]];
    let col = [orientation[3], orientation[4], orientation[5]];
    let normal = [
        row[1] * col[2] - row[2] * col[1],
        row[2] * col[0] - row[0] * col[2],
        row[0] * col[1] - row[1] * col[0],
    ];
    let norm = (normal[0] * normal[0] + normal[1] * normal[1] + normal[2] * normal[2]).sqrt();
    if !norm.is_finite() || norm < 1e-6 {
        bail!("ImageOrientationPatient does not span a plane");
    }

    let mut projected = slices
        .iter()
        .map(|(image, _, position)| {
            let distance = (normal[0] * position[0]
                + normal[1] * position[1]
                + normal[2] * position[2])
                / norm;
            (*image, distance)
        })
        .collect::<Vec<_>>();
    projected.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let z_spacing = match projected.as_slice() {
        [first, second, ..] => (second.1 - first.1).abs(),
        _ => 0.0,
    };
    if projected.len() > 1 && z_spacing < 1e-6 {
        bail!("Slices share the same position along the stack normal");
    }

    Ok(SpacingSort {
        sorted: projected.into_iter().map(|(image, _)| image).collect(),
        z_spacing,
    })
}

pub(crate) fn parse_decimal_list(value: &str) -> Option<Vec<f64>> {
    value
        .split('\\')
        .map(|part| part.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect()
}

fn parse_first_decimal(value: &str) -> Option<f32> {
    value.split('\\').next()?.trim().parse::<f32>().ok()
}

fn snapshot_tags(obj: &DefaultDicomObject) -> HashMap<Tag, String> {
    SNAPSHOT_TAGS
        .iter()
        .filter_map(|tag| {
            obj.element(*tag)
                .ok()
                .and_then(|el| el.to_str().ok())
                .map(|value| value.trim().trim_end_matches('\0').to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (*tag, value))
        })
        .collect()
}

fn read_text(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn decode_first_frame(obj: &DefaultDicomObject) -> Result<DecodedImage> {
    let width: usize = obj
        .element(COLUMNS)
        .context("Missing Columns tag")?
        .to_int()
        .context("Invalid Columns value")?;
    let height: usize = obj
        .element(ROWS)
        .context("Missing Rows tag")?
        .to_int()
        .context("Invalid Rows value")?;

    let invert = read_text(obj, PHOTOMETRIC_INTERPRETATION)
        .is_some_and(|value| value.eq_ignore_ascii_case("MONOCHROME1"));

    let decoded = obj
        .decode_pixel_data_frame(0)
        .context("Failed to decode PixelData frame 0")?;
    if decoded.columns() as usize != width || decoded.rows() as usize != height {
        bail!(
            "Decoded frame is {}x{} but tags say {}x{}",
            decoded.columns(),
            decoded.rows(),
            width,
            height
        );
    }

    let bits_allocated = decoded.bits_allocated();
    if bits_allocated != 8 && bits_allocated != 16 {
        bail!("BitsAllocated={} is not supported (only 8/16)", bits_allocated);
    }

    match decoded.samples_per_pixel() {
        1 => {
            let pixels: Vec<i32> = decoded
                .to_vec_frame(0)
                .context("Could not convert frame 0 to i32 samples")?;
            if pixels.len() != width * height {
                bail!(
                    "Decoded pixel count {} does not match {}x{}",
                    pixels.len(),
                    width,
                    height
                );
            }
            let (min_value, max_value) =
                min_max(&pixels).context("No pixels available for rendering")?;

            let center = read_text(obj, WINDOW_CENTER)
                .and_then(|value| parse_first_decimal(&value))
                .unwrap_or((min_value + max_value) as f32 / 2.0);
            let width_value = read_text(obj, WINDOW_WIDTH)
                .and_then(|value| parse_first_decimal(&value))
                .unwrap_or((max_value - min_value).max(1) as f32);

            Ok(DecodedImage {
                width,
                height,
                pixels: ImagePixels::Monochrome(Arc::from(pixels.into_boxed_slice())),
                invert,
                default_window: WindowLevel {
                    width: width_value.max(1.0),
                    center,
                },
                min_value,
                max_value,
            })
        }
        spp if spp >= 3 => {
            let data: Vec<u8> = if bits_allocated == 8 {
                decoded
                    .to_vec_frame(0)
                    .context("Could not convert frame 0 to u8 samples")?
            } else {
                let shift = decoded.bits_stored().saturating_sub(8);
                let wide: Vec<u16> = decoded
                    .to_vec_frame(0)
                    .context("Could not convert frame 0 to u16 samples")?;
                wide.into_iter().map(|sample| (sample >> shift) as u8).collect()
            };

            Ok(DecodedImage {
                width,
                height,
                pixels: ImagePixels::Rgb {
                    samples_per_pixel: spp,
                    data: Arc::from(data.into_boxed_slice()),
                },
                invert: false,
                default_window: WindowLevel {
                    width: 255.0,
                    center: 127.5,
                },
                min_value: 0,
                max_value: 255,
            })
        }
        other => bail!("Unsupported SamplesPerPixel={}", other),
    }
}

fn min_max(values: &[i32]) -> Option<(i32, i32)> {
    let first = *values.first()?;
    Some(
        values
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
    )
}

fn open_dicom_object(path: &Path) -> Result<DefaultDicomObject> {
    match open_file(path) {
        Ok(obj) => Ok(obj),
        Err(err) if lacks_meta_group_length(&err) => {
            let bytes =
                fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
            let repaired = insert_meta_group_length(&bytes).ok_or(err).with_context(|| {
                format!("Could not open {}", path.display())
            })?;
            from_reader(Cursor::new(repaired)).with_context(|| {
                format!(
                    "Could not open {} after inserting File Meta Information Group Length",
                    path.display()
                )
            })
        }
        Err(err) => Err(err).with_context(|| format!("Could not open {}", path.display())),
    }
}

fn lacks_meta_group_length(error: &ReadError) -> bool {
    matches!(
        error,
        ReadError::ParseMetaDataSet {
            source: dicom_object::meta::Error::UnexpectedTag { tag, .. }
        } if tag.group() == 0x0002 && tag.element() != 0x0000
    )
}

/// Some writers omit (0002,0000). Rebuilds the file with that element
/// inserted right after the `DICM` magic.
fn insert_meta_group_length(bytes: &[u8]) -> Option<Vec<u8>> {
    let start = match bytes.get(128..132) {
        Some(magic) if magic == b"DICM" => 132,
        _ if bytes.starts_with(b"DICM") => 4,
        _ => return None,
    };

    let first = bytes.get(start..start + 4)?;
    if u16::from_le_bytes([first[0], first[1]]) != 0x0002
        || u16::from_le_bytes([first[2], first[3]]) == 0x0000
    {
        return None;
    }

    let mut cursor = start;
    while let Some(header) = bytes.get(cursor..cursor + 8) {
        if u16::from_le_bytes([header[0], header[1]]) != 0x0002 {
            break;
        }
        let long_form = matches!(
            &header[4..6],
            b"OB" | b"OD" | b"OF" | b"OL" | b"OW" | b"SQ" | b"UC" | b"UR" | b"UT" | b"UN"
        );
        let (header_len, value_len) = if long_form {
            let raw = bytes.get(cursor + 8..cursor + 12)?;
            let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if len == u32::MAX {
                return None;
            }
            (12, len as usize)
        } else {
            (8, u16::from_le_bytes([header[6], header[7]]) as usize)
        };
        let next = cursor.checked_add(header_len)?.checked_add(value_len)?;
        if next > bytes.len() {
            return None;
        }
        cursor = next;
    }

    let group_len = u32::try_from(cursor.checked_sub(start).filter(|len| *len > 0)?).ok()?;
    let mut repaired = Vec::with_capacity(bytes.len() + 12);
    repaired.extend_from_slice(&bytes[..start]);
    repaired.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, b'U', b'L', 0x04, 0x00]);
    repaired.extend_from_slice(&group_len.to_le_bytes());
    repaired.extend_from_slice(&bytes[start..]);
    Some(repaired)
}
