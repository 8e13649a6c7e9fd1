//! Anatomical slice ordering for one series.
//!
//! Strategies are tried in a fixed order and the first one that succeeds
//! decides the whole order. A strategy that lacks the data it needs returns a
//! [`SortFailure`] instead of guessing.

use std::cmp::Ordering;
use std::collections::HashSet;

use log::{debug, info};

use crate::engine::{ImageBackend, ImageRef};
use crate::extract::ImageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStrategy {
    /// Zero or one image, nothing to compare.
    Trivial,
    PatientPosition,
    BackendSpacing,
    InstanceNumber,
    SliceLocation,
    FileName,
}

impl SortStrategy {
    pub fn label(self) -> &'static str {
        match self {
            Self::Trivial => "single image",
            Self::PatientPosition => "patient position",
            Self::BackendSpacing => "stack geometry",
            Self::InstanceNumber => "instance number",
            Self::SliceLocation => "slice location",
            Self::FileName => "file name",
        }
    }

    /// True when the preferred geometric sort could not be used.
    pub fn is_degraded(self) -> bool {
        !matches!(self, Self::Trivial | Self::PatientPosition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceOrder {
    pub images: Vec<ImageRef>,
    pub strategy: SortStrategy,
    /// Distance between neighbouring slices along the sort axis, when known.
    pub spacing: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortFailure {
    MissingData(&'static str),
    Degenerate(&'static str),
    Backend(String),
}

type Strategy = fn(&[&ImageRecord], &dyn ImageBackend) -> Result<SliceOrder, SortFailure>;

const STRATEGIES: &[(SortStrategy, Strategy)] = &[
    (SortStrategy::PatientPosition, by_patient_position),
    (SortStrategy::BackendSpacing, by_backend_spacing),
    (SortStrategy::InstanceNumber, by_instance_number),
    (SortStrategy::SliceLocation, by_slice_location),
    (SortStrategy::FileName, by_file_name),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

/// Orders `images` for display. The result only depends on the set of
/// records, not on the order they are passed in.
pub fn sequence_series(images: &[ImageRecord], backend: &dyn ImageBackend) -> SliceOrder {
    if images.len() < 2 {
        return SliceOrder {
            images: images.iter().map(|record| record.image).collect(),
            strategy: SortStrategy::Trivial,
            spacing: None,
        };
    }

    // Canonical input order keeps every strategy independent of insertion order.
    let mut canonical = images.iter().collect::<Vec<_>>();
    canonical.sort_by(|a, b| by_name(a, b));

    for (strategy, run) in STRATEGIES {
        match run(&canonical, backend) {
            Ok(order) => {
                if strategy.is_degraded() {
                    info!(
                        "Ordered {} slices by {} instead of patient position",
                        order.images.len(),
                        strategy.label()
                    );
                }
                return order;
            }
            Err(failure) => debug!("{} sort not usable: {failure:?}", strategy.label()),
        }
    }

    // by_file_name never fails; this keeps the function total regardless.
    SliceOrder {
        images: canonical.iter().map(|record| record.image).collect(),
        strategy: SortStrategy::FileName,
        spacing: None,
    }
}

fn by_name(a: &ImageRecord, b: &ImageRecord) -> Ordering {
    a.file_name
        .cmp(&b.file_name)
        .then(a.byte_size.cmp(&b.byte_size))
        .then(a.image.cmp(&b.image))
}

fn axis_ranges(positions: &[[f64; 3]]) -> [f64; 3] {
    let mut ranges = [0.0; 3];
    for (axis, range) in ranges.iter_mut().enumerate() {
        let (lo, hi) = positions
            .iter()
            .map(|p| p[axis])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        *range = hi - lo;
    }
    ranges
}

/// Largest range wins; near-equal ranges prefer z, then y, then x.
fn dominant_axis(ranges: [f64; 3]) -> Axis {
    let tolerance = |range: f64| 1e-6 * range.abs().max(1.0);
    let mut best = Axis::Z;
    for candidate in [Axis::Y, Axis::X] {
        let current = ranges[best as usize];
        if ranges[candidate as usize] > current + tolerance(current) {
            best = candidate;
        }
    }
    best
}

fn by_patient_position(
    images: &[&ImageRecord],
    _backend: &dyn ImageBackend,
) -> Result<SliceOrder, SortFailure> {
    let positions = images
        .iter()
        .filter_map(|record| record.metadata.image_position_patient)
        .collect::<Vec<_>>();
    if positions.len() < 2 {
        return Err(SortFailure::MissingData("fewer than two images carry a position"));
    }

    let ranges = axis_ranges(&positions);
    let axis = dominant_axis(ranges);
    let range = ranges[axis as usize];
    if range <= 1e-6 {
        return Err(SortFailure::Degenerate("all positions coincide"));
    }

    // Images without a position go last, in name order.
    let coordinate = |record: &ImageRecord| {
        record
            .metadata
            .image_position_patient
            .map_or(f64::INFINITY, |p| p[axis as usize])
    };
    let mut sorted = images.to_vec();
    sorted.sort_by(|a, b| coordinate(*a).total_cmp(&coordinate(*b)).then(by_name(a, b)));

    Ok(SliceOrder {
        images: sorted.iter().map(|record| record.image).collect(),
        strategy: SortStrategy::PatientPosition,
        spacing: Some(range / (positions.len() - 1) as f64),
    })
}

fn by_backend_spacing(
    images: &[&ImageRecord],
    backend: &dyn ImageBackend,
) -> Result<SliceOrder, SortFailure> {
    let refs = images.iter().map(|record| record.image).collect::<Vec<_>>();
    let result = backend
        .sort_by_spacing(&refs)
        .map_err(|err| SortFailure::Backend(format!("{err:#}")))?;

    let expected = refs.iter().collect::<HashSet<_>>();
    let returned = result.sorted.iter().collect::<HashSet<_>>();
    if result.sorted.len() != refs.len() || expected != returned {
        return Err(SortFailure::Backend(
            "backend returned a different set of images".to_string(),
        ));
    }

    Ok(SliceOrder {
        images: result.sorted,
        strategy: SortStrategy::BackendSpacing,
        spacing: Some(result.z_spacing),
    })
}

fn by_instance_number(
    images: &[&ImageRecord],
    _backend: &dyn ImageBackend,
) -> Result<SliceOrder, SortFailure> {
    let first = images[0].metadata.instance_number;
    if images
        .iter()
        .all(|record| record.metadata.instance_number == first)
    {
        return Err(SortFailure::MissingData("instance numbers carry no order"));
    }

    let mut sorted = images.to_vec();
    sorted.sort_by(|a, b| {
        a.metadata
            .instance_number
            .cmp(&b.metadata.instance_number)
            .then(by_name(a, b))
    });
    Ok(SliceOrder {
        images: sorted.iter().map(|record| record.image).collect(),
        strategy: SortStrategy::InstanceNumber,
        spacing: None,
    })
}

fn by_slice_location(
    images: &[&ImageRecord],
    _backend: &dyn ImageBackend,
) -> Result<SliceOrder, SortFailure> {
    let first = images[0].metadata.slice_location;
    if images
        .iter()
        .all(|record| record.metadata.slice_location == first)
    {
        return Err(SortFailure::MissingData("slice locations carry no order"));
    }

    let mut sorted = images.to_vec();
    sorted.sort_by(|a, b| {
        a.metadata
            .slice_location
            .total_cmp(&b.metadata.slice_location)
            .then(by_name(a, b))
    });
    Ok(SliceOrder {
        images: sorted.iter().map(|record| record.image).collect(),
        strategy: SortStrategy::SliceLocation,
        spacing: None,
    })
}

fn by_file_name(
    images: &[&ImageRecord],
    _backend: &dyn ImageBackend,
) -> Result<SliceOrder, SortFailure> {
    let mut sorted = images.to_vec();
    sorted.sort_by(|a, b| by_name(a, b));
    Ok(SliceOrder {
        images: sorted.iter().map(|record| record.image).collect(),
        strategy: SortStrategy::FileName,
        spacing: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use dicom_object::Tag;

    use crate::engine::{SourceFile, SpacingSort};
    use crate::extract::tests::FakeBackend;
    use crate::hierarchy::tests::record;

    /// Backend that must never be consulted.
    struct UntouchableBackend;

    impl ImageBackend for UntouchableBackend {
        fn register_file(&self, _file: &SourceFile) -> Result<ImageRef> {
            unreachable!("sequencer never registers files")
        }
        fn decode_and_cache(&self, _image: ImageRef) -> Result<()> {
            unreachable!("sequencer never decodes")
        }
        fn read_tag(&self, _tag: Tag, _image: ImageRef) -> Option<String> {
            unreachable!("sequencer reads records, not tags")
        }
        fn sort_by_spacing(&self, _images: &[ImageRef]) -> Result<SpacingSort> {
            panic!("spacing sort must not run")
        }
        fn release(&self, _image: ImageRef) {}
    }

    fn slice(image: u32, name: &str) -> ImageRecord {
        record(image, name, "P1", "S1", "1.1", 1)
    }

    fn positioned(image: u32, position: [f64; 3]) -> ImageRecord {
        let mut rec = slice(image, &format!("f{image}.dcm"));
        rec.metadata.image_position_patient = Some(position);
        rec
    }

    fn order_of(order: &SliceOrder) -> Vec<u32> {
        order.images.iter().map(|image| image.0).collect()
    }

    #[test]
    fn axial_stack_sorted_by_z() {
        let images = vec![
            positioned(0, [0.0, 0.0, 30.0]),
            positioned(1, [0.0, 0.0, 0.0]),
            positioned(2, [0.0, 0.0, 40.0]),
            positioned(3, [0.0, 0.0, 10.0]),
            positioned(4, [0.0, 0.0, 20.0]),
        ];
        let order = sequence_series(&images, &FakeBackend::default());
        assert_eq!(order.strategy, SortStrategy::PatientPosition);
        assert_eq!(order_of(&order), vec![1, 3, 4, 0, 2]);
        assert_eq!(order.spacing, Some(10.0));
    }

    #[test]
    fn input_order_does_not_change_result() {
        let mut images = vec![
            positioned(0, [0.0, 0.0, 30.0]),
            positioned(1, [0.0, 0.0, 0.0]),
            positioned(2, [0.0, 0.0, 30.0]),
            positioned(3, [0.0, 0.0, 10.0]),
        ];
        let forward = sequence_series(&images, &FakeBackend::default());
        images.reverse();
        let backward = sequence_series(&images, &FakeBackend::default());
        assert_eq!(forward, backward);
        assert_eq!(order_of(&forward), vec![1, 3, 0, 2]);
    }

    #[test]
    fn coronal_and_sagittal_stacks_use_their_axis() {
        let coronal = vec![
            positioned(0, [5.0, 20.0, 1.0]),
            positioned(1, [5.0, -10.0, 2.0]),
            positioned(2, [5.0, 5.0, 3.0]),
        ];
        let order = sequence_series(&coronal, &FakeBackend::default());
        assert_eq!(order_of(&order), vec![1, 2, 0]);

        let sagittal = vec![
            positioned(0, [9.0, 0.0, 0.0]),
            positioned(1, [-3.0, 1.0, 0.0]),
            positioned(2, [4.0, 0.5, 0.0]),
        ];
        let order = sequence_series(&sagittal, &FakeBackend::default());
        assert_eq!(order_of(&order), vec![1, 2, 0]);
    }

    #[test]
    fn equal_ranges_prefer_z_then_y() {
        assert_eq!(dominant_axis([10.0, 10.0, 10.0]), Axis::Z);
        assert_eq!(dominant_axis([10.0, 10.0, 4.0]), Axis::Y);
        assert_eq!(dominant_axis([10.0 + 1e-9, 10.0, 4.0]), Axis::Y);
        assert_eq!(dominant_axis([12.0, 10.0, 4.0]), Axis::X);
    }

    #[test]
    fn images_without_position_go_last() {
        let images = vec![
            slice(9, "a.dcm"),
            positioned(0, [0.0, 0.0, 5.0]),
            positioned(1, [0.0, 0.0, -5.0]),
        ];
        let order = sequence_series(&images, &FakeBackend::default());
        assert_eq!(order.strategy, SortStrategy::PatientPosition);
        assert_eq!(order_of(&order), vec![1, 0, 9]);
    }

    #[test]
    fn backend_spacing_used_without_positions() {
        let backend = FakeBackend::default();
        *backend.spacing.lock().expect("lock") = Some(SpacingSort {
            sorted: vec![ImageRef(2), ImageRef(0), ImageRef(1)],
            z_spacing: 2.5,
        });
        let images = vec![slice(0, "a"), slice(1, "b"), slice(2, "c")];
        let order = sequence_series(&images, &backend);
        assert_eq!(order.strategy, SortStrategy::BackendSpacing);
        assert_eq!(order_of(&order), vec![2, 0, 1]);
        assert_eq!(order.spacing, Some(2.5));
        assert!(order.strategy.is_degraded());
    }

    #[test]
    fn backend_answer_with_foreign_images_is_rejected() {
        let backend = FakeBackend::default();
        *backend.spacing.lock().expect("lock") = Some(SpacingSort {
            sorted: vec![ImageRef(0), ImageRef(7)],
            z_spacing: 1.0,
        });
        let mut images = vec![slice(0, "a"), slice(1, "b")];
        images[0].metadata.instance_number = 2;
        images[1].metadata.instance_number = 1;
        let order = sequence_series(&images, &backend);
        assert_eq!(order.strategy, SortStrategy::InstanceNumber);
        assert_eq!(order_of(&order), vec![1, 0]);
    }

    #[test]
    fn falls_back_to_instance_number() {
        let mut images = vec![slice(0, "a"), slice(1, "b"), slice(2, "c")];
        for (record, number) in images.iter_mut().zip([3, 1, 2]) {
            record.metadata.instance_number = number;
        }
        let order = sequence_series(&images, &FakeBackend::default());
        assert_eq!(order.strategy, SortStrategy::InstanceNumber);
        assert_eq!(order_of(&order), vec![1, 2, 0]);
    }

    #[test]
    fn falls_back_to_slice_location() {
        let mut images = vec![slice(0, "a"), slice(1, "b"), slice(2, "c")];
        for (record, location) in images.iter_mut().zip([5.0, 1.0, 3.0]) {
            record.metadata.slice_location = location;
        }
        let order = sequence_series(&images, &FakeBackend::default());
        assert_eq!(order.strategy, SortStrategy::SliceLocation);
        assert_eq!(order_of(&order), vec![1, 2, 0]);
    }

    #[test]
    fn file_name_is_the_last_resort() {
        let images = vec![slice(0, "IM3"), slice(1, "IM1"), slice(2, "IM2")];
        let order = sequence_series(&images, &FakeBackend::default());
        assert_eq!(order.strategy, SortStrategy::FileName);
        assert_eq!(order_of(&order), vec![1, 2, 0]);
    }

    #[test]
    fn coincident_positions_fall_through() {
        let mut images = vec![
            positioned(0, [1.0, 1.0, 1.0]),
            positioned(1, [1.0, 1.0, 1.0]),
        ];
        images[0].metadata.instance_number = 9;
        images[1].metadata.instance_number = 4;
        let order = sequence_series(&images, &FakeBackend::default());
        assert_eq!(order.strategy, SortStrategy::InstanceNumber);
        assert_eq!(order_of(&order), vec![1, 0]);
    }

    #[test]
    fn single_image_skips_every_strategy() {
        let images = vec![slice(4, "only.dcm")];
        let order = sequence_series(&images, &UntouchableBackend);
        assert_eq!(order.strategy, SortStrategy::Trivial);
        assert_eq!(order_of(&order), vec![4]);
        assert!(sequence_series(&[], &UntouchableBackend).images.is_empty());
    }
}
