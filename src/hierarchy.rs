use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::info;

use crate::engine::ImageRef;
use crate::extract::ImageRecord;

/// Address of a series in the tree. Series UIDs are only unique within their
/// study, so the full path is carried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
}

impl SeriesKey {
    pub fn new(patient_id: &str, study_uid: &str, series_uid: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            study_uid: study_uid.to_string(),
            series_uid: series_uid.to_string(),
        }
    }

    pub fn of(record: &ImageRecord) -> Self {
        let meta = &record.metadata;
        Self::new(
            &meta.patient_id,
            &meta.study_instance_uid,
            &meta.series_instance_uid,
        )
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.series_uid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub instance_uid: String,
    pub description: String,
    pub number: i32,
    pub modality: String,
    /// Insertion order. Display order comes from the sequencer.
    pub images: Vec<ImageRecord>,
}

impl Series {
    fn from_record(record: &ImageRecord) -> Self {
        let meta = &record.metadata;
        Self {
            instance_uid: meta.series_instance_uid.clone(),
            description: meta.series_description.clone(),
            number: meta.series_number,
            modality: meta.modality.clone(),
            images: Vec::new(),
        }
    }

    fn holds_duplicate_of(&self, record: &ImageRecord) -> bool {
        self.images.iter().any(|image| {
            image.image == record.image
                || (image.file_name == record.file_name && image.byte_size == record.byte_size)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Study {
    pub instance_uid: String,
    pub description: String,
    pub date: String,
    /// Kept sorted by series number, ties in insertion order.
    pub series: Vec<Series>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub id: String,
    pub name: String,
    pub studies: BTreeMap<String, Study>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub added: usize,
    pub duplicates: usize,
    pub total_in_batch: usize,
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub stats: BatchStats,
    /// References of dropped duplicates, for the backend to release.
    pub discarded: Vec<ImageRef>,
    /// Every series the batch landed in, duplicates included.
    pub series: BTreeSet<SeriesKey>,
}

/// Patient → Study → Series → Image tree shared by every load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyTree {
    patients: BTreeMap<String, Patient>,
}

impl StudyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn patients(&self) -> impl Iterator<Item = &Patient> {
        self.patients.values()
    }

    pub fn image_count(&self) -> usize {
        self.series_iter().map(|(_, series)| series.images.len()).sum()
    }

    pub fn series(&self, key: &SeriesKey) -> Option<&Series> {
        self.patients
            .get(&key.patient_id)?
            .studies
            .get(&key.study_uid)?
            .series
            .iter()
            .find(|series| series.instance_uid == key.series_uid)
    }

    /// Every series in display order.
    pub fn series_iter(&self) -> impl Iterator<Item = (SeriesKey, &Series)> {
        self.patients.values().flat_map(|patient| {
            patient.studies.values().flat_map(move |study| {
                study.series.iter().map(move |series| {
                    (
                        SeriesKey::new(&patient.id, &study.instance_uid, &series.instance_uid),
                        series,
                    )
                })
            })
        })
    }

    pub fn first_series_key(&self) -> Option<SeriesKey> {
        self.series_iter().next().map(|(key, _)| key)
    }

    /// First of `keys` in display order.
    pub fn first_series_among(&self, keys: &BTreeSet<SeriesKey>) -> Option<SeriesKey> {
        self.series_iter()
            .map(|(key, _)| key)
            .find(|key| keys.contains(key))
    }

    /// Folds a whole batch into the tree before returning, so callers never
    /// see a partially merged batch.
    pub fn merge_batch(&mut self, records: Vec<ImageRecord>) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            stats: BatchStats {
                total_in_batch: records.len(),
                ..BatchStats::default()
            },
            discarded: Vec::new(),
            series: BTreeSet::new(),
        };

        for record in records {
            outcome.series.insert(SeriesKey::of(&record));
            let meta = &record.metadata;
            let patient = self
                .patients
                .entry(meta.patient_id.clone())
                .or_insert_with(|| Patient {
                    id: meta.patient_id.clone(),
                    name: meta.patient_name.clone(),
                    studies: BTreeMap::new(),
                });
            let study = patient
                .studies
                .entry(meta.study_instance_uid.clone())
                .or_insert_with(|| Study {
                    instance_uid: meta.study_instance_uid.clone(),
                    description: meta.study_description.clone(),
                    date: meta.study_date.clone(),
                    series: Vec::new(),
                });
            let position = match study
                .series
                .iter()
                .position(|series| series.instance_uid == meta.series_instance_uid)
            {
                Some(position) => position,
                None => {
                    study.series.push(Series::from_record(&record));
                    study.series.len() - 1
                }
            };

            let series = &mut study.series[position];
            if series.holds_duplicate_of(&record) {
                outcome.stats.duplicates += 1;
                if series.images.iter().all(|image| image.image != record.image) {
                    outcome.discarded.push(record.image);
                }
                continue;
            }
            series.images.push(record);
            outcome.stats.added += 1;
        }

        for patient in self.patients.values_mut() {
            for study in patient.studies.values_mut() {
                study.series.sort_by_key(|series| series.number);
            }
        }

        info!(
            "Merged batch: {} added, {} duplicates, {} images in tree",
            outcome.stats.added,
            outcome.stats.duplicates,
            self.image_count()
        );
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extract::ImageMetadata;

    pub(crate) fn record(
        image: u32,
        file_name: &str,
        patient: &str,
        study: &str,
        series: &str,
        series_number: i32,
    ) -> ImageRecord {
        ImageRecord {
            image: ImageRef(image),
            file_name: file_name.to_string(),
            byte_size: 512,
            metadata: ImageMetadata {
                patient_id: patient.to_string(),
                patient_name: format!("{patient} name"),
                study_instance_uid: study.to_string(),
                series_instance_uid: series.to_string(),
                series_description: format!("{series} desc"),
                series_number,
                ..ImageMetadata::default()
            },
        }
    }

    fn batch(offset: u32, series: &str, number: i32, count: u32) -> Vec<ImageRecord> {
        (0..count)
            .map(|i| {
                record(
                    offset + i,
                    &format!("{series}-{i}.dcm"),
                    "P1",
                    "S1",
                    series,
                    number,
                )
            })
            .collect()
    }

    #[test]
    fn reloading_a_batch_only_counts_duplicates() {
        let mut tree = StudyTree::new();
        let first = tree.merge_batch(batch(0, "1.1", 1, 5));
        assert_eq!(
            first.stats,
            BatchStats {
                added: 5,
                duplicates: 0,
                total_in_batch: 5
            }
        );

        let snapshot = tree.clone();
        // Same files registered again get fresh references.
        let second = tree.merge_batch(batch(100, "1.1", 1, 5));
        assert_eq!(
            second.stats,
            BatchStats {
                added: 0,
                duplicates: 5,
                total_in_batch: 5
            }
        );
        assert_eq!(second.discarded.len(), 5);
        assert_eq!(tree, snapshot);
    }

    #[test]
    fn same_reference_is_a_duplicate_but_not_released() {
        let mut tree = StudyTree::new();
        tree.merge_batch(batch(0, "1.1", 1, 1));
        let mut renamed = batch(0, "1.1", 1, 1);
        renamed[0].file_name = "other.dcm".to_string();
        let outcome = tree.merge_batch(renamed);
        assert_eq!(outcome.stats.duplicates, 1);
        assert!(outcome.discarded.is_empty());
    }

    #[test]
    fn duplicates_within_one_batch_are_dropped() {
        let mut tree = StudyTree::new();
        let mut records = batch(0, "1.1", 1, 2);
        let mut copy = records[0].clone();
        copy.image = ImageRef(50);
        records.push(copy);
        let outcome = tree.merge_batch(records);
        assert_eq!(outcome.stats.added, 2);
        assert_eq!(outcome.stats.duplicates, 1);
        assert_eq!(outcome.discarded, vec![ImageRef(50)]);
    }

    #[test]
    fn disjoint_batches_merge_in_any_order() {
        let a = batch(0, "1.1", 2, 3);
        let b = batch(10, "1.2", 1, 4);

        let mut ab = StudyTree::new();
        ab.merge_batch(a.clone());
        ab.merge_batch(b.clone());

        let mut ba = StudyTree::new();
        ba.merge_batch(b);
        ba.merge_batch(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.image_count(), 7);
    }

    #[test]
    fn series_sorted_by_number_then_insertion() {
        let mut tree = StudyTree::new();
        tree.merge_batch(vec![
            record(0, "a", "P1", "S1", "third", 3),
            record(1, "b", "P1", "S1", "first-a", 1),
        ]);
        tree.merge_batch(vec![
            record(2, "c", "P1", "S1", "first-b", 1),
            record(3, "d", "P1", "S1", "second", 2),
        ]);

        let order = tree
            .series_iter()
            .map(|(key, _)| key.series_uid)
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["first-a", "first-b", "second", "third"]);
    }

    #[test]
    fn same_series_uid_in_different_studies_stays_apart() {
        let mut tree = StudyTree::new();
        tree.merge_batch(vec![
            record(0, "a", "P1", "S1", "1.1", 1),
            record(1, "b", "P1", "S2", "1.1", 1),
            record(2, "c", "P2", "S3", "9.9", 1),
        ]);
        assert_eq!(tree.patients().count(), 2);
        let key = SeriesKey::new("P1", "S2", "1.1");
        let series = tree.series(&key).expect("series should exist");
        assert_eq!(series.images.len(), 1);
        assert_eq!(series.images[0].file_name, "b");
        assert!(tree.series(&SeriesKey::new("P1", "S9", "1.1")).is_none());
    }

    #[test]
    fn first_record_names_the_nodes() {
        let mut tree = StudyTree::new();
        tree.merge_batch(vec![record(0, "a", "P1", "S1", "1.1", 7)]);
        let patient = tree.patients().next().expect("patient");
        assert_eq!(patient.name, "P1 name");
        let study = &patient.studies["S1"];
        assert_eq!(study.series[0].description, "1.1 desc");
        assert_eq!(study.series[0].number, 7);
    }

    #[test]
    fn batch_reports_the_series_it_touched() {
        let mut tree = StudyTree::new();
        tree.merge_batch(vec![record(0, "a", "P1", "S1", "early", 1)]);

        let outcome = tree.merge_batch(vec![
            record(1, "b", "P1", "S1", "late", 5),
            record(2, "c", "P1", "S1", "middle", 3),
            record(3, "a", "P1", "S1", "early", 1),
        ]);
        assert_eq!(outcome.series.len(), 3);
        assert_eq!(outcome.stats.duplicates, 1);

        let fresh = [
            SeriesKey::new("P1", "S1", "late"),
            SeriesKey::new("P1", "S1", "middle"),
        ]
        .into_iter()
        .collect::<BTreeSet<_>>();
        assert_eq!(
            tree.first_series_among(&fresh),
            Some(SeriesKey::new("P1", "S1", "middle"))
        );
        assert_eq!(tree.first_series_key(), Some(SeriesKey::new("P1", "S1", "early")));
    }
}
