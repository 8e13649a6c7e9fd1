//! CT window presets, width/center in Hounsfield units.

use crate::engine::WindowLevel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPreset {
    pub name: &'static str,
    pub category: &'static str,
    pub window: WindowLevel,
}

macro_rules! preset {
    ($category:literal, $name:literal, $width:literal, $center:literal) => {
        WindowPreset {
            name: $name,
            category: $category,
            window: WindowLevel {
                width: $width,
                center: $center,
            },
        }
    };
}

pub const PRESETS: &[WindowPreset] = &[
    preset!("Head & Neck", "Brain", 80.0, 40.0),
    preset!("Head & Neck", "Subdural", 200.0, 75.0),
    preset!("Head & Neck", "Stroke", 40.0, 40.0),
    preset!("Head & Neck", "Temporal Bones", 3400.0, 650.0),
    preset!("Head & Neck", "Soft Tissues (Head)", 375.0, 40.0),
    preset!("Chest", "Lungs", 1500.0, -600.0),
    preset!("Chest", "Mediastinum", 350.0, 50.0),
    preset!("Chest", "Vascular/Heart", 600.0, 200.0),
    preset!("Abdomen", "Abdomen Soft Tissues", 400.0, 50.0),
    preset!("Abdomen", "Liver", 150.0, 30.0),
    preset!("Spine & Bone", "Spine Soft Tissues", 250.0, 50.0),
    preset!("Spine & Bone", "Bone", 1800.0, 400.0),
];

pub fn find_preset(name: &str) -> Option<&'static WindowPreset> {
    PRESETS
        .iter()
        .find(|preset| preset.name.eq_ignore_ascii_case(name.trim()))
}

/// Categories in table order, each with its presets.
pub fn presets_by_category() -> Vec<(&'static str, Vec<&'static WindowPreset>)> {
    let mut groups: Vec<(&'static str, Vec<&'static WindowPreset>)> = Vec::new();
    for preset in PRESETS {
        match groups.iter_mut().find(|(category, _)| *category == preset.category) {
            Some((_, members)) => members.push(preset),
            None => groups.push((preset.category, vec![preset])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_padding() {
        let lungs = find_preset(" lungs ").expect("lungs preset");
        assert_eq!(lungs.window.width, 1500.0);
        assert_eq!(lungs.window.center, -600.0);
        assert!(find_preset("Knee").is_none());
    }

    #[test]
    fn categories_keep_table_order() {
        let groups = presets_by_category();
        let names = groups.iter().map(|(name, _)| *name).collect::<Vec<_>>();
        assert_eq!(names, vec!["Head & Neck", "Chest", "Abdomen", "Spine & Bone"]);
        assert_eq!(groups[0].1.len(), 5);
        assert_eq!(groups.iter().map(|(_, p)| p.len()).sum::<usize>(), PRESETS.len());
    }

    #[test]
    fn preset_names_are_unique() {
        for (index, preset) in PRESETS.iter().enumerate() {
            assert!(PRESETS[index + 1..]
                .iter()
                .all(|other| !other.name.eq_ignore_ascii_case(preset.name)));
        }
    }
}
