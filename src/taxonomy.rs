//! Disease taxonomy
//!
//! Fixed bijection between the corn-leaf disease labels and sequential class ids.
//! Ids are contiguous from 0 and match the byte-wise order of the class
//! directory names in the training data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name returned for any id outside the taxonomy
pub const UNKNOWN_CLASS: &str = "Unknown";

/// Corn leaf disease classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiseaseClass {
    CercosporaLeafSpot = 0,
    Healthy = 1,
    NorthernLeafBlight = 2,
    Rust = 3,
}

impl DiseaseClass {
    /// All classes, ordered by class id
    pub const ALL: [DiseaseClass; 4] = [
        DiseaseClass::CercosporaLeafSpot,
        DiseaseClass::Healthy,
        DiseaseClass::NorthernLeafBlight,
        DiseaseClass::Rust,
    ];

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    /// Canonical (English) name, identical to the class directory name
    pub fn canonical_name(self) -> &'static str {
        match self {
            DiseaseClass::CercosporaLeafSpot => "CercosporaLeafSpot",
            DiseaseClass::Healthy => "Healthy",
            DiseaseClass::NorthernLeafBlight => "NorthernLeafBlight",
            DiseaseClass::Rust => "Rust",
        }
    }

    /// Localized (Chinese) display name
    pub fn localized_name(self) -> &'static str {
        match self {
            DiseaseClass::CercosporaLeafSpot => "玉米灰斑病",
            DiseaseClass::Healthy => "健康",
            DiseaseClass::NorthernLeafBlight => "玉米大斑病",
            DiseaseClass::Rust => "玉米锈病",
        }
    }

    /// Look up a class by canonical name.
    ///
    /// Older datasets spell the blight directory `NothernLeafBlight`; that
    /// spelling is accepted as an alias.
    pub fn from_name(name: &str) -> Option<Self> {
        if name == "NothernLeafBlight" {
            return Some(DiseaseClass::NorthernLeafBlight);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|class| class.canonical_name() == name)
    }
}

impl fmt::Display for DiseaseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_name())
    }
}

/// Number of classes in the taxonomy
pub fn class_count() -> usize {
    DiseaseClass::ALL.len()
}

/// Canonical name for a class id, or [`UNKNOWN_CLASS`] when out of range
pub fn name_of(class_id: usize) -> &'static str {
    DiseaseClass::from_id(class_id)
        .map(DiseaseClass::canonical_name)
        .unwrap_or(UNKNOWN_CLASS)
}

/// Localized name for a class id, or [`UNKNOWN_CLASS`] when out of range
pub fn localized_name_of(class_id: usize) -> &'static str {
    DiseaseClass::from_id(class_id)
        .map(DiseaseClass::localized_name)
        .unwrap_or(UNKNOWN_CLASS)
}

/// Class id for a canonical name, `None` for unknown names
pub fn id_of(name: &str) -> Option<usize> {
    DiseaseClass::from_name(name).map(DiseaseClass::id)
}

/// Canonical names ordered by class id
pub fn class_names() -> Vec<&'static str> {
    DiseaseClass::ALL
        .iter()
        .map(|class| class.canonical_name())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_contiguous() {
        for (expected, class) in DiseaseClass::ALL.iter().enumerate() {
            assert_eq!(class.id(), expected);
        }
        assert_eq!(class_count(), 4);
    }

    #[test]
    fn test_round_trip_ids_and_names() {
        for id in 0..class_count() {
            assert_eq!(id_of(name_of(id)), Some(id));
        }
        for name in class_names() {
            assert_eq!(id_of(name).map(name_of), Some(name));
        }
    }

    #[test]
    fn test_unknown_lookups() {
        assert_eq!(name_of(4), UNKNOWN_CLASS);
        assert_eq!(name_of(usize::MAX), "Unknown");
        assert_eq!(localized_name_of(99), "Unknown");
        assert_eq!(id_of("GrayLeafSpot"), None);
        assert_eq!(id_of("healthy"), None);
    }

    #[test]
    fn test_healthy_is_class_one() {
        assert_eq!(name_of(1), "Healthy");
        assert_eq!(localized_name_of(1), "健康");
    }

    #[test]
    fn test_legacy_blight_spelling() {
        assert_eq!(id_of("NothernLeafBlight"), Some(2));
        assert_eq!(name_of(2), "NorthernLeafBlight");
    }

    #[test]
    fn test_canonical_order_matches_directory_sort() {
        let mut sorted = class_names();
        sorted.sort();
        assert_eq!(sorted, class_names());
    }
}
