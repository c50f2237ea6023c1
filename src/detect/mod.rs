//! Classifier Runtime: species classification over snapshots and,
//! for deep reclassification, sampled video frames.

mod backend;
mod backends;
pub mod preprocess;
mod runtime;

pub use backend::{ClassifierBackend, ClassifierStatus, LabelScore};
pub use backends::{StubBackend, TractBackend};
pub use runtime::{soft_vote, ClassifierRuntime};

const UNKNOWN_LABELS: &[&str] = &["unknown", "background", "no bird", "none"];

/// Whether a classifier label is one of the recognized placeholders for
/// "no identifiable species", which callers relabel to "Unknown Bird"
/// and never treat as a scientific name.
pub fn is_unknown_label(label: &str) -> bool {
    UNKNOWN_LABELS.iter().any(|u| u.eq_ignore_ascii_case(label))
}

#[cfg(test)]
mod unknown_label_tests {
    use super::is_unknown_label;

    #[test]
    fn recognizes_known_placeholders_case_insensitively() {
        assert!(is_unknown_label("Unknown"));
        assert!(is_unknown_label("BACKGROUND"));
        assert!(!is_unknown_label("House Sparrow"));
    }
}
