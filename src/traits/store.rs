//! Persistence contract.
//!
//! State is saved and loaded in named sections. The core hands the store a
//! JSON value per section and never looks at how it is kept; a file, a
//! database row or an in-memory map are all fine.

use serde::{Deserialize, Serialize};

/// Persisted section names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Section {
    /// Discovered routes and their disabled flags.
    Routes,
    /// Occupancy records, one per locomotive on the layout.
    Occ,
    /// Per-locomotive policy and entry side.
    Locomotives,
    /// Sensor-to-block event bindings.
    Feedbacks,
}

impl Section {
    /// All sections in load order.
    pub const ALL: [Section; 4] = [
        Section::Routes,
        Section::Feedbacks,
        Section::Locomotives,
        Section::Occ,
    ];

    /// Section name used as the store key.
    ///
    /// ```
    /// use rs_autoplay::traits::Section;
    ///
    /// assert_eq!(Section::Occ.as_str(), "Occ");
    /// assert_eq!(Section::Feedbacks.as_str(), "Feedbacks");
    /// ```
    pub const fn as_str(&self) -> &'static str {
        match self {
            Section::Routes => "Routes",
            Section::Occ => "Occ",
            Section::Locomotives => "Locomotives",
            Section::Feedbacks => "Feedbacks",
        }
    }
}

/// External metadata store keyed by [`Section`].
///
/// `load` returns `Ok(None)` for a section that was never saved.
pub trait MetadataStore: Send + Sync {
    /// Replace the stored value of `section`.
    fn save(&self, section: Section, value: serde_json::Value) -> anyhow::Result<()>;

    /// Read the stored value of `section`.
    fn load(&self, section: Section) -> anyhow::Result<Option<serde_json::Value>>;
}
