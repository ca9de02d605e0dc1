//! Section persistence helpers.
//!
//! Values are stored as JSON through the [`MetadataStore`] contract. The
//! payloads per section are:
//!
//! | Section | Payload |
//! |---------|---------|
//! | `Routes` | `Vec<SavedRoute>` |
//! | `Occ` | `Vec<OccBlock>` |
//! | `Locomotives` | `Vec<LocomotiveRuntime>` |
//! | `Feedbacks` | `Vec<FeedbackBinding>` |

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DispatchError, PersistError};
use crate::grid::{FeedbackBinding, Grid};
use crate::routes::{RouteCatalog, SavedRoute};
use crate::traits::{MetadataStore, Section};

/// Serializes `value` and stores it under `section`.
pub fn save_section<T: Serialize + ?Sized>(
    store: &dyn MetadataStore,
    section: Section,
    value: &T,
) -> Result<(), PersistError> {
    write_section(store, section, section_value(section, value)?)
}

/// Serializes `value` as the payload of `section` without storing it.
pub fn section_value<T: Serialize + ?Sized>(
    section: Section,
    value: &T,
) -> Result<serde_json::Value, PersistError> {
    serde_json::to_value(value).map_err(|e| PersistError::new(section, e))
}

/// Stores an already serialized payload under `section`.
pub fn write_section(
    store: &dyn MetadataStore,
    section: Section,
    json: serde_json::Value,
) -> Result<(), PersistError> {
    store
        .save(section, json)
        .map_err(|e| PersistError::new(section, e))
}

/// Loads and deserializes `section`; `Ok(None)` if it was never saved.
pub fn load_section<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    section: Section,
) -> Result<Option<T>, PersistError> {
    let Some(json) = store
        .load(section)
        .map_err(|e| PersistError::new(section, e))?
    else {
        return Ok(None);
    };
    serde_json::from_value(json)
        .map(Some)
        .map_err(|e| PersistError::new(section, e))
}

/// Rebuilds the route catalog saved in the `Routes` section.
pub fn load_catalog(store: &dyn MetadataStore, grid: &Grid) -> Result<Option<RouteCatalog>, DispatchError> {
    match load_section::<Vec<SavedRoute>>(store, Section::Routes)? {
        Some(saved) => Ok(Some(RouteCatalog::from_saved(grid, &saved)?)),
        None => Ok(None),
    }
}

/// Applies the `Feedbacks` section to `grid`. Returns the number of
/// bindings applied.
pub fn load_feedbacks(store: &dyn MetadataStore, grid: &mut Grid) -> Result<usize, PersistError> {
    Ok(load_section::<Vec<FeedbackBinding>>(store, Section::Feedbacks)?
        .map_or(0, |bindings| grid.apply_feedback_bindings(&bindings)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::rules::Adjacency;
    use crate::grid::{BlockEvent, BlockOptions, FeedbackEvent, TrackCell};
    use crate::hal::MemoryStore;

    fn grid() -> Grid {
        Grid::new(vec![
            TrackCell::block(0, 0, "B1"),
            TrackCell::track(1, 0, "AC"),
            TrackCell::block_with(
                2,
                0,
                "B2",
                "AC",
                BlockOptions {
                    events: vec![BlockEvent::new("S1", FeedbackEvent::In)],
                    ..Default::default()
                },
            ),
            TrackCell::sensor(5, 5, "S1", 11),
            TrackCell::sensor(6, 5, "S2", 12),
        ])
        .unwrap()
    }

    #[test]
    fn missing_section_loads_as_none() {
        let store = MemoryStore::new();
        let loaded: Option<Vec<SavedRoute>> = load_section(&store, Section::Routes).unwrap();
        assert!(loaded.is_none());
        assert!(load_catalog(&store, &grid()).unwrap().is_none());
    }

    #[test]
    fn malformed_section_names_the_section() {
        let store = MemoryStore::new();
        store
            .save(Section::Occ, serde_json::json!({"not": "a list"}))
            .unwrap();
        let err = load_section::<Vec<crate::dispatch::OccBlock>>(&store, Section::Occ).unwrap_err();
        assert_eq!(err.section, Section::Occ);
    }

    #[test]
    fn store_failure_is_wrapped() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let err = save_section(&store, Section::Locomotives, &Vec::<u8>::new()).unwrap_err();
        assert_eq!(err.section, Section::Locomotives);
    }

    #[test]
    fn catalog_and_feedbacks_reload() {
        let store = MemoryStore::new();
        let mut g = grid();
        let catalog = RouteCatalog::discover(&g, &Adjacency::build(&g));
        save_section(&store, Section::Routes, &catalog.to_saved()).unwrap();
        let bindings = vec![FeedbackBinding {
            block: "B2".into(),
            event: BlockEvent::new("S2", FeedbackEvent::Enter),
        }];
        save_section(&store, Section::Feedbacks, &bindings).unwrap();

        let reloaded = load_catalog(&store, &g).unwrap().unwrap();
        assert_eq!(reloaded.len(), catalog.len());
        assert_eq!(load_feedbacks(&store, &mut g).unwrap(), 1);
        assert_eq!(g.feedback_bindings(), bindings);
    }
}
