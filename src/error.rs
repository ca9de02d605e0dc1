//! Error types for layout construction, dispatching and persistence.
//!
//! Algorithmic problems inside route discovery (malformed rules, missing
//! connector partners, dead ends) are *not* errors: they are logged and the
//! offending branch is skipped. The types here cover what callers can act on.

use crate::grid::Coord;
use crate::traits::Section;

/// Problems detected while building or editing a [`Grid`](crate::grid::Grid).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Two cells claim the same coordinate.
    Overlap {
        /// The contested coordinate.
        coord: Coord,
    },
    /// A block was declared with a zero width or height.
    EmptyFootprint {
        /// Origin of the offending block.
        coord: Coord,
    },
    /// Two cells share the same non-empty name.
    DuplicateName(String),
    /// No cell exists at the given coordinate.
    NoCell(Coord),
    /// The cell at the coordinate exists but is not of the expected kind.
    WrongKind {
        /// Coordinate of the cell.
        coord: Coord,
        /// Kind that was expected.
        expected: &'static str,
    },
    /// A saved route no longer matches the grid it is loaded against.
    StaleRoute(String),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overlap { coord } => write!(f, "cells overlap at {}", coord),
            Self::EmptyFootprint { coord } => write!(f, "block at {} has an empty footprint", coord),
            Self::DuplicateName(name) => write!(f, "duplicate cell name '{}'", name),
            Self::NoCell(coord) => write!(f, "no cell at {}", coord),
            Self::WrongKind { coord, expected } => {
                write!(f, "cell at {} is not a {}", coord, expected)
            }
            Self::StaleRoute(name) => write!(f, "saved route '{}' does not match the layout", name),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Failure to read or write one persisted section.
#[derive(Debug)]
pub struct PersistError {
    /// Section that failed.
    pub section: Section,
    /// Underlying cause from the store or the JSON codec.
    pub source: anyhow::Error,
}

impl PersistError {
    pub(crate) fn new(section: Section, source: impl Into<anyhow::Error>) -> Self {
        Self {
            section,
            source: source.into(),
        }
    }
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "persisting section {}: {}", self.section.as_str(), self.source)
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Errors returned by [`Dispatcher`](crate::dispatch::Dispatcher) operations.
#[derive(Debug)]
pub enum DispatchError {
    /// `start()` was called while the dispatcher was not stopped.
    AlreadyRunning,
    /// The operation needs a running dispatcher.
    NotRunning,
    /// No locomotive with this id is known.
    UnknownLocomotive(u32),
    /// No block exists with this name or coordinate.
    UnknownBlock(String),
    /// No route exists with this name.
    UnknownRoute(String),
    /// The block already holds a locomotive.
    BlockOccupied(String),
    /// The locomotive is on a trip and cannot be changed right now.
    LocomotiveBusy(u32),
    /// The layout does not support the request.
    Layout(LayoutError),
    /// Loading or saving state failed.
    Persist(PersistError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "auto mode is already running"),
            Self::NotRunning => write!(f, "auto mode is not running"),
            Self::UnknownLocomotive(id) => write!(f, "unknown locomotive {}", id),
            Self::UnknownBlock(name) => write!(f, "unknown block '{}'", name),
            Self::UnknownRoute(name) => write!(f, "unknown route '{}'", name),
            Self::BlockOccupied(name) => write!(f, "block '{}' is occupied", name),
            Self::LocomotiveBusy(id) => write!(f, "locomotive {} is travelling", id),
            Self::Layout(e) => write!(f, "{}", e),
            Self::Persist(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Layout(e) => Some(e),
            Self::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for DispatchError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<PersistError> for DispatchError {
    fn from(e: PersistError) -> Self {
        Self::Persist(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_error_display() {
        let e = LayoutError::Overlap {
            coord: Coord::new(2, 3),
        };
        assert_eq!(e.to_string(), "cells overlap at (2,3)");
        assert_eq!(
            LayoutError::DuplicateName("Blk1".into()).to_string(),
            "duplicate cell name 'Blk1'"
        );
    }

    #[test]
    fn persist_error_keeps_section() {
        let e = PersistError::new(Section::Occ, anyhow::anyhow!("disk full"));
        assert_eq!(e.section, Section::Occ);
        assert_eq!(e.to_string(), "persisting section Occ: disk full");
    }

    #[test]
    fn dispatch_error_wraps_persist() {
        let e: DispatchError = PersistError::new(Section::Routes, anyhow::anyhow!("x")).into();
        assert!(matches!(e, DispatchError::Persist(_)));
        assert!(std::error::Error::source(&e).is_some());
    }
}
