//! Racers and roster identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bib number identifying a racer on course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bib(pub u32);

impl fmt::Display for Bib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a racer entered the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationSource {
    /// Bulk import before the race.
    Import,
    /// Live day-of registration.
    DayOf,
}

/// One registered racer.
///
/// Racers are never deleted, only deactivated, so historical timing events
/// that reference them remain valid for the life of the race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Racer {
    pub bib: Bib,
    pub name: String,
    /// Field/category the racer starts in ("Cat 3 Men", "Masters 50+").
    pub field: String,
    pub source: RegistrationSource,
    /// Cleared instead of deleting the row.
    pub active: bool,
}

impl Racer {
    pub fn new(bib: Bib, name: impl Into<String>, field: impl Into<String>) -> Self {
        Racer {
            bib,
            name: name.into(),
            field: field.into(),
            source: RegistrationSource::Import,
            active: true,
        }
    }

    /// Day-of registration entry.
    pub fn day_of(bib: Bib, name: impl Into<String>, field: impl Into<String>) -> Self {
        Racer { source: RegistrationSource::DayOf, ..Racer::new(bib, name, field) }
    }
}
