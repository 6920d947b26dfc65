//! Roster import.
//!
//! Rosters arrive as a flat list of racers, typically exported from the
//! registration desk. Imports are re-runnable: a bib that already exists
//! is updated in place, so a corrected export can simply be imported
//! again mid-race.

use tracing::info;

use crate::error::Result;
use crate::store::ResultStore;
use crate::types::Racer;

/// What an import run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    /// Bibs seen for the first time.
    pub added: usize,
    /// Bibs that already existed and were updated in place.
    pub updated: usize,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.added + self.updated
    }
}

/// Import a roster into the store.
///
/// Each racer is journaled individually, so a failure partway leaves the
/// racers before it durably registered; re-running the import finishes
/// the job.
pub async fn import_roster(
    store: &ResultStore,
    roster: impl IntoIterator<Item = Racer>,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for racer in roster {
        if store.racer(racer.bib).is_some() {
            summary.updated += 1;
        } else {
            summary.added += 1;
        }
        store.register_racer(racer).await?;
    }
    info!(added = summary.added, updated = summary.updated, "roster imported");
    Ok(summary)
}
