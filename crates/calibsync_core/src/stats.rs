//! Calibration statistics over a store snapshot.
//!
//! # Invariants
//! - Pure aggregation: the same snapshot and date always give the same result.
//! - Retired instruments count toward `total` and `by_status` only.
//! - Every status appears in `by_status`, with zero when absent.

use crate::model::instrument::{Instrument, InstrumentStatus};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

/// Look-ahead window for "due soon".
pub const DUE_SOON_DAYS: u64 = 30;

/// Category label for instruments without a category.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Per-category counters over non-retired instruments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub overdue: usize,
    pub due_within_30_days: usize,
}

/// Snapshot-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub as_of: NaiveDate,
    pub total: usize,
    /// Non-retired instruments whose due date is before `as_of`.
    pub overdue_count: usize,
    /// Non-retired instruments due between `as_of` and `as_of + 30 days`,
    /// both inclusive.
    pub due_within_30_days: usize,
    pub by_category: BTreeMap<String, CategoryStats>,
    pub by_status: BTreeMap<InstrumentStatus, usize>,
}

impl Statistics {
    fn empty(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            total: 0,
            overdue_count: 0,
            due_within_30_days: 0,
            by_category: BTreeMap::new(),
            by_status: InstrumentStatus::ALL
                .into_iter()
                .map(|status| (status, 0))
                .collect(),
        }
    }
}

pub struct StatisticsEngine;

impl StatisticsEngine {
    /// Aggregates `snapshot` as of `as_of`.
    pub fn compute(snapshot: &[Instrument], as_of: NaiveDate) -> Statistics {
        let horizon = as_of
            .checked_add_days(Days::new(DUE_SOON_DAYS))
            .unwrap_or(NaiveDate::MAX);
        let mut stats = Statistics::empty(as_of);

        for instrument in snapshot {
            stats.total += 1;
            *stats.by_status.entry(instrument.status).or_insert(0) += 1;
            if instrument.is_retired() {
                continue;
            }

            let overdue = instrument.due_date < as_of;
            let due_soon = !overdue && instrument.due_date <= horizon;
            let category = instrument
                .category
                .clone()
                .unwrap_or_else(|| UNCATEGORIZED.to_string());
            let entry = stats.by_category.entry(category).or_default();
            entry.total += 1;
            if overdue {
                stats.overdue_count += 1;
                entry.overdue += 1;
            }
            if due_soon {
                stats.due_within_30_days += 1;
                entry.due_within_30_days += 1;
            }
        }
        stats
    }
}
