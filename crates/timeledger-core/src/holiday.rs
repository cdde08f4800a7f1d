//! Center holidays
//!
//! [`HolidayIndex`] is an immutable per-request lookup built from holiday rows.
//! [`HolidayService`] owns holiday writes; each write invalidates the center's
//! cached expansions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::ExpansionCache;
use crate::error::{Error, Result};
use crate::models::{Actor, CenterHoliday, CenterId, HolidayId};
use crate::repository::HolidayRepository;

/// Date → holiday name lookup for one center
#[derive(Debug, Clone, Default)]
pub struct HolidayIndex {
    center_id: CenterId,
    dates: Arc<HashMap<NaiveDate, String>>,
}

impl HolidayIndex {
    /// Index over holiday rows of one center; rows of other centers are ignored
    pub fn from_rows(center_id: CenterId, rows: impl IntoIterator<Item = CenterHoliday>) -> Self {
        let dates = rows
            .into_iter()
            .filter(|h| h.center_id == center_id)
            .map(|h| (h.date, h.name))
            .collect();
        Self {
            center_id,
            dates: Arc::new(dates),
        }
    }

    /// Index with no holidays
    #[must_use]
    pub fn empty(center_id: CenterId) -> Self {
        Self {
            center_id,
            dates: Arc::default(),
        }
    }

    /// Whether `date` is a holiday of `center_id`
    #[must_use]
    pub fn is_holiday(&self, center_id: CenterId, date: NaiveDate) -> bool {
        center_id == self.center_id && self.dates.contains_key(&date)
    }

    /// Name of the holiday on `date`
    #[must_use]
    pub fn name_of(&self, date: NaiveDate) -> Option<&str> {
        self.dates.get(&date).map(String::as_str)
    }

    /// Number of holiday dates
    #[must_use]
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// One entry of a bulk holiday import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayEntry {
    /// Date
    pub date: NaiveDate,
    /// Name
    pub name: String,
}

/// Outcome of [`HolidayService::bulk_create`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkHolidayReport {
    /// Entries submitted
    pub requested: usize,
    /// Entries inserted
    pub created: usize,
    /// Entries whose date already had a holiday
    pub skipped: usize,
}

/// Holiday reads and admin writes
#[derive(Clone)]
pub struct HolidayService {
    repo: Arc<dyn HolidayRepository>,
    cache: ExpansionCache,
}

impl HolidayService {
    /// Service over a repository and the expansion cache
    pub fn new(repo: Arc<dyn HolidayRepository>, cache: ExpansionCache) -> Self {
        Self { repo, cache }
    }

    /// Index of a center's holidays within `[start, end]`
    pub async fn load_index(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HolidayIndex> {
        let rows = self.list(center_id, start, end).await?;
        Ok(HolidayIndex::from_rows(center_id, rows))
    }

    /// Holidays of a center within `[start, end]`, ascending by date
    pub async fn list(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CenterHoliday>> {
        if end < start {
            return Err(Error::validation("end date precedes start date"));
        }
        self.repo.list_by_center_in_range(center_id, start, end).await
    }

    /// Add or rename the holiday on a date
    pub async fn upsert(
        &self,
        actor: &Actor,
        center_id: CenterId,
        date: NaiveDate,
        name: &str,
    ) -> Result<CenterHoliday> {
        actor.require_admin(center_id)?;
        let name = normalized_name(name)?;
        let outcome = self.repo.upsert(center_id, date, name).await?;
        info!(
            center_id = center_id,
            date = %date,
            created = outcome.created,
            "Holiday saved"
        );
        self.cache.invalidate_center(center_id).await;
        Ok(outcome.holiday)
    }

    /// Insert several holidays, leaving dates that already have one untouched
    pub async fn bulk_create(
        &self,
        actor: &Actor,
        center_id: CenterId,
        entries: &[HolidayEntry],
    ) -> Result<BulkHolidayReport> {
        actor.require_admin(center_id)?;
        for entry in entries {
            normalized_name(&entry.name)?;
        }

        let mut report = BulkHolidayReport {
            requested: entries.len(),
            ..BulkHolidayReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let first = entries.iter().map(|e| e.date).min().unwrap_or_default();
        let last = entries.iter().map(|e| e.date).max().unwrap_or_default();
        let existing = self.load_index(center_id, first, last).await?;

        let mut seen = std::collections::HashSet::new();
        for entry in entries {
            if existing.is_holiday(center_id, entry.date) || !seen.insert(entry.date) {
                report.skipped += 1;
                continue;
            }
            let outcome = self
                .repo
                .upsert(center_id, entry.date, entry.name.trim())
                .await?;
            if outcome.created {
                report.created += 1;
            } else {
                report.skipped += 1;
            }
        }

        info!(
            center_id = center_id,
            requested = report.requested,
            created = report.created,
            skipped = report.skipped,
            "Bulk holiday import finished"
        );
        if report.created > 0 {
            self.cache.invalidate_center(center_id).await;
        }
        Ok(report)
    }

    /// Delete a holiday of the actor's center
    pub async fn delete(&self, actor: &Actor, center_id: CenterId, id: HolidayId) -> Result<()> {
        actor.require_admin(center_id)?;
        let holiday = self.repo.get_by_id(id).await?;
        if holiday.center_id != center_id {
            return Err(Error::Forbidden(format!(
                "holiday {} belongs to another center",
                id
            )));
        }
        self.repo.delete(id).await?;
        info!(center_id = center_id, holiday_id = id, date = %holiday.date, "Holiday deleted");
        self.cache.invalidate_center(center_id).await;
        Ok(())
    }
}

fn normalized_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("holiday name is required"));
    }
    Ok(trimmed)
}
