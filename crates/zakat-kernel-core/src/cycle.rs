use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::calendar::HijriDate;
use crate::lifecycle::{AuditEntry, AuditEventKind, RecordStatus};
use crate::methodology::Methodology;
use crate::money::{apply_basis_points, Currency};
use crate::threshold::Threshold;
use crate::{KernelError, RecordId};

/// The obligation record for one observation period.
///
/// Created as a draft when wealth first crosses the threshold; the threshold
/// value is locked at that instant. Mutated only through the lifecycle
/// transition functions once finalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleRecord {
    pub record_id: RecordId,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    pub cycle_start_hijri: HijriDate,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_completion: OffsetDateTime,
    pub threshold_minor: i64,
    pub threshold_currency: Currency,
    pub methodology: Methodology,
    pub aggregate_minor: i64,
    pub obligation_minor: i64,
    pub status: RecordStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finalized_at: Option<OffsetDateTime>,
}

impl CycleRecord {
    /// Open a draft record at the instant wealth crossed the threshold,
    /// together with its `created` ledger entry.
    ///
    /// # Errors
    /// Returns [`KernelError::Calendar`] when the start instant cannot be
    /// expressed in the lunar calendar, or [`KernelError::Validation`] for a
    /// non-positive locked threshold.
    pub fn open_draft(
        user_id: &str,
        cycle_start: OffsetDateTime,
        threshold: &Threshold,
        methodology: Methodology,
        aggregate_minor: i64,
    ) -> Result<(Self, AuditEntry), KernelError> {
        if threshold.value_minor <= 0 {
            return Err(KernelError::Validation(format!(
                "locked threshold MUST be positive, got {}",
                threshold.value_minor
            )));
        }

        let cycle_start_hijri = HijriDate::from_gregorian(cycle_start.date())?;
        let completion_date = cycle_start_hijri.next_year().to_gregorian()?;
        let scheduled_completion = cycle_start.replace_date(completion_date);

        let rate_bp = methodology.config().rate_bp;
        let record = Self {
            record_id: RecordId::new(),
            user_id: user_id.to_owned(),
            cycle_start,
            cycle_start_hijri,
            scheduled_completion,
            threshold_minor: threshold.value_minor,
            threshold_currency: threshold.currency.clone(),
            methodology,
            aggregate_minor,
            obligation_minor: apply_basis_points(aggregate_minor, rate_bp),
            status: RecordStatus::Draft,
            finalized_at: None,
        };
        record.validate()?;

        let entry = AuditEntry::new(
            record.record_id,
            AuditEventKind::Created,
            &record.user_id,
            cycle_start,
            None,
            None,
            None,
        );
        Ok((record, entry))
    }

    /// Refresh a draft's amounts after an item or deduction change.
    ///
    /// # Errors
    /// Returns [`KernelError::RecordLocked`] when the record is no longer a draft.
    pub fn refresh_amounts(&mut self, aggregate_minor: i64) -> Result<(), KernelError> {
        if self.status != RecordStatus::Draft {
            return Err(KernelError::RecordLocked { status: self.status });
        }
        if aggregate_minor < 0 {
            return Err(KernelError::Validation(format!(
                "aggregate MUST be non-negative, got {aggregate_minor}"
            )));
        }
        let rate_bp = self.methodology.config().rate_bp;
        self.aggregate_minor = aggregate_minor;
        self.obligation_minor = apply_basis_points(aggregate_minor, rate_bp);
        Ok(())
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when a structural invariant does
    /// not hold.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.user_id.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "record {} MUST have an owner",
                self.record_id
            )));
        }
        if self.cycle_start >= self.scheduled_completion {
            return Err(KernelError::Validation(format!(
                "record {} cycle start MUST precede scheduled completion",
                self.record_id
            )));
        }
        if self.threshold_minor <= 0 {
            return Err(KernelError::Validation(format!(
                "record {} locked threshold MUST be positive, got {}",
                self.record_id, self.threshold_minor
            )));
        }
        if self.aggregate_minor < 0 || self.obligation_minor < 0 {
            return Err(KernelError::Validation(format!(
                "record {} amounts MUST be non-negative",
                self.record_id
            )));
        }
        match self.status {
            RecordStatus::Draft => {
                if self.finalized_at.is_some() {
                    return Err(KernelError::Validation(format!(
                        "draft record {} MUST NOT carry a finalization timestamp",
                        self.record_id
                    )));
                }
            }
            RecordStatus::Finalized | RecordStatus::Unlocked => {
                if self.finalized_at.is_none() {
                    return Err(KernelError::Validation(format!(
                        "{} record {} MUST carry a finalization timestamp",
                        self.status, self.record_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of one detection pass for one user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CycleEvent {
    /// No open cycle and wealth is at or above the threshold; a draft should
    /// be opened with the threshold locked at this instant.
    Started,
    /// The open cycle is still running.
    Continued,
    /// The scheduled completion has been reached; the draft is ready to finalize.
    Completable,
    /// Wealth fell below the locked threshold before completion; the draft
    /// is discarded and detection restarts from nothing.
    Interrupted,
    /// No open cycle and wealth is below the threshold.
    Idle,
}

/// Pure, idempotent detection step. The periodic sweep is an external
/// scheduler calling this per user; repeated calls with the same inputs
/// yield the same event.
#[must_use]
pub fn evaluate_cycle(
    open_draft: Option<&CycleRecord>,
    wealth_minor: i64,
    threshold_minor: i64,
    as_of: OffsetDateTime,
) -> CycleEvent {
    match open_draft {
        None => {
            if wealth_minor >= threshold_minor {
                CycleEvent::Started
            } else {
                CycleEvent::Idle
            }
        }
        Some(record) => {
            if as_of >= record.scheduled_completion {
                CycleEvent::Completable
            } else if wealth_minor < record.threshold_minor {
                CycleEvent::Interrupted
            } else {
                CycleEvent::Continued
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;

    use crate::threshold::ThresholdBasis;

    use super::*;

    fn usd() -> Currency {
        match Currency::parse("USD") {
            Ok(currency) => currency,
            Err(err) => panic!("USD should parse: {err}"),
        }
    }

    fn locked_threshold(value_minor: i64) -> Threshold {
        Threshold {
            value_minor,
            currency: usd(),
            basis: ThresholdBasis::Silver,
            stale: false,
        }
    }

    fn draft(cycle_start: OffsetDateTime, threshold_minor: i64) -> CycleRecord {
        let (record, _entry) = match CycleRecord::open_draft(
            "user-1",
            cycle_start,
            &locked_threshold(threshold_minor),
            Methodology::Hanafi,
            threshold_minor,
        ) {
            Ok(pair) => pair,
            Err(err) => panic!("draft should open: {err}"),
        };
        record
    }

    #[test]
    fn opening_a_draft_locks_threshold_and_emits_created() {
        let start = datetime!(2025-06-27 12:00 UTC);
        let (record, entry) = match CycleRecord::open_draft(
            "user-1",
            start,
            &locked_threshold(500_000),
            Methodology::Hanafi,
            1_000_000,
        ) {
            Ok(pair) => pair,
            Err(err) => panic!("draft should open: {err}"),
        };
        assert_eq!(record.status, RecordStatus::Draft);
        assert_eq!(record.threshold_minor, 500_000);
        assert_eq!(record.obligation_minor, 25_000);
        assert_eq!(record.cycle_start_hijri.year, 1447);
        assert_eq!(entry.kind, AuditEventKind::Created);
        assert_eq!(entry.record_id, record.record_id);
    }

    #[test]
    fn scheduled_completion_is_one_lunar_year_out() {
        let start = datetime!(2025-06-27 12:00 UTC);
        let record = draft(start, 500_000);
        let span = record.scheduled_completion - record.cycle_start;
        assert!(
            (Duration::days(349)..=Duration::days(359)).contains(&span),
            "span {span} out of tolerance"
        );
    }

    #[test]
    fn crossing_the_threshold_starts_a_cycle() {
        let now = datetime!(2025-06-27 12:00 UTC);
        assert_eq!(evaluate_cycle(None, 500_000, 500_000, now), CycleEvent::Started);
        assert_eq!(evaluate_cycle(None, 499_999, 500_000, now), CycleEvent::Idle);
    }

    #[test]
    fn falling_below_the_locked_threshold_interrupts() {
        // Threshold 5,000.00 crossed on day 0; wealth 4,000.00 on day 100.
        let start = datetime!(2025-06-27 12:00 UTC);
        let record = draft(start, 500_000);
        let day_100 = start + Duration::days(100);
        assert_eq!(
            evaluate_cycle(Some(&record), 400_000, 500_000, day_100),
            CycleEvent::Interrupted
        );
        assert_eq!(
            evaluate_cycle(Some(&record), 500_000, 500_000, day_100),
            CycleEvent::Continued
        );
    }

    #[test]
    fn reaching_scheduled_completion_is_completable() {
        let start = datetime!(2025-06-27 12:00 UTC);
        let record = draft(start, 500_000);
        assert_eq!(
            evaluate_cycle(Some(&record), 600_000, 500_000, record.scheduled_completion),
            CycleEvent::Completable
        );
    }

    #[test]
    fn detection_is_idempotent() {
        let start = datetime!(2025-06-27 12:00 UTC);
        let record = draft(start, 500_000);
        let now = start + Duration::days(10);
        let first = evaluate_cycle(Some(&record), 600_000, 500_000, now);
        let second = evaluate_cycle(Some(&record), 600_000, 500_000, now);
        assert_eq!(first, second);
    }

    #[test]
    fn refresh_amounts_is_draft_only() {
        let start = datetime!(2025-06-27 12:00 UTC);
        let mut record = draft(start, 500_000);
        if let Err(err) = record.refresh_amounts(2_000_000) {
            panic!("draft refresh should succeed: {err}");
        }
        assert_eq!(record.aggregate_minor, 2_000_000);
        assert_eq!(record.obligation_minor, 50_000);

        record.status = RecordStatus::Finalized;
        record.finalized_at = Some(record.scheduled_completion);
        assert_eq!(
            record.refresh_amounts(1),
            Err(KernelError::RecordLocked { status: RecordStatus::Finalized })
        );
    }

    #[test]
    fn validate_rejects_inconsistent_status_timestamps() {
        let start = datetime!(2025-06-27 12:00 UTC);
        let mut record = draft(start, 500_000);

        record.finalized_at = Some(start);
        assert!(record.validate().is_err());

        record.status = RecordStatus::Finalized;
        assert!(record.validate().is_ok());

        record.finalized_at = None;
        assert!(record.validate().is_err());
    }
}
