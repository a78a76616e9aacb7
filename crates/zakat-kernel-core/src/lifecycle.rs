use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cycle::CycleRecord;
use crate::methodology::Methodology;
use crate::money::apply_basis_points;
use crate::{AuditEntryId, KernelError, RecordId};

/// Minimum length of an unlock justification, in characters.
pub const MIN_JUSTIFICATION_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    Finalized,
    Unlocked,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Finalized => "finalized",
            Self::Unlocked => "unlocked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "finalized" => Some(Self::Finalized),
            "unlocked" => Some(Self::Unlocked),
            _ => None,
        }
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Created,
    Finalized,
    Unlocked,
    Edited,
    Refinalized,
}

impl AuditEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Finalized => "finalized",
            Self::Unlocked => "unlocked",
            Self::Edited => "edited",
            Self::Refinalized => "refinalized",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "finalized" => Some(Self::Finalized),
            "unlocked" => Some(Self::Unlocked),
            "edited" => Some(Self::Edited),
            "refinalized" => Some(Self::Refinalized),
            _ => None,
        }
    }
}

impl Display for AuditEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable row in the append-only ledger. No update or delete
/// operation exists for this entity anywhere in the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub audit_entry_id: AuditEntryId,
    pub record_id: RecordId,
    pub kind: AuditEventKind,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub justification: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        record_id: RecordId,
        kind: AuditEventKind,
        actor: &str,
        recorded_at: OffsetDateTime,
        justification: Option<String>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        Self {
            audit_entry_id: AuditEntryId::new(),
            record_id,
            kind,
            actor: actor.to_owned(),
            recorded_at,
            justification,
            before,
            after,
        }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when an `unlocked` entry lacks its
    /// justification or an `edited` entry lacks either snapshot.
    pub fn validate(&self) -> Result<(), KernelError> {
        match self.kind {
            AuditEventKind::Unlocked => {
                let length = self
                    .justification
                    .as_deref()
                    .map_or(0, |text| text.trim().chars().count());
                if length < MIN_JUSTIFICATION_CHARS {
                    return Err(KernelError::JustificationTooShort {
                        minimum: MIN_JUSTIFICATION_CHARS,
                        actual: length,
                    });
                }
            }
            AuditEventKind::Edited => {
                if self.before.is_none() || self.after.is_none() {
                    return Err(KernelError::Validation(format!(
                        "edited entry {} MUST carry before and after snapshots",
                        self.audit_entry_id
                    )));
                }
            }
            AuditEventKind::Created | AuditEventKind::Finalized | AuditEventKind::Refinalized => {}
        }
        Ok(())
    }
}

/// Field changes applied to an unlocked record as one logical batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordEdit {
    pub aggregate_minor: Option<i64>,
    pub obligation_minor: Option<i64>,
    pub methodology: Option<Methodology>,
}

impl RecordEdit {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregate_minor.is_none()
            && self.obligation_minor.is_none()
            && self.methodology.is_none()
    }
}

/// Lock a draft whose observation period has completed.
///
/// Before `scheduled_completion` the transition is refused with `NotReady`
/// unless the caller explicitly acknowledges a premature finalization.
///
/// # Errors
/// Returns [`KernelError::InvalidTransition`] when the record is not a
/// draft, or [`KernelError::NotReady`] before completion without the
/// override.
pub fn finalize(
    record: CycleRecord,
    actor: &str,
    now: OffsetDateTime,
    acknowledge_premature: bool,
) -> Result<(CycleRecord, AuditEntry), KernelError> {
    if record.status != RecordStatus::Draft {
        return Err(KernelError::InvalidTransition {
            from: record.status,
            requested: RecordStatus::Finalized,
        });
    }
    if now < record.scheduled_completion && !acknowledge_premature {
        return Err(KernelError::NotReady {
            scheduled_completion: record.scheduled_completion,
        });
    }

    let mut record = record;
    record.status = RecordStatus::Finalized;
    record.finalized_at = Some(now);
    record.validate()?;

    let entry = AuditEntry::new(
        record.record_id,
        AuditEventKind::Finalized,
        actor,
        now,
        None,
        None,
        None,
    );
    Ok((record, entry))
}

/// Open a finalized record for correction.
///
/// # Errors
/// Returns [`KernelError::InvalidTransition`] when the record is not
/// finalized, or [`KernelError::JustificationTooShort`] when the
/// justification has fewer than [`MIN_JUSTIFICATION_CHARS`] characters.
pub fn unlock(
    record: CycleRecord,
    actor: &str,
    now: OffsetDateTime,
    justification: &str,
) -> Result<(CycleRecord, AuditEntry), KernelError> {
    if record.status != RecordStatus::Finalized {
        return Err(KernelError::InvalidTransition {
            from: record.status,
            requested: RecordStatus::Unlocked,
        });
    }

    let entry = AuditEntry::new(
        record.record_id,
        AuditEventKind::Unlocked,
        actor,
        now,
        Some(justification.to_owned()),
        None,
        None,
    );
    entry.validate()?;

    let mut record = record;
    record.status = RecordStatus::Unlocked;
    record.validate()?;
    Ok((record, entry))
}

/// Apply one logical batch of edits to an unlocked record, capturing
/// before/after snapshots in a single `edited` ledger entry.
///
/// An explicit obligation amount wins over recomputation; otherwise a new
/// aggregate or methodology re-derives the obligation at the effective rate.
///
/// # Errors
/// Returns [`KernelError::InvalidTransition`] when the record is not
/// unlocked, or [`KernelError::Validation`] for an empty or invalid edit.
pub fn apply_edit(
    record: CycleRecord,
    actor: &str,
    now: OffsetDateTime,
    edit: &RecordEdit,
) -> Result<(CycleRecord, AuditEntry), KernelError> {
    if record.status != RecordStatus::Unlocked {
        return Err(KernelError::InvalidTransition {
            from: record.status,
            requested: RecordStatus::Unlocked,
        });
    }
    if edit.is_empty() {
        return Err(KernelError::Validation(
            "edit batch MUST change at least one field".to_owned(),
        ));
    }

    let before = snapshot(&record)?;

    let mut record = record;
    if let Some(methodology) = &edit.methodology {
        methodology.config().validate()?;
        record.methodology = methodology.clone();
    }
    if let Some(aggregate_minor) = edit.aggregate_minor {
        record.aggregate_minor = aggregate_minor;
    }
    record.obligation_minor = match edit.obligation_minor {
        Some(obligation_minor) => obligation_minor,
        None => {
            apply_basis_points(record.aggregate_minor, record.methodology.config().rate_bp)
        }
    };
    record.validate()?;

    let after = snapshot(&record)?;
    let entry = AuditEntry::new(
        record.record_id,
        AuditEventKind::Edited,
        actor,
        now,
        None,
        Some(before),
        Some(after),
    );
    entry.validate()?;
    Ok((record, entry))
}

/// Re-lock an unlocked record.
///
/// # Errors
/// Returns [`KernelError::InvalidTransition`] when the record is not unlocked.
pub fn refinalize(
    record: CycleRecord,
    actor: &str,
    now: OffsetDateTime,
) -> Result<(CycleRecord, AuditEntry), KernelError> {
    if record.status != RecordStatus::Unlocked {
        return Err(KernelError::InvalidTransition {
            from: record.status,
            requested: RecordStatus::Finalized,
        });
    }

    let mut record = record;
    record.status = RecordStatus::Finalized;
    record.finalized_at = Some(now);
    record.validate()?;

    let entry = AuditEntry::new(
        record.record_id,
        AuditEventKind::Refinalized,
        actor,
        now,
        None,
        None,
        None,
    );
    Ok((record, entry))
}

fn snapshot(record: &CycleRecord) -> Result<serde_json::Value, KernelError> {
    serde_json::to_value(record).map_err(|err| {
        KernelError::Validation(format!(
            "record {} could not be snapshotted: {err}",
            record.record_id
        ))
    })
}
