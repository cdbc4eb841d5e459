//! Capacity ledger: a bounded counter with an append-only adjustment log.
//!
//! Used for medication stock quantities and for ward bed capacity. The counter never goes
//! below zero; the upper bound (if any) is either advisory or enforced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::ids::{ActorId, LedgerEntryId, StockItemId, WardId};
use crate::{Error, Result};

/// What a ledger balance counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LedgerSubject {
    StockItem(StockItemId),
    WardCapacity(WardId),
}

impl LedgerSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerSubject::StockItem(_) => "stock_item",
            LedgerSubject::WardCapacity(_) => "ward_capacity",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            LedgerSubject::StockItem(id) => id.0,
            LedgerSubject::WardCapacity(id) => id.0,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self> {
        match kind {
            "stock_item" => Ok(LedgerSubject::StockItem(StockItemId(id))),
            "ward_capacity" => Ok(LedgerSubject::WardCapacity(WardId(id))),
            other => Err(Error::Internal(format!("unknown ledger subject '{other}'"))),
        }
    }
}

impl fmt::Display for LedgerSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.id())
    }
}

/// How the upper bound of a counter is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxPolicy {
    /// Exceeding the maximum succeeds but is flagged
    #[default]
    Advisory,
    /// Exceeding the maximum is rejected
    Enforced,
}

impl MaxPolicy {
    pub fn from_enforce_flag(enforce_max: bool) -> Self {
        if enforce_max {
            MaxPolicy::Enforced
        } else {
            MaxPolicy::Advisory
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityCounter {
    pub subject: LedgerSubject,
    pub balance: i64,
    pub maximum: Option<i64>,
}

/// A validated, not yet persisted, change to a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Adjustment {
    pub subject: LedgerSubject,
    pub previous: i64,
    pub delta: i64,
    pub balance: i64,
    pub above_maximum: bool,
}

impl CapacityCounter {
    pub fn new(subject: LedgerSubject, balance: i64, maximum: Option<i64>) -> Self {
        Self {
            subject,
            balance,
            maximum,
        }
    }

    /// Check `delta` against the bounds without mutating anything.
    pub fn plan(&self, delta: i64, policy: MaxPolicy) -> Result<Adjustment> {
        let balance = self.balance.checked_add(delta).ok_or_else(|| {
            Error::Validation(format!("adjustment {delta} overflows {}", self.subject))
        })?;

        if balance < 0 {
            return Err(Error::WouldGoNegative {
                subject: self.subject.to_string(),
                balance: self.balance,
                delta,
            });
        }

        let above_maximum = matches!(self.maximum, Some(max) if balance > max);
        if let (true, true, Some(maximum)) = (above_maximum, delta > 0, self.maximum) {
            if policy == MaxPolicy::Enforced {
                return Err(Error::WouldExceedMaximum {
                    subject: self.subject.to_string(),
                    balance: self.balance,
                    delta,
                    maximum,
                });
            }
        }

        Ok(Adjustment {
            subject: self.subject,
            previous: self.balance,
            delta,
            balance,
            above_maximum,
        })
    }
}

/// Immutable ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub subject: LedgerSubject,
    pub delta: i64,
    pub reason: String,
    pub actor: ActorId,
    /// Balance right after this entry was applied
    pub balance_after: i64,
    pub at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn record(
        adjustment: &Adjustment,
        reason: impl Into<String>,
        actor: ActorId,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        if adjustment.previous + adjustment.delta != adjustment.balance {
            return Err(Error::InvariantBreach(format!(
                "ledger snapshot for {} is {} but {} + {} was expected",
                adjustment.subject, adjustment.balance, adjustment.previous, adjustment.delta
            )));
        }
        Ok(Self {
            id: LedgerEntryId::new(),
            subject: adjustment.subject,
            delta: adjustment.delta,
            reason: reason.into(),
            actor,
            balance_after: adjustment.balance,
            at,
        })
    }
}

/// Replay entries from zero, checking every snapshot along the way.
pub fn replay(entries: &[LedgerEntry]) -> Result<i64> {
    let mut running: i64 = 0;
    for entry in entries {
        running += entry.delta;
        if entry.balance_after != running {
            return Err(Error::InvariantBreach(format!(
                "ledger entry {} for {} records balance {} but replay gives {}",
                entry.id, entry.subject, entry.balance_after, running
            )));
        }
    }
    Ok(running)
}

/// Replay and compare against the subject's current balance.
pub fn verify(subject: LedgerSubject, entries: &[LedgerEntry], current: i64) -> Result<()> {
    let replayed = replay(entries)?;
    if replayed != current {
        return Err(Error::InvariantBreach(format!(
            "{subject} has balance {current} but its ledger replays to {replayed}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(balance: i64, maximum: Option<i64>) -> CapacityCounter {
        CapacityCounter::new(
            LedgerSubject::StockItem(StockItemId::new()),
            balance,
            maximum,
        )
    }

    fn entry(adjustment: &Adjustment) -> LedgerEntry {
        LedgerEntry::record(adjustment, "test", ActorId::from("pharm-1"), Utc::now()).unwrap()
    }

    #[test]
    fn negative_balances_are_rejected() {
        let err = counter(10, None).plan(-15, MaxPolicy::Advisory).unwrap_err();
        assert!(matches!(
            err,
            Error::WouldGoNegative {
                balance: 10,
                delta: -15,
                ..
            }
        ));
        assert_eq!(counter(10, None).plan(-10, MaxPolicy::Advisory).unwrap().balance, 0);
    }

    #[test]
    fn maximum_is_advisory_unless_enforced() {
        let advisory = counter(90, Some(100)).plan(20, MaxPolicy::Advisory).unwrap();
        assert!(advisory.above_maximum);
        assert_eq!(advisory.balance, 110);

        let err = counter(90, Some(100)).plan(20, MaxPolicy::Enforced).unwrap_err();
        assert!(matches!(err, Error::WouldExceedMaximum { maximum: 100, .. }));
    }

    #[test]
    fn reducing_an_overfull_counter_is_allowed_when_enforced() {
        let adjustment = counter(150, Some(100)).plan(-10, MaxPolicy::Enforced).unwrap();
        assert_eq!(adjustment.balance, 140);
        assert!(adjustment.above_maximum);
    }

    #[test]
    fn replay_reproduces_balance() {
        let mut c = counter(0, None);
        let mut entries = Vec::new();
        for delta in [10, -3, 7, -14] {
            let adjustment = c.plan(delta, MaxPolicy::Advisory).unwrap();
            entries.push(entry(&adjustment));
            c.balance = adjustment.balance;
        }
        assert_eq!(replay(&entries).unwrap(), 0);
        assert!(verify(c.subject, &entries, 0).is_ok());
        assert!(matches!(
            verify(c.subject, &entries, 5),
            Err(Error::InvariantBreach(_))
        ));
    }

    #[test]
    fn replay_detects_a_tampered_snapshot() {
        let c = counter(0, None);
        let adjustment = c.plan(5, MaxPolicy::Advisory).unwrap();
        let mut first = entry(&adjustment);
        first.balance_after = 6;
        assert!(matches!(replay(&[first]), Err(Error::InvariantBreach(_))));
    }

    #[test]
    fn subject_round_trips_through_parts() {
        let subject = LedgerSubject::WardCapacity(WardId::new());
        let parsed = LedgerSubject::from_parts(subject.kind(), subject.id()).unwrap();
        assert_eq!(parsed, subject);
    }
}
