//! The four-state bonding lattice and its index mapping.
//!
//! The pair record's two flags are the source of truth. Each identity's
//! `incoming` and `bonded` sets are a derived view:
//!
//! | low | high | low.incoming | low.bonded | high.incoming | high.bonded |
//! |-----|------|--------------|------------|---------------|-------------|
//! | F   | F    | -high        | -high      | -low          | -low        |
//! | F   | T    | +high        | -high      | -low          | -low        |
//! | T   | F    | -high        | -high      | +low          | -low        |
//! | T   | T    | -high        | +high      | -low          | +low        |
//!
//! Everything here is pure so it can be checked without a store.

use serde::Serialize;
use utoipa::ToSchema;

use super::IndexField;
use crate::types::{Identity, IdentityRecord, PairKey, PairRecord};

/// Joint bonding state of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    /// Neither side has bonded.
    Unbonded,
    /// Only the low side has bonded; the high side has an incoming request.
    LowRequested,
    /// Only the high side has bonded; the low side has an incoming request.
    HighRequested,
    /// Both sides have bonded.
    Mutual,
}

impl BondState {
    /// State for a `(lowBonded, highBonded)` flag pair.
    #[must_use]
    pub const fn from_flags(low_bonded: bool, high_bonded: bool) -> Self {
        match (low_bonded, high_bonded) {
            (false, false) => Self::Unbonded,
            (true, false) => Self::LowRequested,
            (false, true) => Self::HighRequested,
            (true, true) => Self::Mutual,
        }
    }

    /// State of a pair record.
    #[must_use]
    pub const fn of(pair: &PairRecord) -> Self {
        Self::from_flags(pair.low_bonded, pair.high_bonded)
    }
}

/// One "ensure present" or "ensure absent" set mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexOp {
    /// Identity whose record is mutated.
    pub target: Identity,
    /// Which set.
    pub field: IndexField,
    /// Identity added or removed.
    pub member: Identity,
    /// `true` to ensure present, `false` to ensure absent.
    pub present: bool,
}

/// The full target membership for `state`: four ops, one per table column.
#[must_use]
pub fn target_ops(key: &PairKey, state: BondState) -> [IndexOp; 4] {
    let (low_incoming, low_bonded, high_incoming, high_bonded) = match state {
        BondState::Unbonded => (false, false, false, false),
        BondState::HighRequested => (true, false, false, false),
        BondState::LowRequested => (false, false, true, false),
        BondState::Mutual => (false, true, false, true),
    };
    let op = |target: &Identity, field, member: &Identity, present| IndexOp {
        target: target.clone(),
        field,
        member: member.clone(),
        present,
    };
    [
        op(key.low(), IndexField::Incoming, key.high(), low_incoming),
        op(key.low(), IndexField::Bonded, key.high(), low_bonded),
        op(key.high(), IndexField::Incoming, key.low(), high_incoming),
        op(key.high(), IndexField::Bonded, key.low(), high_bonded),
    ]
}

fn holds(record: &IdentityRecord, field: IndexField, member: &Identity) -> bool {
    match field {
        IndexField::Incoming => record.incoming.contains(member),
        IndexField::Bonded => record.bonded.contains(member),
    }
}

/// The ops needed to move the current sets of `low` and `high` to the
/// membership `state` requires. Ops already satisfied are omitted, so a plan
/// computed against correct sets is empty.
#[must_use]
pub fn plan(
    key: &PairKey,
    state: BondState,
    low: &IdentityRecord,
    high: &IdentityRecord,
) -> Vec<IndexOp> {
    target_ops(key, state)
        .into_iter()
        .filter(|op| {
            let record = if &op.target == key.low() { low } else { high };
            holds(record, op.field, &op.member) != op.present
        })
        .collect()
}

/// Apply ops to in-memory copies of the two records.
pub fn apply(ops: &[IndexOp], low: &mut IdentityRecord, high: &mut IdentityRecord) {
    for op in ops {
        let record = if op.target == low.identity {
            &mut *low
        } else {
            &mut *high
        };
        let set = match op.field {
            IndexField::Incoming => &mut record.incoming,
            IndexField::Bonded => &mut record.bonded,
        };
        if op.present {
            set.insert(op.member.clone());
        } else {
            set.remove(&op.member);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn record(name: &str) -> IdentityRecord {
        IdentityRecord {
            id: format!("u-{name}"),
            identity: id(name),
            email: String::new(),
            incoming: BTreeSet::new(),
            bonded: BTreeSet::new(),
        }
    }

    fn settle(state: BondState, low: &mut IdentityRecord, high: &mut IdentityRecord) {
        let key = PairKey::canonical(&low.identity, &high.identity).unwrap();
        let ops = plan(&key, state, low, high);
        apply(&ops, low, high);
    }

    const ALL: [BondState; 4] = [
        BondState::Unbonded,
        BondState::LowRequested,
        BondState::HighRequested,
        BondState::Mutual,
    ];

    #[test]
    fn test_from_flags() {
        assert_eq!(BondState::from_flags(false, false), BondState::Unbonded);
        assert_eq!(BondState::from_flags(true, false), BondState::LowRequested);
        assert_eq!(BondState::from_flags(false, true), BondState::HighRequested);
        assert_eq!(BondState::from_flags(true, true), BondState::Mutual);
    }

    #[test]
    fn test_every_transition_lands_on_table_row() {
        for from in ALL {
            for to in ALL {
                let (mut low, mut high) = (record("alice"), record("bob"));
                settle(from, &mut low, &mut high);
                settle(to, &mut low, &mut high);

                let bob = id("bob");
                let alice = id("alice");
                assert_eq!(low.incoming.contains(&bob), to == BondState::HighRequested);
                assert_eq!(low.bonded.contains(&bob), to == BondState::Mutual);
                assert_eq!(high.incoming.contains(&alice), to == BondState::LowRequested);
                assert_eq!(high.bonded.contains(&alice), to == BondState::Mutual);
            }
        }
    }

    #[test]
    fn test_plan_is_empty_once_settled() {
        for state in ALL {
            let (mut low, mut high) = (record("alice"), record("bob"));
            settle(state, &mut low, &mut high);
            let key = PairKey::canonical(&low.identity, &high.identity).unwrap();
            assert!(plan(&key, state, &low, &high).is_empty(), "{state:?}");
        }
    }

    #[test]
    fn test_plan_heals_contradictory_sets() {
        let (mut low, mut high) = (record("alice"), record("bob"));
        low.incoming.insert(id("bob"));
        low.bonded.insert(id("bob"));
        high.incoming.insert(id("alice"));

        let key = PairKey::canonical(&low.identity, &high.identity).unwrap();
        let ops = plan(&key, BondState::Mutual, &low, &high);
        assert_eq!(ops.len(), 3);
        apply(&ops, &mut low, &mut high);
        assert!(low.incoming.is_empty());
        assert!(high.incoming.is_empty());
        assert!(low.bonded.contains(&id("bob")));
        assert!(high.bonded.contains(&id("alice")));
    }

    #[test]
    fn test_unrelated_members_are_untouched() {
        let (mut low, mut high) = (record("alice"), record("bob"));
        low.bonded.insert(id("carol"));
        settle(BondState::Unbonded, &mut low, &mut high);
        assert!(low.bonded.contains(&id("carol")));
    }
}
