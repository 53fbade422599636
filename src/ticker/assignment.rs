// =============================================================================
// Account assignment — round-robin distribution and reload diffing
// =============================================================================
//
// The assignment maps every active, registry-resolved instrument onto
// exactly one healthy account. Distribution is round-robin over the sorted
// token list so a rebuild with the same inputs lands identically. Reloads
// apply the difference between a pool's desired set and the new plan, never
// a stream restart.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::types::Instrument;

/// Round-robin instruments over accounts. Tokens are sorted first so the
/// plan is deterministic for a given input set.
pub fn round_robin(
    instruments: &[Arc<Instrument>],
    accounts: &[String],
) -> HashMap<String, Vec<Arc<Instrument>>> {
    let mut assignments: HashMap<String, Vec<Arc<Instrument>>> = accounts
        .iter()
        .map(|a| (a.clone(), Vec::new()))
        .collect();

    if accounts.is_empty() {
        return assignments;
    }

    let mut sorted: Vec<&Arc<Instrument>> = instruments.iter().collect();
    sorted.sort_by_key(|i| i.instrument_token);

    for (idx, instrument) in sorted.into_iter().enumerate() {
        let account = &accounts[idx % accounts.len()];
        assignments
            .get_mut(account)
            .expect("account key inserted above")
            .push(instrument.clone());
    }

    assignments
}

/// Tokens to add to and remove from a pool to reach `target`.
pub fn diff_tokens(current: &HashSet<u32>, target: &HashSet<u32>) -> (Vec<u32>, Vec<u32>) {
    let mut to_add: Vec<u32> = target.difference(current).copied().collect();
    let mut to_remove: Vec<u32> = current.difference(target).copied().collect();
    to_add.sort_unstable();
    to_remove.sort_unstable();
    (to_add, to_remove)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    fn instrument(token: u32) -> Arc<Instrument> {
        Arc::new(Instrument {
            instrument_token: token,
            exchange: "NFO".into(),
            trading_symbol: format!("SYM{token}"),
            segment: Segment::Futures,
            expiry: None,
            strike: None,
            option_kind: None,
            lot_size: 50,
            tick_size: 0.05,
            underlying_symbol: "SYM".into(),
        })
    }

    fn accounts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn every_instrument_assigned_exactly_once() {
        let instruments: Vec<_> = (1..=10).map(instrument).collect();
        let plan = round_robin(&instruments, &accounts(&["a", "b", "c"]));

        let mut seen = HashSet::new();
        for list in plan.values() {
            for instrument in list {
                assert!(seen.insert(instrument.instrument_token));
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn distribution_is_balanced() {
        let instruments: Vec<_> = (1..=10).map(instrument).collect();
        let plan = round_robin(&instruments, &accounts(&["a", "b", "c"]));
        assert_eq!(plan["a"].len(), 4);
        assert_eq!(plan["b"].len(), 3);
        assert_eq!(plan["c"].len(), 3);
    }

    #[test]
    fn rebuild_with_same_inputs_is_identical() {
        let instruments: Vec<_> = (1..=25).map(instrument).collect();
        let a = round_robin(&instruments, &accounts(&["x", "y"]));
        let b = round_robin(&instruments, &accounts(&["x", "y"]));
        for account in ["x", "y"] {
            let ta: Vec<u32> = a[account].iter().map(|i| i.instrument_token).collect();
            let tb: Vec<u32> = b[account].iter().map(|i| i.instrument_token).collect();
            assert_eq!(ta, tb);
        }
    }

    #[test]
    fn no_accounts_yields_no_assignment() {
        let instruments: Vec<_> = (1..=5).map(instrument).collect();
        let plan = round_robin(&instruments, &[]);
        assert!(plan.is_empty());
    }

    #[test]
    fn single_account_takes_everything() {
        let instruments: Vec<_> = (1..=7).map(instrument).collect();
        let plan = round_robin(&instruments, &accounts(&["only"]));
        assert_eq!(plan["only"].len(), 7);
    }

    #[test]
    fn diff_computes_add_and_remove_sets() {
        let current: HashSet<u32> = [1, 2, 3, 4].into_iter().collect();
        let target: HashSet<u32> = [3, 4, 5, 6].into_iter().collect();
        let (add, remove) = diff_tokens(&current, &target);
        assert_eq!(add, vec![5, 6]);
        assert_eq!(remove, vec![1, 2]);
    }

    #[test]
    fn identical_sets_diff_to_nothing() {
        let set: HashSet<u32> = [1, 2, 3].into_iter().collect();
        let (add, remove) = diff_tokens(&set, &set.clone());
        assert!(add.is_empty());
        assert!(remove.is_empty());
    }
}
