//! Property-based tests for the approval state machine
//!
//! These tests verify key invariants hold across arbitrary verb sequences.

use super::*;
use proptest::prelude::*;

fn arb_status() -> impl Strategy<Value = ApprovalStatus> {
    prop_oneof![
        Just(ApprovalStatus::Unapproved),
        Just(ApprovalStatus::Approved),
        Just(ApprovalStatus::Rejected),
    ]
}

fn arb_forward_verb() -> impl Strategy<Value = Verb> {
    prop_oneof![Just(Verb::Approve), Just(Verb::Reject)]
}

fn arb_verb() -> impl Strategy<Value = Verb> {
    prop_oneof![Just(Verb::Approve), Just(Verb::Reject), Just(Verb::Reopen)]
}

/// Run a verb sequence, keeping the status unchanged on rejected transitions
fn replay(start: ApprovalStatus, verbs: &[Verb]) -> Vec<ApprovalStatus> {
    let mut current = start;
    let mut seen = vec![current];
    for verb in verbs {
        if let Ok(t) = transition(current, *verb) {
            current = t.status();
        }
        seen.push(current);
    }
    seen
}

proptest! {
    /// Without reopen, a decided conversation never changes status again
    #[test]
    fn forward_verbs_are_monotonic(verbs in proptest::collection::vec(arb_forward_verb(), 1..20)) {
        let seen = replay(ApprovalStatus::Unapproved, &verbs);
        let first_decided = seen.iter().position(|s| s.is_decided());
        if let Some(idx) = first_decided {
            let decided = seen[idx];
            prop_assert!(seen[idx..].iter().all(|s| *s == decided));
            prop_assert!(seen[..idx].iter().all(|s| *s == ApprovalStatus::Unapproved));
        }
    }

    /// A verb applied twice in a row never changes anything the second time
    #[test]
    fn verbs_are_idempotent(start in arb_status(), verb in arb_verb()) {
        if let Ok(first) = transition(start, verb) {
            let second = transition(first.status(), verb).unwrap();
            prop_assert_eq!(second, Transition::Unchanged(first.status()));
        }
    }

    /// A failed transition only happens when moving between decided states
    #[test]
    fn only_decided_to_other_decided_fails(start in arb_status(), verb in arb_verb()) {
        let result = transition(start, verb);
        let crosses_decision = start.is_decided()
            && verb.target().is_decided()
            && start != verb.target();
        prop_assert_eq!(result.is_err(), crosses_decision);
    }

    /// Unapproved is only ever re-entered through reopen
    #[test]
    fn unapproved_only_via_reopen(start in arb_status(), verb in arb_verb()) {
        if let Ok(Transition::Changed { to, .. }) = transition(start, verb) {
            if to == ApprovalStatus::Unapproved {
                prop_assert_eq!(verb, Verb::Reopen);
            }
        }
    }
}
