//! Property-based tests for rauc-context.
//!
//! These tests use proptest to verify the progress accounting across
//! randomly generated step trees.
//!
//! # Properties Tested
//!
//! - Property 1: Reported progress never exceeds 100 and never decreases
//! - Property 2: Mis-nested `end_step` calls are rejected at any depth
//! - Property 3: Explicit percentages are exclusive to steps without substeps
//! - Property 4: Boot slot rule order on arbitrary command lines

#![cfg(test)]

use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use crate::bootslot::{boot_slot_from_cmdline, EXTERNAL_BOOT_SLOT};
use crate::error::ContractViolation;
use crate::progress::{ProgressTracker, ProgressUpdate};

// =============================================================================
// Generators
// =============================================================================

/// Shape of a progress step tree.
#[derive(Debug, Clone)]
enum StepPlan {
    /// Step without substeps reporting these explicit percentages
    Explicit(Vec<i32>),
    /// Step with one substep per child
    Nested(Vec<StepPlan>),
}

/// Generate a step tree up to four levels deep.
fn arb_plan() -> impl Strategy<Value = StepPlan> {
    let leaf = prop::collection::vec(0i32..=100, 0..5).prop_map(|mut percents| {
        percents.sort_unstable();
        StepPlan::Explicit(percents)
    });
    leaf.prop_recursive(4, 48, 4, |inner| {
        prop::collection::vec(inner, 1..4).prop_map(StepPlan::Nested)
    })
}

/// Generate a command line token that does not trigger any boot slot rule.
fn arb_neutral_token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("quiet".to_string()),
        Just("console=ttyS0,115200".to_string()),
        Just("rootwait".to_string()),
        "[a-z]{1,8}=[a-z0-9]{1,8}".prop_filter("must not be a root token", |t| {
            !t.starts_with("root=")
        }),
    ]
}

// =============================================================================
// Helper Functions
// =============================================================================

fn recording_tracker() -> (ProgressTracker, Arc<Mutex<Vec<ProgressUpdate>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let mut tracker = ProgressTracker::new();
    tracker
        .register_observer(move |update| sink.lock().unwrap().push(update))
        .unwrap();
    (tracker, updates)
}

/// Execute a plan, naming steps by their path in the tree.
fn run_plan(
    tracker: &mut ProgressTracker,
    plan: &StepPlan,
    name: &str,
) -> Result<(), ContractViolation> {
    match plan {
        StepPlan::Explicit(percents) => {
            tracker.begin_step(name, name, 0)?;
            for percent in percents {
                tracker.set_step_percentage(name, *percent)?;
            }
            tracker.end_step(name, true)
        }
        StepPlan::Nested(children) => {
            tracker.begin_step(name, name, children.len() as u32)?;
            for (i, child) in children.iter().enumerate() {
                run_plan(tracker, child, &format!("{}.{}", name, i))?;
            }
            tracker.end_step(name, true)
        }
    }
}

// =============================================================================
// Property 1: Bounded, monotonic progress
//
// *For any* step tree, every reported percentage lies in 0..=100, the
// sequence never decreases, and the final update reports 100.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_progress_bounded_and_monotonic(plan in arb_plan()) {
        let (mut tracker, updates) = recording_tracker();

        let result = run_plan(&mut tracker, &plan, "root");
        prop_assert!(result.is_ok(), "plan failed: {:?}", result);
        prop_assert!(tracker.is_idle());

        let updates = updates.lock().unwrap();
        let percentages: Vec<i32> = updates.iter().map(|u| u.percentage).collect();

        prop_assert!(percentages.iter().all(|p| (0..=100).contains(p)), "out of range: {:?}", percentages);
        prop_assert!(
            percentages.windows(2).all(|w| w[0] <= w[1]),
            "progress decreased: {:?}",
            percentages
        );
        prop_assert_eq!(percentages.last().copied(), Some(100));
        prop_assert_eq!(updates.last().map(|u| u.depth), Some(1));
    }

    /// Failing steps at any point still keep the accumulated progress bounded.
    #[test]
    fn prop_failed_steps_keep_progress_bounded(
        substeps in 1u32..6,
        completed in 0u32..6,
    ) {
        let completed = completed.min(substeps);
        let (mut tracker, updates) = recording_tracker();

        tracker.begin_step("root", "Root", substeps).unwrap();
        for i in 0..completed {
            let name = format!("child{}", i);
            tracker.begin_step(&name, "Child", 0).unwrap();
            tracker.end_step(&name, true).unwrap();
        }
        if completed < substeps {
            tracker.begin_step("broken", "Broken", 3).unwrap();
            tracker.end_step("broken", false).unwrap();
        }
        tracker.end_step("root", false).unwrap();

        let updates = updates.lock().unwrap();
        prop_assert!(updates.iter().all(|u| u.percentage <= 100));
        prop_assert_eq!(updates.last().map(|u| u.message.as_str()), Some("Root failed."));
    }
}

// =============================================================================
// Property 2: Nesting violations
//
// *For any* stack depth >= 1, ending a step other than the top one is
// rejected and leaves the stack untouched.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_mismatched_end_rejected(depth in 1usize..8, wrong in 0usize..8) {
        let mut tracker = ProgressTracker::new();
        for level in 0..depth {
            tracker.begin_step(&format!("step{}", level), "Step", 1).unwrap();
        }

        let top = format!("step{}", depth - 1);
        let wrong_name = if wrong == depth - 1 {
            "unknown".to_string()
        } else {
            format!("step{}", wrong)
        };

        let result = tracker.end_step(&wrong_name, true);
        prop_assert_eq!(
            result,
            Err(ContractViolation::StepMismatch { expected: top, actual: wrong_name })
        );
        prop_assert_eq!(tracker.depth(), depth);
    }
}

// =============================================================================
// Property 3: Reporting mode exclusivity
//
// *For any* step with substeps, explicit percentages are rejected; *for any*
// non-decreasing sequence on a step without substeps, they are accepted.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_explicit_percentage_rejected_with_substeps(
        substeps in 1u32..10,
        percent in 0i32..=100,
    ) {
        let mut tracker = ProgressTracker::new();
        tracker.begin_step("root", "Root", substeps).unwrap();

        let is_rejected = matches!(
            tracker.set_step_percentage("root", percent),
            Err(ContractViolation::ExplicitPercentageWithSubsteps { .. })
        );
        prop_assert!(is_rejected);
    }

    #[test]
    fn prop_explicit_percentage_accepted_without_substeps(
        mut percents in prop::collection::vec(0i32..=100, 1..10),
    ) {
        percents.sort_unstable();
        let (mut tracker, updates) = recording_tracker();
        tracker.begin_step("root", "Root", 1).unwrap();
        tracker.begin_step("verify", "Verify", 0).unwrap();

        for percent in &percents {
            prop_assert!(tracker.set_step_percentage("verify", *percent).is_ok());
        }
        tracker.end_step("verify", true).unwrap();

        let updates = updates.lock().unwrap();
        prop_assert!(updates.windows(2).all(|w| w[0].percentage <= w[1].percentage));
        prop_assert_eq!(updates.last().map(|u| u.percentage), Some(100));
    }
}

// =============================================================================
// Property 4: Boot slot rule order
//
// *For any* command line containing `rauc.external`, the sentinel wins over
// every other rule; otherwise an explicit `rauc.slot=` wins over root tokens.
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_external_always_wins(
        mut tokens in prop::collection::vec(arb_neutral_token(), 0..6),
        position in any::<prop::sample::Index>(),
        slot in "[a-z0-9]{1,8}",
    ) {
        tokens.push(format!("rauc.slot={}", slot));
        tokens.push("root=/dev/mmcblk0p1".to_string());
        let index = position.index(tokens.len() + 1);
        tokens.insert(index, "rauc.external".to_string());

        let cmdline = tokens.join(" ");
        prop_assert_eq!(
            boot_slot_from_cmdline(&cmdline, Some("barebox")),
            Some(EXTERNAL_BOOT_SLOT.to_string())
        );
    }

    #[test]
    fn prop_explicit_slot_wins_over_root(
        tokens in prop::collection::vec(arb_neutral_token(), 0..6),
        slot in "[a-z0-9]{1,8}",
    ) {
        let mut tokens = tokens;
        tokens.insert(0, "root=/dev/mmcblk0p1".to_string());
        tokens.insert(0, "bootstate.active=system9".to_string());
        tokens.push(format!("rauc.slot={}", slot));

        let cmdline = tokens.join(" ");
        prop_assert_eq!(boot_slot_from_cmdline(&cmdline, Some("barebox")), Some(slot));
    }
}
