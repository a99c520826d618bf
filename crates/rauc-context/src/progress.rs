//! Hierarchical progress reporting.
//!
//! Long-running operations are split into nested, named steps. The root
//! step represents 0..100 percent of the operation; every child owns an
//! equal share of its parent's range, fixed when the child begins:
//!
//! ```text
//! install (100%, 2 substeps)
//! ├── verify (50%, 0 substeps, explicit percentages)
//! └── write  (50%, 3 substeps)
//!     ├── slot rootfs (16.6%)
//!     ├── slot appfs  (16.6%)
//!     └── hooks       (16.6%)
//! ```
//!
//! A step reports progress either by completing substeps or by setting an
//! explicit percentage, never both. Every change is delivered to the
//! registered observer as a [`ProgressUpdate`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ContractViolation;

/// Percentage range represented by the root step.
const ROOT_PERCENT: f64 = 100.0;

/// Float error absorbed before truncating to whole percent, so a sum that
/// is exactly 50 is not reported as 49.
const ROUNDING_SLACK: f64 = 1e-6;

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Overall progress, 0..=100
    pub percentage: i32,
    /// Description of the step that changed
    pub message: String,
    /// Number of open steps, including the one that changed
    pub depth: usize,
}

/// Observer invoked synchronously for every progress update.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// One open step on the progress stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressStep {
    pub name: String,
    pub description: String,
    pub substeps_total: u32,
    pub substeps_done: u32,
    /// Share of the overall 0..100 range this step represents
    pub percent_total: f64,
    /// Progress accumulated within `percent_total`
    pub percent_done: f64,
    /// Last explicitly set percentage, 0 if never set
    pub last_explicit_percent: i32,
}

impl ProgressStep {
    fn new(name: &str, description: String, substeps: u32, percent_total: f64) -> Self {
        Self {
            name: name.to_string(),
            description,
            substeps_total: substeps,
            substeps_done: 0,
            percent_total,
            percent_done: 0.0,
            last_explicit_percent: 0,
        }
    }
}

/// Stack of nested progress steps.
///
/// The most recently begun step is the last element; its parent is the
/// element before it.
#[derive(Default)]
pub struct ProgressTracker {
    steps: Vec<ProgressStep>,
    observer: Option<ProgressCallback>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("steps", &self.steps)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the progress observer. Only one may ever be registered.
    pub fn register_observer<F>(&mut self, observer: F) -> Result<(), ContractViolation>
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        if self.observer.is_some() {
            return Err(violation(ContractViolation::ObserverAlreadyRegistered));
        }
        self.observer = Some(Arc::new(observer));
        Ok(())
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// Number of open steps.
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    pub fn is_idle(&self) -> bool {
        self.steps.is_empty()
    }

    /// Open steps, root first.
    pub fn steps(&self) -> &[ProgressStep] {
        &self.steps
    }

    /// Open a new step below the current one.
    ///
    /// The step receives `1 / substeps_total` of its parent's share, or the
    /// full range if it is the root step.
    pub fn begin_step(
        &mut self,
        name: &str,
        description: impl Into<String>,
        substeps: u32,
    ) -> Result<(), ContractViolation> {
        let percent_total = match self.steps.last() {
            Some(parent) => {
                if parent.substeps_done >= parent.substeps_total {
                    return Err(violation(ContractViolation::StepLimitExceeded {
                        parent: parent.name.clone(),
                        child: name.to_string(),
                        attempted: parent.substeps_done + 1,
                        total: parent.substeps_total,
                    }));
                }

                let share = parent.percent_total / f64::from(parent.substeps_total);
                if share > parent.percent_total || share > ROOT_PERCENT {
                    return Err(violation(ContractViolation::StepShareExceeded {
                        parent: parent.name.clone(),
                        child: name.to_string(),
                    }));
                }
                share
            }
            None => ROOT_PERCENT,
        };

        self.steps.push(ProgressStep::new(
            name,
            description.into(),
            substeps,
            percent_total,
        ));

        self.send_progress(None)
    }

    /// [`begin_step`](Self::begin_step) with a formatted description.
    pub fn begin_step_fmt(
        &mut self,
        name: &str,
        substeps: u32,
        description: fmt::Arguments<'_>,
    ) -> Result<(), ContractViolation> {
        self.begin_step(name, description.to_string(), substeps)
    }

    /// Close the current step, which must be named `name`.
    ///
    /// On success all substeps must have completed. On failure outstanding
    /// substeps are marked complete so the parent's accounting stays intact.
    pub fn end_step(&mut self, name: &str, success: bool) -> Result<(), ContractViolation> {
        let depth = self.steps.len();
        let (ancestors, top) = self.steps.split_at_mut(depth.saturating_sub(1));
        let step = top
            .first_mut()
            .ok_or_else(|| violation(ContractViolation::EmptyProgressStack))?;

        if step.name != name {
            return Err(violation(ContractViolation::StepMismatch {
                expected: step.name.clone(),
                actual: name.to_string(),
            }));
        }

        if step.substeps_done > step.substeps_total {
            return Err(violation(ContractViolation::TooManySubsteps {
                name: step.name.clone(),
                done: step.substeps_done,
                total: step.substeps_total,
            }));
        }

        if success && step.substeps_done < step.substeps_total {
            return Err(violation(ContractViolation::NotEnoughSubsteps {
                name: step.name.clone(),
                done: step.substeps_done,
                total: step.substeps_total,
            }));
        }

        if !success {
            step.substeps_done = step.substeps_total;
        }

        let used_explicit = step.last_explicit_percent != 0;
        if used_explicit {
            // Fold the remainder up to 100% into the parent so rounding in
            // earlier explicit updates cannot leave the parent short.
            apply_percentage(step, ancestors.last_mut(), 100);
        }
        step.percent_done = step.percent_total;

        if let Some(parent) = ancestors.last_mut() {
            parent.substeps_done += 1;
            if !used_explicit {
                parent.percent_done += step.percent_done;
            }
        }

        self.send_progress(Some(success))?;
        self.steps.pop();
        Ok(())
    }

    /// Set the completion of the current step, named `name`, to `percent`.
    ///
    /// Only valid for steps without substeps. Setting 100 does not notify
    /// the observer; the following [`end_step`](Self::end_step) does.
    ///
    /// Percentages may not go down: a value below the last one set for
    /// this step is rejected with
    /// [`ContractViolation::PercentageDecreased`], which is unrecoverable.
    /// Repeating the last value is accepted.
    pub fn set_step_percentage(&mut self, name: &str, percent: i32) -> Result<(), ContractViolation> {
        let depth = self.steps.len();
        let (ancestors, top) = self.steps.split_at_mut(depth.saturating_sub(1));
        let step = top
            .first_mut()
            .ok_or_else(|| violation(ContractViolation::EmptyProgressStack))?;

        if step.name != name {
            return Err(violation(ContractViolation::StepMismatch {
                expected: step.name.clone(),
                actual: name.to_string(),
            }));
        }

        if step.substeps_total != 0 {
            return Err(violation(ContractViolation::ExplicitPercentageWithSubsteps {
                name: step.name.clone(),
                substeps: step.substeps_total,
            }));
        }

        if !(0..=100).contains(&percent) {
            return Err(violation(ContractViolation::PercentageOutOfRange {
                name: step.name.clone(),
                percent,
            }));
        }

        if percent < step.last_explicit_percent {
            return Err(violation(ContractViolation::PercentageDecreased {
                name: step.name.clone(),
                last: step.last_explicit_percent,
                percent,
            }));
        }

        apply_percentage(step, ancestors.last_mut(), percent);

        if percent != 100 {
            self.send_progress(None)?;
        }
        Ok(())
    }

    /// Notify the observer about the current step.
    ///
    /// `finished` is `Some(success)` when the current step is completing.
    fn send_progress(&mut self, finished: Option<bool>) -> Result<(), ContractViolation> {
        let depth = self.steps.len();
        let (ancestors, top) = self.steps.split_at_mut(depth.saturating_sub(1));
        let step = top
            .first_mut()
            .ok_or_else(|| violation(ContractViolation::EmptyProgressStack))?;

        // The current step has already folded its progress into its parent,
        // so only the root counts itself.
        let total = if ancestors.is_empty() {
            step.percent_done
        } else {
            ancestors.iter().map(|s| s.percent_done).sum()
        };
        let percentage = (total + ROUNDING_SLACK) as i32;
        if percentage > 100 {
            return Err(violation(ContractViolation::ProgressOverflow(percentage)));
        }

        if let Some(success) = finished {
            let suffix = if success { "done." } else { "failed." };
            step.description = format!("{} {}", step.description, suffix);
        }

        debug!("Progress {:3}% [{}] {}", percentage, depth, step.description);

        if let Some(observer) = &self.observer {
            observer(ProgressUpdate {
                percentage,
                message: step.description.clone(),
                depth,
            });
        }
        Ok(())
    }
}

/// Account the change from the step's last explicit percentage to `percent`
/// on the step and its parent.
fn apply_percentage(step: &mut ProgressStep, parent: Option<&mut ProgressStep>, percent: i32) {
    let increment =
        step.percent_total * (f64::from(percent - step.last_explicit_percent) / 100.0);
    step.percent_done += increment;
    if let Some(parent) = parent {
        parent.percent_done += increment;
    }
    step.last_explicit_percent = percent;
}

fn violation(violation: ContractViolation) -> ContractViolation {
    error!("Progress contract violated: {}", violation);
    violation
}

/// Create an observer that forwards updates into a channel.
///
/// Lets an async host consume progress without running code inside the
/// tracker. Updates sent after the receiver is dropped are discarded.
pub fn channel() -> (
    impl Fn(ProgressUpdate) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ProgressUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer = move |update: ProgressUpdate| {
        let _ = tx.send(update);
    };
    (observer, rx)
}
