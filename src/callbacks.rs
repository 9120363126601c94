//! Implementation of different callback functions for forecast sweeps.
use crate::forecast::UnitOutcome;
use log::{error, info};

/// Trait for implementing callbacks for sweeps over forecast units
pub trait Callback: Sync {
    /// This method is called after each finished unit with all outcomes so far, the latest one
    /// last, and may report on it.
    fn print(&self, outcomes: &[UnitOutcome]);
}

/// A callback function that does nothing
pub struct SinkCallback {}

impl Callback for SinkCallback {
    fn print(&self, _: &[UnitOutcome]) {}
}

/// A callback function that logs the result of each individual unit
pub struct SimpleCallback {}

impl Callback for SimpleCallback {
    fn print(&self, outcomes: &[UnitOutcome]) {
        // Make sure that there is at least one outcome
        // otherwise do nothing.
        if let Some(outcome) = outcomes.last() {
            match &outcome.result {
                Ok(fisher) => info!(
                    "unit {} finished: {} parameters",
                    outcome.unit,
                    fisher.len()
                ),
                Err(err) => error!("unit {} failed: {}", outcome.unit, err),
            }
        }
    }
}

/// Simple cumulative callback that shows the result of the individual unit together with the
/// progress of the whole sweep.
pub struct SimpleCumulativeCallback {
    /// Number of units in the sweep.
    pub total: usize,
}

impl Callback for SimpleCumulativeCallback {
    fn print(&self, outcomes: &[UnitOutcome]) {
        let outcome = match outcomes.last() {
            Some(outcome) => outcome,
            None => return,
        };

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        let status = match &outcome.result {
            Ok(_) => "ok".to_string(),
            Err(err) => format!("failed: {}", err),
        };

        info!(
            "[unit {}: {}] [sweep: {}/{} done, {} failed]",
            outcome.unit,
            status,
            outcomes.len(),
            self.total,
            failed
        );
    }
}
