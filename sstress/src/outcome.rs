//! Outcome aggregation and the final verdict.
//!
//! Besides counting assertive successes, the tally carries an exit
//! indicator that mirrors how attempts ended:
//!
//! | event                       | indicator |
//! |-----------------------------|-----------|
//! | start                       | 1         |
//! | end-of-message received     | 0         |
//! | transport retries exhausted | 2         |
//! | attempt timed out           | 3         |
//!
//! The latest event wins. At verdict time the indicator is forced to 1 if
//! fewer successes than the pass limit were seen. The process exits 0 iff the
//! final indicator equals the expected one.

use crate::controller::AttemptResult;

pub const INDICATOR_PASS: u8 = 0;
pub const INDICATOR_FAIL: u8 = 1;
pub const INDICATOR_RETRIES_EXHAUSTED: u8 = 2;
pub const INDICATOR_TIMEOUT: u8 = 3;

#[derive(Debug, Clone)]
pub struct OutcomeTally {
    success_count: u32,
    pass_limit: u32,
    original_budget: u32,
    indicator: u8,
}

impl OutcomeTally {
    #[must_use]
    pub const fn new(original_budget: u32, pass_limit: u32) -> Self {
        Self {
            success_count: 0,
            pass_limit,
            original_budget,
            indicator: INDICATOR_FAIL,
        }
    }

    /// Counts one assertive success, never beyond the original budget.
    pub fn record_success(&mut self) {
        if self.success_count < self.original_budget {
            self.success_count += 1;
        }
    }

    pub fn note_end_of_message(&mut self) {
        self.indicator = INDICATOR_PASS;
    }

    /// Folds a terminal attempt result into the tally.
    pub fn record(&mut self, result: AttemptResult) {
        match result {
            AttemptResult::AckedSuccess => self.record_success(),
            AttemptResult::RetriesExhausted => self.indicator = INDICATOR_RETRIES_EXHAUSTED,
            AttemptResult::TimedOut => self.indicator = INDICATOR_TIMEOUT,
            AttemptResult::NackedFailure | AttemptResult::Other => {}
        }
    }

    #[must_use]
    pub const fn success_count(&self) -> u32 {
        self.success_count
    }

    #[must_use]
    pub fn final_verdict(&self) -> Verdict {
        let good = self.success_count >= self.pass_limit;
        Verdict {
            indicator: if good { self.indicator } else { INDICATOR_FAIL },
            good,
            observed_successes: self.success_count,
            expected_pass_limit: self.pass_limit,
            original_budget: self.original_budget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub indicator: u8,
    pub good: bool,
    pub observed_successes: u32,
    pub expected_pass_limit: u32,
    pub original_budget: u32,
}

impl Verdict {
    /// 0 when the indicator matches `expected`, 1 otherwise.
    #[must_use]
    pub const fn exit_code(&self, expected: u8) -> u8 {
        if self.indicator == expected { 0 } else { 1 }
    }

    /// The two user-facing result lines.
    #[must_use]
    pub fn report_lines(&self, expected: u8) -> [String; 2] {
        let tally = format!(
            "good: {} / {} budget, pass limit {}",
            self.observed_successes, self.original_budget, self.expected_pass_limit
        );
        let completion = if self.indicator == expected {
            format!("Completed: OK (seen expected {expected})")
        } else {
            format!(
                "Completed: failed: exit {}, expected {expected}",
                self.indicator
            )
        };
        [tally, completion]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successes_are_capped_at_budget() {
        let mut tally = OutcomeTally::new(2, 1);
        for _ in 0..5 {
            tally.record(AttemptResult::AckedSuccess);
        }
        assert_eq!(tally.success_count(), 2);
    }

    #[test]
    fn indicator_forced_to_fail_below_pass_limit() {
        let mut tally = OutcomeTally::new(3, 1);
        tally.record(AttemptResult::TimedOut);
        let verdict = tally.final_verdict();
        assert!(!verdict.good);
        assert_eq!(verdict.indicator, INDICATOR_FAIL);
        assert_eq!(verdict.exit_code(0), 1);
        assert_eq!(verdict.exit_code(1), 0);
    }

    #[test]
    fn latest_fault_wins_when_pass_limit_met() {
        let mut tally = OutcomeTally::new(2, 1);
        tally.note_end_of_message();
        tally.record(AttemptResult::AckedSuccess);
        assert_eq!(tally.final_verdict().indicator, INDICATOR_PASS);
        tally.record(AttemptResult::RetriesExhausted);
        assert_eq!(tally.final_verdict().indicator, INDICATOR_RETRIES_EXHAUSTED);
    }

    #[test]
    fn report_lines_match_expected_format() {
        let mut tally = OutcomeTally::new(1, 1);
        tally.note_end_of_message();
        tally.record(AttemptResult::AckedSuccess);
        let [good, done] = tally.final_verdict().report_lines(0);
        assert_eq!(good, "good: 1 / 1 budget, pass limit 1");
        assert_eq!(done, "Completed: OK (seen expected 0)");

        let [_, failed] = OutcomeTally::new(3, 3).final_verdict().report_lines(0);
        assert_eq!(failed, "Completed: failed: exit 1, expected 0");
    }
}
