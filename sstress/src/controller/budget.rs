//! Finite attempt budget.

/// Attempts an instance may still start.
///
/// `remaining` only ever decreases, by exactly one per attempt, and is spent
/// before the transport is asked to create the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
    original: u32,
}

impl RetryBudget {
    #[must_use]
    pub const fn new(original: u32) -> Self {
        Self {
            remaining: original,
            original,
        }
    }

    /// Spends one unit. Returns `false`, spending nothing, once exhausted.
    pub fn try_consume(&mut self) -> bool {
        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    #[must_use]
    pub const fn original(&self) -> u32 {
        self.original
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    #[must_use]
    pub const fn spent(&self) -> u32 {
        self.original - self.remaining
    }
}
