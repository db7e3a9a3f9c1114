//! Lifecycle stages and the notifier that walks them.
//!
//! Moving towards a target stage visits every intermediate stage in order.
//! For each stage the notifier is called twice: once while approaching it
//! (`current` is the previous stage) and once on arrival (`current ==
//! target`). Notifications run synchronously; the stage only counts as
//! reached after they return.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemState {
    ContextCreated,
    Initialized,
    PolicyValid,
    Registered,
    ConnectivityCheck,
    Operational,
}

impl SystemState {
    const ORDER: [Self; 6] = [
        Self::ContextCreated,
        Self::Initialized,
        Self::PolicyValid,
        Self::Registered,
        Self::ConnectivityCheck,
        Self::Operational,
    ];

    #[must_use]
    pub fn next(self) -> Option<Self> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTransition {
    pub current: SystemState,
    pub target: SystemState,
}

impl StageTransition {
    #[must_use]
    pub fn is_arrival(&self) -> bool {
        self.current == self.target
    }
}

#[derive(Debug)]
pub struct StateManager {
    current: SystemState,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: SystemState::ContextCreated,
        }
    }

    #[must_use]
    pub const fn current(&self) -> SystemState {
        self.current
    }

    /// Walks forward to `target`, notifying for every stage on the way.
    ///
    /// Targets at or behind the current stage do nothing.
    pub fn advance_to<R>(
        &mut self,
        target: SystemState,
        mut notify: impl FnMut(StageTransition) -> R,
    ) -> Vec<R> {
        let mut out = Vec::new();
        while self.current < target {
            let Some(next) = self.current.next() else {
                break;
            };
            out.push(notify(StageTransition {
                current: self.current,
                target: next,
            }));
            self.current = next;
            out.push(notify(StageTransition {
                current: next,
                target: next,
            }));
        }
        out
    }

    /// Re-delivers the arrival notification for the current stage.
    pub fn reassert<R>(&self, mut notify: impl FnMut(StageTransition) -> R) -> R {
        notify(StageTransition {
            current: self.current,
            target: self.current,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_notifies_approach_then_arrival_per_stage() {
        let mut manager = StateManager::new();
        let seen = manager.advance_to(SystemState::PolicyValid, |t| t);
        assert_eq!(
            seen,
            vec![
                StageTransition {
                    current: SystemState::ContextCreated,
                    target: SystemState::Initialized
                },
                StageTransition {
                    current: SystemState::Initialized,
                    target: SystemState::Initialized
                },
                StageTransition {
                    current: SystemState::Initialized,
                    target: SystemState::PolicyValid
                },
                StageTransition {
                    current: SystemState::PolicyValid,
                    target: SystemState::PolicyValid
                },
            ]
        );
        assert_eq!(manager.current(), SystemState::PolicyValid);
    }

    #[test]
    fn backwards_target_is_a_no_op() {
        let mut manager = StateManager::new();
        manager.advance_to(SystemState::Operational, |_| ());
        assert!(manager.advance_to(SystemState::Registered, |t| t).is_empty());
        assert_eq!(manager.current(), SystemState::Operational);
        assert!(manager.reassert(|t| t.is_arrival()));
        assert_eq!(SystemState::Operational.next(), None);
    }
}
