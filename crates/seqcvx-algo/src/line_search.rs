//! Watchdog line search.
//!
//! Plain Armijo backtracking stalls near active constraints of black-box
//! models, where a single non-monotone merit step is common even on a good
//! trajectory. The watchdog accepts up to `watchdog_iterations` such steps in
//! a row before it insists on sufficient decrease:
//!
//! ```text
//!              ┌──────── decrease ────────┐
//!              ▼                          │
//!   Searching ──── no decrease, n ≤ W ──► Tentative (n == 1: take checkpoint)
//!       │
//!       ├── no decrease, n > W, checkpoint held ──► revert, retry from it
//!       ├── no decrease, n > W, already reverted ─► α ← τα
//!       └── evaluation failed ────────────────────► α ← τα
//! ```
//!
//! The counter `n` persists across iterations: it is the number of
//! consecutive accepted steps without sufficient decrease. The search itself
//! knows nothing about iterates. It talks to a [`LineSearchProblem`], which
//! evaluates the merit function and saves and restores whatever state a revert
//! must undo.

use crate::error::{SolverError, SolverResult};
use crate::merit::MeritEvaluation;

/// What the watchdog needs from the solver.
pub trait LineSearchProblem {
    type Checkpoint;

    /// Merit value and directional derivative at the current iterate.
    fn anchor(&mut self) -> SolverResult<MeritEvaluation>;

    /// Merit value at `current + step · direction`.
    fn trial(&mut self, step: f64) -> SolverResult<MeritEvaluation>;

    fn checkpoint(&self) -> Self::Checkpoint;

    fn restore(&mut self, checkpoint: Self::Checkpoint);

    /// Record a human-readable diagnostic.
    fn log(&mut self, message: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    SufficientDecrease,
    /// Accepted inside the watchdog window.
    Tentative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Searching,
    Accepted,
    WatchdogPending,
    Reverting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineSearchOutcome {
    pub step_size: f64,
    pub merit: MeritEvaluation,
    pub acceptance: Acceptance,
    /// The search restored the checkpoint before accepting.
    pub reverted: bool,
    /// Trial evaluations spent.
    pub tries: usize,
}

#[derive(Debug, Clone)]
pub struct WatchdogLineSearch<C> {
    counter: usize,
    checkpoint: Option<C>,
    reverts: usize,
    state: WatchdogState,
    eta: f64,
    tau: f64,
    max_tries: usize,
    watchdog_iterations: usize,
}

impl<C> WatchdogLineSearch<C> {
    pub fn new(eta: f64, tau: f64, max_tries: usize, watchdog_iterations: usize) -> Self {
        Self {
            counter: 0,
            checkpoint: None,
            reverts: 0,
            state: WatchdogState::Searching,
            eta,
            tau,
            max_tries,
            watchdog_iterations,
        }
    }

    /// Consecutive accepted steps without sufficient decrease.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Reverts performed over the life of the search.
    pub fn reverts(&self) -> usize {
        self.reverts
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint.is_some()
    }

    pub fn search<P>(&mut self, problem: &mut P) -> SolverResult<LineSearchOutcome>
    where
        P: LineSearchProblem<Checkpoint = C>,
    {
        self.state = WatchdogState::Searching;
        let mut anchor = problem.anchor()?;
        let mut step = 1.0;
        let mut reverted = false;

        for tries in 1..=self.max_tries {
            let trial = match problem.trial(step) {
                Ok(trial) => trial,
                Err(e) if e.is_recoverable() => {
                    problem.log(format!(
                        "step size {step:.3e} rejected ({e}); shrinking to {:.3e}",
                        step * self.tau
                    ));
                    step *= self.tau;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if trial.phi <= anchor.phi + self.eta * step * anchor.derivative {
                self.counter = 0;
                self.checkpoint = None;
                self.state = WatchdogState::Accepted;
                return Ok(LineSearchOutcome {
                    step_size: step,
                    merit: trial,
                    acceptance: Acceptance::SufficientDecrease,
                    reverted,
                    tries,
                });
            }

            self.counter += 1;
            if self.counter > self.watchdog_iterations {
                if !reverted {
                    if let Some(checkpoint) = self.checkpoint.take() {
                        self.state = WatchdogState::Reverting;
                        self.reverts += 1;
                        reverted = true;
                        problem.log(format!(
                            "watchdog expired after {} steps; reverting to checkpoint",
                            self.counter - 1
                        ));
                        problem.restore(checkpoint);
                        anchor = problem.anchor()?;
                        step = 1.0;
                        continue;
                    }
                }
                problem.log(format!(
                    "no sufficient decrease at step size {step:.3e}; shrinking to {:.3e}",
                    step * self.tau
                ));
                step *= self.tau;
                continue;
            }

            if self.counter == 1 {
                self.checkpoint = Some(problem.checkpoint());
            }
            self.state = WatchdogState::WatchdogPending;
            problem.log(format!(
                "watchdog accepted step size {step:.3e} without sufficient decrease ({}/{})",
                self.counter, self.watchdog_iterations
            ));
            return Ok(LineSearchOutcome {
                step_size: step,
                merit: trial,
                acceptance: Acceptance::Tentative,
                reverted,
                tries,
            });
        }

        Err(SolverError::LineSearchExhausted {
            tries: self.max_tries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcvx_core::EvaluationError;

    /// Merit `φ(α) = (α − 0.3)²`-like stub over a scripted list of outcomes.
    struct Scripted {
        results: Vec<Option<f64>>,
        calls: usize,
        restores: usize,
        log: Vec<String>,
    }

    impl LineSearchProblem for Scripted {
        type Checkpoint = usize;

        fn anchor(&mut self) -> SolverResult<MeritEvaluation> {
            Ok(MeritEvaluation::new(1.0, -1.0))
        }

        fn trial(&mut self, _step: f64) -> SolverResult<MeritEvaluation> {
            let result = self.results.get(self.calls).copied().flatten();
            self.calls += 1;
            match result {
                Some(phi) => Ok(MeritEvaluation::new(phi, -1.0)),
                None => Err(EvaluationError::Undefined {
                    expression: "ln(x)".into(),
                    reason: "x < 0".into(),
                }
                .into()),
            }
        }

        fn checkpoint(&self) -> usize {
            self.calls
        }

        fn restore(&mut self, _checkpoint: usize) {
            self.restores += 1;
        }

        fn log(&mut self, message: String) {
            self.log.push(message);
        }
    }

    #[test]
    fn test_accepts_full_step_on_decrease() {
        let mut problem = Scripted {
            results: vec![Some(0.5)],
            calls: 0,
            restores: 0,
            log: vec![],
        };
        let mut search = WatchdogLineSearch::<usize>::new(1e-4, 0.5, 10, 3);
        let out = search.search(&mut problem).unwrap();
        assert_eq!(out.step_size, 1.0);
        assert_eq!(out.acceptance, Acceptance::SufficientDecrease);
        assert_eq!(search.state(), WatchdogState::Accepted);
    }

    #[test]
    fn test_evaluation_failure_shrinks() {
        let mut problem = Scripted {
            results: vec![None, None, Some(0.5)],
            calls: 0,
            restores: 0,
            log: vec![],
        };
        let mut search = WatchdogLineSearch::<usize>::new(1e-4, 0.5, 10, 3);
        let out = search.search(&mut problem).unwrap();
        assert_eq!(out.step_size, 0.25);
        assert_eq!(out.tries, 3);
        assert_eq!(problem.log.len(), 2);
        assert_eq!(search.counter(), 0);
    }

    #[test]
    fn test_zero_window_is_armijo() {
        let mut problem = Scripted {
            results: vec![Some(2.0), Some(2.0), Some(0.5)],
            calls: 0,
            restores: 0,
            log: vec![],
        };
        let mut search = WatchdogLineSearch::<usize>::new(1e-4, 0.5, 10, 0);
        let out = search.search(&mut problem).unwrap();
        assert_eq!(out.step_size, 0.25);
        assert_eq!(problem.restores, 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut problem = Scripted {
            results: vec![None; 4],
            calls: 0,
            restores: 0,
            log: vec![],
        };
        let mut search = WatchdogLineSearch::<usize>::new(1e-4, 0.5, 4, 3);
        let err = search.search(&mut problem).unwrap_err();
        assert!(matches!(err, SolverError::LineSearchExhausted { tries: 4 }));
    }
}
