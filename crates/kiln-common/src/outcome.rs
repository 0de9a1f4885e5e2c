//! Stage outcomes
//!
//! Every reconcile stage reports one of three results. `Success` lets the next
//! stage run, `Incomplete` stops the pass and asks for a requeue, and
//! `Fatal` carries an error whose retryability decides between backoff and a
//! terminal `Failed` condition.

use crate::Error;

/// Result of running one reconcile stage
#[derive(Debug)]
#[must_use]
pub enum StageOutcome {
    /// Stage is done; continue with the next one
    Success,
    /// Stage is waiting on something (a job, a dependency); stop this pass
    Incomplete,
    /// Stage failed
    Fatal(Error),
}

impl StageOutcome {
    /// True for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    /// True for `Incomplete`
    pub fn is_incomplete(&self) -> bool {
        matches!(self, StageOutcome::Incomplete)
    }

    /// Run `next` only if this outcome is `Success`
    pub fn and_then(self, next: impl FnOnce() -> StageOutcome) -> StageOutcome {
        match self {
            StageOutcome::Success => next(),
            other => other,
        }
    }
}

impl From<Error> for StageOutcome {
    fn from(e: Error) -> Self {
        StageOutcome::Fatal(e)
    }
}

impl From<Result<(), Error>> for StageOutcome {
    fn from(r: Result<(), Error>) -> Self {
        match r {
            Ok(()) => StageOutcome::Success,
            Err(e) => StageOutcome::Fatal(e),
        }
    }
}

/// Short-circuit the enclosing stage function unless the outcome is `Success`.
///
/// The stage-level analogue of `?`:
///
/// ```ignore
/// proceed!(reconcile_container(ctx, &dataset, &mut status).await);
/// proceed!(reconcile_data(ctx, &dataset, &mut status).await);
/// StageOutcome::Success
/// ```
#[macro_export]
macro_rules! proceed {
    ($outcome:expr) => {
        match $outcome {
            $crate::StageOutcome::Success => {}
            other => return other,
        }
    };
}

/// Unwrap a `Result`, turning an error into `StageOutcome::Fatal` and returning it
#[macro_export]
macro_rules! try_stage {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => return $crate::StageOutcome::Fatal(e.into()),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(first: StageOutcome, ran_second: &mut bool) -> StageOutcome {
        proceed!(first);
        *ran_second = true;
        StageOutcome::Success
    }

    #[test]
    fn proceed_continues_on_success() {
        let mut ran = false;
        assert!(run(StageOutcome::Success, &mut ran).is_success());
        assert!(ran);
    }

    #[test]
    fn proceed_stops_on_incomplete() {
        let mut ran = false;
        assert!(run(StageOutcome::Incomplete, &mut ran).is_incomplete());
        assert!(!ran);
    }

    #[test]
    fn proceed_stops_on_fatal() {
        let mut ran = false;
        let outcome = run(StageOutcome::Fatal(Error::validation("bad")), &mut ran);
        assert!(matches!(outcome, StageOutcome::Fatal(Error::Validation { .. })));
        assert!(!ran);
    }

    #[test]
    fn try_stage_converts_errors() {
        fn stage(input: Result<u32, Error>) -> StageOutcome {
            let value = try_stage!(input);
            assert_eq!(value, 7);
            StageOutcome::Success
        }
        assert!(stage(Ok(7)).is_success());
        assert!(matches!(
            stage(Err(Error::internal("boom"))),
            StageOutcome::Fatal(_)
        ));
    }

    #[test]
    fn and_then_short_circuits() {
        let outcome = StageOutcome::Incomplete.and_then(|| panic!("must not run"));
        assert!(outcome.is_incomplete());
        assert!(StageOutcome::Success
            .and_then(|| StageOutcome::Success)
            .is_success());
    }
}
