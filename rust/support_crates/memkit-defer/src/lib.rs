//! A scope that collects cleanup actions and runs them in reverse order.
//!
//! `DeferScope` is the explicit counterpart of a chain of drop guards: actions
//! are registered with [`DeferScope::defer`] and executed last-in, first-out
//! when the scope is disposed (or dropped). Every action runs even if an
//! earlier one fails or panics; all failures are returned together.
//!
//! The scope is single-writer. It is neither `Send` nor `Sync`, so each
//! execution context needs its own instance.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use thiserror::Error;

/// Boxed error returned by a deferred action.
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Action<'a> = Box<dyn FnOnce() -> Result<(), ActionError> + 'a>;

/// A LIFO stack of zero-argument cleanup actions.
pub struct DeferScope<'a> {
    actions: Vec<Action<'a>>,
}

impl<'a> DeferScope<'a> {
    /// Creates an empty scope.
    pub fn new() -> DeferScope<'a> {
        DeferScope {
            actions: Vec::new(),
        }
    }

    /// Registers a fallible action.
    pub fn defer<F, E>(&mut self, action: F)
    where
        F: FnOnce() -> Result<(), E> + 'a,
        E: Into<ActionError>,
    {
        self.actions
            .push(Box::new(move || action().map_err(Into::into)));
    }

    /// Registers an action that cannot fail (it may still panic).
    pub fn defer_fn<F>(&mut self, action: F)
    where
        F: FnOnce() + 'a,
    {
        self.actions.push(Box::new(move || {
            action();
            Ok(())
        }));
    }

    /// Takes ownership of `value` and drops it when the scope is disposed,
    /// in the same LIFO order as the other actions.
    pub fn defer_drop<T: 'a>(&mut self, value: T) {
        self.defer_fn(move || drop(value));
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every pending action in reverse registration order.
    ///
    /// Returns `Ok(())` when all actions succeed, [`CleanupError::Single`] when
    /// exactly one fails and [`CleanupError::Composite`] (failures in execution
    /// order) when several fail.
    pub fn dispose(mut self) -> Result<(), CleanupError> {
        let failures = self.run_all();
        CleanupError::from_failures(failures)
    }

    fn run_all(&mut self) -> Vec<ActionFailure> {
        let mut failures = Vec::new();
        while let Some(action) = self.actions.pop() {
            let index = self.actions.len();
            let outcome = match catch_unwind(AssertUnwindSafe(action)) {
                Ok(res) => res,
                Err(payload) => Err(Box::new(ActionPanicked::from_payload(payload)) as ActionError),
            };
            if let Err(source) = outcome {
                failures.push(ActionFailure { index, source });
            }
        }
        failures
    }
}

impl Default for DeferScope<'_> {
    fn default() -> Self {
        DeferScope::new()
    }
}

impl Drop for DeferScope<'_> {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        for failure in self.run_all() {
            log::error!("deferred cleanup failed during drop: {failure}");
        }
    }
}

impl std::fmt::Debug for DeferScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferScope")
            .field("pending", &self.actions.len())
            .finish()
    }
}

/// A single failed action, identified by its registration index.
#[derive(Debug, Error)]
#[error("deferred action #{index} failed: {source}")]
pub struct ActionFailure {
    pub index: usize,
    #[source]
    pub source: ActionError,
}

/// Failure(s) collected while disposing a [`DeferScope`].
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Single(ActionFailure),

    #[error("{} deferred actions failed, first: {}", .0.len(), .0[0])]
    Composite(Vec<ActionFailure>),
}

impl CleanupError {
    /// All collected failures, in execution (LIFO) order.
    pub fn failures(&self) -> &[ActionFailure] {
        match self {
            CleanupError::Single(f) => std::slice::from_ref(f),
            CleanupError::Composite(list) => list,
        }
    }

    fn from_failures(mut failures: Vec<ActionFailure>) -> Result<(), CleanupError> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(CleanupError::Single(failures.remove(0))),
            _ => Err(CleanupError::Composite(failures)),
        }
    }
}

/// Error recorded when a deferred action panics.
#[derive(Debug, Error)]
#[error("action panicked: {message}")]
pub struct ActionPanicked {
    pub message: String,
}

impl ActionPanicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> ActionPanicked {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        ActionPanicked { message }
    }
}
