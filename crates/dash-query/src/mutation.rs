//! Mutation handles with lifecycle state.

use std::future::Future;
use std::sync::{Arc, Mutex};

use dash_fetch::{execute as retry_execute, FetchError, RetryConfig};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::options::{ErrorHook, SuccessHook};

/// Boxed future returned by a mutator.
pub type MutateFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// An opaque mutate callable (transaction submission, content upload).
pub type Mutator = Arc<dyn Fn(Value) -> MutateFuture + Send + Sync>;

/// Lifecycle of a mutation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of a mutation's state.
#[derive(Debug, Clone, Default)]
pub struct MutationState {
    pub status: MutationStatus,
    /// Result of the last successful run.
    pub data: Option<Value>,
    /// Error of the last failed run.
    pub error: Option<FetchError>,
}

impl MutationState {
    pub fn is_loading(&self) -> bool {
        self.status == MutationStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

/// Options for a mutation handle.
///
/// Mutations default to a single attempt: blindly retrying a write against
/// a chain can double-submit, so retry opt-in is explicit.
#[derive(Clone, Default)]
pub struct MutationOptions {
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) on_success: Option<SuccessHook>,
    pub(crate) on_error: Option<ErrorHook>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opt in to retrying the mutator.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Run a callback after each successful mutation.
    pub fn on_success(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Run a callback after each failed mutation.
    pub fn on_error(mut self, hook: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

/// A reusable mutation handle.
///
/// Holds the mutator plus `Idle -> Loading -> Success | Error` state
/// observable between runs; `reset` returns the handle to `Idle`.
#[derive(Clone)]
pub struct Mutation {
    mutator: Mutator,
    retry: RetryConfig,
    state: Arc<Mutex<MutationState>>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl Mutation {
    pub(crate) fn new(mutator: Mutator, options: MutationOptions) -> Self {
        Self {
            mutator,
            retry: options.retry.unwrap_or_else(RetryConfig::none),
            state: Arc::new(Mutex::new(MutationState::default())),
            on_success: options.on_success,
            on_error: options.on_error,
        }
    }

    /// Run the mutator with `variables`.
    ///
    /// The caller is responsible for rolling back any optimistic update in
    /// its failure handler; the mutation does not auto-detect one.
    pub async fn mutate(&self, variables: Value) -> Result<Value, QueryError> {
        self.set_state(|state| {
            state.status = MutationStatus::Loading;
            state.error = None;
        });

        let mutator = Arc::clone(&self.mutator);
        let result = retry_execute(&self.retry, || (mutator)(variables.clone())).await;

        match result {
            Ok(value) => {
                self.set_state(|state| {
                    state.status = MutationStatus::Success;
                    state.data = Some(value.clone());
                });
                if let Some(hook) = &self.on_success {
                    hook(&value);
                }
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(kind = err.kind(), "mutation failed");
                self.set_state(|state| {
                    state.status = MutationStatus::Error;
                    state.error = Some(err.clone());
                });
                if let Some(hook) = &self.on_error {
                    hook(&err);
                }
                Err(QueryError::Fetch(err))
            }
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> MutationState {
        self.state.lock().expect("mutation lock poisoned").clone()
    }

    /// Return to `Idle`, clearing data and error.
    pub fn reset(&self) {
        *self.state.lock().expect("mutation lock poisoned") = MutationState::default();
    }

    fn set_state(&self, update: impl FnOnce(&mut MutationState)) {
        update(&mut self.state.lock().expect("mutation lock poisoned"));
    }
}

impl QueryClient {
    /// Build a mutation handle around an opaque mutator.
    pub fn mutation<F, Fut>(&self, mutator: F, options: MutationOptions) -> Mutation
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Mutation::new(Arc::new(move |vars| mutator(vars).boxed()), options)
    }
}
