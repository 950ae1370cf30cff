//! Retry directives and the per-call resubmission budget.
//!
//! Middleware answers a failed response (or transport error) with a
//! [`RetryStrategy`] describing what must happen before the request may be
//! resubmitted: nothing, a pause, a recovery request (such as a credential
//! refresh), or an arbitrary recovery task. Strategies are one-shot values;
//! the client consumes them as soon as middleware produces them.
//!
//! The number of resubmissions a single call may perform is bounded by a
//! [`RetryBudget`] created from the request's `max_retries` at dispatch time.
//! The budget lives in the pipeline, not on the request, so one descriptor
//! can safely serve many concurrent calls.

use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;

use crate::{Request, Response};

/// A type-erased error for recovery tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runs after a recovery request succeeds, with the fallback's response.
/// Typically stores a refreshed credential.
pub type FallbackHandler = Box<dyn FnOnce(Response) -> BoxFuture<'static, ()> + Send>;

/// An arbitrary asynchronous recovery action.
pub type RecoveryTask = BoxFuture<'static, Result<(), BoxError>>;

/// Runs when a recovery task fails, with the task's error.
pub type RecoveryErrorHandler = Box<dyn FnOnce(BoxError) -> BoxFuture<'static, ()> + Send>;

/// What must happen before a failed request is resubmitted.
///
/// # Examples
///
/// ```
/// use backhaul::{Request, RetryStrategy};
/// use std::time::Duration;
///
/// // Resubmit right away.
/// let retry = RetryStrategy::Immediate;
///
/// // Pause first.
/// let retry = RetryStrategy::Delayed(Duration::from_millis(500));
///
/// // Refresh the session, then resubmit.
/// let retry = RetryStrategy::after_request(
///     Request::post("/auth/refresh").with_requires_session(false),
/// );
/// ```
pub enum RetryStrategy {
    /// Resubmit the original request immediately.
    Immediate,

    /// Pause for the given duration, then resubmit.
    Delayed(Duration),

    /// Dispatch a recovery request through the pipeline first.
    ///
    /// The recovery request is marked as a fallback, which exempts it from
    /// the middleware response phase, so a refresh call can never trigger its
    /// own refresh. If it fails, the original outcome is surfaced unchanged
    /// and no budget is consumed. If it succeeds, `on_success` runs with the
    /// fallback's response, then the original request is resubmitted after
    /// the optional delay.
    AfterRequest {
        /// The recovery request to dispatch.
        request: Request,
        /// Optional pause between recovery success and resubmission.
        delay: Option<Duration>,
        /// Invoked with the recovery response before resubmitting.
        on_success: Option<FallbackHandler>,
    },

    /// Await an arbitrary recovery task first.
    ///
    /// If the task errors, `on_error` is invoked with its error, the
    /// original outcome is surfaced unchanged, and no budget is consumed.
    /// If it completes, the original request is resubmitted after the
    /// optional delay.
    AfterTask {
        /// Optional pause between task completion and resubmission.
        delay: Option<Duration>,
        /// The recovery action to await.
        task: RecoveryTask,
        /// Invoked with the task's error before abandoning the retry.
        on_error: Option<RecoveryErrorHandler>,
    },
}

impl RetryStrategy {
    /// A recovery-request strategy with no completion handler.
    pub fn after_request(request: Request) -> Self {
        RetryStrategy::AfterRequest {
            request,
            delay: None,
            on_success: None,
        }
    }

    /// A recovery-request strategy that runs `on_success` with the recovery
    /// response before resubmitting.
    ///
    /// # Examples
    ///
    /// ```
    /// use backhaul::{Request, RetryStrategy};
    ///
    /// let retry = RetryStrategy::after_request_with(
    ///     Request::post("/auth/refresh").with_requires_session(false),
    ///     |response| async move {
    ///         if let Ok(token) = response.decode::<String>() {
    ///             // store the refreshed token
    ///             let _ = token;
    ///         }
    ///     },
    /// );
    /// ```
    pub fn after_request_with<F, Fut>(request: Request, on_success: F) -> Self
    where
        F: FnOnce(Response) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        RetryStrategy::AfterRequest {
            request,
            delay: None,
            on_success: Some(Box::new(move |response| Box::pin(on_success(response)))),
        }
    }

    /// A recovery-task strategy with no error handler.
    pub fn after_task<Fut>(task: Fut) -> Self
    where
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        RetryStrategy::AfterTask {
            delay: None,
            task: Box::pin(task),
            on_error: None,
        }
    }

    /// A recovery-task strategy that runs `on_error` with the task's error
    /// before the retry is abandoned.
    pub fn after_task_with<Fut, F, EFut>(task: Fut, on_error: F) -> Self
    where
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
        F: FnOnce(BoxError) -> EFut + Send + 'static,
        EFut: std::future::Future<Output = ()> + Send + 'static,
    {
        RetryStrategy::AfterTask {
            delay: None,
            task: Box::pin(task),
            on_error: Some(Box::new(move |error| Box::pin(on_error(error)))),
        }
    }

    /// Sets the pause before resubmission.
    ///
    /// `Immediate` becomes `Delayed`; the recovery strategies keep their
    /// recovery step and gain the pause.
    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            RetryStrategy::Immediate | RetryStrategy::Delayed(_) => RetryStrategy::Delayed(delay),
            RetryStrategy::AfterRequest {
                request,
                on_success,
                ..
            } => RetryStrategy::AfterRequest {
                request,
                delay: Some(delay),
                on_success,
            },
            RetryStrategy::AfterTask { task, on_error, .. } => RetryStrategy::AfterTask {
                delay: Some(delay),
                task,
                on_error,
            },
        }
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Immediate => write!(f, "Immediate"),
            RetryStrategy::Delayed(delay) => f.debug_tuple("Delayed").field(delay).finish(),
            RetryStrategy::AfterRequest {
                request,
                delay,
                on_success,
            } => f
                .debug_struct("AfterRequest")
                .field("request", request)
                .field("delay", delay)
                .field("on_success", &on_success.is_some())
                .finish(),
            RetryStrategy::AfterTask {
                delay, on_error, ..
            } => f
                .debug_struct("AfterTask")
                .field("delay", delay)
                .field("on_error", &on_error.is_some())
                .finish(),
        }
    }
}

/// The resubmission allowance of one in-flight call.
///
/// Created from the request's `max_retries` when the call is dispatched.
/// Exhaustion is checked when a retry directive arrives, before any recovery
/// side effect runs; a unit is recorded only when the request is actually
/// resubmitted, so an abandoned recovery never burns budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    pub(crate) fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// `true` when no resubmissions remain.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Counts one resubmission.
    pub(crate) fn record(&mut self) {
        self.used = self.used.saturating_add(1);
    }

    /// Resubmissions performed so far.
    pub(crate) fn used(&self) -> u32 {
        self.used
    }

    /// The 1-based number of the attempt about to run.
    pub(crate) fn attempt(&self) -> u32 {
        self.used.saturating_add(1)
    }
}
