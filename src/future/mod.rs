//! One-shot futures with combinators and cooperative cancellation.
//!
//! A [`Future`] is completed exactly once through its [`Promise`]. Observers
//! either block ([`Future::wait_for`]), `.await` it, or register callbacks and
//! combinators. Continuations run with the [`Scope`] that was current when
//! they were registered, whatever thread they end up on.
//!
//! # Example
//!
//! ```ignore
//! let doubled = Future::in_background(|| Ok(21)).map(|v| v * 2);
//! assert_eq!(doubled.get()?, 42);
//! ```

mod combinators;
pub mod dispatch;
pub mod scope;

pub use combinators::{accumulate, join, sequence};
pub use dispatch::Dispatch;
pub use scope::Scope;

use std::future::Future as StdFuture;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use crate::error::{Error, Result};

/// Terminal state of a future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
  Success(T),
  Failure(Error),
  Cancelled,
}

impl<T> Outcome<T> {
  pub fn is_success(&self) -> bool {
    matches!(self, Outcome::Success(_))
  }

  pub fn is_failure(&self) -> bool {
    matches!(self, Outcome::Failure(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Outcome::Cancelled)
  }

  pub fn value(&self) -> Option<&T> {
    match self {
      Outcome::Success(value) => Some(value),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&Error> {
    match self {
      Outcome::Failure(error) => Some(error),
      _ => None,
    }
  }

  /// Cancellation maps to [`Error::Cancelled`].
  pub fn into_result(self) -> Result<T> {
    match self {
      Outcome::Success(value) => Ok(value),
      Outcome::Failure(error) => Err(error),
      Outcome::Cancelled => Err(Error::Cancelled),
    }
  }
}

impl<T> From<Result<T>> for Outcome<T> {
  fn from(result: Result<T>) -> Self {
    match result {
      Ok(value) => Outcome::Success(value),
      Err(Error::Cancelled) => Outcome::Cancelled,
      Err(error) => Outcome::Failure(error),
    }
  }
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct State<T> {
  outcome: Option<Outcome<T>>,
  callbacks: Vec<Callback<T>>,
  /// Some thread is running queued callbacks; new ones join the queue.
  delivering: bool,
  wakers: Vec<Waker>,
  cancel_requested: bool,
  cancel_hooks: Vec<CancelHook>,
}

struct Shared<T> {
  state: Mutex<State<T>>,
  completed: Condvar,
}

impl<T: Clone + Send + 'static> Shared<T> {
  fn new() -> Self {
    Self {
      state: Mutex::new(State {
        outcome: None,
        callbacks: Vec::new(),
        delivering: false,
        wakers: Vec::new(),
        cancel_requested: false,
        cancel_hooks: Vec::new(),
      }),
      completed: Condvar::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn complete(&self, outcome: Outcome<T>, method: &'static str) -> Result<()> {
    let wakers = {
      let mut state = self.lock();
      if state.outcome.is_some() {
        return Err(Error::AlreadyCompleted(method));
      }
      state.outcome = Some(outcome.clone());
      state.cancel_hooks.clear();
      state.delivering = true;
      std::mem::take(&mut state.wakers)
    };

    self.completed.notify_all();
    for waker in wakers {
      waker.wake();
    }
    self.deliver(&outcome);
    Ok(())
  }

  /// Run queued callbacks in registration order until the queue is empty.
  /// Callbacks queued meanwhile, from any thread, run in this same loop.
  fn deliver(&self, outcome: &Outcome<T>) {
    loop {
      let batch = {
        let mut state = self.lock();
        if state.callbacks.is_empty() {
          state.delivering = false;
          return;
        }
        std::mem::take(&mut state.callbacks)
      };
      for callback in batch {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
          tracing::error!("future callback panicked");
        }
      }
    }
  }

  /// Run `callback` on completion. If already terminal it runs right away on
  /// the calling thread, unless earlier callbacks are still being delivered,
  /// in which case it is queued behind them.
  fn subscribe(&self, callback: Callback<T>) {
    let mut state = self.lock();
    state.callbacks.push(callback);
    let Some(outcome) = state.outcome.clone() else {
      return;
    };
    if state.delivering {
      return;
    }
    state.delivering = true;
    drop(state);
    self.deliver(&outcome);
  }

  /// Like [`Shared::subscribe`], but an already-terminal future delivers on
  /// the background pool instead of the calling thread.
  fn subscribe_deferred(self: &Arc<Self>, callback: Callback<T>) {
    let mut state = self.lock();
    state.callbacks.push(callback);
    let Some(outcome) = state.outcome.clone() else {
      return;
    };
    if state.delivering {
      return;
    }
    state.delivering = true;
    drop(state);

    let shared = Arc::clone(self);
    let queued = outcome.clone();
    if let Err(e) = dispatch::spawn(Dispatch::Background, move || shared.deliver(&queued)) {
      tracing::warn!(error = %e, "running continuations inline");
      self.deliver(&outcome);
    }
  }

  fn request_cancel(&self) {
    let hooks = {
      let mut state = self.lock();
      if state.outcome.is_some() || state.cancel_requested {
        return;
      }
      state.cancel_requested = true;
      std::mem::take(&mut state.cancel_hooks)
    };
    for hook in hooks {
      hook();
    }
  }

  fn on_cancel(&self, hook: CancelHook) {
    let mut state = self.lock();
    if state.outcome.is_some() {
      return;
    }
    if state.cancel_requested {
      drop(state);
      hook();
    } else {
      state.cancel_hooks.push(hook);
    }
  }
}

/// Write side of a [`Future`].
pub struct Promise<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + 'static> Promise<T> {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared::new()),
    }
  }

  /// The read side completed by this promise.
  pub fn future(&self) -> Future<T> {
    Future {
      shared: Arc::clone(&self.shared),
    }
  }

  pub fn succeed(&self, value: T) -> Result<()> {
    self.shared.complete(Outcome::Success(value), "succeed")
  }

  /// Fail the future. An empty error completes it with
  /// [`Error::InvalidFutureValue`] instead.
  pub fn fail(&self, error: Error) -> Result<()> {
    let error = if error.is_empty() {
      Error::InvalidFutureValue(format!("empty error: {:?}", error))
    } else {
      error
    };
    self.shared.complete(Outcome::Failure(error), "fail")
  }

  /// Acknowledge a cancellation request.
  pub fn cancelled(&self) -> Result<()> {
    self.shared.complete(Outcome::Cancelled, "cancelled")
  }

  pub fn complete(&self, outcome: Outcome<T>) -> Result<()> {
    match outcome {
      Outcome::Success(value) => self.succeed(value),
      Outcome::Failure(error) => self.fail(error),
      Outcome::Cancelled => self.cancelled(),
    }
  }

  pub fn complete_with(&self, result: Result<T>) -> Result<()> {
    self.complete(result.into())
  }

  pub fn is_cancel_requested(&self) -> bool {
    self.shared.lock().cancel_requested
  }

  /// Run `hook` when a consumer cancels. Runs immediately if a request is
  /// already pending; never runs once the future is terminal.
  pub fn on_cancel<F>(&self, hook: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.shared.on_cancel(Box::new(hook));
  }
}

/// Read side of a single-assignment result.
pub struct Future<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<T: std::fmt::Debug + Clone + Send + 'static> std::fmt::Debug for Future<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.shared.lock();
    f.debug_struct("Future")
      .field("outcome", &state.outcome)
      .field("cancel_requested", &state.cancel_requested)
      .finish_non_exhaustive()
  }
}

impl<T: Clone + Send + 'static> Future<T> {
  fn completed(outcome: Outcome<T>) -> Self {
    let promise = Promise::new();
    let _ = promise.complete(outcome);
    promise.future()
  }

  /// An already-successful future.
  pub fn value(value: T) -> Self {
    Self::completed(Outcome::Success(value))
  }

  /// An already-failed future. Empty errors are rejected with
  /// [`Error::InvalidFutureValue`].
  pub fn error(error: Error) -> Self {
    let promise = Promise::new();
    let _ = promise.fail(error);
    promise.future()
  }

  /// A successful future for `Some`, [`Error::InvalidFutureValue`] for `None`.
  pub fn from_option(value: Option<T>) -> Self {
    match value {
      Some(value) => Self::value(value),
      None => Self::error(Error::InvalidFutureValue(
        "future completed without a value".to_string(),
      )),
    }
  }

  pub fn cancelled() -> Self {
    Self::completed(Outcome::Cancelled)
  }

  /// Run `producer` on the given execution class.
  ///
  /// The producer is skipped, and the future cancelled, if cancellation was
  /// requested before it started.
  pub fn run<F>(dispatch: Dispatch, producer: F) -> Self
  where
    F: FnOnce() -> Result<T> + Send + 'static,
  {
    let promise = Promise::new();
    let future = promise.future();
    let scope = Scope::current();
    let worker = promise.clone();

    let scheduled = dispatch::spawn(dispatch, move || {
      if worker.is_cancel_requested() {
        let _ = worker.cancelled();
        return;
      }
      let _guard = scope.enter();
      let result = std::panic::catch_unwind(AssertUnwindSafe(producer)).unwrap_or_else(|_| {
        Err(Error::InvalidFutureValue(
          "producer panicked before returning a value".to_string(),
        ))
      });
      let _ = worker.complete_with(result);
    });

    if let Err(e) = scheduled {
      let _ = promise.fail(e);
    }
    future
  }

  /// Like [`Future::run`] for producers that may come back empty.
  pub fn run_optional<F>(dispatch: Dispatch, producer: F) -> Self
  where
    F: FnOnce() -> Result<Option<T>> + Send + 'static,
  {
    Self::run(dispatch, move || {
      producer()?.ok_or_else(|| {
        Error::InvalidFutureValue("producer returned no value".to_string())
      })
    })
  }

  pub fn in_background<F>(producer: F) -> Self
  where
    F: FnOnce() -> Result<T> + Send + 'static,
  {
    Self::run(Dispatch::Background, producer)
  }

  pub fn on_main_thread<F>(producer: F) -> Self
  where
    F: FnOnce() -> Result<T> + Send + 'static,
  {
    Self::run(Dispatch::Main, producer)
  }

  /// Drive an async body on the background runtime.
  ///
  /// Cancelling the returned future aborts the body at its next await point.
  pub fn spawn<B>(body: B) -> Self
  where
    B: StdFuture<Output = Result<T>> + Send + 'static,
  {
    let promise = Promise::new();
    let future = promise.future();

    let handle = match dispatch::runtime() {
      Ok(handle) => handle,
      Err(e) => {
        let _ = promise.fail(e);
        return future;
      }
    };

    let (body, abort) = futures::future::abortable(Scope::current().instrument(body));
    promise.on_cancel(move || abort.abort());

    handle.spawn(async move {
      let _ = match body.await {
        Ok(result) => promise.complete_with(result),
        Err(futures::future::Aborted) => promise.cancelled(),
      };
    });
    future
  }

  pub fn outcome(&self) -> Option<Outcome<T>> {
    self.shared.lock().outcome.clone()
  }

  /// The success value, if completed successfully.
  pub fn value_now(&self) -> Option<T> {
    match self.outcome() {
      Some(Outcome::Success(value)) => Some(value),
      _ => None,
    }
  }

  /// The error, if completed with one.
  pub fn error_now(&self) -> Option<Error> {
    match self.outcome() {
      Some(Outcome::Failure(error)) => Some(error),
      _ => None,
    }
  }

  pub fn is_completed(&self) -> bool {
    self.shared.lock().outcome.is_some()
  }

  pub fn is_error(&self) -> bool {
    matches!(self.shared.lock().outcome, Some(Outcome::Failure(_)))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.shared.lock().outcome, Some(Outcome::Cancelled))
  }

  /// Block until terminal. Returns `true` on success.
  ///
  /// Must not be called from the execution class expected to complete this
  /// future.
  pub fn wait(&self) -> bool {
    self.wait_outcome().is_success()
  }

  /// Block until terminal and return the result.
  pub fn wait_for(&self) -> Result<T> {
    self.wait_outcome().into_result()
  }

  /// Same as [`Future::wait_for`]; reads better in tests.
  pub fn get(&self) -> Result<T> {
    self.wait_for()
  }

  /// Block for at most `timeout`. `None` if still pending.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
    let state = self.shared.lock();
    let (state, _) = self
      .shared
      .completed
      .wait_timeout_while(state, timeout, |s| s.outcome.is_none())
      .unwrap_or_else(PoisonError::into_inner);
    state.outcome.clone()
  }

  fn wait_outcome(&self) -> Outcome<T> {
    let mut state = self.shared.lock();
    loop {
      if let Some(outcome) = &state.outcome {
        return outcome.clone();
      }
      state = self
        .shared
        .completed
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  /// Ask the producer to stop. Advisory: the future may still complete
  /// normally.
  pub fn cancel(&self) {
    self.shared.request_cancel();
  }

  /// Run `callback` on the main executor if the future succeeds.
  pub fn on_success<F>(&self, callback: F)
  where
    F: FnOnce(T) + Send + 'static,
  {
    self.on_success_or_error(callback, |_| {});
  }

  /// Run `callback` on the main executor if the future fails.
  pub fn on_error<F>(&self, callback: F)
  where
    F: FnOnce(Error) + Send + 'static,
  {
    self.on_success_or_error(|_| {}, callback);
  }

  pub fn on_success_or_error<S, E>(&self, on_success: S, on_error: E)
  where
    S: FnOnce(T) + Send + 'static,
    E: FnOnce(Error) + Send + 'static,
  {
    let scope = Scope::current();
    self.shared.subscribe(Box::new(move |outcome| {
      let outcome = outcome.clone();
      let delivered = dispatch::spawn(Dispatch::Main, move || {
        let _guard = scope.enter();
        match outcome {
          Outcome::Success(value) => on_success(value),
          Outcome::Failure(error) => on_error(error),
          Outcome::Cancelled => {}
        }
      });
      if let Err(e) = delivered {
        tracing::error!(error = %e, "dropping future callback");
      }
    }));
  }

  /// Run `callback` on whichever thread completes the future, or
  /// immediately on the calling thread if it already has.
  pub fn on_completion<F>(&self, callback: F)
  where
    F: FnOnce(&Outcome<T>) + Send + 'static,
  {
    let scope = Scope::current();
    self.shared.subscribe(Box::new(move |outcome| {
      let _guard = scope.enter();
      callback(outcome);
    }));
  }

  /// Schedule `body` after completion. Runs on the completing thread, or on
  /// the background pool when the future is already terminal, so the body
  /// never runs inside the registering call. Bodies registered on one future
  /// run one at a time in registration order either way.
  fn continue_with<F>(&self, body: F)
  where
    F: FnOnce(Outcome<T>) + Send + 'static,
  {
    let scope = Scope::current();
    self.shared.subscribe_deferred(Box::new(move |outcome| {
      let _guard = scope.enter();
      body(outcome.clone());
    }));
  }

  /// A future completed by `body`, forwarding cancellation back to `self`.
  fn derive<U, F>(&self, body: F) -> Future<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(Outcome<T>, Promise<U>) + Send + 'static,
  {
    let promise = Promise::new();
    let derived = promise.future();
    let upstream = self.clone();
    promise.on_cancel(move || upstream.cancel());
    self.continue_with(move |outcome| body(outcome, promise));
    derived
  }

  /// Transform the success value.
  ///
  /// Combinator bodies registered on the same future run one at a time, in
  /// the order they were registered.
  pub fn map<U, F>(&self, f: F) -> Future<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    self.derive(move |outcome, promise| {
      let _ = match outcome {
        Outcome::Success(_) if promise.is_cancel_requested() => promise.cancelled(),
        Outcome::Success(value) => promise.succeed(f(value)),
        Outcome::Failure(error) => promise.fail(error),
        Outcome::Cancelled => promise.cancelled(),
      };
    })
  }

  /// Replace the success value with the result of `f`.
  pub fn map_<U, F>(&self, f: F) -> Future<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce() -> U + Send + 'static,
  {
    self.map(move |_| f())
  }

  /// Discard the value, keeping success or failure.
  pub fn done(&self) -> Future<()> {
    self.map(|_| ())
  }

  /// Chain a dependent future. Cancelling the result cancels whichever of
  /// `self` or the inner future is still running.
  pub fn flat_map<U, F>(&self, f: F) -> Future<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> Future<U> + Send + 'static,
  {
    self.derive(move |outcome, promise| match outcome {
      Outcome::Success(_) if promise.is_cancel_requested() => {
        let _ = promise.cancelled();
      }
      Outcome::Success(value) => adopt(f(value), promise),
      Outcome::Failure(error) => {
        let _ = promise.fail(error);
      }
      Outcome::Cancelled => {
        let _ = promise.cancelled();
      }
    })
  }

  pub fn flat_map_<U, F>(&self, f: F) -> Future<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce() -> Future<U> + Send + 'static,
  {
    self.flat_map(move |_| f())
  }

  /// Attempt to recover from a failure. Returning `None` declines and keeps
  /// the original error.
  pub fn recover<F>(&self, f: F) -> Future<T>
  where
    F: FnOnce(&Error) -> Option<Future<T>> + Send + 'static,
  {
    self.derive(move |outcome, promise| match outcome {
      Outcome::Failure(error) => match f(&error) {
        Some(replacement) => adopt(replacement, promise),
        None => {
          let _ = promise.fail(error);
        }
      },
      other => {
        let _ = promise.complete(other);
      }
    })
  }

  /// Run `f` after completion, whatever the outcome, then pass the outcome on.
  pub fn ensure<F>(&self, f: F) -> Future<T>
  where
    F: FnOnce() + Send + 'static,
  {
    self.derive(move |outcome, promise| {
      f();
      let _ = promise.complete(outcome);
    })
  }

  /// Build a new future from the full outcome.
  pub fn transform<U, F>(&self, f: F) -> Future<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(Outcome<T>) -> Future<U> + Send + 'static,
  {
    self.derive(move |outcome, promise| adopt(f(outcome), promise))
  }

  /// Fail with [`Error::Timeout`] unless `self` completes within `timeout`.
  /// On timeout the source is cancelled.
  pub fn within(&self, timeout: Duration) -> Future<T> {
    let promise = Promise::new();
    let derived = promise.future();
    let upstream = self.clone();
    promise.on_cancel(move || upstream.cancel());

    let forward = promise.clone();
    self
      .shared
      .subscribe(Box::new(move |outcome| {
        let _ = forward.complete(outcome.clone());
      }));

    if derived.is_completed() {
      return derived;
    }

    match dispatch::runtime() {
      Ok(handle) => {
        let source = self.clone();
        let watched = derived.clone();
        handle.spawn(async move {
          tokio::select! {
            _ = tokio::time::sleep(timeout) => {
              if promise.fail(Error::Timeout(timeout)).is_ok() {
                source.cancel();
              }
            }
            _ = watched => {}
          }
        });
      }
      Err(e) => tracing::warn!(error = %e, "timeout not enforced"),
    }
    derived
  }
}

/// Complete `promise` with whatever `inner` completes with, forwarding
/// cancellation to `inner`.
fn adopt<U: Clone + Send + 'static>(inner: Future<U>, promise: Promise<U>) {
  let cancel_inner = inner.clone();
  promise.on_cancel(move || cancel_inner.cancel());
  inner.shared.subscribe(Box::new(move |outcome| {
    let _ = promise.complete(outcome.clone());
  }));
}

impl<T: Clone + Send + 'static> StdFuture for Future<T> {
  type Output = Result<T>;

  fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
    let mut state = self.shared.lock();
    if let Some(outcome) = &state.outcome {
      return Poll::Ready(outcome.clone().into_result());
    }
    if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
      state.wakers.push(cx.waker().clone());
    }
    Poll::Pending
  }
}
