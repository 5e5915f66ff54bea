//! Aggregate combinators over collections of futures.

use std::sync::{Arc, Mutex, PoisonError};

use super::{Future, Outcome, Promise};

/// Resolve to every value in input order, failing on the first error.
///
/// Cancelling the result cancels all inputs.
pub fn sequence<T>(futures: Vec<Future<T>>) -> Future<Vec<T>>
where
  T: Clone + Send + 'static,
{
  if futures.is_empty() {
    return Future::value(Vec::new());
  }

  let promise = Promise::new();
  let result = promise.future();
  forward_cancel(&promise, &futures);

  let slots = Arc::new(Mutex::new(Slots::new(futures.len())));
  for (index, future) in futures.iter().enumerate() {
    let promise = promise.clone();
    let slots = Arc::clone(&slots);
    future.on_completion(move |outcome| match outcome {
      Outcome::Success(value) => {
        let finished = slots
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .fill(index, value.clone());
        if let Some(values) = finished {
          let _ = promise.succeed(values);
        }
      }
      Outcome::Failure(error) => {
        let _ = promise.fail(error.clone());
      }
      Outcome::Cancelled => {
        let _ = promise.cancelled();
      }
    });
  }
  result
}

/// Resolve once every input is terminal, carrying each outcome in input order.
pub fn join<T>(futures: Vec<Future<T>>) -> Future<Vec<Outcome<T>>>
where
  T: Clone + Send + 'static,
{
  if futures.is_empty() {
    return Future::value(Vec::new());
  }

  let promise = Promise::new();
  let result = promise.future();
  forward_cancel(&promise, &futures);

  let slots = Arc::new(Mutex::new(Slots::new(futures.len())));
  for (index, future) in futures.iter().enumerate() {
    let promise = promise.clone();
    let slots = Arc::clone(&slots);
    future.on_completion(move |outcome| {
      let finished = slots
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .fill(index, outcome.clone());
      if let Some(outcomes) = finished {
        let _ = promise.succeed(outcomes);
      }
    });
  }
  result
}

/// Fold successful values left to right, stopping at the first error.
pub fn accumulate<T, A, F>(futures: Vec<Future<T>>, seed: A, f: F) -> Future<A>
where
  T: Clone + Send + 'static,
  A: Clone + Send + 'static,
  F: Fn(A, T) -> A + Send + Sync + 'static,
{
  let f = Arc::new(f);
  futures
    .into_iter()
    .fold(Future::value(seed), |acc, next| {
      let f = Arc::clone(&f);
      acc.flat_map(move |sum| next.map(move |value| f(sum, value)))
    })
}

fn forward_cancel<T, U>(promise: &Promise<U>, inputs: &[Future<T>])
where
  T: Clone + Send + 'static,
  U: Clone + Send + 'static,
{
  let inputs = inputs.to_vec();
  promise.on_cancel(move || {
    for input in inputs {
      input.cancel();
    }
  });
}

struct Slots<V> {
  values: Vec<Option<V>>,
  remaining: usize,
}

impl<V> Slots<V> {
  fn new(len: usize) -> Self {
    Self {
      values: (0..len).map(|_| None).collect(),
      remaining: len,
    }
  }

  /// Store a value; returns everything once the last slot is filled.
  fn fill(&mut self, index: usize, value: V) -> Option<Vec<V>> {
    if self.values[index].replace(value).is_none() {
      self.remaining -= 1;
    }
    if self.remaining == 0 {
      Some(self.values.iter_mut().filter_map(Option::take).collect())
    } else {
      None
    }
  }
}
