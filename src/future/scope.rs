//! Future-local storage.
//!
//! A [`Scope`] is an immutable chain of typed values. Futures capture the
//! scope that was installed when they were created (or when a continuation
//! was registered) and re-install it on whichever thread ends up running the
//! producer or continuation, so values attached to a logical call chain
//! survive hops between the background pool and the main executor.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future as StdFuture;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

thread_local! {
  static CURRENT: RefCell<Scope> = RefCell::new(Scope::default());
}

struct Frame {
  value: Arc<dyn Any + Send + Sync>,
  parent: Option<Arc<Frame>>,
}

/// Snapshot of the values attached to the running call chain.
#[derive(Clone, Default)]
pub struct Scope {
  head: Option<Arc<Frame>>,
}

impl Scope {
  /// The scope installed on the calling thread.
  pub fn current() -> Scope {
    CURRENT
      .try_with(|current| current.borrow().clone())
      .unwrap_or_default()
  }

  /// A new scope with `value` layered over this one.
  pub fn with<V: Any + Send + Sync>(&self, value: V) -> Scope {
    Scope {
      head: Some(Arc::new(Frame {
        value: Arc::new(value),
        parent: self.head.clone(),
      })),
    }
  }

  /// Innermost value of type `V`.
  pub fn get<V: Any + Send + Sync>(&self) -> Option<&V> {
    self.values::<V>().next()
  }

  /// All values of type `V`, innermost first.
  pub fn values<V: Any + Send + Sync>(&self) -> impl Iterator<Item = &V> + '_ {
    let mut frame = self.head.as_deref();
    std::iter::from_fn(move || {
      while let Some(current) = frame {
        frame = current.parent.as_deref();
        if let Some(value) = current.value.downcast_ref::<V>() {
          return Some(value);
        }
      }
      None
    })
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  /// Install this scope on the calling thread until the guard is dropped.
  pub fn enter(self) -> ScopeGuard {
    let previous = CURRENT.try_with(|current| current.replace(self)).ok();
    ScopeGuard {
      previous,
      _not_send: PhantomData,
    }
  }

  /// Wrap an async body so every poll runs with this scope installed.
  pub fn instrument<F: StdFuture>(self, body: F) -> Scoped<F> {
    Scoped {
      scope: self,
      body: Box::pin(body),
    }
  }
}

impl std::fmt::Debug for Scope {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut depth = 0;
    let mut frame = self.head.as_deref();
    while let Some(current) = frame {
      depth += 1;
      frame = current.parent.as_deref();
    }
    f.debug_struct("Scope").field("depth", &depth).finish()
  }
}

/// Restores the previously installed scope on drop, including during unwinding.
#[must_use = "the scope is uninstalled as soon as the guard is dropped"]
pub struct ScopeGuard {
  previous: Option<Scope>,
  _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
  fn drop(&mut self) {
    if let Some(previous) = self.previous.take() {
      let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
    }
  }
}

/// Async body bound to a [`Scope`]; see [`Scope::instrument`].
pub struct Scoped<F> {
  scope: Scope,
  body: Pin<Box<F>>,
}

impl<F: StdFuture> StdFuture for Scoped<F> {
  type Output = F::Output;

  fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
    let _guard = self.scope.clone().enter();
    self.body.as_mut().poll(cx)
  }
}
