//! Execution classes for producers and callbacks.
//!
//! Background work runs on a crate-owned multi-thread tokio runtime. Main work
//! runs on a single `fauna-main` thread in FIFO order, unless the host
//! application installs its own main dispatcher (for example one that posts to
//! a UI event loop).

use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Where a producer or callback is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
  /// Blocking pool of the background runtime
  Background,
  /// The designated main executor
  Main,
}

/// Unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send>;

type MainDispatcher = Arc<dyn Fn(Job) + Send + Sync>;

static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();
static MAIN_QUEUE: OnceLock<std::result::Result<mpsc::UnboundedSender<Job>, String>> =
  OnceLock::new();
static MAIN_DISPATCHER: RwLock<Option<MainDispatcher>> = RwLock::new(None);

thread_local! {
  static ON_MAIN: Cell<bool> = const { Cell::new(false) };
}

/// Handle to the background runtime, starting it on first use.
pub fn runtime() -> Result<Handle> {
  RUNTIME
    .get_or_init(|| {
      Builder::new_multi_thread()
        .thread_name("fauna-background")
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start background runtime: {}", e))
    })
    .as_ref()
    .map(|rt| rt.handle().clone())
    .map_err(|e| Error::Dispatch(e.clone()))
}

/// Route main-class work through `dispatcher` instead of the built-in thread.
///
/// The dispatcher must run jobs one at a time in the order received.
pub fn set_main_dispatcher<F>(dispatcher: F)
where
  F: Fn(Job) + Send + Sync + 'static,
{
  let mut slot = MAIN_DISPATCHER
    .write()
    .unwrap_or_else(PoisonError::into_inner);
  *slot = Some(Arc::new(dispatcher));
}

/// Go back to the built-in `fauna-main` thread.
pub fn clear_main_dispatcher() {
  let mut slot = MAIN_DISPATCHER
    .write()
    .unwrap_or_else(PoisonError::into_inner);
  *slot = None;
}

/// Whether the calling code is running as a main-class job.
pub fn is_main() -> bool {
  ON_MAIN.with(Cell::get)
}

/// Schedule `job` on the given execution class.
pub fn spawn<F>(dispatch: Dispatch, job: F) -> Result<()>
where
  F: FnOnce() + Send + 'static,
{
  match dispatch {
    Dispatch::Background => {
      runtime()?.spawn_blocking(job);
      Ok(())
    }
    Dispatch::Main => spawn_main(Box::new(job)),
  }
}

fn spawn_main(job: Job) -> Result<()> {
  let custom = MAIN_DISPATCHER
    .read()
    .unwrap_or_else(PoisonError::into_inner)
    .clone();

  let job: Job = Box::new(move || run_as_main(job));
  if let Some(dispatcher) = custom {
    dispatcher(job);
    return Ok(());
  }

  main_queue()?
    .send(job)
    .map_err(|_| Error::Dispatch("main executor has stopped".to_string()))
}

fn run_as_main(job: Job) {
  let was_main = ON_MAIN.with(|flag| flag.replace(true));
  if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
    tracing::error!("main dispatch job panicked");
  }
  ON_MAIN.with(|flag| flag.set(was_main));
}

fn main_queue() -> Result<&'static mpsc::UnboundedSender<Job>> {
  MAIN_QUEUE
    .get_or_init(|| {
      let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
      std::thread::Builder::new()
        .name("fauna-main".to_string())
        .spawn(move || {
          while let Some(job) = rx.blocking_recv() {
            job();
          }
        })
        .map(|_| tx)
        .map_err(|e| format!("failed to start main executor: {}", e))
    })
    .as_ref()
    .map_err(|e| Error::Dispatch(e.clone()))
}
