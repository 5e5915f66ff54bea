//! Client runtime for the Fauna REST API.
//!
//! - [`future`]: one-shot futures with combinators, cancellation and
//!   background/main dispatch
//! - [`context`]: scoped contexts carrying identity, configuration and cache
//! - [`cache`]: persistent response cache that picks between cached, live and
//!   stale data based on network reachability
//!
//! ```ignore
//! let ctx = fauna::Context::with_key(&secret)?;
//! let user = ctx.in_context(|| fauna::get_resource("users/self")).get()?;
//! ```

pub mod cache;
pub mod client;
pub mod context;
pub mod db;
pub mod error;
pub mod future;

pub use client::{
  ApiClient, Credentials, HttpClient, Method, Params, Reachability, Response, API_BASE_URL,
};
pub use context::{
  add_to_set, delete, delete_resource, get, get_creates_page, get_events_page, get_resource,
  get_updates_page, post, post_resource, put, put_resource, remove_from_set, Context,
  ContextBuilder, ContextConfig,
};
pub use error::{Error, Result};
pub use future::{accumulate, join, sequence, Dispatch, Future, Outcome, Promise, Scope};
