//! Execution of traced graphs against a backend and a parameter store.

mod feeds;
mod param_store;
mod session;

pub use feeds::{Feed, Feeds};
pub use param_store::{InMemoryParamStore, ParamStore};
pub use session::{Outputs, Session, SessionOptions, DEFAULT_PLAN_CACHE_CAPACITY};
