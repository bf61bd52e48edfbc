//! Query Module
//!
//! Consumer-facing bindings on top of the fetch coordinator: a single-key
//! data binding and a paginated list accumulator.

mod binding;
mod list;

pub use binding::{QueryBinding, QueryOptions, QueryState, QueryStatus, Selector};
pub use list::{page_fetcher, ListBinding, ListOptions, ListState, Page, PageFetcher, PageRequest};
