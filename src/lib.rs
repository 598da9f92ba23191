#![warn(missing_docs)]
//! Breadth-first same-site crawler with an idle-terminating worker pool.
//!
//! Starting from one seed URL and a hostname allow-list, the [`Engine`]
//! discovers every reachable page via anchor links, records the link graph in
//! a [`SiteMap`], and stops on its own once the frontier drains and the
//! workers go quiet.

pub mod engine;
pub mod filter;
pub mod frontier;
pub mod html;
pub mod sitemap;

pub use engine::{Engine, EnqueueError, StatsSnapshot};
pub use filter::HostFilter;
pub use frontier::{Frontier, SendRejected, Visit, DEFAULT_FRONTIER_CAPACITY};
pub use html::{stream_links, HtmlStreamError};
pub use sitemap::{SiteMap, ROOT_KEY};
