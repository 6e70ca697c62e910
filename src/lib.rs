//! Prometheus exporter for GraphQL query results.
//!
//! Periodically issues configured GraphQL queries, extracts numeric
//! values and dimensional labels from the nested JSON responses via
//! declarative paths, and exposes them as Prometheus metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │ GraphQL endpoint │────>│    Collector     │────>│  HTTP /metrics  │
//! │ (templated POST) │     │ (TTL cache +     │     │   or gateway    │
//! └──────────────────┘     │  path extractor) │     │      push       │
//!                          └──────────────────┘     └─────────────────┘
//! ```
//!
//! Scrapes never block on the network: the collector serves cached
//! vectors and triggers at most one background refresh once the cache
//! ages past `cacheExpire`. Samples are stamped with each query's
//! `previousRun` so a TSDB can align them with the interval the data
//! describes.
//!
//! See [`config::Config`] for configuration options.

pub mod collector;
pub mod config;
pub mod extract;
pub mod graphql;
pub mod http;
pub mod mapping;
pub mod push;

pub use collector::GraphqlCollector;
pub use config::Config;
pub use extract::Extractor;
pub use graphql::{GraphqlTransport, HttpTransport};
pub use http::HttpServer;
pub use push::Pusher;
