//! # Tributary
//!
//! Relays image-board threads, catalog searches and subreddits into chat
//! feeds, with media deduplication and per-destination rate limiting.
//!
//! ## Architecture
//!
//! ```text
//! Vendor → Scheduler → Mediator → DeliveryRouter → chat platform
//!               │
//!             Store ◀── Controller ◀── CLI
//! ```
//!
//! One scheduler loop runs per feed. Each refresh streams updates from a
//! vendor, mediates their media concurrently, then delivers them in order
//! and persists the vendor cursor after every delivered update.
//!
//! ## Quick Start
//!
//! ```bash
//! # Subscribe a channel to a thread
//! tributary subscribe @mychannel https://boards.4chan.org/g/thread/42
//!
//! # Subscribe to a subreddit, top posts
//! tributary subscribe @mychannel r/rust -o sort=top
//!
//! # Run the service
//! tributary run
//! ```

/// Application context and error handling.
///
/// The [`AppContext`](app::AppContext) struct wires together all components.
pub mod app;

/// Command-line interface using clap.
pub mod cli;

/// TOML configuration, loaded from `~/.config/tributary/config.toml`.
pub mod config;

/// State controller: subscribe, suspend, resume, delete, clear and list.
pub mod controller;

/// Rate-limited delivery to the chat platform.
///
/// - [`ChatPlatform`](delivery::ChatPlatform): Async trait for platform calls
/// - [`DeliveryRouter`](delivery::DeliveryRouter): Throttling and retry-after handling
/// - [`TelegramPlatform`](delivery::telegram::TelegramPlatform): Bot API implementation
pub mod delivery;

/// Core domain models: ids, subscription headers, media references.
pub mod domain;

/// Media preparation: resolve, deduplicate, convert and buffer.
pub mod mediator;

/// Per-feed refresh loops.
pub mod scheduler;

/// SQLite persistence layer.
///
/// - [`Store`](store::Store): Trait defining storage operations
/// - [`SqliteStore`](store::SqliteStore): SQLite implementation
pub mod store;

/// Content sources.
///
/// - [`Vendor`](vendor::Vendor): Async trait for sources
/// - [`ImageboardVendor`](vendor::imageboard::ImageboardVendor): Threads and catalog searches
/// - [`SubredditVendor`](vendor::subreddit::SubredditVendor): Subreddit listings
pub mod vendor;
