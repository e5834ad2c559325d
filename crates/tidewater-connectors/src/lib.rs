//! # Tidewater Connectors
//!
//! Source-side machinery of a migration job item:
//!
//! ```text
//!   DialectRegistry ──► Dialect { query builder, column reader, positions }
//!                             │
//!   split_inventory_positions ┤
//!                             ▼
//!   InventoryDumper ──► channel ──► ... ──► IncrementalDumper ──► channel
//! ```
//!
//! - [`dialect`]: per-database query text, value reading and log positions
//! - [`position`]: inventory splitting and incremental position managers
//! - [`inventory`]: paged full-table snapshot dumper
//! - [`incremental`]: change-log dumper
//! - [`lifecycle`]: start/stop state shared by dumpers and their owners
//! - [`testing`]: in-memory sources
//!
//! The `postgres` feature adds a pooled `tokio-postgres` source.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dialect;
pub mod incremental;
pub mod inventory;
pub mod lifecycle;
pub mod position;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod testing;

pub use dialect::{Dialect, DialectRegistry, InventoryQueryBuilder};
pub use incremental::{IncrementalDumper, IncrementalDumperConfig, LogEventSource};
pub use inventory::{InventoryDumper, InventoryDumperConfig};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use position::{destroy_best_effort, split_inventory_positions, IncrementalPositionManager};
