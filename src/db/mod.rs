//! Database module for Vantage.
//!
//! Provides SQLite storage with embedded migrations behind the `TargetStore` trait.

mod models;
mod store;

pub use models::*;
pub use store::*;
