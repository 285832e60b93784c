//! # tender-watch
//!
//! Browser-driven discovery of newly published procurement notices.
//!
//! tender-watch fills the filter form of a tender aggregator with keyword
//! phrases or classification codes, walks the paginated results, and keeps
//! only the notices the local notice store has not ingested yet.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ input file │──▶│  partition  │──▶│  workers    │──▶│  dedup   │──▶ output file
//! │ codes / kw │   │  N slices   │   │ fill+collect│   │ (SQLite) │
//! └────────────┘   └─────────────┘   └─────────────┘   └──────────┘
//!                                     one browser
//!                                     session each
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tw init                           # create the notice store schema
//! tw tasks                          # list configured tasks
//! tw run --regime 44                # search, reconcile, append new notices
//! tw run --regime 223 --mode codes --days 3
//! tw reconcile --regime 44 found.txt
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Regimes, search modes, collected records |
//! | [`search_spec`] | Typed filter form |
//! | [`fill`] | Filter-fill engine |
//! | [`tree`] | Nested code tree search |
//! | [`collect`] | Result collector |
//! | [`dedup`] | Dedup reconciler |
//! | [`partition`] | Work partitioner |
//! | [`session`] | Browser session manager |
//! | [`run`] | Run orchestrator |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod collect;
pub mod config;
pub mod db;
pub mod dedup;
pub mod files;
pub mod fill;
pub mod locator;
pub mod migrate;
pub mod models;
pub mod partition;
pub mod progress;
pub mod run;
pub mod search_spec;
pub mod session;
pub mod tree;
pub mod wait;
