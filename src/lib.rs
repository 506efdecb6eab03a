//! # Atlas
//!
//! Core of a personal content archive: a stage ledger that records every
//! transition a content item makes through its lifecycle, a coordinator
//! that routes items to phase handlers, and an ad-stripping cleaner that
//! writes versioned, auditable clean copies next to untouched originals.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Originals  │──▶│   Cleaner    │──▶│ Clean tree  │
//! │ (read-only)│   │ detect+strip │   │ + records   │
//! └────────────┘   └──────┬───────┘   └─────────────┘
//!                         │ medium-confidence removals
//!                         ▼
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │Coordinator │──▶│    Ledger    │   │Review queue │
//! │ + handlers │   │ (SQLite log) │   │ + reports   │
//! └────────────┘   └──────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! atlas init
//! atlas scan episode.txt --type podcast
//! atlas batch ./archive/podcasts --type podcast
//! atlas queue
//! atlas advance podcast-42 --source ./archive/ep42.txt --drive
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`stage`] | Numeric stage taxonomy |
//! | [`ledger`] | Append-only transition log |
//! | [`coordinator`] | Phase handler registry and stage advancement |
//! | [`handlers`] | Built-in phase handlers |
//! | [`ads`] | Ad detection engine |
//! | [`clean`] | Cleaning orchestrator and quality scoring |
//! | [`versioned`] | Versioned, non-destructive cleaning |
//! | [`audit`] | Per-item removal records |
//! | [`review`] | Review queue, false positives, weekly reports |
//! | [`stats`] | Archive statistics |
//! | [`progress`] | Batch progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Typed errors |

pub mod ads;
pub mod audit;
pub mod clean;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod review;
pub mod stage;
pub mod stats;
pub mod versioned;
