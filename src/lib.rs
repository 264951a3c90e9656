//! # Sourcebook
//!
//! A document compliance and grounded-chat backend.
//!
//! Sourcebook accepts document uploads (PDF, DOCX, plain text, Markdown),
//! runs each upload through an asynchronous sensitive-content scan and a
//! metadata review gate, and makes published documents available as chat
//! grounding: every answer cites the exact passages it quoted, scoped to the
//! documents the session has activated.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────────┐
//! │  Upload  │──▶│ Scan + Review │──▶│ SQLite (FTS5)     │
//! │ PDF/DOCX │   │   pipeline    │   │ docs + passages   │
//! └──────────┘   └───────────────┘   └────────┬─────────┘
//!                                             │
//!                           ┌─────────────────┤
//!                           ▼                 ▼
//!                    ┌────────────┐    ┌────────────┐
//!                    │  Retrieval │───▶│  Chat with │
//!                    │  (scoped)  │    │  citations │
//!                    └────────────┘    └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sbk init                      # create database
//! sbk serve                     # start the HTTP API
//! sbk documents --status published
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`answers`] | Curated golden answers |
//! | [`blob`] | Raw upload storage |
//! | [`extract`] | Page text extraction (PDF, DOCX, text) |
//! | [`passage`] | Page-to-passage splitting |
//! | [`store`] | Document records and version chains |
//! | [`scan`] | Asynchronous sensitive-content scanning |
//! | [`pipeline`] | Upload-to-published lifecycle |
//! | [`context`] | Per-session active source sets |
//! | [`retrieval`] | Scoped passage retrieval and ranking |
//! | [`chat`] | Chat turns and citation composition |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answers;
pub mod blob;
pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod extract;
pub mod migrate;
pub mod models;
pub mod passage;
pub mod pipeline;
pub mod retrieval;
pub mod scan;
pub mod server;
pub mod store;
