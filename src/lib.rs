//! # PDM Assist
//!
//! A server-rendered web application for searching, enriching, and
//! validating industrial material records (product data model) with AI
//! web-search APIs and an external workflow backend (n8n webhooks).
//!
//! ## Architecture
//!
//! ```text
//!  browser ──HTML/forms──▶ ┌──────────────┐
//!  client  ──JSON /api──▶  │ axum server  │── auth (sessions, SQLite)
//!                          │              │── feedback (SQLite)
//!                          └──────┬───────┘
//!              ┌──────────────────┼────────────────────┐
//!              ▼                  ▼                    ▼
//!        ai (Perplexity /   webhook (enrich,     pivot (SQL builder)
//!        OpenAI-compatible) search, transcribe,       │
//!              │            report)  ◀────────────────┘
//!              ▼
//!        markdown (table extraction) ─▶ materials / validate
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pdm init                                  # create database
//! echo "s3cret-pass" | pdm user add ana@example.com
//! export PDM_SESSION_SECRET=... PERPLEXITY_API_KEY=...
//! pdm serve                                 # start the web app
//! pdm search "EPDM 70 shore seal"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | HTTP error type and JSON error contract |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`models`] | Core data types |
//! | [`auth`] | Accounts, password hashing, signed sessions |
//! | [`markdown`] | Table extraction from LLM answers |
//! | [`pivot`] | Pivot SQL construction and grid assembly |
//! | [`ai`] | AI search providers |
//! | [`prompt`] | Prompt construction with rated examples |
//! | [`feedback`] | Ratings and example selection |
//! | [`webhook`] | Workflow (n8n) client |
//! | [`context`] | Shared handles for commands and handlers |
//! | [`materials`] | Material search, equivalences, enrichment |
//! | [`validate`] | Row validation against web sources |
//! | [`ui`] | HTML rendering |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command implementations |

pub mod ai;
pub mod auth;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod feedback;
pub mod markdown;
pub mod materials;
pub mod migrate;
pub mod models;
pub mod pivot;
pub mod prompt;
pub mod server;
pub mod ui;
pub mod validate;
pub mod webhook;
