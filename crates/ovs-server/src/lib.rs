//! Axum HTTP surface for the Overseer control plane.
//!
//! `routes::build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are thin: open a transaction, call
//! into the core crates, commit, map the result.

pub mod api_types;
pub mod error;
pub mod routes;
pub mod state;
pub mod trace;
