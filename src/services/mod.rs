//! Collaboration engine services.
//!
//! ARCHITECTURE
//! ============
//! - `registry`: one control loop that owns the canvas → session directory
//!   and all fan-out
//! - `session`: the authoritative document of one live canvas and its
//!   autosave task
//! - `participant`: the reader/writer loops of one connection
//! - `store`: the persistence gateway the sessions and routes go through
//!
//! Route handlers stay focused on protocol translation and auth plumbing.

pub mod participant;
pub mod registry;
pub mod session;
pub mod store;
