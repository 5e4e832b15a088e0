//! Real-time collaborative canvas engine.
//!
//! SYSTEM CONTEXT
//! ==============
//! Clients connect over a websocket per canvas. The session registry keeps
//! one authoritative in-memory document per live canvas, fans edits out to
//! every other connected participant, and autosaves through the persistence
//! gateway until the last participant leaves.

pub mod config;
pub mod db;
pub mod document;
pub mod message;
pub mod routes;
pub mod services;
pub mod state;
