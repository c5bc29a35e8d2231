//! A holonic agent runtime: a tree of token-budgeted agents driven by a
//! single scheduler ("the Heart"). Each tick, the scheduler gathers every
//! due agent's HUD (purpose, self-state, available actions) into one AI
//! request, and dispatches the structured reply back into the tree as
//! actions — built-ins (`knowledge_set`, `create_child`, `send_message`,
//! `sleep`, …) plus anything an embedding application registers.
//!
//! Agents reference each other only by [`uuid::Uuid`] (see
//! `crate::agent` for why), never by pointer, so the tree survives
//! arbitrary cyclic references and persists cleanly to SQLite
//! (`crate::storage`). A small HTTP surface (`crate::http`) exposes a live
//! tree for inspection and manual control through a distinguished
//! interface agent.

pub mod action;
pub mod agent;
pub mod binding;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod hud;
pub mod logging;
pub mod path;
pub mod providers;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod tokens;
