//! ReliefNet - real-time incident coordination for disaster relief.
//!
//! # Overview
//!
//! Victims report incidents, volunteers attach to them, and everyone on an
//! incident shares a live room for chat, positions and quick alerts. The
//! service keeps "who is assigned to what" consistent under concurrent
//! requests:
//!
//! - A volunteer is on at most one unresolved incident at a time.
//! - An incident with nobody left on it is resolved.
//! - Each user's assigned incident is derived from membership.
//!
//! # Modules
//!
//! - [`model`]: Incidents, reports, chat messages, users and wire DTOs
//! - [`storage`]: SQLite storage layer
//! - [`assignment`]: Assignment state machine
//! - [`rooms`]: In-memory room registry for live sessions
//! - [`locks`]: Keyed async locks for per-user and per-incident ordering
//! - [`realtime`]: Websocket events and the broadcast dispatcher
//! - [`identity`]: Credential resolution and the HTTP auth extractor
//! - [`api`]: HTTP API handlers and router

pub mod api;
pub mod assignment;
pub mod config;
pub mod error;
pub mod geo;
pub mod identity;
pub mod locks;
pub mod model;
pub mod realtime;
pub mod rooms;
pub mod storage;
