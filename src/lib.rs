//! AI coding tutor backend.
//!
//! - Task store over challenge packs, flat task files or SQLite
//! - Virtual-DOM evaluation sandbox for HTML/CSS/JS submissions
//! - LLM tutor with a JSON action protocol and a headless host
//! - Themed task variants
//! - Axum HTTP API under `/api`

pub mod config;
pub mod domain;
pub mod error;
pub mod llm;
pub mod mastery;
pub mod protocol;
pub mod routes;
pub mod sandbox;
pub mod state;
pub mod tasks;
pub mod telemetry;
pub mod tutor;
pub mod util;
pub mod variants;
