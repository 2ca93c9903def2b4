//! # tenderwatch
//!
//! Finds tender references in a polled feed, deduplicates them against an
//! ingestion ledger, drives each new one through a phased analysis pipeline,
//! and streams progress to any number of clients.
//!
//! Postgres persistence (sqlx), LLM analysis (rig-core), an axum SSE surface,
//! and OpenTelemetry observability.

pub mod analyzer;
pub mod bus;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http;
pub mod ingest;
pub mod model;
pub mod phase;
pub mod store;
pub mod telemetry;
