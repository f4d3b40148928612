//! Subvenia - Spanish grants registry ingestion and semantic search.
//!
//! An ingestion pipeline that turns the public grants registry (HTTP JSON
//! API plus linked PDF documents) into a queryable, semantically searchable
//! database. Grants move through four stages - fetch, pdf, llm, embed -
//! tracked per item in a staging table with idempotent, retry-safe
//! transitions.

pub mod api;
pub mod cli;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod services;
pub mod storage;
