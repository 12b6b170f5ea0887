//! Natural-language questions in, checked and executed DuckDB SQL out.
//!
//! A question flows through retrieval (narrowing the schema context), generation,
//! review, compliance and execution. See [`pipeline`] for the stage contract and
//! [`assistant::Assistant`] for the entry point used by the CLI and the HTTP API.

pub mod assistant;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod util;
pub mod web;
