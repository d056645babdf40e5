//! Headmail Storage - Relational store, repositories and the durable queue
//!
//! This crate provides the PostgreSQL-backed store for Headmail. Repository
//! methods take a [`Scope`] which either autocommits against the pool or is
//! bound to a shared transaction, so services can compose multi-repository
//! work atomically.

pub mod db;
pub mod models;
pub mod repository;

pub use db::{Scope, Store};
pub use models::*;
pub use repository::*;

pub use sqlx::types::Json;
