//! Core types and trait definitions for the restaurant grades store.
//!
//! This crate is free of database and runtime dependencies. It holds the
//! domain model, the name normalizer, the pure grade-transition fold, search
//! validation, cache keys, and the [`store::InspectionStore`] trait.

// Native `async fn` in traits; futures are declared `Send` explicitly.
#![allow(async_fn_in_trait)]

pub mod detect;
pub mod error;
pub mod event;
pub mod grade;
pub mod inspection;
pub mod invalidation;
pub mod normalize;
pub mod query;
pub mod store;
pub mod user;

pub use error::{Error, ErrorKind, Result};
