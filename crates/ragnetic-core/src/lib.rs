//! # Ragnetic Core
//!
//! Pure logic for Ragnetic: data models, error kinds, chunking, BM25
//! scoring, reciprocal rank fusion, and vector math.
//!
//! This crate contains no tokio, network clients, or filesystem I/O.
//! Everything that talks to a model, an index, or storage lives in the
//! `ragnetic` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod lexical;
pub mod models;

pub use error::{RagError, Result};
