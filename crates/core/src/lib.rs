//! `csvforge-core`: identifiers and references shared by every csvforge crate.
//!
//! This crate has no knowledge of scheduling or storage; it only defines the
//! vocabulary the other crates exchange.

pub mod artifact;
pub mod error;
pub mod id;

pub use artifact::ArtifactRef;
pub use error::{CoreError, CoreResult};
pub use id::{ClientId, JobId};
