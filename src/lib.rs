//! Resolve atomistic datasets by name, download and verify their files, run
//! their processing chains and cache the resulting structures.

pub mod api;
pub mod archive;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod error;
pub mod extxyz;
pub mod fetch;
pub mod metadata;
pub mod output;
pub mod processing;
pub mod progress;
pub mod storage;
pub mod store;
pub mod structure;

pub use api::{DatasetInput, Loader};
pub use error::LoadAtomsError;
pub use storage::Dataset;
pub use structure::Structure;
