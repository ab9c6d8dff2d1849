// src/db/models/mod.rs

//! Data models for the cluster database.
//!
//! Each model owns its CRUD against a connection; multi-model sequences
//! are composed by callers inside `db::transaction`.

mod alias;
mod image;
mod member;
mod pool;
mod profile;
mod project;

pub use alias::ImageAlias;
pub use image::{Image, ImageFilter, ImageSource};
pub use member::Member;
pub use pool::{split_volume, StoragePool, REMOTE_DRIVERS};
pub use profile::Profile;
pub use project::{Project, DEFAULT_PROJECT};
