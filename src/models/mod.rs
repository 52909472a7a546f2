//! Core data models for the image upload service.
//!
//! Stored images have no database row: the file system is the only record,
//! so these types describe requests, responses and committed files.

pub mod image;
pub mod upload;
