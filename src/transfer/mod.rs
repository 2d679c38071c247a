//! The block-level transfer engine.
//!
//! `plan` computes the partition of a payload into service blocks; `upload`
//! and `download` drive a plan across bounded concurrent workers; `pipeline`
//! overlaps filesystem I/O with transfers for large local copies.

pub mod plan;

pub(crate) mod download;
pub(crate) mod pipeline;
pub(crate) mod upload;
