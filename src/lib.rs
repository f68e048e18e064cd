//! Core library for the rowmirror command line application.
//!
//! A workbook sheet is the primary store for fixed-schema records and an
//! optional relational table mirrors it. File access lives under [`io`],
//! the record layout in [`model`] and [`codec`], the database side in
//! [`mirror`], and the orchestration between both in [`sync`]. Retry and
//! timeout handling is shared through [`resilience`].

pub mod backup;
pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod mirror;
pub mod model;
pub mod monitor;
pub mod resilience;
pub mod sync;

pub use error::{ErrorKind, Result, StoreError};
