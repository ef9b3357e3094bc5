//! folio: a mutual-TLS gateway that renders Markdown to PDF through a
//! sandboxed pandoc process.

pub mod application;
pub mod config;
pub mod infra;
