//! texshot: typeset LaTeX sources with an external toolchain and answer with
//! the first page as a PNG.

pub mod application;
pub mod config;
pub mod infra;
