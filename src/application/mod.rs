//! Application services: the render pipeline and the error reporting shared
//! with the HTTP surface.

pub mod error;
pub mod render;
