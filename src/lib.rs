#![deny(unused_must_use)]

pub mod cancel;
pub mod chunk;
pub mod error;
pub mod geometry;
pub mod index;
pub mod kdtree;
pub mod query;
pub mod store;

pub use nalgebra;
