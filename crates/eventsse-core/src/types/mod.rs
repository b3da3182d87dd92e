//! Core types for eventsse.

mod event;

pub use event::*;
