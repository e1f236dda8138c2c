//! Core engine components

pub mod checkpoint;
pub mod executor;
pub mod graph;
pub mod interrupt;
pub mod retry;
pub mod state;
