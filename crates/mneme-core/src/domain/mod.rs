//! Domain layer for Mneme

pub mod knowledge;
