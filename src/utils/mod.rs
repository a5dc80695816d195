//! Utility helpers

pub mod autodetect;
