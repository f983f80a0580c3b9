pub mod constants;
pub mod effects;
pub mod grid;
pub mod pattern;
