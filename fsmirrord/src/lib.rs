pub mod daemon;
pub mod mirror;
