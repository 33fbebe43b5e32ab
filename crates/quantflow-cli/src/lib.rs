pub mod input;
pub mod output;
pub mod psm;
pub mod runner;
