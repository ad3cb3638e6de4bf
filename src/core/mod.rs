pub mod config;
pub mod dna;
pub mod error;
pub mod io;
pub mod phase;
pub mod seed;
pub mod slots;
pub mod state;
