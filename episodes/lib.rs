#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod enrich;
pub mod loader;
pub mod records;
pub mod segment;
pub mod store;
mod tally;

#[path = "../evaluate/mod.rs"]
pub mod evaluate;

#[path = "../shared/config.rs"]
pub mod config;
