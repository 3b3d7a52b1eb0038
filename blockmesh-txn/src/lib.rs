#![allow(dead_code)]

mod batch;
mod config;
mod transactor;

pub use config::Config;
pub use transactor::NetworkTransactor;
