#![doc = include_str!("../README.md")]

pub mod admission;
pub mod catalogue;
pub mod config;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod fifo;
pub mod interrupt;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod runner;
pub mod scope;
pub mod sequencer;
pub mod server;
pub mod timeline;
pub mod trace;
pub mod workload;

pub use error::{Error, ErrorKind, Result};
