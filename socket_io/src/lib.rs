#![forbid(unsafe_code)]
extern crate engine_io;

pub mod error;
pub mod namespace;
pub mod packet;
pub mod server;
pub mod socket;
