#![forbid(unsafe_code)]
extern crate engine_io_parser;

pub mod server;
pub mod socket;
pub mod transport;
pub mod util;
