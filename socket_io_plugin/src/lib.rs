#![forbid(unsafe_code)]
extern crate engine_io;
extern crate socket_io;
extern crate warp;

pub mod adapter;
pub mod facade;
pub mod handler;
pub mod plugin;
pub mod router;

pub use handler::SocketIoHandler;
pub use plugin::{SocketIoPlugin, DEFAULT_MOUNT_PATH};
