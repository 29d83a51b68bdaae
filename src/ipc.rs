//! Background daemon: control socket, accelerometer pipeline, tap dispatch.

mod dispatch;
mod pipeline;
mod runtime;
mod server;

pub use server::{client_request, run_daemon};
