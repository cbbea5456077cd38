//! Core crate for motionreel: configuration, output sessions, the
//! generation driver and the HTTP front-end.

pub mod config;
pub mod driver;
pub mod encode;
pub mod error;
pub mod logging;
pub mod progress;
pub mod request;
pub mod runtime;
pub mod server;
pub mod service;
pub mod session;
