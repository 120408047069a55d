//! Execgate - An HTTP adapter that hands every request to a backend process
//!
//! This library provides a cloud-function style request adapter that:
//! - Answers cross-origin preflight requests locally
//! - Serializes every other request into a JSON event
//! - Runs a configured executable with the event as its last argument
//! - Turns the executable's exit status and output into an HTTP response
//! - Serves the adapter over HTTP/1.1 and HTTP/2, optionally with TLS

pub mod admin;
pub mod backend;
pub mod config;
pub mod event;
pub mod handler;
pub mod response;
pub mod server;
