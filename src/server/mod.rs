//! Listening sockets for the serving modes.

pub mod listener;
