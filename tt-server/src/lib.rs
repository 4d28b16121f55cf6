//! Core of the key/value/table store server: storage abstraction, the
//! logged-mutation facade, the binary command codec, protocol handlers,
//! the worker-pool dispatcher, and master/replica streaming. `main.rs` is
//! a thin binary wrapper over [`app`].

pub mod app;
pub mod cli;
pub mod command;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ext;
pub mod mask;
pub mod pidfile;
pub mod proto;
pub mod replication;
pub mod stats;
