//! Multi-user file-sharing server: a supervisor process that forks one
//! confined worker per client and brokers file transfers between them.
pub mod admin;
pub mod arena;
pub mod broker;
pub mod copy;
pub mod errors;
pub mod log;
pub mod privileges;
pub mod supervisor;
pub mod users;
pub mod worker;

pub use errors::*;
pub use privileges::Privileges;
pub use supervisor::{Role, Supervisor};
pub use worker::WorkerSeed;
