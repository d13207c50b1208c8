//! Core of the eam automation server.
//!
//! An [`operator::Operator`] binds engine handles to one configured tasker and
//! runs its task list. Operators live in the [`registry::OperatorRegistry`];
//! the [`controller::SessionController`] turns client messages into lifecycle
//! calls and reports back through a [`controller::Broadcaster`].

pub mod adb;
pub mod config;
pub mod controller;
pub mod custom;
pub mod engine;
pub mod error;
pub mod message;
pub mod operator;
pub mod registry;

pub use controller::{Broadcaster, ConnectionId, SessionController};
pub use error::{ConfigError, EngineError, OperatorError, ProtocolError};
pub use message::{Message, MessageKind, Status};
pub use operator::{Operator, OperatorEnv, OperatorState, RunOutcome};
pub use registry::OperatorRegistry;
