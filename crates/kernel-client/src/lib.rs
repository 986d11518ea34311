//! kernel-client - Talk to Jupyter kernels through a Jupyter server.
//!
//! This crate is the client half of the Jupyter server's kernel APIs:
//!
//! - [`settings`] / [`server`]: where the server is and how to authenticate
//! - [`kernel`]: one WebSocket connection per kernel, request correlation
//!   through [`future::KernelFuture`], reconnects, kernel status
//! - [`comm`]: comm sub-channels over a kernel connection
//! - [`session`], [`kernelspec`], [`kernel_manager`]: the REST endpoints and
//!   polled catalogs built on them
//!
//! Everything is driven by tokio. A [`kernel::KernelConnection`] runs one
//! background task; managers run one [`poll::Poll`] task each.

pub mod catalog;
pub mod comm;
pub mod error;
pub mod future;
pub mod kernel;
pub mod kernel_manager;
pub mod kernelspec;
pub mod poll;
pub mod server;
pub mod session;
pub mod settings;
pub mod transport;

#[cfg(test)]
mod testing;

pub use catalog::ManagerEvent;
pub use comm::{Comm, CommCallbacks, CommEvent, CommOpen};
pub use error::{ClientError, ResponseError, Result};
pub use future::{FutureEvent, KernelFuture};
pub use kernel::{
    ConnectionStatus, ExecuteRequest, KernelConnection, KernelConnectionOptions, KernelEvent,
    KernelStatus,
};
pub use kernel_manager::{KernelManager, KernelManagerOptions, KernelModel};
pub use kernelspec::{KernelSpecManager, KernelSpecManagerOptions, KernelSpecModel, KernelSpecs};
pub use poll::{Backoff, Poll, Standby, Visibility};
pub use server::{RequestInit, ServerConnection};
pub use session::{
    KernelRequest, SessionConnection, SessionCreate, SessionManager, SessionManagerOptions,
    SessionModel,
};
pub use settings::{ServerSettings, SettingsOptions};
