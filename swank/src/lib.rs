//! SWANK client for driving a Common Lisp image.
//!
//! Supervises a Lisp process, connects to its SWANK server, and correlates
//! `:emacs-rex` requests with their `:return` replies. The host owns a
//! [`SwankClient`] and drains [`SessionNotification`]s from its own loop.

pub mod codec;
pub mod message;
pub mod sexpr;
pub mod types;

pub(crate) mod connect;
pub(crate) mod correlator;
pub(crate) mod listener;
pub(crate) mod process;
pub(crate) mod protocol;
pub(crate) mod stop;

mod client;

pub use client::{SessionError, SwankClient};
pub use codec::{DecodeError, EncodeError, FrameReader, FrameWriter, encode};
pub use connect::ConnectError;
pub use message::{DebugEntry, MessageError, ReturnStatus, WireMessage};
pub use process::LaunchError;
pub use sexpr::{Sexpr, SexprError};
pub use types::{
    ConnectionState, EvalOutput, ProcessState, SessionNotification, SwankConfig, ThreadTag,
};
