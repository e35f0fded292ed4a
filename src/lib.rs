//! Embeddable LDAPv3 server core.
//!
//! This crate owns connection lifecycle, per-connection dispatch, Abandon
//! and graceful shutdown (RFC 4511). It does not implement any LDAP
//! operation itself — an embedder supplies a [`Handler`] per connection and
//! this crate takes care of framing, concurrent request dispatch,
//! cancellation, and clean teardown around it.

mod connection;
mod error;
mod frame;
mod handler;
mod join;
mod outbound;
mod proto;
mod registry;
mod server;
mod session;
mod shutdown;

pub use error::{Error, FrameError, Result};
pub use handler::{Context, Handler, HandlerFactory, Message};
pub use outbound::ResponseWriter;
pub use proto::{LdapMsg, LdapOp, LdapResult, LdapResultCode};
pub use server::{Server, ServerBuilder};

/// Default LDAP port, used by [`Server::listen_and_serve`] when given an
/// empty address.
pub const DEFAULT_PORT: u16 = 389;
