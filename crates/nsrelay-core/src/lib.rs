#![deny(unsafe_code)]

//! nsrelay core: a privileged proxy that listens inside one process's
//! namespaces and connects out from another's.
//!
//! A listen-side process binds the listening sockets inside the listen
//! target's network and mount namespaces and passes them over a socketpair
//! to the connect-side process, which detaches into a daemon, multiplexes
//! the listeners with epoll and relays every flow to the connect address.

/// Endpoint specification parsing and port expansion.
pub mod address;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Steady-state daemon runtime and shutdown.
pub mod daemon;
/// Setup and per-flow error types.
pub mod error;
/// `SCM_RIGHTS` descriptor passing.
pub mod fdpass;
/// Listener descriptor handoff between the two setup processes.
pub mod handoff;
/// Listening socket acquisition with bind retry.
pub mod listener;
/// Tracing subscriber setup.
pub mod logging;
/// Listen/connect pairing rules.
pub mod mapping;
/// Epoll multiplexer over the listener registry.
pub mod multiplexer;
/// Namespace attachment primitives.
pub mod namespace;
/// Reassembled listeners.
pub mod registry;
/// Relay engines.
pub mod relay;
/// Retry combinators for interrupted and transient failures.
pub mod retry;
/// Fork, namespace attach and daemonization sequence.
pub mod topology;

pub use address::{EndpointSpec, Protocol};
pub use daemon::Daemon;
pub use error::{ProxyError, ProxyResult, RelayError};
pub use mapping::PortMapping;
pub use multiplexer::{Multiplexer, MultiplexerHandle};
pub use registry::ListenerRegistry;
pub use topology::{Established, Invocation, ProcessRole, establish};
