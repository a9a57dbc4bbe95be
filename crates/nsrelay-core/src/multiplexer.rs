//! Readiness multiplexer over the listener registry.
//!
//! One blocking thread waits on an epoll instance holding every listener plus
//! a wake eventfd. Stream listeners are level-triggered: each event accepts
//! all pending connections and spawns one relay task per connection on the
//! tokio runtime. Datagram sockets are registered one-shot: each event spawns
//! a single relay episode, and the socket is re-armed only when that episode
//! has finished, so two episodes never drain the same socket.
//!
//! Only the loop thread touches the epoll set and the registry. Other threads
//! talk to it through a [`MultiplexerHandle`], which queues a request and
//! writes the eventfd.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use nix::libc;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nsrelay_config::RelayConfig;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::mapping::PortMapping;
use crate::registry::{Listener, ListenerRegistry};
use crate::relay::{self, ConnectTarget, datagram};
use crate::retry::retry_interrupted;

/// What an epoll event refers to, encoded in its 64-bit user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    Listener(usize),
    Wake,
}

impl Token {
    const WAKE: u64 = u64::MAX;

    pub(crate) fn encode(self) -> u64 {
        match self {
            Token::Listener(index) => index as u64,
            Token::Wake => Self::WAKE,
        }
    }

    pub(crate) fn decode(data: u64) -> Self {
        match data {
            Self::WAKE => Token::Wake,
            index => Token::Listener(index as usize),
        }
    }
}

#[derive(Debug)]
enum Control {
    Rearm(usize),
    Shutdown,
}

#[derive(Debug)]
struct Waker {
    eventfd: EventFd,
    requests: mpsc::Sender<Control>,
}

/// Cloneable handle for waking a running [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerHandle {
    waker: Arc<Waker>,
}

impl MultiplexerHandle {
    /// Ask the loop to tear down its listeners and return.
    pub fn shutdown(&self) {
        self.request(Control::Shutdown);
    }

    fn rearm(&self, index: usize) {
        self.request(Control::Rearm(index));
    }

    fn request(&self, control: Control) {
        if self.waker.requests.send(control).is_err() {
            // Loop already gone
            return;
        }
        if let Err(e) = self.waker.eventfd.write(1) {
            warn!(error = %e, "Failed to wake multiplexer");
        }
    }
}

fn interest(listener: &Listener) -> EpollFlags {
    if listener.is_datagram() {
        EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT
    } else {
        EpollFlags::EPOLLIN
    }
}

/// Pause before the next wait after an accept error that exhausts a
/// resource.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => Some(ACCEPT_BACKOFF),
        _ => None,
    }
}

/// The listener multiplexer of a running proxy instance.
pub struct Multiplexer {
    epoll: Epoll,
    registry: ListenerRegistry,
    mapping: PortMapping,
    relay: Arc<RelayConfig>,
    handle: MultiplexerHandle,
    requests: mpsc::Receiver<Control>,
}

impl Multiplexer {
    /// Register every listener of `registry` and the wake descriptor.
    pub fn new(
        registry: ListenerRegistry,
        mapping: PortMapping,
        relay: RelayConfig,
    ) -> ProxyResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(ProxyError::Multiplexer)?;
        let eventfd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(ProxyError::Multiplexer)?;
        epoll
            .add(&eventfd, EpollEvent::new(EpollFlags::EPOLLIN, Token::Wake.encode()))
            .map_err(ProxyError::Multiplexer)?;

        for handle in registry.iter() {
            let event = EpollEvent::new(interest(&handle.listener), Token::Listener(handle.index).encode());
            epoll
                .add(&handle.listener, event)
                .map_err(ProxyError::Multiplexer)?;
            debug!(index = handle.index, "Registered listener");
        }

        let (tx, requests) = mpsc::channel();
        Ok(Self {
            epoll,
            registry,
            mapping,
            relay: Arc::new(relay),
            handle: MultiplexerHandle {
                waker: Arc::new(Waker {
                    eventfd,
                    requests: tx,
                }),
            },
            requests,
        })
    }

    pub fn handle(&self) -> MultiplexerHandle {
        self.handle.clone()
    }

    /// Block dispatching events until shutdown is requested, then close
    /// every listener. Relay tasks are spawned on `runtime`.
    pub fn run(self, runtime: Handle) -> ProxyResult<()> {
        info!(listeners = self.registry.len(), "Multiplexer running");
        let result = self.event_loop(&runtime);
        if let Err(e) = &result {
            warn!(error = %e, "Multiplexer loop failed");
        }
        self.teardown();
        result
    }

    fn event_loop(&self, runtime: &Handle) -> ProxyResult<()> {
        let mut events = vec![EpollEvent::empty(); self.relay.max_events.max(1)];
        loop {
            let ready = retry_interrupted(|| self.epoll.wait(&mut events, EpollTimeout::NONE))
                .map_err(ProxyError::Multiplexer)?;

            for event in &events[..ready] {
                match Token::decode(event.data()) {
                    Token::Wake => {
                        if self.handle_requests() {
                            return Ok(());
                        }
                    }
                    Token::Listener(index) => self.dispatch(index, runtime),
                }
            }
        }
    }

    /// Apply queued requests. Returns true when shutdown was requested.
    fn handle_requests(&self) -> bool {
        match self.handle.waker.eventfd.read() {
            Ok(_) => {}
            Err(nix::Error::EAGAIN) => {}
            Err(e) => warn!(error = %e, "Failed to reset wake descriptor"),
        }

        let mut shutdown = false;
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Control::Rearm(index) => self.rearm(index),
                Control::Shutdown => shutdown = true,
            }
        }
        shutdown
    }

    fn dispatch(&self, index: usize, runtime: &Handle) {
        let Some(handle) = self.registry.get(index) else {
            warn!(index, "Event for unknown listener");
            return;
        };
        let target = ConnectTarget::for_listener(&self.mapping, handle.index);

        if let Listener::Udp(socket) = &handle.listener {
            let socket = match socket.try_clone() {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(index, error = %e, "Failed to duplicate datagram socket");
                    self.rearm(index);
                    return;
                }
            };
            let waker = self.handle.clone();
            let window = self.relay.udp_reply_window();
            runtime.spawn(async move {
                match datagram::run_episode(socket, &target.address, window).await {
                    Ok(summary) => debug!(index, ?summary, "Datagram episode finished"),
                    Err(e) => warn!(index, upstream = %target.address, error = %e, "Datagram episode failed"),
                }
                waker.rearm(index);
            });
            return;
        }

        loop {
            match handle.listener.accept() {
                Ok(Some(conn)) => {
                    let target = target.clone();
                    let config = Arc::clone(&self.relay);
                    runtime.spawn(async move {
                        match relay::serve_connection(conn, &target, config).await {
                            Ok(transferred) => debug!(index, ?transferred, "Flow closed"),
                            Err(e) => warn!(index, upstream = %target.address, error = %e, "Flow failed"),
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(index, error = %e, "Accept failed");
                    // The listener stays readable, so an immediate retry
                    // would fail the same way
                    if let Some(pause) = accept_backoff(&e) {
                        std::thread::sleep(pause);
                    }
                    break;
                }
            }
        }
    }

    fn rearm(&self, index: usize) {
        let Some(handle) = self.registry.get(index) else {
            return;
        };
        let mut event = EpollEvent::new(interest(&handle.listener), Token::Listener(index).encode());
        if let Err(e) = self.epoll.modify(&handle.listener, &mut event) {
            warn!(index, error = %e, "Failed to re-arm listener");
        }
    }

    fn teardown(self) {
        for handle in self.registry.iter() {
            if let Err(e) = self.epoll.delete(&handle.listener) {
                debug!(index = handle.index, error = %e, "Failed to deregister listener");
            }
        }
        self.registry.close();
        drop(self.epoll);
        info!("Multiplexer closed");
    }
}
