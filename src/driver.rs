//! The tokio host for the coordination core.
//!
//! [`CoreDriver`] owns the shared UDP sockets and the single ping timer,
//! runs the ACL gate and the resolver on spawned tasks, and funnels
//! everything back into the [`CoreContext`] from one task, so the core stays
//! single-threaded without a lock in sight. Selection requests come in
//! through a cloneable [`CoreHandle`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::acl::{AclGate, Answer, DirectPolicy};
use crate::core::{Action, CoreContext};
use crate::dns::Resolver;
use crate::messenger::{Datagram, Proto};
use crate::request::{CacheEntry, RequestContext};
use crate::selector::{PeerSelectionInitiator, SelectorId};

/// The driver is gone; no further selections can be submitted.
#[derive(Debug, Error)]
#[error("core driver has shut down")]
pub struct DriverClosed;

enum Command {
    Select {
        request: RequestContext,
        entry: Option<CacheEntry>,
        initiator: Box<dyn PeerSelectionInitiator>,
    },
    Shutdown,
}

/// Results of work the driver farmed out to spawned tasks.
enum Feedback {
    Acl {
        selector: SelectorId,
        policy: DirectPolicy,
        answer: Answer,
    },
    Dns {
        selector: SelectorId,
        host: String,
        result: Result<Vec<IpAddr>, String>,
    },
}

/// Cloneable submission handle to a running [`CoreDriver`].
#[derive(Clone)]
pub struct CoreHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CoreHandle {
    /// Requests destinations for a request. Callbacks arrive on the
    /// initiator from the driver task.
    pub fn select(
        &self,
        request: RequestContext,
        entry: Option<CacheEntry>,
        initiator: Box<dyn PeerSelectionInitiator>,
    ) -> Result<(), DriverClosed> {
        self.commands
            .send(Command::Select {
                request,
                entry,
                initiator,
            })
            .map_err(|_| DriverClosed)
    }

    /// Asks the driver to stop after the current event.
    pub fn shutdown(&self) {
        self.commands.send(Command::Shutdown).ok();
    }
}

/// What one `select!` round produced; handled after the pending futures are
/// dropped so the core can be borrowed mutably.
enum Wake {
    Datagram {
        proto: Proto,
        from: SocketAddr,
        len: usize,
    },
    RecvError(io::Error),
    Timer,
    Writable(Proto),
    Feedback(Option<Feedback>),
    Command(Option<Command>),
}

/// Single-task host around a [`CoreContext`].
pub struct CoreDriver {
    core: CoreContext,
    icp_socket: UdpSocket,
    htcp_socket: Option<UdpSocket>,
    gate: Arc<dyn AclGate>,
    resolver: Arc<dyn Resolver>,
    commands: mpsc::UnboundedReceiver<Command>,
    feedback_tx: mpsc::UnboundedSender<Feedback>,
    feedback_rx: mpsc::UnboundedReceiver<Feedback>,
}

impl CoreDriver {
    /// Binds the shared sockets and wires the adapters up. The returned
    /// handle submits work to [`CoreDriver::run`].
    pub async fn bind(
        core: CoreContext,
        icp_addr: SocketAddr,
        htcp_addr: Option<SocketAddr>,
        gate: Arc<dyn AclGate>,
        resolver: Arc<dyn Resolver>,
    ) -> io::Result<(Self, CoreHandle)> {
        let icp_socket = UdpSocket::bind(icp_addr).await?;
        let htcp_socket = match htcp_addr {
            Some(addr) => Some(UdpSocket::bind(addr).await?),
            None => None,
        };
        tracing::info!(
            icp = %icp_socket.local_addr()?,
            htcp = ?htcp_socket.as_ref().and_then(|s| s.local_addr().ok()),
            "core driver listening"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let driver = CoreDriver {
            core,
            icp_socket,
            htcp_socket,
            gate,
            resolver,
            commands: command_rx,
            feedback_tx,
            feedback_rx,
        };
        Ok((driver, CoreHandle { commands: command_tx }))
    }

    /// Runs until shut down. Every core entry point is called from here;
    /// the spawned gate and resolver tasks only ever talk back through the
    /// feedback channel.
    pub async fn run(mut self) {
        let mut icp_buf = [0u8; 8192];
        let mut htcp_buf = [0u8; 8192];

        loop {
            self.drain_actions();

            let ping_deadline = self
                .core
                .armed_deadline()
                .map(tokio::time::Instant::from_std);
            let wake = tokio::select! {
                result = self.icp_socket.recv_from(&mut icp_buf) => match result {
                    Ok((len, from)) => Wake::Datagram { proto: Proto::Icp, from, len },
                    Err(err) => Wake::RecvError(err),
                },
                result = async {
                    match &self.htcp_socket {
                        Some(socket) => socket.recv_from(&mut htcp_buf).await,
                        None => std::future::pending().await,
                    }
                }, if self.htcp_socket.is_some() => match result {
                    Ok((len, from)) => Wake::Datagram { proto: Proto::Htcp, from, len },
                    Err(err) => Wake::RecvError(err),
                },
                _ = async {
                    match ping_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if ping_deadline.is_some() => Wake::Timer,
                result = self.icp_socket.writable(), if self.core.has_pending_sends(Proto::Icp) => {
                    match result {
                        Ok(()) => Wake::Writable(Proto::Icp),
                        Err(err) => Wake::RecvError(err),
                    }
                },
                result = async {
                    match &self.htcp_socket {
                        Some(socket) => socket.writable().await,
                        None => std::future::pending().await,
                    }
                }, if self.core.has_pending_sends(Proto::Htcp) && self.htcp_socket.is_some() => {
                    match result {
                        Ok(()) => Wake::Writable(Proto::Htcp),
                        Err(err) => Wake::RecvError(err),
                    }
                },
                feedback = self.feedback_rx.recv() => Wake::Feedback(feedback),
                command = self.commands.recv() => Wake::Command(command),
            };

            match wake {
                Wake::Datagram { proto, from, len } => {
                    let payload = match proto {
                        Proto::Icp => &icp_buf[..len],
                        Proto::Htcp => &htcp_buf[..len],
                    };
                    self.core.handle_datagram(proto, from, payload);
                }
                Wake::RecvError(err) => {
                    tracing::warn!(%err, "socket error on the shared sockets");
                }
                Wake::Timer => {
                    self.core.handle_timer(Instant::now());
                }
                Wake::Writable(proto) => {
                    self.flush_pending(proto);
                }
                Wake::Feedback(Some(Feedback::Acl {
                    selector,
                    policy,
                    answer,
                })) => {
                    self.core.handle_acl_verdict(selector, policy, answer);
                }
                Wake::Feedback(Some(Feedback::Dns {
                    selector,
                    host,
                    result,
                })) => {
                    self.core.handle_dns_result(selector, &host, result);
                }
                // both ends of the feedback channel live here
                Wake::Feedback(None) => unreachable!("feedback sender is owned by the driver"),
                Wake::Command(Some(Command::Select {
                    request,
                    entry,
                    initiator,
                })) => {
                    self.core.start_selection(request, entry, initiator);
                }
                Wake::Command(Some(Command::Shutdown)) | Wake::Command(None) => {
                    tracing::info!("core driver shutting down");
                    break;
                }
            }
        }
    }

    /// Performs everything the core queued up during the last entry point.
    fn drain_actions(&mut self) {
        while let Some(action) = self.core.next_action() {
            match action {
                Action::Send(datagram) => self.try_send(datagram),
                // the timer is re-derived from armed_deadline() every loop
                Action::Timer(_) => {}
                Action::CheckAcl {
                    selector,
                    policy,
                    request,
                } => {
                    let gate = Arc::clone(&self.gate);
                    let feedback = self.feedback_tx.clone();
                    tokio::spawn(async move {
                        let answer = gate.check(policy, &request).await;
                        feedback
                            .send(Feedback::Acl {
                                selector,
                                policy,
                                answer,
                            })
                            .ok();
                    });
                }
                Action::Resolve { selector, host } => {
                    let resolver = Arc::clone(&self.resolver);
                    let feedback = self.feedback_tx.clone();
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let result = resolver
                            .lookup(&host)
                            .await
                            .map_err(|err| err.to_string());
                        let details = crate::dns::LookupDetails {
                            error: result.as_ref().err().cloned(),
                            wait_ms: Some(started.elapsed().as_millis() as u64),
                        };
                        tracing::debug!(host, ?details, "lookup finished");
                        feedback
                            .send(Feedback::Dns {
                                selector,
                                host,
                                result,
                            })
                            .ok();
                    });
                }
            }
        }
    }

    fn socket_for(&self, proto: Proto) -> Option<&UdpSocket> {
        match proto {
            Proto::Icp => Some(&self.icp_socket),
            Proto::Htcp => self.htcp_socket.as_ref(),
        }
    }

    fn try_send(&mut self, datagram: Datagram) {
        let Some(socket) = self.socket_for(datagram.proto) else {
            self.core
                .note_send_fatal(&datagram, "no socket bound for this protocol");
            return;
        };
        match socket.try_send_to(&datagram.payload, datagram.to) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.core.note_send_blocked(datagram);
            }
            Err(err) => {
                self.core.note_send_fatal(&datagram, &err.to_string());
            }
        }
    }

    /// Retries queued datagrams in order; stops at the first one the socket
    /// still refuses.
    fn flush_pending(&mut self, proto: Proto) {
        while let Some(datagram) = self.core.next_pending_send(proto) {
            let Some(socket) = self.socket_for(proto) else {
                self.core
                    .note_send_fatal(&datagram, "no socket bound for this protocol");
                continue;
            };
            match socket.try_send_to(&datagram.payload, datagram.to) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.core.note_send_blocked(datagram);
                    break;
                }
                Err(err) => {
                    self.core.note_send_fatal(&datagram, &err.to_string());
                }
            }
        }
    }
}
