use std::fmt::Write as _;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::config::Verdict;
use crate::engine::Engine;
use crate::upstream::{self, Upstream};

/// Covers the common MTU-bounded DNS/UDP envelope.
pub const MAX_DATAGRAM: usize = 1500;

/// Handles one client query end to end: fan the query out to every upstream,
/// read replies until the deadline, and let the arbiter pick the one response
/// the client gets. Errors are contained here; the listener never sees them.
pub async fn run(engine: Arc<Engine>, listener: Arc<UdpSocket>, client: SocketAddr, query: Bytes) {
    let msg = match Message::from_bytes(&query) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(client = %client, error = %err, "unparsable query");
            return;
        }
    };
    if engine.verbose {
        let mut line = String::new();
        let _ = write!(line, "{} {}", msg.id(), client);
        for q in msg.queries() {
            let _ = write!(line, " Query[{}] {}", q.query_type(), q.name());
        }
        let _ = write!(line, " len {}", query.len());
        info!("{line}");
    }

    let (outbound, v6_socket) = match bind_outbound(&engine.upstreams) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(error = %err, "outbound socket");
            return;
        }
    };

    let send_time = Instant::now();
    for up in &engine.upstreams {
        let target = wire_target(up.addr, v6_socket);
        if let Err(err) = outbound.send_to(&query, target).await {
            warn!(upstream = %up, error = %err, "upstream send failed");
        }
    }

    let halted = Arc::new(Notify::new());
    let arbiter = Arc::new(Arbiter::new(listener, client, Arc::clone(&halted)));

    let deadline = sleep_until(send_time + engine.timeout);
    tokio::pin!(deadline);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            // The winning response is on its way out; stop reading, which
            // drops (closes) the outbound socket when we return.
            _ = halted.notified() => break,
            _ = &mut deadline => break,
            res = outbound.recv_from(&mut buf) => {
                let (len, src) = match res {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "outbound read failed");
                        break;
                    }
                };
                let Some(server_index) = upstream::lookup(&engine.upstreams, src) else {
                    // Not one of ours; discard.
                    continue;
                };
                let payload = Bytes::copy_from_slice(&buf[..len]);
                let engine = Arc::clone(&engine);
                let arbiter = Arc::clone(&arbiter);
                tokio::spawn(async move {
                    let verdict = engine.decide(server_index, &payload);
                    arbiter.submit(verdict, payload).await;
                });
            }
        }
    }
}

/// Binds the per-session ephemeral socket. A mixed or IPv6 upstream list gets
/// a dual-stack IPv6 socket so one socket reaches every family.
fn bind_outbound(upstreams: &[Upstream]) -> io::Result<(UdpSocket, bool)> {
    if upstreams.iter().any(|u| u.addr.is_ipv6()) {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(false)?;
        socket.set_nonblocking(true)?;
        let bind: SocketAddr = (Ipv6Addr::UNSPECIFIED, 0).into();
        socket.bind(&bind.into())?;
        Ok((UdpSocket::from_std(socket.into())?, true))
    } else {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;
        Ok((UdpSocket::from_std(socket)?, false))
    }
}

/// IPv4 destinations go through a dual-stack socket in v4-mapped form.
fn wire_target(addr: SocketAddr, v6_socket: bool) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v6_socket => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        other => other,
    }
}

/// Single-flight scheduler for one session: of all non-dropped candidate
/// responses, exactly the one with the earliest scheduled send time reaches
/// the client.
struct Arbiter {
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    halted: Arc<Notify>,
    state: Mutex<ArbiterState>,
}

#[derive(Default)]
struct ArbiterState {
    planned: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    epoch: u64,
    fired: bool,
}

impl Arbiter {
    fn new(listener: Arc<UdpSocket>, client: SocketAddr, halted: Arc<Notify>) -> Self {
        Arbiter {
            listener,
            client,
            halted,
            state: Mutex::new(ArbiterState::default()),
        }
    }

    /// One candidate response with its verdict. Serialised by the state
    /// mutex; may run concurrently with further reads and other submissions.
    async fn submit(self: &Arc<Self>, verdict: Verdict, payload: Bytes) {
        let delay = match verdict {
            Verdict::Drop => return,
            Verdict::Accept => Duration::ZERO,
            Verdict::Delay(d) => d,
        };
        let due = Instant::now() + delay;

        let mut state = self.state.lock().await;
        if state.fired {
            // A winner is already being written out; it cannot be displaced.
            return;
        }
        if state.planned.is_some_and(|planned| due >= planned) {
            // Not strictly earlier. Ties keep the earlier-arrived candidate.
            return;
        }
        // Strictly earlier: replace the pending timer. A timer that already
        // woke up but lost the lock race sees the epoch change and gives up.
        state.epoch += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.planned = Some(due);
        let epoch = state.epoch;
        let arbiter = Arc::clone(self);
        state.timer = Some(tokio::spawn(async move {
            arbiter.fire(epoch, due, payload).await;
        }));
    }

    async fn fire(self: Arc<Self>, epoch: u64, due: Instant, payload: Bytes) {
        sleep_until(due).await;
        {
            let mut state = self.state.lock().await;
            if state.fired || state.epoch != epoch {
                return;
            }
            state.fired = true;
        }
        // Halt the session's reads before the reply goes out.
        self.halted.notify_one();
        if let Err(err) = self.listener.send_to(&payload, self.client).await {
            warn!(client = %self.client, error = %err, "reply send failed");
        }
    }
}
