//! TCP transport: accept peers (listen) or dial one peer (connect). One session per connection,
//! one negotiator shared by all of them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use r2r_core::protocol::unix_timestamp;
use r2r_core::{
    Envelope, GenericPayload, MessageType, NegotiationAction, NegotiationPayload, Outcome,
    Payload, Resolution, Role, Session, SessionError, SessionEvent, SessionHandle,
    SharedNegotiator, StatusPayload,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;

const EXPIRY_SWEEP: Duration = Duration::from_secs(1);

/// Live sessions by connection number, so shutdown can close them all.
pub type Sessions = Arc<Mutex<HashMap<u64, SessionHandle>>>;

/// What `connect` sends once the handshake is done.
#[derive(Debug, Clone, Default)]
pub struct Opening {
    pub target: Option<String>,
    pub status: String,
    pub bid: Option<(String, f64)>,
    pub propose: Option<String>,
}

/// Accept incoming peers as the handshake acceptor. Runs until the listener fails.
pub async fn run_listener(
    cfg: Arc<Config>,
    negotiator: SharedNegotiator,
    sessions: Sessions,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!(port = cfg.listen_port, agent = %cfg.agent_id, "listening");

    let sweep_negotiator = negotiator.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(EXPIRY_SWEEP).await;
            let expired = sweep_negotiator.lock().await.expire_idle(unix_timestamp());
            for resolution in expired {
                report_resolution(&resolution);
            }
        }
    });

    let mut next_id = 0u64;
    loop {
        let (stream, addr) = listener.accept().await?;
        let id = next_id;
        next_id += 1;
        let cfg = cfg.clone();
        let negotiator = negotiator.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let result = run_connection(
                stream,
                addr,
                id,
                &cfg,
                Role::Acceptor,
                negotiator,
                &sessions,
                None,
            )
            .await;
            if let Err(e) = result {
                debug!(%addr, error = %e, "connection ended");
            }
        });
    }
}

/// Dial `addr` as the handshake initiator, send `opening`, then heartbeat until the session ends.
pub async fn run_connect(
    cfg: Arc<Config>,
    addr: SocketAddr,
    negotiator: SharedNegotiator,
    sessions: Sessions,
    opening: Opening,
) -> Result<(), SessionError> {
    let stream = TcpStream::connect(addr).await?;
    info!(%addr, agent = %cfg.agent_id, "connected");
    run_connection(
        stream,
        addr,
        0,
        &cfg,
        Role::Initiator,
        negotiator,
        &sessions,
        Some(opening),
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    cfg: &Config,
    role: Role,
    negotiator: SharedNegotiator,
    sessions: &Sessions,
    opening: Option<Opening>,
) -> Result<(), SessionError> {
    let _ = stream.set_nodelay(true);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut session = Session::from_stream(stream, cfg.session(role), negotiator, events_tx);
    register_handlers(&mut session);
    let handle = session.handle();
    sessions.lock().await.insert(id, handle.clone());

    let heartbeat = cfg.heartbeat_interval();
    let (done_tx, done_rx) = oneshot::channel();
    let reporter = tokio::spawn(report_events(
        addr,
        handle.clone(),
        events_rx,
        opening,
        heartbeat,
        done_rx,
    ));
    let result = session.run().await;
    sessions.lock().await.remove(&id);
    let _ = done_tx.send(());
    if let Err(e) = reporter.await {
        warn!(%addr, error = %e, "event reporter failed");
    }
    result
}

fn register_handlers(session: &mut Session) {
    session
        .on(MessageType::Status, |env: Envelope| {
            if let Payload::Status(s) = &env.payload {
                let details = serde_json::Value::Object(s.details.clone());
                info!(peer = %env.header.source_id, status = %s.status, %details, "status");
            }
        })
        .on(MessageType::Telemetry, |env: Envelope| {
            if let Payload::Telemetry(t) = &env.payload {
                debug!(peer = %env.header.source_id, points = t.data_points.len(), "telemetry");
            }
        })
        .on(MessageType::Command, |env: Envelope| {
            if let Payload::Command(c) = &env.payload {
                info!(
                    peer = %env.header.source_id,
                    command = %c.command_name,
                    args = c.args.len(),
                    "command received"
                );
            }
        })
        .on(MessageType::Negotiation, |env: Envelope| {
            if let Payload::Negotiation(n) = &env.payload {
                info!(
                    peer = %env.header.source_id,
                    task_id = %n.task_id,
                    action = %n.action,
                    "negotiation"
                );
            }
        })
        .on(MessageType::Heartbeat, |env: Envelope| {
            debug!(peer = %env.header.source_id, ts = env.header.timestamp, "heartbeat");
        })
        .on(MessageType::Error, |env: Envelope| {
            if let Payload::Error(e) = &env.payload {
                warn!(peer = %env.header.source_id, message = ?e.get_str("message"), "peer error");
            }
        });
}

// Logs session events; once the handshake is done, sends the opening messages and heartbeats.
// After `done` fires, logs whatever is still queued and returns the number of events handled.
async fn report_events(
    addr: SocketAddr,
    handle: SessionHandle,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut opening: Option<Opening>,
    heartbeat: Duration,
    mut done: oneshot::Receiver<()>,
) -> usize {
    let mut ticker = tokio::time::interval(heartbeat);
    let mut beating = false;
    let mut handled = 0;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else {
                    return handled;
                };
                handled += 1;
                let handshaken = matches!(event, SessionEvent::Handshaken { .. });
                log_event(addr, event);
                let o = if handshaken { opening.take() } else { None };
                if let Some(o) = o {
                    if let Err(e) = send_opening(&handle, &o).await {
                        warn!(%addr, error = %e, "sending opening messages failed");
                    }
                    ticker.reset();
                    beating = true;
                }
            }
            _ = &mut done => {
                while let Ok(event) = events.try_recv() {
                    handled += 1;
                    log_event(addr, event);
                }
                return handled;
            }
            _ = ticker.tick(), if beating => {
                let beat = Payload::Heartbeat(GenericPayload::default());
                if let Err(e) = handle.send_payload(beat, None).await {
                    debug!(%addr, error = %e, "heartbeat failed");
                }
            }
        }
    }
}

fn log_event(addr: SocketAddr, event: SessionEvent) {
    match event {
        SessionEvent::Handshaken { peer_id, version } => {
            info!(%addr, peer = %peer_id, %version, "peer connected");
        }
        SessionEvent::Warning(w) => warn!(%addr, "{}", w),
        SessionEvent::Resolved(resolution) => report_resolution(&resolution),
    }
}

async fn send_opening(handle: &SessionHandle, o: &Opening) -> Result<(), SessionError> {
    let target = o.target.as_deref();
    handle
        .send_payload(StatusPayload::new(o.status.clone()), target)
        .await?;
    if let Some(task_id) = &o.propose {
        handle
            .send_payload(
                NegotiationPayload::new(task_id.clone(), NegotiationAction::ProposeTask),
                target,
            )
            .await?;
        info!(task_id = %task_id, "proposed task");
    }
    if let Some((task_id, cost)) = &o.bid {
        let bid = NegotiationPayload::new(task_id.clone(), NegotiationAction::Bid)
            .with_detail("cost", *cost);
        handle.send_payload(bid, target).await?;
        info!(task_id = %task_id, cost, "bid sent");
    }
    Ok(())
}

/// Hand a resolved task to the scheduler. This agent only records the decision.
fn report_resolution(r: &Resolution) {
    match r.outcome {
        Outcome::Accepted => {
            let winner = r.accepted_offer.as_ref().map(|o| o.source_id.as_str());
            info!(
                task_id = %r.task_id,
                winner = ?winner,
                decided_by = ?r.decided_by,
                actions = r.history.len(),
                "task accepted"
            );
        }
        Outcome::Rejected => {
            info!(
                task_id = %r.task_id,
                reason = ?r.reason,
                decided_by = ?r.decided_by,
                actions = r.history.len(),
                "task rejected"
            );
        }
    }
}

/// Close every live session.
pub async fn close_all(sessions: &Sessions) {
    let handles: Vec<SessionHandle> = sessions.lock().await.values().cloned().collect();
    for h in handles {
        h.close().await;
    }
}
