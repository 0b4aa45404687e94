//! One WebSocket connection
//!
//! The first message must be `HELLO`. Its role decides what the rest of the
//! connection is:
//! - client: lock requests and command submissions, answered with
//!   `reply_to` set to the request id. The server pings clients; leases of
//!   a client that keeps answering are renewed for it.
//! - worker: reserved an id, admitted to the dispatcher once it has run
//!   the init command (if any), and removed when it disconnects or is
//!   evicted

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::dispatch::{
    signalled, AggregateResult, CommandPayload, Registration, WorkerId, WorkerLink, WorkerReply,
};
use crate::error::{Error, Result};
use crate::lock::{Enqueued, LockKey, RequesterId};
use crate::protocol::{
    DispatchFailedMessage, ErrorMessage, HelloAckMessage, InitCommandResponse,
    LockNotAvailableResponse, Message, MessageEnvelope, NoWorkerAvailableMessage, OkReply,
    PeerRole, WorkerCountResponse, PROTOCOL_VERSION,
};
use crate::transport::{next_envelope, next_frame, send_envelope, Inbound};
use super::init::Admission;
use super::{RemoteWorker, Shared};

/// Lower bound on the keepalive period for very short leases
const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

/// Serve one accepted TCP connection until it closes
pub(crate) async fn serve(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let hello = match handshake(&mut read, &shared).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(peer = %peer, error = %e.format_for_log(), "Rejected connection");
            let reply = MessageEnvelope::new(Message::Error(ErrorMessage {
                fatal: true,
                ..ErrorMessage::from_error(&e, None)
            }));
            let _ = send_envelope(&mut write, &reply).await;
            let _ = write.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let session_id = Uuid::new_v4().simple().to_string();
    let result = match hello.role {
        PeerRole::Client => {
            info!(peer = %peer, session_id = %session_id, name = ?hello.name, "Client connected");
            client_session(write, read, session_id.clone(), hello.request_id, &shared).await
        }
        PeerRole::Worker => {
            info!(peer = %peer, session_id = %session_id, name = ?hello.name, "Worker connected");
            worker_session(write, read, &session_id, hello.name, hello.request_id, &shared).await
        }
    };

    match result {
        Ok(()) => info!(peer = %peer, session_id = %session_id, "Session closed"),
        Err(e) => warn!(peer = %peer, session_id = %session_id, error = %e, "Session ended with error"),
    }
}

struct Hello {
    request_id: Uuid,
    role: PeerRole,
    name: Option<String>,
}

async fn handshake<R>(read: &mut R, shared: &Shared) -> Result<Hello>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let limit = shared.options.handshake_timeout;
    let inbound = tokio::time::timeout(limit, next_envelope(read))
        .await
        .map_err(|_| Error::ConnectionTimeout {
            url: "client".to_string(),
            timeout_secs: limit.as_secs(),
        })??;

    let envelope = match inbound {
        Inbound::Envelope(envelope) => envelope,
        Inbound::Malformed(e) => return Err(Error::malformed(e.to_string())),
        Inbound::Closed => return Err(Error::connection_lost("closed before HELLO")),
    };
    PROTOCOL_VERSION.check_peer(&envelope.version)?;

    match envelope.payload {
        Message::Hello(hello) => Ok(Hello {
            request_id: envelope.id,
            role: hello.role,
            name: hello.name,
        }),
        other => Err(Error::ProtocolUnexpected {
            message_type: other.type_name().to_string(),
            context: "expected HELLO".to_string(),
        }),
    }
}

fn hello_ack(request_id: Uuid, session_id: &str) -> MessageEnvelope {
    MessageEnvelope::reply(
        request_id,
        Message::HelloAck(HelloAckMessage {
            session_id: session_id.to_string(),
            server_version: crate::version::server_version(),
        }),
    )
}

fn error_reply(request_id: Uuid, err: &Error) -> MessageEnvelope {
    MessageEnvelope::reply(
        request_id,
        Message::Error(ErrorMessage::from_error(err, Some(request_id))),
    )
}

/// Reply to a submission that did not succeed everywhere
fn dispatch_reply(outcome: Result<AggregateResult>, request_id: Uuid) -> Message {
    match outcome {
        Ok(AggregateResult::Ok(ok)) => Message::OkReply(ok),
        Ok(AggregateResult::Failed(report)) | Ok(AggregateResult::Cancelled(report)) => {
            Message::DispatchFailed(DispatchFailedMessage {
                message: report.summary(),
                report,
            })
        }
        Err(Error::NoWorkersAvailable { kind }) => {
            Message::NoWorkerAvailable(NoWorkerAvailableMessage { kind })
        }
        Err(e) => Message::Error(ErrorMessage::from_error(&e, Some(request_id))),
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Sessions
// ─────────────────────────────────────────────────────────────────

/// Ping period for clients: three pings per lease
fn keepalive_period(lease: Option<Duration>) -> Duration {
    match lease {
        Some(lease) => (lease / 3).max(MIN_KEEPALIVE),
        None => Duration::from_secs(3600),
    }
}

async fn client_session<S, R>(
    mut write: S,
    mut read: R,
    session_id: String,
    hello_id: Uuid,
    shared: &Shared,
) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let requester = RequesterId::new(session_id.clone());
    send_envelope(&mut write, &hello_ack(hello_id, &session_id)).await?;

    let (out_tx, mut out_rx) = mpsc::channel::<MessageEnvelope>(shared.options.message_queue_size);
    let (closed_tx, closed_rx) = watch::channel(false);
    let mut lock_waits = JoinSet::new();
    let mut dispatches = JoinSet::new();

    let lease = shared.locks.config().lease;
    let mut keepalive = tokio::time::interval(keepalive_period(lease));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();

    let result = loop {
        tokio::select! {
            frame = next_frame(&mut read) => {
                last_heard = Instant::now();
                let envelope = match frame {
                    Ok(Some(Inbound::Envelope(envelope))) => envelope,
                    Ok(Some(Inbound::Malformed(e))) => {
                        debug!(session_id = %session_id, error = %e, "Malformed message");
                        let err = Error::malformed(e.to_string());
                        let reply = MessageEnvelope::new(Message::Error(ErrorMessage::from_error(&err, None)));
                        if let Err(e) = send_envelope(&mut write, &reply).await {
                            break Err(e);
                        }
                        continue;
                    }
                    Ok(Some(Inbound::Closed)) => break Ok(()),
                    Ok(None) => continue,
                    Err(e) => break Err(e),
                };

                let request_id = envelope.id;
                let immediate = match envelope.payload {
                    Message::LockRequest(req) => {
                        // Queue position is taken here, in arrival order; only the wait runs apart.
                        let key = LockKey::from_wire(req.key);
                        match shared.locks.enqueue(&requester, &key) {
                            Ok(Enqueued::Granted(granted)) => {
                                Some(MessageEnvelope::reply(request_id, Message::LockResponse(granted)))
                            }
                            Ok(Enqueued::Queued(queued)) => {
                                let locks = shared.locks.clone();
                                let requester = requester.clone();
                                let out = out_tx.clone();
                                lock_waits.spawn(async move {
                                    let wait = locks.config().acquire_timeout;
                                    let reply = match locks.wait_queued(&requester, &key, queued, wait).await {
                                        Ok(granted) => MessageEnvelope::reply(request_id, Message::LockResponse(granted)),
                                        Err(e) => error_reply(request_id, &e),
                                    };
                                    let _ = out.send(reply).await;
                                });
                                None
                            }
                            Err(e) => Some(error_reply(request_id, &e)),
                        }
                    }
                    Message::LockIfAvailableRequest(req) => {
                        let key = LockKey::from_wire(req.key);
                        Some(match shared.locks.try_acquire(&requester, &key) {
                            Ok(Some(granted)) => MessageEnvelope::reply(request_id, Message::LockResponse(granted)),
                            Ok(None) => MessageEnvelope::reply(
                                request_id,
                                Message::LockNotAvailableNow(LockNotAvailableResponse { key: key.to_string() }),
                            ),
                            Err(e) => error_reply(request_id, &e),
                        })
                    }
                    Message::UnlockRequest(req) => {
                        let key = LockKey::from_wire(req.key);
                        Some(match shared.locks.release(&requester, &key) {
                            Ok(released) => MessageEnvelope::reply(request_id, Message::UnlockResponse(released)),
                            Err(e) => error_reply(request_id, &e),
                        })
                    }
                    Message::RenewLeaseRequest(req) => {
                        let key = LockKey::from_wire(req.key);
                        Some(match shared.locks.renew(&requester, &key) {
                            Ok(()) => MessageEnvelope::reply(request_id, Message::OkReply(OkReply {})),
                            Err(e) => error_reply(request_id, &e),
                        })
                    }
                    Message::WorkerCountRequest(_) => Some(MessageEnvelope::reply(
                        request_id,
                        Message::WorkerCountResponse(WorkerCountResponse {
                            workers: shared.dispatcher.registry().count(),
                        }),
                    )),
                    Message::Command(cmd) => {
                        let dispatcher = shared.dispatcher.clone();
                        let closed = closed_rx.clone();
                        let out = out_tx.clone();
                        dispatches.spawn(async move {
                            let outcome = dispatcher.dispatch_until(&cmd.command, signalled(closed)).await;
                            let _ = out.send(MessageEnvelope::reply(request_id, dispatch_reply(outcome, request_id))).await;
                        });
                        None
                    }
                    Message::InitCommand(cmd) => {
                        match shared.init.install(cmd.command.clone(), shared.dispatcher.registry()) {
                            None => Some(MessageEnvelope::reply(
                                request_id,
                                Message::InitCommandResponse(InitCommandResponse { applied: false, workers: 0 }),
                            )),
                            Some(participants) if participants.is_empty() => Some(MessageEnvelope::reply(
                                request_id,
                                Message::InitCommandResponse(InitCommandResponse { applied: true, workers: 0 }),
                            )),
                            Some(participants) => {
                                let dispatcher = shared.dispatcher.clone();
                                let closed = closed_rx.clone();
                                let out = out_tx.clone();
                                dispatches.spawn(async move {
                                    let workers = participants.len();
                                    let outcome = dispatcher
                                        .dispatch_to(participants, &cmd.command, signalled(closed))
                                        .await;
                                    let reply = match outcome {
                                        Ok(AggregateResult::Ok(_)) => Message::InitCommandResponse(InitCommandResponse {
                                            applied: true,
                                            workers,
                                        }),
                                        other => dispatch_reply(other, request_id),
                                    };
                                    let _ = out.send(MessageEnvelope::reply(request_id, reply)).await;
                                });
                                None
                            }
                        }
                    }
                    other => {
                        let err = Error::ProtocolUnexpected {
                            message_type: other.type_name().to_string(),
                            context: "client session".to_string(),
                        };
                        Some(error_reply(request_id, &err))
                    }
                };

                if let Some(reply) = immediate {
                    if let Err(e) = send_envelope(&mut write, &reply).await {
                        break Err(e);
                    }
                }
            }

            Some(reply) = out_rx.recv() => {
                if let Err(e) = send_envelope(&mut write, &reply).await {
                    break Err(e);
                }
            }

            _ = keepalive.tick(), if lease.is_some() => {
                if lease.is_some_and(|lease| last_heard.elapsed() < lease) {
                    let renewed = shared.locks.renew_all(&requester);
                    if renewed > 0 {
                        trace!(session_id = %session_id, renewed, "Leases renewed");
                    }
                }
                if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                    break Err(e.into());
                }
            }

            Some(_) = lock_waits.join_next(), if !lock_waits.is_empty() => {}
            Some(_) = dispatches.join_next(), if !dispatches.is_empty() => {}
        }
    };

    // Queued acquires give up their place; running dispatches finish as cancelled.
    lock_waits.abort_all();
    while lock_waits.join_next().await.is_some() {}
    closed_tx.send_replace(true);
    drop(out_rx);
    while dispatches.join_next().await.is_some() {}

    let released = shared.locks.release_all(&requester);
    if !released.is_empty() {
        debug!(session_id = %session_id, released = released.len(), "Released locks of closed session");
    }
    result
}

// ─────────────────────────────────────────────────────────────────
// Worker Sessions
// ─────────────────────────────────────────────────────────────────

async fn worker_session<S, R>(
    mut write: S,
    read: R,
    session_id: &str,
    name: Option<String>,
    hello_id: Uuid,
    shared: &Shared,
) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let registry = shared.dispatcher.registry();
    let base = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let tag: String = session_id.chars().take(8).collect();

    let (out_tx, out_rx) = mpsc::channel::<MessageEnvelope>(shared.options.message_queue_size);
    let (registration, remote) = registry.reserve_unique(&base, &tag, |id| {
        Arc::new(RemoteWorker::new(id.clone(), out_tx))
    });

    let result = match send_envelope(&mut write, &hello_ack(hello_id, registration.id.as_str())).await {
        Ok(()) => serve_worker(write, read, out_rx, &registration, &remote, shared).await,
        Err(e) => Err(e),
    };

    registry.deregister_generation(&registration.id, registration.generation);
    remote.close();
    result
}

async fn serve_worker<S, R>(
    mut write: S,
    mut read: R,
    mut out_rx: mpsc::Receiver<MessageEnvelope>,
    registration: &Registration,
    remote: &Arc<RemoteWorker>,
    shared: &Shared,
) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let worker_id = &registration.id;
    let registry = shared.dispatcher.registry();
    let evicted = signalled(registration.departed.clone());
    tokio::pin!(evicted);

    let mut admitted = false;
    let mut ran_init = false;
    let mut init_run: Option<BoxFuture<'static, Result<WorkerReply>>> = None;

    loop {
        if !admitted && init_run.is_none() {
            match shared.init.admit(registry, registration, ran_init) {
                Admission::Admitted => {
                    admitted = true;
                    info!(worker_id = %worker_id, ran_init, "Worker admitted");
                }
                Admission::InitRequired(command) => {
                    debug!(worker_id = %worker_id, kind = %command.kind, "Running init command before admission");
                    init_run = Some(run_init(
                        remote.clone(),
                        worker_id.clone(),
                        command,
                        shared.dispatcher.config().participant_timeout,
                    ));
                }
                Admission::Gone => {
                    info!(worker_id = %worker_id, "Reservation removed before admission");
                    return Ok(());
                }
            }
        }

        tokio::select! {
            inbound = next_envelope(&mut read) => {
                let envelope = match inbound {
                    Ok(Inbound::Envelope(envelope)) => envelope,
                    Ok(Inbound::Malformed(e)) => {
                        warn!(worker_id = %worker_id, error = %e, "Malformed message from worker");
                        continue;
                    }
                    Ok(Inbound::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                };

                let reply = match envelope.payload {
                    Message::OkReply(_) => WorkerReply::Ok,
                    Message::ExecutionFailure(failure) => WorkerReply::Failed(failure),
                    other => {
                        warn!(worker_id = %worker_id, message_type = other.type_name(), "Unexpected message from worker");
                        continue;
                    }
                };
                match envelope.reply_to {
                    Some(request_id) => {
                        remote.complete(request_id, reply);
                    }
                    None => warn!(worker_id = %worker_id, "Worker reply without reply_to"),
                }
            }

            Some(command) = out_rx.recv() => {
                send_envelope(&mut write, &command).await?;
            }

            Some(outcome) = finish_init(&mut init_run), if init_run.is_some() => {
                init_run = None;
                match outcome? {
                    WorkerReply::Ok => ran_init = true,
                    WorkerReply::Failed(failure) => {
                        let err = Error::ExecutionFailed(failure);
                        warn!(worker_id = %worker_id, error = %err, "Init command failed, refusing worker");
                        let notice = MessageEnvelope::new(Message::Error(ErrorMessage {
                            fatal: true,
                            ..ErrorMessage::from_error(&err, None)
                        }));
                        let _ = send_envelope(&mut write, &notice).await;
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Err(err);
                    }
                }
            }

            _ = &mut evicted => {
                info!(worker_id = %worker_id, "Worker removed from registry, closing connection");
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Run the init command on a worker that is not admitted yet
fn run_init(
    remote: Arc<RemoteWorker>,
    worker_id: WorkerId,
    command: CommandPayload,
    limit: Option<Duration>,
) -> BoxFuture<'static, Result<WorkerReply>> {
    Box::pin(async move {
        let run = remote.execute(Uuid::new_v4(), &command);
        match limit {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                Error::unreachable(worker_id.as_str(), format!("init command timed out after {:?}", limit))
            })?,
            None => run.await,
        }
    })
}

async fn finish_init(run: &mut Option<BoxFuture<'static, Result<WorkerReply>>>) -> Option<Result<WorkerReply>> {
    match run {
        Some(run) => Some(run.await),
        None => None,
    }
}
