//! Connection State Hello: the pending/ready negotiation between CMI and
//! CSHP, with prolongation bookkeeping and trust-manager integration. The
//! most intricate of the four layers.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::codec::{decode_tagged_json, encode_control, for_each_single_key_item, top_level_family, TAG_CONTROL};
use crate::config::HandshakeConfig;
use crate::error::ShipError;
use crate::race::{first_to_finish, BoxFuture};
use crate::timer::Timer;
use crate::transport::{Frame, Transport};
use crate::trust::{TrustListener, TrustManager};

const LAYER: &str = "csh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelloState {
    ReadyInit,
    ReadyListen,
    ReadyTimeout,
    PendingInit,
    PendingListen,
    PendingTimeout,
    Ok,
}

impl HelloState {
    fn is_pending(self) -> bool {
        matches!(
            self,
            HelloState::PendingInit | HelloState::PendingListen | HelloState::PendingTimeout
        )
    }

    fn is_ready(self) -> bool {
        matches!(
            self,
            HelloState::ReadyInit | HelloState::ReadyListen | HelloState::ReadyTimeout | HelloState::Ok
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Ready,
    Aborted,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Ready => "ready",
            Phase::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Result<Self, ShipError> {
        match s {
            "pending" => Ok(Phase::Pending),
            "ready" => Ok(Phase::Ready),
            "aborted" => Ok(Phase::Aborted),
            other => Err(ShipError::abort(LAYER, format!("unknown phase '{other}'"))),
        }
    }
}

/// `connectionHello`.
#[derive(Debug, Clone)]
struct CshMessage {
    phase: Phase,
    waiting: Option<Duration>,
    prolongation_request: Option<bool>,
}

impl CshMessage {
    fn to_json(&self) -> Value {
        let mut items = vec![json!({"phase": self.phase.as_str()})];
        if let Some(waiting) = self.waiting {
            items.push(json!({"waiting": (waiting.as_secs_f64() * 1000.0).round() as i64}));
        }
        if let Some(prolongation_request) = self.prolongation_request {
            items.push(json!({"prolongationRequest": prolongation_request}));
        }
        json!({"connectionHello": items})
    }

    fn from_items(items: &[Value]) -> Result<Self, ShipError> {
        let mut phase = None;
        let mut waiting = None;
        let mut prolongation_request = None;

        for_each_single_key_item(items, LAYER, |key, value| {
            match key {
                "phase" => {
                    let s = value.as_str().ok_or_else(|| ShipError::abort(LAYER, "phase must be a string"))?;
                    phase = Some(Phase::parse(s)?);
                }
                "waiting" => {
                    let ms = value.as_i64().ok_or_else(|| ShipError::abort(LAYER, "waiting must be an integer"))?;
                    waiting = Some(Duration::from_millis(ms.max(0) as u64));
                }
                "prolongationRequest" => {
                    prolongation_request = value.as_bool();
                }
                other => return Err(ShipError::abort(LAYER, format!("unexpected field '{other}'"))),
            }
            Ok(())
        })?;

        let phase = phase.ok_or_else(|| ShipError::abort(LAYER, "missing required field 'phase'"))?;
        Ok(CshMessage { phase, waiting, prolongation_request })
    }
}

async fn send_csh(transport: &mut dyn Transport, message: &CshMessage) -> Result<(), ShipError> {
    debug!(?message, "sending CSH message");
    transport.send(Frame::Binary(encode_control(&message.to_json()))).await
}

async fn recv_csh(transport: &mut dyn Transport) -> Result<CshMessage, ShipError> {
    let bytes = transport.recv().await?.into_bytes();
    let value = decode_tagged_json(&bytes, TAG_CONTROL, LAYER)?;
    let (family, items) = top_level_family(&value, LAYER)?;
    if family != "connectionHello" {
        return Err(ShipError::abort(LAYER, format!("unknown message family '{family}'")));
    }
    CshMessage::from_items(items)
}

struct HelloSession {
    remote_ski: String,
    current: HelloState,
    wait_for_ready: Timer,
    send_prolongation: Timer,
    prolongation_reply: Timer,
    previously_received: Option<CshMessage>,
    other_side_trusts_us: bool,
}

async fn send_hello_update(transport: &mut dyn Transport, session: &HelloSession) -> Result<(), ShipError> {
    let phase = if session.current.is_ready() { Phase::Ready } else { Phase::Pending };

    let waiting = if !session.wait_for_ready.has_completed() {
        session
            .wait_for_ready
            .time_left()
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    } else {
        None
    };

    send_csh(transport, &CshMessage { phase, waiting, prolongation_request: None }).await
}

fn grant_prolongation(session: &mut HelloSession, config: &HandshakeConfig) -> Result<(), ShipError> {
    let mut expiring = std::mem::take(&mut session.wait_for_ready);
    let postponed = expiring
        .postpone(config.hello_increment)
        .map_err(|_| ShipError::abort(LAYER, "wait_for_ready was not active when a prolongation was granted"))?;
    debug!(extra_secs = config.hello_increment.as_secs_f64(), "granting prolongation request");
    session.wait_for_ready = postponed;
    Ok(())
}

enum Event {
    Message(Result<CshMessage, ShipError>),
    ReadyTimeout,
    ProlongRelated,
    TrustReceived,
}

/// Races the next CSH message against the three timers (and, while pending,
/// the trust-manager's grant) and applies whichever combination of events
/// won, mirroring `decide_next_input`'s exact elif-then-separate-if
/// structure: a timer event and an incoming message can both land in the
/// same scheduling quantum, and both are applied.
async fn decide_next_input<L: TrustListener + 'static>(
    transport: &mut dyn Transport,
    session: &mut HelloSession,
    trust_manager: &TrustManager<L>,
) -> Result<Option<CshMessage>, ShipError> {
    let mut named: Vec<(&'static str, BoxFuture<'_, Event>)> = Vec::new();
    named.push(("csh_message", Box::pin(async { Event::Message(recv_csh(transport).await) })));
    named.push((
        "wait_for_ready_timer",
        Box::pin(async {
            session.wait_for_ready.wait_until_completed().await;
            Event::ReadyTimeout
        }),
    ));
    named.push((
        "send_prolongation_timer",
        Box::pin(async {
            session.send_prolongation.wait_until_completed().await;
            Event::ProlongRelated
        }),
    ));
    named.push((
        "prolongation_request_reply_timer",
        Box::pin(async {
            session.prolongation_reply.wait_until_completed().await;
            Event::ProlongRelated
        }),
    ));
    if session.current.is_pending() {
        let ski = session.remote_ski.clone();
        named.push((
            "receive_trust",
            Box::pin(async move {
                trust_manager.wait_to_trust(&ski).await;
                Event::TrustReceived
            }),
        ));
    }

    let results = first_to_finish(named).await;

    let mut message = None;
    let mut recv_err = None;
    let mut wait_for_ready_fired = false;
    let mut prolong_fired = false;
    let mut trust_received = false;

    for (_, event) in results {
        match event {
            Event::Message(Ok(m)) => message = Some(m),
            Event::Message(Err(e)) => recv_err = Some(e),
            Event::ReadyTimeout => wait_for_ready_fired = true,
            Event::ProlongRelated => prolong_fired = true,
            Event::TrustReceived => trust_received = true,
        }
    }

    if let Some(e) = recv_err {
        return Err(e);
    }

    if wait_for_ready_fired {
        debug!("wait_for_ready_timer expired");
        if session.current.is_ready() {
            session.current = HelloState::ReadyTimeout;
        } else if session.current.is_pending() {
            session.current = HelloState::PendingTimeout;
        }
    } else if prolong_fired {
        debug!("send_prolongation_timer or prolongation_request_reply_timer expired");
        if session.current.is_ready() {
            return Err(ShipError::abort(LAYER, "a prolongation timer fired while in a ready state"));
        }
        session.current = HelloState::PendingTimeout;
    } else if trust_received {
        debug!(ski = %session.remote_ski, "received trust for remote");
        session.send_prolongation.cancel();
        session.prolongation_reply.cancel();
        session.current = if session.other_side_trusts_us { HelloState::Ok } else { HelloState::ReadyListen };
        send_hello_update(transport, session).await?;
    }

    if let Some(ref m) = message {
        if m.phase == Phase::Ready {
            session.other_side_trusts_us = true;
        }
        session.previously_received = Some(m.clone());
    }

    Ok(message)
}

/// Runs the CSH hello negotiation. Starting state depends on whether
/// `trust_manager` already trusts `remote_ski`: trusted peers start ready,
/// untrusted peers start pending and race the trust-manager's grant
/// alongside the peer's own readiness.
pub async fn run<L: TrustListener + 'static>(
    transport: &mut dyn Transport,
    trust_manager: &TrustManager<L>,
    remote_ski: &str,
    config: &HandshakeConfig,
) -> Result<(), ShipError> {
    debug!(remote_ski, "starting CSH");

    let initial = if trust_manager.is_trusted(remote_ski) {
        HelloState::ReadyInit
    } else {
        HelloState::PendingInit
    };

    let mut session = HelloSession {
        remote_ski: remote_ski.to_string(),
        current: initial,
        wait_for_ready: Timer::new(),
        send_prolongation: Timer::new(),
        prolongation_reply: Timer::new(),
        previously_received: None,
        other_side_trusts_us: false,
    };

    let mut abort = false;
    let mut previous_state = session.current;

    while !abort && session.current != HelloState::Ok {
        debug!(state = ?session.current, "CSH state");
        let state_at_start = session.current;

        match session.current {
            HelloState::ReadyInit => {
                session.wait_for_ready.start(config.hello_init).expect("fresh timer");
                session.send_prolongation.cancel();
                session.prolongation_reply.cancel();
                send_hello_update(transport, &session).await?;
                session.current = HelloState::ReadyListen;
            }
            HelloState::ReadyListen => {
                if let Some(message) = decide_next_input(transport, &mut session, trust_manager).await? {
                    match message.phase {
                        Phase::Ready => {
                            debug!("received READY from remote while local is ready, transitioning to OK");
                            session.current = HelloState::Ok;
                        }
                        Phase::Pending => {
                            if message.prolongation_request == Some(true) {
                                grant_prolongation(&mut session, config)?;
                                send_hello_update(transport, &session).await?;
                            }
                        }
                        Phase::Aborted => {
                            debug!("received ABORTED");
                            abort = true;
                        }
                    }
                }
            }
            HelloState::ReadyTimeout => {
                abort = true;
            }
            HelloState::PendingInit => {
                session.wait_for_ready.start(config.hello_init).expect("fresh timer");
                session.send_prolongation.cancel();
                session.prolongation_reply.cancel();
                send_hello_update(transport, &session).await?;
                session.current = HelloState::PendingListen;
            }
            HelloState::PendingListen => {
                if let Some(message) = decide_next_input(transport, &mut session, trust_manager).await? {
                    debug!("received message while PENDING_LISTEN");
                    if message.phase == Phase::Ready && message.waiting.is_none() {
                        debug!("missing waiting field in READY message, aborting");
                        abort = true;
                    } else if (message.phase == Phase::Ready && message.waiting.is_some())
                        || (message.phase == Phase::Pending
                            && message.waiting.is_some()
                            && message.prolongation_request.is_none())
                    {
                        debug!("remote is READY and waiting, prolongation request was accepted");
                        session.prolongation_reply.cancel();
                        session.prolongation_reply = Timer::new();
                        if message.phase == Phase::Ready && message.waiting.is_some() {
                            session.wait_for_ready.cancel();
                        }

                        let waiting = message.waiting.expect("checked is_some above");
                        if waiting >= config.prolong_threshold {
                            let new_duration = waiting.checked_sub(config.prolong_gap).unwrap_or(Duration::ZERO);
                            session.send_prolongation.cancel();
                            if new_duration >= config.prolong_min {
                                session.send_prolongation = Timer::new();
                                session.send_prolongation.start(new_duration).expect("fresh timer");
                            }
                        } else {
                            session.send_prolongation.cancel();
                        }
                    } else if message.phase == Phase::Pending
                        && message.waiting.is_none()
                        && message.prolongation_request == Some(true)
                    {
                        debug!("remote is PENDING and requested prolongation");
                        grant_prolongation(&mut session, config)?;
                        send_hello_update(transport, &session).await?;
                    } else if message.phase == Phase::Aborted {
                        debug!("remote wants to abort");
                        abort = true;
                    } else {
                        debug!("unknown message pattern, aborting");
                        abort = true;
                    }
                }
            }
            HelloState::PendingTimeout => {
                if session.wait_for_ready.has_completed() {
                    debug!("remote was not ready in time, aborting");
                    abort = true;
                } else if session.send_prolongation.has_completed() {
                    debug!("send_prolongation_timer expired, requesting prolongation");
                    send_csh(
                        transport,
                        &CshMessage { phase: Phase::Pending, waiting: None, prolongation_request: Some(true) },
                    )
                    .await?;

                    let reply_duration = match session.previously_received.as_ref().and_then(|m| m.waiting) {
                        Some(w) => w,
                        None => Duration::from_secs_f64(
                            (1.1 * session.wait_for_ready.time_left().unwrap_or(0.0)).max(0.0),
                        ),
                    };
                    session.prolongation_reply.start(reply_duration).expect("fresh timer");
                    session.send_prolongation = Timer::new();
                    session.current = previous_state;
                } else if session.prolongation_reply.has_completed() {
                    debug!("prolongation_request_reply_timer expired, aborting");
                    abort = true;
                }
            }
            HelloState::Ok => unreachable!("loop condition excludes this state"),
        }

        previous_state = state_at_start;
    }

    session.wait_for_ready.cancel();
    session.send_prolongation.cancel();
    session.prolongation_reply.cancel();

    if abort {
        debug!("CSH requested abort");
        send_csh(
            transport,
            &CshMessage { phase: Phase::Aborted, waiting: None, prolongation_request: None },
        )
        .await?;
        Err(ShipError::abort(LAYER, "hello negotiation aborted"))
    } else {
        debug!("CSH was successful");
        Ok(())
    }
}
