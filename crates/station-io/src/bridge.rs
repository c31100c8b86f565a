use crate::metrics::{BRIDGE_CONNECTED, BUSY_REJECTIONS};
use crate::monitor::{EventLog, DEFAULT_EVENT_QUERY};
use crate::protocol::{
    encode_line, AckMsg, ErrorCode, ErrorMsg, EventsMsg, ProtocolVersion, RelayAction, Request,
    StatusMsg, TorqueMsg,
};
use serde::Serialize;
use station_core::runner::{CommandError, CycleRunner, RelayCommand, RunStatus};
use station_core::torque::{lock_torque, SharedTorque, TorqueError};
use station_core::{TimeBase, WatchMode};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct BridgeConfig {
    pub bind_addr: String,
    pub default_pulse: Duration,
    /// Longer manual pulses are shortened to this.
    pub max_pulse: Duration,
    /// A request line longer than this is discarded unparsed.
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7100".to_string(),
            default_pulse: Duration::from_millis(150),
            max_pulse: Duration::from_secs(2),
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Operator-visible actions taken through the bridge, for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEvent {
    ClientConnected {
        addr: String,
    },
    ClientDisconnected,
    CycleStart {
        status: &'static str,
    },
    CycleStop {
        status: &'static str,
    },
    ManualRelay {
        name: String,
        action: RelayAction,
        ms: Option<u64>,
        error: Option<String>,
    },
    BusyRejected {
        request: &'static str,
    },
    TorqueRestart {
        error: Option<String>,
    },
}

impl BridgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientDisconnected => "client_disconnected",
            Self::CycleStart { .. } => "cycle_start",
            Self::CycleStop { .. } => "cycle_stop",
            Self::ManualRelay { .. } => "manual_relay",
            Self::BusyRejected { .. } => "busy_rejected",
            Self::TorqueRestart { .. } => "torque_restart",
        }
    }
}

pub type BridgeEventSink = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

/// Everything a request handler may touch.
pub struct BridgeContext {
    pub runner: Arc<CycleRunner>,
    pub watch_mode: WatchMode,
    pub torque: Option<SharedTorque>,
    pub timebase: TimeBase,
    pub events: Option<BridgeEventSink>,
    /// Shared with the driver monitor.
    pub recent: Arc<EventLog>,
}

impl BridgeContext {
    fn emit(&self, event: BridgeEvent) {
        if !matches!(
            event,
            BridgeEvent::ClientConnected { .. } | BridgeEvent::ClientDisconnected
        ) {
            self.recent.push("operator", event.kind(), &event);
        }
        if let Some(sink) = &self.events {
            sink(&event);
        }
    }

    fn torque(&self) -> Result<&SharedTorque, TorqueError> {
        self.torque
            .as_ref()
            .ok_or_else(|| TorqueError::Unavailable("no torque controller configured".into()))
    }
}

/// Per-connection state; reset when the client goes away.
#[derive(Debug, Default)]
pub struct Session {
    status_sequence: u64,
    client_id: Option<String>,
}

impl Session {
    fn reset(&mut self) {
        self.status_sequence = 0;
        self.client_id = None;
    }
}

fn command_error(err: &CommandError) -> Vec<u8> {
    encode_line(&ErrorMsg::new(ErrorCode::from(err), err.to_string()))
}

fn torque_error(err: &TorqueError) -> Vec<u8> {
    encode_line(&ErrorMsg::new(ErrorCode::from(err), err.to_string()))
}

fn run_ack(request: &'static str, status: RunStatus) -> Vec<u8> {
    encode_line(&AckMsg {
        status: Some(status.as_str()),
        ..AckMsg::new(request)
    })
}

/// Handles one request line and returns the encoded reply.
#[instrument(skip(ctx, config, session), fields(client_id = ?session.client_id))]
pub fn handle_line(
    ctx: &BridgeContext,
    config: &BridgeConfig,
    session: &mut Session,
    line: &str,
) -> Vec<u8> {
    let request = match Request::parse(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Malformed bridge request");
            return encode_line(&ErrorMsg::new(ErrorCode::BadRequest, e));
        }
    };
    debug!(request = request.name(), "Bridge request");

    match request {
        Request::Hello {
            protocol_version,
            client_id,
        } => {
            if !protocol_version.is_supported() {
                warn!(
                    major = protocol_version.major,
                    minor = protocol_version.minor,
                    "Unsupported protocol version"
                );
                return encode_line(&ErrorMsg::new(
                    ErrorCode::BadRequest,
                    format!(
                        "unsupported protocol version {}.{}",
                        protocol_version.major, protocol_version.minor
                    ),
                ));
            }
            info!(client_id = ?client_id, "Bridge handshake received");
            session.client_id = client_id;
            encode_line(&AckMsg::new("hello"))
        }
        Request::Status => {
            session.status_sequence = session.status_sequence.wrapping_add(1);
            encode_line(&StatusMsg {
                msg_type: "status",
                protocol_version: ProtocolVersion::v1(),
                sequence: session.status_sequence,
                unix_us: ctx.timebase.unix_us(),
                watch_mode: ctx.watch_mode.as_str(),
                snapshot: ctx.runner.snapshot(),
            })
        }
        Request::Relay { name, action, ms } => {
            let command = match action {
                RelayAction::On => RelayCommand::On,
                RelayAction::Off => RelayCommand::Off,
                RelayAction::Pulse => {
                    let requested = ms.map(Duration::from_millis).unwrap_or(config.default_pulse);
                    if requested > config.max_pulse {
                        warn!(
                            requested_ms = requested.as_millis() as u64,
                            max_ms = config.max_pulse.as_millis() as u64,
                            "Manual pulse shortened"
                        );
                    }
                    RelayCommand::Pulse(requested.min(config.max_pulse))
                }
            };
            match ctx.runner.set_relay(&name, command) {
                Ok(()) => {
                    ctx.emit(BridgeEvent::ManualRelay {
                        name,
                        action,
                        ms,
                        error: None,
                    });
                    encode_line(&AckMsg::new("relay"))
                }
                Err(CommandError::Busy) => {
                    BUSY_REJECTIONS.inc();
                    ctx.emit(BridgeEvent::BusyRejected { request: "relay" });
                    command_error(&CommandError::Busy)
                }
                Err(e) => {
                    ctx.emit(BridgeEvent::ManualRelay {
                        name,
                        action,
                        ms,
                        error: Some(e.to_string()),
                    });
                    command_error(&e)
                }
            }
        }
        Request::Start => match ctx.runner.start() {
            Ok(status) => {
                ctx.emit(BridgeEvent::CycleStart {
                    status: status.as_str(),
                });
                run_ack("start", status)
            }
            Err(e) => {
                if matches!(e, CommandError::Busy) {
                    BUSY_REJECTIONS.inc();
                    ctx.emit(BridgeEvent::BusyRejected { request: "start" });
                }
                command_error(&e)
            }
        },
        Request::Stop => {
            let status = ctx.runner.stop();
            ctx.emit(BridgeEvent::CycleStop {
                status: status.as_str(),
            });
            run_ack("stop", status)
        }
        Request::TorqueStatus => {
            let polled = ctx.torque().and_then(|t| lock_torque(t).status());
            match polled {
                Ok(status) => encode_line(&TorqueMsg::new("torque_status", status)),
                Err(e) => torque_error(&e),
            }
        }
        Request::TorqueRestart => {
            let restarted = ctx.torque().and_then(|t| lock_torque(t).soft_restart());
            ctx.emit(BridgeEvent::TorqueRestart {
                error: restarted.as_ref().err().map(|e| e.to_string()),
            });
            match restarted {
                Ok(status) => encode_line(&TorqueMsg::new("torque_restart", status)),
                Err(e) => torque_error(&e),
            }
        }
        Request::TorqueGlobals { set } => {
            let globals = ctx.torque().and_then(|t| {
                let mut driver = lock_torque(t);
                if let Some(update) = &set {
                    driver.write_globals(update)?;
                }
                driver.read_globals()
            });
            match globals {
                Ok(globals) => encode_line(&TorqueMsg::new("torque_globals", globals)),
                Err(e) => torque_error(&e),
            }
        }
        Request::TorqueTask { task, set } => {
            let torque = match ctx.torque() {
                Ok(t) => t,
                Err(e) => return torque_error(&e),
            };
            let mut driver = lock_torque(torque);
            let reply = match &set {
                Some(params) => driver
                    .write_task(task, params)
                    .map(|writes| encode_line(&TorqueMsg::new("torque_task", writes))),
                None => driver
                    .read_task(task)
                    .map(|params| encode_line(&TorqueMsg::new("torque_task", params))),
            };
            reply.unwrap_or_else(|e| torque_error(&e))
        }
        Request::Events { limit } => encode_line(&EventsMsg {
            msg_type: "events",
            events: ctx.recent.recent(limit.unwrap_or(DEFAULT_EVENT_QUERY)),
        }),
    }
}

enum Line {
    Text(Vec<u8>),
    TooLong,
}

/// Splits the client byte stream into request lines, refusing any line over
/// `max_len` bytes without buffering the rest of it.
struct LineBuffer {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl LineBuffer {
    fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_len,
            overflowed: false,
        }
    }

    fn extend(&mut self, bytes: &[u8]) -> Vec<Line> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if std::mem::take(&mut self.overflowed) {
                // Tail of a line already reported.
                continue;
            }
            if line.len() > self.max_len + 1 {
                lines.push(Line::TooLong);
            } else {
                lines.push(Line::Text(line));
            }
        }
        if self.buf.len() > self.max_len {
            self.buf.clear();
            if !self.overflowed {
                self.overflowed = true;
                lines.push(Line::TooLong);
            }
        }
        lines
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.overflowed = false;
    }
}

/// Single-client JSON-lines command server.
pub struct Bridge {
    listener: TcpListener,
    config: BridgeConfig,
}

impl Bridge {
    pub fn bind(config: BridgeConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until `stop` is raised.
    pub fn run(self, ctx: BridgeContext, stop: Arc<AtomicBool>) {
        info!(addr = %self.config.bind_addr, "Bridge listening");

        let mut client: Option<TcpStream> = None;
        let mut recv_buf = LineBuffer::new(self.config.max_line_bytes);
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset: usize = 0;
        let mut session = Session::default();

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            ctx.emit(BridgeEvent::ClientConnected {
                                addr: addr.to_string(),
                            });
                            client = Some(stream);
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(e) => warn!(error = %e, "Failed to set client nonblocking"),
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!("Bridge accept error: {}", err);
                    }
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        for line in recv_buf.extend(&temp[..n]) {
                            let reply = match line {
                                Line::TooLong => {
                                    warn!(max = self.config.max_line_bytes, "Bridge request too long");
                                    encode_line(&ErrorMsg::new(
                                        ErrorCode::BadRequest,
                                        "request line too long",
                                    ))
                                }
                                Line::Text(bytes) => match std::str::from_utf8(&bytes) {
                                    Ok(text) if text.trim().is_empty() => continue,
                                    Ok(text) => {
                                        handle_line(&ctx, &self.config, &mut session, text.trim())
                                    }
                                    Err(_) => encode_line(&ErrorMsg::new(
                                        ErrorCode::BadRequest,
                                        "request is not valid UTF-8",
                                    )),
                                },
                            };
                            send_buf.extend_from_slice(&reply);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                if !drop_client && send_offset < send_buf.len() {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
            }

            if drop_client {
                client = None;
                recv_buf.clear();
                send_buf.clear();
                send_offset = 0;
                session.reset();
                BRIDGE_CONNECTED.set(0.0);
                ctx.emit(BridgeEvent::ClientDisconnected);
            }

            std::thread::sleep(Duration::from_millis(5));
        }
        BRIDGE_CONNECTED.set(0.0);
    }
}
