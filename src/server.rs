//! TCP accept loop, per-connection session driver, and the periodic
//! per-listener video/audio broadcast tick.
//!
//! One `tokio` task per connection drives the inbound read loop; two more
//! per connection drive the listener's outbound video and audio ticks. A
//! `DashMap`-keyed session table tracks every live connection.

use crate::buffers::{AudioRingBuffer, FrameBuffer};
use crate::config::{KeyResolver, ServerConfig};
use crate::error::{CoreError, Result};
use crate::mixer::{Mixer, MixerParams};
use crate::packet::{self, DecodedPacket, PacketReader, PacketType};
use crate::render::PaletteRegistry;
use crate::session::{HandshakePolicy, Session, SessionId, SessionState};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

/// Video ticks aim for a modest, fixed refresh independent of any one
/// listener's negotiated `desired_fps` — the server tick is its own clock,
/// not slaved to any single client's requested rate.
const VIDEO_TICK_INTERVAL: Duration = Duration::from_millis(50);
/// One `AUDIO_BATCH` tick per `AUDIO_SAMPLES_PER_PACKET` chunk at 48kHz.
const AUDIO_TICK_INTERVAL: Duration = Duration::from_millis(10);
const RECV_BUF_SIZE: usize = 64 * 1024;
/// Upper bound used as "no deadline" for `tokio::time::timeout` in
/// `Streaming`/`Closed`, where [`SessionState::deadline`] returns `None`.
const NO_DEADLINE_STANDIN: Duration = Duration::from_secs(3600);

type SessionHandle = Arc<AsyncMutex<Session>>;
type Writer = Arc<AsyncMutex<OwnedWriteHalf>>;

pub struct Server {
    pub config: ServerConfig,
    pub policy: Arc<HandshakePolicy>,
    pub sessions: DashMap<SessionId, SessionHandle>,
    writers: DashMap<SessionId, Writer>,
    /// One `Mixer` per listener, keyed by that listener's own session id.
    /// Each listener's mixer only ever holds every *other* streaming
    /// session's ring as a source, so a ring is still read by exactly one
    /// consumer (its owning listener's mixer), preserving the SPSC contract
    /// `RingBuffer` requires.
    mixers: DashMap<SessionId, Mixer>,
    pub palette_registry: PaletteRegistry,
}

impl Server {
    pub fn new(config: ServerConfig, resolver: &dyn KeyResolver) -> Result<Arc<Self>> {
        let policy = Arc::new(HandshakePolicy::from_config(&config, resolver)?);
        Ok(Arc::new(Self {
            config,
            policy,
            sessions: DashMap::new(),
            writers: DashMap::new(),
            mixers: DashMap::new(),
            palette_registry: PaletteRegistry::new(),
        }))
    }

    fn connected_count(&self) -> u32 {
        self.sessions.len() as u32
    }

    fn snapshot_sessions(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Count of sessions currently past the handshake and actively sending
    /// video or audio, independent of any one listener's mixer.
    async fn active_count(&self) -> u32 {
        let mut active = 0u32;
        for session in self.snapshot_sessions() {
            let guard = session.lock().await;
            if guard.is_streaming() && (guard.sending_video || guard.sending_audio) {
                active += 1;
            }
        }
        active
    }

    /// Pushes a fresh `SERVER_STATE` to every currently registered writer.
    /// Best-effort: a write failure here just drops that listener's update,
    /// the connection's own inbound loop will notice the dead socket.
    async fn broadcast_server_state(&self) {
        let connected = self.connected_count();
        let active = self.active_count().await;
        let (packet_type, payload) = crate::session::build_server_state(connected, active);
        let writers: Vec<(SessionId, Writer)> =
            self.writers.iter().map(|entry| (*entry.key(), entry.value().clone())).collect();
        for (id, writer) in writers {
            let _ = send_packet(&writer, id, packet_type, payload.clone()).await;
        }
    }
}

/// Looks up and clones every currently-`Streaming` video source, excluding
/// no one — callers exclude the listener itself when composing.
async fn streaming_video_sources(server: &Server) -> Vec<(SessionId, Arc<FrameBuffer>)> {
    let mut sources = Vec::new();
    for session in server.snapshot_sessions() {
        let guard = session.lock().await;
        if guard.is_streaming() && guard.sending_video {
            sources.push((guard.id, guard.video_buffer.clone()));
        }
    }
    sources
}

/// Looks up every currently-`Streaming` session's audio ring other than
/// `exclude`, for seeding a freshly completed listener's own mixer.
async fn streaming_audio_sources(server: &Server, exclude: SessionId) -> Vec<(SessionId, Arc<AudioRingBuffer>)> {
    let mut sources = Vec::new();
    for session in server.snapshot_sessions() {
        let guard = session.lock().await;
        if guard.id != exclude && guard.is_streaming() {
            sources.push((guard.id, guard.audio_buffer.clone()));
        }
    }
    sources
}

pub async fn run(config: ServerConfig, resolver: Arc<dyn KeyResolver + Send + Sync>) -> Result<()> {
    let bind_v4 = config.bind_v4;
    let bind_v6 = config.bind_v6;
    let server = Server::new(config, resolver.as_ref())?;

    if let Some(v6) = bind_v6 {
        let server6 = server.clone();
        tokio::spawn(async move {
            match TcpListener::bind(v6).await {
                Ok(listener6) => accept_loop(listener6, server6).await,
                Err(e) => tracing::error!(error = %e, "ipv6 bind failed"),
            }
        });
    }

    let listener = TcpListener::bind(bind_v4)
        .await
        .map_err(|e| CoreError::resource(format!("bind failed: {e}")))?;
    tracing::info!(?bind_v4, "listening");
    accept_loop(listener, server).await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, server: Arc<Server>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = server.clone();
                tokio::spawn(async move { handle_connection(stream, addr, server).await });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, server: Arc<Server>) {
    if server.sessions.len() >= server.config.max_clients {
        tracing::warn!(%addr, "rejecting connection: at max_clients");
        return;
    }
    let _ = stream.set_nodelay(true);

    let session = Session::new(addr, server.policy.clone());
    let id = session.id;
    let session: SessionHandle = Arc::new(AsyncMutex::new(session));
    server.sessions.insert(id, session.clone());
    server.broadcast_server_state().await;
    tracing::info!(%addr, session_id = id, "session accepted");

    let (read_half, write_half) = stream.into_split();
    let writer: Writer = Arc::new(AsyncMutex::new(write_half));
    server.writers.insert(id, writer.clone());

    let video_task = tokio::spawn(video_tick_loop(id, session.clone(), server.clone(), writer.clone()));
    let audio_task = tokio::spawn(audio_tick_loop(id, session.clone(), server.clone(), writer.clone()));

    inbound_loop(read_half, id, session.clone(), server.clone(), writer).await;

    video_task.abort();
    audio_task.abort();
    server.mixers.remove(&id);
    for entry in server.mixers.iter() {
        entry.value().remove_source(id);
    }
    server.sessions.remove(&id);
    server.writers.remove(&id);
    server.broadcast_server_state().await;
    tracing::info!(session_id = id, "session closed");
}

async fn send_packet(writer: &Writer, client_id: u32, packet_type: PacketType, payload: Vec<u8>) -> Result<()> {
    let wire = packet::encode_packet(packet_type, client_id, &payload)?;
    let mut w = writer.lock().await;
    w.write_all(&wire).await.map_err(CoreError::from)
}

async fn video_tick_loop(id: SessionId, session: SessionHandle, server: Arc<Server>, writer: Writer) {
    let mut interval = tokio::time::interval(VIDEO_TICK_INTERVAL);
    loop {
        interval.tick().await;
        let sources = streaming_video_sources(&server).await;
        let ctx = crate::session::OutboundContext { palette_registry: &server.palette_registry };
        let outcome = {
            let guard = session.lock().await;
            if !guard.is_streaming() {
                continue;
            }
            guard.build_video_tick(&sources, &ctx).map(|(t, p)| guard.wrap_for_send(t, p))
        };
        match outcome {
            Some(Ok((packet_type, payload))) => {
                if send_packet(&writer, id, packet_type, payload).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = id, error = %e, "failed to seal video tick");
                break;
            }
            None => {}
        }
    }
}

async fn audio_tick_loop(id: SessionId, session: SessionHandle, server: Arc<Server>, writer: Writer) {
    let params = MixerParams { frame_size: packet::AUDIO_SAMPLES_PER_PACKET, ..Default::default() };
    let mut interval = tokio::time::interval(AUDIO_TICK_INTERVAL);
    loop {
        interval.tick().await;
        let outcome = {
            let guard = session.lock().await;
            if !guard.is_streaming() {
                continue;
            }
            let mixer = match server.mixers.get(&id) {
                Some(mixer) => mixer,
                None => continue,
            };
            guard.build_audio_tick(&mixer, &params).map(|(t, p)| guard.wrap_for_send(t, p))
        };
        match outcome {
            Some(Ok((packet_type, payload))) => {
                if send_packet(&writer, id, packet_type, payload).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = id, error = %e, "failed to seal audio tick");
                break;
            }
            None => {}
        }
    }
}

/// Per-state read deadline, standing in a very long duration for the
/// states that have none.
async fn remaining_deadline(session: &SessionHandle) -> Duration {
    let guard = session.lock().await;
    match guard.state.deadline() {
        Some(d) => d.saturating_sub(guard.state_entered_at.elapsed()).max(Duration::from_millis(1)),
        None => NO_DEADLINE_STANDIN,
    }
}

async fn inbound_loop(
    mut reader: OwnedReadHalf,
    id: SessionId,
    session: SessionHandle,
    server: Arc<Server>,
    writer: Writer,
) {
    let mut packet_reader = PacketReader::new();
    let mut recv_buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let wait = remaining_deadline(&session).await;
        let read_result = tokio::time::timeout(wait, reader.read(&mut recv_buf)).await;
        let n = match read_result {
            Err(_elapsed) => {
                tracing::warn!(session_id = id, "session deadline expired");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(session_id = id, error = %e, "read error");
                break;
            }
        };

        packet_reader.feed(&recv_buf[..n]);
        let packets = match packet_reader.drain_packets() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "framing error");
                break;
            }
        };

        let mut keep_going = true;
        for packet in packets {
            if !dispatch_packet(&session, &server, &writer, id, packet).await {
                keep_going = false;
                break;
            }
        }
        if !keep_going {
            break;
        }
    }
}

/// Opens one layer of `PACKET_TYPE_ENCRYPTED` if present, returning the
/// inner `(type, payload)` the session state machine should actually see.
fn unwrap_if_encrypted(session: &mut Session, packet_type: PacketType, payload: &[u8]) -> Result<(PacketType, Vec<u8>)> {
    if packet_type != PacketType::Encrypted {
        return Ok((packet_type, payload.to_vec()));
    }
    let crypto = session
        .crypto
        .as_ref()
        .ok_or_else(|| CoreError::security("ENCRYPTED packet received before a session key exists"))?;
    let envelope = packet::EncryptedEnvelope::parse(payload)?;
    session.recv_guard.check_and_advance(&envelope.nonce)?;
    let inner = crypto.key.open(&envelope.nonce, envelope.ciphertext_and_mac)?;
    let (decoded, _) = packet::try_decode_packet(&inner)?
        .ok_or_else(|| CoreError::protocol("ENCRYPTED inner packet truncated"))?;
    Ok((decoded.packet_type, decoded.payload))
}

async fn dispatch_packet(
    session: &SessionHandle,
    server: &Arc<Server>,
    writer: &Writer,
    client_id: u32,
    packet: DecodedPacket,
) -> bool {
    let unwrapped = {
        let mut guard = session.lock().await;
        unwrap_if_encrypted(&mut guard, packet.packet_type, &packet.payload)
    };
    let (packet_type, payload) = match unwrapped {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(session_id = client_id, error = %e, "failed to open ENCRYPTED packet");
            return false;
        }
    };

    let outcome = {
        let mut guard = session.lock().await;
        match guard.handle_packet(packet_type, client_id, &payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(session_id = client_id, error = %e, "protocol error");
                return false;
            }
        }
    };

    if outcome.send.iter().any(|(t, _)| *t == PacketType::HandshakeComplete) {
        let audio_buffer = {
            let guard = session.lock().await;
            guard.audio_buffer.clone()
        };

        // This listener's own mixer starts out seeded with every other
        // already-streaming session's ring...
        let mixer = Mixer::new();
        for (other_id, ring) in streaming_audio_sources(server, client_id).await {
            mixer.add_source(other_id, ring);
        }
        server.mixers.insert(client_id, mixer);

        // ...and every other listener's mixer gains this session as a new
        // source, so nobody's ring ends up read by more than one consumer.
        for entry in server.mixers.iter() {
            if *entry.key() != client_id {
                entry.value().add_source(client_id, audio_buffer.clone());
            }
        }
    }

    for (reply_type, reply_payload) in outcome.send {
        let wrapped = {
            let guard = session.lock().await;
            guard.wrap_for_send(reply_type, reply_payload)
        };
        match wrapped {
            Ok((t, p)) => {
                if send_packet(writer, client_id, t, p).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = client_id, error = %e, "failed to seal reply");
                return false;
            }
        }
    }

    if outcome.close {
        let mut guard = session.lock().await;
        guard.enter_state(SessionState::Closed);
    }

    !outcome.close
}
