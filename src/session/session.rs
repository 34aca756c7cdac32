//! The TCPLS session.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::select_all;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::config::SessionConfig;
use super::{Event, SendStatus};
use crate::core::constants::{
    CONTENT_TYPE_ALERT, CONTENT_TYPE_APPLICATION_DATA, CONTENT_TYPE_HANDSHAKE, CONTENT_TYPE_TCPLS,
    DEFAULT_STREAM_ID,
};
use crate::core::error::{ProtocolViolation, TcplsError, TcplsResult};
use crate::core::traits::{DecryptedRecord, HandshakeProgress, NoopHooks, OptionHooks, TlsSession};
use crate::options::registry::apply_local;
use crate::options::types::encode_stream_id;
use crate::options::{
    CompleteOption, OptionRegistry, OptionType, OptionValue, Reassembler, UserTimeout,
    frame_option,
};
use crate::paths::{AddressFamily, NetworkPath, PathId, PathOrigin, PathSet, PathState, advertise};
use crate::stream::{Stream, StreamId, StreamKeys, StreamManager};
use crate::transport::{RaceOptions, RaceOutcome, racer, socket};

/// Outcome of writing a path's queued bytes without blocking.
enum Drain {
    Flushed,
    Pending,
    Reset(io::Error),
    Closed,
    Failed(io::Error),
}

fn drain(path: &mut NetworkPath) -> Drain {
    let Some(tcp) = path.socket.as_ref() else {
        return Drain::Closed;
    };
    while !path.outbound.is_empty() {
        match tcp.try_write(&path.outbound) {
            Ok(0) => return Drain::Closed,
            Ok(n) => {
                path.outbound.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Pending,
            Err(e) if socket::is_reset(&e) => return Drain::Reset(e),
            Err(e) if socket::is_peer_closed(&e) => return Drain::Closed,
            Err(e) => return Drain::Failed(e),
        }
    }
    Drain::Flushed
}

/// Encrypt under the session send key, updating it first if exhausted.
fn seal_session<T: TlsSession>(
    tls: &mut T,
    content_type: u8,
    plaintext: &[u8],
    out: &mut Vec<u8>,
) -> TcplsResult<()> {
    if !tls.has_send_key() {
        return Err(TcplsError::EncryptionUnavailable);
    }
    if tls.send_key_exhausted() {
        tls.update_send_key(out)?;
    }
    tls.encrypt_record(None, content_type, plaintext, out)?;
    Ok(())
}

/// A TCPLS session over one TLS collaborator.
pub struct Session<T: TlsSession, H: OptionHooks = NoopHooks> {
    tls: T,
    hooks: H,
    config: SessionConfig,
    options: OptionRegistry,
    unsent: [bool; OptionType::COUNT],
    peer_options: [Option<OptionValue>; OptionType::COUNT],
    reassembler: Reassembler,
    paths: PathSet,
    streams: StreamManager<T::KeyContext>,
    active: Option<PathId>,
    sendbuf: Vec<u8>,
    backlog: Vec<Event>,
    handshake_reported: bool,
}

impl<T: TlsSession> Session<T, NoopHooks> {
    /// Create a session with default configuration and no option hooks.
    pub fn with_defaults(tls: T) -> Self {
        Self::build(tls, NoopHooks, SessionConfig::default())
    }
}

impl<T: TlsSession, H: OptionHooks> Session<T, H> {
    /// Create a session.
    pub fn new(tls: T, hooks: H, config: SessionConfig) -> TcplsResult<Self> {
        config.validate()?;
        Ok(Self::build(tls, hooks, config))
    }

    fn build(tls: T, hooks: H, config: SessionConfig) -> Self {
        Self {
            tls,
            hooks,
            reassembler: Reassembler::new(config.max_option_size),
            config,
            options: OptionRegistry::new(),
            unsent: [false; OptionType::COUNT],
            peer_options: Default::default(),
            paths: PathSet::new(),
            streams: StreamManager::new(),
            active: None,
            sendbuf: Vec::new(),
            backlog: Vec::new(),
            handshake_reported: false,
        }
    }

    /// Close every path and release all session state.
    pub fn teardown(mut self) {
        for path in self.paths.iter() {
            if path.pending_len() > 0 {
                debug!(path = %path.id(), pending = path.pending_len(), "discarding queued bytes");
            }
        }
        self.paths.close_all();
        info!(
            paths = self.paths.len(),
            streams = self.streams.len(),
            "session torn down"
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// TLS collaborator.
    pub fn tls(&self) -> &T {
        &self.tls
    }

    /// Option hooks.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Local option table.
    pub fn options(&self) -> &OptionRegistry {
        &self.options
    }

    /// Last value the peer sent for an option.
    pub fn peer_option(&self, option_type: OptionType) -> Option<&OptionValue> {
        self.peer_options[option_type.index()].as_ref()
    }

    /// Failover preference the peer advertised.
    pub fn peer_failover(&self) -> Option<bool> {
        match self.peer_option(OptionType::Failover) {
            Some(OptionValue::Failover(enabled)) => Some(*enabled),
            _ => None,
        }
    }

    /// All paths.
    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    /// Path by id.
    pub fn path(&self, id: PathId) -> Option<&NetworkPath> {
        self.paths.get(id)
    }

    /// Active primary path.
    pub fn primary_path(&self) -> Option<PathId> {
        self.active
    }

    /// Stream by id.
    pub fn stream(&self, id: StreamId) -> TcplsResult<&Stream<T::KeyContext>> {
        self.streams.get(id)
    }

    /// Ids of all streams.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.id()).collect()
    }

    /// Bytes queued and not yet written to any socket.
    pub fn pending_send_len(&self) -> usize {
        self.sendbuf.len() + self.paths.iter().map(|p| p.pending_len()).sum::<usize>()
    }

    /// Whether the handshake is complete.
    pub fn is_handshake_complete(&self) -> bool {
        self.tls.is_handshake_complete()
    }

    fn active_primary(&self) -> TcplsResult<PathId> {
        self.active
            .filter(|id| {
                self.paths
                    .get(*id)
                    .is_some_and(|p| p.state() == PathState::Connected)
            })
            .ok_or(TcplsError::NoPrimaryPath)
    }

    // =========================================================================
    // Addresses and paths
    // =========================================================================

    /// Register one of our own addresses.
    ///
    /// With `advertise`, the whole local list of the address family is
    /// serialized into a multihoming option queued for the peer.
    pub fn add_local_address(
        &mut self,
        addr: SocketAddr,
        is_primary: bool,
        advertise: bool,
    ) -> TcplsResult<PathId> {
        let family = AddressFamily::of(&addr.ip());
        self.paths.reserve(PathOrigin::Local, family)?;

        if advertise {
            let mut addrs = self.paths.addresses(PathOrigin::Local, family);
            addrs.try_reserve(1)?;
            addrs.push(addr.ip());
            let payload = advertise::encode(family, &addrs)?;
            self.set_option(OptionType::multihoming(family), &payload, false, true)?;
        }
        self.paths.add(PathOrigin::Local, addr, is_primary, advertise)
    }

    /// Register an address of the peer. Peer addresses are never advertised back.
    pub fn add_peer_address(&mut self, addr: SocketAddr, is_primary: bool) -> TcplsResult<PathId> {
        self.paths.add(PathOrigin::Peer, addr, is_primary, false)
    }

    /// Remove a path that carries no stream.
    ///
    /// Removing a local address re-queues the family's advertisement when
    /// one is registered for the peer.
    pub fn remove_path(&mut self, id: PathId) -> TcplsResult<()> {
        let path = self.paths.get(id).ok_or(TcplsError::PathNotFound(id))?;
        if path.stream().is_some() {
            return Err(TcplsError::PathBusy(id));
        }

        let (origin, family) = (path.origin(), path.family());
        let advertisement = OptionType::multihoming(family);
        let advertised = self
            .options
            .get(advertisement)
            .is_some_and(|slot| slot.settopeer);
        if origin == PathOrigin::Local && advertised {
            let remaining: Vec<_> = self
                .paths
                .list(PathOrigin::Local, family)
                .iter()
                .filter(|p| p.id() != id)
                .map(|p| p.addr().ip())
                .collect();
            let payload = advertise::encode(family, &remaining)?;
            self.set_option(advertisement, &payload, false, true)?;
        }

        if self.active == Some(id) {
            self.active = None;
        }
        self.paths.remove(id);
        debug!(path = %id, "path removed");
        Ok(())
    }

    /// Register an accepted connection as a connected peer path.
    ///
    /// The first accepted path becomes the active primary.
    pub fn accept(&mut self, stream: TcpStream) -> TcplsResult<PathId> {
        let addr = stream.peer_addr()?;
        socket::configure_accepted(&stream, self.config.nodelay)?;

        let id = self.paths.add(PathOrigin::Peer, addr, false, false)?;
        if let Some(path) = self.paths.get_mut(id) {
            path.mark_connected(stream, None);
        }
        if self.active_primary().is_err() {
            self.paths.set_primary(id)?;
            self.active = Some(id);
            info!(path = %id, %addr, "accepted path is primary");
        }
        Ok(id)
    }

    // =========================================================================
    // Connection racing
    // =========================================================================

    /// Connect every unconnected peer path within `timeout` and pick a primary.
    pub async fn connect_all(&mut self, timeout: Duration) -> TcplsResult<RaceOutcome> {
        let opts = RaceOptions {
            bind_local_primary: self.config.bind_local_primary,
            nodelay: self.config.nodelay,
        };
        let outcome = racer::race(&mut self.paths, timeout, opts).await?;
        if outcome.is_usable() {
            self.active = racer::select_primary(&mut self.paths, self.active);
        }
        Ok(outcome)
    }

    /// [`connect_all`](Self::connect_all) with the configured race timeout.
    pub async fn connect_all_default(&mut self) -> TcplsResult<RaceOutcome> {
        self.connect_all(self.config.race_timeout).await
    }

    /// Re-run primary selection over the connected paths.
    pub fn select_primary(&mut self) -> Option<PathId> {
        self.active = racer::select_primary(&mut self.paths, self.active);
        self.active
    }

    // =========================================================================
    // Options
    // =========================================================================

    /// Install an option value.
    ///
    /// With `setlocal` the local effect is applied now; with `settopeer` the
    /// value is sent once the handshake completes (or by [`send_option`](Self::send_option)).
    pub fn set_option(
        &mut self,
        option_type: OptionType,
        payload: &[u8],
        setlocal: bool,
        settopeer: bool,
    ) -> TcplsResult<()> {
        self.options
            .set(option_type, payload, setlocal, settopeer, &mut self.hooks)?;
        self.unsent[option_type.index()] = settopeer;
        Ok(())
    }

    /// Set the user timeout option.
    pub fn set_user_timeout(
        &mut self,
        timeout: UserTimeout,
        setlocal: bool,
        settopeer: bool,
    ) -> TcplsResult<()> {
        self.set_option(OptionType::UserTimeout, &timeout.encode(), setlocal, settopeer)
    }

    /// Set the congestion-control program option.
    pub fn set_bpf_cc(&mut self, program: &[u8], setlocal: bool, settopeer: bool) -> TcplsResult<()> {
        self.set_option(OptionType::BpfCc, program, setlocal, settopeer)
    }

    /// Set the failover option.
    pub fn set_failover(&mut self, enabled: bool, setlocal: bool, settopeer: bool) -> TcplsResult<()> {
        self.set_option(OptionType::Failover, &[u8::from(enabled)], setlocal, settopeer)
    }

    /// Frame and encrypt a registered option into the session send buffer.
    pub fn send_option(&mut self, option_type: OptionType) -> TcplsResult<()> {
        if !self.tls.is_handshake_complete() {
            return Err(TcplsError::HandshakeIncomplete);
        }
        if !self.tls.peer_supports_tcpls() {
            return Err(TcplsError::ExtensionNotNegotiated);
        }
        let payload = self.options.peer_payload(option_type)?;
        if !self.tls.has_send_key() {
            return Err(TcplsError::EncryptionUnavailable);
        }

        for record in frame_option(option_type, payload)? {
            seal_session(&mut self.tls, CONTENT_TYPE_TCPLS, &record, &mut self.sendbuf)?;
        }
        self.unsent[option_type.index()] = false;
        debug!(option = ?option_type, len = payload.len(), "option queued");
        Ok(())
    }

    fn send_pending_options(&mut self) -> TcplsResult<()> {
        if !self.tls.is_handshake_complete() || !self.tls.peer_supports_tcpls() {
            return Ok(());
        }
        for option_type in OptionType::ALL {
            if !self.unsent[option_type.index()] {
                continue;
            }
            match self.send_option(option_type) {
                Ok(()) => {}
                Err(TcplsError::OptionNotFound(_)) => self.unsent[option_type.index()] = false,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Feed bytes to the TLS handshake; its output is queued for the primary path.
    pub fn handshake_step(&mut self, input: &[u8]) -> TcplsResult<HandshakeProgress> {
        let progress = self.tls.handshake(input, &mut self.sendbuf)?;
        if progress.complete {
            self.on_handshake_complete();
        }
        Ok(progress)
    }

    /// Run the handshake over the active primary path.
    pub async fn handshake(&mut self, timeout: Duration) -> TcplsResult<()> {
        let deadline = Instant::now() + timeout;
        self.active_primary()?;

        if !self.tls.is_handshake_complete() {
            self.handshake_step(&[])?;
            self.flush().await?;
        }
        let mut kept = Vec::new();
        while !self.tls.is_handshake_complete() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.backlog.append(&mut kept);
                return Err(TcplsError::Timeout);
            }
            let events = self.receive(remaining).await?;
            kept.extend(events.into_iter().filter(|e| *e != Event::HandshakeComplete));
        }
        self.backlog.append(&mut kept);
        self.flush().await
    }

    fn on_handshake_complete(&mut self) {
        if self.handshake_reported {
            return;
        }
        self.handshake_reported = true;
        info!(
            peer_tcpls = self.tls.peer_supports_tcpls(),
            "handshake complete"
        );
        if let Err(e) = self.send_pending_options() {
            warn!(error = %e, "queuing options after handshake failed");
        }
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Create a stream on the path to `hint`, or on the active primary.
    pub fn create_stream(&mut self, hint: Option<SocketAddr>) -> TcplsResult<StreamId> {
        if !self.tls.is_handshake_complete() {
            return Err(TcplsError::HandshakeIncomplete);
        }
        let path_id = match hint {
            Some(addr) => {
                let path = self
                    .paths
                    .find(PathOrigin::Peer, addr)
                    .ok_or(TcplsError::AddressNotFound(addr))?;
                if path.state() != PathState::Connected {
                    return Err(TcplsError::PathNotConnected(path.id()));
                }
                path.id()
            }
            None => self.active_primary()?,
        };
        let id = self.streams.next_id();
        self.open_stream(id, path_id)?;
        Ok(id)
    }

    /// Bind a new stream to a path and queue its attach message.
    fn open_stream(&mut self, id: StreamId, path_id: PathId) -> TcplsResult<()> {
        if id != DEFAULT_STREAM_ID && !self.tls.peer_supports_tcpls() {
            return Err(TcplsError::ExtensionNotNegotiated);
        }
        let path = self
            .paths
            .get(path_id)
            .ok_or(TcplsError::PathNotFound(path_id))?;
        if path.stream().is_some() {
            return Err(TcplsError::PathBusy(path_id));
        }

        let keys = if id == DEFAULT_STREAM_ID {
            StreamKeys::Session
        } else {
            let (enc, dec) = self.tls.derive_stream_keys(id)?;
            StreamKeys::Dedicated { enc, dec }
        };
        self.streams.insert(id, path_id, keys)?;

        if self.tls.peer_supports_tcpls() {
            if let Err(e) = self.queue_control(path_id, OptionType::StreamAttach, id) {
                self.streams.remove(id);
                return Err(e);
            }
        }
        if let Some(path) = self.paths.get_mut(path_id) {
            path.stream = Some(id);
        }
        debug!(stream = id, path = %path_id, "stream created");
        Ok(())
    }

    fn queue_control(&mut self, path_id: PathId, option_type: OptionType, id: StreamId) -> TcplsResult<()> {
        let mut record = [0u8; 5];
        record[0] = option_type.as_u8();
        record[1..].copy_from_slice(&encode_stream_id(id));

        let path = self
            .paths
            .get_mut(path_id)
            .ok_or(TcplsError::PathNotFound(path_id))?;
        seal_session(&mut self.tls, CONTENT_TYPE_TCPLS, &record, &mut path.outbound)
    }

    /// Close a stream, notifying the peer when its path is still connected.
    pub fn close_stream(&mut self, id: StreamId) -> TcplsResult<()> {
        let path_id = self.streams.get(id)?.path();
        let connected = self
            .paths
            .get(path_id)
            .is_some_and(|p| p.state() == PathState::Connected);
        if connected && self.tls.peer_supports_tcpls() {
            self.queue_control(path_id, OptionType::StreamClose, id)?;
        }
        self.release_stream(id);
        Ok(())
    }

    fn release_stream(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.remove(id) {
            if let Some(path) = self.paths.get_mut(stream.path()) {
                if path.stream == Some(id) {
                    path.stream = None;
                }
            }
            debug!(stream = id, "stream closed");
        }
    }

    /// Hand over plaintext sent on a stream that never left the socket buffer.
    ///
    /// After a reset this is what a failover has to resend.
    pub fn take_unacknowledged(&mut self, id: StreamId) -> TcplsResult<Vec<u8>> {
        Ok(std::mem::take(&mut self.streams.get_mut(id)?.unacked))
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send application data on a stream, the default stream when `None`.
    ///
    /// The first send on a session without streams creates stream 0 on the
    /// active primary. Fails with `NoPrimaryPath` before any I/O when no
    /// primary path is connected.
    pub async fn send(&mut self, stream: Option<StreamId>, data: &[u8]) -> TcplsResult<SendStatus> {
        let primary = self.active_primary()?;
        if !self.tls.is_handshake_complete() {
            return Err(TcplsError::HandshakeIncomplete);
        }

        let stream_id = match stream {
            Some(id) => self.streams.get(id)?.id(),
            None if self.streams.contains(DEFAULT_STREAM_ID) => DEFAULT_STREAM_ID,
            None if self.streams.is_empty() => {
                self.open_stream(DEFAULT_STREAM_ID, primary)?;
                DEFAULT_STREAM_ID
            }
            None => return Err(TcplsError::StreamNotFound(DEFAULT_STREAM_ID)),
        };

        // Options and handshake output go out ahead of the data.
        self.move_sendbuf()?;

        let stream = self.streams.get_mut(stream_id)?;
        let path_id = stream.path();
        let path = self
            .paths
            .get_mut(path_id)
            .ok_or(TcplsError::PathNotFound(path_id))?;
        if path.state() != PathState::Connected {
            return Err(TcplsError::PathNotConnected(path_id));
        }

        stream.unacked.try_reserve(data.len())?;
        path.outbound.try_reserve(data.len())?;
        match stream.keys.enc_mut() {
            Some(key) => {
                self.tls
                    .encrypt_record(Some(key), CONTENT_TYPE_APPLICATION_DATA, data, &mut path.outbound)?;
            }
            None => seal_session(
                &mut self.tls,
                CONTENT_TYPE_APPLICATION_DATA,
                data,
                &mut path.outbound,
            )?,
        }
        stream.unacked.extend_from_slice(data);

        let result = drain(path);
        match self.finish_drain(path_id, result)? {
            SendStatus::Sent(_) => Ok(SendStatus::Sent(data.len())),
            SendStatus::PeerClosed => Ok(SendStatus::PeerClosed),
        }
    }

    /// Move the session send buffer to the active primary's queue.
    fn move_sendbuf(&mut self) -> TcplsResult<()> {
        if self.sendbuf.is_empty() {
            return Ok(());
        }
        let Ok(primary) = self.active_primary() else {
            return Ok(());
        };
        if let Some(path) = self.paths.get_mut(primary) {
            path.outbound.try_reserve(self.sendbuf.len())?;
            path.outbound.append(&mut self.sendbuf);
        }
        Ok(())
    }

    fn finish_drain(&mut self, path_id: PathId, result: Drain) -> TcplsResult<SendStatus> {
        let Some(path) = self.paths.get_mut(path_id) else {
            return Err(TcplsError::PathNotFound(path_id));
        };
        match result {
            Drain::Flushed => {
                if let Some(stream) = path.stream {
                    if let Ok(stream) = self.streams.get_mut(stream) {
                        stream.unacked.clear();
                    }
                }
                Ok(SendStatus::Sent(0))
            }
            Drain::Pending => Ok(SendStatus::Sent(0)),
            Drain::Reset(e) => {
                let addr = path.addr();
                warn!(path = %path_id, %addr, error = %e, "connection reset, path degraded");
                path.mark_degraded();
                path.mark_closed();
                if self.active == Some(path_id) {
                    self.active = None;
                }
                Err(TcplsError::PeerReset {
                    path: path_id,
                    addr,
                })
            }
            Drain::Closed => {
                info!(path = %path_id, "peer closed path");
                self.close_path(path_id);
                Ok(SendStatus::PeerClosed)
            }
            Drain::Failed(e) => Err(e.into()),
        }
    }

    fn close_path(&mut self, path_id: PathId) {
        let stream = self.paths.get_mut(path_id).and_then(|path| {
            path.mark_closed();
            path.outbound.clear();
            path.stream.take()
        });
        if let Some(id) = stream {
            self.streams.remove(id);
        }
        if self.active == Some(path_id) {
            self.active = None;
        }
    }

    /// Write every queued byte, waiting for socket space as needed.
    pub async fn flush(&mut self) -> TcplsResult<()> {
        self.send_pending_options()?;
        self.move_sendbuf()?;

        let queued: Vec<PathId> = self
            .paths
            .iter()
            .filter(|p| p.state() == PathState::Connected && p.pending_len() > 0)
            .map(|p| p.id())
            .collect();

        for id in queued {
            loop {
                let Some(path) = self.paths.get_mut(id) else {
                    break;
                };
                match drain(path) {
                    Drain::Pending => {
                        if let Some(tcp) = path.socket.as_ref() {
                            tcp.writable().await?;
                        }
                    }
                    other => {
                        self.finish_drain(id, other)?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Write queued bytes as far as possible without waiting.
    fn flush_nonblocking(&mut self) -> TcplsResult<()> {
        self.send_pending_options()?;
        self.move_sendbuf()?;

        let queued: Vec<PathId> = self
            .paths
            .iter()
            .filter(|p| p.state() == PathState::Connected && p.pending_len() > 0)
            .map(|p| p.id())
            .collect();
        for id in queued {
            if let Some(path) = self.paths.get_mut(id) {
                let result = drain(path);
                self.finish_drain(id, result)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Wait up to `timeout` for bytes on any connected path and process them.
    ///
    /// Returns no events when the timeout expires.
    pub async fn receive(&mut self, timeout: Duration) -> TcplsResult<Vec<Event>> {
        if !self.backlog.is_empty() {
            return Ok(std::mem::take(&mut self.backlog));
        }

        let ready = {
            let waits: Vec<_> = self
                .paths
                .iter()
                .filter_map(|p| p.socket.as_ref().map(|s| (p.id(), s)))
                .map(|(id, s)| Box::pin(async move { s.readable().await.map(|()| id) }))
                .collect();
            if waits.is_empty() {
                return Err(TcplsError::NoPrimaryPath);
            }
            match tokio::time::timeout(timeout, select_all(waits)).await {
                Err(_) => return Ok(Vec::new()),
                Ok((ready, _, _)) => ready?,
            }
        };

        let mut buf = Vec::new();
        buf.try_reserve_exact(self.config.recv_chunk_size)?;
        buf.resize(self.config.recv_chunk_size, 0);

        let read = match self.paths.get(ready).and_then(|p| p.socket.as_ref()) {
            Some(tcp) => tcp.try_read(&mut buf),
            None => return Ok(Vec::new()),
        };

        let events = match read {
            Ok(0) => {
                info!(path = %ready, "peer closed path");
                self.close_path(ready);
                vec![Event::PathClosed(ready)]
            }
            Ok(n) => self.process_incoming(ready, &buf[..n])?,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Vec::new(),
            Err(e) if socket::is_reset(&e) => {
                warn!(path = %ready, error = %e, "connection reset while reading");
                if let Some(path) = self.paths.get_mut(ready) {
                    path.mark_degraded();
                }
                self.close_path(ready);
                vec![Event::PathClosed(ready)]
            }
            Err(e) => return Err(e.into()),
        };

        self.flush_nonblocking()?;
        Ok(events)
    }

    /// Process bytes that arrived on a path.
    pub fn process_incoming(&mut self, path_id: PathId, bytes: &[u8]) -> TcplsResult<Vec<Event>> {
        let mut events = Vec::new();
        let path = self
            .paths
            .get_mut(path_id)
            .ok_or(TcplsError::PathNotFound(path_id))?;
        path.inbound.try_reserve(bytes.len())?;
        path.inbound.extend_from_slice(bytes);

        if !self.tls.is_handshake_complete() {
            let progress = self.tls.handshake(&path.inbound, &mut path.outbound)?;
            path.inbound.drain(..progress.consumed);
            if !progress.complete {
                return Ok(events);
            }
            events.push(Event::HandshakeComplete);
            self.on_handshake_complete();
        }

        loop {
            let Some(path) = self.paths.get_mut(path_id) else {
                break;
            };
            if path.inbound.is_empty() {
                break;
            }

            // Records of a bound stream try its own key first.
            let mut decrypted = None;
            if let Some(stream) = path.stream.and_then(|id| self.streams.get_mut(id).ok()) {
                let stream_id = stream.id();
                if let Some(dec) = stream.keys.dec_mut() {
                    match self.tls.decrypt_record(Some(dec), &path.inbound) {
                        Ok(None) => break,
                        Ok(Some((record, used))) => decrypted = Some((record, used, Some(stream_id))),
                        Err(e) => {
                            trace!(
                                path = %path_id,
                                stream = stream_id,
                                error = %e,
                                "stream key rejected record, trying session key"
                            );
                        }
                    }
                }
            }
            let (record, used, via) = match decrypted {
                Some(d) => d,
                None => match self.tls.decrypt_record(None, &path.inbound)? {
                    Some((record, used)) => (record, used, None),
                    None => break,
                },
            };
            path.inbound.drain(..used);
            self.route(path_id, record, via, &mut events)?;
        }
        Ok(events)
    }

    fn route(
        &mut self,
        path_id: PathId,
        record: DecryptedRecord,
        via: Option<StreamId>,
        events: &mut Vec<Event>,
    ) -> TcplsResult<()> {
        match record.content_type {
            CONTENT_TYPE_APPLICATION_DATA => {
                let stream = via
                    .or_else(|| {
                        self.paths
                            .get(path_id)
                            .and_then(|p| p.stream())
                            .filter(|id| self.streams.get(*id).is_ok_and(|s| s.keys.is_session()))
                    })
                    .unwrap_or(DEFAULT_STREAM_ID);
                events.push(Event::Data {
                    stream,
                    bytes: record.payload,
                });
            }
            CONTENT_TYPE_TCPLS => {
                if !self.tls.peer_supports_tcpls() {
                    warn!(path = %path_id, "option record without negotiated extension");
                    events.push(Event::Dropped(ProtocolViolation::ExtensionNotNegotiated));
                    return Ok(());
                }
                match self.reassembler.push(&record.payload) {
                    Ok(Some(option)) => self.dispatch(path_id, option, events)?,
                    Ok(None) => {}
                    Err(TcplsError::Protocol(violation)) => {
                        warn!(path = %path_id, %violation, "option record dropped");
                        events.push(Event::Dropped(violation));
                    }
                    Err(e) => return Err(e),
                }
            }
            CONTENT_TYPE_HANDSHAKE => {
                debug!(path = %path_id, len = record.payload.len(), "post-handshake message");
            }
            CONTENT_TYPE_ALERT => {
                warn!(path = %path_id, alert = ?record.payload, "alert received");
                self.close_path(path_id);
                events.push(Event::PathClosed(path_id));
            }
            other => {
                warn!(path = %path_id, content_type = other, "unexpected record dropped");
                events.push(Event::Dropped(ProtocolViolation::UnexpectedContentType(other)));
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, path_id: PathId, option: CompleteOption, events: &mut Vec<Event>) -> TcplsResult<()> {
        let option_type = option.option_type;
        let value = match OptionValue::decode(option_type, option.payload) {
            Ok(value) => value,
            Err(violation) => {
                warn!(option = ?option_type, %violation, "option dropped");
                events.push(Event::Dropped(violation));
                return Ok(());
            }
        };
        debug!(option = ?option_type, path = %path_id, "option received");

        match &value {
            OptionValue::StreamAttach(id) => {
                return self.attach_remote(path_id, *id, events);
            }
            OptionValue::StreamClose(id) => {
                self.release_stream(*id);
                events.push(Event::StreamClosed(*id));
                return Ok(());
            }
            OptionValue::Multihoming(family, addrs) => {
                let port = self.config.peer_port;
                let addrs: Vec<SocketAddr> = addrs.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
                let added = self.paths.add_advertised_peers(&addrs)?;
                debug!(?family, advertised = addrs.len(), added = added.len(), "peer addresses registered");
            }
            OptionValue::UserTimeout(_) | OptionValue::BpfCc(_) => {
                if let Err(e) = apply_local(&value, &mut self.hooks) {
                    warn!(option = ?option_type, error = %e, "local effect of peer option failed");
                }
            }
            OptionValue::Failover(_) => {}
        }

        self.peer_options[option_type.index()] = Some(value);
        events.push(Event::OptionReceived(option_type));
        Ok(())
    }

    fn attach_remote(&mut self, path_id: PathId, id: StreamId, events: &mut Vec<Event>) -> TcplsResult<()> {
        let bound = self
            .paths
            .get(path_id)
            .ok_or(TcplsError::PathNotFound(path_id))?
            .stream();
        if bound.is_some_and(|other| other != id) {
            warn!(path = %path_id, stream = id, "attach to a path carrying another stream");
            events.push(Event::Dropped(ProtocolViolation::InvalidValue {
                option: OptionType::StreamAttach,
            }));
            return Ok(());
        }

        if let Ok(stream) = self.streams.get_mut(id) {
            let previous = stream.path();
            stream.rebind(path_id);
            if previous != path_id {
                if let Some(old) = self.paths.get_mut(previous) {
                    old.stream = None;
                }
            }
        } else {
            let keys = if id == DEFAULT_STREAM_ID {
                StreamKeys::Session
            } else {
                let (enc, dec) = self.tls.derive_stream_keys(id)?;
                StreamKeys::Dedicated { enc, dec }
            };
            self.streams.insert(id, path_id, keys)?;
        }
        if let Some(path) = self.paths.get_mut(path_id) {
            path.stream = Some(id);
        }
        debug!(stream = id, path = %path_id, "stream attached by peer");
        events.push(Event::StreamAttached(id));
        Ok(())
    }
}

impl<T: TlsSession, H: OptionHooks> std::fmt::Debug for Session<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("paths", &self.paths.len())
            .field("streams", &self.streams.len())
            .field("active", &self.active)
            .field("handshake_complete", &self.tls.is_handshake_complete())
            .finish_non_exhaustive()
    }
}
