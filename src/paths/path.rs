//! Network paths and per-family path lists.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::constants::{IPV4_ADDRESS_SIZE, IPV6_ADDRESS_SIZE, MAX_ADVERTISED_ADDRESSES};
use crate::core::error::{TcplsError, TcplsResult};
use crate::stream::StreamId;

/// Address family of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    /// Both families, IPv4 first.
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Raw address size in advertisements.
    pub fn address_size(self) -> usize {
        match self {
            AddressFamily::V4 => IPV4_ADDRESS_SIZE,
            AddressFamily::V6 => IPV6_ADDRESS_SIZE,
        }
    }

    fn index(self) -> usize {
        match self {
            AddressFamily::V4 => 0,
            AddressFamily::V6 => 1,
        }
    }
}

/// Path identifier, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub(crate) u32);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// No connection; eligible for a connect attempt.
    Closed,
    /// Connect attempt in flight.
    Connecting,
    /// Connection established.
    Connected,
}

/// Which side registered the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathOrigin {
    /// One of our own addresses.
    Local,
    /// An address of the peer.
    Peer,
}

/// One underlying TCP connection to a specific address.
#[derive(Debug)]
pub struct NetworkPath {
    id: PathId,
    addr: SocketAddr,
    family: AddressFamily,
    origin: PathOrigin,
    state: PathState,
    latency: Option<Duration>,
    is_primary: bool,
    explicit_primary: bool,
    advertised: bool,
    degraded: bool,
    pub(crate) stream: Option<StreamId>,
    pub(crate) socket: Option<TcpStream>,
    pub(crate) connecting: Option<JoinHandle<io::Result<TcpStream>>>,
    pub(crate) outbound: Vec<u8>,
    pub(crate) inbound: Vec<u8>,
}

impl NetworkPath {
    fn new(id: PathId, addr: SocketAddr, origin: PathOrigin, is_primary: bool, advertised: bool) -> Self {
        Self {
            id,
            addr,
            family: AddressFamily::of(&addr.ip()),
            origin,
            state: PathState::Closed,
            latency: None,
            is_primary,
            explicit_primary: is_primary,
            advertised,
            degraded: false,
            stream: None,
            socket: None,
            connecting: None,
            outbound: Vec::new(),
            inbound: Vec::new(),
        }
    }

    /// Path identifier.
    pub fn id(&self) -> PathId {
        self.id
    }

    /// Remote (peer paths) or local address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address family.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Origin of the address.
    pub fn origin(&self) -> PathOrigin {
        self.origin
    }

    /// Connection state.
    pub fn state(&self) -> PathState {
        self.state
    }

    /// Measured connect latency.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Whether this is the primary path of its family.
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Whether the application flagged this path primary.
    pub fn is_explicit_primary(&self) -> bool {
        self.explicit_primary
    }

    /// Whether the address is advertised to the peer.
    pub fn is_advertised(&self) -> bool {
        self.advertised
    }

    /// Whether the peer reset this path.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Stream bound to this path.
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Bytes queued for this path and not yet written.
    pub fn pending_len(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn mark_connecting(&mut self, handle: JoinHandle<io::Result<TcpStream>>) {
        debug!(path = %self.id, addr = %self.addr, "path connecting");
        self.state = PathState::Connecting;
        self.connecting = Some(handle);
    }

    pub(crate) fn mark_connected(&mut self, socket: TcpStream, latency: Option<Duration>) {
        debug!(path = %self.id, addr = %self.addr, ?latency, "path connected");
        self.state = PathState::Connected;
        self.socket = Some(socket);
        self.connecting = None;
        self.latency = latency;
        self.degraded = false;
    }

    /// Release the socket and return to CLOSED. Queued bytes are kept.
    pub(crate) fn mark_closed(&mut self) {
        if self.state != PathState::Closed {
            debug!(path = %self.id, addr = %self.addr, "path closed");
        }
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        self.socket = None;
        self.state = PathState::Closed;
        self.is_primary = false;
        self.inbound.clear();
    }

    pub(crate) fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub(crate) fn set_primary_flag(&mut self, primary: bool) {
        self.is_primary = primary;
    }
}

impl Drop for NetworkPath {
    fn drop(&mut self) {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
    }
}

/// Insertion-ordered path lists, one per (origin, family).
#[derive(Debug, Default)]
pub struct PathSet {
    local: [Vec<NetworkPath>; 2],
    peer: [Vec<NetworkPath>; 2],
    next_id: u32,
}

impl PathSet {
    /// Create an empty path set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self, origin: PathOrigin) -> &[Vec<NetworkPath>; 2] {
        match origin {
            PathOrigin::Local => &self.local,
            PathOrigin::Peer => &self.peer,
        }
    }

    fn lists_mut(&mut self, origin: PathOrigin) -> &mut [Vec<NetworkPath>; 2] {
        match origin {
            PathOrigin::Local => &mut self.local,
            PathOrigin::Peer => &mut self.peer,
        }
    }

    /// Make room for one more address in its (origin, family) list.
    ///
    /// A following [`add`](Self::add) for the same list cannot fail.
    pub fn reserve(&mut self, origin: PathOrigin, family: AddressFamily) -> TcplsResult<()> {
        let list = &mut self.lists_mut(origin)[family.index()];
        if origin == PathOrigin::Local && list.len() >= MAX_ADVERTISED_ADDRESSES {
            return Err(TcplsError::TooManyAddresses {
                family,
                max: MAX_ADVERTISED_ADDRESSES,
            });
        }
        list.try_reserve(1)?;
        Ok(())
    }

    /// Append an address to its (origin, family) list.
    ///
    /// With `is_primary`, the list's previous primary is cleared first.
    pub fn add(
        &mut self,
        origin: PathOrigin,
        addr: SocketAddr,
        is_primary: bool,
        advertised: bool,
    ) -> TcplsResult<PathId> {
        let family = AddressFamily::of(&addr.ip());
        self.reserve(origin, family)?;

        let id = PathId(self.next_id);
        let list = &mut self.lists_mut(origin)[family.index()];
        if is_primary {
            for path in list.iter_mut() {
                path.is_primary = false;
                path.explicit_primary = false;
            }
        }
        list.push(NetworkPath::new(id, addr, origin, is_primary, advertised));
        self.next_id += 1;

        debug!(path = %id, %addr, ?origin, is_primary, "path added");
        Ok(id)
    }

    /// Add peer-advertised addresses as non-primary paths, skipping known ones.
    ///
    /// Either every new address is added or none is.
    pub fn add_advertised_peers(&mut self, addrs: &[SocketAddr]) -> TcplsResult<Vec<PathId>> {
        let mut fresh: Vec<SocketAddr> = Vec::new();
        fresh.try_reserve(addrs.len())?;
        for addr in addrs {
            if self.find(PathOrigin::Peer, *addr).is_none() && !fresh.contains(addr) {
                fresh.push(*addr);
            }
        }

        for family in AddressFamily::ALL {
            let count = fresh
                .iter()
                .filter(|a| AddressFamily::of(&a.ip()) == family)
                .count();
            self.peer[family.index()].try_reserve(count)?;
        }
        let mut ids = Vec::new();
        ids.try_reserve(fresh.len())?;

        for addr in fresh {
            ids.push(self.add(PathOrigin::Peer, addr, false, false)?);
        }
        Ok(ids)
    }

    /// Path with the given address.
    pub fn find(&self, origin: PathOrigin, addr: SocketAddr) -> Option<&NetworkPath> {
        let family = AddressFamily::of(&addr.ip());
        self.lists(origin)[family.index()]
            .iter()
            .find(|p| p.addr == addr)
    }

    /// Paths of one (origin, family) list in insertion order.
    pub fn list(&self, origin: PathOrigin, family: AddressFamily) -> &[NetworkPath] {
        &self.lists(origin)[family.index()]
    }

    /// Addresses of one (origin, family) list in insertion order.
    pub fn addresses(&self, origin: PathOrigin, family: AddressFamily) -> Vec<IpAddr> {
        self.list(origin, family).iter().map(|p| p.addr.ip()).collect()
    }

    /// Primary path of one (origin, family) list.
    pub fn primary(&self, origin: PathOrigin, family: AddressFamily) -> Option<&NetworkPath> {
        self.list(origin, family).iter().find(|p| p.is_primary)
    }

    /// Path by id.
    pub fn get(&self, id: PathId) -> Option<&NetworkPath> {
        self.iter().find(|p| p.id == id)
    }

    /// Mutable path by id.
    pub fn get_mut(&mut self, id: PathId) -> Option<&mut NetworkPath> {
        self.iter_mut().find(|p| p.id == id)
    }

    /// Make `id` the primary of its list.
    pub fn set_primary(&mut self, id: PathId) -> TcplsResult<()> {
        let path = self.get(id).ok_or(TcplsError::PathNotFound(id))?;
        let (origin, family) = (path.origin, path.family);
        for path in self.lists_mut(origin)[family.index()].iter_mut() {
            path.is_primary = path.id == id;
        }
        Ok(())
    }

    /// Remove a path.
    pub fn remove(&mut self, id: PathId) -> Option<NetworkPath> {
        for list in self.local.iter_mut().chain(self.peer.iter_mut()) {
            if let Some(pos) = list.iter().position(|p| p.id == id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    /// All paths: local before peer, IPv4 before IPv6, insertion order within a list.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkPath> {
        self.local.iter().chain(self.peer.iter()).flatten()
    }

    /// Mutable iterator over all paths.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkPath> {
        self.local.iter_mut().chain(self.peer.iter_mut()).flatten()
    }

    /// Peer paths, IPv4 first.
    pub fn peers(&self) -> impl Iterator<Item = &NetworkPath> {
        self.peer.iter().flatten()
    }

    /// Mutable peer paths, IPv4 first.
    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut NetworkPath> {
        self.peer.iter_mut().flatten()
    }

    /// Total number of paths.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no path is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every path.
    pub fn close_all(&mut self) {
        for path in self.iter_mut() {
            path.mark_closed();
        }
    }
}
