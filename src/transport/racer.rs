//! Connection racing across all peer paths.
//!
//! Every CLOSED peer path gets a connect attempt running as its own task.
//! The race waits on all in-flight attempts under one shared deadline;
//! attempts still running when it expires stay CONNECTING and are waited on
//! again by the next race.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::socket::{self, SocketOptions};
use crate::core::error::{TcplsError, TcplsResult};
use crate::paths::{AddressFamily, PathId, PathOrigin, PathSet, PathState};

/// Result of one race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    /// Every peer path is connected.
    AllConnected,
    /// At least one peer path is connected; the caller may proceed.
    Partial,
    /// No peer path is connected.
    NoneConnected,
}

impl RaceOutcome {
    /// Numeric outcome code: 0 all connected, 1 partial, 2 none.
    pub fn code(self) -> i32 {
        match self {
            RaceOutcome::AllConnected => 0,
            RaceOutcome::Partial => 1,
            RaceOutcome::NoneConnected => 2,
        }
    }

    /// Whether at least one path is connected.
    pub fn is_usable(self) -> bool {
        !matches!(self, RaceOutcome::NoneConnected)
    }
}

/// Settings of a race.
#[derive(Debug, Clone, Copy)]
pub struct RaceOptions {
    /// Bind each socket to the local primary address of its family.
    pub bind_local_primary: bool,
    /// Set TCP_NODELAY.
    pub nodelay: bool,
}

/// Connect every unconnected peer path, waiting at most `timeout` overall.
pub async fn race(paths: &mut PathSet, timeout: Duration, opts: RaceOptions) -> TcplsResult<RaceOutcome> {
    let start = Instant::now();
    let deadline = start + timeout;

    let binds = AddressFamily::ALL.map(|family| {
        opts.bind_local_primary
            .then(|| paths.primary(PathOrigin::Local, family).map(|p| p.addr()))
            .flatten()
    });

    for path in paths.peers_mut() {
        if path.state() != PathState::Closed {
            continue;
        }
        let remote = path.addr();
        let sock_opts = SocketOptions {
            bind: match path.family() {
                AddressFamily::V4 => binds[0],
                AddressFamily::V6 => binds[1],
            },
            nodelay: opts.nodelay,
        };
        match socket::stream_socket(remote, sock_opts) {
            Ok(sock) => {
                let handle = tokio::spawn(socket::connect(sock, remote));
                path.mark_connecting(handle);
            }
            Err(e) => {
                debug!(path = %path.id(), addr = %remote, error = %e, "socket setup failed");
            }
        }
    }

    let in_flight: Vec<_> = paths
        .peers_mut()
        .filter_map(|p| p.connecting.take().map(|h| (p.id(), h)))
        .collect();

    let waits = in_flight.into_iter().map(|(id, mut handle)| async move {
        let result = timeout_at(deadline, &mut handle).await;
        (id, handle, result, Instant::now())
    });
    let results = join_all(waits).await;

    let mut aborted = None;
    for (id, handle, result, finished) in results {
        let Some(path) = paths.get_mut(id) else {
            handle.abort();
            continue;
        };
        match result {
            Err(_elapsed) => {
                path.connecting = Some(handle);
            }
            Ok(Err(join_err)) => {
                warn!(path = %id, error = %join_err, "connect task failed");
                path.mark_closed();
                aborted = Some(join_err.to_string());
            }
            Ok(Ok(Err(e))) => {
                debug!(path = %id, addr = %path.addr(), error = %e, "connect failed");
                path.mark_closed();
            }
            Ok(Ok(Ok(stream))) => {
                let latency = finished.saturating_duration_since(start);
                path.mark_connected(stream, Some(latency));
            }
        }
    }

    if let Some(reason) = aborted {
        return Err(TcplsError::RaceAborted(reason));
    }

    let total = paths.peers().count();
    let connected = paths
        .peers()
        .filter(|p| p.state() == PathState::Connected)
        .count();
    let outcome = if total > 0 && connected == total {
        RaceOutcome::AllConnected
    } else if connected > 0 {
        RaceOutcome::Partial
    } else {
        RaceOutcome::NoneConnected
    };

    if total == 0 {
        warn!("connection race with no peer paths");
    }
    info!(
        ?outcome,
        connected,
        total,
        elapsed = ?start.elapsed(),
        "connection race finished"
    );
    Ok(outcome)
}

/// Choose the primary path after a race.
///
/// A connected `active` path is kept. Otherwise a connected path flagged
/// primary by the application wins; if one is flagged but not connected,
/// nothing is selected. Failing both, the connected, non-degraded peer path
/// with the lowest connect latency wins, ties going to IPv4 and then to
/// insertion order.
pub fn select_primary(paths: &mut PathSet, active: Option<PathId>) -> Option<PathId> {
    if let Some(id) = active {
        if paths
            .get(id)
            .is_some_and(|p| p.state() == PathState::Connected)
        {
            return Some(id);
        }
    }

    let explicit = paths
        .peers()
        .find(|p| p.is_explicit_primary())
        .map(|p| (p.id(), p.state()));
    if let Some((id, state)) = explicit {
        if state != PathState::Connected {
            debug!(path = %id, "explicit primary not connected");
            return None;
        }
        paths.set_primary(id).ok()?;
        info!(path = %id, "explicit primary path active");
        return Some(id);
    }

    let chosen = paths
        .peers()
        .filter(|p| p.state() == PathState::Connected && !p.is_degraded())
        .min_by_key(|p| {
            (
                p.latency().unwrap_or(Duration::MAX),
                p.family() != AddressFamily::V4,
            )
        })
        .map(|p| (p.id(), p.addr(), p.latency()))?;

    let (id, addr, latency) = chosen;
    paths.set_primary(id).ok()?;
    info!(path = %id, %addr, ?latency, "primary path selected");
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    const OPTS: RaceOptions = RaceOptions {
        bind_local_primary: false,
        nodelay: true,
    };

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_zero_paths_is_hard_failure() {
        let mut paths = PathSet::new();
        let outcome = race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(outcome, RaceOutcome::NoneConnected);
        assert_eq!(outcome.code(), 2);
    }

    #[tokio::test]
    async fn test_all_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut paths = PathSet::new();
        let id = paths
            .add(PathOrigin::Peer, listener.local_addr().unwrap(), false, false)
            .unwrap();

        let outcome = race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(outcome, RaceOutcome::AllConnected);

        let path = paths.get(id).unwrap();
        assert_eq!(path.state(), PathState::Connected);
        assert!(path.latency().is_some());
    }

    #[tokio::test]
    async fn test_refused_path_returns_to_closed() {
        let mut paths = PathSet::new();
        let id = paths
            .add(PathOrigin::Peer, refused_addr().await, false, false)
            .unwrap();

        let start = std::time::Instant::now();
        let outcome = race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(outcome, RaceOutcome::NoneConnected);
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(paths.get(id).unwrap().state(), PathState::Closed);
    }

    /// Listener with a full accept queue: further SYNs are dropped.
    fn saturated_listener() -> (socket2::Socket, Vec<std::net::TcpStream>) {
        let listener = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        listener
            .bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into())
            .unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        while let Ok(stream) = std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            queued.push(stream);
            assert!(queued.len() < 8, "accept queue never filled");
        }
        (listener, queued)
    }

    #[tokio::test]
    async fn test_deadline_leaves_attempt_connecting() {
        let (listener, _queued) = saturated_listener();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        let mut paths = PathSet::new();
        let id = paths.add(PathOrigin::Peer, addr, false, false).unwrap();

        let start = std::time::Instant::now();
        let outcome = race(&mut paths, Duration::from_millis(300), OPTS).await.unwrap();
        assert_eq!(outcome, RaceOutcome::NoneConnected);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(paths.get(id).unwrap().state(), PathState::Connecting);

        // Drain the queue so the retransmitted SYN of the pending attempt gets through.
        listener.set_nonblocking(true).unwrap();
        let mut accepted = Vec::new();
        while let Ok((conn, _)) = listener.accept() {
            accepted.push(conn);
        }

        let outcome = race(&mut paths, Duration::from_secs(5), OPTS).await.unwrap();
        assert_eq!(outcome, RaceOutcome::AllConnected);
        let path = paths.get(id).unwrap();
        assert_eq!(path.state(), PathState::Connected);
        assert!(path.latency().is_some());
    }

    #[tokio::test]
    async fn test_partial_selects_reachable_primary() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut paths = PathSet::new();
        let dead = paths
            .add(PathOrigin::Peer, refused_addr().await, false, false)
            .unwrap();
        let live = paths
            .add(PathOrigin::Peer, listener.local_addr().unwrap(), false, false)
            .unwrap();

        let outcome = race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(outcome.code(), 1);

        assert_eq!(select_primary(&mut paths, None), Some(live));
        assert!(paths.get(live).unwrap().is_primary());
        assert!(!paths.get(dead).unwrap().is_primary());
    }

    #[tokio::test]
    async fn test_explicit_primary_respected() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut paths = PathSet::new();
        paths
            .add(PathOrigin::Peer, a.local_addr().unwrap(), false, false)
            .unwrap();
        let explicit = paths
            .add(PathOrigin::Peer, b.local_addr().unwrap(), true, false)
            .unwrap();

        race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(select_primary(&mut paths, None), Some(explicit));
    }

    #[tokio::test]
    async fn test_explicit_primary_unconnected_blocks_selection() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut paths = PathSet::new();
        paths
            .add(PathOrigin::Peer, live.local_addr().unwrap(), false, false)
            .unwrap();
        paths
            .add(PathOrigin::Peer, refused_addr().await, true, false)
            .unwrap();

        race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(select_primary(&mut paths, None), None);
    }

    #[tokio::test]
    async fn test_connected_active_kept() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut paths = PathSet::new();
        let first = paths
            .add(PathOrigin::Peer, a.local_addr().unwrap(), false, false)
            .unwrap();
        let second = paths
            .add(PathOrigin::Peer, b.local_addr().unwrap(), false, false)
            .unwrap();

        race(&mut paths, Duration::from_secs(1), OPTS).await.unwrap();
        assert_eq!(select_primary(&mut paths, Some(second)), Some(second));
        assert!(paths.get(first).is_some());
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(RaceOutcome::AllConnected.code(), 0);
        assert_eq!(RaceOutcome::Partial.code(), 1);
        assert_eq!(RaceOutcome::NoneConnected.code(), 2);
        assert!(!RaceOutcome::NoneConnected.is_usable());
    }
}
