//! Application data streams.
//!
//! A stream is bound to one path and owns its key contexts. Stream 0 is
//! the implicit default stream and shares the session's handshake keys;
//! every other stream has dedicated contexts derived for its id.

use tracing::debug;

use crate::core::error::{TcplsError, TcplsResult};
use crate::paths::PathId;

/// Stream identifier.
pub type StreamId = u32;

/// Key contexts a stream protects its records with.
#[derive(Debug)]
pub enum StreamKeys<K> {
    /// The session's handshake-negotiated contexts.
    Session,
    /// Contexts derived for this stream.
    Dedicated {
        /// Encrypt context.
        enc: K,
        /// Decrypt context.
        dec: K,
    },
}

impl<K> StreamKeys<K> {
    /// Encrypt context, `None` meaning the session context.
    pub fn enc_mut(&mut self) -> Option<&mut K> {
        match self {
            StreamKeys::Session => None,
            StreamKeys::Dedicated { enc, .. } => Some(enc),
        }
    }

    /// Decrypt context, `None` meaning the session context.
    pub fn dec_mut(&mut self) -> Option<&mut K> {
        match self {
            StreamKeys::Session => None,
            StreamKeys::Dedicated { dec, .. } => Some(dec),
        }
    }

    /// Whether the stream uses the session contexts.
    pub fn is_session(&self) -> bool {
        matches!(self, StreamKeys::Session)
    }
}

/// An application data channel.
#[derive(Debug)]
pub struct Stream<K> {
    id: StreamId,
    path: PathId,
    pub(crate) keys: StreamKeys<K>,
    pub(crate) unacked: Vec<u8>,
}

impl<K> Stream<K> {
    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Path the stream is bound to.
    pub fn path(&self) -> PathId {
        self.path
    }

    /// Plaintext sent on this stream that has not left the socket buffer yet.
    pub fn unacked(&self) -> &[u8] {
        &self.unacked
    }

    pub(crate) fn rebind(&mut self, path: PathId) {
        self.path = path;
    }
}

/// Streams of one session, ordered by id.
#[derive(Debug)]
pub struct StreamManager<K> {
    streams: Vec<Stream<K>>,
}

impl<K> Default for StreamManager<K> {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
        }
    }
}

impl<K> StreamManager<K> {
    /// Create an empty stream collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest unused stream id.
    pub fn next_id(&self) -> StreamId {
        let mut id = 0;
        for stream in &self.streams {
            if stream.id != id {
                break;
            }
            id += 1;
        }
        id
    }

    /// Insert a stream bound to `path`.
    pub fn insert(&mut self, id: StreamId, path: PathId, keys: StreamKeys<K>) -> TcplsResult<()> {
        self.streams.try_reserve(1)?;
        let pos = self.streams.partition_point(|s| s.id < id);
        if self.streams.get(pos).is_some_and(|s| s.id == id) {
            self.streams[pos] = Stream {
                id,
                path,
                keys,
                unacked: Vec::new(),
            };
        } else {
            self.streams.insert(
                pos,
                Stream {
                    id,
                    path,
                    keys,
                    unacked: Vec::new(),
                },
            );
        }
        debug!(stream = id, path = %path, "stream bound");
        Ok(())
    }

    /// Stream by id.
    pub fn get(&self, id: StreamId) -> TcplsResult<&Stream<K>> {
        self.streams
            .iter()
            .find(|s| s.id == id)
            .ok_or(TcplsError::StreamNotFound(id))
    }

    /// Mutable stream by id.
    pub fn get_mut(&mut self, id: StreamId) -> TcplsResult<&mut Stream<K>> {
        self.streams
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(TcplsError::StreamNotFound(id))
    }

    /// Whether a stream exists.
    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.iter().any(|s| s.id == id)
    }

    /// Remove a stream.
    pub fn remove(&mut self, id: StreamId) -> Option<Stream<K>> {
        let pos = self.streams.iter().position(|s| s.id == id)?;
        Some(self.streams.remove(pos))
    }

    /// Stream bound to `path`.
    pub fn on_path_mut(&mut self, path: PathId) -> Option<&mut Stream<K>> {
        self.streams.iter_mut().find(|s| s.path == path)
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream exists.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Iterate over streams by id.
    pub fn iter(&self) -> impl Iterator<Item = &Stream<K>> {
        self.streams.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_fills_gaps() {
        let mut streams: StreamManager<()> = StreamManager::new();
        assert_eq!(streams.next_id(), 0);

        streams.insert(0, PathId(0), StreamKeys::Session).unwrap();
        streams
            .insert(1, PathId(1), StreamKeys::Dedicated { enc: (), dec: () })
            .unwrap();
        streams
            .insert(3, PathId(2), StreamKeys::Dedicated { enc: (), dec: () })
            .unwrap();
        assert_eq!(streams.next_id(), 2);

        streams.remove(0);
        assert_eq!(streams.next_id(), 0);
    }

    #[test]
    fn test_lookup() {
        let mut streams: StreamManager<u8> = StreamManager::new();
        streams
            .insert(4, PathId(7), StreamKeys::Dedicated { enc: 1, dec: 2 })
            .unwrap();

        assert_eq!(streams.get(4).unwrap().path(), PathId(7));
        assert!(matches!(streams.get(5), Err(TcplsError::StreamNotFound(5))));
        assert_eq!(streams.on_path_mut(PathId(7)).unwrap().id(), 4);

        let stream = streams.get_mut(4).unwrap();
        assert_eq!(stream.keys.enc_mut(), Some(&mut 1));
        assert_eq!(stream.keys.dec_mut(), Some(&mut 2));
    }

    #[test]
    fn test_session_keys_select_none() {
        let mut keys: StreamKeys<u8> = StreamKeys::Session;
        assert!(keys.is_session());
        assert!(keys.enc_mut().is_none());
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let mut streams: StreamManager<()> = StreamManager::new();
        streams.insert(0, PathId(0), StreamKeys::Session).unwrap();
        streams.insert(0, PathId(1), StreamKeys::Session).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams.get(0).unwrap().path(), PathId(1));
    }
}
