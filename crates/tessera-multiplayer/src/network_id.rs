//! Hierarchical network addresses.
//!
//! A [`NetworkId`] is a path of up to [`MAX_LEVEL`] 16-bit chunks below the
//! root. The kind of every node on the path follows from its parent's kind
//! and its own chunk: below the root or a session, chunk `0` is the
//! controller that hands out child session ids and any other chunk is an
//! object; below that controller every chunk is a session; below an object
//! everything is an object. Parent, session and object ancestors are derived
//! from the chunks on demand and never stored.

use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_net::{CodecError, DataReader, DataWriter};

/// Maximum nesting depth of an id.
pub const MAX_LEVEL: usize = 8;

/// What a [`NetworkId`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdKind {
    Root = 0,
    SessionId = 1,
    ChildSessionIdController = 2,
    Object = 3,
}

impl IdKind {
    fn from_u8(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Root),
            1 => Ok(Self::SessionId),
            2 => Ok(Self::ChildSessionIdController),
            3 => Ok(Self::Object),
            tag => Err(CodecError::UnknownTag {
                what: "network id kind",
                tag,
            }),
        }
    }

    /// Kind of a child with `chunk` below a node of this kind.
    fn child(self, chunk: u16) -> Self {
        match self {
            Self::Root | Self::SessionId if chunk == 0 => Self::ChildSessionIdController,
            Self::Root | Self::SessionId => Self::Object,
            Self::ChildSessionIdController => Self::SessionId,
            Self::Object => Self::Object,
        }
    }
}

/// Immutable hierarchical address of a network-visible node.
///
/// Chunks beyond `level` are always zero, so the derived equality and hash
/// compare exactly the level, the kind and the chunks in use. Deserialization
/// rejects values that break this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawNetworkId")]
pub struct NetworkId {
    level: u8,
    kind: IdKind,
    chunks: [u16; MAX_LEVEL],
}

impl NetworkId {
    /// The root of every hierarchy.
    pub const ROOT: NetworkId = NetworkId {
        level: 0,
        kind: IdKind::Root,
        chunks: [0; MAX_LEVEL],
    };

    /// Append `chunk` below `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is already at [`MAX_LEVEL`].
    pub fn generate(parent: NetworkId, chunk: u16) -> NetworkId {
        let level = parent.level as usize;
        assert!(level < MAX_LEVEL, "network id nesting exceeds {MAX_LEVEL} levels");

        let mut chunks = parent.chunks;
        chunks[level] = chunk;
        NetworkId {
            level: parent.level + 1,
            kind: parent.kind.child(chunk),
            chunks,
        }
    }

    /// Re-address this object under another object, keeping its own chunk.
    pub fn with_new_parent(&self, new_parent: NetworkId) -> NetworkId {
        debug_assert!(
            self.kind == IdKind::Object && new_parent.kind == IdKind::Object,
            "both ids must be object ids: {self} under {new_parent}"
        );
        Self::generate(new_parent, self.chunk())
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// The chunk at this id's own level, `0` for the root.
    pub fn chunk(&self) -> u16 {
        match self.level {
            0 => 0,
            level => self.chunks[level as usize - 1],
        }
    }

    /// Chunks from level 1 to this id's level.
    pub fn chunks(&self) -> &[u16] {
        &self.chunks[..self.level as usize]
    }

    pub fn is_root(&self) -> bool {
        self.kind == IdKind::Root
    }

    /// Direct parent, `None` for the root.
    pub fn parent(&self) -> Option<NetworkId> {
        if self.level == 0 {
            return None;
        }

        let level = self.level as usize - 1;
        let mut chunks = [0; MAX_LEVEL];
        chunks[..level].copy_from_slice(&self.chunks[..level]);
        let kind = chunks[..level]
            .iter()
            .fold(IdKind::Root, |kind, &chunk| kind.child(chunk));

        Some(NetworkId {
            level: level as u8,
            kind,
            chunks,
        })
    }

    /// Closest ancestor that is a session or the root.
    pub fn parent_session(&self) -> Option<NetworkId> {
        self.ancestor(|kind| matches!(kind, IdKind::SessionId | IdKind::Root))
    }

    /// Closest ancestor that is an object or the root.
    pub fn parent_object(&self) -> Option<NetworkId> {
        self.ancestor(|kind| matches!(kind, IdKind::Object | IdKind::Root))
    }

    fn ancestor(&self, accept: impl Fn(IdKind) -> bool) -> Option<NetworkId> {
        let mut current = self.parent();
        while let Some(id) = current {
            if accept(id.kind) {
                return Some(id);
            }
            current = id.parent();
        }
        None
    }

    /// Whether `session` is this id or its closest session ancestor.
    pub fn is_owned_by(&self, session: NetworkId) -> bool {
        debug_assert!(
            matches!(session.kind, IdKind::SessionId | IdKind::Root),
            "{session} is not a session id"
        );
        *self == session || self.parent_session() == Some(session)
    }

    /// `level`, `kind`, then one little-endian `u16` per used chunk.
    pub fn write_to(&self, writer: &mut DataWriter) {
        writer.write_u8(self.level);
        writer.write_u8(self.kind as u8);
        for &chunk in self.chunks() {
            writer.write_u16(chunk);
        }
    }

    pub fn read_from(reader: &mut DataReader<'_>) -> Result<NetworkId, CodecError> {
        let level = reader.read_u8()?;
        if level as usize > MAX_LEVEL {
            return Err(CodecError::UnknownTag {
                what: "network id level",
                tag: level,
            });
        }
        let kind = IdKind::from_u8(reader.read_u8()?)?;

        let mut chunks = [0; MAX_LEVEL];
        for chunk in chunks.iter_mut().take(level as usize) {
            *chunk = reader.read_u16()?;
        }
        Ok(NetworkId {
            level,
            kind,
            chunks,
        })
    }
}

/// Serialized form of a [`NetworkId`] before validation.
#[derive(Deserialize)]
struct RawNetworkId {
    level: u8,
    kind: IdKind,
    chunks: [u16; MAX_LEVEL],
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidNetworkId {
    #[error("level {0} exceeds {MAX_LEVEL}")]
    Level(u8),
    #[error("chunk {index} is set beyond level {level}")]
    UnusedChunk { level: u8, index: usize },
    #[error("kind {found:?} does not match the chunks, expected {expected:?}")]
    Kind { found: IdKind, expected: IdKind },
}

impl TryFrom<RawNetworkId> for NetworkId {
    type Error = InvalidNetworkId;

    fn try_from(raw: RawNetworkId) -> Result<Self, Self::Error> {
        let level = raw.level as usize;
        if level > MAX_LEVEL {
            return Err(InvalidNetworkId::Level(raw.level));
        }
        if let Some(index) = raw.chunks[level..].iter().position(|&c| c != 0) {
            return Err(InvalidNetworkId::UnusedChunk {
                level: raw.level,
                index: level + index,
            });
        }
        let rebuilt = raw.chunks[..level]
            .iter()
            .fold(NetworkId::ROOT, |id, &chunk| NetworkId::generate(id, chunk));
        if rebuilt.kind != raw.kind {
            return Err(InvalidNetworkId::Kind {
                found: raw.kind,
                expected: rebuilt.kind,
            });
        }
        Ok(rebuilt)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.level)?;
        for (i, chunk) in self.chunks().iter().enumerate() {
            let sep = if i == 0 { "::" } else { "-" };
            write!(f, "{sep}{chunk}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(n: u16) -> NetworkId {
        NetworkId::generate(NetworkId::generate(NetworkId::ROOT, 0), n)
    }

    fn round_trip(id: NetworkId) -> NetworkId {
        let mut writer = DataWriter::new();
        id.write_to(&mut writer);
        let mut reader = DataReader::new(writer.as_slice());
        let decoded = NetworkId::read_from(&mut reader).unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[test]
    fn test_root_has_no_parent() {
        assert_eq!(NetworkId::ROOT.level(), 0);
        assert_eq!(NetworkId::ROOT.parent(), None);
        assert_eq!(NetworkId::ROOT.parent_session(), None);
        assert_eq!(NetworkId::ROOT.chunk(), 0);
    }

    #[test]
    fn test_kind_rule() {
        let controller = NetworkId::generate(NetworkId::ROOT, 0);
        assert_eq!(controller.kind(), IdKind::ChildSessionIdController);

        let peer = NetworkId::generate(controller, 3);
        assert_eq!(peer.kind(), IdKind::SessionId);

        let object = NetworkId::generate(peer, 7);
        assert_eq!(object.kind(), IdKind::Object);

        let nested = NetworkId::generate(object, 0);
        assert_eq!(nested.kind(), IdKind::Object);

        assert_eq!(NetworkId::generate(NetworkId::ROOT, 9).kind(), IdKind::Object);
    }

    #[test]
    fn test_parent_derivation_matches_generation() {
        let peer = session(4);
        let object = NetworkId::generate(peer, 11);
        let child = NetworkId::generate(object, 2);

        assert_eq!(child.parent(), Some(object));
        assert_eq!(object.parent(), Some(peer));
        assert_eq!(peer.parent(), Some(NetworkId::generate(NetworkId::ROOT, 0)));
        assert_eq!(child.parent_object(), Some(object));
        assert_eq!(object.parent_object(), Some(NetworkId::ROOT));
        assert_eq!(child.parent_session(), Some(peer));
        assert_eq!(peer.parent_session(), Some(NetworkId::ROOT));
    }

    #[test]
    fn test_ownership_through_descendants() {
        let owner = session(1);
        let other = session(2);

        let mut id = NetworkId::generate(owner, 5);
        for chunk in 1..6 {
            assert!(id.is_owned_by(owner));
            assert!(!id.is_owned_by(other));
            id = NetworkId::generate(id, chunk);
        }
        assert!(id.is_owned_by(owner));
        assert!(owner.is_owned_by(owner));
    }

    #[test]
    fn test_ownership_follows_reparenting() {
        let owner = session(1);
        let other = session(2);
        let parent_a = NetworkId::generate(owner, 10);
        let parent_b = NetworkId::generate(other, 20);

        let child = NetworkId::generate(parent_a, 3);
        let moved = child.with_new_parent(parent_b);

        assert_eq!(moved.chunk(), 3);
        assert_eq!(moved.parent(), Some(parent_b));
        assert!(moved.is_owned_by(other));
        assert!(!moved.is_owned_by(owner));
    }

    #[test]
    fn test_root_session_owns_root_objects() {
        let object = NetworkId::generate(NetworkId::ROOT, 1);
        assert!(object.is_owned_by(NetworkId::ROOT));
        assert!(!object.is_owned_by(session(1)));
    }

    #[test]
    fn test_round_trip_every_level() {
        let mut id = session(0x7FFF);
        while (id.level() as usize) < MAX_LEVEL {
            id = NetworkId::generate(id, 0xFFFF - id.level() as u16);
            assert_eq!(round_trip(id), id);
        }
        assert_eq!(round_trip(NetworkId::ROOT), NetworkId::ROOT);
    }

    #[test]
    fn test_only_used_chunks_are_written() {
        let id = NetworkId::generate(NetworkId::generate(NetworkId::ROOT, 1), 2);
        let mut writer = DataWriter::new();
        id.write_to(&mut writer);
        assert_eq!(writer.as_slice(), &[2, 3, 1, 0, 2, 0]);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let mut reader = DataReader::new(&[9, 3]);
        assert!(matches!(
            NetworkId::read_from(&mut reader),
            Err(CodecError::UnknownTag { tag: 9, .. })
        ));
    }

    #[test]
    fn test_truncated_id_rejected() {
        let mut reader = DataReader::new(&[2, 3, 1, 0]);
        assert!(matches!(
            NetworkId::read_from(&mut reader),
            Err(CodecError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    #[should_panic]
    fn test_generate_beyond_max_level_panics() {
        let mut id = NetworkId::ROOT;
        for _ in 0..=MAX_LEVEL {
            id = NetworkId::generate(id, 1);
        }
    }

    #[test]
    fn test_display() {
        let id = NetworkId::generate(NetworkId::generate(NetworkId::ROOT, 4), 2);
        assert_eq!(id.to_string(), "Object:2::4-2");
    }

    #[test]
    fn test_serde_shape() {
        let id = session(3);
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value["level"], 2);
        assert_eq!(value["kind"], "SessionId");
        assert_eq!(value["chunks"][1], 3);
        assert_eq!(serde_json::from_value::<NetworkId>(value).unwrap(), id);
    }

    #[test]
    fn test_deserialize_rejects_chunks_beyond_level() {
        let value = serde_json::json!({
            "level": 1,
            "kind": "Object",
            "chunks": [4, 9, 0, 0, 0, 0, 0, 0],
        });
        let err = serde_json::from_value::<NetworkId>(value).unwrap_err();
        assert!(err.to_string().contains("chunk 1 is set beyond level 1"), "{err}");
    }

    #[test]
    fn test_deserialize_rejects_bad_level_and_kind() {
        let too_deep = serde_json::json!({
            "level": 9,
            "kind": "Object",
            "chunks": [1, 1, 1, 1, 1, 1, 1, 1],
        });
        assert!(serde_json::from_value::<NetworkId>(too_deep).is_err());

        let wrong_kind = serde_json::json!({
            "level": 1,
            "kind": "SessionId",
            "chunks": [4, 0, 0, 0, 0, 0, 0, 0],
        });
        let err = serde_json::from_value::<NetworkId>(wrong_kind).unwrap_err();
        assert!(err.to_string().contains("does not match"), "{err}");
    }

    #[test]
    fn test_validated_id_equals_generated_one() {
        let session = NetworkId::generate(NetworkId::generate(NetworkId::ROOT, 0), 2);
        let id = NetworkId::generate(session, 7);
        let raw = RawNetworkId {
            level: 3,
            kind: IdKind::Object,
            chunks: [0, 2, 7, 0, 0, 0, 0, 0],
        };
        assert_eq!(NetworkId::try_from(raw), Ok(id));
    }
}
