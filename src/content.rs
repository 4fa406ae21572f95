//! Content identity.
//!
//! Everything above this module compares content through [`ContentHandle`],
//! never through raw bytes, so the storage representation can change without
//! touching the reconciliation logic. Two handles are equal exactly when their
//! SHA-256 digests are equal, whatever representation produced them.

use crate::piece_table::PieceTable;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Compute the hex SHA-256 digest of a byte slice.
pub fn compute_content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Immutable content identity.
///
/// `hash`, `equals` and `to_bytes` never fail, even for content that is not
/// valid UTF-8.
pub trait ContentHandle: fmt::Debug + Send + Sync {
    /// Hex digest of the content.
    fn hash(&self) -> &str;

    /// Content length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_bytes(&self) -> Cow<'_, [u8]>;

    /// UTF-8 view of the content. Invalid sequences are replaced.
    fn to_text(&self) -> Cow<'_, str>;

    fn equals(&self, other: &dyn ContentHandle) -> bool {
        self.len() == other.len() && self.hash() == other.hash()
    }
}

/// Shared handle as stored by the tracker and carried in events.
pub type SharedContent = Arc<dyn ContentHandle>;

/// Constructor side of the content contract. Storage backends that take
/// part in sync supply one of these.
pub trait ContentHandleFactory: Send + Sync {
    fn from_bytes(&self, bytes: &[u8]) -> SharedContent;

    fn from_string(&self, text: &str) -> SharedContent {
        self.from_bytes(text.as_bytes())
    }

    fn empty(&self) -> SharedContent {
        self.from_bytes(&[])
    }
}

/// Flat byte buffer with its digest computed up front.
#[derive(Clone)]
pub struct BytesContent {
    bytes: Arc<[u8]>,
    hash: String,
}

impl BytesContent {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let hash = compute_content_hash(&bytes);
        Self { bytes, hash }
    }
}

impl fmt::Debug for BytesContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesContent")
            .field("len", &self.bytes.len())
            .field("hash", &&self.hash[..12])
            .finish()
    }
}

impl ContentHandle for BytesContent {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn to_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn to_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Content backed by a piece table snapshot.
///
/// The digest is streamed over the pieces on first use and cached, so the
/// document text is never materialised just to compare it.
pub struct PieceTableContent {
    table: PieceTable,
    hash: OnceLock<String>,
}

impl PieceTableContent {
    pub fn new(table: PieceTable) -> Self {
        Self {
            table,
            hash: OnceLock::new(),
        }
    }

    pub fn table(&self) -> &PieceTable {
        &self.table
    }
}

impl fmt::Debug for PieceTableContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceTableContent")
            .field("len", &self.table.len())
            .field("pieces", &self.table.pieces().len())
            .finish()
    }
}

impl ContentHandle for PieceTableContent {
    fn hash(&self) -> &str {
        self.hash.get_or_init(|| {
            let mut hasher = Sha256::new();
            self.table
                .for_each_slice(0, self.table.len(), |s| hasher.update(s.as_bytes()));
            hex::encode(hasher.finalize())
        })
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn to_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Owned(self.table.text().into_bytes())
    }

    fn to_text(&self) -> Cow<'_, str> {
        Cow::Owned(self.table.text())
    }
}

/// Factory producing [`BytesContent`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContentFactory;

impl ContentHandleFactory for DefaultContentFactory {
    fn from_bytes(&self, bytes: &[u8]) -> SharedContent {
        Arc::new(BytesContent::new(bytes))
    }
}
