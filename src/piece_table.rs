//! Piece table text buffer.
//!
//! A document is an ordered sequence of pieces, each pointing at a slice of
//! either the immutable `original` buffer or the shared, append-only `add`
//! buffer. Every edit returns a new [`PieceTable`]; older values stay valid
//! because already-referenced bytes of the add buffer are never rewritten.
//! Keeping prior tables around is therefore a cheap undo history.
//!
//! Offsets and lengths are UTF-8 byte offsets. An offset that would split a
//! multi-byte character is rejected with [`RangeError::NotCharBoundary`].

use crate::error::RangeError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Above this combined size `replace_all` skips diffing and swaps the text wholesale.
const DIFF_SIZE_LIMIT: usize = 64 * 1024;

/// Diffs that run longer than this settle for a coarser result.
const DIFF_TIMEOUT: Duration = Duration::from_millis(50);

/// Edit scripts with more operations than this are applied as one swap.
const MAX_DIFF_OPS: usize = 512;

/// Which backing buffer a piece points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferId {
    Original,
    Add,
}

/// A slice `start..start + length` of one backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub buffer_id: BufferId,
    pub start: usize,
    pub length: usize,
}

/// Serialisable form of a piece table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceTableSnapshot {
    pub buffers: SnapshotBuffers,
    pub pieces: Vec<Piece>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBuffers {
    pub original: String,
    pub add: String,
}

/// Append-only buffer shared by every table derived from the same root.
///
/// Two tables edited independently from a common ancestor both append here;
/// each keeps its own offsets, so neither observes the other's text.
#[derive(Debug, Default)]
struct AddBuffer {
    data: RwLock<String>,
}

impl AddBuffer {
    fn append(&self, text: &str) -> usize {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let start = data.len();
        data.push_str(text);
        start
    }

    fn with<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&data)
    }
}

/// Immutable piece table value.
#[derive(Debug, Clone)]
pub struct PieceTable {
    original: Arc<str>,
    add: Arc<AddBuffer>,
    pieces: Arc<[Piece]>,
    len: usize,
}

impl PieceTable {
    /// Create a table over `text`: one original piece, or none when empty.
    pub fn new(text: &str) -> Self {
        let pieces: Arc<[Piece]> = if text.is_empty() {
            Arc::from(Vec::new())
        } else {
            Arc::from(vec![Piece {
                buffer_id: BufferId::Original,
                start: 0,
                length: text.len(),
            }])
        };
        Self {
            original: Arc::from(text),
            add: Arc::new(AddBuffer::default()),
            pieces,
            len: text.len(),
        }
    }

    /// Logical document length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Full document text.
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.len);
        self.for_each_slice(0, self.len, |s| out.push_str(s));
        out
    }

    /// Text of `start..end`.
    pub fn get_text(&self, start: usize, end: usize) -> Result<String, RangeError> {
        if end < start || end > self.len {
            return Err(RangeError::InvalidRange {
                start,
                end,
                len: self.len,
            });
        }
        self.check_boundary(start)?;
        self.check_boundary(end)?;
        let mut out = String::with_capacity(end - start);
        self.for_each_slice(start, end, |s| out.push_str(s));
        Ok(out)
    }

    /// Feed every document slice overlapping `start..end` to `f`, in order,
    /// without materialising the whole text.
    pub fn for_each_slice(&self, start: usize, end: usize, mut f: impl FnMut(&str)) {
        self.add.with(|add| {
            let mut pos = 0;
            for piece in self.pieces.iter() {
                let piece_end = pos + piece.length;
                if piece_end > start && pos < end {
                    let from = start.saturating_sub(pos);
                    let to = piece.length.min(end - pos);
                    let buf = match piece.buffer_id {
                        BufferId::Original => &self.original[..],
                        BufferId::Add => add,
                    };
                    if let Some(slice) = buf.get(piece.start + from..piece.start + to) {
                        f(slice);
                    }
                }
                if piece_end >= end {
                    break;
                }
                pos = piece_end;
            }
        });
    }

    /// Insert `text` at `offset`. Empty text returns the table unchanged.
    pub fn insert(&self, offset: usize, text: &str) -> Result<Self, RangeError> {
        if offset > self.len {
            return Err(RangeError::OutOfBounds {
                offset,
                len: self.len,
            });
        }
        self.check_boundary(offset)?;
        if text.is_empty() {
            return Ok(self.clone());
        }

        let new_piece = Piece {
            buffer_id: BufferId::Add,
            start: self.add.append(text),
            length: text.len(),
        };

        let mut pieces = Vec::with_capacity(self.pieces.len() + 2);
        let mut pos = 0;
        let mut inserted = false;
        for piece in self.pieces.iter() {
            let piece_end = pos + piece.length;
            if !inserted && offset >= pos && offset < piece_end {
                let left = offset - pos;
                if left > 0 {
                    pieces.push(Piece {
                        length: left,
                        ..*piece
                    });
                }
                pieces.push(new_piece);
                pieces.push(Piece {
                    buffer_id: piece.buffer_id,
                    start: piece.start + left,
                    length: piece.length - left,
                });
                inserted = true;
            } else {
                pieces.push(*piece);
            }
            pos = piece_end;
        }
        if !inserted {
            pieces.push(new_piece);
        }

        Ok(self.derive(pieces, self.len + text.len()))
    }

    /// Remove `length` bytes starting at `offset`.
    ///
    /// Adjacent pieces are not merged afterwards.
    pub fn delete(&self, offset: usize, length: usize) -> Result<Self, RangeError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.len)
            .ok_or(RangeError::InvalidRange {
                start: offset,
                end: offset.saturating_add(length),
                len: self.len,
            })?;
        self.check_boundary(offset)?;
        self.check_boundary(end)?;
        if length == 0 {
            return Ok(self.clone());
        }

        let mut pieces = Vec::with_capacity(self.pieces.len() + 1);
        let mut pos = 0;
        for piece in self.pieces.iter() {
            let piece_end = pos + piece.length;
            if piece_end <= offset || pos >= end {
                pieces.push(*piece);
            } else {
                if pos < offset {
                    pieces.push(Piece {
                        length: offset - pos,
                        ..*piece
                    });
                }
                if piece_end > end {
                    let cut = end - pos;
                    pieces.push(Piece {
                        buffer_id: piece.buffer_id,
                        start: piece.start + cut,
                        length: piece.length - cut,
                    });
                }
            }
            pos = piece_end;
        }

        Ok(self.derive(pieces, self.len - length))
    }

    /// Swap the whole document for `text` in one delete and one insert.
    pub fn replace_whole(&self, text: &str) -> Result<Self, RangeError> {
        self.delete(0, self.len)?.insert(0, text)
    }

    /// Replace the whole document with `new_text`, expressed as a series of
    /// deletes and inserts so unchanged regions keep their pieces.
    ///
    /// Large inputs are swapped wholesale, and the diff is bounded by a
    /// timeout after which it falls back to a coarser edit script.
    pub fn replace_all(&self, new_text: &str) -> Result<Self, RangeError> {
        let old_text = self.text();
        if old_text == new_text {
            return Ok(self.clone());
        }
        if old_text.len() + new_text.len() > DIFF_SIZE_LIMIT {
            return self.replace_whole(new_text);
        }

        let diff = similar::TextDiff::configure()
            .timeout(DIFF_TIMEOUT)
            .diff_chars(old_text.as_str(), new_text);
        if diff.ops().len() > MAX_DIFF_OPS {
            return self.replace_whole(new_text);
        }
        let old_offsets = char_offsets(&old_text);
        let new_offsets = char_offsets(new_text);
        let mut table = self.clone();
        // Offsets into the table being built: old ops are shifted by what was
        // inserted or removed before them.
        let mut shift: isize = 0;
        for op in diff.ops() {
            let old_range = op.old_range();
            let new_range = op.new_range();
            let (old_start, old_end) = (old_offsets[old_range.start], old_offsets[old_range.end]);
            let (new_start, new_end) = (new_offsets[new_range.start], new_offsets[new_range.end]);
            let at = (old_start as isize + shift) as usize;
            match op.tag() {
                similar::DiffTag::Equal => {}
                similar::DiffTag::Delete => {
                    table = table.delete(at, old_end - old_start)?;
                    shift -= (old_end - old_start) as isize;
                }
                similar::DiffTag::Insert => {
                    table = table.insert(at, &new_text[new_start..new_end])?;
                    shift += (new_end - new_start) as isize;
                }
                similar::DiffTag::Replace => {
                    table = table.delete(at, old_end - old_start)?;
                    table = table.insert(at, &new_text[new_start..new_end])?;
                    shift += (new_end - new_start) as isize - (old_end - old_start) as isize;
                }
            }
        }
        Ok(table)
    }

    /// Serialisable copy of the buffers and pieces.
    ///
    /// The add buffer is compacted to the ranges this table references, so
    /// text appended by other tables sharing it is left out.
    pub fn to_snapshot(&self) -> PieceTableSnapshot {
        let mut add = String::new();
        let pieces = self.add.with(|shared| {
            self.pieces
                .iter()
                .map(|piece| match piece.buffer_id {
                    BufferId::Original => *piece,
                    BufferId::Add => {
                        let start = add.len();
                        add.push_str(&shared[piece.start..piece.start + piece.length]);
                        Piece { start, ..*piece }
                    }
                })
                .collect()
        });
        PieceTableSnapshot {
            buffers: SnapshotBuffers {
                original: self.original.to_string(),
                add,
            },
            pieces,
        }
    }

    /// Rebuild a table from a snapshot, checking every piece against its buffer.
    pub fn from_snapshot(snapshot: PieceTableSnapshot) -> Result<Self, RangeError> {
        let PieceTableSnapshot { buffers, pieces } = snapshot;
        let mut len = 0usize;
        for (i, piece) in pieces.iter().enumerate() {
            let buf = match piece.buffer_id {
                BufferId::Original => &buffers.original,
                BufferId::Add => &buffers.add,
            };
            let end = piece.start.checked_add(piece.length);
            let valid = end.is_some_and(|end| buf.get(piece.start..end).is_some());
            if !valid {
                return Err(RangeError::InvalidSnapshot(format!(
                    "piece {} ({:?} {}+{}) exceeds buffer of length {}",
                    i,
                    piece.buffer_id,
                    piece.start,
                    piece.length,
                    buf.len()
                )));
            }
            len += piece.length;
        }

        Ok(Self {
            original: Arc::from(buffers.original),
            add: Arc::new(AddBuffer {
                data: RwLock::new(buffers.add),
            }),
            pieces: Arc::from(pieces),
            len,
        })
    }

    fn derive(&self, pieces: Vec<Piece>, len: usize) -> Self {
        Self {
            original: Arc::clone(&self.original),
            add: Arc::clone(&self.add),
            pieces: Arc::from(pieces),
            len,
        }
    }

    /// Reject offsets that fall inside a multi-byte character.
    fn check_boundary(&self, offset: usize) -> Result<(), RangeError> {
        if offset == 0 || offset == self.len {
            return Ok(());
        }
        let mut on_boundary = true;
        self.add.with(|add| {
            let mut pos = 0;
            for piece in self.pieces.iter() {
                if offset < pos + piece.length {
                    let buf = match piece.buffer_id {
                        BufferId::Original => &self.original[..],
                        BufferId::Add => add,
                    };
                    on_boundary = buf.is_char_boundary(piece.start + offset - pos);
                    return;
                }
                pos += piece.length;
            }
        });
        if on_boundary {
            Ok(())
        } else {
            Err(RangeError::NotCharBoundary(offset))
        }
    }

    #[cfg(test)]
    fn add_len(&self) -> usize {
        self.add.with(str::len)
    }

    #[cfg(test)]
    fn buffer_range_valid(&self, piece: &Piece) -> bool {
        match piece.buffer_id {
            BufferId::Original => piece.start + piece.length <= self.original.len(),
            BufferId::Add => piece.start + piece.length <= self.add_len(),
        }
    }
}

impl Default for PieceTable {
    fn default() -> Self {
        Self::new("")
    }
}

/// Byte offset of every char index, plus one trailing entry for the end.
fn char_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(table: &PieceTable) {
        let total: usize = table.pieces().iter().map(|p| p.length).sum();
        assert_eq!(total, table.len());
        for piece in table.pieces() {
            assert!(table.buffer_range_valid(piece), "piece out of range: {:?}", piece);
        }
    }

    #[test]
    fn test_new_single_piece() {
        let table = PieceTable::new("hello");
        assert_eq!(table.pieces().len(), 1);
        assert_eq!(table.text(), "hello");
        assert!(PieceTable::new("").pieces().is_empty());
    }

    #[test]
    fn test_insert_at_every_offset() {
        let s = "hello world";
        for i in 0..=s.len() {
            let table = PieceTable::new(s).insert(i, "XY").unwrap();
            assert_eq!(table.text(), format!("{}XY{}", &s[..i], &s[i..]), "offset {}", i);
            assert_invariants(&table);
        }
    }

    #[test]
    fn test_insert_into_empty() {
        let table = PieceTable::new("").insert(0, "abc").unwrap();
        assert_eq!(table.text(), "abc");
        assert_eq!(table.pieces().len(), 1);
    }

    #[test]
    fn test_insert_empty_is_noop() {
        let table = PieceTable::new("abc");
        let same = table.insert(1, "").unwrap();
        assert_eq!(same.pieces(), table.pieces());
    }

    #[test]
    fn test_insert_out_of_range() {
        let table = PieceTable::new("abc");
        assert_eq!(
            table.insert(4, "x").unwrap_err(),
            RangeError::OutOfBounds { offset: 4, len: 3 }
        );
    }

    #[test]
    fn test_insert_splits_without_empty_remainders() {
        let table = PieceTable::new("abcd").insert(2, "X").unwrap();
        assert_eq!(table.pieces().len(), 3);
        let table = table.insert(0, "<").unwrap();
        assert_eq!(table.pieces().len(), 4);
        let table = table.insert(table.len(), ">").unwrap();
        assert_eq!(table.pieces().len(), 5);
        assert_eq!(table.text(), "<abXcd>");
    }

    #[test]
    fn test_delete_every_range() {
        let s = "the quick brown fox";
        for offset in 0..s.len() {
            for length in 0..=(s.len() - offset) {
                let table = PieceTable::new(s).insert(4, "very ").unwrap();
                let text = table.text();
                let deleted = table.delete(offset, length).unwrap();
                let expected = format!("{}{}", &text[..offset], &text[offset + length..]);
                assert_eq!(deleted.text(), expected);
                assert_invariants(&deleted);

                let restored = deleted
                    .insert(offset, &text[offset..offset + length])
                    .unwrap();
                assert_eq!(restored.text(), text);
            }
        }
    }

    #[test]
    fn test_delete_out_of_range() {
        let table = PieceTable::new("abc");
        assert!(matches!(
            table.delete(2, 2),
            Err(RangeError::InvalidRange { .. })
        ));
        assert!(table.delete(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_get_text_ranges() {
        let table = PieceTable::new("hello").insert(5, " world").unwrap();
        assert_eq!(table.get_text(3, 8).unwrap(), "lo wo");
        assert_eq!(table.get_text(0, 0).unwrap(), "");
        assert!(table.get_text(4, 3).is_err());
        assert!(table.get_text(0, 12).is_err());
    }

    #[test]
    fn test_old_snapshot_survives_edits() {
        let v1 = PieceTable::new("base");
        let v2 = v1.insert(4, " one").unwrap();
        let v3 = v1.insert(0, "two ").unwrap();
        let v4 = v2.delete(0, 2).unwrap();
        assert_eq!(v1.text(), "base");
        assert_eq!(v2.text(), "base one");
        assert_eq!(v3.text(), "two base");
        assert_eq!(v4.text(), "se one");
    }

    #[test]
    fn test_multibyte_boundaries() {
        let table = PieceTable::new("héllo");
        assert_eq!(
            table.insert(2, "x").unwrap_err(),
            RangeError::NotCharBoundary(2)
        );
        assert_eq!(table.insert(3, "x").unwrap().text(), "héxllo");
        assert!(matches!(
            table.delete(1, 1),
            Err(RangeError::NotCharBoundary(2))
        ));
    }

    #[test]
    fn test_replace_all_reuses_pieces() {
        let table = PieceTable::new("hello world");
        let replaced = table.replace_all("hello brave world!").unwrap();
        assert_eq!(replaced.text(), "hello brave world!");
        assert!(replaced
            .pieces()
            .iter()
            .any(|p| p.buffer_id == BufferId::Original));
        assert_invariants(&replaced);

        let unicode = PieceTable::new("naïve café").replace_all("naïf cafés").unwrap();
        assert_eq!(unicode.text(), "naïf cafés");
    }

    #[test]
    fn test_snapshot_validation() {
        let table = PieceTable::new("abc").insert(1, "ZZ").unwrap();
        let snapshot = table.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = PieceTable::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.text(), "aZZbc");

        let mut broken = snapshot;
        broken.pieces[0].length = 99;
        assert!(matches!(
            PieceTable::from_snapshot(broken),
            Err(RangeError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_replace_all_large_rewrite_is_wholesale() {
        let old: String = (0..100_000u32).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let new: String = (0..100_000u32).map(|i| char::from(b'a' + (i * 7 % 26) as u8)).collect();
        let table = PieceTable::new(&old);

        let started = std::time::Instant::now();
        let replaced = table.replace_all(&new).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(replaced.text(), new);
        assert_eq!(replaced.pieces().len(), 1);
        assert_invariants(&replaced);
    }

    #[test]
    fn test_replace_all_below_limit_still_correct() {
        let old: String = (0..4_000u32).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let new: String = (0..4_000u32).map(|i| char::from(b'a' + (i * 11 % 26) as u8)).collect();
        let replaced = PieceTable::new(&old).replace_all(&new).unwrap();
        assert_eq!(replaced.text(), new);
        assert_invariants(&replaced);
    }

    #[test]
    fn test_replace_whole() {
        let table = PieceTable::new("abc").insert(3, "def").unwrap();
        let replaced = table.replace_whole("xyz").unwrap();
        assert_eq!(replaced.text(), "xyz");
        assert_eq!(table.text(), "abcdef");
        assert_eq!(PieceTable::new("").replace_whole("").unwrap().text(), "");
    }

    #[test]
    fn test_snapshot_compacts_add_buffer() {
        let root = PieceTable::new("base");
        // A sibling branch and a discarded edit both append to the shared buffer.
        let _sibling = root.insert(0, &"sibling text ".repeat(100)).unwrap();
        let discarded = root.insert(4, " discarded").unwrap();
        let _ = discarded.delete(4, 10).unwrap();
        let kept = root.insert(4, "!").unwrap();
        assert!(kept.add_len() > 1000);

        let snapshot = kept.to_snapshot();
        assert_eq!(snapshot.buffers.add, "!");
        let restored = PieceTable::from_snapshot(snapshot).unwrap();
        assert_eq!(restored.text(), "base!");
        assert_invariants(&restored);
    }
}
