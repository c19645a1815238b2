//! Binary delta codec
//!
//! Deltas use the copy/insert instruction format popularized by git packs:
//! - header: varint base length, varint result length
//! - copy: `1xxxxxxx`, up to 4 offset bytes and 3 size bytes selected by
//!   the low bits (a size of 0 means 0x10000)
//! - insert: `0nnnnnnn` followed by `n` literal bytes (1..=127)
//!
//! Content resolution only needs a delta's [`PatchMapping`]s, which lets a
//! [`PatchedView`](crate::patched::PatchedView) answer reads lazily instead
//! of materializing every hop.

use std::collections::HashMap;

use crate::error::{Error, Result};

const BLOCK: usize = 16;
const MAX_INSERT: usize = 0x7f;
const MAX_COPY: usize = 0x10000;

/// Where one contiguous run of output bytes comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMapping {
    /// Bytes copied from the base
    Base { offset: usize, len: usize },
    /// Literal bytes stored inside the delta itself
    Delta { offset: usize, len: usize },
}

impl PatchMapping {
    pub fn len(&self) -> usize {
        match *self {
            PatchMapping::Base { len, .. } | PatchMapping::Delta { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes and interprets deltas between file versions.
pub trait DeltaCodec: Send + Sync {
    /// Delta that turns `base` into `modified`
    fn compute_delta(&self, base: &[u8], modified: &[u8]) -> Vec<u8>;

    /// Output layout described by `delta` when applied to a base of `base_len` bytes
    fn patch_mappings(&self, delta: &[u8], base_len: usize) -> Result<Vec<PatchMapping>>;
}

/// Copy/insert delta codec with a fixed-block index over the base.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitDeltaCodec;

impl GitDeltaCodec {
    pub fn new() -> Self {
        Self
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = *delta
            .get(*pos)
            .ok_or_else(|| Error::Corruption("Truncated delta header".to_string()))?;
        *pos += 1;
        if shift > 56 {
            return Err(Error::Corruption("Delta header varint overflow".to_string()));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn flush_insert(out: &mut Vec<u8>, pending: &mut Vec<u8>) {
    for chunk in pending.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    pending.clear();
}

fn emit_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let size = len.min(MAX_COPY);
        let mut cmd = 0x80u8;
        let mut args = Vec::with_capacity(7);
        for i in 0..4 {
            let byte = ((offset >> (8 * i)) & 0xff) as u8;
            if byte != 0 {
                cmd |= 1 << i;
                args.push(byte);
            }
        }
        if size != MAX_COPY {
            for i in 0..3 {
                let byte = ((size >> (8 * i)) & 0xff) as u8;
                if byte != 0 {
                    cmd |= 1 << (4 + i);
                    args.push(byte);
                }
            }
        }
        out.push(cmd);
        out.extend_from_slice(&args);
        offset += size;
        len -= size;
    }
}

impl DeltaCodec for GitDeltaCodec {
    fn compute_delta(&self, base: &[u8], modified: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(modified.len() / 2 + 16);
        write_varint(&mut out, base.len());
        write_varint(&mut out, modified.len());

        // first occurrence of each aligned block; offsets must fit the 4-byte copy field
        let mut index: HashMap<&[u8], usize> = HashMap::new();
        let indexable = base.len().min(u32::MAX as usize);
        let mut at = 0;
        while at + BLOCK <= indexable {
            index.entry(&base[at..at + BLOCK]).or_insert(at);
            at += BLOCK;
        }

        let mut pending = Vec::new();
        let mut i = 0;
        while i < modified.len() {
            let hit = if i + BLOCK <= modified.len() {
                index.get(&modified[i..i + BLOCK]).copied()
            } else {
                None
            };
            match hit {
                Some(start) => {
                    let mut len = BLOCK;
                    while start + len < indexable
                        && i + len < modified.len()
                        && base[start + len] == modified[i + len]
                    {
                        len += 1;
                    }
                    flush_insert(&mut out, &mut pending);
                    emit_copy(&mut out, start, len);
                    i += len;
                }
                None => {
                    pending.push(modified[i]);
                    i += 1;
                }
            }
        }
        flush_insert(&mut out, &mut pending);
        out
    }

    fn patch_mappings(&self, delta: &[u8], base_len: usize) -> Result<Vec<PatchMapping>> {
        let mut pos = 0;
        let declared_base = read_varint(delta, &mut pos)?;
        if declared_base != base_len {
            return Err(Error::Corruption(format!(
                "Delta expects a base of {} bytes but got {}",
                declared_base, base_len
            )));
        }
        let result_len = read_varint(delta, &mut pos)?;

        let mut mappings = Vec::new();
        let mut produced = 0usize;
        while pos < delta.len() {
            let cmd = delta[pos];
            pos += 1;
            if cmd & 0x80 != 0 {
                let mut offset = 0usize;
                let mut size = 0usize;
                for i in 0..4 {
                    if cmd & (1 << i) != 0 {
                        let byte = *delta
                            .get(pos)
                            .ok_or_else(|| Error::Corruption("Truncated copy offset".to_string()))?;
                        offset |= (byte as usize) << (8 * i);
                        pos += 1;
                    }
                }
                for i in 0..3 {
                    if cmd & (1 << (4 + i)) != 0 {
                        let byte = *delta
                            .get(pos)
                            .ok_or_else(|| Error::Corruption("Truncated copy size".to_string()))?;
                        size |= (byte as usize) << (8 * i);
                        pos += 1;
                    }
                }
                if size == 0 {
                    size = MAX_COPY;
                }
                if offset + size > base_len {
                    return Err(Error::Corruption(format!(
                        "Delta copies {}..{} past base of {} bytes",
                        offset,
                        offset + size,
                        base_len
                    )));
                }
                mappings.push(PatchMapping::Base { offset, len: size });
                produced += size;
            } else if cmd != 0 {
                let len = cmd as usize;
                if pos + len > delta.len() {
                    return Err(Error::Corruption("Truncated delta insert".to_string()));
                }
                mappings.push(PatchMapping::Delta { offset: pos, len });
                pos += len;
                produced += len;
            } else {
                return Err(Error::Corruption("Reserved delta opcode 0".to_string()));
            }
        }

        if produced != result_len {
            return Err(Error::Corruption(format!(
                "Delta produced {} bytes, header says {}",
                produced, result_len
            )));
        }
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patched::PatchedView;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn apply(codec: &GitDeltaCodec, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let view = PatchedView::base(Bytes::copy_from_slice(base))
            .patch(codec, Bytes::copy_from_slice(delta))?;
        Ok(view.to_vec())
    }

    fn roundtrip(base: &[u8], modified: &[u8]) -> Vec<u8> {
        let codec = GitDeltaCodec::new();
        let delta = codec.compute_delta(base, modified);
        apply(&codec, base, &delta).unwrap()
    }

    #[test]
    fn test_small_edit_uses_copies() {
        let base: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut modified = base.clone();
        modified[2000] ^= 0xff;
        modified.extend_from_slice(b"tail");

        let codec = GitDeltaCodec::new();
        let delta = codec.compute_delta(&base, &modified);
        assert!(delta.len() < 200, "delta was {} bytes", delta.len());
        assert_eq!(apply(&codec, &base, &delta).unwrap(), modified);
    }

    #[test]
    fn test_long_copy_splits_at_max() {
        let base = vec![7u8; MAX_COPY * 2 + 100];
        assert_eq!(roundtrip(&base, &base), base);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(roundtrip(b"", b""), b"");
        assert_eq!(roundtrip(b"", b"new content"), b"new content");
        assert_eq!(roundtrip(b"old content", b""), b"");
    }

    #[test]
    fn test_rejects_wrong_base_length() {
        let codec = GitDeltaCodec::new();
        let delta = codec.compute_delta(b"abc", b"abcd");
        let err = apply(&codec, b"abcdef", &delta).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_rejects_truncated_delta() {
        let codec = GitDeltaCodec::new();
        let delta = codec.compute_delta(b"", b"hello world");
        let err = codec.patch_mappings(&delta[..delta.len() - 3], 0).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    proptest! {
        #[test]
        fn delta_reproduces_modified(
            base in proptest::collection::vec(any::<u8>(), 0..2048),
            edits in proptest::collection::vec((any::<usize>(), any::<u8>()), 0..8),
            tail in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut modified = base.clone();
            for (pos, byte) in edits {
                if !modified.is_empty() {
                    let at = pos % modified.len();
                    modified[at] = byte;
                }
            }
            modified.extend_from_slice(&tail);
            prop_assert_eq!(roundtrip(&base, &modified), modified);
        }
    }
}
