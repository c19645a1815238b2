//! Lazily patched byte views
//!
//! A [`PatchedView`] stacks deltas over a base without materializing the
//! intermediate versions. Each layer keeps only the segment table decoded
//! from its delta; reads walk down the stack to the bytes they need.

use bytes::Bytes;

use crate::delta::{DeltaCodec, PatchMapping};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Segment {
    out_start: usize,
    source: PatchMapping,
}

#[derive(Debug, Clone)]
enum Layer {
    Base(Bytes),
    Patched {
        underlying: Box<PatchedView>,
        delta: Bytes,
        segments: Vec<Segment>,
        len: usize,
    },
}

/// Read-only view over a base plus zero or more deltas.
#[derive(Debug, Clone)]
pub struct PatchedView {
    layer: Layer,
}

impl PatchedView {
    pub fn base(bytes: Bytes) -> Self {
        Self {
            layer: Layer::Base(bytes),
        }
    }

    /// Stack one more delta on top of this view.
    pub fn patch<C: DeltaCodec + ?Sized>(self, codec: &C, delta: Bytes) -> Result<Self> {
        let mappings = codec.patch_mappings(&delta, self.len())?;
        let mut segments = Vec::with_capacity(mappings.len());
        let mut out_start = 0;
        for source in mappings {
            if source.is_empty() {
                continue;
            }
            segments.push(Segment { out_start, source });
            out_start += source.len();
        }
        Ok(Self {
            layer: Layer::Patched {
                underlying: Box::new(self),
                delta,
                segments,
                len: out_start,
            },
        })
    }

    pub fn len(&self) -> usize {
        match &self.layer {
            Layer::Base(bytes) => bytes.len(),
            Layer::Patched { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of deltas stacked over the base.
    pub fn depth(&self) -> usize {
        match &self.layer {
            Layer::Base(_) => 0,
            Layer::Patched { underlying, .. } => underlying.depth() + 1,
        }
    }

    /// Copy bytes starting at `offset` into `dest`. Returns how many were copied,
    /// which is less than `dest.len()` only at the end of the view.
    pub fn read_into(&self, offset: usize, dest: &mut [u8]) -> usize {
        let total = self.len();
        if offset >= total {
            return 0;
        }
        let wanted = dest.len().min(total - offset);
        match &self.layer {
            Layer::Base(bytes) => {
                dest[..wanted].copy_from_slice(&bytes[offset..offset + wanted]);
                wanted
            }
            Layer::Patched {
                underlying,
                delta,
                segments,
                ..
            } => {
                let mut idx = segments.partition_point(|s| s.out_start <= offset) - 1;
                let mut copied = 0;
                while copied < wanted {
                    let segment = &segments[idx];
                    let pos = offset + copied;
                    let within = pos - segment.out_start;
                    let n = (segment.source.len() - within).min(wanted - copied);
                    let out = &mut dest[copied..copied + n];
                    match segment.source {
                        PatchMapping::Base { offset: base, .. } => {
                            underlying.read_into(base + within, out);
                        }
                        PatchMapping::Delta { offset: start, .. } => {
                            out.copy_from_slice(&delta[start + within..start + within + n]);
                        }
                    }
                    copied += n;
                    idx += 1;
                }
                copied
            }
        }
    }

    /// Materialize the whole view.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.read_into(0, &mut out);
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        match &self.layer {
            Layer::Base(bytes) => bytes.clone(),
            Layer::Patched { .. } => Bytes::from(self.to_vec()),
        }
    }
}
