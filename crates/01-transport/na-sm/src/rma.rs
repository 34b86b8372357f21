//! Memory handles and one-sided put/get.

use std::fs;
use std::io;
use std::mem::size_of;

use tracing::{debug, error};

use crate::addr::AddrId;
use crate::endpoint::SmEndpoint;
use crate::error::{NaError, NaResult};
use crate::op::{OpData, OpId, OpKind};

/// Most segments a handle may describe.
pub const IOV_MAX: usize = 1024;

const PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// One contiguous piece of registered memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemAccess {
    ReadOnly = 1,
    WriteOnly = 2,
    ReadWrite = 3,
}

impl MemAccess {
    fn from_raw(raw: u64) -> NaResult<Self> {
        match raw {
            1 => Ok(MemAccess::ReadOnly),
            2 => Ok(MemAccess::WriteOnly),
            3 => Ok(MemAccess::ReadWrite),
            _ => Err(NaError::InvalidArg),
        }
    }
}

/// Describes memory another process may read or write.
///
/// A handle only records addresses; the caller keeps the memory alive and
/// unaliased for as long as transfers may target it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemHandle {
    segments: Vec<Segment>,
    access: MemAccess,
    len: usize,
}

impl MemHandle {
    pub fn new(base: *const u8, len: usize, access: MemAccess) -> Self {
        Self {
            segments: vec![Segment {
                base: base as usize,
                len,
            }],
            access,
            len,
        }
    }

    pub fn from_slice(buf: &[u8]) -> Self {
        Self::new(buf.as_ptr(), buf.len(), MemAccess::ReadOnly)
    }

    pub fn from_mut_slice(buf: &mut [u8], access: MemAccess) -> Self {
        Self::new(buf.as_mut_ptr(), buf.len(), access)
    }

    pub fn from_segments(segments: Vec<Segment>, access: MemAccess) -> NaResult<Self> {
        if segments.len() > IOV_MAX {
            return Err(NaError::InvalidArg);
        }
        let len = total_len(&segments)?;
        Ok(Self {
            segments,
            access,
            len,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn access(&self) -> MemAccess {
        self.access
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn serialize_size(&self) -> usize {
        3 * size_of::<u64>() + self.segments.len() * 2 * size_of::<u64>()
    }

    /// Writes segment count, access flags, total length and the segment list.
    pub fn serialize(&self, buf: &mut [u8]) -> NaResult<()> {
        if buf.len() < self.serialize_size() {
            return Err(NaError::Overflow);
        }
        let header = [
            self.segments.len() as u64,
            self.access as u64,
            self.len as u64,
        ];
        let words = header
            .into_iter()
            .chain(self.segments.iter().flat_map(|s| [s.base as u64, s.len as u64]));
        for (chunk, word) in buf.chunks_exact_mut(size_of::<u64>()).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(())
    }

    pub fn deserialize(buf: &[u8]) -> NaResult<Self> {
        let mut words = buf.chunks_exact(size_of::<u64>()).map(|chunk| {
            let mut raw = [0u8; size_of::<u64>()];
            raw.copy_from_slice(chunk);
            u64::from_ne_bytes(raw)
        });
        let mut next = || words.next().ok_or(NaError::Overflow);

        let count = next()? as usize;
        if count == 0 {
            return Err(NaError::Fault);
        }
        if count > IOV_MAX {
            return Err(NaError::InvalidArg);
        }
        let access = MemAccess::from_raw(next()?)?;
        let len = next()? as usize;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let base = next()? as usize;
            let seg_len = next()? as usize;
            base.checked_add(seg_len).ok_or(NaError::Overflow)?;
            segments.push(Segment { base, len: seg_len });
        }
        if total_len(&segments)? != len {
            return Err(NaError::InvalidArg);
        }
        Ok(Self {
            segments,
            access,
            len,
        })
    }

    /// Segments covering `[offset, offset + length)` of this handle.
    fn range(&self, offset: usize, length: usize) -> NaResult<Vec<Segment>> {
        let end = offset.checked_add(length).ok_or(NaError::InvalidArg)?;
        if end > self.len {
            return Err(NaError::InvalidArg);
        }
        if offset == 0 && length == self.len {
            return Ok(self.segments.clone());
        }
        let translated = translate(&self.segments, offset, length)?;
        debug!(segments = translated.len(), "translated offset");
        Ok(translated)
    }
}

fn total_len(segments: &[Segment]) -> NaResult<usize> {
    segments
        .iter()
        .try_fold(0usize, |total, s| total.checked_add(s.len))
        .ok_or(NaError::Overflow)
}

/// Re-segments `segments` to the minimal list covering `length` bytes
/// starting `offset` bytes in.
pub fn translate(segments: &[Segment], offset: usize, length: usize) -> NaResult<Vec<Segment>> {
    let mut out = Vec::new();
    let mut skip = offset;
    let mut remaining = length;
    for seg in segments {
        if remaining == 0 {
            break;
        }
        if skip >= seg.len {
            skip -= seg.len;
            continue;
        }
        let len = (seg.len - skip).min(remaining);
        out.push(Segment {
            base: seg.base.checked_add(skip).ok_or(NaError::Overflow)?,
            len,
        });
        remaining -= len;
        skip = 0;
    }
    Ok(out)
}

fn ptrace_scope() -> i32 {
    fs::read_to_string(PTRACE_SCOPE)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[derive(Clone, Copy)]
enum Direction {
    Put,
    Get,
}

impl SmEndpoint {
    /// Writes `length` bytes of `local` into `remote` owned by `remote_addr`.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        length: usize,
        remote_addr: AddrId,
        context: u64,
        op: OpId,
    ) -> NaResult<()> {
        if remote.access() == MemAccess::ReadOnly {
            return Err(NaError::Permission);
        }
        self.rma(
            Direction::Put,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            context,
            op,
        )
    }

    /// Reads `length` bytes of `remote` owned by `remote_addr` into `local`.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        length: usize,
        remote_addr: AddrId,
        context: u64,
        op: OpId,
    ) -> NaResult<()> {
        if remote.access() == MemAccess::WriteOnly {
            return Err(NaError::Permission);
        }
        self.rma(
            Direction::Get,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            context,
            op,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn rma(
        &self,
        direction: Direction,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        length: usize,
        remote_addr: AddrId,
        context: u64,
        op_id: OpId,
    ) -> NaResult<()> {
        let local_segments = local.range(local_offset, length)?;
        let remote_segments = remote.range(remote_offset, length)?;
        let op = self.op(op_id)?;
        let peer = self.addrs.get(remote_addr)?;

        let kind = match direction {
            Direction::Put => OpKind::Put,
            Direction::Get => OpKind::Get,
        };
        op.begin(OpData::new(kind, context, Some(remote_addr), Vec::new(), 0))?;
        peer.acquire();

        let (name, moved) = match direction {
            Direction::Put => (
                "process_vm_writev",
                self.copier.write(peer.pid, &local_segments, &remote_segments),
            ),
            Direction::Get => (
                "process_vm_readv",
                self.copier.read(peer.pid, &local_segments, &remote_segments),
            ),
        };

        let outcome = match moved {
            Ok(n) if n == length => Ok(()),
            Ok(n) => {
                error!(op = name, moved = n, expected = length, "short transfer");
                Err(NaError::MsgSize)
            }
            Err(err) => Err(rma_error(name, err)),
        };

        if let Err(err) = outcome {
            op.abort();
            self.release_addr(remote_addr, &peer);
            return Err(err);
        }
        self.complete(op_id, &op, Ok(()), true);
        Ok(())
    }
}

fn rma_error(op: &'static str, err: io::Error) -> NaError {
    if err.raw_os_error() == Some(libc::EPERM) && ptrace_scope() != 0 {
        error!(
            op,
            %err,
            "Kernel Yama configuration does not allow cross-memory attach, either run as root: \
             `/usr/sbin/sysctl kernel.yama.ptrace_scope=0` or, if set to restricted, call \
             `prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0)` in the target application. \
             See https://www.kernel.org/doc/Documentation/security/Yama.txt"
        );
    } else {
        error!(op, %err, "cross-process copy failed");
    }
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(lens: &[usize]) -> Vec<Segment> {
        let mut base = 0x1000;
        lens.iter()
            .map(|&len| {
                let seg = Segment { base, len };
                base += 0x1000;
                seg
            })
            .collect()
    }

    #[test]
    fn translate_clips_first_and_last_segment() {
        let handle = segs(&[10, 20, 30]);
        let out = translate(&handle, 15, 20).unwrap();
        assert_eq!(
            out,
            vec![
                Segment { base: 0x2000 + 5, len: 15 },
                Segment { base: 0x3000, len: 5 },
            ]
        );
    }

    #[test]
    fn translate_on_segment_boundary() {
        let handle = segs(&[10, 20]);
        assert_eq!(translate(&handle, 10, 20), Ok(vec![Segment { base: 0x2000, len: 20 }]));
        assert_eq!(translate(&handle, 0, 10), Ok(vec![Segment { base: 0x1000, len: 10 }]));
    }

    #[test]
    fn range_rejects_overrun() {
        let handle = MemHandle::from_segments(segs(&[8, 8]), MemAccess::ReadWrite).unwrap();
        assert_eq!(handle.range(10, 7), Err(NaError::InvalidArg));
        assert_eq!(handle.range(0, 16).unwrap(), handle.segments().to_vec());
    }

    #[test]
    fn handle_serialization_round_trips() {
        let handle = MemHandle::from_segments(segs(&[4, 9, 1]), MemAccess::WriteOnly).unwrap();
        let mut buf = vec![0u8; handle.serialize_size()];
        assert_eq!(handle.serialize(&mut buf[..8]), Err(NaError::Overflow));
        handle.serialize(&mut buf).unwrap();
        assert_eq!(MemHandle::deserialize(&buf).unwrap(), handle);
        assert_eq!(MemHandle::deserialize(&buf[..30]), Err(NaError::Overflow));
    }

    #[test]
    fn deserialize_rejects_bad_headers() {
        let zero = [0u8; 24];
        assert_eq!(MemHandle::deserialize(&zero), Err(NaError::Fault));

        let mut bad_flags = Vec::new();
        for word in [1u64, 9, 4, 0x1000, 4] {
            bad_flags.extend_from_slice(&word.to_ne_bytes());
        }
        assert_eq!(MemHandle::deserialize(&bad_flags), Err(NaError::InvalidArg));
    }

    #[test]
    fn slice_handles_cover_one_segment() {
        let mut buf = [0u8; 12];
        let ro = MemHandle::from_slice(&buf);
        assert_eq!(ro.access(), MemAccess::ReadOnly);
        assert_eq!(ro.len(), 12);

        let rw = MemHandle::from_mut_slice(&mut buf, MemAccess::ReadWrite);
        assert_eq!(rw.segments(), ro.segments());
        assert_eq!(rw.access(), MemAccess::ReadWrite);
    }

    #[test]
    fn wrapping_segments_are_overflow() {
        let huge = vec![Segment { base: 0, len: usize::MAX }, Segment { base: 0, len: 1 }];
        assert_eq!(
            MemHandle::from_segments(huge, MemAccess::ReadOnly),
            Err(NaError::Overflow)
        );

        let near_top = [Segment { base: usize::MAX - 4, len: 16 }];
        assert_eq!(translate(&near_top, 8, 4), Err(NaError::Overflow));

        let mut wire = Vec::new();
        for word in [1u64, 3, 16, u64::MAX - 4, 16] {
            wire.extend_from_slice(&word.to_ne_bytes());
        }
        assert_eq!(MemHandle::deserialize(&wire), Err(NaError::Overflow));
    }

    #[test]
    fn deserialize_rejects_inconsistent_length() {
        let mut wire = Vec::new();
        for word in [2u64, 3, 100, 0x1000, 8, 0x2000, 8] {
            wire.extend_from_slice(&word.to_ne_bytes());
        }
        assert_eq!(MemHandle::deserialize(&wire), Err(NaError::InvalidArg));
    }

    #[test]
    fn too_many_segments_rejected() {
        let many = vec![Segment { base: 0, len: 1 }; IOV_MAX + 1];
        assert_eq!(
            MemHandle::from_segments(many, MemAccess::ReadOnly),
            Err(NaError::InvalidArg)
        );
    }

    #[cfg(feature = "proptest")]
    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn translated_bytes_match_flat_range(
                lens in proptest::collection::vec(1usize..64, 1..12),
                start in 0usize..1024,
                span in 0usize..1024,
            ) {
                let total: usize = lens.iter().sum();
                let offset = start % total;
                let length = span % (total - offset + 1);
                let handle = segs(&lens);

                let flat: Vec<usize> = handle
                    .iter()
                    .flat_map(|s| s.base..s.base + s.len)
                    .collect();
                let out = translate(&handle, offset, length).unwrap();
                let got: Vec<usize> = out.iter().flat_map(|s| s.base..s.base + s.len).collect();

                prop_assert_eq!(got, flat[offset..offset + length].to_vec());
                prop_assert!(out.iter().all(|s| s.len > 0));
            }
        }
    }
}
