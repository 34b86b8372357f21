//! Packed 64-bit headers carried through the rings.
//!
//! Message header: `tag:32 | size:16 | buffer index:8 | type:8`.
//! Command header: `pid:32 | id:8 | pair index:8 | type:8 | reserved:8`.
//!
//! The type field occupies a non-zero byte in both layouts, so an encoded
//! header is never zero and can travel through an [`AtomicRing`].
//!
//! [`AtomicRing`]: crate::AtomicRing

use crate::error::{TransportError, TransportResult};

/// Kind of a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    SendUnexpected = 1,
    SendExpected = 3,
}

impl MsgType {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MsgType::SendUnexpected),
            3 => Some(MsgType::SendExpected),
            _ => None,
        }
    }
}

/// Describes one staged payload: which copy buffer holds it and how much of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    pub buf_idx: u8,
    pub buf_size: u16,
    pub tag: u32,
}

impl MsgHeader {
    pub fn encode(&self) -> u64 {
        u64::from(self.tag)
            | u64::from(self.buf_size) << 32
            | u64::from(self.buf_idx) << 48
            | u64::from(self.msg_type as u8) << 56
    }

    pub fn decode(raw: u64) -> TransportResult<Self> {
        let msg_type =
            MsgType::from_raw((raw >> 56) as u8).ok_or(TransportError::InvalidHeader { raw })?;
        Ok(Self {
            msg_type,
            buf_idx: (raw >> 48) as u8,
            buf_size: (raw >> 32) as u16,
            tag: raw as u32,
        })
    }
}

/// Kind of a command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdType {
    Reserved = 1,
    Released = 2,
}

/// Handshake command announcing that a queue pair was taken or given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub cmd_type: CmdType,
    pub pid: u32,
    pub id: u8,
    pub pair_idx: u8,
}

impl CmdHeader {
    pub fn encode(&self) -> u64 {
        u64::from(self.pid)
            | u64::from(self.id) << 32
            | u64::from(self.pair_idx) << 40
            | u64::from(self.cmd_type as u8) << 48
    }

    pub fn decode(raw: u64) -> TransportResult<Self> {
        let cmd_type = match (raw >> 48) as u8 {
            1 => CmdType::Reserved,
            2 => CmdType::Released,
            _ => return Err(TransportError::InvalidHeader { raw }),
        };
        Ok(Self {
            cmd_type,
            pid: raw as u32,
            id: (raw >> 32) as u8,
            pair_idx: (raw >> 40) as u8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_header_field_positions() {
        let hdr = MsgHeader {
            msg_type: MsgType::SendExpected,
            buf_idx: 0x3f,
            buf_size: 0x1000,
            tag: 0xdead_beef,
        };
        let raw = hdr.encode();
        assert_eq!(raw, 0x03_3f_1000_dead_beef);
        assert_eq!(MsgHeader::decode(raw).expect("decode"), hdr);
    }

    #[test]
    fn zero_tag_and_size_still_non_zero() {
        let hdr = MsgHeader {
            msg_type: MsgType::SendUnexpected,
            buf_idx: 0,
            buf_size: 0,
            tag: 0,
        };
        assert_ne!(hdr.encode(), 0, "type byte keeps headers distinguishable from empty slots");
    }

    #[test]
    fn cmd_header_field_positions() {
        let hdr = CmdHeader {
            cmd_type: CmdType::Released,
            pid: 4242,
            id: 7,
            pair_idx: 255,
        };
        let raw = hdr.encode();
        assert_eq!(raw >> 48, 2);
        assert_eq!((raw >> 40) & 0xff, 255);
        assert_eq!((raw >> 32) & 0xff, 7);
        assert_eq!(raw & 0xffff_ffff, 4242);
        assert_eq!(CmdHeader::decode(raw).expect("decode"), hdr);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            MsgHeader::decode(0x02 << 56),
            Err(TransportError::InvalidHeader { .. })
        ));
        assert!(matches!(
            CmdHeader::decode(0),
            Err(TransportError::InvalidHeader { raw: 0 })
        ));
    }
}
