// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster sync protocol messages
//!
//! Every datagram is laid out as:
//!
//! ```text
//! +------+---------------------------+--------------------+
//! | type | fixed header (LE integers)| extra bytes (opt.) |
//! | u8   | size depends on type      | up to MTU          |
//! +------+---------------------------+--------------------+
//! ```
//!
//! - FRAME_DATA: one chunk of a frame buffer
//! - RETRANSMIT_FRAME_DATA: repeater asks for a range of datagrams
//! - REPEATER/EMITTER_WAITING_TO_START_FRAME: frame-start barrier handshake
//! - SURVEY_REPEATERS / REPEATERS_SURVEY_ANSWER: failover progress survey
//! - RETRANSMIT(TED)_RECEIVED_FRAME_DATA: failover backfill from repeaters

use std::convert::TryFrom;
use std::fmt;

use crate::config::MAX_NODES;
use crate::error::{Error, Result};
use crate::node::{NodeId, NodeIdBitVector};

/// Size of the type discriminant preceding every header.
pub const TYPE_PREFIX_LEN: usize = 1;

/// Kind of wire message, value of the first datagram byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    FrameData = 3,
    RetransmitFrameData = 4,
    RepeaterWaitingToStartFrame = 5,
    EmitterWaitingToStartFrame = 6,
    SurveyRepeaters = 11,
    RepeatersSurveyAnswer = 12,
    RetransmitReceivedFrameData = 13,
    RetransmittedReceivedFrameData = 14,
}

impl MessageType {
    /// Every message type handled by this crate, in wire order.
    pub const ALL: [MessageType; 8] = [
        MessageType::FrameData,
        MessageType::RetransmitFrameData,
        MessageType::RepeaterWaitingToStartFrame,
        MessageType::EmitterWaitingToStartFrame,
        MessageType::SurveyRepeaters,
        MessageType::RepeatersSurveyAnswer,
        MessageType::RetransmitReceivedFrameData,
        MessageType::RetransmittedReceivedFrameData,
    ];

    /// Size of the fixed header following the type byte.
    pub const fn header_len(self) -> usize {
        match self {
            MessageType::FrameData => FrameData::WIRE_SIZE,
            MessageType::RetransmitFrameData => RetransmitFrameData::WIRE_SIZE,
            MessageType::RepeaterWaitingToStartFrame => RepeaterWaitingToStartFrame::WIRE_SIZE,
            MessageType::EmitterWaitingToStartFrame => EmitterWaitingToStartFrame::WIRE_SIZE,
            MessageType::SurveyRepeaters => 0,
            MessageType::RepeatersSurveyAnswer => RepeatersSurveyAnswer::WIRE_SIZE,
            MessageType::RetransmitReceivedFrameData => RetransmitReceivedFrameData::WIRE_SIZE,
            MessageType::RetransmittedReceivedFrameData => {
                RetransmittedReceivedFrameData::WIRE_SIZE
            }
        }
    }

    /// Dense index used by per-type tables (statistics).
    pub(crate) const fn index(self) -> usize {
        match self {
            MessageType::FrameData => 0,
            MessageType::RetransmitFrameData => 1,
            MessageType::RepeaterWaitingToStartFrame => 2,
            MessageType::EmitterWaitingToStartFrame => 3,
            MessageType::SurveyRepeaters => 4,
            MessageType::RepeatersSurveyAnswer => 5,
            MessageType::RetransmitReceivedFrameData => 6,
            MessageType::RetransmittedReceivedFrameData => 7,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            3 => Ok(MessageType::FrameData),
            4 => Ok(MessageType::RetransmitFrameData),
            5 => Ok(MessageType::RepeaterWaitingToStartFrame),
            6 => Ok(MessageType::EmitterWaitingToStartFrame),
            11 => Ok(MessageType::SurveyRepeaters),
            12 => Ok(MessageType::RepeatersSurveyAnswer),
            13 => Ok(MessageType::RetransmitReceivedFrameData),
            14 => Ok(MessageType::RetransmittedReceivedFrameData),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Little-endian field access
// ============================================================================

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Node ids index 64-bit sets, reject anything outside them.
#[inline]
fn read_node_id(buf: &[u8], at: usize) -> Result<NodeId> {
    let node_id = buf[at];
    if usize::from(node_id) >= MAX_NODES {
        return Err(Error::InvalidField(format!(
            "node id {} out of range (max {})",
            node_id,
            MAX_NODES - 1
        )));
    }
    Ok(node_id)
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(bytes)
}

// ============================================================================
// FRAME_DATA
// ============================================================================

/// One datagram of a frame buffer.
///
/// Also used, with `datagram_index == 0` and `datagram_data_offset == 0`, for
/// the reassembled frame handed to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameData {
    /// Frame the chunk belongs to
    pub frame_index: u64,
    /// Length of the whole frame buffer
    pub data_length: i32,
    /// Position of this datagram in the frame
    pub datagram_index: i32,
    /// Absolute byte offset of the chunk in the frame buffer
    pub datagram_data_offset: i32,
}

impl FrameData {
    pub const WIRE_SIZE: usize = 20;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.frame_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.datagram_index.to_le_bytes());
        buf[16..20].copy_from_slice(&self.datagram_data_offset.to_le_bytes());
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            frame_index: read_u64(buf, 0),
            data_length: read_i32(buf, 8),
            datagram_index: read_i32(buf, 12),
            datagram_data_offset: read_i32(buf, 16),
        })
    }
}

// ============================================================================
// RETRANSMIT_FRAME_DATA
// ============================================================================

/// Request to resend datagrams `[datagram_start, datagram_end_exclusive)` of a frame.
///
/// The end may exceed the real datagram count (`i32::MAX` for "everything
/// after start"), the sender clamps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitFrameData {
    pub frame_index: u64,
    pub datagram_start: i32,
    pub datagram_end_exclusive: i32,
}

impl RetransmitFrameData {
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.frame_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.datagram_start.to_le_bytes());
        buf[12..16].copy_from_slice(&self.datagram_end_exclusive.to_le_bytes());
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            frame_index: read_u64(buf, 0),
            datagram_start: read_i32(buf, 8),
            datagram_end_exclusive: read_i32(buf, 12),
        })
    }
}

// ============================================================================
// REPEATER_WAITING_TO_START_FRAME / EMITTER_WAITING_TO_START_FRAME
// ============================================================================

/// Repeater announces it is ready to start `frame_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeaterWaitingToStartFrame {
    pub frame_index: u64,
    pub node_id: NodeId,
    /// `false` once the repeater switches to hardware sync
    pub will_use_network_sync_on_next_frame: bool,
}

impl RepeaterWaitingToStartFrame {
    pub const WIRE_SIZE: usize = 10;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.frame_index.to_le_bytes());
        buf[8] = self.node_id;
        buf[9] = u8::from(self.will_use_network_sync_on_next_frame);
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            frame_index: read_u64(buf, 0),
            node_id: read_node_id(buf, 8)?,
            will_use_network_sync_on_next_frame: buf[9] != 0,
        })
    }
}

/// Emitter answer: repeaters it is still waiting on for `frame_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitterWaitingToStartFrame {
    pub frame_index: u64,
    pub waiting_on: NodeIdBitVector,
}

impl EmitterWaitingToStartFrame {
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.frame_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.waiting_on.bits().to_le_bytes());
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            frame_index: read_u64(buf, 0),
            waiting_on: NodeIdBitVector::from_bits(read_u64(buf, 8)),
        })
    }
}

// ============================================================================
// SURVEY_REPEATERS / REPEATERS_SURVEY_ANSWER
// ============================================================================

/// Placeholder asks every repeater for its progress (no fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurveyRepeaters;

/// Repeater progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatersSurveyAnswer {
    pub node_id: NodeId,
    /// IPv4 address of the repeater, octets in network order packed little-endian
    pub ip_address_bytes: u32,
    pub last_received_frame_index: u64,
    pub still_use_network_sync: bool,
}

impl RepeatersSurveyAnswer {
    pub const WIRE_SIZE: usize = 14;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0] = self.node_id;
        buf[1..5].copy_from_slice(&self.ip_address_bytes.to_le_bytes());
        buf[5..13].copy_from_slice(&self.last_received_frame_index.to_le_bytes());
        buf[13] = u8::from(self.still_use_network_sync);
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            node_id: read_node_id(buf, 0)?,
            ip_address_bytes: read_u32(buf, 1),
            last_received_frame_index: read_u64(buf, 5),
            still_use_network_sync: buf[13] != 0,
        })
    }
}

// ============================================================================
// RETRANSMIT_RECEIVED_FRAME_DATA / RETRANSMITTED_RECEIVED_FRAME_DATA
// ============================================================================

/// Ask repeater `node_id` to send back a frame it already received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitReceivedFrameData {
    pub node_id: NodeId,
    pub frame_index: u64,
}

impl RetransmitReceivedFrameData {
    pub const WIRE_SIZE: usize = 9;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0] = self.node_id;
        buf[1..9].copy_from_slice(&self.frame_index.to_le_bytes());
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            node_id: read_node_id(buf, 0)?,
            frame_index: read_u64(buf, 1),
        })
    }
}

/// One chunk of a frame sent back by a repeater.
///
/// `data_length <= 0` means the repeater does not hold the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmittedReceivedFrameData {
    pub frame_index: u64,
    pub data_length: i32,
    pub datagram_index: i32,
    pub datagram_data_offset: i32,
}

impl RetransmittedReceivedFrameData {
    pub const WIRE_SIZE: usize = 20;

    #[must_use]
    pub fn encode_le(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.frame_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.datagram_index.to_le_bytes());
        buf[16..20].copy_from_slice(&self.datagram_data_offset.to_le_bytes());
        buf
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::WIRE_SIZE)?;
        Ok(Self {
            frame_index: read_u64(buf, 0),
            data_length: read_i32(buf, 8),
            datagram_index: read_i32(buf, 12),
            datagram_data_offset: read_i32(buf, 16),
        })
    }
}

// ============================================================================
// Message (tagged union of all headers)
// ============================================================================

/// Decoded header of any protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    FrameData(FrameData),
    RetransmitFrameData(RetransmitFrameData),
    RepeaterWaitingToStartFrame(RepeaterWaitingToStartFrame),
    EmitterWaitingToStartFrame(EmitterWaitingToStartFrame),
    SurveyRepeaters(SurveyRepeaters),
    RepeatersSurveyAnswer(RepeatersSurveyAnswer),
    RetransmitReceivedFrameData(RetransmitReceivedFrameData),
    RetransmittedReceivedFrameData(RetransmittedReceivedFrameData),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::FrameData(_) => MessageType::FrameData,
            Message::RetransmitFrameData(_) => MessageType::RetransmitFrameData,
            Message::RepeaterWaitingToStartFrame(_) => MessageType::RepeaterWaitingToStartFrame,
            Message::EmitterWaitingToStartFrame(_) => MessageType::EmitterWaitingToStartFrame,
            Message::SurveyRepeaters(_) => MessageType::SurveyRepeaters,
            Message::RepeatersSurveyAnswer(_) => MessageType::RepeatersSurveyAnswer,
            Message::RetransmitReceivedFrameData(_) => MessageType::RetransmitReceivedFrameData,
            Message::RetransmittedReceivedFrameData(_) => {
                MessageType::RetransmittedReceivedFrameData
            }
        }
    }

    /// Header size on the wire (type byte excluded).
    #[inline]
    pub fn header_len(&self) -> usize {
        self.message_type().header_len()
    }

    /// Append type byte, header and `extra` to `out`.
    pub fn encode_into(&self, extra: &[u8], out: &mut Vec<u8>) {
        out.reserve(TYPE_PREFIX_LEN + self.header_len() + extra.len());
        out.push(self.message_type() as u8);
        match self {
            Message::FrameData(m) => out.extend_from_slice(&m.encode_le()),
            Message::RetransmitFrameData(m) => out.extend_from_slice(&m.encode_le()),
            Message::RepeaterWaitingToStartFrame(m) => out.extend_from_slice(&m.encode_le()),
            Message::EmitterWaitingToStartFrame(m) => out.extend_from_slice(&m.encode_le()),
            Message::SurveyRepeaters(_) => {}
            Message::RepeatersSurveyAnswer(m) => out.extend_from_slice(&m.encode_le()),
            Message::RetransmitReceivedFrameData(m) => out.extend_from_slice(&m.encode_le()),
            Message::RetransmittedReceivedFrameData(m) => out.extend_from_slice(&m.encode_le()),
        }
        out.extend_from_slice(extra);
    }

    /// Decode a full datagram.
    ///
    /// Returns the message and the offset where extra bytes start.
    pub fn decode(datagram: &[u8]) -> Result<(Self, usize)> {
        check_len(datagram, TYPE_PREFIX_LEN)?;
        let message_type = MessageType::try_from(datagram[0])?;
        let body = &datagram[TYPE_PREFIX_LEN..];
        let message = match message_type {
            MessageType::FrameData => Message::FrameData(FrameData::decode_le(body)?),
            MessageType::RetransmitFrameData => {
                Message::RetransmitFrameData(RetransmitFrameData::decode_le(body)?)
            }
            MessageType::RepeaterWaitingToStartFrame => {
                Message::RepeaterWaitingToStartFrame(RepeaterWaitingToStartFrame::decode_le(body)?)
            }
            MessageType::EmitterWaitingToStartFrame => {
                Message::EmitterWaitingToStartFrame(EmitterWaitingToStartFrame::decode_le(body)?)
            }
            MessageType::SurveyRepeaters => Message::SurveyRepeaters(SurveyRepeaters),
            MessageType::RepeatersSurveyAnswer => {
                Message::RepeatersSurveyAnswer(RepeatersSurveyAnswer::decode_le(body)?)
            }
            MessageType::RetransmitReceivedFrameData => {
                Message::RetransmitReceivedFrameData(RetransmitReceivedFrameData::decode_le(body)?)
            }
            MessageType::RetransmittedReceivedFrameData => Message::RetransmittedReceivedFrameData(
                RetransmittedReceivedFrameData::decode_le(body)?,
            ),
        };
        Ok((message, TYPE_PREFIX_LEN + message_type.header_len()))
    }
}

macro_rules! impl_from_header {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(header: $variant) -> Self {
                    Message::$variant(header)
                }
            }
        )*
    };
}

impl_from_header!(
    FrameData,
    RetransmitFrameData,
    RepeaterWaitingToStartFrame,
    EmitterWaitingToStartFrame,
    SurveyRepeaters,
    RepeatersSurveyAnswer,
    RetransmitReceivedFrameData,
    RetransmittedReceivedFrameData,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_data_layout() {
        let header = FrameData {
            frame_index: 0x0102_0304_0506_0708,
            data_length: 5000,
            datagram_index: 3,
            datagram_data_offset: 4137,
        };
        let bytes = header.encode_le();
        assert_eq!(&bytes[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[8..12], &5000i32.to_le_bytes());
        assert_eq!(FrameData::decode_le(&bytes).expect("decode"), header);
    }

    #[test]
    fn test_header_sizes_match_encoders() {
        assert_eq!(MessageType::FrameData.header_len(), 20);
        assert_eq!(MessageType::RetransmitFrameData.header_len(), 16);
        assert_eq!(MessageType::RepeaterWaitingToStartFrame.header_len(), 10);
        assert_eq!(MessageType::EmitterWaitingToStartFrame.header_len(), 16);
        assert_eq!(MessageType::SurveyRepeaters.header_len(), 0);
        assert_eq!(MessageType::RepeatersSurveyAnswer.header_len(), 14);
        assert_eq!(MessageType::RetransmitReceivedFrameData.header_len(), 9);
        assert_eq!(MessageType::RetransmittedReceivedFrameData.header_len(), 20);
    }

    #[test]
    fn test_datagram_with_extra_bytes() {
        let message = Message::from(FrameData {
            frame_index: 42,
            data_length: 3,
            datagram_index: 0,
            datagram_data_offset: 0,
        });
        let mut datagram = Vec::new();
        message.encode_into(&[9, 8, 7], &mut datagram);
        assert_eq!(datagram[0], MessageType::FrameData as u8);
        assert_eq!(datagram.len(), 1 + 20 + 3);

        let (decoded, extra_start) = Message::decode(&datagram).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(&datagram[extra_start..], &[9, 8, 7]);
    }

    #[test]
    fn test_survey_has_no_header() {
        let mut datagram = Vec::new();
        Message::from(SurveyRepeaters).encode_into(&[], &mut datagram);
        assert_eq!(datagram, vec![MessageType::SurveyRepeaters as u8]);
        let (decoded, extra_start) = Message::decode(&datagram).expect("decode");
        assert_eq!(decoded.message_type(), MessageType::SurveyRepeaters);
        assert_eq!(extra_start, 1);
    }

    #[test]
    fn test_booleans_decode_any_non_zero() {
        let mut bytes = RepeaterWaitingToStartFrame {
            frame_index: 1,
            node_id: 4,
            will_use_network_sync_on_next_frame: false,
        }
        .encode_le();
        bytes[9] = 0x7F;
        let decoded = RepeaterWaitingToStartFrame::decode_le(&bytes).expect("decode");
        assert!(decoded.will_use_network_sync_on_next_frame);
    }

    #[test]
    fn test_waiting_on_bits_survive() {
        let header = EmitterWaitingToStartFrame {
            frame_index: 7,
            waiting_on: NodeIdBitVector::from_nodes(&[1, 63]),
        };
        let decoded = EmitterWaitingToStartFrame::decode_le(&header.encode_le()).expect("decode");
        assert_eq!(decoded.waiting_on.iter().collect::<Vec<_>>(), vec![1, 63]);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let datagram = [MessageType::RetransmitFrameData as u8, 1, 2, 3];
        match Message::decode(&datagram) {
            Err(Error::Truncated { needed, available }) => {
                assert_eq!(needed, 16);
                assert_eq!(available, 3);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_node_id_rejected() {
        let mut report = RepeaterWaitingToStartFrame {
            frame_index: 0,
            node_id: 63,
            will_use_network_sync_on_next_frame: true,
        }
        .encode_le();
        assert_eq!(
            RepeaterWaitingToStartFrame::decode_le(&report).expect("decode").node_id,
            63
        );
        report[8] = 70;
        assert!(matches!(
            RepeaterWaitingToStartFrame::decode_le(&report),
            Err(Error::InvalidField(_))
        ));

        let mut request = RetransmitReceivedFrameData {
            node_id: 2,
            frame_index: 9,
        }
        .encode_le();
        request[0] = 64;
        assert!(matches!(
            RetransmitReceivedFrameData::decode_le(&request),
            Err(Error::InvalidField(_))
        ));

        let mut answer = RepeatersSurveyAnswer {
            node_id: 2,
            ip_address_bytes: 0,
            last_received_frame_index: 5,
            still_use_network_sync: true,
        }
        .encode_le();
        answer[0] = 255;
        let mut datagram = vec![MessageType::RepeatersSurveyAnswer as u8];
        datagram.extend_from_slice(&answer);
        assert!(matches!(Message::decode(&datagram), Err(Error::InvalidField(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        // 7 is the quit propagation message, not handled here
        assert!(matches!(
            Message::decode(&[7, 0, 0]),
            Err(Error::UnknownMessageType(7))
        ));
        assert!(matches!(Message::decode(&[]), Err(Error::Truncated { .. })));
    }

    #[test]
    fn test_type_index_is_dense() {
        for (expected, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), expected);
            assert_eq!(MessageType::try_from(*ty as u8).expect("known"), *ty);
        }
    }
}
