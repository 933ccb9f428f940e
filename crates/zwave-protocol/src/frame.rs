//! Frame headers for wire transmission
//!
//! Each channel profile has its own header layout, so the header is a tagged
//! enum with one strongly typed struct per profile. Encoding and decoding are
//! explicit and bit-exact; nothing relies on in-memory layout.
//!
//! 2-channel header (8 bytes before addressing):
//! - Home ID (4 bytes)
//! - Source (1 byte)
//! - Header info (1 byte): routed 0x80, ack 0x40, low power 0x20,
//!   speed modified 0x10, header type 0x0F
//! - Control (1 byte): multicast follow-up 0x80, source wakeup 0x60, sequence 0x0F
//! - Length (1 byte)
//!
//! 3-channel header (9 bytes before addressing):
//! - Home ID (4 bytes)
//! - Source (1 byte)
//! - Header info (1 byte): ack 0x80, low power 0x40, multicast follow-up 0x20,
//!   header type 0x0F
//! - Header info 2 (1 byte): extended 0x80, source wakeup 0x70
//! - Length (1 byte)
//! - Sequence number (1 byte)
//!
//! Long-range header (12 bytes):
//! - Home ID (4 bytes)
//! - Source and destination (3 bytes, two packed 12-bit ids)
//! - Length (1 byte)
//! - Header info (1 byte): ack 0x80, extended 0x40, header type 0x07
//! - Sequence number (1 byte)
//! - Noise floor (1 byte, signed)
//! - TX power (1 byte, signed)
//!
//! The length byte always counts header, payload and the PHY trailer
//! (checksum or CRC-16), which the radio appends.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::explore::ExploreHeader;
use crate::types::{ChannelProfile, HomeId, NodeId, Speed, MAX_REPEATERS};

/// Offset of the length byte, identical for every profile
pub const LENGTH_OFFSET: usize = 7;

pub const HEADER_LEN_2CH: usize = 8;
pub const HEADER_LEN_3CH: usize = 9;
pub const HEADER_LEN_LR: usize = 12;

/// Max bytes of routed header extension body in 2-channel frames
pub const MAX_EXTEND_BODY_2CH: usize = 2;

/// Max bytes of header extension body in 3-channel and LR frames
pub const MAX_EXTEND_BODY: usize = 7;

const MASK_HDRTYP: u8 = 0x0F;
const MASK_HDRTYP_LR: u8 = 0x07;
const MASK_SEQNO: u8 = 0x0F;

const MASK_ROUTED: u8 = 0x80;
const MASK_ACK: u8 = 0x40;
const MASK_LOWPOWER: u8 = 0x20;
const MASK_SPEED_MODIFIED: u8 = 0x10;
const MASK_MULTICAST_FOLLOWUP: u8 = 0x80;
const MASK_WAKEUP_2CH: u8 = 0x60;

const MASK_ACK_3CH: u8 = 0x80;
const MASK_LOWPOWER_3CH: u8 = 0x40;
const MASK_MULTICAST_FOLLOWUP_3CH: u8 = 0x20;
const MASK_EXTENDED_3CH: u8 = 0x80;
const MASK_WAKEUP_3CH: u8 = 0x70;
const MASK_DEST_WAKEUP_3CH: u8 = 0x07;

const MASK_ACK_LR: u8 = 0x80;
const MASK_EXTENDED_LR: u8 = 0x40;

const MASK_MULTI_OFFSET: u8 = 0xE0;
const MASK_MULTI_BYTES: u8 = 0x1F;

const MASK_ROUT_REPTS: u8 = 0xF0;
const MASK_ROUT_HOPS: u8 = 0x0F;

/// Header type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HeaderType {
    Singlecast = 1,
    Multicast = 2,
    TransferAck = 3,
    Flooded = 4,
    Explore = 5,
    Routed = 8,
}

impl HeaderType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(HeaderType::Singlecast),
            2 => Ok(HeaderType::Multicast),
            3 => Ok(HeaderType::TransferAck),
            4 => Ok(HeaderType::Flooded),
            5 => Ok(HeaderType::Explore),
            8 => Ok(HeaderType::Routed),
            other => Err(ProtocolError::InvalidHeaderType(other)),
        }
    }
}

bitflags! {
    /// Route status byte of routed headers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RouteStatus: u8 {
        /// Frame travels back towards the route originator
        const INBOUND = 0x01;
        const ROUTED_ACK = 0x02;
        const ROUTED_ERR = 0x04;
        const EXTENDED = 0x08;
        const SPEED_MODIFIED = 0x10;
    }
}

/// Wake-up beam requirement announced in a header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WakeupBeam {
    #[default]
    None,
    Beam250ms,
    Beam1000ms,
}

impl WakeupBeam {
    fn bits_2ch(&self) -> u8 {
        match self {
            WakeupBeam::None => 0x00,
            WakeupBeam::Beam250ms => 0x20,
            WakeupBeam::Beam1000ms => 0x40,
        }
    }

    fn from_bits_2ch(bits: u8) -> Self {
        match bits & MASK_WAKEUP_2CH {
            0x20 => WakeupBeam::Beam250ms,
            0x40 => WakeupBeam::Beam1000ms,
            _ => WakeupBeam::None,
        }
    }

    fn bits_3ch(&self) -> u8 {
        match self {
            WakeupBeam::None => 0x00,
            WakeupBeam::Beam250ms => 0x10,
            WakeupBeam::Beam1000ms => 0x20,
        }
    }

    fn from_bits_3ch(bits: u8) -> Self {
        match bits & MASK_WAKEUP_3CH {
            0x10 => WakeupBeam::Beam250ms,
            0x20 => WakeupBeam::Beam1000ms,
            _ => WakeupBeam::None,
        }
    }

    fn dest_bits_3ch(&self) -> u8 {
        match self {
            WakeupBeam::None => 0x00,
            WakeupBeam::Beam250ms => 0x01,
            WakeupBeam::Beam1000ms => 0x02,
        }
    }

    fn from_dest_bits_3ch(bits: u8) -> Self {
        match bits & MASK_DEST_WAKEUP_3CH {
            0x01 => WakeupBeam::Beam250ms,
            0x02 => WakeupBeam::Beam1000ms,
            _ => WakeupBeam::None,
        }
    }
}

/// Header extension block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderExtension {
    /// Extension type (4 bits)
    pub kind: u8,
    pub body: Vec<u8>,
}

/// Routing header carried by routed singlecast, routed ACK and routed error frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedHeader {
    pub destination: NodeId,
    /// Status flags; `EXTENDED` is derived from `extension` when encoding
    pub status: RouteStatus,
    pub repeaters: Vec<NodeId>,
    /// Index of the hop currently carrying the frame
    pub hops: u8,
    /// Destination wakeup requirement (3-channel routed data frames only)
    pub dest_wakeup: WakeupBeam,
    pub extension: Option<HeaderExtension>,
}

impl RoutedHeader {
    pub fn outbound(destination: NodeId, repeaters: Vec<NodeId>) -> Self {
        RoutedHeader {
            destination,
            status: RouteStatus::empty(),
            repeaters,
            hops: 0,
            dest_wakeup: WakeupBeam::None,
            extension: None,
        }
    }

    pub fn is_ack_or_err(&self) -> bool {
        self.status
            .intersects(RouteStatus::ROUTED_ACK | RouteStatus::ROUTED_ERR)
    }
}

/// Destination addressing, which differs by frame type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Addressing {
    Singlecast { destination: NodeId },
    Multicast { offset: u8, mask: Vec<u8> },
    TransferAck { destination: NodeId },
    Routed(RoutedHeader),
    Explore { destination: NodeId, explore: ExploreHeader },
}

impl Addressing {
    pub fn destination(&self) -> Option<NodeId> {
        match self {
            Addressing::Singlecast { destination }
            | Addressing::TransferAck { destination }
            | Addressing::Explore { destination, .. } => Some(*destination),
            Addressing::Routed(routed) => Some(routed.destination),
            Addressing::Multicast { .. } => None,
        }
    }
}

/// 2-channel header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header2ch {
    pub home_id: HomeId,
    pub source: NodeId,
    pub ack: bool,
    pub low_power: bool,
    pub speed_modified: bool,
    pub multicast_followup: bool,
    pub source_wakeup: WakeupBeam,
    /// Sequence number (4 bits)
    pub sequence: u8,
    pub addressing: Addressing,
}

/// 3-channel header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header3ch {
    pub home_id: HomeId,
    pub source: NodeId,
    pub ack: bool,
    pub low_power: bool,
    pub multicast_followup: bool,
    pub source_wakeup: WakeupBeam,
    pub sequence: u8,
    /// Extension for non-routed frames; routed frames carry it in the routing header
    pub extension: Option<HeaderExtension>,
    pub addressing: Addressing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrFrameKind {
    Singlecast,
    TransferAck,
}

/// Long-range header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLr {
    pub home_id: HomeId,
    pub source: NodeId,
    pub destination: NodeId,
    pub ack: bool,
    pub kind: LrFrameKind,
    pub sequence: u8,
    pub noise_floor: i8,
    pub tx_power: i8,
    pub extension: Option<HeaderExtension>,
}

/// A frame header in one of the three channel profiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameHeader {
    TwoChannel(Header2ch),
    ThreeChannel(Header3ch),
    LongRange(HeaderLr),
}

impl FrameHeader {
    pub fn profile(&self) -> ChannelProfile {
        match self {
            FrameHeader::TwoChannel(_) => ChannelProfile::TwoChannel,
            FrameHeader::ThreeChannel(_) => ChannelProfile::ThreeChannel,
            FrameHeader::LongRange(_) => ChannelProfile::LongRange,
        }
    }

    pub fn source(&self) -> NodeId {
        match self {
            FrameHeader::TwoChannel(h) => h.source,
            FrameHeader::ThreeChannel(h) => h.source,
            FrameHeader::LongRange(h) => h.source,
        }
    }

    pub fn destination(&self) -> Option<NodeId> {
        match self {
            FrameHeader::TwoChannel(h) => h.addressing.destination(),
            FrameHeader::ThreeChannel(h) => h.addressing.destination(),
            FrameHeader::LongRange(h) => Some(h.destination),
        }
    }

    pub fn ack_requested(&self) -> bool {
        match self {
            FrameHeader::TwoChannel(h) => h.ack,
            FrameHeader::ThreeChannel(h) => h.ack,
            FrameHeader::LongRange(h) => h.ack,
        }
    }

    pub fn routed(&self) -> Option<&RoutedHeader> {
        let addressing = match self {
            FrameHeader::TwoChannel(h) => &h.addressing,
            FrameHeader::ThreeChannel(h) => &h.addressing,
            FrameHeader::LongRange(_) => return None,
        };
        match addressing {
            Addressing::Routed(routed) => Some(routed),
            _ => None,
        }
    }

    /// Encoded header length in bytes
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(self.encode_header(0)?.len())
    }

    /// Largest payload that fits at `speed` behind this header
    pub fn max_payload(&self, speed: Speed) -> Result<usize> {
        let used = self.encoded_len()? + speed.trailer_len();
        Ok(speed.max_frame_len().saturating_sub(used))
    }

    fn encode_header(&self, frame_len: u8) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        match self {
            FrameHeader::TwoChannel(h) => encode_2ch(h, frame_len, &mut buf)?,
            FrameHeader::ThreeChannel(h) => encode_3ch(h, frame_len, &mut buf)?,
            FrameHeader::LongRange(h) => encode_lr(h, frame_len, &mut buf)?,
        }
        Ok(buf)
    }
}

/// A header plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: Vec<u8>) -> Self {
        Frame { header, payload }
    }

    /// Serialize header and payload; the trailer is left to the PHY
    pub fn encode(&self, speed: Speed) -> Result<Vec<u8>> {
        let header_len = self.header.encoded_len()?;
        let total = header_len + self.payload.len() + speed.trailer_len();
        if total > speed.max_frame_len() {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: speed
                    .max_frame_len()
                    .saturating_sub(header_len + speed.trailer_len()),
            });
        }

        let mut bytes = self.header.encode_header(total as u8)?;
        debug_assert_eq!(bytes.len(), header_len, "Header size mismatch");
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parse a received frame (without its trailer)
    pub fn decode(profile: ChannelProfile, bytes: &[u8], speed: Speed) -> Result<Self> {
        if bytes.len() <= LENGTH_OFFSET {
            return Err(ProtocolError::Truncated {
                needed: LENGTH_OFFSET + 1,
                have: bytes.len(),
            });
        }
        let declared = bytes[LENGTH_OFFSET] as usize;
        let actual = bytes.len() + speed.trailer_len();
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        let mut reader = Reader::new(bytes);
        let header = match profile {
            ChannelProfile::TwoChannel => FrameHeader::TwoChannel(decode_2ch(&mut reader)?),
            ChannelProfile::ThreeChannel => FrameHeader::ThreeChannel(decode_3ch(&mut reader)?),
            ChannelProfile::LongRange => FrameHeader::LongRange(decode_lr(&mut reader)?),
        };

        Ok(Frame {
            header,
            payload: reader.rest().to_vec(),
        })
    }
}

/// Cursor over a received buffer that reports how much was missing
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(ProtocolError::Truncated {
                needed: end,
                have: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn home_id(&mut self) -> Result<HomeId> {
        let b = self.take(4)?;
        Ok(HomeId::from_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn node(&mut self) -> Result<NodeId> {
        NodeId::try_from(self.u8()?)
    }

    fn nodes(&mut self, count: usize) -> Result<Vec<NodeId>> {
        self.take(count)?
            .iter()
            .map(|b| NodeId::try_from(*b))
            .collect()
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

fn check_repeaters(repeaters: &[NodeId]) -> Result<()> {
    if repeaters.len() > MAX_REPEATERS {
        return Err(ProtocolError::TooManyRepeaters(repeaters.len()));
    }
    Ok(())
}

fn check_extension(ext: &HeaderExtension, max: usize) -> Result<()> {
    if ext.body.len() > max {
        return Err(ProtocolError::ExtensionTooLong {
            len: ext.body.len(),
            max,
        });
    }
    Ok(())
}

fn encode_multicast(offset: u8, mask: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    if mask.len() > MASK_MULTI_BYTES as usize {
        return Err(ProtocolError::ExtensionTooLong {
            len: mask.len(),
            max: MASK_MULTI_BYTES as usize,
        });
    }
    buf.push(((offset << 5) & MASK_MULTI_OFFSET) | mask.len() as u8);
    buf.extend_from_slice(mask);
    Ok(())
}

fn decode_multicast(reader: &mut Reader<'_>) -> Result<Addressing> {
    let control = reader.u8()?;
    let offset = (control & MASK_MULTI_OFFSET) >> 5;
    let mask = reader.take((control & MASK_MULTI_BYTES) as usize)?.to_vec();
    Ok(Addressing::Multicast { offset, mask })
}

fn encode_2ch(h: &Header2ch, frame_len: u8, buf: &mut Vec<u8>) -> Result<()> {
    let (header_type, routed) = match &h.addressing {
        Addressing::Singlecast { .. } => (HeaderType::Singlecast, false),
        // Routed frames go on air as singlecast with the routed bit set
        Addressing::Routed(_) => (HeaderType::Singlecast, true),
        Addressing::Multicast { .. } => (HeaderType::Multicast, false),
        Addressing::TransferAck { .. } => (HeaderType::TransferAck, false),
        Addressing::Explore { .. } => (HeaderType::Explore, false),
    };

    buf.extend_from_slice(&h.home_id.to_bytes());
    buf.push(h.source.classic_byte()?);

    let mut info = header_type as u8;
    if routed {
        info |= MASK_ROUTED;
    }
    if h.ack {
        info |= MASK_ACK;
    }
    if h.low_power {
        info |= MASK_LOWPOWER;
    }
    if h.speed_modified {
        info |= MASK_SPEED_MODIFIED;
    }
    buf.push(info);

    let mut control = h.source_wakeup.bits_2ch() | (h.sequence & MASK_SEQNO);
    if h.multicast_followup {
        control |= MASK_MULTICAST_FOLLOWUP;
    }
    buf.push(control);
    buf.push(frame_len);

    match &h.addressing {
        Addressing::Singlecast { destination } | Addressing::TransferAck { destination } => {
            buf.push(destination.classic_byte()?);
        }
        Addressing::Multicast { offset, mask } => encode_multicast(*offset, mask, buf)?,
        Addressing::Routed(routed) => {
            check_repeaters(&routed.repeaters)?;
            buf.push(routed.destination.classic_byte()?);
            let mut status = routed.status - RouteStatus::EXTENDED;
            if routed.extension.is_some() {
                status |= RouteStatus::EXTENDED;
            }
            buf.push(status.bits());
            buf.push(((routed.repeaters.len() as u8) << 4) | (routed.hops & MASK_ROUT_HOPS));
            for repeater in &routed.repeaters {
                buf.push(repeater.classic_byte()?);
            }
            if let Some(ext) = &routed.extension {
                check_extension(ext, MAX_EXTEND_BODY_2CH)?;
                buf.push(((ext.body.len() as u8) << 4) | (ext.kind & 0x0F));
                buf.extend_from_slice(&ext.body);
            }
        }
        Addressing::Explore {
            destination,
            explore,
        } => {
            buf.push(destination.classic_byte()?);
            explore.encode_into(buf)?;
        }
    }
    Ok(())
}

fn decode_2ch(reader: &mut Reader<'_>) -> Result<Header2ch> {
    let home_id = reader.home_id()?;
    let source = reader.node()?;
    let info = reader.u8()?;
    let control = reader.u8()?;
    let _length = reader.u8()?;

    let header_type = HeaderType::from_u8(info & MASK_HDRTYP)?;
    let routed = info & MASK_ROUTED != 0;

    let addressing = match (header_type, routed) {
        (HeaderType::Singlecast, true) => {
            let destination = reader.node()?;
            let status = RouteStatus::from_bits_truncate(reader.u8()?);
            let counts = reader.u8()?;
            let count = ((counts & MASK_ROUT_REPTS) >> 4) as usize;
            if count > MAX_REPEATERS {
                return Err(ProtocolError::TooManyRepeaters(count));
            }
            let repeaters = reader.nodes(count)?;
            let extension = if status.contains(RouteStatus::EXTENDED) {
                let ext = reader.u8()?;
                let len = (ext >> 4) as usize;
                if len > MAX_EXTEND_BODY_2CH {
                    return Err(ProtocolError::ExtensionTooLong {
                        len,
                        max: MAX_EXTEND_BODY_2CH,
                    });
                }
                Some(HeaderExtension {
                    kind: ext & 0x0F,
                    body: reader.take(len)?.to_vec(),
                })
            } else {
                None
            };
            Addressing::Routed(RoutedHeader {
                destination,
                status: status - RouteStatus::EXTENDED,
                repeaters,
                hops: counts & MASK_ROUT_HOPS,
                dest_wakeup: WakeupBeam::None,
                extension,
            })
        }
        (HeaderType::Singlecast, false) => Addressing::Singlecast {
            destination: reader.node()?,
        },
        (HeaderType::TransferAck, _) => Addressing::TransferAck {
            destination: reader.node()?,
        },
        (HeaderType::Multicast, _) => decode_multicast(reader)?,
        (HeaderType::Explore, _) => {
            let destination = reader.node()?;
            let (explore, used) = ExploreHeader::decode(reader.rest())?;
            reader.take(used)?;
            Addressing::Explore {
                destination,
                explore,
            }
        }
        (other, _) => return Err(ProtocolError::InvalidHeaderType(other as u8)),
    };

    Ok(Header2ch {
        home_id,
        source,
        ack: info & MASK_ACK != 0,
        low_power: info & MASK_LOWPOWER != 0,
        speed_modified: info & MASK_SPEED_MODIFIED != 0,
        multicast_followup: control & MASK_MULTICAST_FOLLOWUP != 0,
        source_wakeup: WakeupBeam::from_bits_2ch(control),
        sequence: control & MASK_SEQNO,
        addressing,
    })
}

fn encode_ext_3ch(ext: &HeaderExtension, buf: &mut Vec<u8>) -> Result<()> {
    check_extension(ext, MAX_EXTEND_BODY)?;
    buf.push(((ext.kind & 0x0F) << 4) | ext.body.len() as u8);
    buf.extend_from_slice(&ext.body);
    Ok(())
}

fn decode_ext_3ch(reader: &mut Reader<'_>) -> Result<HeaderExtension> {
    let ext = reader.u8()?;
    let len = (ext & 0x07) as usize;
    Ok(HeaderExtension {
        kind: ext >> 4,
        body: reader.take(len)?.to_vec(),
    })
}

fn encode_3ch(h: &Header3ch, frame_len: u8, buf: &mut Vec<u8>) -> Result<()> {
    let header_type = match &h.addressing {
        Addressing::Singlecast { .. } => HeaderType::Singlecast,
        Addressing::Routed(_) => HeaderType::Routed,
        Addressing::Multicast { .. } => HeaderType::Multicast,
        Addressing::TransferAck { .. } => HeaderType::TransferAck,
        Addressing::Explore { .. } => HeaderType::Explore,
    };
    let extension = match (&h.addressing, &h.extension) {
        (Addressing::Routed(_), Some(_)) | (Addressing::Explore { .. }, Some(_)) => {
            return Err(ProtocolError::UnsupportedFrameType(
                "header extension outside the routing header",
            ))
        }
        (Addressing::Routed(routed), None) => routed.extension.as_ref(),
        (_, ext) => ext.as_ref(),
    };

    buf.extend_from_slice(&h.home_id.to_bytes());
    buf.push(h.source.classic_byte()?);

    let mut info = header_type as u8;
    if h.ack {
        info |= MASK_ACK_3CH;
    }
    if h.low_power {
        info |= MASK_LOWPOWER_3CH;
    }
    if h.multicast_followup {
        info |= MASK_MULTICAST_FOLLOWUP_3CH;
    }
    buf.push(info);

    let mut info2 = h.source_wakeup.bits_3ch();
    if extension.is_some() {
        info2 |= MASK_EXTENDED_3CH;
    }
    buf.push(info2);
    buf.push(frame_len);
    buf.push(h.sequence);

    match &h.addressing {
        Addressing::Singlecast { destination } | Addressing::TransferAck { destination } => {
            buf.push(destination.classic_byte()?);
        }
        Addressing::Multicast { offset, mask } => encode_multicast(*offset, mask, buf)?,
        Addressing::Routed(routed) => {
            check_repeaters(&routed.repeaters)?;
            buf.push(routed.destination.classic_byte()?);
            let mut status = routed.status - RouteStatus::EXTENDED;
            if extension.is_some() {
                status |= RouteStatus::EXTENDED;
            }
            buf.push(status.bits());
            buf.push(((routed.repeaters.len() as u8) << 4) | (routed.hops & MASK_ROUT_HOPS));
            for repeater in &routed.repeaters {
                buf.push(repeater.classic_byte()?);
            }
            if !routed.is_ack_or_err() {
                buf.push(routed.dest_wakeup.dest_bits_3ch());
            }
        }
        Addressing::Explore {
            destination,
            explore,
        } => {
            buf.push(destination.classic_byte()?);
            explore.encode_into(buf)?;
        }
    }

    if let Some(ext) = extension {
        encode_ext_3ch(ext, buf)?;
    }
    Ok(())
}

fn decode_3ch(reader: &mut Reader<'_>) -> Result<Header3ch> {
    let home_id = reader.home_id()?;
    let source = reader.node()?;
    let info = reader.u8()?;
    let info2 = reader.u8()?;
    let _length = reader.u8()?;
    let sequence = reader.u8()?;
    let extended = info2 & MASK_EXTENDED_3CH != 0;

    let mut extension = None;
    let addressing = match HeaderType::from_u8(info & MASK_HDRTYP)? {
        HeaderType::Singlecast => Addressing::Singlecast {
            destination: reader.node()?,
        },
        HeaderType::TransferAck => Addressing::TransferAck {
            destination: reader.node()?,
        },
        HeaderType::Multicast => decode_multicast(reader)?,
        HeaderType::Routed => {
            let destination = reader.node()?;
            let status = RouteStatus::from_bits_truncate(reader.u8()?);
            let counts = reader.u8()?;
            let count = ((counts & MASK_ROUT_REPTS) >> 4) as usize;
            if count > MAX_REPEATERS {
                return Err(ProtocolError::TooManyRepeaters(count));
            }
            let repeaters = reader.nodes(count)?;
            let mut routed = RoutedHeader {
                destination,
                status: status - RouteStatus::EXTENDED,
                repeaters,
                hops: counts & MASK_ROUT_HOPS,
                dest_wakeup: WakeupBeam::None,
                extension: None,
            };
            if !routed.is_ack_or_err() {
                routed.dest_wakeup = WakeupBeam::from_dest_bits_3ch(reader.u8()?);
            }
            if status.contains(RouteStatus::EXTENDED) {
                routed.extension = Some(decode_ext_3ch(reader)?);
            }
            Addressing::Routed(routed)
        }
        HeaderType::Explore => {
            let destination = reader.node()?;
            let (explore, used) = ExploreHeader::decode(reader.rest())?;
            reader.take(used)?;
            Addressing::Explore {
                destination,
                explore,
            }
        }
        other => return Err(ProtocolError::InvalidHeaderType(other as u8)),
    };

    let routed = matches!(addressing, Addressing::Routed(_));
    if extended && !routed {
        extension = Some(decode_ext_3ch(reader)?);
    }

    Ok(Header3ch {
        home_id,
        source,
        ack: info & MASK_ACK_3CH != 0,
        low_power: info & MASK_LOWPOWER_3CH != 0,
        multicast_followup: info & MASK_MULTICAST_FOLLOWUP_3CH != 0,
        source_wakeup: WakeupBeam::from_bits_3ch(info2),
        sequence,
        extension,
        addressing,
    })
}

fn encode_lr(h: &HeaderLr, frame_len: u8, buf: &mut Vec<u8>) -> Result<()> {
    let source = h.source.as_u16();
    let destination = h.destination.as_u16();

    buf.extend_from_slice(&h.home_id.to_bytes());
    buf.push((source >> 4) as u8);
    buf.push((((source & 0x0F) as u8) << 4) | ((destination >> 8) as u8 & 0x0F));
    buf.push((destination & 0xFF) as u8);
    buf.push(frame_len);

    let mut info = match h.kind {
        LrFrameKind::Singlecast => HeaderType::Singlecast as u8,
        LrFrameKind::TransferAck => HeaderType::TransferAck as u8,
    };
    if h.ack {
        info |= MASK_ACK_LR;
    }
    if h.extension.is_some() {
        info |= MASK_EXTENDED_LR;
    }
    buf.push(info);
    buf.push(h.sequence);
    buf.push(h.noise_floor as u8);
    buf.push(h.tx_power as u8);

    if let Some(ext) = &h.extension {
        encode_ext_3ch(ext, buf)?;
    }
    Ok(())
}

fn decode_lr(reader: &mut Reader<'_>) -> Result<HeaderLr> {
    let home_id = reader.home_id()?;
    let ids = reader.take(3)?;
    let source = ((ids[0] as u16) << 4) | ((ids[1] as u16) >> 4);
    let destination = (((ids[1] & 0x0F) as u16) << 8) | ids[2] as u16;
    let _length = reader.u8()?;
    let info = reader.u8()?;
    let sequence = reader.u8()?;
    let noise_floor = reader.u8()? as i8;
    let tx_power = reader.u8()? as i8;

    let kind = match info & MASK_HDRTYP_LR {
        1 => LrFrameKind::Singlecast,
        3 => LrFrameKind::TransferAck,
        other => return Err(ProtocolError::InvalidHeaderType(other)),
    };
    let extension = if info & MASK_EXTENDED_LR != 0 {
        Some(decode_ext_3ch(reader)?)
    } else {
        None
    };

    Ok(HeaderLr {
        home_id,
        source: NodeId::new(source)?,
        destination: NodeId::new(destination)?,
        ack: info & MASK_ACK_LR != 0,
        kind,
        sequence,
        noise_floor,
        tx_power,
        extension,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::{ExploreCommand, ExploreOptions, EXPLORE_VERSION};

    fn node(id: u16) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn home() -> HomeId {
        HomeId::new(0xC0FF_EE01)
    }

    fn routed_2ch() -> Frame {
        let mut routed = RoutedHeader::outbound(node(5), vec![node(2), node(4)]);
        routed.status = RouteStatus::SPEED_MODIFIED;
        Frame::new(
            FrameHeader::TwoChannel(Header2ch {
                home_id: home(),
                source: node(1),
                ack: true,
                low_power: false,
                speed_modified: false,
                multicast_followup: false,
                source_wakeup: WakeupBeam::None,
                sequence: 0x0A,
                addressing: Addressing::Routed(routed),
            }),
            vec![0x20, 0x01, 0xFF],
        )
    }

    #[test]
    fn test_2ch_routed_bit_exact() {
        let bytes = routed_2ch().encode(Speed::Kbps40).unwrap();
        assert_eq!(
            bytes,
            vec![
                0xC0, 0xFF, 0xEE, 0x01, // home id
                0x01, // source
                0xC1, // routed | ack | singlecast
                0x0A, // sequence
                0x11, // 13 header + 3 payload + 1 checksum
                0x05, // destination
                0x10, // speed modified
                0x20, // 2 repeaters, hop 0
                0x02, 0x04, // repeaters
                0x20, 0x01, 0xFF,
            ]
        );
    }

    #[test]
    fn test_2ch_routed_decode() {
        let frame = routed_2ch();
        let bytes = frame.encode(Speed::Kbps40).unwrap();
        let decoded = Frame::decode(ChannelProfile::TwoChannel, &bytes, Speed::Kbps40).unwrap();
        assert_eq!(decoded, frame);
        let routed = decoded.header.routed().unwrap();
        assert_eq!(routed.repeaters, vec![node(2), node(4)]);
    }

    #[test]
    fn test_2ch_routed_extension() {
        let mut frame = routed_2ch();
        if let FrameHeader::TwoChannel(h) = &mut frame.header {
            if let Addressing::Routed(r) = &mut h.addressing {
                r.extension = Some(HeaderExtension {
                    kind: 0,
                    body: vec![0x40],
                });
            }
        }
        let bytes = frame.encode(Speed::Kbps40).unwrap();
        // status gains EXTENDED, extension byte = len 1 << 4 | type 0
        assert_eq!(bytes[9], 0x18);
        assert_eq!(&bytes[13..15], &[0x10, 0x40]);
        let decoded = Frame::decode(ChannelProfile::TwoChannel, &bytes, Speed::Kbps40).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_2ch_singlecast_wakeup_bits() {
        let frame = Frame::new(
            FrameHeader::TwoChannel(Header2ch {
                home_id: home(),
                source: node(1),
                ack: false,
                low_power: true,
                speed_modified: true,
                multicast_followup: false,
                source_wakeup: WakeupBeam::Beam1000ms,
                sequence: 3,
                addressing: Addressing::Singlecast {
                    destination: node(9),
                },
            }),
            vec![],
        );
        let bytes = frame.encode(Speed::Kbps9_6).unwrap();
        assert_eq!(&bytes[4..], &[0x01, 0x31, 0x43, 0x0A, 0x09]);
    }

    #[test]
    fn test_3ch_routed_dest_wakeup_and_extension() {
        let mut routed = RoutedHeader::outbound(node(5), vec![node(3)]);
        routed.dest_wakeup = WakeupBeam::Beam250ms;
        routed.extension = Some(HeaderExtension {
            kind: 1,
            body: vec![0xAA, 0xBB],
        });
        let frame = Frame::new(
            FrameHeader::ThreeChannel(Header3ch {
                home_id: home(),
                source: node(1),
                ack: true,
                low_power: false,
                multicast_followup: false,
                source_wakeup: WakeupBeam::None,
                sequence: 0x77,
                extension: None,
                addressing: Addressing::Routed(routed),
            }),
            vec![0x01],
        );
        let bytes = frame.encode(Speed::Kbps100).unwrap();
        assert_eq!(
            bytes,
            vec![
                0xC0, 0xFF, 0xEE, 0x01, 0x01, // home id, source
                0x88, // ack | routed
                0x80, // extended
                0x14, // 17 header + 1 payload + 2 crc
                0x77, // sequence
                0x05, 0x08, 0x10, 0x03, // dst, status, counts, repeater
                0x01, // dest wakeup 250 ms
                0x12, 0xAA, 0xBB, // type 1, len 2, body
                0x01,
            ]
        );
        let decoded = Frame::decode(ChannelProfile::ThreeChannel, &bytes, Speed::Kbps100).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_3ch_routed_ack_has_no_wakeup_byte() {
        let mut routed = RoutedHeader::outbound(node(1), vec![node(3)]);
        routed.status = RouteStatus::ROUTED_ACK | RouteStatus::INBOUND;
        routed.hops = 1;
        let frame = Frame::new(
            FrameHeader::ThreeChannel(Header3ch {
                home_id: home(),
                source: node(5),
                ack: false,
                low_power: false,
                multicast_followup: false,
                source_wakeup: WakeupBeam::None,
                sequence: 1,
                extension: None,
                addressing: Addressing::Routed(routed),
            }),
            vec![],
        );
        let bytes = frame.encode(Speed::Kbps100).unwrap();
        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[9..], &[0x01, 0x03, 0x11, 0x03]);
        let decoded = Frame::decode(ChannelProfile::ThreeChannel, &bytes, Speed::Kbps100).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_lr_packed_ids() {
        let frame = Frame::new(
            FrameHeader::LongRange(HeaderLr {
                home_id: home(),
                source: node(1),
                destination: node(0x3A5),
                ack: true,
                kind: LrFrameKind::Singlecast,
                sequence: 0x42,
                noise_floor: -90,
                tx_power: 14,
                extension: None,
            }),
            vec![0x5E],
        );
        let bytes = frame.encode(Speed::Kbps100Lr).unwrap();
        assert_eq!(
            bytes,
            vec![
                0xC0, 0xFF, 0xEE, 0x01, // home id
                0x00, 0x13, 0xA5, // src 0x001, dst 0x3A5
                0x0F, // 12 header + 1 payload + 2 crc
                0x81, // ack | singlecast
                0x42, 0xA6, 0x0E, 0x5E,
            ]
        );
        let decoded = Frame::decode(ChannelProfile::LongRange, &bytes, Speed::Kbps100Lr).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_explore_frame_2ch() {
        let frame = Frame::new(
            FrameHeader::TwoChannel(Header2ch {
                home_id: home(),
                source: node(1),
                ack: false,
                low_power: false,
                speed_modified: false,
                multicast_followup: false,
                source_wakeup: WakeupBeam::None,
                sequence: 2,
                addressing: Addressing::Explore {
                    destination: node(12),
                    explore: ExploreHeader {
                        version: EXPLORE_VERSION,
                        command: ExploreCommand::Normal,
                        options: ExploreOptions::empty(),
                        random_interval: 250,
                        ttl: 4,
                        repeaters: vec![node(6)],
                    },
                },
            }),
            vec![0x00],
        );
        let bytes = frame.encode(Speed::Kbps40).unwrap();
        assert_eq!(&bytes[5..], &[0x05, 0x02, 0x10, 0x0C, 0x20, 0x00, 0xFA, 0x41, 0x06, 0x00]);
        let decoded = Frame::decode(ChannelProfile::TwoChannel, &bytes, Speed::Kbps40).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_payload_too_large() {
        let mut frame = routed_2ch();
        frame.payload = vec![0u8; 60];
        match frame.encode(Speed::Kbps40) {
            Err(ProtocolError::PayloadTooLarge { size, max }) => {
                assert_eq!(size, 60);
                assert_eq!(max, 64 - 13 - 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // the same payload fits at 100k
        assert!(frame.encode(Speed::Kbps100).is_ok());
        assert_eq!(frame.header.max_payload(Speed::Kbps100).unwrap(), 170 - 13 - 2);
    }

    #[test]
    fn test_decode_errors() {
        let bytes = routed_2ch().encode(Speed::Kbps40).unwrap();

        assert!(matches!(
            Frame::decode(ChannelProfile::TwoChannel, &bytes[..bytes.len() - 1], Speed::Kbps40),
            Err(ProtocolError::LengthMismatch { .. })
        ));

        let mut bad_type = bytes.clone();
        bad_type[5] = 0x07;
        assert_eq!(
            Frame::decode(ChannelProfile::TwoChannel, &bad_type, Speed::Kbps40),
            Err(ProtocolError::InvalidHeaderType(7))
        );

        assert!(matches!(
            Frame::decode(ChannelProfile::TwoChannel, &bytes[..4], Speed::Kbps40),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_too_many_repeaters_rejected() {
        let mut frame = routed_2ch();
        if let FrameHeader::TwoChannel(h) = &mut frame.header {
            if let Addressing::Routed(r) = &mut h.addressing {
                r.repeaters = (2..=6).map(node).collect();
            }
        }
        assert_eq!(
            frame.encode(Speed::Kbps100),
            Err(ProtocolError::TooManyRepeaters(5))
        );
    }
}
