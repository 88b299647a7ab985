//! Little-endian wire codec for the packet family.
//!
//! Layout of every datagram payload:
//!
//! ```text
//! magic:u32 version:u8 type:u8 length:u16 sequence:u32 timestamp:u64 checksum:u16
//! ```
//!
//! followed by `length` body bytes. The checksum is CRC-16/IBM-3740
//! (poly 0x1021, init 0xFFFF, no final XOR) over header and body with the
//! checksum field zeroed. A datagram may carry several packets
//! back-to-back (small-packet aggregation); `drain_datagram` yields each
//! in turn.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    BoundingBox, ClientInfo, Detection, Envelope, FrameData, GameState, Packet, PacketType,
    Result, ServerInfo, ZeltyTypesError, HEADER_SIZE, MAX_PACKET_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);
const CHECKSUM_OFFSET: usize = 20;

/// Size of one fixed `Detection` record on the wire.
pub const DETECTION_RECORD_SIZE: usize = 33;

pub trait ReadWireExt: std::io::Read {
    fn read_bounding_box(&mut self) -> Result<BoundingBox> {
        Ok(BoundingBox {
            x: self.read_f32::<LittleEndian>()?,
            y: self.read_f32::<LittleEndian>()?,
            width: self.read_f32::<LittleEndian>()?,
            height: self.read_f32::<LittleEndian>()?,
        })
    }

    fn read_detection(&mut self) -> Result<Detection> {
        let bbox = self.read_bounding_box()?;
        let confidence = self.read_f32::<LittleEndian>()?;
        let class_id = self.read_u8()?;
        let track_id = self.read_u32::<LittleEndian>()?;
        let timestamp = self.read_u64::<LittleEndian>()?;
        Ok(Detection {
            bbox,
            confidence,
            class_id,
            track_id,
            timestamp,
        })
    }

    fn read_client_info(&mut self) -> Result<ClientInfo> {
        Ok(ClientInfo {
            client_id: self.read_u32::<LittleEndian>()?,
            protocol_version: self.read_u32::<LittleEndian>()?,
            screen_width: self.read_u16::<LittleEndian>()?,
            screen_height: self.read_u16::<LittleEndian>()?,
            game_id: self.read_u8()?,
        })
    }

    fn read_server_info(&mut self) -> Result<ServerInfo> {
        Ok(ServerInfo {
            server_id: self.read_u32::<LittleEndian>()?,
            protocol_version: self.read_u32::<LittleEndian>()?,
            model_version: self.read_f32::<LittleEndian>()?,
            max_clients: self.read_u8()?,
            max_fps: self.read_u16::<LittleEndian>()?,
            status: self.read_u8()?,
        })
    }
}

/// All types that implement `Read` get the wire read methods for free.
impl<R: std::io::Read + ?Sized> ReadWireExt for R {}

fn write_detection(out: &mut Vec<u8>, det: &Detection) -> Result<()> {
    out.write_f32::<LittleEndian>(det.bbox.x)?;
    out.write_f32::<LittleEndian>(det.bbox.y)?;
    out.write_f32::<LittleEndian>(det.bbox.width)?;
    out.write_f32::<LittleEndian>(det.bbox.height)?;
    out.write_f32::<LittleEndian>(det.confidence)?;
    out.write_u8(det.class_id)?;
    out.write_u32::<LittleEndian>(det.track_id)?;
    out.write_u64::<LittleEndian>(det.timestamp)?;
    Ok(())
}

fn serialize_body(packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Heartbeat { ping_ms } => {
            out.write_u32::<LittleEndian>(*ping_ms)?;
        }
        Packet::ClientInfo(info) => {
            out.write_u32::<LittleEndian>(info.client_id)?;
            out.write_u32::<LittleEndian>(info.protocol_version)?;
            out.write_u16::<LittleEndian>(info.screen_width)?;
            out.write_u16::<LittleEndian>(info.screen_height)?;
            out.write_u8(info.game_id)?;
        }
        Packet::ServerInfo(info) => {
            out.write_u32::<LittleEndian>(info.server_id)?;
            out.write_u32::<LittleEndian>(info.protocol_version)?;
            out.write_f32::<LittleEndian>(info.model_version)?;
            out.write_u8(info.max_clients)?;
            out.write_u16::<LittleEndian>(info.max_fps)?;
            out.write_u8(info.status)?;
        }
        Packet::FrameData(frame) => {
            out.write_u32::<LittleEndian>(frame.frame_id)?;
            out.write_u64::<LittleEndian>(frame.timestamp)?;
            out.write_u16::<LittleEndian>(frame.width)?;
            out.write_u16::<LittleEndian>(frame.height)?;
            out.write_u8(u8::from(frame.keyframe))?;
            out.extend_from_slice(&frame.data);
        }
        Packet::DetectionResult(state) => {
            out.write_u32::<LittleEndian>(state.frame_id)?;
            out.write_u64::<LittleEndian>(state.timestamp)?;
            out.write_u16::<LittleEndian>(state.detections.len() as u16)?;
            for det in &state.detections {
                write_detection(out, det)?;
            }
        }
        Packet::Error { code, message } => {
            out.write_u8(*code)?;
            out.write_u16::<LittleEndian>(message.len() as u16)?;
            out.extend_from_slice(message.as_bytes());
        }
        Packet::Command { command, data } => {
            out.write_u8(*command)?;
            out.write_u16::<LittleEndian>(data.len() as u16)?;
            out.extend_from_slice(data);
        }
        Packet::Ack { acked_sequence } => {
            out.write_u32::<LittleEndian>(*acked_sequence)?;
        }
    }
    Ok(())
}

fn deserialize_body(ty: PacketType, body: &[u8]) -> Result<Packet> {
    let mut rdr = std::io::Cursor::new(body);
    let packet = match ty {
        PacketType::Heartbeat => Packet::Heartbeat {
            ping_ms: rdr.read_u32::<LittleEndian>()?,
        },
        PacketType::ClientInfo => Packet::ClientInfo(rdr.read_client_info()?),
        PacketType::ServerInfo => Packet::ServerInfo(rdr.read_server_info()?),
        PacketType::FrameData => {
            let frame_id = rdr.read_u32::<LittleEndian>()?;
            let timestamp = rdr.read_u64::<LittleEndian>()?;
            let width = rdr.read_u16::<LittleEndian>()?;
            let height = rdr.read_u16::<LittleEndian>()?;
            let keyframe = rdr.read_u8()? == 1;
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut rdr, &mut data)?;
            Packet::FrameData(FrameData {
                frame_id,
                timestamp,
                width,
                height,
                keyframe,
                data,
            })
        }
        PacketType::DetectionResult => {
            let frame_id = rdr.read_u32::<LittleEndian>()?;
            let timestamp = rdr.read_u64::<LittleEndian>()?;
            let count = rdr.read_u16::<LittleEndian>()? as usize;
            let remaining = body.len() - rdr.position() as usize;
            if remaining < count * DETECTION_RECORD_SIZE {
                return Err(ZeltyTypesError::TruncatedBody);
            }
            let detections = (0..count)
                .map(|_| rdr.read_detection())
                .collect::<Result<Vec<_>>>()?;
            Packet::DetectionResult(GameState {
                frame_id,
                timestamp,
                detections,
            })
        }
        PacketType::Error => {
            let code = rdr.read_u8()?;
            let len = rdr.read_u16::<LittleEndian>()? as usize;
            let start = rdr.position() as usize;
            let bytes = body
                .get(start..start + len)
                .ok_or(ZeltyTypesError::TruncatedBody)?;
            Packet::Error {
                code,
                message: std::str::from_utf8(bytes)?.to_string(),
            }
        }
        PacketType::Command => {
            let command = rdr.read_u8()?;
            let len = rdr.read_u16::<LittleEndian>()? as usize;
            let start = rdr.position() as usize;
            let data = body
                .get(start..start + len)
                .ok_or(ZeltyTypesError::TruncatedBody)?
                .to_vec();
            Packet::Command { command, data }
        }
        PacketType::Ack => Packet::Ack {
            acked_sequence: rdr.read_u32::<LittleEndian>()?,
        },
    };
    Ok(packet)
}

/// Serialize one packet into a self-contained wire frame.
pub fn serialize_packet(env: &Envelope) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    serialize_body(&env.packet, &mut body)?;
    if body.len() > MAX_PACKET_SIZE - HEADER_SIZE || body.len() > u16::MAX as usize {
        return Err(ZeltyTypesError::BodyTooLarge);
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.write_u32::<LittleEndian>(PROTOCOL_MAGIC)?;
    out.write_u8(PROTOCOL_VERSION)?;
    out.write_u8(env.packet.packet_type() as u8)?;
    out.write_u16::<LittleEndian>(body.len() as u16)?;
    out.write_u32::<LittleEndian>(env.sequence)?;
    out.write_u64::<LittleEndian>(env.timestamp)?;
    out.write_u16::<LittleEndian>(0)?; // checksum placeholder
    out.extend_from_slice(&body);

    let checksum = CRC16.checksum(&out);
    out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

/// Parse one packet occupying the whole buffer.
pub fn deserialize_packet(buf: &[u8]) -> Result<Envelope> {
    let (env, consumed) = deserialize_prefix(buf)?;
    if consumed != buf.len() {
        return Err(ZeltyTypesError::LengthMismatch);
    }
    Ok(env)
}

/// Parse every packet in a datagram. Aggregated datagrams carry several
/// complete frames back-to-back, each with its own header and checksum.
pub fn drain_datagram(buf: &[u8]) -> Result<Vec<Envelope>> {
    let mut out = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (env, consumed) = deserialize_prefix(rest)?;
        out.push(env);
        rest = &rest[consumed..];
    }
    Ok(out)
}

fn deserialize_prefix(buf: &[u8]) -> Result<(Envelope, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(ZeltyTypesError::TooSmall);
    }
    let mut rdr = std::io::Cursor::new(buf);
    let magic = rdr.read_u32::<LittleEndian>()?;
    if magic != PROTOCOL_MAGIC {
        return Err(ZeltyTypesError::BadMagic);
    }
    let version = rdr.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(ZeltyTypesError::BadVersion(version));
    }
    let type_tag = rdr.read_u8()?;
    let ty = PacketType::from_u8(type_tag).ok_or(ZeltyTypesError::UnknownPacketType(type_tag))?;
    let length = rdr.read_u16::<LittleEndian>()? as usize;
    let sequence = rdr.read_u32::<LittleEndian>()?;
    let timestamp = rdr.read_u64::<LittleEndian>()?;
    let expected = rdr.read_u16::<LittleEndian>()?;

    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Err(ZeltyTypesError::LengthMismatch);
    }

    let mut frame = buf[..total].to_vec();
    frame[CHECKSUM_OFFSET] = 0;
    frame[CHECKSUM_OFFSET + 1] = 0;
    let computed = CRC16.checksum(&frame);
    if computed != expected {
        return Err(ZeltyTypesError::ChecksumMismatch { expected, computed });
    }

    let packet = deserialize_body(ty, &buf[HEADER_SIZE..total])?;
    Ok((
        Envelope {
            sequence,
            timestamp,
            packet,
        },
        total,
    ))
}
