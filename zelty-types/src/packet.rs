use crate::{ClientInfo, FrameData, GameState, ServerInfo};

/// Wire packet type tags.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum PacketType {
    Heartbeat = 0,
    ClientInfo = 1,
    ServerInfo = 2,
    FrameData = 3,
    DetectionResult = 4,
    Error = 5,
    Command = 6,
    Ack = 7,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PacketType::Heartbeat),
            1 => Some(PacketType::ClientInfo),
            2 => Some(PacketType::ServerInfo),
            3 => Some(PacketType::FrameData),
            4 => Some(PacketType::DetectionResult),
            5 => Some(PacketType::Error),
            6 => Some(PacketType::Command),
            7 => Some(PacketType::Ack),
            _ => None,
        }
    }
}

/// Command tags carried in COMMAND packets. Command semantics are owned by
/// the peers' applications; the transport acts only on `Disconnect`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CommandKind {
    None = 0,
    StartStream = 1,
    StopStream = 2,
    PauseStream = 3,
    ResumeStream = 4,
    RequestKeyframe = 5,
    SetConfig = 6,
    GetConfig = 7,
    Ping = 8,
    Disconnect = 9,
}

impl CommandKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CommandKind::None),
            1 => Some(CommandKind::StartStream),
            2 => Some(CommandKind::StopStream),
            3 => Some(CommandKind::PauseStream),
            4 => Some(CommandKind::ResumeStream),
            5 => Some(CommandKind::RequestKeyframe),
            6 => Some(CommandKind::SetConfig),
            7 => Some(CommandKind::GetConfig),
            8 => Some(CommandKind::Ping),
            9 => Some(CommandKind::Disconnect),
            _ => None,
        }
    }
}

/// Error codes carried in ERROR packets.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    InvalidProtocol = 1,
    ServerFull = 2,
    Timeout = 4,
    InvalidRequest = 5,
    ServerError = 6,
    InferenceError = 7,
}

/// One wire packet body. One variant per type tag.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    Heartbeat {
        /// Advisory one-way latency sample; receivers derive RTT from ACK
        /// timing instead.
        ping_ms: u32,
    },
    ClientInfo(ClientInfo),
    ServerInfo(ServerInfo),
    FrameData(FrameData),
    DetectionResult(GameState),
    Error {
        code: u8,
        message: String,
    },
    Command {
        command: u8,
        data: Vec<u8>,
    },
    Ack {
        acked_sequence: u32,
    },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Heartbeat { .. } => PacketType::Heartbeat,
            Packet::ClientInfo(_) => PacketType::ClientInfo,
            Packet::ServerInfo(_) => PacketType::ServerInfo,
            Packet::FrameData(_) => PacketType::FrameData,
            Packet::DetectionResult(_) => PacketType::DetectionResult,
            Packet::Error { .. } => PacketType::Error,
            Packet::Command { .. } => PacketType::Command,
            Packet::Ack { .. } => PacketType::Ack,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code: code as u8,
            message: message.into(),
        }
    }

    pub fn command(kind: CommandKind) -> Self {
        Packet::Command {
            command: kind as u8,
            data: Vec::new(),
        }
    }
}

/// A packet together with its header metadata. The sequence number is
/// assigned by the sending transport; the timestamp is the sender's wall
/// clock in milliseconds.
#[derive(Debug, PartialEq, Clone)]
pub struct Envelope {
    pub sequence: u32,
    pub timestamp: u64,
    pub packet: Packet,
}

impl Envelope {
    pub fn new(sequence: u32, packet: Packet) -> Self {
        Self {
            sequence,
            timestamp: crate::now_ms(),
            packet,
        }
    }
}
