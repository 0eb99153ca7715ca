//! Courier per-friend wire protocol: packet IDs, limits, and the byte codec.
//!
//! Every per-friend packet travels inside one transport frame as
//! `packet_id (1 byte) || payload`. Multi-byte integers are big-endian.
//! The numeric IDs below are fixed; changing them breaks wire compatibility
//! with deployed peers.

pub const PACKET_ID_ONLINE: u8 = 24;
pub const PACKET_ID_OFFLINE: u8 = 25;
pub const PACKET_ID_NICKNAME: u8 = 48;
pub const PACKET_ID_STATUS_MESSAGE: u8 = 49;
pub const PACKET_ID_USER_STATUS: u8 = 50;
pub const PACKET_ID_TYPING: u8 = 51;
pub const PACKET_ID_MESSAGE: u8 = 64;
pub const PACKET_ID_ACTION: u8 = 65;
pub const PACKET_ID_MSI: u8 = 69;
pub const PACKET_ID_FILE_SEND_REQUEST: u8 = 80;
pub const PACKET_ID_FILE_CONTROL: u8 = 81;
pub const PACKET_ID_FILE_DATA: u8 = 82;
pub const PACKET_ID_INVITE_GROUPCHAT: u8 = 96;

/// First ID of the custom lossless range (app-reserved reliable channels).
pub const PACKET_ID_LOSSLESS_RANGE_START: u8 = 160;
pub const PACKET_ID_LOSSLESS_RANGE_SIZE: u8 = 32;
/// First ID of the custom lossy range (app-reserved unreliable channels).
pub const PACKET_ID_LOSSY_RANGE_START: u8 = 192;
pub const PACKET_ID_LOSSY_RANGE_SIZE: u8 = 63;
/// Leading IDs of the lossy range reserved for per-friend A/V (RTP) channels.
pub const LOSSY_AV_CHANNELS: u8 = 8;

/// Largest payload the transport accepts in one reliable frame.
pub const MAX_CRYPTO_DATA_SIZE: usize = 1017;
pub const MAX_NAME_LENGTH: usize = 128;
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 1007;
pub const MAX_MESSAGE_LENGTH: usize = MAX_CRYPTO_DATA_SIZE - 1;
pub const MAX_FRIEND_REQUEST_LENGTH: usize = 1016;
pub const MAX_FILENAME_LENGTH: usize = 255;
pub const FILE_ID_LENGTH: usize = 32;
/// Largest file chunk in one `FileData` packet (id + slot bytes subtracted).
pub const MAX_FILE_DATA_SIZE: usize = MAX_CRYPTO_DATA_SIZE - 2;

/// Self-reported availability, shown to friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserStatus {
    #[default]
    None = 0,
    Away = 1,
    Busy = 2,
}

impl UserStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(UserStatus::None),
            1 => Some(UserStatus::Away),
            2 => Some(UserStatus::Busy),
            _ => None,
        }
    }
}

/// Text message flavor. `Action` is the "/me" form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Normal = 0,
    Action = 1,
}

/// Role of a packet's *sender* with respect to a file transfer. A receiver
/// accepting a file sends `Receiving`; the handler maps that onto the local
/// sending slot, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending = 0,
    Receiving = 1,
}

impl Direction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Sending),
            1 => Some(Direction::Receiving),
            _ => None,
        }
    }

    /// The same transfer as seen from the other end.
    pub fn flipped(self) -> Self {
        match self {
            Direction::Sending => Direction::Receiving,
            Direction::Receiving => Direction::Sending,
        }
    }
}

/// File-transfer control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControlOp {
    Accept = 0,
    Pause = 1,
    Kill = 2,
    Seek = 3,
}

impl FileControlOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FileControlOp::Accept),
            1 => Some(FileControlOp::Pause),
            2 => Some(FileControlOp::Kill),
            3 => Some(FileControlOp::Seek),
            _ => None,
        }
    }
}

/// One decoded per-friend packet. Custom lossless/lossy ranges are routed by
/// raw ID before decoding and never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Zero payload; marks the sending device as online.
    Online,
    /// Zero payload; clean disconnect of the sending device.
    Offline,
    /// Friend's nickname, up to [`MAX_NAME_LENGTH`] bytes of UTF-8.
    Nickname(Vec<u8>),
    /// Friend's status message, up to [`MAX_STATUS_MESSAGE_LENGTH`] bytes.
    StatusMessage(Vec<u8>),
    UserStatus(UserStatus),
    Typing(bool),
    /// Chat text; kind is carried in the packet ID (Action = Message + 1).
    Message { kind: MessageKind, body: Vec<u8> },
    /// Opaque group-chat invite blob.
    GroupInvite(Vec<u8>),
    /// Offer of a new file transfer on the sender's slot.
    FileSendRequest {
        slot: u8,
        file_kind: u32,
        file_size: u64,
        file_id: [u8; FILE_ID_LENGTH],
        filename: Vec<u8>,
    },
    /// Control op for an in-flight transfer; `data` is op-specific (eight
    /// big-endian position bytes for Seek, empty otherwise).
    FileControl {
        direction: Direction,
        slot: u8,
        op: FileControlOp,
        data: Vec<u8>,
    },
    /// One chunk of file content; an empty chunk terminates the stream.
    FileData { slot: u8, chunk: Vec<u8> },
    /// Opaque A/V signalling blob.
    Msi(Vec<u8>),
}

impl Packet {
    /// Serialize to the on-wire form, including the leading packet ID.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Online => vec![PACKET_ID_ONLINE],
            Packet::Offline => vec![PACKET_ID_OFFLINE],
            Packet::Nickname(name) => prefixed(PACKET_ID_NICKNAME, name),
            Packet::StatusMessage(message) => prefixed(PACKET_ID_STATUS_MESSAGE, message),
            Packet::UserStatus(status) => vec![PACKET_ID_USER_STATUS, *status as u8],
            Packet::Typing(typing) => vec![PACKET_ID_TYPING, *typing as u8],
            Packet::Message { kind, body } => prefixed(PACKET_ID_MESSAGE + *kind as u8, body),
            Packet::GroupInvite(data) => prefixed(PACKET_ID_INVITE_GROUPCHAT, data),
            Packet::FileSendRequest {
                slot,
                file_kind,
                file_size,
                file_id,
                filename,
            } => {
                let mut out = Vec::with_capacity(2 + 4 + 8 + FILE_ID_LENGTH + filename.len());
                out.push(PACKET_ID_FILE_SEND_REQUEST);
                out.push(*slot);
                out.extend_from_slice(&file_kind.to_be_bytes());
                out.extend_from_slice(&file_size.to_be_bytes());
                out.extend_from_slice(file_id);
                out.extend_from_slice(filename);
                out
            }
            Packet::FileControl {
                direction,
                slot,
                op,
                data,
            } => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.push(PACKET_ID_FILE_CONTROL);
                out.push(*direction as u8);
                out.push(*slot);
                out.push(*op as u8);
                out.extend_from_slice(data);
                out
            }
            Packet::FileData { slot, chunk } => {
                let mut out = Vec::with_capacity(2 + chunk.len());
                out.push(PACKET_ID_FILE_DATA);
                out.push(*slot);
                out.extend_from_slice(chunk);
                out
            }
            Packet::Msi(data) => prefixed(PACKET_ID_MSI, data),
        }
    }

    /// Decode one packet (leading ID byte included). Malformed input is an
    /// error; the dispatcher drops it without disconnecting.
    pub fn decode(packet: &[u8]) -> Result<Packet, PacketError> {
        let (&id, data) = packet.split_first().ok_or(PacketError::Empty)?;

        match id {
            PACKET_ID_ONLINE => expect_len(data, 0).map(|_| Packet::Online),
            PACKET_ID_OFFLINE => expect_len(data, 0).map(|_| Packet::Offline),
            PACKET_ID_NICKNAME => {
                bounded(data, MAX_NAME_LENGTH)?;
                Ok(Packet::Nickname(data.to_vec()))
            }
            PACKET_ID_STATUS_MESSAGE => {
                bounded(data, MAX_STATUS_MESSAGE_LENGTH)?;
                Ok(Packet::StatusMessage(data.to_vec()))
            }
            PACKET_ID_USER_STATUS => {
                expect_len(data, 1)?;
                let status = UserStatus::from_u8(data[0]).ok_or(PacketError::BadField)?;
                Ok(Packet::UserStatus(status))
            }
            PACKET_ID_TYPING => {
                expect_len(data, 1)?;
                Ok(Packet::Typing(data[0] != 0))
            }
            PACKET_ID_MESSAGE | PACKET_ID_ACTION => {
                if data.is_empty() {
                    return Err(PacketError::Truncated);
                }
                bounded(data, MAX_MESSAGE_LENGTH)?;
                let kind = if id == PACKET_ID_MESSAGE {
                    MessageKind::Normal
                } else {
                    MessageKind::Action
                };
                Ok(Packet::Message {
                    kind,
                    body: data.to_vec(),
                })
            }
            PACKET_ID_INVITE_GROUPCHAT => {
                if data.is_empty() {
                    return Err(PacketError::Truncated);
                }
                Ok(Packet::GroupInvite(data.to_vec()))
            }
            PACKET_ID_FILE_SEND_REQUEST => {
                const HEAD: usize = 1 + 4 + 8 + FILE_ID_LENGTH;

                if data.len() < HEAD {
                    return Err(PacketError::Truncated);
                }

                let filename = &data[HEAD..];
                bounded(filename, MAX_FILENAME_LENGTH)?;

                let mut file_id = [0u8; FILE_ID_LENGTH];
                file_id.copy_from_slice(&data[13..13 + FILE_ID_LENGTH]);

                Ok(Packet::FileSendRequest {
                    slot: data[0],
                    file_kind: u32::from_be_bytes(data[1..5].try_into().unwrap()),
                    file_size: u64::from_be_bytes(data[5..13].try_into().unwrap()),
                    file_id,
                    filename: filename.to_vec(),
                })
            }
            PACKET_ID_FILE_CONTROL => {
                if data.len() < 3 {
                    return Err(PacketError::Truncated);
                }

                let direction = Direction::from_u8(data[0]).ok_or(PacketError::BadField)?;
                let op = FileControlOp::from_u8(data[2]).ok_or(PacketError::BadField)?;

                Ok(Packet::FileControl {
                    direction,
                    slot: data[1],
                    op,
                    data: data[3..].to_vec(),
                })
            }
            PACKET_ID_FILE_DATA => {
                if data.is_empty() {
                    return Err(PacketError::Truncated);
                }
                bounded(&data[1..], MAX_FILE_DATA_SIZE)?;
                Ok(Packet::FileData {
                    slot: data[0],
                    chunk: data[1..].to_vec(),
                })
            }
            PACKET_ID_MSI => {
                if data.is_empty() {
                    return Err(PacketError::Truncated);
                }
                Ok(Packet::Msi(data.to_vec()))
            }
            other => Err(PacketError::UnknownId(other)),
        }
    }
}

fn prefixed(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(id);
    out.extend_from_slice(payload);
    out
}

fn expect_len(data: &[u8], len: usize) -> Result<(), PacketError> {
    if data.len() == len {
        Ok(())
    } else {
        Err(PacketError::BadLength)
    }
}

fn bounded(data: &[u8], max: usize) -> Result<(), PacketError> {
    if data.len() <= max {
        Ok(())
    } else {
        Err(PacketError::Oversize)
    }
}

/// Error decoding a per-friend packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("payload shorter than the packet header requires")]
    Truncated,
    #[error("payload length outside the allowed range")]
    BadLength,
    #[error("payload exceeds the field limit")]
    Oversize,
    #[error("field value out of range")]
    BadField,
    #[error("unknown packet id {0}")]
    UnknownId(u8),
}

/// Whether the ID belongs to the custom lossless range.
pub fn is_custom_lossless(id: u8) -> bool {
    (PACKET_ID_LOSSLESS_RANGE_START
        ..PACKET_ID_LOSSLESS_RANGE_START + PACKET_ID_LOSSLESS_RANGE_SIZE)
        .contains(&id)
}

/// Whether the ID belongs to the custom lossy range.
pub fn is_custom_lossy(id: u8) -> bool {
    id >= PACKET_ID_LOSSY_RANGE_START
        && (id as u16) < PACKET_ID_LOSSY_RANGE_START as u16 + PACKET_ID_LOSSY_RANGE_SIZE as u16
}

/// Whether the ID is one of the lossy IDs reserved for per-friend A/V.
pub fn is_av_lossy(id: u8) -> bool {
    (PACKET_ID_LOSSY_RANGE_START..PACKET_ID_LOSSY_RANGE_START + LOSSY_AV_CHANNELS).contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_presence() {
        for packet in [Packet::Online, Packet::Offline] {
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn roundtrip_message() {
        let packet = Packet::Message {
            kind: MessageKind::Action,
            body: b"waves".to_vec(),
        };
        let bytes = packet.encode();
        assert_eq!(bytes[0], PACKET_ID_ACTION);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn roundtrip_file_send_request() {
        let packet = Packet::FileSendRequest {
            slot: 3,
            file_kind: 1,
            file_size: 1 << 40,
            file_id: [0xAB; FILE_ID_LENGTH],
            filename: b"backup.tar".to_vec(),
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn file_send_request_layout_is_big_endian() {
        let packet = Packet::FileSendRequest {
            slot: 0,
            file_kind: 0x0102_0304,
            file_size: 0x0506_0708_090A_0B0C,
            file_id: [0; FILE_ID_LENGTH],
            filename: Vec::new(),
        };
        let bytes = packet.encode();
        assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);
        assert_eq!(&bytes[6..14], &[5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn roundtrip_file_control_seek() {
        let packet = Packet::FileControl {
            direction: Direction::Receiving,
            slot: 7,
            op: FileControlOp::Seek,
            data: 1_048_576u64.to_be_bytes().to_vec(),
        };
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn online_with_payload_rejected() {
        assert_eq!(
            Packet::decode(&[PACKET_ID_ONLINE, 1]),
            Err(PacketError::BadLength)
        );
    }

    #[test]
    fn empty_message_rejected() {
        assert_eq!(
            Packet::decode(&[PACKET_ID_MESSAGE]),
            Err(PacketError::Truncated)
        );
    }

    #[test]
    fn oversize_nickname_rejected() {
        let mut bytes = vec![PACKET_ID_NICKNAME];
        bytes.extend_from_slice(&[b'x'; MAX_NAME_LENGTH + 1]);
        assert_eq!(Packet::decode(&bytes), Err(PacketError::Oversize));
    }

    #[test]
    fn bad_user_status_rejected() {
        assert_eq!(
            Packet::decode(&[PACKET_ID_USER_STATUS, 9]),
            Err(PacketError::BadField)
        );
    }

    #[test]
    fn truncated_file_send_request_rejected() {
        let bytes = vec![PACKET_ID_FILE_SEND_REQUEST; 12];
        assert_eq!(Packet::decode(&bytes), Err(PacketError::Truncated));
    }

    #[test]
    fn unknown_control_op_rejected() {
        assert_eq!(
            Packet::decode(&[PACKET_ID_FILE_CONTROL, 0, 0, 9]),
            Err(PacketError::BadField)
        );
    }

    #[test]
    fn id_ranges() {
        assert!(is_custom_lossless(160));
        assert!(is_custom_lossless(191));
        assert!(!is_custom_lossless(192));
        assert!(is_custom_lossy(192));
        assert!(is_custom_lossy(254));
        assert!(!is_custom_lossy(255));
        assert!(is_av_lossy(199));
        assert!(!is_av_lossy(200));
    }
}
