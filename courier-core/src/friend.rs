//! Roster records: friends, their devices, and outstanding receipts.

use std::collections::VecDeque;

use crate::identity::{Nospam, PublicKey};
use crate::protocol::{UserStatus, LOSSY_AV_CHANNELS};
use crate::transfer::{FileTransfer, MAX_CONCURRENT_FILE_PIPES};
use crate::transport::{ConnectionId, ConnectionKind, PacketNumber};

/// Stable roster index handed to the application. Indices survive roster
/// growth and are only reused after an explicit delete.
pub type FriendNumber = u32;

/// Seconds before an unacknowledged friend request is retried. Doubles on
/// every failed attempt.
pub const FRIEND_REQUEST_TIMEOUT: u64 = 5;

/// Contact lifecycle. Never decreases except for the Online/Confirmed
/// oscillation that tracks connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FriendStatus {
    /// Request queued but not yet handed to the transport.
    Added = 1,
    /// Request sent; awaiting the peer to come online.
    Requested = 2,
    /// Mutual consent recorded; peer currently unreachable.
    Confirmed = 3,
    Online = 4,
}

impl FriendStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FriendStatus::Added),
            2 => Some(FriendStatus::Requested),
            3 => Some(FriendStatus::Confirmed),
            4 => Some(FriendStatus::Online),
            _ => None,
        }
    }
}

/// Lifecycle of one device under a friend identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Pending = 1,
    Confirmed = 2,
    Online = 3,
}

impl DeviceStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeviceStatus::Pending),
            2 => Some(DeviceStatus::Confirmed),
            3 => Some(DeviceStatus::Online),
            _ => None,
        }
    }
}

/// One connection endpoint under a friend identity.
#[derive(Debug, Clone, Copy)]
pub struct Device {
    pub public_key: PublicKey,
    pub connection: ConnectionId,
    pub status: DeviceStatus,
}

/// Binding between a sent message and the transport packet carrying it.
/// Resolved into a read-receipt event once the packet is acknowledged on
/// the connection it actually went out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub packet_number: PacketNumber,
    pub message_id: u32,
    pub connection: ConnectionId,
}

/// One roster entry. Owned exclusively by the messenger; file slots and
/// receipts live and die with it.
pub struct Friend {
    pub status: FriendStatus,
    pub devices: Vec<Device>,

    // Friend-request state, meaningful while status < Confirmed.
    pub request_payload: Vec<u8>,
    pub request_nospam: Nospam,
    pub request_last_sent: u64,
    pub request_timeout: u64,

    // What the friend last told us about themselves.
    pub name: Vec<u8>,
    pub status_message: Vec<u8>,
    pub user_status: UserStatus,
    pub typing: bool,

    /// Our typing flag toward this friend.
    pub we_are_typing: bool,

    // Cleared on every offline->online edge so the tick republishes.
    pub name_sent: bool,
    pub status_message_sent: bool,
    pub user_status_sent: bool,
    pub typing_sent: bool,

    pub message_id: u32,
    pub receipts: VecDeque<Receipt>,

    pub file_sending: [FileTransfer; MAX_CONCURRENT_FILE_PIPES],
    pub file_receiving: [FileTransfer; MAX_CONCURRENT_FILE_PIPES],
    pub num_sending_files: u32,

    pub last_connection_kind: ConnectionKind,
    pub last_seen: u64,

    /// Which reserved lossy IDs route to `Event::RtpPacket`.
    pub rtp_channels: [bool; LOSSY_AV_CHANNELS as usize],
}

impl Friend {
    pub fn new(status: FriendStatus, device: Device) -> Self {
        Friend {
            status,
            devices: vec![device],
            request_payload: Vec::new(),
            request_nospam: Nospam::default(),
            request_last_sent: 0,
            request_timeout: FRIEND_REQUEST_TIMEOUT,
            name: Vec::new(),
            status_message: Vec::new(),
            user_status: UserStatus::None,
            typing: false,
            we_are_typing: false,
            name_sent: false,
            status_message_sent: false,
            user_status_sent: false,
            typing_sent: false,
            message_id: 0,
            receipts: VecDeque::new(),
            file_sending: [FileTransfer::EMPTY; MAX_CONCURRENT_FILE_PIPES],
            file_receiving: [FileTransfer::EMPTY; MAX_CONCURRENT_FILE_PIPES],
            num_sending_files: 0,
            last_connection_kind: ConnectionKind::None,
            last_seen: 0,
            rtp_channels: [false; LOSSY_AV_CHANNELS as usize],
        }
    }

    pub fn device_index(&self, public_key: &PublicKey) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.public_key == *public_key)
    }

    pub fn any_device_online(&self) -> bool {
        self.devices.iter().any(|d| d.status == DeviceStatus::Online)
    }

    /// Connection of the primary (first) device. Request sending, receipt
    /// polling, and file traffic all ride this connection.
    pub fn primary_connection(&self) -> ConnectionId {
        self.devices[0].connection
    }

    /// Forget every pending receipt (friend went offline or away).
    pub fn clear_receipts(&mut self) {
        self.receipts.clear();
    }

    /// Force all file slots back to empty without terminal upcalls.
    pub fn break_files(&mut self) {
        for ft in self.file_sending.iter_mut() {
            ft.clear();
        }
        for ft in self.file_receiving.iter_mut() {
            ft.clear();
        }
        self.num_sending_files = 0;
    }
}
