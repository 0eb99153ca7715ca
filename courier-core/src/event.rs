//! Application upcalls, buffered as events.
//!
//! Every callback of the classic messenger API is an [`Event`] variant. The
//! core pushes events synchronously from whatever call caused them (most
//! often `tick` or `handle_packet`) and the host drains them with
//! [`crate::Messenger::poll_event`] at a safe point, so re-entering the core
//! from "inside a callback" cannot happen.

use crate::friend::FriendNumber;
use crate::identity::PublicKey;
use crate::protocol::{FileControlOp, MessageKind, UserStatus};
use crate::transport::{ConnectionKind, NetworkStatus};

/// One buffered application upcall. Events for a single friend are queued
/// in the order the transport delivered the packets that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Inbound friend request that passed the duplicate filter.
    FriendRequest {
        public_key: PublicKey,
        message: Vec<u8>,
    },
    /// Chat message from a friend. UTF-8 by convention, not enforced.
    Message {
        friend: FriendNumber,
        kind: MessageKind,
        message: Vec<u8>,
    },
    NameChange {
        friend: FriendNumber,
        name: Vec<u8>,
    },
    StatusMessageChange {
        friend: FriendNumber,
        message: Vec<u8>,
    },
    UserStatusChange {
        friend: FriendNumber,
        status: UserStatus,
    },
    TypingChange {
        friend: FriendNumber,
        typing: bool,
    },
    /// A message we sent reached the friend; carries the id returned by
    /// `send_message`. Always delivered in message-id order.
    ReadReceipt {
        friend: FriendNumber,
        message_id: u32,
    },
    /// Friend-level presence edge; A/V layers key call teardown off this.
    FriendOnline {
        friend: FriendNumber,
        online: bool,
    },
    /// Debounced link-kind report: Udp / Tcp / Unknown / None.
    ConnectionKindChange {
        friend: FriendNumber,
        kind: ConnectionKind,
    },
    /// Our own reachability changed.
    NetworkStatusChange {
        status: NetworkStatus,
    },
    /// Opaque group-chat invite blob from a friend.
    GroupInvite {
        friend: FriendNumber,
        data: Vec<u8>,
    },
    /// A friend offers a file. Accept or kill via `file_control`.
    FileSendRequest {
        friend: FriendNumber,
        file_number: u32,
        file_kind: u32,
        file_size: u64,
        filename: Vec<u8>,
    },
    /// The remote side accepted / paused / resumed / killed a transfer.
    FileControl {
        friend: FriendNumber,
        file_number: u32,
        op: FileControlOp,
    },
    /// One received chunk; empty `data` marks end of stream.
    FileData {
        friend: FriendNumber,
        file_number: u32,
        position: u64,
        data: Vec<u8>,
    },
    /// The engine wants `length` bytes at `position` fed to `file_data`;
    /// `length == 0` means the transfer completed and the slot is free.
    FileChunkRequest {
        friend: FriendNumber,
        file_number: u32,
        position: u64,
        length: usize,
    },
    /// A/V signalling blob.
    MsiPacket {
        friend: FriendNumber,
        data: Vec<u8>,
    },
    /// Lossy packet on a registered per-friend A/V channel. `data` keeps the
    /// leading packet-ID byte.
    RtpPacket {
        friend: FriendNumber,
        data: Vec<u8>,
    },
    /// Custom lossy packet outside the A/V range (ID byte included).
    LossyPacket {
        friend: FriendNumber,
        data: Vec<u8>,
    },
    /// Custom lossless packet (ID byte included).
    LosslessPacket {
        friend: FriendNumber,
        data: Vec<u8>,
    },
}
