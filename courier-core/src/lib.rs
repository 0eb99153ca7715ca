//! Courier messenger core.
//! Host-driven: no I/O; the host feeds transport traffic in and drains
//! application events out.
//!
//! The core keeps the friend roster, walks each contact through the
//! request/confirm/online lifecycle, multiplexes the per-friend
//! sub-protocols (presence, nicknames, messages, invites, file transfers,
//! custom packets) over the transport's packet framing, and saves and
//! restores all of it.
//!
//! ## Host responsibilities
//!
//! - **Transport**: The host implements [`Transport`] over its encrypted
//!   stack (key exchange, packet encryption, congestion control, relays).
//!   The core only sees opaque connection handles and packet numbers.
//! - **Inbound traffic**: The host routes received frames into
//!   [`Messenger::handle_packet`] / [`Messenger::handle_lossy_packet`],
//!   connection edges into [`Messenger::handle_connection_status`], and
//!   friend requests into [`Messenger::handle_friend_request`].
//! - **The tick**: [`Messenger::tick`] drives request retries, presence
//!   resync, read receipts, and file chunk scheduling. Call it at least
//!   every [`Messenger::run_interval`] milliseconds.
//! - **Events**: Every application upcall is buffered; drain
//!   [`Messenger::poll_event`] after each batch of calls.

pub mod event;
pub mod friend;
pub mod identity;
pub mod messenger;
pub mod protocol;
pub mod savedata;
pub mod transfer;
pub mod transport;

pub use event::Event;
pub use friend::{DeviceStatus, FriendNumber, FriendStatus};
pub use identity::{FriendAddress, Nospam, PublicKey, FRIEND_ADDRESS_SIZE};
pub use messenger::{
    AddFriendError, CustomPacketError, FileControlError, FileDataError, FileQueryError,
    FileSeekError, FileSendError, InvalidFriend, Messenger, SendMessageError, SendPacketError,
    SetInfoError, MIN_SLOTS_FREE,
};
pub use protocol::{FileControlOp, MessageKind, UserStatus};
pub use savedata::SaveDataError;
pub use transfer::{TransferStatus, MAX_CONCURRENT_FILE_PIPES};
pub use transport::{
    ConnectionId, ConnectionKind, LinkKind, MockTransport, NetworkStatus, PacketNumber, TcpRelay,
    Transport, TransportError,
};
