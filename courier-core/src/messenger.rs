//! The messenger: roster, packet dispatcher, senders, file engine, tick.

use std::collections::{HashMap, VecDeque};

use rand::RngCore;
use tracing::{debug, trace};

use crate::event::Event;
use crate::friend::{
    Device, DeviceStatus, Friend, FriendNumber, FriendStatus, Receipt, FRIEND_REQUEST_TIMEOUT,
};
use crate::identity::{FriendAddress, Nospam, PublicKey, FRIEND_ADDRESS_SIZE};
use crate::protocol::{
    is_av_lossy, is_custom_lossless, is_custom_lossy, Direction, FileControlOp, MessageKind,
    Packet, PacketError, UserStatus, FILE_ID_LENGTH, MAX_CRYPTO_DATA_SIZE, MAX_FILENAME_LENGTH,
    MAX_FILE_DATA_SIZE, MAX_FRIEND_REQUEST_LENGTH, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH,
    MAX_STATUS_MESSAGE_LENGTH, PACKET_ID_LOSSY_RANGE_START,
};
use crate::transfer::{
    file_number, parse_file_number, FileTransfer, TransferStatus, MAX_CONCURRENT_FILE_PIPES,
    PAUSE_OTHER, PAUSE_US, STREAMING_FILE_SIZE,
};
use crate::transport::{
    ConnectionId, ConnectionKind, LinkKind, NetworkStatus, TcpRelay, Transport,
    CRYPTO_MIN_QUEUE_LENGTH,
};

/// Send-queue entries the file engine leaves for non-file traffic.
pub const MIN_SLOTS_FREE: u32 = CRYPTO_MIN_QUEUE_LENGTH / 4;

/// Floor for the advised tick interval.
pub const MIN_RUN_INTERVAL_MS: u64 = 50;

/// The messenger core. Single-threaded and non-blocking: the host feeds
/// inbound traffic through the `handle_*` methods, calls [`tick`] at the
/// cadence advised by [`run_interval`], and drains [`Event`]s after every
/// batch of calls.
///
/// [`tick`]: Messenger::tick
/// [`run_interval`]: Messenger::run_interval
pub struct Messenger<T: Transport> {
    pub(crate) transport: T,
    pub(crate) friends: Vec<Option<Friend>>,
    /// Routes transport connections back to (friend, device).
    conn_map: HashMap<ConnectionId, (FriendNumber, usize)>,
    pub(crate) name: Vec<u8>,
    pub(crate) status_message: Vec<u8>,
    pub(crate) user_status: UserStatus,
    events: VecDeque<Event>,
    /// Keys whose friend request was already surfaced to the application.
    seen_requests: Vec<PublicKey>,
    last_network_status: NetworkStatus,
    pub(crate) loaded_relays: Vec<TcpRelay>,
    pub(crate) relays_replayed: bool,
}

impl<T: Transport> Messenger<T> {
    /// Wrap a transport. A fresh identity (all-zero nospam) gets a random
    /// nospam so published addresses are spam-resistant from the start.
    pub fn new(mut transport: T) -> Self {
        if transport.nospam() == Nospam::default() {
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            transport.set_nospam(Nospam(bytes));
        }

        Messenger {
            transport,
            friends: Vec::new(),
            conn_map: HashMap::new(),
            name: Vec::new(),
            status_message: Vec::new(),
            user_status: UserStatus::None,
            events: VecDeque::new(),
            seen_requests: Vec::new(),
            last_network_status: NetworkStatus::None,
            loaded_relays: Vec::new(),
            relays_replayed: true,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Next buffered application upcall, oldest first.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Milliseconds until the host should call [`Messenger::tick`] again.
    pub fn run_interval(&self) -> u64 {
        self.transport.run_interval().min(MIN_RUN_INTERVAL_MS)
    }

    // ----- self identity ---------------------------------------------------

    /// The address to hand to people who want to add us.
    pub fn self_address(&self) -> FriendAddress {
        FriendAddress::new(self.transport.self_public_key(), self.transport.nospam())
    }

    pub fn nospam(&self) -> Nospam {
        self.transport.nospam()
    }

    /// Rotate the published nospam, invalidating every address handed out
    /// so far.
    pub fn set_nospam(&mut self, nospam: Nospam) {
        self.transport.set_nospam(nospam);
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Set our nickname; republished to every online friend on the next
    /// tick.
    pub fn set_name(&mut self, name: &[u8]) -> Result<(), SetInfoError> {
        if name.len() > MAX_NAME_LENGTH {
            return Err(SetInfoError::TooLong);
        }

        if self.name == name {
            return Ok(());
        }

        self.name = name.to_vec();
        for friend in self.friends.iter_mut().flatten() {
            friend.name_sent = false;
        }
        Ok(())
    }

    pub fn status_message(&self) -> &[u8] {
        &self.status_message
    }

    pub fn set_status_message(&mut self, message: &[u8]) -> Result<(), SetInfoError> {
        if message.len() > MAX_STATUS_MESSAGE_LENGTH {
            return Err(SetInfoError::TooLong);
        }

        if self.status_message == message {
            return Ok(());
        }

        self.status_message = message.to_vec();
        for friend in self.friends.iter_mut().flatten() {
            friend.status_message_sent = false;
        }
        Ok(())
    }

    pub fn user_status(&self) -> UserStatus {
        self.user_status
    }

    pub fn set_user_status(&mut self, status: UserStatus) {
        if self.user_status == status {
            return;
        }

        self.user_status = status;
        for friend in self.friends.iter_mut().flatten() {
            friend.user_status_sent = false;
        }
    }

    // ----- roster ----------------------------------------------------------

    /// Add a friend and queue a request carrying `message`. Returns the new
    /// friend number; `SetNewNospam` means the key was already queued and
    /// only its nospam was refreshed.
    pub fn add_friend(
        &mut self,
        address: &[u8; FRIEND_ADDRESS_SIZE],
        message: &[u8],
    ) -> Result<FriendNumber, AddFriendError> {
        if message.len() > MAX_FRIEND_REQUEST_LENGTH {
            return Err(AddFriendError::TooLong);
        }

        let address =
            FriendAddress::from_bytes(address).map_err(|_| AddFriendError::BadChecksum)?;

        if !address.public_key.is_valid() {
            return Err(AddFriendError::BadChecksum);
        }

        if message.is_empty() {
            return Err(AddFriendError::NoMessage);
        }

        if address.public_key == self.transport.self_public_key() {
            return Err(AddFriendError::OwnKey);
        }

        if let Some(existing) = self.friend_by_public_key(&address.public_key) {
            let friend = self.friends[existing as usize].as_mut().unwrap();

            if friend.status >= FriendStatus::Confirmed
                || friend.request_nospam == address.nospam
            {
                return Err(AddFriendError::AlreadySent);
            }

            friend.request_nospam = address.nospam;
            return Err(AddFriendError::SetNewNospam);
        }

        let number = self.init_friend(&address.public_key, FriendStatus::Added)?;
        let friend = self.friends[number as usize].as_mut().unwrap();
        friend.request_payload = message.to_vec();
        friend.request_nospam = address.nospam;
        friend.request_timeout = FRIEND_REQUEST_TIMEOUT;
        debug!(friend = number, "queued friend request");
        Ok(number)
    }

    /// Add a friend without sending a request: inbound requests we accepted
    /// and save-file restores.
    pub fn add_friend_norequest(
        &mut self,
        public_key: &PublicKey,
    ) -> Result<FriendNumber, AddFriendError> {
        if self.friend_by_public_key(public_key).is_some() {
            return Err(AddFriendError::AlreadySent);
        }

        if !public_key.is_valid() {
            return Err(AddFriendError::BadChecksum);
        }

        if *public_key == self.transport.self_public_key() {
            return Err(AddFriendError::OwnKey);
        }

        self.init_friend(public_key, FriendStatus::Confirmed)
    }

    /// Attach another device address to an existing confirmed friend.
    /// Returns the device index within the friend.
    pub fn add_device_to_friend(
        &mut self,
        address: &[u8; FRIEND_ADDRESS_SIZE],
        friend: FriendNumber,
    ) -> Result<usize, AddFriendError> {
        let address =
            FriendAddress::from_bytes(address).map_err(|_| AddFriendError::BadChecksum)?;

        if !address.public_key.is_valid() {
            return Err(AddFriendError::BadChecksum);
        }

        if address.public_key == self.transport.self_public_key() {
            return Err(AddFriendError::OwnKey);
        }

        if let Some(existing) = self.friend_by_public_key(&address.public_key) {
            let record = self.friends[existing as usize].as_mut().unwrap();

            if record.status >= FriendStatus::Confirmed
                || record.request_nospam == address.nospam
            {
                return Err(AddFriendError::AlreadySent);
            }

            record.request_nospam = address.nospam;
            return Err(AddFriendError::SetNewNospam);
        }

        self.init_device(friend, &address.public_key, DeviceStatus::Pending)
    }

    pub(crate) fn add_device_confirmed(
        &mut self,
        public_key: &PublicKey,
        friend: FriendNumber,
    ) -> Result<usize, AddFriendError> {
        if !public_key.is_valid() {
            return Err(AddFriendError::BadChecksum);
        }

        if *public_key == self.transport.self_public_key() {
            return Err(AddFriendError::OwnKey);
        }

        if self.friend_by_public_key(public_key).is_some() {
            return Err(AddFriendError::AlreadySent);
        }

        self.init_device(friend, public_key, DeviceStatus::Confirmed)
    }

    /// Remove a friend: receipts flushed, request authorization dropped, a
    /// clean Offline sent where connected, every device connection released,
    /// and the slot freed for reuse.
    pub fn delete_friend(&mut self, friend: FriendNumber) -> Result<(), InvalidFriend> {
        self.friend_ref(friend)?;

        self.events.push_back(Event::FriendOnline {
            friend,
            online: false,
        });

        let record = self.friends[friend as usize].take().unwrap();

        for device in &record.devices {
            self.seen_requests.retain(|pk| *pk != device.public_key);
            self.conn_map.remove(&device.connection);

            if self.transport.is_connected(device.connection) {
                let _ = self
                    .transport
                    .send_lossless(device.connection, &Packet::Offline.encode());
            }

            self.transport.close(device.connection);
        }

        while matches!(self.friends.last(), Some(None)) {
            self.friends.pop();
        }

        debug!(friend, "deleted friend");
        Ok(())
    }

    pub fn friend_exists(&self, friend: FriendNumber) -> bool {
        self.friend_ref(friend).is_ok()
    }

    pub fn friend_by_public_key(&self, public_key: &PublicKey) -> Option<FriendNumber> {
        self.friends.iter().enumerate().find_map(|(i, friend)| {
            friend
                .as_ref()
                .filter(|f| f.device_index(public_key).is_some())
                .map(|_| i as FriendNumber)
        })
    }

    /// Public key of the friend's primary device.
    pub fn public_key_of(&self, friend: FriendNumber) -> Result<PublicKey, InvalidFriend> {
        Ok(self.friend_ref(friend)?.devices[0].public_key)
    }

    /// Live friend numbers, ascending.
    pub fn friend_list(&self) -> Vec<FriendNumber> {
        self.friends
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_some())
            .map(|(i, _)| i as FriendNumber)
            .collect()
    }

    pub fn name_of(&self, friend: FriendNumber) -> Result<&[u8], InvalidFriend> {
        Ok(&self.friend_ref(friend)?.name)
    }

    pub fn status_message_of(&self, friend: FriendNumber) -> Result<&[u8], InvalidFriend> {
        Ok(&self.friend_ref(friend)?.status_message)
    }

    pub fn user_status_of(&self, friend: FriendNumber) -> Result<UserStatus, InvalidFriend> {
        Ok(self.friend_ref(friend)?.user_status)
    }

    pub fn is_typing(&self, friend: FriendNumber) -> Result<bool, InvalidFriend> {
        Ok(self.friend_ref(friend)?.typing)
    }

    pub fn last_seen(&self, friend: FriendNumber) -> Result<u64, InvalidFriend> {
        Ok(self.friend_ref(friend)?.last_seen)
    }

    pub fn friend_status(&self, friend: FriendNumber) -> Result<FriendStatus, InvalidFriend> {
        Ok(self.friend_ref(friend)?.status)
    }

    /// Mark ourselves typing toward a friend; resent like the other presence
    /// fields.
    pub fn set_typing(&mut self, friend: FriendNumber, typing: bool) -> Result<(), InvalidFriend> {
        let record = self.friend_mut(friend)?;

        if record.we_are_typing != typing {
            record.we_are_typing = typing;
            record.typing_sent = false;
        }
        Ok(())
    }

    /// Current connection kind, `None` unless the friend is online. A
    /// momentary `Unknown` right after Udp keeps reporting Udp instead of
    /// flapping through Tcp.
    pub fn connection_status(
        &self,
        friend: FriendNumber,
    ) -> Result<ConnectionKind, InvalidFriend> {
        let record = self.friend_ref(friend)?;
        Ok(match self.raw_connection_kind(record) {
            ConnectionKind::Unknown => {
                if record.last_connection_kind == ConnectionKind::Udp {
                    ConnectionKind::Udp
                } else {
                    ConnectionKind::Tcp
                }
            }
            kind => kind,
        })
    }

    // ----- messaging -------------------------------------------------------

    /// Send a chat message, fanning out to every online device. Returns the
    /// message id the eventual read receipt will carry.
    pub fn send_message(
        &mut self,
        friend: FriendNumber,
        kind: MessageKind,
        message: &[u8],
    ) -> Result<u32, SendMessageError> {
        if message.is_empty() {
            return Err(SendMessageError::Empty);
        }

        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(SendMessageError::TooLong);
        }

        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(SendMessageError::InvalidFriend)?;

        if record.status != FriendStatus::Online {
            return Err(SendMessageError::NotOnline);
        }

        let packet = Packet::Message {
            kind,
            body: message.to_vec(),
        }
        .encode();

        // Fan out to every online device; the receipt is keyed off the
        // first successful send.
        let mut receipt_key = None;

        let connections: Vec<ConnectionId> = record
            .devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Online)
            .map(|d| d.connection)
            .collect();

        for conn in connections {
            match self.transport.send_lossless(conn, &packet) {
                Ok(number) if receipt_key.is_none() => receipt_key = Some((number, conn)),
                _ => {}
            }
        }

        let (packet_number, connection) = receipt_key.ok_or(SendMessageError::SendFailed)?;

        let record = self.friends[friend as usize].as_mut().unwrap();
        record.message_id = record.message_id.wrapping_add(1);
        let message_id = record.message_id;
        record.receipts.push_back(Receipt {
            packet_number,
            message_id,
            connection,
        });

        Ok(message_id)
    }

    /// Send an opaque group-chat invite.
    pub fn send_group_invite(
        &mut self,
        friend: FriendNumber,
        data: &[u8],
    ) -> Result<(), SendPacketError> {
        self.send_misc_packet(friend, Packet::GroupInvite(data.to_vec()), data.len())
    }

    /// Send an A/V signalling blob.
    pub fn send_msi(&mut self, friend: FriendNumber, data: &[u8]) -> Result<(), SendPacketError> {
        self.send_misc_packet(friend, Packet::Msi(data.to_vec()), data.len())
    }

    fn send_misc_packet(
        &mut self,
        friend: FriendNumber,
        packet: Packet,
        len: usize,
    ) -> Result<(), SendPacketError> {
        if len == 0 {
            return Err(SendPacketError::Empty);
        }

        if len >= MAX_CRYPTO_DATA_SIZE {
            return Err(SendPacketError::TooLong);
        }

        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(SendPacketError::InvalidFriend)?;

        if record.status != FriendStatus::Online {
            return Err(SendPacketError::NotOnline);
        }

        let conn = record.primary_connection();
        self.transport
            .send_lossless(conn, &packet.encode())
            .map(|_| ())
            .map_err(|_| SendPacketError::SendFailed)
    }

    /// Send a custom lossy packet. `data[0]` must lie in the lossy ID range
    /// and outside nothing else: A/V-reserved IDs are legal here too.
    pub fn send_lossy_packet(
        &mut self,
        friend: FriendNumber,
        data: &[u8],
    ) -> Result<(), CustomPacketError> {
        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(CustomPacketError::InvalidFriend)?;

        if data.is_empty() || data.len() > MAX_CRYPTO_DATA_SIZE {
            return Err(CustomPacketError::BadLength);
        }

        if !is_custom_lossy(data[0]) {
            return Err(CustomPacketError::BadId);
        }

        if record.status != FriendStatus::Online {
            return Err(CustomPacketError::NotOnline);
        }

        let conn = record.primary_connection();
        self.transport
            .send_lossy(conn, data)
            .map_err(|_| CustomPacketError::SendFailed)
    }

    /// Send a custom lossless packet (`data[0]` in the lossless ID range).
    pub fn send_lossless_packet(
        &mut self,
        friend: FriendNumber,
        data: &[u8],
    ) -> Result<(), CustomPacketError> {
        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(CustomPacketError::InvalidFriend)?;

        if data.is_empty() || data.len() > MAX_CRYPTO_DATA_SIZE {
            return Err(CustomPacketError::BadLength);
        }

        if !is_custom_lossless(data[0]) {
            return Err(CustomPacketError::BadId);
        }

        if record.status != FriendStatus::Online {
            return Err(CustomPacketError::NotOnline);
        }

        let conn = record.primary_connection();
        self.transport
            .send_lossless(conn, data)
            .map(|_| ())
            .map_err(|_| CustomPacketError::SendFailed)
    }

    /// Route one reserved lossy ID (192..199) to [`Event::RtpPacket`] for
    /// this friend instead of dropping it.
    pub fn register_rtp_channel(
        &mut self,
        friend: FriendNumber,
        packet_id: u8,
    ) -> Result<(), CustomPacketError> {
        if !is_av_lossy(packet_id) {
            return Err(CustomPacketError::BadId);
        }

        let record = self
            .friends
            .get_mut(friend as usize)
            .and_then(Option::as_mut)
            .ok_or(CustomPacketError::InvalidFriend)?;
        record.rtp_channels[(packet_id - PACKET_ID_LOSSY_RANGE_START) as usize] = true;
        Ok(())
    }

    pub fn unregister_rtp_channel(
        &mut self,
        friend: FriendNumber,
        packet_id: u8,
    ) -> Result<(), CustomPacketError> {
        if !is_av_lossy(packet_id) {
            return Err(CustomPacketError::BadId);
        }

        let record = self
            .friends
            .get_mut(friend as usize)
            .and_then(Option::as_mut)
            .ok_or(CustomPacketError::InvalidFriend)?;
        record.rtp_channels[(packet_id - PACKET_ID_LOSSY_RANGE_START) as usize] = false;
        Ok(())
    }

    // ----- file transfers --------------------------------------------------

    /// Offer a file. `file_size == u64::MAX` streams without a known length;
    /// a missing `file_id` gets a random one. Returns the API file number.
    pub fn send_file(
        &mut self,
        friend: FriendNumber,
        file_kind: u32,
        file_size: u64,
        file_id: Option<[u8; FILE_ID_LENGTH]>,
        filename: &[u8],
    ) -> Result<u32, FileSendError> {
        if filename.len() > MAX_FILENAME_LENGTH {
            return Err(FileSendError::NameTooLong);
        }

        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(FileSendError::InvalidFriend)?;

        if record.status != FriendStatus::Online {
            return Err(FileSendError::NotOnline);
        }

        let slot = record
            .file_sending
            .iter()
            .position(|ft| !ft.is_active())
            .ok_or(FileSendError::NoSlots)? as u8;

        let file_id = file_id.unwrap_or_else(|| {
            let mut id = [0u8; FILE_ID_LENGTH];
            rand::thread_rng().fill_bytes(&mut id);
            id
        });

        let packet = Packet::FileSendRequest {
            slot,
            file_kind,
            file_size,
            file_id,
            filename: filename.to_vec(),
        };

        let conn = record.primary_connection();
        self.transport
            .send_lossless(conn, &packet.encode())
            .map_err(|_| FileSendError::SendFailed)?;

        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = &mut record.file_sending[slot as usize];
        ft.status = TransferStatus::NotAccepted;
        ft.size = file_size;
        ft.transferred = 0;
        ft.requested = 0;
        ft.slots_allocated = 0;
        ft.paused = 0;
        ft.id = file_id;
        record.num_sending_files += 1;

        debug!(friend, slot, file_size, "offered file transfer");
        Ok(file_number(Direction::Sending, slot))
    }

    /// Accept, pause, resume, or kill a transfer. Seeking goes through
    /// [`Messenger::file_seek`].
    pub fn file_control(
        &mut self,
        friend: FriendNumber,
        file: u32,
        op: FileControlOp,
    ) -> Result<(), FileControlError> {
        if op == FileControlOp::Seek {
            return Err(FileControlError::BadControl);
        }

        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(FileControlError::InvalidFriend)?;

        if record.status != FriendStatus::Online {
            return Err(FileControlError::NotOnline);
        }

        let (direction, slot) =
            parse_file_number(file).ok_or(FileControlError::InvalidFileNumber)?;

        let ft = match direction {
            Direction::Sending => &record.file_sending[slot as usize],
            Direction::Receiving => &record.file_receiving[slot as usize],
        };

        if !ft.is_active() {
            return Err(FileControlError::InvalidFileNumber);
        }

        match op {
            FileControlOp::Pause => {
                if ft.paused & PAUSE_US != 0 {
                    return Err(FileControlError::AlreadyPaused);
                }
                if ft.status != TransferStatus::Transferring {
                    return Err(FileControlError::NotTransferring);
                }
            }
            FileControlOp::Accept => {
                if ft.status == TransferStatus::Transferring {
                    if ft.paused & PAUSE_US == 0 {
                        return Err(if ft.paused & PAUSE_OTHER != 0 {
                            FileControlError::PausedByOther
                        } else {
                            FileControlError::NotPaused
                        });
                    }
                } else {
                    if ft.status != TransferStatus::NotAccepted {
                        return Err(FileControlError::NotPaused);
                    }
                    // Accepting our own offer makes no sense.
                    if direction == Direction::Sending {
                        return Err(FileControlError::BadControl);
                    }
                }
            }
            FileControlOp::Kill => {}
            FileControlOp::Seek => unreachable!(),
        }

        let packet = Packet::FileControl {
            direction,
            slot,
            op,
            data: Vec::new(),
        };
        let conn = record.primary_connection();
        self.transport
            .send_lossless(conn, &packet.encode())
            .map_err(|_| FileControlError::SendFailed)?;

        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = match direction {
            Direction::Sending => &mut record.file_sending[slot as usize],
            Direction::Receiving => &mut record.file_receiving[slot as usize],
        };

        match op {
            FileControlOp::Kill => {
                ft.clear();
                if direction == Direction::Sending {
                    record.num_sending_files = record.num_sending_files.saturating_sub(1);
                }
            }
            FileControlOp::Pause => ft.paused |= PAUSE_US,
            FileControlOp::Accept => {
                if ft.status == TransferStatus::Transferring {
                    ft.paused &= !PAUSE_US;
                } else {
                    ft.status = TransferStatus::Transferring;
                }
            }
            FileControlOp::Seek => unreachable!(),
        }

        Ok(())
    }

    /// Seek a transfer we are receiving, before accepting it, to resume a
    /// broken download. The position travels big-endian.
    pub fn file_seek(
        &mut self,
        friend: FriendNumber,
        file: u32,
        position: u64,
    ) -> Result<(), FileSeekError> {
        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(FileSeekError::InvalidFriend)?;

        if record.status != FriendStatus::Online {
            return Err(FileSeekError::NotOnline);
        }

        let (direction, slot) = parse_file_number(file).ok_or(FileSeekError::InvalidFileNumber)?;

        if direction != Direction::Receiving {
            return Err(FileSeekError::NotReceiving);
        }

        let ft = &record.file_receiving[slot as usize];

        if !ft.is_active() {
            return Err(FileSeekError::InvalidFileNumber);
        }

        if ft.status != TransferStatus::NotAccepted {
            return Err(FileSeekError::BadState);
        }

        if position >= ft.size {
            return Err(FileSeekError::BadPosition);
        }

        let packet = Packet::FileControl {
            direction,
            slot,
            op: FileControlOp::Seek,
            data: position.to_be_bytes().to_vec(),
        };
        let conn = record.primary_connection();
        self.transport
            .send_lossless(conn, &packet.encode())
            .map_err(|_| FileSeekError::SendFailed)?;

        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = &mut record.file_receiving[slot as usize];
        ft.transferred = position;
        ft.requested = position;
        Ok(())
    }

    /// Answer a chunk request: send `data` at `position`. Only the final
    /// chunk of a sized file may be short; an empty chunk finishes a
    /// zero-length file.
    pub fn file_data(
        &mut self,
        friend: FriendNumber,
        file: u32,
        position: u64,
        data: &[u8],
    ) -> Result<(), FileDataError> {
        if file >= MAX_CONCURRENT_FILE_PIPES as u32 {
            return Err(FileDataError::InvalidFileNumber);
        }
        let slot = file as u8;

        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(FileDataError::InvalidFriend)?;

        if record.status != FriendStatus::Online {
            return Err(FileDataError::NotOnline);
        }

        let ft = &record.file_sending[slot as usize];

        if ft.status != TransferStatus::Transferring {
            return Err(FileDataError::NotTransferring);
        }

        if data.len() > MAX_FILE_DATA_SIZE || (ft.size - ft.transferred) < data.len() as u64 {
            return Err(FileDataError::BadLength);
        }

        // A sized file allows one short chunk: the last.
        if ft.size != STREAMING_FILE_SIZE
            && data.len() != MAX_FILE_DATA_SIZE
            && ft.transferred + data.len() as u64 != ft.size
        {
            return Err(FileDataError::BadLength);
        }

        if position != ft.transferred || (ft.requested <= position && ft.size != 0) {
            return Err(FileDataError::BadPosition);
        }

        let conn = record.primary_connection();

        // Keep a floor of queue slots for messages and control traffic.
        if self.transport.free_send_slots(conn) < MIN_SLOTS_FREE {
            return Err(FileDataError::SendQueueFull);
        }

        let packet = Packet::FileData {
            slot,
            chunk: data.to_vec(),
        };
        let packet_number = self
            .transport
            .send_lossless(conn, &packet.encode())
            .map_err(|_| FileDataError::SendQueueFull)?;

        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = &mut record.file_sending[slot as usize];
        ft.transferred += data.len() as u64;
        ft.slots_allocated = ft.slots_allocated.saturating_sub(1);

        if data.len() != MAX_FILE_DATA_SIZE || ft.size == ft.transferred {
            ft.status = TransferStatus::Finished;
            ft.last_packet_number = packet_number;
        }

        Ok(())
    }

    /// Stable 32-byte id of a transfer, usable to resume across reconnects.
    pub fn file_id(
        &self,
        friend: FriendNumber,
        file: u32,
    ) -> Result<[u8; FILE_ID_LENGTH], FileQueryError> {
        let ft = self.file_ref(friend, file)?;
        Ok(ft.id)
    }

    /// Bytes not yet sent (outgoing) or received (incoming).
    pub fn file_data_remaining(
        &self,
        friend: FriendNumber,
        file: u32,
    ) -> Result<u64, FileQueryError> {
        let ft = self.file_ref(friend, file)?;
        Ok(ft.size.saturating_sub(ft.transferred))
    }

    fn file_ref(&self, friend: FriendNumber, file: u32) -> Result<&FileTransfer, FileQueryError> {
        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(FileQueryError::InvalidFriend)?;

        let (direction, slot) =
            parse_file_number(file).ok_or(FileQueryError::InvalidFileNumber)?;

        let ft = match direction {
            Direction::Sending => &record.file_sending[slot as usize],
            Direction::Receiving => &record.file_receiving[slot as usize],
        };

        if !ft.is_active() {
            return Err(FileQueryError::InvalidFileNumber);
        }

        Ok(ft)
    }

    // ----- inbound entry points --------------------------------------------

    /// Inbound friend request from the request-routing subsystem. Duplicate
    /// keys (already friends, or already surfaced) are dropped.
    pub fn handle_friend_request(&mut self, public_key: PublicKey, message: &[u8]) {
        if message.is_empty() || message.len() > MAX_FRIEND_REQUEST_LENGTH {
            trace!("dropping friend request with bad payload length");
            return;
        }

        if !public_key.is_valid() || public_key == self.transport.self_public_key() {
            return;
        }

        if self.friend_by_public_key(&public_key).is_some()
            || self.seen_requests.contains(&public_key)
        {
            trace!("dropping duplicate friend request");
            return;
        }

        self.seen_requests.push(public_key);
        self.events.push_back(Event::FriendRequest {
            public_key,
            message: message.to_vec(),
        });
    }

    /// Connection edge reported by the transport for one of our handles.
    pub fn handle_connection_status(&mut self, conn: ConnectionId, connected: bool) {
        let Some(&(friend, device)) = self.conn_map.get(&conn) else {
            return;
        };

        if connected {
            // Announce ourselves; the peer's Online packet completes the
            // presence handshake.
            self.send_online_packet(friend, device);
        } else {
            let is_online = self.friends[friend as usize]
                .as_ref()
                .is_some_and(|f| f.devices[device].status == DeviceStatus::Online);

            if is_online {
                self.set_device_status(friend, device, DeviceStatus::Confirmed);
            }
        }
    }

    /// One reliable packet from the transport. Malformed packets are dropped
    /// without disconnecting.
    pub fn handle_packet(&mut self, conn: ConnectionId, data: &[u8]) {
        let Some(&(friend, device)) = self.conn_map.get(&conn) else {
            return;
        };

        let Some(&packet_id) = data.first() else {
            return;
        };

        let record = self.friends[friend as usize].as_ref().unwrap();

        if record.status != FriendStatus::Online {
            // Only the presence handshake gets through before Online.
            if data.len() == 1 && packet_id == crate::protocol::PACKET_ID_ONLINE {
                self.set_device_status(friend, device, DeviceStatus::Online);
                self.send_online_packet(friend, device);
            } else {
                trace!(friend, packet_id, "dropping packet from non-online friend");
            }
            return;
        }

        if is_custom_lossless(packet_id) {
            self.events.push_back(Event::LosslessPacket {
                friend,
                data: data.to_vec(),
            });
            return;
        }

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.drop_packet(friend, packet_id, err);
                return;
            }
        };

        match packet {
            Packet::Online => {
                let already = self.friends[friend as usize].as_ref().unwrap().devices[device]
                    .status
                    == DeviceStatus::Online;
                if !already {
                    self.set_device_status(friend, device, DeviceStatus::Online);
                    self.send_online_packet(friend, device);
                }
            }
            Packet::Offline => {
                self.set_device_status(friend, device, DeviceStatus::Confirmed);
            }
            Packet::Nickname(name) => {
                self.events.push_back(Event::NameChange {
                    friend,
                    name: name.clone(),
                });
                self.friends[friend as usize].as_mut().unwrap().name = name;
            }
            Packet::StatusMessage(message) => {
                self.events.push_back(Event::StatusMessageChange {
                    friend,
                    message: message.clone(),
                });
                self.friends[friend as usize].as_mut().unwrap().status_message = message;
            }
            Packet::UserStatus(status) => {
                self.events.push_back(Event::UserStatusChange { friend, status });
                self.friends[friend as usize].as_mut().unwrap().user_status = status;
            }
            Packet::Typing(typing) => {
                self.friends[friend as usize].as_mut().unwrap().typing = typing;
                self.events.push_back(Event::TypingChange { friend, typing });
            }
            Packet::Message { kind, body } => {
                self.events.push_back(Event::Message {
                    friend,
                    kind,
                    message: body,
                });
            }
            Packet::GroupInvite(data) => {
                self.events.push_back(Event::GroupInvite { friend, data });
            }
            Packet::FileSendRequest {
                slot,
                file_kind,
                file_size,
                file_id,
                filename,
            } => {
                self.handle_file_send_request(friend, slot, file_kind, file_size, file_id, filename);
            }
            Packet::FileControl {
                direction,
                slot,
                op,
                data,
            } => {
                self.handle_file_control(friend, direction, slot, op, &data);
            }
            Packet::FileData { slot, chunk } => {
                self.handle_file_data(friend, slot, chunk);
            }
            Packet::Msi(data) => {
                self.events.push_back(Event::MsiPacket { friend, data });
            }
        }
    }

    /// One unreliable packet. Reserved A/V IDs reach [`Event::RtpPacket`]
    /// only for registered channels; the rest of the lossy range is passed
    /// through as [`Event::LossyPacket`].
    pub fn handle_lossy_packet(&mut self, conn: ConnectionId, data: &[u8]) {
        let Some(&(friend, _)) = self.conn_map.get(&conn) else {
            return;
        };

        let Some(&packet_id) = data.first() else {
            return;
        };

        if is_av_lossy(packet_id) {
            let registered = self.friends[friend as usize]
                .as_ref()
                .is_some_and(|f| f.rtp_channels[(packet_id - PACKET_ID_LOSSY_RANGE_START) as usize]);

            if registered {
                self.events.push_back(Event::RtpPacket {
                    friend,
                    data: data.to_vec(),
                });
            }
            return;
        }

        if is_custom_lossy(packet_id) {
            self.events.push_back(Event::LossyPacket {
                friend,
                data: data.to_vec(),
            });
        }
    }

    // ----- tick ------------------------------------------------------------

    /// One pass of the lifecycle driver. `now` is unix time in seconds; the
    /// host calls this at least every [`Messenger::run_interval`] ms.
    pub fn tick(&mut self, now: u64) {
        if !self.relays_replayed {
            self.relays_replayed = true;
            let relays = std::mem::take(&mut self.loaded_relays);
            for relay in &relays {
                self.transport.add_tcp_relay(relay);
            }
        }

        for number in 0..self.friends.len() as FriendNumber {
            let Some(record) = self.friends[number as usize].as_ref() else {
                continue;
            };

            match record.status {
                FriendStatus::Added => self.send_friend_request(number, now),
                FriendStatus::Requested => self.check_request_timeout(number, now),
                FriendStatus::Confirmed => {}
                FriendStatus::Online => {
                    self.resync_presence(number);
                    self.check_friend_tcp_udp(number);
                    self.do_receipts(number);
                    self.do_file_chunk_requests(number);
                    self.friends[number as usize].as_mut().unwrap().last_seen = now;
                }
            }
        }

        let status = self.transport.network_status();
        if status != self.last_network_status {
            self.last_network_status = status;
            self.events.push_back(Event::NetworkStatusChange { status });
        }
    }

    fn send_friend_request(&mut self, friend: FriendNumber, now: u64) {
        let record = self.friends[friend as usize].as_ref().unwrap();
        let conn = record.primary_connection();
        let nospam = record.request_nospam;
        let payload = record.request_payload.clone();

        if self
            .transport
            .send_friend_request(conn, nospam, &payload)
            .is_ok()
        {
            self.set_friend_status(friend, FriendStatus::Requested);
            self.friends[friend as usize].as_mut().unwrap().request_last_sent = now;
            debug!(friend, "friend request sent");
        }
    }

    fn check_request_timeout(&mut self, friend: FriendNumber, now: u64) {
        let record = self.friends[friend as usize].as_ref().unwrap();

        if record.request_last_sent + record.request_timeout < now {
            // Assume the request was lost; retry with a doubled timeout.
            self.set_friend_status(friend, FriendStatus::Added);
            let record = self.friends[friend as usize].as_mut().unwrap();
            record.request_timeout *= 2;
            debug!(
                friend,
                timeout = record.request_timeout,
                "friend request timed out"
            );
        }
    }

    fn resync_presence(&mut self, friend: FriendNumber) {
        let record = self.friends[friend as usize].as_ref().unwrap();
        let (name_sent, status_sent, user_sent, typing_sent, typing) = (
            record.name_sent,
            record.status_message_sent,
            record.user_status_sent,
            record.typing_sent,
            record.we_are_typing,
        );

        if !name_sent {
            let packet = Packet::Nickname(self.name.clone());
            if self.write_packet(friend, &packet) {
                self.friends[friend as usize].as_mut().unwrap().name_sent = true;
            }
        }

        if !status_sent {
            let packet = Packet::StatusMessage(self.status_message.clone());
            if self.write_packet(friend, &packet) {
                self.friends[friend as usize]
                    .as_mut()
                    .unwrap()
                    .status_message_sent = true;
            }
        }

        if !user_sent {
            let packet = Packet::UserStatus(self.user_status);
            if self.write_packet(friend, &packet) {
                self.friends[friend as usize].as_mut().unwrap().user_status_sent = true;
            }
        }

        if !typing_sent {
            let packet = Packet::Typing(typing);
            if self.write_packet(friend, &packet) {
                self.friends[friend as usize].as_mut().unwrap().typing_sent = true;
            }
        }
    }

    fn do_receipts(&mut self, friend: FriendNumber) {
        let record = self.friends[friend as usize].as_mut().unwrap();

        while let Some(receipt) = record.receipts.front().copied() {
            if !self
                .transport
                .is_packet_delivered(receipt.connection, receipt.packet_number)
            {
                break;
            }

            record.receipts.pop_front();
            self.events.push_back(Event::ReadReceipt {
                friend,
                message_id: receipt.message_id,
            });
        }
    }

    /// Ask the application for file chunks, within the transport's spare
    /// send-queue budget, and finalize transfers whose last chunk got ACKed.
    fn do_file_chunk_requests(&mut self, friend: FriendNumber) {
        let record = self.friends[friend as usize].as_ref().unwrap();

        if record.num_sending_files == 0 {
            return;
        }

        let conn = record.primary_connection();
        let mut free_slots = self.transport.free_send_slots(conn);

        if free_slots < MIN_SLOTS_FREE {
            free_slots = 0;
        } else {
            free_slots -= MIN_SLOTS_FREE;
        }

        let mut remaining = record.num_sending_files;

        for slot in 0..MAX_CONCURRENT_FILE_PIPES {
            {
                let record = self.friends[friend as usize].as_mut().unwrap();
                let ft = &mut record.file_sending[slot];

                if ft.is_active() {
                    remaining -= 1;

                    if ft.status == TransferStatus::Finished
                        && self
                            .transport
                            .is_packet_delivered(conn, ft.last_packet_number)
                    {
                        // Peer holds the whole file; tell the application
                        // the slot is done and free it.
                        let position = ft.transferred;
                        ft.clear();
                        record.num_sending_files = record.num_sending_files.saturating_sub(1);
                        self.events.push_back(Event::FileChunkRequest {
                            friend,
                            file_number: file_number(Direction::Sending, slot as u8),
                            position,
                            length: 0,
                        });
                    }

                    let ft = &record.file_sending[slot];
                    if ft.slots_allocated > free_slots {
                        free_slots = 0;
                    } else {
                        free_slots -= ft.slots_allocated;
                    }
                } else {
                    if remaining == 0 {
                        break;
                    }
                    continue;
                }
            }

            loop {
                let record = self.friends[friend as usize].as_ref().unwrap();
                let ft = &record.file_sending[slot];

                if ft.status != TransferStatus::Transferring || ft.is_paused() {
                    break;
                }

                if self.transport.max_speed_reached(conn) {
                    free_slots = 0;
                }

                if free_slots == 0 {
                    break;
                }

                if ft.size == 0 {
                    // Zero-length file: one empty chunk closes it out.
                    let _ = self.file_data(friend, slot as u32, 0, &[]);
                    break;
                }

                if ft.size == ft.requested {
                    break;
                }

                let length = (ft.size - ft.requested).min(MAX_FILE_DATA_SIZE as u64) as usize;
                let position = ft.requested;

                let record = self.friends[friend as usize].as_mut().unwrap();
                let ft = &mut record.file_sending[slot];
                ft.slots_allocated += 1;
                ft.requested += length as u64;

                self.events.push_back(Event::FileChunkRequest {
                    friend,
                    file_number: file_number(Direction::Sending, slot as u8),
                    position,
                    length,
                });

                free_slots -= 1;
            }

            if remaining == 0 {
                break;
            }
        }
    }

    // ----- internals -------------------------------------------------------

    fn friend_ref(&self, friend: FriendNumber) -> Result<&Friend, InvalidFriend> {
        self.friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(InvalidFriend(friend))
    }

    fn friend_mut(&mut self, friend: FriendNumber) -> Result<&mut Friend, InvalidFriend> {
        self.friends
            .get_mut(friend as usize)
            .and_then(Option::as_mut)
            .ok_or(InvalidFriend(friend))
    }

    fn init_friend(
        &mut self,
        public_key: &PublicKey,
        status: FriendStatus,
    ) -> Result<FriendNumber, AddFriendError> {
        let conn = self
            .transport
            .open(public_key)
            .map_err(|_| AddFriendError::NoConnection)?;

        let device = Device {
            public_key: *public_key,
            connection: conn,
            status: DeviceStatus::Confirmed,
        };

        let number = match self.friends.iter().position(|f| f.is_none()) {
            Some(slot) => {
                self.friends[slot] = Some(Friend::new(status, device));
                slot as FriendNumber
            }
            None => {
                self.friends.push(Some(Friend::new(status, device)));
                (self.friends.len() - 1) as FriendNumber
            }
        };

        self.conn_map.insert(conn, (number, 0));

        if self.transport.is_connected(conn) {
            self.send_online_packet(number, 0);
        }

        debug!(friend = number, ?status, "created roster entry");
        Ok(number)
    }

    fn init_device(
        &mut self,
        friend: FriendNumber,
        public_key: &PublicKey,
        status: DeviceStatus,
    ) -> Result<usize, AddFriendError> {
        let record = self
            .friends
            .get(friend as usize)
            .and_then(Option::as_ref)
            .ok_or(AddFriendError::InvalidFriend)?;

        if record.status < FriendStatus::Confirmed {
            return Err(AddFriendError::InvalidFriend);
        }

        let conn = self
            .transport
            .open(public_key)
            .map_err(|_| AddFriendError::NoConnection)?;

        let record = self.friends[friend as usize].as_mut().unwrap();
        record.devices.push(Device {
            public_key: *public_key,
            connection: conn,
            status,
        });
        let device = record.devices.len() - 1;

        self.conn_map.insert(conn, (friend, device));

        if self.transport.is_connected(conn) {
            self.send_online_packet(friend, device);
        }

        debug!(friend, device, "added device");
        Ok(device)
    }

    fn send_online_packet(&mut self, friend: FriendNumber, device: usize) -> bool {
        let Some(record) = self.friends.get(friend as usize).and_then(Option::as_ref) else {
            return false;
        };
        let conn = record.devices[device].connection;
        self.transport
            .send_lossless(conn, &Packet::Online.encode())
            .is_ok()
    }

    /// Write one id-framed packet on the friend's primary device, the way
    /// every non-message sub-protocol does.
    fn write_packet(&mut self, friend: FriendNumber, packet: &Packet) -> bool {
        let Some(record) = self.friends.get(friend as usize).and_then(Option::as_ref) else {
            return false;
        };

        if record.status != FriendStatus::Online {
            return false;
        }

        let conn = record.primary_connection();
        self.transport.send_lossless(conn, &packet.encode()).is_ok()
    }

    fn set_friend_status(&mut self, friend: FriendNumber, status: FriendStatus) {
        let Some(record) = self.friends.get_mut(friend as usize).and_then(Option::as_mut) else {
            return;
        };

        let was_online = record.status == FriendStatus::Online;
        let is_online = status == FriendStatus::Online;
        record.status = status;

        if matches!(status, FriendStatus::Added | FriendStatus::Requested) {
            record.devices[0].status = DeviceStatus::Pending;
        }

        if was_online != is_online {
            if was_online {
                record.break_files();
                record.clear_receipts();
                debug!(friend, "friend went offline");
            } else {
                record.name_sent = false;
                record.status_message_sent = false;
                record.user_status_sent = false;
                record.typing_sent = false;
                debug!(friend, "friend came online");
            }

            self.events.push_back(Event::FriendOnline {
                friend,
                online: is_online,
            });
        }

        self.check_friend_tcp_udp(friend);
    }

    /// Change one device's status and recompute the friend-level status: a
    /// friend is online exactly while at least one device is.
    fn set_device_status(&mut self, friend: FriendNumber, device: usize, status: DeviceStatus) {
        let Some(record) = self.friends.get_mut(friend as usize).and_then(Option::as_mut) else {
            return;
        };

        record.devices[device].status = status;
        let any_online = record.any_device_online();
        let friend_status = record.status;

        if any_online && friend_status != FriendStatus::Online {
            self.set_friend_status(friend, FriendStatus::Online);
        } else if !any_online && friend_status == FriendStatus::Online {
            self.set_friend_status(friend, FriendStatus::Confirmed);
        }
    }

    fn raw_connection_kind(&self, record: &Friend) -> ConnectionKind {
        if record.status != FriendStatus::Online {
            return ConnectionKind::None;
        }

        let device = record
            .devices
            .iter()
            .find(|d| d.status == DeviceStatus::Online)
            .unwrap_or(&record.devices[0]);

        match self.transport.link_kind(device.connection) {
            LinkKind::Udp => ConnectionKind::Udp,
            LinkKind::Tcp => ConnectionKind::Tcp,
            LinkKind::Unknown => ConnectionKind::Unknown,
        }
    }

    /// Report link-kind edges, absorbing the Udp -> Unknown -> Tcp flap the
    /// transport produces while a direct path times out.
    fn check_friend_tcp_udp(&mut self, friend: FriendNumber) {
        let Some(record) = self.friends.get(friend as usize).and_then(Option::as_ref) else {
            return;
        };

        let last = record.last_connection_kind;
        let kind = match self.raw_connection_kind(record) {
            ConnectionKind::Unknown => {
                if last == ConnectionKind::Udp {
                    return;
                }
                ConnectionKind::Tcp
            }
            kind => kind,
        };

        if kind != last {
            self.events
                .push_back(Event::ConnectionKindChange { friend, kind });
        }

        self.friends[friend as usize]
            .as_mut()
            .unwrap()
            .last_connection_kind = kind;
    }

    fn drop_packet(&self, friend: FriendNumber, packet_id: u8, err: PacketError) {
        trace!(friend, packet_id, %err, "dropping malformed packet");
    }

    fn handle_file_send_request(
        &mut self,
        friend: FriendNumber,
        slot: u8,
        file_kind: u32,
        file_size: u64,
        file_id: [u8; FILE_ID_LENGTH],
        filename: Vec<u8>,
    ) {
        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = &mut record.file_receiving[slot as usize];

        if ft.is_active() {
            trace!(friend, slot, "dropping file offer for a busy slot");
            return;
        }

        ft.status = TransferStatus::NotAccepted;
        ft.size = file_size;
        ft.transferred = 0;
        ft.requested = 0;
        ft.paused = 0;
        ft.id = file_id;

        self.events.push_back(Event::FileSendRequest {
            friend,
            file_number: file_number(Direction::Receiving, slot),
            file_kind,
            file_size,
            filename,
        });
    }

    fn handle_file_control(
        &mut self,
        friend: FriendNumber,
        direction: Direction,
        slot: u8,
        op: FileControlOp,
        data: &[u8],
    ) {
        // `direction` is the peer's role; our slot sits on the flipped side.
        let our_direction = direction.flipped();
        let api_file_number = file_number(our_direction, slot);

        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = match our_direction {
            Direction::Sending => &mut record.file_sending[slot as usize],
            Direction::Receiving => &mut record.file_receiving[slot as usize],
        };

        if !ft.is_active() {
            // Dead slot: tell the other side to kill it too.
            let packet = Packet::FileControl {
                direction: our_direction,
                slot,
                op: FileControlOp::Kill,
                data: Vec::new(),
            };
            let conn = record.primary_connection();
            let _ = self.transport.send_lossless(conn, &packet.encode());
            return;
        }

        match op {
            FileControlOp::Accept => {
                if our_direction == Direction::Sending
                    && ft.status == TransferStatus::NotAccepted
                {
                    ft.status = TransferStatus::Transferring;
                } else if ft.paused & PAUSE_OTHER != 0 {
                    ft.paused &= !PAUSE_OTHER;
                } else {
                    trace!(friend, slot, "dropping accept for a non-resumable slot");
                    return;
                }

                self.events.push_back(Event::FileControl {
                    friend,
                    file_number: api_file_number,
                    op,
                });
            }
            FileControlOp::Pause => {
                if ft.paused & PAUSE_OTHER != 0 || ft.status != TransferStatus::Transferring {
                    trace!(friend, slot, "dropping pause for a non-pausable slot");
                    return;
                }

                ft.paused |= PAUSE_OTHER;
                self.events.push_back(Event::FileControl {
                    friend,
                    file_number: api_file_number,
                    op,
                });
            }
            FileControlOp::Kill => {
                ft.clear();
                if our_direction == Direction::Sending {
                    record.num_sending_files = record.num_sending_files.saturating_sub(1);
                }

                self.events.push_back(Event::FileControl {
                    friend,
                    file_number: api_file_number,
                    op,
                });
            }
            FileControlOp::Seek => {
                // Only a receiver may seek, and only before accepting.
                if ft.status != TransferStatus::NotAccepted
                    || our_direction != Direction::Sending
                {
                    trace!(friend, slot, "dropping seek in the wrong state");
                    return;
                }

                let Ok(bytes) = <[u8; 8]>::try_from(data) else {
                    trace!(friend, slot, "dropping seek with a bad position field");
                    return;
                };
                let position = u64::from_be_bytes(bytes);

                if position >= ft.size {
                    trace!(friend, slot, position, "dropping seek past the file end");
                    return;
                }

                ft.transferred = position;
                ft.requested = position;
            }
        }
    }

    fn handle_file_data(&mut self, friend: FriendNumber, slot: u8, mut chunk: Vec<u8>) {
        let record = self.friends[friend as usize].as_mut().unwrap();
        let ft = &mut record.file_receiving[slot as usize];

        if ft.status != TransferStatus::Transferring {
            trace!(friend, slot, "dropping file data outside a transfer");
            return;
        }

        let api_file_number = file_number(Direction::Receiving, slot);
        let position = ft.transferred;

        // Never hand the application more than the advertised size.
        if ft.transferred + chunk.len() as u64 > ft.size {
            chunk.truncate((ft.size - ft.transferred) as usize);
        }

        let chunk_len = chunk.len();
        ft.transferred += chunk_len as u64;

        let finished =
            chunk_len != 0 && (ft.transferred >= ft.size || chunk_len != MAX_FILE_DATA_SIZE);
        let terminal_position = ft.transferred;

        if chunk_len == 0 || finished {
            ft.clear();
        }

        self.events.push_back(Event::FileData {
            friend,
            file_number: api_file_number,
            position,
            data: chunk,
        });

        if finished {
            self.events.push_back(Event::FileData {
                friend,
                file_number: api_file_number,
                position: terminal_position,
                data: Vec::new(),
            });
        }
    }
}

/// The friend number does not name a live roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no friend with number {0}")]
pub struct InvalidFriend(pub FriendNumber);

/// Outcome of `add_friend` and the device variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddFriendError {
    #[error("request payload too long")]
    TooLong,
    #[error("request payload empty")]
    NoMessage,
    #[error("cannot add our own key")]
    OwnKey,
    #[error("malformed address or key")]
    BadChecksum,
    #[error("already added")]
    AlreadySent,
    /// Semi-success: the key was known with a different nospam, which was
    /// updated in place.
    #[error("nospam updated for an already-queued request")]
    SetNewNospam,
    #[error("transport refused a connection")]
    NoConnection,
    #[error("no such friend")]
    InvalidFriend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SetInfoError {
    #[error("field too long")]
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendMessageError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("message empty")]
    Empty,
    #[error("message too long")]
    TooLong,
    #[error("friend not online")]
    NotOnline,
    #[error("no device accepted the packet")]
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendPacketError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("payload empty")]
    Empty,
    #[error("payload too long")]
    TooLong,
    #[error("friend not online")]
    NotOnline,
    #[error("transport refused the packet")]
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CustomPacketError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("payload length out of range")]
    BadLength,
    #[error("packet id outside the custom range")]
    BadId,
    #[error("friend not online")]
    NotOnline,
    #[error("transport refused the packet")]
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileSendError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("filename too long")]
    NameTooLong,
    #[error("friend not online")]
    NotOnline,
    #[error("all outgoing file slots busy")]
    NoSlots,
    #[error("transport refused the offer")]
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileControlError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("friend not online")]
    NotOnline,
    #[error("file number names no live transfer")]
    InvalidFileNumber,
    #[error("operation not valid for this transfer")]
    BadControl,
    #[error("transfer is not running")]
    NotTransferring,
    #[error("already paused by us")]
    AlreadyPaused,
    #[error("paused by the other side")]
    PausedByOther,
    #[error("transfer is not paused")]
    NotPaused,
    #[error("transport refused the packet")]
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileSeekError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("friend not online")]
    NotOnline,
    #[error("file number names no live transfer")]
    InvalidFileNumber,
    #[error("only received files can be seeked")]
    NotReceiving,
    #[error("seek is only legal before accepting")]
    BadState,
    #[error("position past the end of the file")]
    BadPosition,
    #[error("transport refused the packet")]
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileDataError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("friend not online")]
    NotOnline,
    #[error("file number names no live transfer")]
    InvalidFileNumber,
    #[error("transfer is not running")]
    NotTransferring,
    #[error("chunk length not allowed here")]
    BadLength,
    #[error("chunk position does not continue the stream")]
    BadPosition,
    #[error("transport send queue too full for file data")]
    SendQueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileQueryError {
    #[error("no such friend")]
    InvalidFriend,
    #[error("file number names no live transfer")]
    InvalidFileNumber,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PACKET_ID_NICKNAME, PACKET_ID_OFFLINE, PACKET_ID_ONLINE};
    use crate::transport::MockTransport;

    fn key(seed: u8) -> PublicKey {
        let mut bytes = [seed; 32];
        bytes[31] = 0;
        PublicKey::from_bytes(bytes)
    }

    fn address(seed: u8, nospam: [u8; 4]) -> [u8; FRIEND_ADDRESS_SIZE] {
        FriendAddress::new(key(seed), Nospam(nospam)).to_bytes()
    }

    fn messenger(seed: u8) -> Messenger<MockTransport> {
        Messenger::new(MockTransport::new(key(seed)))
    }

    fn events(m: &mut Messenger<MockTransport>) -> Vec<Event> {
        std::iter::from_fn(|| m.poll_event()).collect()
    }

    fn chunk_requests(events: &[Event]) -> Vec<(u32, u64, usize)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::FileChunkRequest {
                    file_number,
                    position,
                    length,
                    ..
                } => Some((*file_number, *position, *length)),
                _ => None,
            })
            .collect()
    }

    /// Two cores wired back to back; packets are shuttled by hand.
    struct Pair {
        a: Messenger<MockTransport>,
        b: Messenger<MockTransport>,
        a_conn: ConnectionId,
        b_conn: ConnectionId,
    }

    impl Pair {
        fn online() -> Pair {
            let mut a = messenger(1);
            let mut b = messenger(2);
            assert_eq!(a.add_friend_norequest(&key(2)).unwrap(), 0);
            assert_eq!(b.add_friend_norequest(&key(1)).unwrap(), 0);

            let a_conn = a.transport().connection_to(&key(2)).unwrap();
            let b_conn = b.transport().connection_to(&key(1)).unwrap();
            a.transport_mut().set_connected(a_conn, true);
            b.transport_mut().set_connected(b_conn, true);
            a.transport_mut().set_link_kind(a_conn, Some(LinkKind::Udp));
            b.transport_mut().set_link_kind(b_conn, Some(LinkKind::Udp));
            a.handle_connection_status(a_conn, true);
            b.handle_connection_status(b_conn, true);

            let mut pair = Pair { a, b, a_conn, b_conn };
            pair.pump();
            assert_eq!(pair.a.friend_status(0).unwrap(), FriendStatus::Online);
            assert_eq!(pair.b.friend_status(0).unwrap(), FriendStatus::Online);
            events(&mut pair.a);
            events(&mut pair.b);
            pair
        }

        /// Shuttle reliable packets both ways until both queues are quiet.
        fn pump(&mut self) {
            loop {
                let from_a = self.a.transport_mut().drain_lossless(self.a_conn);
                let from_b = self.b.transport_mut().drain_lossless(self.b_conn);

                if from_a.is_empty() && from_b.is_empty() {
                    break;
                }

                for (_, packet) in from_a {
                    self.b.handle_packet(self.b_conn, &packet);
                }
                for (_, packet) in from_b {
                    self.a.handle_packet(self.a_conn, &packet);
                }
            }
        }
    }

    // ----- roster ----------------------------------------------------------

    #[test]
    fn add_friend_boundaries() {
        let mut m = messenger(1);

        assert_eq!(
            m.add_friend(&address(2, [0; 4]), b""),
            Err(AddFriendError::NoMessage)
        );
        assert_eq!(
            m.add_friend(&address(2, [0; 4]), &[b'x'; MAX_FRIEND_REQUEST_LENGTH + 1]),
            Err(AddFriendError::TooLong)
        );
        assert_eq!(
            m.add_friend(&address(1, [0; 4]), b"me again"),
            Err(AddFriendError::OwnKey)
        );

        let mut tampered = address(2, [0; 4]);
        tampered[37] ^= 0xFF;
        assert_eq!(
            m.add_friend(&tampered, b"hello"),
            Err(AddFriendError::BadChecksum)
        );

        let mut bad_key = [3u8; 32];
        bad_key[31] = 128;
        let bad_address =
            FriendAddress::new(PublicKey::from_bytes(bad_key), Nospam([0; 4])).to_bytes();
        assert_eq!(
            m.add_friend(&bad_address, b"hello"),
            Err(AddFriendError::BadChecksum)
        );

        assert_eq!(m.add_friend(&address(2, [0; 4]), b"hello"), Ok(0));
    }

    #[test]
    fn nospam_collision_updates_in_place() {
        let mut m = messenger(1);
        assert_eq!(m.add_friend(&address(2, [1, 1, 1, 1]), b"hi"), Ok(0));

        assert_eq!(
            m.add_friend(&address(2, [2, 2, 2, 2]), b"hi again"),
            Err(AddFriendError::SetNewNospam)
        );
        assert_eq!(
            m.friends[0].as_ref().unwrap().request_nospam,
            Nospam([2, 2, 2, 2])
        );

        // Same nospam again: nothing left to update.
        assert_eq!(
            m.add_friend(&address(2, [2, 2, 2, 2]), b"hi again"),
            Err(AddFriendError::AlreadySent)
        );
    }

    #[test]
    fn confirmed_friend_cannot_be_readded() {
        let mut m = messenger(1);
        m.add_friend_norequest(&key(2)).unwrap();
        assert_eq!(
            m.add_friend(&address(2, [5, 5, 5, 5]), b"hello"),
            Err(AddFriendError::AlreadySent)
        );
    }

    #[test]
    fn friend_numbers_are_reused_and_trimmed() {
        let mut m = messenger(1);
        assert_eq!(m.add_friend_norequest(&key(2)).unwrap(), 0);
        assert_eq!(m.add_friend_norequest(&key(3)).unwrap(), 1);
        assert_eq!(m.add_friend_norequest(&key(4)).unwrap(), 2);

        m.delete_friend(1).unwrap();
        assert_eq!(m.friend_list(), vec![0, 2]);
        assert_eq!(m.add_friend_norequest(&key(5)).unwrap(), 1);

        m.delete_friend(2).unwrap();
        m.delete_friend(1).unwrap();
        assert_eq!(m.friends.len(), 1);
        assert!(!m.friend_exists(1));
    }

    #[test]
    fn friend_request_retry_doubles_timeout() {
        let mut m = messenger(1);
        m.add_friend(&address(2, [7, 7, 7, 7]), b"let me in").unwrap();

        m.tick(100);
        assert_eq!(m.friend_status(0).unwrap(), FriendStatus::Requested);
        assert_eq!(m.transport().sent_requests().len(), 1);

        // Not yet timed out.
        m.tick(104);
        assert_eq!(m.friend_status(0).unwrap(), FriendStatus::Requested);

        // 100 + 5 < 106: back to Added with a doubled timeout.
        m.tick(106);
        assert_eq!(m.friend_status(0).unwrap(), FriendStatus::Added);
        assert_eq!(m.friends[0].as_ref().unwrap().request_timeout, 10);

        m.tick(107);
        assert_eq!(m.transport().sent_requests().len(), 2);
        assert_eq!(m.friend_status(0).unwrap(), FriendStatus::Requested);

        let (_, nospam, payload) = &m.transport().sent_requests()[1];
        assert_eq!(*nospam, Nospam([7, 7, 7, 7]));
        assert_eq!(payload, b"let me in");
    }

    #[test]
    fn friend_request_send_failure_stays_added() {
        let mut m = messenger(1);
        m.add_friend(&address(2, [0; 4]), b"knock").unwrap();

        m.transport_mut().set_refuse_sends(true);
        m.tick(100);
        assert_eq!(m.friend_status(0).unwrap(), FriendStatus::Added);

        m.transport_mut().set_refuse_sends(false);
        m.tick(101);
        assert_eq!(m.friend_status(0).unwrap(), FriendStatus::Requested);
    }

    #[test]
    fn inbound_friend_requests_are_deduplicated() {
        let mut m = messenger(1);

        m.handle_friend_request(key(9), b"hello");
        m.handle_friend_request(key(9), b"hello again");
        let got = events(&mut m);
        assert_eq!(
            got,
            vec![Event::FriendRequest {
                public_key: key(9),
                message: b"hello".to_vec(),
            }]
        );

        // Known friends never surface requests.
        m.add_friend_norequest(&key(10)).unwrap();
        m.handle_friend_request(key(10), b"it's me");
        assert!(events(&mut m).is_empty());

        // Deleting the friend clears the filter again.
        let number = m.friend_by_public_key(&key(10)).unwrap();
        m.delete_friend(number).unwrap();
        m.handle_friend_request(key(10), b"it's me");
        assert!(events(&mut m)
            .iter()
            .any(|e| matches!(e, Event::FriendRequest { .. })));
    }

    // ----- presence --------------------------------------------------------

    #[test]
    fn online_handshake_raises_both_sides() {
        let pair = Pair::online();
        assert!(pair.a.friends[0].as_ref().unwrap().any_device_online());
        assert!(pair.b.friends[0].as_ref().unwrap().any_device_online());
    }

    #[test]
    fn presence_is_republished_after_tick() {
        let mut pair = Pair::online();
        pair.a.set_name(b"alice").unwrap();
        pair.a.set_status_message(b"fieldwork").unwrap();
        pair.a.set_user_status(UserStatus::Busy);
        pair.a.set_typing(0, true).unwrap();

        pair.a.tick(1);
        pair.pump();

        let got = events(&mut pair.b);
        assert!(got.contains(&Event::NameChange {
            friend: 0,
            name: b"alice".to_vec(),
        }));
        assert!(got.contains(&Event::StatusMessageChange {
            friend: 0,
            message: b"fieldwork".to_vec(),
        }));
        assert!(got.contains(&Event::UserStatusChange {
            friend: 0,
            status: UserStatus::Busy,
        }));
        assert!(got.contains(&Event::TypingChange {
            friend: 0,
            typing: true,
        }));

        assert_eq!(pair.b.name_of(0).unwrap(), b"alice");
        assert_eq!(pair.b.status_message_of(0).unwrap(), b"fieldwork");
        assert_eq!(pair.b.user_status_of(0).unwrap(), UserStatus::Busy);
        assert!(pair.b.is_typing(0).unwrap());

        // Sent flags hold; the next tick sends nothing new.
        pair.a.tick(2);
        assert!(pair
            .a
            .transport_mut()
            .drain_lossless(pair.a_conn)
            .is_empty());
    }

    #[test]
    fn reconnect_clears_sent_flags() {
        let mut pair = Pair::online();
        pair.a.set_name(b"alice").unwrap();
        pair.a.tick(1);
        pair.pump();
        events(&mut pair.a);
        events(&mut pair.b);

        pair.a.handle_connection_status(pair.a_conn, false);
        assert_eq!(pair.a.friend_status(0).unwrap(), FriendStatus::Confirmed);
        let got = events(&mut pair.a);
        assert!(got.contains(&Event::FriendOnline {
            friend: 0,
            online: false,
        }));
        assert!(got.contains(&Event::ConnectionKindChange {
            friend: 0,
            kind: ConnectionKind::None,
        }));

        // Peer announces again; the name goes out again.
        pair.a.handle_packet(pair.a_conn, &[PACKET_ID_ONLINE]);
        assert_eq!(pair.a.friend_status(0).unwrap(), FriendStatus::Online);
        pair.a.tick(2);
        let packets = pair.a.transport_mut().drain_lossless(pair.a_conn);
        assert!(packets
            .iter()
            .any(|(_, p)| p.first() == Some(&PACKET_ID_NICKNAME)));
    }

    #[test]
    fn packets_before_online_are_dropped() {
        let mut pair = Pair::online();
        pair.a.handle_connection_status(pair.a_conn, false);
        events(&mut pair.a);

        let message = Packet::Message {
            kind: MessageKind::Normal,
            body: b"early".to_vec(),
        }
        .encode();
        pair.a.handle_packet(pair.a_conn, &message);
        assert!(events(&mut pair.a).is_empty());
    }

    #[test]
    fn connection_kind_flap_is_debounced() {
        let mut pair = Pair::online();
        assert_eq!(pair.a.connection_status(0).unwrap(), ConnectionKind::Udp);

        pair.a
            .transport_mut()
            .set_link_kind(pair.a_conn, Some(LinkKind::Unknown));
        pair.a.tick(5);
        assert!(!events(&mut pair.a)
            .iter()
            .any(|e| matches!(e, Event::ConnectionKindChange { .. })));
        assert_eq!(pair.a.connection_status(0).unwrap(), ConnectionKind::Udp);

        pair.a
            .transport_mut()
            .set_link_kind(pair.a_conn, Some(LinkKind::Tcp));
        pair.a.tick(6);
        assert!(events(&mut pair.a).contains(&Event::ConnectionKindChange {
            friend: 0,
            kind: ConnectionKind::Tcp,
        }));
    }

    #[test]
    fn network_status_edge_is_reported_once() {
        let mut m = messenger(1);
        m.tick(1);
        assert!(events(&mut m).is_empty());

        m.transport_mut().set_network_status(NetworkStatus::Udp);
        m.tick(2);
        assert_eq!(
            events(&mut m),
            vec![Event::NetworkStatusChange {
                status: NetworkStatus::Udp,
            }]
        );

        m.tick(3);
        assert!(events(&mut m).is_empty());

        m.transport_mut().set_network_status(NetworkStatus::None);
        m.tick(4);
        assert_eq!(
            events(&mut m),
            vec![Event::NetworkStatusChange {
                status: NetworkStatus::None,
            }]
        );
    }

    // ----- messages and receipts -------------------------------------------

    #[test]
    fn message_roundtrip_with_fifo_receipts() {
        let mut pair = Pair::online();

        let m1 = pair.a.send_message(0, MessageKind::Normal, b"one").unwrap();
        let m2 = pair.a.send_message(0, MessageKind::Normal, b"two").unwrap();
        let m3 = pair.a.send_message(0, MessageKind::Action, b"three").unwrap();
        assert_eq!((m1, m2, m3), (1, 2, 3));

        let sent = pair.a.transport_mut().drain_lossless(pair.a_conn);
        assert_eq!(sent.len(), 3);
        for (_, packet) in &sent {
            pair.b.handle_packet(pair.b_conn, packet);
        }

        let received: Vec<Event> = events(&mut pair.b)
            .into_iter()
            .filter(|e| matches!(e, Event::Message { .. }))
            .collect();
        assert_eq!(
            received,
            vec![
                Event::Message {
                    friend: 0,
                    kind: MessageKind::Normal,
                    message: b"one".to_vec(),
                },
                Event::Message {
                    friend: 0,
                    kind: MessageKind::Normal,
                    message: b"two".to_vec(),
                },
                Event::Message {
                    friend: 0,
                    kind: MessageKind::Action,
                    message: b"three".to_vec(),
                },
            ]
        );

        // ACK out of order: m2 first. Receipts drain in FIFO prefix order,
        // so nothing surfaces until m1 is in.
        pair.a.transport_mut().mark_delivered(pair.a_conn, sent[1].0);
        pair.a.tick(10);
        assert!(events(&mut pair.a).is_empty());

        pair.a.transport_mut().mark_delivered(pair.a_conn, sent[0].0);
        pair.a.tick(11);
        assert_eq!(
            events(&mut pair.a),
            vec![
                Event::ReadReceipt {
                    friend: 0,
                    message_id: m1,
                },
                Event::ReadReceipt {
                    friend: 0,
                    message_id: m2,
                },
            ]
        );

        pair.a.transport_mut().mark_delivered(pair.a_conn, sent[2].0);
        pair.a.tick(12);
        assert_eq!(
            events(&mut pair.a),
            vec![Event::ReadReceipt {
                friend: 0,
                message_id: m3,
            }]
        );
    }

    #[test]
    fn send_message_validations() {
        let mut pair = Pair::online();

        assert_eq!(
            pair.a.send_message(9, MessageKind::Normal, b"x"),
            Err(SendMessageError::InvalidFriend)
        );
        assert_eq!(
            pair.a.send_message(0, MessageKind::Normal, b""),
            Err(SendMessageError::Empty)
        );
        assert_eq!(
            pair.a
                .send_message(0, MessageKind::Normal, &[b'x'; MAX_MESSAGE_LENGTH + 1]),
            Err(SendMessageError::TooLong)
        );

        pair.a.transport_mut().set_refuse_sends(true);
        assert_eq!(
            pair.a.send_message(0, MessageKind::Normal, b"x"),
            Err(SendMessageError::SendFailed)
        );
        pair.a.transport_mut().set_refuse_sends(false);

        pair.a.handle_connection_status(pair.a_conn, false);
        assert_eq!(
            pair.a.send_message(0, MessageKind::Normal, b"x"),
            Err(SendMessageError::NotOnline)
        );
    }

    #[test]
    fn messages_fan_out_to_all_online_devices() {
        let mut m = messenger(1);
        m.add_friend_norequest(&key(2)).unwrap();
        m.add_device_confirmed(&key(3), 0).unwrap();

        let first = m.transport().connection_to(&key(2)).unwrap();
        let second = m.transport().connection_to(&key(3)).unwrap();
        for conn in [first, second] {
            m.transport_mut().set_connected(conn, true);
            m.handle_connection_status(conn, true);
            m.handle_packet(conn, &[PACKET_ID_ONLINE]);
        }
        m.transport_mut().drain_lossless(first);
        m.transport_mut().drain_lossless(second);

        m.send_message(0, MessageKind::Normal, b"everyone").unwrap();
        assert_eq!(m.transport_mut().drain_lossless(first).len(), 1);
        assert_eq!(m.transport_mut().drain_lossless(second).len(), 1);

        // The receipt is keyed off the first successful send.
        assert_eq!(
            m.friends[0].as_ref().unwrap().receipts.front().unwrap().connection,
            first
        );
    }

    #[test]
    fn delete_friend_sends_offline_and_releases_connections() {
        let mut pair = Pair::online();
        pair.a.delete_friend(0).unwrap();

        let packets = pair.a.transport_mut().drain_lossless(pair.a_conn);
        assert!(packets
            .iter()
            .any(|(_, p)| p.first() == Some(&PACKET_ID_OFFLINE)));
        assert!(pair.a.transport().is_closed(pair.a_conn));
        assert!(!pair.a.friend_exists(0));

        // Nothing fires for the dead index anymore.
        let message = Packet::Message {
            kind: MessageKind::Normal,
            body: b"ghost".to_vec(),
        }
        .encode();
        events(&mut pair.a);
        pair.a.handle_packet(pair.a_conn, &message);
        pair.a.tick(50);
        assert!(!events(&mut pair.a)
            .iter()
            .any(|e| matches!(e, Event::Message { .. })));
    }

    // ----- file transfers --------------------------------------------------

    fn accepted_transfer(pair: &mut Pair, size: u64) -> u32 {
        let file = pair
            .a
            .send_file(0, 0, size, Some([7; 32]), b"payload.bin")
            .unwrap();
        pair.pump();

        let offer = events(&mut pair.b)
            .into_iter()
            .find_map(|e| match e {
                Event::FileSendRequest { file_number, .. } => Some(file_number),
                _ => None,
            })
            .unwrap();
        pair.b.file_control(0, offer, FileControlOp::Accept).unwrap();
        pair.pump();
        events(&mut pair.a);
        file
    }

    #[test]
    fn file_transfer_end_to_end() {
        let mut pair = Pair::online();
        let source: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();

        let file = pair
            .a
            .send_file(0, 42, source.len() as u64, None, b"data.bin")
            .unwrap();
        assert_eq!(file, 0);
        pair.pump();

        let got = events(&mut pair.b);
        let (offer_number, offer_size) = got
            .iter()
            .find_map(|e| match e {
                Event::FileSendRequest {
                    file_number,
                    file_size,
                    file_kind: 42,
                    ..
                } => Some((*file_number, *file_size)),
                _ => None,
            })
            .unwrap();
        assert_eq!(offer_number, 1 << 16);
        assert_eq!(offer_size, source.len() as u64);

        pair.b.file_control(0, offer_number, FileControlOp::Accept).unwrap();
        pair.pump();
        assert!(events(&mut pair.a).contains(&Event::FileControl {
            friend: 0,
            file_number: file,
            op: FileControlOp::Accept,
        }));

        pair.a.tick(10);
        let requests = chunk_requests(&events(&mut pair.a));
        assert_eq!(
            requests,
            vec![(file, 0, 1015), (file, 1015, 1015), (file, 2030, 970)]
        );

        for (_, position, length) in requests {
            let chunk = &source[position as usize..position as usize + length];
            pair.a.file_data(0, file, position, chunk).unwrap();
        }
        pair.pump();

        let mut received = Vec::new();
        let mut terminals = 0;
        for event in events(&mut pair.b) {
            if let Event::FileData { position, data, .. } = event {
                if data.is_empty() {
                    terminals += 1;
                    assert_eq!(position, source.len() as u64);
                } else {
                    assert_eq!(position as usize, received.len());
                    received.extend_from_slice(&data);
                }
            }
        }
        assert_eq!(received, source);
        assert_eq!(terminals, 1);
        assert!(!pair.b.friends[0].as_ref().unwrap().file_receiving[0].is_active());

        // The sender finishes once the last chunk is acknowledged.
        pair.a.transport_mut().deliver_all(pair.a_conn);
        pair.a.tick(11);
        assert_eq!(
            chunk_requests(&events(&mut pair.a)),
            vec![(file, source.len() as u64, 0)]
        );
        assert_eq!(pair.a.friends[0].as_ref().unwrap().num_sending_files, 0);
        assert_eq!(
            pair.a.file_data_remaining(0, file),
            Err(FileQueryError::InvalidFileNumber)
        );
    }

    #[test]
    fn zero_length_file_fires_one_terminal_each_side() {
        let mut pair = Pair::online();
        let file = accepted_transfer(&mut pair, 0);

        pair.a.tick(10);
        // The zero-length path sends the empty chunk itself.
        assert!(chunk_requests(&events(&mut pair.a)).is_empty());
        pair.pump();

        let data_events: Vec<Event> = events(&mut pair.b)
            .into_iter()
            .filter(|e| matches!(e, Event::FileData { .. }))
            .collect();
        assert_eq!(
            data_events,
            vec![Event::FileData {
                friend: 0,
                file_number: 1 << 16,
                position: 0,
                data: Vec::new(),
            }]
        );
        assert!(!pair.b.friends[0].as_ref().unwrap().file_receiving[0].is_active());

        pair.a.transport_mut().deliver_all(pair.a_conn);
        pair.a.tick(11);
        assert_eq!(chunk_requests(&events(&mut pair.a)), vec![(file, 0, 0)]);
        assert_eq!(pair.a.friends[0].as_ref().unwrap().num_sending_files, 0);
    }

    #[test]
    fn seek_before_accept_moves_the_stream_start() {
        let mut pair = Pair::online();
        let size = 10 * 1024 * 1024u64;
        let file = pair.a.send_file(0, 0, size, Some([9; 32]), b"big").unwrap();
        pair.pump();

        let offer = events(&mut pair.b)
            .into_iter()
            .find_map(|e| match e {
                Event::FileSendRequest { file_number, .. } => Some(file_number),
                _ => None,
            })
            .unwrap();

        pair.b.file_seek(0, offer, 1_048_576).unwrap();
        pair.pump();
        pair.b.file_control(0, offer, FileControlOp::Accept).unwrap();
        pair.pump();
        events(&mut pair.a);

        pair.a.tick(10);
        let requests = chunk_requests(&events(&mut pair.a));
        assert!(!requests.is_empty());
        assert_eq!(requests[0], (file, 1_048_576, 1015));

        // Delivery continues from the seek position on the receiving side.
        let chunk = vec![0xAA; 1015];
        pair.a.file_data(0, file, 1_048_576, &chunk).unwrap();
        pair.pump();
        assert!(events(&mut pair.b).contains(&Event::FileData {
            friend: 0,
            file_number: offer,
            position: 1_048_576,
            data: chunk,
        }));
    }

    #[test]
    fn seek_is_rejected_outside_not_accepted() {
        let mut pair = Pair::online();
        let _ = accepted_transfer(&mut pair, 4096);

        // Receiver already accepted: too late to seek.
        assert_eq!(
            pair.b.file_seek(0, 1 << 16, 100),
            Err(FileSeekError::BadState)
        );
        // Senders cannot seek at all.
        assert_eq!(pair.a.file_seek(0, 0, 100), Err(FileSeekError::NotReceiving));
    }

    #[test]
    fn seek_past_end_is_rejected() {
        let mut pair = Pair::online();
        pair.a.send_file(0, 0, 100, Some([1; 32]), b"small").unwrap();
        pair.pump();
        events(&mut pair.b);

        assert_eq!(
            pair.b.file_seek(0, 1 << 16, 100),
            Err(FileSeekError::BadPosition)
        );
    }

    #[test]
    fn pause_contention_resolves_toward_the_pauser() {
        let mut pair = Pair::online();
        let file = accepted_transfer(&mut pair, 1 << 20);

        pair.a.file_control(0, file, FileControlOp::Pause).unwrap();
        pair.pump();
        assert!(events(&mut pair.b).contains(&Event::FileControl {
            friend: 0,
            file_number: 1 << 16,
            op: FileControlOp::Pause,
        }));

        // Paused by the sender: the receiver cannot resume it.
        assert_eq!(
            pair.b.file_control(0, 1 << 16, FileControlOp::Accept),
            Err(FileControlError::PausedByOther)
        );

        // No chunks flow while paused.
        pair.a.tick(10);
        assert!(chunk_requests(&events(&mut pair.a)).is_empty());

        pair.a.file_control(0, file, FileControlOp::Accept).unwrap();
        pair.pump();
        assert!(events(&mut pair.b).contains(&Event::FileControl {
            friend: 0,
            file_number: 1 << 16,
            op: FileControlOp::Accept,
        }));

        pair.a.tick(11);
        assert!(!chunk_requests(&events(&mut pair.a)).is_empty());
    }

    #[test]
    fn pause_validations() {
        let mut pair = Pair::online();
        let file = accepted_transfer(&mut pair, 1 << 20);

        pair.a.file_control(0, file, FileControlOp::Pause).unwrap();
        assert_eq!(
            pair.a.file_control(0, file, FileControlOp::Pause),
            Err(FileControlError::AlreadyPaused)
        );

        // Resuming an unpaused transfer has nothing to do.
        pair.a.file_control(0, file, FileControlOp::Accept).unwrap();
        assert_eq!(
            pair.a.file_control(0, file, FileControlOp::Accept),
            Err(FileControlError::NotPaused)
        );

        // Accepting our own offer is meaningless.
        let second = pair.a.send_file(0, 0, 10, Some([2; 32]), b"x").unwrap();
        assert_eq!(
            pair.a.file_control(0, second, FileControlOp::Accept),
            Err(FileControlError::BadControl)
        );
    }

    #[test]
    fn file_data_validations() {
        let mut pair = Pair::online();
        let file = accepted_transfer(&mut pair, 3000);
        let chunk = vec![1u8; 1015];

        // No chunk was requested yet.
        assert_eq!(
            pair.a.file_data(0, file, 0, &chunk),
            Err(FileDataError::BadPosition)
        );

        pair.a.tick(10);
        events(&mut pair.a);

        assert_eq!(
            pair.a.file_data(0, file, 10, &chunk),
            Err(FileDataError::BadPosition)
        );
        assert_eq!(
            pair.a.file_data(0, file, 0, &[1u8; MAX_FILE_DATA_SIZE + 1]),
            Err(FileDataError::BadLength)
        );
        // Short chunks are only legal at the end of the file.
        assert_eq!(
            pair.a.file_data(0, file, 0, &chunk[..10]),
            Err(FileDataError::BadLength)
        );

        pair.a.transport_mut().set_free_slots(MIN_SLOTS_FREE - 1);
        assert_eq!(
            pair.a.file_data(0, file, 0, &chunk),
            Err(FileDataError::SendQueueFull)
        );
        pair.a.transport_mut().set_free_slots(64);

        pair.a.file_data(0, file, 0, &chunk).unwrap();

        assert_eq!(
            pair.a.file_data(0, 1 << 16, 0, &chunk),
            Err(FileDataError::InvalidFileNumber)
        );
    }

    #[test]
    fn kill_clears_both_sides() {
        let mut pair = Pair::online();
        let file = accepted_transfer(&mut pair, 1 << 20);

        pair.a.file_control(0, file, FileControlOp::Kill).unwrap();
        assert_eq!(pair.a.friends[0].as_ref().unwrap().num_sending_files, 0);
        pair.pump();

        assert!(events(&mut pair.b).contains(&Event::FileControl {
            friend: 0,
            file_number: 1 << 16,
            op: FileControlOp::Kill,
        }));
        assert!(!pair.b.friends[0].as_ref().unwrap().file_receiving[0].is_active());
    }

    #[test]
    fn control_for_a_dead_slot_is_answered_with_kill() {
        let mut pair = Pair::online();

        let stray = Packet::FileControl {
            direction: Direction::Receiving,
            slot: 5,
            op: FileControlOp::Accept,
            data: Vec::new(),
        };
        pair.a.handle_packet(pair.a_conn, &stray.encode());

        let replies = pair.a.transport_mut().drain_lossless(pair.a_conn);
        assert_eq!(replies.len(), 1);
        assert_eq!(
            Packet::decode(&replies[0].1).unwrap(),
            Packet::FileControl {
                direction: Direction::Sending,
                slot: 5,
                op: FileControlOp::Kill,
                data: Vec::new(),
            }
        );
    }

    #[test]
    fn going_offline_cancels_transfers_and_receipts() {
        let mut pair = Pair::online();
        let _ = accepted_transfer(&mut pair, 1 << 20);
        pair.a.send_message(0, MessageKind::Normal, b"pending").unwrap();
        events(&mut pair.a);

        pair.a.handle_connection_status(pair.a_conn, false);

        let friend = pair.a.friends[0].as_ref().unwrap();
        assert_eq!(friend.num_sending_files, 0);
        assert!(friend.file_sending.iter().all(|ft| !ft.is_active()));
        assert!(friend.receipts.is_empty());

        // The edge is reported through connection events, never through
        // terminal file callbacks.
        let got = events(&mut pair.a);
        assert!(got.contains(&Event::FriendOnline {
            friend: 0,
            online: false,
        }));
        assert!(!got
            .iter()
            .any(|e| matches!(e, Event::FileChunkRequest { .. } | Event::FileData { .. })));
    }

    #[test]
    fn congestion_stops_chunk_requests() {
        let mut pair = Pair::online();
        let _ = accepted_transfer(&mut pair, u64::MAX);

        pair.a.tick(10);
        let first = chunk_requests(&events(&mut pair.a));
        assert_eq!(first.len(), (64 - MIN_SLOTS_FREE) as usize);
        assert!(first.iter().all(|&(_, _, len)| len == MAX_FILE_DATA_SIZE));

        pair.a.transport_mut().set_congested(true);
        pair.a.tick(11);
        assert!(chunk_requests(&events(&mut pair.a)).is_empty());
    }

    #[test]
    fn file_send_slot_exhaustion() {
        let mut pair = Pair::online();
        for _ in 0..MAX_CONCURRENT_FILE_PIPES {
            pair.a.send_file(0, 0, 1, None, b"f").unwrap();
        }
        assert_eq!(
            pair.a.send_file(0, 0, 1, None, b"f"),
            Err(FileSendError::NoSlots)
        );
    }

    #[test]
    fn file_id_is_queryable_while_live() {
        let mut pair = Pair::online();
        let file = pair.a.send_file(0, 0, 10, Some([3; 32]), b"x").unwrap();
        assert_eq!(pair.a.file_id(0, file).unwrap(), [3; 32]);
        assert_eq!(pair.a.file_data_remaining(0, file).unwrap(), 10);
        assert_eq!(
            pair.a.file_id(0, 7),
            Err(FileQueryError::InvalidFileNumber)
        );
    }

    // ----- custom packets --------------------------------------------------

    #[test]
    fn custom_lossy_routing_and_rtp_registration() {
        let mut pair = Pair::online();

        assert_eq!(
            pair.a.send_lossy_packet(0, &[159, 1]),
            Err(CustomPacketError::BadId)
        );

        // Reserved A/V ID: dropped until the channel is registered.
        pair.a.send_lossy_packet(0, &[192, 1, 2]).unwrap();
        let lossy = pair.a.transport_mut().drain_lossy(pair.a_conn);
        pair.b.handle_lossy_packet(pair.b_conn, &lossy[0]);
        assert!(events(&mut pair.b).is_empty());

        pair.b.register_rtp_channel(0, 192).unwrap();
        pair.b.handle_lossy_packet(pair.b_conn, &lossy[0]);
        assert_eq!(
            events(&mut pair.b),
            vec![Event::RtpPacket {
                friend: 0,
                data: vec![192, 1, 2],
            }]
        );

        // Outside the A/V window the global lossy event applies.
        pair.a.send_lossy_packet(0, &[210, 9]).unwrap();
        let lossy = pair.a.transport_mut().drain_lossy(pair.a_conn);
        pair.b.handle_lossy_packet(pair.b_conn, &lossy[0]);
        assert_eq!(
            events(&mut pair.b),
            vec![Event::LossyPacket {
                friend: 0,
                data: vec![210, 9],
            }]
        );
    }

    #[test]
    fn custom_lossless_packets_pass_through() {
        let mut pair = Pair::online();

        assert_eq!(
            pair.a.send_lossless_packet(0, &[100, 1]),
            Err(CustomPacketError::BadId)
        );

        pair.a.send_lossless_packet(0, &[170, 4, 4]).unwrap();
        pair.pump();
        assert_eq!(
            events(&mut pair.b),
            vec![Event::LosslessPacket {
                friend: 0,
                data: vec![170, 4, 4],
            }]
        );
    }

    #[test]
    fn group_invite_and_msi_are_opaque_relays() {
        let mut pair = Pair::online();

        pair.a.send_group_invite(0, b"join-blob").unwrap();
        pair.a.send_msi(0, &[1, 2, 3]).unwrap();
        pair.pump();

        let got = events(&mut pair.b);
        assert!(got.contains(&Event::GroupInvite {
            friend: 0,
            data: b"join-blob".to_vec(),
        }));
        assert!(got.contains(&Event::MsiPacket {
            friend: 0,
            data: vec![1, 2, 3],
        }));

        assert_eq!(
            pair.a.send_group_invite(0, b""),
            Err(SendPacketError::Empty)
        );
    }

    #[test]
    fn last_seen_tracks_online_ticks() {
        let mut pair = Pair::online();
        pair.a.tick(1234);
        assert_eq!(pair.a.last_seen(0).unwrap(), 1234);

        pair.a.handle_connection_status(pair.a_conn, false);
        pair.a.tick(2000);
        assert_eq!(pair.a.last_seen(0).unwrap(), 1234);
    }

    #[test]
    fn run_interval_is_capped() {
        let m = messenger(1);
        assert_eq!(m.run_interval(), MIN_RUN_INTERVAL_MS);
    }

    #[test]
    fn devices_can_be_added_by_address() {
        let mut m = messenger(1);
        m.add_friend_norequest(&key(2)).unwrap();

        let device_address = address(3, [0; 4]);
        assert_eq!(m.add_device_to_friend(&device_address, 0), Ok(1));
        assert_eq!(m.friend_by_public_key(&key(3)), Some(0));

        // A friend still in the request phase cannot grow devices.
        let pending = m.add_friend(&address(5, [1, 2, 3, 4]), b"hi").unwrap();
        assert_eq!(
            m.add_device_to_friend(&address(6, [0; 4]), pending),
            Err(AddFriendError::InvalidFriend)
        );
    }

    #[test]
    fn self_address_parses_back() {
        let mut m = messenger(1);
        m.set_nospam(Nospam([4, 3, 2, 1]));

        let bytes = m.self_address().to_bytes();
        let parsed = FriendAddress::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.public_key, key(1));
        assert_eq!(parsed.nospam, Nospam([4, 3, 2, 1]));
    }

    #[test]
    fn unregistering_an_rtp_channel_drops_it_again() {
        let mut pair = Pair::online();
        pair.b.register_rtp_channel(0, 193).unwrap();

        pair.b.handle_lossy_packet(pair.b_conn, &[193, 7]);
        assert_eq!(events(&mut pair.b).len(), 1);

        pair.b.unregister_rtp_channel(0, 193).unwrap();
        pair.b.handle_lossy_packet(pair.b_conn, &[193, 7]);
        assert!(events(&mut pair.b).is_empty());
    }
}
