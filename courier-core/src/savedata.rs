//! Versioned save/restore of the roster and user identity.
//!
//! A save is a concatenation of typed sections, each
//! `{type: u16 LE, len: u32 LE, cookie: u32 LE, bytes[len]}`. Inside the
//! FRIENDS section, length fields are big-endian and the nospam keeps its
//! opaque byte order, matching the wire conventions. Unknown section types
//! are skipped so newer saves load on older cores.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::warn;

use crate::friend::{DeviceStatus, FriendStatus};
use crate::identity::{FriendAddress, Nospam, PublicKey};
use crate::messenger::Messenger;
use crate::protocol::{UserStatus, MAX_NAME_LENGTH, MAX_STATUS_MESSAGE_LENGTH};
use crate::transport::{TcpRelay, Transport};

const SECTION_COOKIE: u32 = 0x01CE;
const SECTION_HEADER_SIZE: usize = 2 + 4 + 4;

const SECTION_OLDFRIENDS: u16 = 3;
const SECTION_NAME: u16 = 4;
const SECTION_STATUS_MESSAGE: u16 = 5;
const SECTION_STATUS: u16 = 6;
const SECTION_TCP_RELAY: u16 = 10;
const SECTION_FRIENDS: u16 = 13;

const FRIENDS_VERSION: u8 = 1;

/// Request payloads are stored in a fixed field of this size.
const SAVED_REQUEST_SIZE: usize = 1024;
/// Packed size of one friend record, devices excluded.
const SAVED_FRIEND_SIZE: usize =
    1 + SAVED_REQUEST_SIZE + 2 + MAX_NAME_LENGTH + 2 + MAX_STATUS_MESSAGE_LENGTH + 2 + 1 + 4 + 8 + 1;
/// Packed size of one device record.
const SAVED_DEVICE_SIZE: usize = 1 + PublicKey::SIZE;
/// Packed size of one legacy single-device friend record.
const SAVED_OLDFRIEND_SIZE: usize =
    1 + PublicKey::SIZE + SAVED_REQUEST_SIZE + 2 + MAX_NAME_LENGTH + 2 + MAX_STATUS_MESSAGE_LENGTH + 2 + 1 + 4 + 8;

/// Relays remembered across restarts.
pub const NUM_SAVED_TCP_RELAYS: usize = 8;

const RELAY_FAMILY_IPV4: u8 = 2;
const RELAY_FAMILY_IPV6: u8 = 10;

/// Error restoring saved state. Loading stops at the first structural
/// problem; sections already applied stay applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SaveDataError {
    #[error("save data ends mid-section")]
    Truncated,
    #[error("section cookie mismatch")]
    BadCookie,
    #[error("unsupported friends-section version {0}")]
    UnsupportedVersion(u8),
    #[error("section contents malformed")]
    Malformed,
}

impl<T: Transport> Messenger<T> {
    /// Serialize roster and user identity. Connection handles, timers, and
    /// in-flight transfers are ephemeral and not included.
    pub fn save(&self) -> Vec<u8> {
        let mut out = Vec::new();

        write_section(&mut out, SECTION_FRIENDS, &self.save_friends());
        write_section(&mut out, SECTION_NAME, &self.name);
        write_section(&mut out, SECTION_STATUS_MESSAGE, &self.status_message);
        write_section(&mut out, SECTION_STATUS, &[self.user_status as u8]);

        let relays = self.transport.connected_tcp_relays(NUM_SAVED_TCP_RELAYS);
        write_section(&mut out, SECTION_TCP_RELAY, &pack_relays(&relays));

        out
    }

    /// Restore a save into this messenger. Confirmed friends are recreated
    /// directly; friends whose request was still pending are re-queued
    /// through `add_friend` with their stored payload and nospam.
    pub fn load(&mut self, data: &[u8]) -> Result<(), SaveDataError> {
        let mut rest = data;

        while !rest.is_empty() {
            if rest.len() < SECTION_HEADER_SIZE {
                return Err(SaveDataError::Truncated);
            }

            let kind = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            let cookie = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]);

            if cookie != SECTION_COOKIE {
                return Err(SaveDataError::BadCookie);
            }

            if rest.len() - SECTION_HEADER_SIZE < len {
                return Err(SaveDataError::Truncated);
            }

            let bytes = &rest[SECTION_HEADER_SIZE..SECTION_HEADER_SIZE + len];

            match kind {
                SECTION_FRIENDS => self.load_friends(bytes)?,
                SECTION_OLDFRIENDS => self.load_oldfriends(bytes)?,
                SECTION_NAME => {
                    if !bytes.is_empty() && bytes.len() <= MAX_NAME_LENGTH {
                        let _ = self.set_name(bytes);
                    }
                }
                SECTION_STATUS_MESSAGE => {
                    if !bytes.is_empty() && bytes.len() <= MAX_STATUS_MESSAGE_LENGTH {
                        let _ = self.set_status_message(bytes);
                    }
                }
                SECTION_STATUS => {
                    if bytes.len() == 1 {
                        if let Some(status) = UserStatus::from_u8(bytes[0]) {
                            self.set_user_status(status);
                        }
                    }
                }
                SECTION_TCP_RELAY => {
                    if !bytes.is_empty() {
                        self.loaded_relays = unpack_relays(bytes, NUM_SAVED_TCP_RELAYS);
                        // Handed to the transport on the next tick.
                        self.relays_replayed = false;
                    }
                }
                other => {
                    warn!(section = other, "skipping unknown save section");
                }
            }

            rest = &rest[SECTION_HEADER_SIZE + len..];
        }

        Ok(())
    }

    fn save_friends(&self) -> Vec<u8> {
        let mut out = vec![FRIENDS_VERSION];

        for friend in self.friends.iter().flatten() {
            out.push(friend.status as u8);

            let info_len = friend.request_payload.len().min(SAVED_REQUEST_SIZE);
            put_padded(&mut out, &friend.request_payload[..info_len], SAVED_REQUEST_SIZE);
            out.extend_from_slice(&(info_len as u16).to_be_bytes());

            put_padded(&mut out, &friend.name, MAX_NAME_LENGTH);
            out.extend_from_slice(&(friend.name.len() as u16).to_be_bytes());

            put_padded(&mut out, &friend.status_message, MAX_STATUS_MESSAGE_LENGTH);
            out.extend_from_slice(&(friend.status_message.len() as u16).to_be_bytes());

            out.push(friend.user_status as u8);
            out.extend_from_slice(friend.request_nospam.as_bytes());
            out.extend_from_slice(&friend.last_seen.to_be_bytes());

            out.push(friend.devices.len().min(u8::MAX as usize) as u8);
            for device in friend.devices.iter().take(u8::MAX as usize) {
                out.push(device.status as u8);
                out.extend_from_slice(device.public_key.as_bytes());
            }
        }

        out
    }

    fn load_friends(&mut self, data: &[u8]) -> Result<(), SaveDataError> {
        let (&version, mut rest) = data.split_first().ok_or(SaveDataError::Truncated)?;

        if version != FRIENDS_VERSION {
            return Err(SaveDataError::UnsupportedVersion(version));
        }

        while !rest.is_empty() {
            if rest.len() < SAVED_FRIEND_SIZE {
                return Err(SaveDataError::Truncated);
            }

            let record = &rest[..SAVED_FRIEND_SIZE];
            let dev_count = record[SAVED_FRIEND_SIZE - 1] as usize;

            if dev_count == 0 {
                return Err(SaveDataError::Malformed);
            }

            if rest.len() < SAVED_FRIEND_SIZE + dev_count * SAVED_DEVICE_SIZE {
                return Err(SaveDataError::Truncated);
            }

            let devices = &rest[SAVED_FRIEND_SIZE..SAVED_FRIEND_SIZE + dev_count * SAVED_DEVICE_SIZE];
            self.load_friend_record(record, devices);
            rest = &rest[SAVED_FRIEND_SIZE + dev_count * SAVED_DEVICE_SIZE..];
        }

        Ok(())
    }

    fn load_friend_record(&mut self, record: &[u8], devices: &[u8]) {
        let mut at = 0usize;
        let status = record[at];
        at += 1;
        let info = &record[at..at + SAVED_REQUEST_SIZE];
        at += SAVED_REQUEST_SIZE;
        let info_size = (read_u16_be(record, at) as usize).min(SAVED_REQUEST_SIZE);
        at += 2;
        let name = &record[at..at + MAX_NAME_LENGTH];
        at += MAX_NAME_LENGTH;
        let name_len = read_u16_be(record, at) as usize;
        at += 2;
        let status_message = &record[at..at + MAX_STATUS_MESSAGE_LENGTH];
        at += MAX_STATUS_MESSAGE_LENGTH;
        let status_message_len = read_u16_be(record, at) as usize;
        at += 2;
        let user_status = record[at];
        at += 1;
        let mut nospam = [0u8; 4];
        nospam.copy_from_slice(&record[at..at + 4]);
        at += 4;
        let last_seen = u64::from_be_bytes(record[at..at + 8].try_into().unwrap());

        let mut pk = [0u8; PublicKey::SIZE];
        pk.copy_from_slice(&devices[1..SAVED_DEVICE_SIZE]);
        let public_key = PublicKey::from_bytes(pk);

        let Some(status) = FriendStatus::from_u8(status) else {
            warn!("skipping saved friend with invalid status");
            return;
        };

        if status >= FriendStatus::Confirmed {
            let Ok(number) = self.add_friend_norequest(&public_key) else {
                warn!("skipping saved friend the roster refused");
                return;
            };

            let friend = self.friends[number as usize].as_mut().unwrap();
            if name_len <= MAX_NAME_LENGTH {
                friend.name = name[..name_len].to_vec();
            }
            if status_message_len <= MAX_STATUS_MESSAGE_LENGTH {
                friend.status_message = status_message[..status_message_len].to_vec();
            }
            friend.user_status = UserStatus::from_u8(user_status).unwrap_or(UserStatus::None);
            friend.last_seen = last_seen;

            for extra in devices[SAVED_DEVICE_SIZE..].chunks_exact(SAVED_DEVICE_SIZE) {
                let mut pk = [0u8; PublicKey::SIZE];
                pk.copy_from_slice(&extra[1..]);
                let device_key = PublicKey::from_bytes(pk);

                if DeviceStatus::from_u8(extra[0]).is_some() && device_key.is_valid() {
                    let _ = self.add_device_confirmed(&device_key, number);
                }
            }
        } else {
            // Pending request: rebuild the address and queue it again.
            let address = FriendAddress::new(public_key, Nospam(nospam)).to_bytes();
            let _ = self.add_friend(&address, &info[..info_size]);
        }
    }

    fn load_oldfriends(&mut self, data: &[u8]) -> Result<(), SaveDataError> {
        if data.len() % SAVED_OLDFRIEND_SIZE != 0 {
            return Err(SaveDataError::Malformed);
        }

        for record in data.chunks_exact(SAVED_OLDFRIEND_SIZE) {
            let mut at = 0usize;
            let status = record[at];
            at += 1;
            let mut pk = [0u8; PublicKey::SIZE];
            pk.copy_from_slice(&record[at..at + PublicKey::SIZE]);
            let public_key = PublicKey::from_bytes(pk);
            at += PublicKey::SIZE;
            let info = &record[at..at + SAVED_REQUEST_SIZE];
            at += SAVED_REQUEST_SIZE;
            let info_size = (read_u16_be(record, at) as usize).min(SAVED_REQUEST_SIZE);
            at += 2;
            let name = &record[at..at + MAX_NAME_LENGTH];
            at += MAX_NAME_LENGTH;
            let name_len = read_u16_be(record, at) as usize;
            at += 2;
            let status_message = &record[at..at + MAX_STATUS_MESSAGE_LENGTH];
            at += MAX_STATUS_MESSAGE_LENGTH;
            let status_message_len = read_u16_be(record, at) as usize;
            at += 2;
            let user_status = record[at];
            at += 1;
            let mut nospam = [0u8; 4];
            nospam.copy_from_slice(&record[at..at + 4]);
            at += 4;
            let last_seen = u64::from_be_bytes(record[at..at + 8].try_into().unwrap());

            let Some(status) = FriendStatus::from_u8(status) else {
                continue;
            };

            if status >= FriendStatus::Confirmed {
                let Ok(number) = self.add_friend_norequest(&public_key) else {
                    continue;
                };

                let friend = self.friends[number as usize].as_mut().unwrap();
                if name_len <= MAX_NAME_LENGTH {
                    friend.name = name[..name_len].to_vec();
                }
                if status_message_len <= MAX_STATUS_MESSAGE_LENGTH {
                    friend.status_message = status_message[..status_message_len].to_vec();
                }
                friend.user_status = UserStatus::from_u8(user_status).unwrap_or(UserStatus::None);
                friend.last_seen = last_seen;
            } else {
                let address = FriendAddress::new(public_key, Nospam(nospam)).to_bytes();
                let _ = self.add_friend(&address, &info[..info_size]);
            }
        }

        Ok(())
    }
}

fn write_section(out: &mut Vec<u8>, kind: u16, bytes: &[u8]) {
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&SECTION_COOKIE.to_le_bytes());
    out.extend_from_slice(bytes);
}

fn put_padded(out: &mut Vec<u8>, bytes: &[u8], width: usize) {
    debug_assert!(bytes.len() <= width);
    out.extend_from_slice(bytes);
    out.resize(out.len() + (width - bytes.len()), 0);
}

fn read_u16_be(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn pack_relays(relays: &[TcpRelay]) -> Vec<u8> {
    let mut out = Vec::new();

    for relay in relays {
        match relay.addr.ip() {
            IpAddr::V4(ip) => {
                out.push(RELAY_FAMILY_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(RELAY_FAMILY_IPV6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&relay.addr.port().to_be_bytes());
        out.extend_from_slice(relay.public_key.as_bytes());
    }

    out
}

fn unpack_relays(mut bytes: &[u8], max: usize) -> Vec<TcpRelay> {
    let mut relays = Vec::new();

    while relays.len() < max && !bytes.is_empty() {
        let (ip, rest) = match bytes[0] {
            RELAY_FAMILY_IPV4 if bytes.len() >= 1 + 4 + 2 + PublicKey::SIZE => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[1..5]);
                (IpAddr::V4(Ipv4Addr::from(octets)), &bytes[5..])
            }
            RELAY_FAMILY_IPV6 if bytes.len() >= 1 + 16 + 2 + PublicKey::SIZE => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[1..17]);
                (IpAddr::V6(Ipv6Addr::from(octets)), &bytes[17..])
            }
            _ => {
                warn!("stopping at malformed relay entry in save data");
                break;
            }
        };

        let port = u16::from_be_bytes([rest[0], rest[1]]);
        let mut pk = [0u8; PublicKey::SIZE];
        pk.copy_from_slice(&rest[2..2 + PublicKey::SIZE]);

        relays.push(TcpRelay {
            addr: SocketAddr::new(ip, port),
            public_key: PublicKey::from_bytes(pk),
        });

        bytes = &rest[2 + PublicKey::SIZE..];
    }

    relays
}
