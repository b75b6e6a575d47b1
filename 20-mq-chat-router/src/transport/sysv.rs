use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_long, c_void};
use tracing::debug;

use super::{Address, Transport};
use crate::error::TransportError;
use crate::message::{MAX_TEXT_LEN, Packet};

/// Polling step used by [`Transport::receive_timeout`], which has no kernel
/// equivalent for message queues.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const CONTROL_MTYPE: c_long = 1;

/// Record layout on the queue. `mtype` selects the recipient and is not part
/// of the payload size handed to the kernel.
#[repr(C)]
struct RawMessage {
    mtype: c_long,
    client_id: c_int,
    text: [u8; MAX_TEXT_LEN + 1],
    timestamp_us: i64,
}

const PAYLOAD_SIZE: usize = size_of::<RawMessage>() - size_of::<c_long>();

impl RawMessage {
    fn empty() -> Self {
        Self {
            mtype: 0,
            client_id: 0,
            text: [0; MAX_TEXT_LEN + 1],
            timestamp_us: 0,
        }
    }

    fn encode(mtype: c_long, packet: &Packet) -> Self {
        let mut raw = Self::empty();
        raw.mtype = mtype;
        raw.client_id = packet.client_id;
        raw.timestamp_us = packet.timestamp_us;
        let bytes = packet.text.as_bytes();
        let len = bytes.len().min(MAX_TEXT_LEN);
        raw.text[..len].copy_from_slice(&bytes[..len]);
        raw
    }

    fn decode(&self) -> Packet {
        let len = self
            .text
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(MAX_TEXT_LEN);
        let text = String::from_utf8_lossy(&self.text[..len]).into_owned();
        Packet::new(self.client_id, text, self.timestamp_us)
    }
}

fn mtype_for(address: Address) -> Result<c_long, TransportError> {
    match address {
        Address::Control => Ok(CONTROL_MTYPE),
        Address::Client(id) if id > 0 => c_long::from(id)
            .checked_add(CONTROL_MTYPE)
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string())),
        Address::Client(_) => Err(TransportError::InvalidAddress(address.to_string())),
    }
}

/// System V message queue shared by the router and its clients.
///
/// Control commands use message type 1 and client `id` listens on type
/// `id + 1`, so every positive id is routable without touching the control
/// address.
#[derive(Debug)]
pub struct SysvQueue {
    id: c_int,
}

impl SysvQueue {
    /// Opens (creating if needed) the queue keyed by `ftok(key_path, project_id)`.
    /// The key file is created when it does not exist yet.
    pub fn open(key_path: &Path, project_id: u8) -> io::Result<Self> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(key_path)?;
        let c_path = CString::new(key_path.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        // SAFETY: `c_path` is a NUL-terminated string that lives until the
        // call returns; ftok only reads it.
        let key = unsafe { libc::ftok(c_path.as_ptr(), c_int::from(project_id)) };
        if key == -1 {
            return Err(io::Error::last_os_error());
        }
        Self::get(key, 0o666)
    }

    /// A fresh queue no other process can look up by key.
    pub fn private() -> io::Result<Self> {
        Self::get(libc::IPC_PRIVATE, 0o600)
    }

    fn get(key: libc::key_t, mode: c_int) -> io::Result<Self> {
        // SAFETY: msgget takes plain integers and touches no caller memory.
        let id = unsafe { libc::msgget(key, mode | libc::IPC_CREAT) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!(queue_id = id, "opened message queue");
        Ok(Self { id })
    }

    /// One `msgrcv` call. `Ok(None)` only happens with `IPC_NOWAIT`.
    fn receive_once(&self, mtype: c_long, flags: c_int) -> Result<Option<Packet>, TransportError> {
        let mut raw = RawMessage::empty();
        // SAFETY: `raw` is a live, properly sized `RawMessage` and the kernel
        // writes at most PAYLOAD_SIZE bytes after the `mtype` field.
        let received = unsafe {
            libc::msgrcv(
                self.id,
                (&mut raw as *mut RawMessage).cast::<c_void>(),
                PAYLOAD_SIZE,
                mtype,
                flags,
            )
        };
        if received >= 0 {
            return Ok(Some(raw.decode()));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOMSG) => Ok(None),
            Some(libc::EINTR) => Err(TransportError::Interrupted),
            Some(libc::EIDRM) | Some(libc::EINVAL) => Err(TransportError::Closed),
            _ => Err(TransportError::Io(err)),
        }
    }
}

impl Transport for SysvQueue {
    fn send(&self, to: Address, packet: &Packet) -> Result<(), TransportError> {
        let raw = RawMessage::encode(mtype_for(to)?, packet);
        loop {
            // SAFETY: `raw` outlives the call and holds PAYLOAD_SIZE bytes
            // after `mtype`.
            let rc = unsafe {
                libc::msgsnd(
                    self.id,
                    (&raw as *const RawMessage).cast::<c_void>(),
                    PAYLOAD_SIZE,
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EIDRM) | Some(libc::EINVAL) => return Err(TransportError::Closed),
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    fn receive(&self, at: Address) -> Result<Packet, TransportError> {
        let mtype = mtype_for(at)?;
        loop {
            if let Some(packet) = self.receive_once(mtype, 0)? {
                return Ok(packet);
            }
        }
    }

    fn receive_timeout(
        &self,
        at: Address,
        timeout: Duration,
    ) -> Result<Option<Packet>, TransportError> {
        let mtype = mtype_for(at)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.receive_once(mtype, libc::IPC_NOWAIT)? {
                return Ok(Some(packet));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        // SAFETY: IPC_RMID ignores the buffer argument, so a null pointer is
        // never dereferenced.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == 0 {
            debug!(queue_id = self.id, "removed message queue");
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Already removed by another process.
            Some(libc::EIDRM) | Some(libc::EINVAL) => Ok(()),
            _ => Err(TransportError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_addresses_never_reach_control() {
        assert_eq!(mtype_for(Address::Control).unwrap(), 1);
        assert_eq!(mtype_for(Address::Client(1)).unwrap(), 2);
        assert_eq!(mtype_for(Address::Client(1001)).unwrap(), 1002);
        assert!(matches!(
            mtype_for(Address::Client(0)),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            mtype_for(Address::Client(-4)),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn raw_message_round_trips_text_and_metadata() {
        let packet = Packet::new(1001, "say lobby hello", 1_700_000_000_000_000);
        let raw = RawMessage::encode(CONTROL_MTYPE, &packet);
        assert_eq!(raw.mtype, CONTROL_MTYPE);
        assert_eq!(raw.text[MAX_TEXT_LEN], 0);
        assert_eq!(raw.decode(), packet);
    }
}
