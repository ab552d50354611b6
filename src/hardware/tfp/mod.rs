//! TFP over TCP, talking to a local brickd daemon
//!
//! [IpConnection] owns the socket. A background thread reads incoming packets and routes
//! responses back to the waiting caller, callbacks (enumeration) are handed to registered
//! listeners. Requests are issued synchronously: the caller blocks until the response arrives
//! or the request timeout elapses.

use std::{
    collections::HashMap,
    fmt::Debug,
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, warn};

use self::packet::{HEADER_LEN, Packet, PacketHeader, PayloadReader, PayloadWriter};
use super::{DeviceErrorCode, HardwareError, HardwareResult, Identity};

pub mod devices;
pub mod packet;
pub mod uid;

/// Default port of brickd
pub const DEFAULT_PORT: u16 = 4223;
/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Broadcast enumerate request
pub const FUNCTION_ENUMERATE: u8 = 254;
/// Enumerate callback
pub const CALLBACK_ENUMERATE: u8 = 253;
/// Standard get_identity function of every device
pub const FUNCTION_GET_IDENTITY: u8 = 255;
/// Standard reset function of every device
pub const FUNCTION_RESET: u8 = 243;

/// Why a device was reported by the enumerate callback
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::FromRepr)]
#[repr(u8)]
pub enum EnumerationType {
    /// Answer to an enumerate request
    Available = 0,
    /// Device was newly connected
    Connected = 1,
    /// Device was disconnected. Only the UID is valid
    Disconnected = 2,
}

type ResponseKey = (u32, u8, u8);

struct EnumerateListener {
    device_identifier: Option<u16>,
    slot: mpsc::SyncSender<Identity>,
}

struct Shared {
    stream: Mutex<TcpStream>,
    pending: Mutex<HashMap<ResponseKey, mpsc::Sender<Packet>>>,
    enumerate_listeners: Mutex<HashMap<u64, EnumerateListener>>,
    next_listener: AtomicU64,
    sequence: AtomicU8,
    running: AtomicBool,
}

/// Connection to brickd
pub struct IpConnection {
    shared: Arc<Shared>,
    timeout: Duration,
    host: String,
    handle: Option<JoinHandle<()>>,
}

impl Debug for IpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpConnection")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl IpConnection {
    /// Connects to brickd at `host`:`port`
    pub fn connect(host: &str, port: u16, timeout: Duration) -> HardwareResult<Arc<Self>> {
        debug!("Connecting to brickd at {host}:{port}");
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let mut reader = stream.try_clone()?;

        let shared = Arc::new(Shared {
            stream: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            enumerate_listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
            sequence: AtomicU8::new(0),
            running: AtomicBool::new(true),
        });

        let shared_t = shared.clone();
        let handle = std::thread::spawn(move || {
            while shared_t.running.load(Ordering::Relaxed) {
                match read_packet(&mut reader) {
                    Ok(packet) => dispatch(&shared_t, packet),
                    Err(e) => {
                        if shared_t.running.load(Ordering::Relaxed) {
                            warn!("brickd connection lost: {e}");
                        }
                        break;
                    }
                }
            }
            shared_t.running.store(false, Ordering::Relaxed);
            // Wake up anyone still waiting for a response or an enumeration
            shared_t.pending.lock().unwrap().clear();
            shared_t.enumerate_listeners.lock().unwrap().clear();
        });

        Ok(Arc::new(Self {
            shared,
            timeout,
            host: format!("{host}:{port}"),
            handle: Some(handle),
        }))
    }

    /// Returns true while the receive thread is alive
    pub fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn next_sequence_number(&self) -> u8 {
        // 1..=15, 0 is reserved for callbacks
        let prev = self
            .shared
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(s % 15 + 1))
            .unwrap_or(0);
        prev % 15 + 1
    }

    fn write(&self, packet: &Packet) -> HardwareResult<()> {
        if !self.is_connected() {
            return Err(HardwareError::NotConnected);
        }
        debug!("TFP Out -> {:02X?}", packet.to_bytes());
        self.shared.stream.lock().unwrap().write_all(&packet.to_bytes())?;
        Ok(())
    }

    /// Sends a request to device `uid` and waits for its response payload.
    ///
    /// If `response_expected` is false, the request is only sent and an empty payload is returned
    pub fn request(&self, uid: u32, function_id: u8, payload: Vec<u8>, response_expected: bool) -> HardwareResult<Vec<u8>> {
        let seq = self.next_sequence_number();
        let packet = Packet::request(uid, function_id, seq, response_expected, payload);
        if !response_expected {
            self.write(&packet)?;
            return Ok(Vec::new());
        }

        let key = (uid, function_id, seq);
        let (tx, rx) = mpsc::channel();
        self.shared.pending.lock().unwrap().insert(key, tx);
        if let Err(e) = self.write(&packet) {
            self.shared.pending.lock().unwrap().remove(&key);
            return Err(e);
        }
        let res = rx.recv_timeout(self.timeout);
        self.shared.pending.lock().unwrap().remove(&key);
        match res {
            Ok(resp) => {
                if resp.header.error_code != 0 {
                    return Err(HardwareError::DeviceError {
                        uid: uid::encode(uid),
                        function_id,
                        code: DeviceErrorCode::from_repr(resp.header.error_code).unwrap_or(DeviceErrorCode::Unknown),
                    });
                }
                Ok(resp.payload)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(HardwareError::NotConnected),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(HardwareError::ResponseTimeout {
                uid: uid::encode(uid),
                function_id,
            }),
        }
    }

    /// Broadcasts an enumerate request. Devices answer through the enumerate callback
    pub fn enumerate(&self) -> HardwareResult<()> {
        self.request(0, FUNCTION_ENUMERATE, Vec::new(), false).map(|_| ())
    }

    /// Enumerates and waits for the first device with `device_identifier`.
    ///
    /// The enumerate callback fills a single slot, the first matching device wins.
    /// With `timeout` set to [None] this waits until such a device shows up.
    pub fn find_device(&self, device_identifier: u16, timeout: Option<Duration>) -> HardwareResult<Identity> {
        let (tx, rx) = mpsc::sync_channel(1);
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.enumerate_listeners.lock().unwrap().insert(
            id,
            EnumerateListener {
                device_identifier: Some(device_identifier),
                slot: tx,
            },
        );
        let res = self.enumerate().and_then(|_| {
            let found = match timeout {
                Some(t) => rx.recv_timeout(t).ok(),
                None => rx.recv().ok(),
            };
            found.ok_or_else(|| HardwareError::DeviceNotFound(format!("device identifier {device_identifier}")))
        });
        self.shared.enumerate_listeners.lock().unwrap().remove(&id);
        res
    }

    /// Closes the connection. Pending and future requests fail with [HardwareError::NotConnected]
    pub fn disconnect(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let _ = self.shared.stream.lock().unwrap().shutdown(Shutdown::Both);
    }
}

impl Drop for IpConnection {
    fn drop(&mut self) {
        self.disconnect();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn read_packet<R: Read>(reader: &mut R) -> std::io::Result<Packet> {
    let mut head = [0u8; HEADER_LEN];
    reader.read_exact(&mut head)?;
    let header = PacketHeader::from_bytes(&head)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid TFP header"))?;
    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload)?;
    Ok(Packet { header, payload })
}

fn dispatch(shared: &Shared, packet: Packet) {
    debug!("TFP In <- {:02X?}", packet.to_bytes());
    if packet.is_callback() {
        if packet.header.function_id == CALLBACK_ENUMERATE {
            match parse_enumerate(&packet.payload) {
                Ok((identity, EnumerationType::Disconnected)) => {
                    debug!("Device {} disconnected", identity.uid)
                }
                Ok((identity, _)) => {
                    for l in shared.enumerate_listeners.lock().unwrap().values() {
                        if l.device_identifier.is_none_or(|id| id == identity.device_identifier) {
                            // A full slot was already set by an earlier match
                            let _ = l.slot.try_send(identity.clone());
                        }
                    }
                }
                Err(e) => warn!("Invalid enumerate callback: {e}"),
            }
        }
        return;
    }
    let h = packet.header;
    match shared
        .pending
        .lock()
        .unwrap()
        .get(&(h.uid, h.function_id, h.sequence_number))
    {
        Some(tx) => {
            let _ = tx.send(packet);
        }
        None => debug!(
            "Dropping unexpected response from {} (function {}, seq {})",
            uid::encode(h.uid),
            h.function_id,
            h.sequence_number
        ),
    }
}

/// Parses the identity layout shared by `get_identity` and the enumerate callback
pub(crate) fn parse_identity(r: &mut PayloadReader<'_>) -> HardwareResult<Identity> {
    Ok(Identity {
        uid: r.string(8)?,
        connected_uid: r.string(8)?,
        position: r.char()?,
        hardware_version: [r.u8()?, r.u8()?, r.u8()?],
        firmware_version: [r.u8()?, r.u8()?, r.u8()?],
        device_identifier: r.u16()?,
    })
}

fn parse_enumerate(payload: &[u8]) -> HardwareResult<(Identity, EnumerationType)> {
    let mut r = PayloadReader::new(CALLBACK_ENUMERATE, payload);
    r.require(26)?;
    let identity = parse_identity(&mut r)?;
    let kind = EnumerationType::from_repr(r.u8()?).unwrap_or(EnumerationType::Available);
    Ok((identity, kind))
}

/// A single device reachable through an [IpConnection]
#[derive(Debug, Clone)]
pub struct Device {
    ipcon: Arc<IpConnection>,
    uid: u32,
    uid_str: String,
}

impl Device {
    /// Creates a device handle for the base58 `uid`
    pub fn new(uid: &str, ipcon: Arc<IpConnection>) -> HardwareResult<Self> {
        Ok(Self {
            uid: uid::decode(uid)?,
            uid_str: uid.into(),
            ipcon,
        })
    }

    /// Base58 UID of the device
    pub fn uid(&self) -> &str {
        &self.uid_str
    }

    /// Calls a function and returns the response payload
    pub fn call(&self, function_id: u8, payload: PayloadWriter) -> HardwareResult<Vec<u8>> {
        self.ipcon.request(self.uid, function_id, payload.finish(), true)
    }

    /// Calls a function without waiting for a response
    pub fn send(&self, function_id: u8, payload: PayloadWriter) -> HardwareResult<()> {
        self.ipcon.request(self.uid, function_id, payload.finish(), false).map(|_| ())
    }

    /// Reads the identity of the device
    pub fn identity(&self) -> HardwareResult<Identity> {
        let resp = self.call(FUNCTION_GET_IDENTITY, PayloadWriter::new())?;
        let mut r = PayloadReader::new(FUNCTION_GET_IDENTITY, &resp);
        parse_identity(&mut r)
    }

    /// Resets the device
    pub fn reset(&self) -> HardwareResult<()> {
        self.send(FUNCTION_RESET, PayloadWriter::new())
    }
}
