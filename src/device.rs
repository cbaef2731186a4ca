//! One side of the point-to-point transport.
//!
//! A [`Device`] owns a bound UDP socket and talks to at most one remote
//! endpoint for its whole lifetime. It is started in one of two modes:
//!
//! - **active** ([`Device::connect`]): probes the given remote until the
//!   remote answers, then returns ready to send.
//! - **passive** ([`Device::listen`]): binds and returns immediately; the
//!   first probe received fixes the remote endpoint.
//!
//! Either way a background task owns all socket reads: it matches
//! acknowledgements to blocked reliable sends, keeps the receive sequence
//! counters, and hands payloads to the registered parsers. A device is
//! single-use; after [`Device::close`] it can neither send nor receive.

use crate::{
    seek_read,
    seek_write,
    Timestamp,
    Type,
    MAX_MESSAGE_SIZE,
    ZEROED_BUFFER,
};
use byteorder::{
    BigEndian,
    ReadBytesExt,
};
use futures_lite::future::FutureExt;
use log::{
    debug,
    warn,
};
use std::{
    collections::{
        hash_map::Entry,
        HashMap,
    },
    fmt,
    io::{
        Cursor,
        Error as StdIoError,
    },
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    time,
};

/// Default transmission budget of a reliable send.
pub const DEFAULT_SEND_ATTEMPTS: usize = 10;

/// Default wait between reliable retransmissions.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(100);

/// Default probe budget of an active connect.
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 10;

/// Default wait for the peer to answer a probe.
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// The error that can be returned by the device.
#[derive(Debug)]
pub enum Error {
    /// IO error wrapper.
    Io(StdIoError),
    /// Bind and remote addresses belong to different address families.
    InvalidEndpoint,
    /// An active connect ran out of probes without an answer.
    ConnectionFail,
    /// A send was attempted before a remote endpoint was bound, or after
    /// the device was closed.
    NotConnected,
    /// The payload exceeds [`MAX_MESSAGE_SIZE`].
    MessageTooLarge,
    /// A parser is already registered for this message type.
    AlreadyRegistered,
    /// A reliable send exhausted its attempts without an acknowledgement.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

impl From<StdIoError> for Error {
    fn from(from: StdIoError) -> Self {
        Self::Io(from)
    }
}

type Parser = Arc<dyn Fn(Timestamp, &[u8]) + Send + Sync>;

struct Shared {
    socket: UdpSocket,
    remote: Mutex<Option<SocketAddr>>,
    connected: AtomicBool,
    closed: AtomicBool,
    reliable_sequence: AtomicU32,
    unreliable_sequence: AtomicU32,
    pending_acks: Mutex<HashMap<u32, flume::Sender<()>>>,
    parsers: Mutex<HashMap<u8, Parser>>,
    close_sender: flume::Sender<()>,
}

/// Device parameters, tune the active connect handshake.
#[derive(Debug)]
pub struct DeviceParameters {
    /// How many probes an active connect sends before giving up.
    pub connect_attempts: usize,
    /// How long each probe waits for the answer.
    pub connect_interval: Duration,
}

impl Default for DeviceParameters {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_interval: DEFAULT_CONNECT_INTERVAL,
        }
    }
}

impl DeviceParameters {
    /// Bind the socket and wait to be probed by the remote peer.
    pub async fn listen<A>(self, bind_address: A) -> Result<Device, Error>
    where
        A: Into<SocketAddr>,
    {
        let socket = UdpSocket::bind(bind_address.into()).await?;

        Ok(Device::start(socket, None))
    }

    /// Bind the socket and probe the remote peer until it answers.
    pub async fn connect<A, B>(self, bind_address: A, remote_address: B) -> Result<Device, Error>
    where
        A: Into<SocketAddr>,
        B: Into<SocketAddr>,
    {
        let bind_address = bind_address.into();
        let remote = remote_address.into();

        if bind_address.is_ipv4() != remote.is_ipv4() {
            return Err(Error::InvalidEndpoint);
        }

        let socket = UdpSocket::bind(bind_address).await?;

        let mut probe = ZEROED_BUFFER;
        let probe_len = crate::write_connect(&mut probe, true);

        let mut buffer = ZEROED_BUFFER;
        let mut accepted = false;

        for _ in 0 .. self.connect_attempts {
            socket.send_to(&probe[.. probe_len], remote).await?;

            let reply = time::timeout(self.connect_interval, async {
                loop {
                    let (len, address) = match socket.recv_from(&mut buffer).await {
                        Ok(received) => received,
                        Err(err) => break Err(err),
                    };

                    // Drain anything that is not the awaited answer. Data
                    // racing ahead of the handshake is covered by the
                    // peer's retransmission.
                    if address == remote && crate::parse_connect(&buffer[.. len]) == Some(false) {
                        break Ok(());
                    }
                }
            })
            .await;

            match reply {
                Ok(Ok(())) => {
                    accepted = true;
                    break;
                },
                Ok(Err(err)) => return Err(err.into()),
                // No answer within the interval, probe again.
                Err(_) => {},
            }
        }

        if !accepted {
            return Err(Error::ConnectionFail);
        }

        Ok(Device::start(socket, Some(remote)))
    }
}

/// One side of the transport. Cheaply cloneable, all methods take `&self`;
/// clones share the same socket, counters and parsers.
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

impl Device {
    /// Bind the socket and wait to be probed by the remote peer, with the
    /// default parameters.
    pub async fn listen<A>(bind_address: A) -> Result<Self, Error>
    where
        A: Into<SocketAddr>,
    {
        DeviceParameters::default().listen(bind_address).await
    }

    /// Bind the socket and probe the remote peer until it answers, with
    /// the default parameters.
    pub async fn connect<A, B>(bind_address: A, remote_address: B) -> Result<Self, Error>
    where
        A: Into<SocketAddr>,
        B: Into<SocketAddr>,
    {
        DeviceParameters::default()
            .connect(bind_address, remote_address)
            .await
    }

    fn start(socket: UdpSocket, remote: Option<SocketAddr>) -> Self {
        let (close_sender, close_receiver) = flume::bounded(1);

        let shared = Arc::new(Shared {
            socket,
            connected: AtomicBool::new(remote.is_some()),
            closed: AtomicBool::new(false),
            remote: Mutex::new(remote),
            reliable_sequence: AtomicU32::new(0),
            unreliable_sequence: AtomicU32::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            parsers: Mutex::new(HashMap::new()),
            close_sender,
        });

        tokio::spawn(receive_loop(shared.clone(), close_receiver));

        Self { shared }
    }

    /// Register a parser for a message type. Every received message of
    /// that type is handed to the parser as its send timestamp and
    /// payload bytes.
    ///
    /// Parsers run on the device's receive task: a long-running parser
    /// delays every later datagram. At most one parser per message type;
    /// a second registration fails with [`Error::AlreadyRegistered`] and
    /// leaves the first one in place.
    pub fn register_parser<F>(&self, message_type: u8, parser: F) -> Result<(), Error>
    where
        F: Fn(Timestamp, &[u8]) + Send + Sync + 'static,
    {
        match self.shared.parsers.lock().unwrap().entry(message_type) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(parser));
                Ok(())
            },
        }
    }

    /// Send a message reliably with the default budget of
    /// [`DEFAULT_SEND_ATTEMPTS`] transmissions spaced
    /// [`DEFAULT_SEND_INTERVAL`] apart.
    pub async fn send_reliable(&self, message_type: u8, payload: &[u8]) -> Result<(), Error> {
        self.send_reliable_with(
            message_type,
            payload,
            DEFAULT_SEND_ATTEMPTS,
            DEFAULT_SEND_INTERVAL,
        )
        .await
    }

    /// Send a message reliably.
    ///
    /// Blocks until the peer acknowledges the sequence number assigned to
    /// this message, retransmitting every `interval` up to `attempts`
    /// times. Exhausting the budget fails with [`Error::Timeout`].
    ///
    /// Sequence numbers are taken in call order, so the peer dispatches
    /// concurrent sends in the order this method assigned them.
    pub async fn send_reliable_with(
        &self,
        message_type: u8,
        payload: &[u8],
        attempts: usize,
        interval: Duration,
    ) -> Result<(), Error> {
        let remote = self.remote()?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let sequence = self.shared.reliable_sequence.fetch_add(1, Ordering::Relaxed);

        let mut buffer = ZEROED_BUFFER;
        let len = crate::write_data(
            &mut buffer,
            Type::RELIABLE,
            sequence,
            message_type,
            Timestamp::now(),
            payload,
        );

        let (ack_sender, ack_receiver) = flume::bounded(1);

        self.shared
            .pending_acks
            .lock()
            .unwrap()
            .insert(sequence, ack_sender);

        let mut acked = false;

        for _ in 0 .. attempts {
            if !self.shared.connected.load(Ordering::Acquire) {
                break;
            }

            if let Err(err) = self.shared.socket.send_to(&buffer[.. len], remote).await {
                // Transient by the same rule the receive loop applies,
                // the attempt is spent either way.
                warn!("reliable send of sequence {} failed: {}", sequence, err);
            }

            match time::timeout(interval, ack_receiver.recv_async()).await {
                Ok(Ok(())) => {
                    acked = true;
                    break;
                },
                // The device was closed and the pending slot dropped.
                Ok(Err(_)) => break,
                // Interval elapsed, retransmit.
                Err(_) => {},
            }
        }

        self.shared.pending_acks.lock().unwrap().remove(&sequence);

        if acked {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Send a message unreliably: one transmission, no acknowledgement.
    /// The peer discards it if it arrives behind a younger unreliable
    /// message.
    pub async fn send_unreliable(&self, message_type: u8, payload: &[u8]) -> Result<(), Error> {
        let remote = self.remote()?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let sequence = self
            .shared
            .unreliable_sequence
            .fetch_add(1, Ordering::Relaxed);

        let mut buffer = ZEROED_BUFFER;
        let len = crate::write_data(
            &mut buffer,
            Type::UNRELIABLE,
            sequence,
            message_type,
            Timestamp::now(),
            payload,
        );

        self.shared.socket.send_to(&buffer[.. len], remote).await?;

        Ok(())
    }

    /// Close the device. Idempotent and terminal: the receive task stops,
    /// blocked reliable sends wake and return [`Error::Timeout`], and
    /// every later send fails with [`Error::NotConnected`].
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut remote = self.shared.remote.lock().unwrap();
            self.shared.connected.store(false, Ordering::Release);
            *remote = None;
        }

        // Dropping the slot senders wakes the blocked sends right away.
        self.shared.pending_acks.lock().unwrap().clear();

        let _ = self.shared.close_sender.try_send(());
    }

    /// Whether a remote endpoint is currently bound.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// The remote endpoint, if one is bound.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.shared.remote.lock().unwrap()
    }

    fn remote(&self) -> Result<SocketAddr, Error> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }

        let remote = *self.shared.remote.lock().unwrap();

        remote.ok_or(Error::NotConnected)
    }
}

fn dispatch(shared: &Shared, message_type: u8, sent_at: Timestamp, payload: &[u8]) {
    // The registry lock is released before the parser runs.
    let parser = shared.parsers.lock().unwrap().get(&message_type).cloned();

    match parser {
        Some(parser) => parser(sent_at, payload),
        None => {
            warn!("no parser registered for message type {}", message_type);
        },
    }
}

async fn receive_loop(shared: Arc<Shared>, close_receiver: flume::Receiver<()>) {
    let mut buffer = ZEROED_BUFFER;
    let mut send_buffer = ZEROED_BUFFER;

    // Next expected sequence numbers, owned by this task alone.
    let mut reliable_sequence: u32 = 0;
    let mut unreliable_sequence: u32 = 0;

    loop {
        let received = async { Some(shared.socket.recv_from(&mut buffer).await) }
            .or(async {
                let _ = close_receiver.recv_async().await;
                None
            })
            .await;

        let (len, address) = match received {
            Some(Ok(received)) => received,
            Some(Err(err)) => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                // UDP receive errors can be transient.
                warn!("socket receive failed: {}", err);
                continue;
            },
            None => break,
        };

        let mut cursor = Cursor::new(&buffer[.. len]);
        let packet_type = seek_read!(cursor.read_u8(), "packet type");

        if packet_type == Type::CONNECT {
            let query = seek_read!(cursor.read_u8(), "connect query") == 1;

            if !query {
                // Handshake answers are consumed by the active connect
                // before this task starts; a stray one means nothing.
                continue;
            }

            {
                let mut remote = shared.remote.lock().unwrap();

                match *remote {
                    None => {
                        // The first probe fixes the remote endpoint.
                        *remote = Some(address);
                        shared.connected.store(true, Ordering::Release);
                    },
                    // A repeated probe, the answer got lost.
                    Some(bound) if bound == address => {},
                    Some(_) => {
                        debug!("ignoring probe from {}, already paired", address);
                        continue;
                    },
                }
            }

            let reply_len = crate::write_connect(&mut send_buffer, false);
            seek_write!(
                shared.socket.send_to(&send_buffer[.. reply_len], address).await,
                "connect reply"
            );

            continue;
        }

        // Everything else is only accepted from the bound peer.
        if *shared.remote.lock().unwrap() != Some(address) {
            debug!("dropping packet from unknown peer {}", address);
            continue;
        }

        match packet_type {
            Type::RESPONSE => {
                let sequence = seek_read!(cursor.read_u32::<BigEndian>(), "acked sequence");

                // A miss is a late acknowledgement whose sender already
                // timed out, not an error.
                if let Some(slot) = shared.pending_acks.lock().unwrap().get(&sequence) {
                    let _ = slot.try_send(());
                }
            },
            Type::RELIABLE => {
                let sequence = seek_read!(cursor.read_u32::<BigEndian>(), "sequence");
                let message_type = seek_read!(cursor.read_u8(), "message type");
                let sent_at = seek_read!(cursor.read_u64::<BigEndian>(), "send time");
                let payload_start = cursor.position() as usize;

                if sequence > reliable_sequence {
                    // Too early; the peer keeps retransmitting the lower
                    // sequences until they are acknowledged.
                    debug!(
                        "dropping early reliable packet {} while expecting {}",
                        sequence, reliable_sequence
                    );
                    continue;
                }

                // Expected or duplicate, acknowledged either way.
                let response_len = crate::write_response(&mut send_buffer, sequence);
                seek_write!(
                    shared
                        .socket
                        .send_to(&send_buffer[.. response_len], address)
                        .await,
                    "response"
                );

                if sequence < reliable_sequence {
                    debug!("dropping duplicate reliable packet {}", sequence);
                    continue;
                }

                reliable_sequence = reliable_sequence.wrapping_add(1);

                dispatch(
                    &shared,
                    message_type,
                    Timestamp::from_micros(sent_at),
                    &buffer[payload_start .. len],
                );
            },
            Type::UNRELIABLE => {
                let sequence = seek_read!(cursor.read_u32::<BigEndian>(), "sequence");
                let message_type = seek_read!(cursor.read_u8(), "message type");
                let sent_at = seek_read!(cursor.read_u64::<BigEndian>(), "send time");
                let payload_start = cursor.position() as usize;

                if sequence < unreliable_sequence {
                    debug!(
                        "dropping stale unreliable packet {} while at {}",
                        sequence, unreliable_sequence
                    );
                    continue;
                }

                // Jump over anything lost in between; gaps reserve no
                // capacity.
                unreliable_sequence = sequence.wrapping_add(1);

                dispatch(
                    &shared,
                    message_type,
                    Timestamp::from_micros(sent_at),
                    &buffer[payload_start .. len],
                );
            },
            _ => {
                debug!("dropping packet with unknown type {}", packet_type);
            },
        }
    }
}
