//! A small reliable messaging transport layered over UDP.
//! A [`device::Device`] exchanges typed messages with exactly one remote
//! peer over a single datagram socket.
//!
//! The design goals are:
//!
//! 1. Reliable transmission: acknowledged, strictly ordered, at-most-once.
//! 2. Unreliable transmission: best-effort, stale arrivals discarded.
//! 3. Simplicity: four packet types, fixed big-endian layouts, one socket.
//!
//! Messages are dispatched to user-registered parsers by an 8-bit message
//! type identifier. Reliable sends block (await) until the peer
//! acknowledges the assigned sequence number or the retry budget runs out.
//!
//! # Examples
//!
//! ```no_run
//! use duplink::device::Device;
//!
//! async fn example() {
//!     // The passive side binds and waits to be probed by its peer.
//!     let listener = Device::listen(([127, 0, 0, 1], 46200))
//!         .await
//!         .expect("listener bound");
//!
//!     listener
//!         .register_parser(7, |sent_at, payload| {
//!             println!("sent at {:?}: {:?}", sent_at.to_system_time(), payload);
//!         })
//!         .expect("parser registered");
//!
//!     // The active side probes the listener until it answers.
//!     let device = Device::connect(([127, 0, 0, 1], 46201), ([127, 0, 0, 1], 46200))
//!         .await
//!         .expect("connected");
//!
//!     device.send_reliable(7, b"hello").await.expect("delivered");
//!     device.send_unreliable(7, b"telemetry").await.expect("sent");
//!
//!     device.close();
//! }
//! ```

use byteorder::{
    BigEndian,
    WriteBytesExt,
};
use std::{
    io::{
        Cursor,
        Write,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

pub mod device;

/// Maximum payload of a single message. Larger payloads are rejected,
/// there is no fragmentation.
pub const MAX_MESSAGE_SIZE: usize = 60;

/// Size of a CONNECT packet: type prefix and the query flag.
pub const CONNECT_HEADER_SIZE: usize = 2;

/// Size of a RESPONSE packet: type prefix and the acknowledged sequence.
pub const RESPONSE_HEADER_SIZE: usize = 5;

/// Header of a RELIABLE or UNRELIABLE packet: type prefix, sequence,
/// message type and send timestamp.
pub const FULL_HEADER_SIZE: usize = 14;

/// Largest datagram the protocol produces: a full data header plus a
/// maximum payload.
pub const MAX_PACKET_SIZE: usize = FULL_HEADER_SIZE + MAX_MESSAGE_SIZE;

struct Type;

#[rustfmt::skip]
impl Type {
    const CONNECT: u8 = 0;
        // query: u8, 1 = probe from the active side,
        //            0 = acknowledgement from the passive side

    const RESPONSE: u8 = 1;
        // acked_sequence: u32

    const RELIABLE: u8 = 2;
        // sequence: u32,
        // message_type: u8,
        // send_time: u64,
        // payload: &[u8]

    const UNRELIABLE: u8 = 3;
        // same layout as RELIABLE
}

/// Reserved message type identifiers. The numbering is policy shared by
/// both peers, not a protocol mechanism; any `u8` is a valid identifier.
pub mod message_type {
    /// Loopback self-test messages.
    pub const TEST: u8 = 0x00;
    /// Human-readable console text.
    pub const CONSOLE_MESSAGE: u8 = 0x01;
    /// Liveness probe that the peer is expected to answer promptly.
    pub const WATCHDOG_PING: u8 = 0x02;
}

/// Wall-clock stamp carried in every data packet, microseconds since the
/// Unix epoch. Advisory for parsers only, the protocol itself never reads
/// it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0);

        Self(micros)
    }

    fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Microseconds since the Unix epoch.
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Recover the wall-clock time of the sending peer.
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.0)
    }
}

#[macro_export]
macro_rules! seek_read {
    ($e:expr, $c:literal) => {
        match $e {
            Ok(r) => r,
            Err(_) => {
                log::warn!("read {} error", $c);
                continue;
            },
        }
    };
}

#[macro_export]
macro_rules! seek_write {
    ($e:expr, $c:literal) => {
        match $e {
            Ok(r) => r,
            Err(_) => {
                log::warn!("write {} error", $c);
                continue;
            },
        }
    };
}

type Buffer = [u8; MAX_PACKET_SIZE];

const ZEROED_BUFFER: Buffer = [0u8; MAX_PACKET_SIZE];

// The in-memory cursor writes below cannot fail, the callers keep
// payloads within MAX_MESSAGE_SIZE.

fn write_connect(buffer: &mut Buffer, query: bool) -> usize {
    let mut cursor = Cursor::new(buffer.as_mut_slice());

    cursor.write_u8(Type::CONNECT).unwrap();
    cursor.write_u8(query as u8).unwrap();

    cursor.position() as usize
}

fn write_response(buffer: &mut Buffer, sequence: u32) -> usize {
    let mut cursor = Cursor::new(buffer.as_mut_slice());

    cursor.write_u8(Type::RESPONSE).unwrap();
    cursor.write_u32::<BigEndian>(sequence).unwrap();

    cursor.position() as usize
}

fn write_data(
    buffer: &mut Buffer,
    packet_type: u8,
    sequence: u32,
    message_type: u8,
    sent_at: Timestamp,
    payload: &[u8],
) -> usize {
    let mut cursor = Cursor::new(buffer.as_mut_slice());

    cursor.write_u8(packet_type).unwrap();
    cursor.write_u32::<BigEndian>(sequence).unwrap();
    cursor.write_u8(message_type).unwrap();
    cursor.write_u64::<BigEndian>(sent_at.as_micros()).unwrap();
    cursor.write_all(payload).unwrap();

    cursor.position() as usize
}

fn parse_connect(datagram: &[u8]) -> Option<bool> {
    if datagram.len() < CONNECT_HEADER_SIZE || datagram[0] != Type::CONNECT {
        return None;
    }

    Some(datagram[1] == 1)
}
