//! Wire-level protocol definitions
//!
//! Two packet shapes travel between boards:
//!
//! - **Discovery beacons** (UDP, port 4242): fixed 7-byte datagrams
//!   announcing a board's identity, link type and hop distance to the studio.
//! - **Framed packets** (TCP, port 4243): a 10-byte header followed by a
//!   payload and a footprint stack. The footprint stack records the chain of
//!   board identifiers an assignment request traversed on its way up the
//!   tree; replies are routed back down by popping the front entry at each
//!   hop.
//!
//! All multi-byte fields are little-endian.

pub mod packet;

/// Board identifier assigned by the studio master. `0` means unassigned.
pub type BoardId = u8;

/// Hop count to the studio master.
pub type NodeDistance = u8;

/// Magic key opening every beacon and framed packet.
pub const MAGIC_KEY: u32 = u32::from_le_bytes(*b"TALA");

/// UDP port beacons are sent to and received on.
pub const DISCOVERY_PORT: u16 = 4242;

/// TCP port an upstream board accepts children on (beacon port + 1).
pub const DATA_PORT: u16 = DISCOVERY_PORT + 1;

/// Physical link a board is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    None = 0,
    Usb = 1,
    Wifi = 2,
}

impl ConnectionType {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectionType::None),
            1 => Some(ConnectionType::Usb),
            2 => Some(ConnectionType::Wifi),
            _ => None,
        }
    }
}

/// Protocol family of a framed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolType {
    Connection = 0,
    Event = 1,
}

impl ProtocolType {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolType::Connection),
            1 => Some(ProtocolType::Event),
            _ => None,
        }
    }
}

/// Commands of the `Connection` protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnectionCommand {
    /// Request (payload `BoardId(0)`) or grant (payload the assigned id) of a
    /// board identifier. Forwarded requests carry a footprint stack.
    IdAssignment = 0,
    /// Announce the control surface dimensions of a board.
    HardwareSpecs = 1,
}

/// Commands of the `Event` protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventCommand {
    /// A batch of input state changes sampled in one tick.
    ControlsChanged = 0,
}

/// One debounced input state change, as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// Index into the board's pin map.
    pub index: u8,
    /// New logical state, 1 = pressed.
    pub value: u8,
}

/// Size of an encoded discovery beacon. Receivers drop datagrams of any
/// other size.
pub const DISCOVERY_PACKET_SIZE: usize = 7;

/// Discovery beacon announcing a board on the local segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub board_id: BoardId,
    pub connection_type: ConnectionType,
    pub distance: NodeDistance,
}

impl DiscoveryPacket {
    pub fn encode(&self) -> [u8; DISCOVERY_PACKET_SIZE] {
        let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_KEY.to_le_bytes());
        buf[4] = self.board_id;
        buf[5] = self.connection_type as u8;
        buf[6] = self.distance;
        buf
    }

    /// Decode a received datagram. Returns `None` on a size or magic
    /// mismatch, or an unknown connection type.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != DISCOVERY_PACKET_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC_KEY {
            return None;
        }
        Some(DiscoveryPacket {
            board_id: buf[4],
            connection_type: ConnectionType::from_raw(buf[5])?,
            distance: buf[6],
        })
    }
}
