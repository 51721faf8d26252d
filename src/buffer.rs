//! Segmented network buffer
//!
//! One fixed allocation backs all per-tick packet traffic:
//!
//! ```text
//! [ Transfer (8192 B) | Self-Assign (256 B) | Slave-Data (3840 B) ]
//! ```
//!
//! - **Transfer** holds the single outbound frame batch assembled each tick.
//! - **Self-Assign** receives id requests from direct children still in
//!   assign mode.
//! - **Slave-Data** receives event traffic and in-flight assign requests
//!   from descendants.
//!
//! Each region has an independent write head. Spare accessors expose the
//! unwritten remainder of a region so a writer can never overrun it, and
//! `advance_*` commits bytes against the head. [`reset`](NetworkBuffer::reset)
//! zeroes the heads without clearing data: boundaries are enforced by the
//! heads, and headers are overwritten on the next write.

/// Capacity of the outbound transfer region.
pub const TRANSFER_SIZE: usize = 8192;

/// Capacity of the self-assign reception region.
pub const ASSIGN_SIZE: usize = 256;

/// Capacity of the slave-data reception region.
pub const SLAVE_DATA_SIZE: usize = 3840;

/// Total reception capacity.
pub const RECEPTION_SIZE: usize = ASSIGN_SIZE + SLAVE_DATA_SIZE;

/// Size of the single backing allocation.
pub const BUFFER_SIZE: usize = TRANSFER_SIZE + RECEPTION_SIZE;

const ASSIGN_BEGIN: usize = TRANSFER_SIZE;
const SLAVE_DATA_BEGIN: usize = TRANSFER_SIZE + ASSIGN_SIZE;

/// Fixed-capacity segmented byte buffer, allocated once and never grown.
pub struct NetworkBuffer {
    data: Box<[u8; BUFFER_SIZE]>,
    transfer_head: usize,
    assign_head: usize,
    slave_data_head: usize,
}

impl NetworkBuffer {
    pub fn new() -> Self {
        NetworkBuffer {
            data: Box::new([0u8; BUFFER_SIZE]),
            transfer_head: 0,
            assign_head: 0,
            slave_data_head: 0,
        }
    }

    /// Written prefix of the transfer region.
    pub fn transfer(&self) -> &[u8] {
        &self.data[..self.transfer_head]
    }

    pub fn transfer_len(&self) -> usize {
        self.transfer_head
    }

    pub fn assign_len(&self) -> usize {
        self.assign_head
    }

    pub fn slave_data_len(&self) -> usize {
        self.slave_data_head
    }

    /// Unwritten remainder of the transfer region.
    pub fn transfer_spare(&mut self) -> &mut [u8] {
        &mut self.data[self.transfer_head..TRANSFER_SIZE]
    }

    /// Unwritten remainder of the self-assign region.
    pub fn assign_spare(&mut self) -> &mut [u8] {
        &mut self.data[ASSIGN_BEGIN + self.assign_head..ASSIGN_BEGIN + ASSIGN_SIZE]
    }

    /// Unwritten remainder of the slave-data region.
    pub fn slave_data_spare(&mut self) -> &mut [u8] {
        &mut self.data[SLAVE_DATA_BEGIN + self.slave_data_head..BUFFER_SIZE]
    }

    /// Transfer spare and the written self-assign prefix, borrowed together
    /// so frames can be promoted across disjoint regions.
    pub fn transfer_spare_and_assign(&mut self) -> (&mut [u8], &[u8]) {
        let (transfer, reception) = self.data.split_at_mut(TRANSFER_SIZE);
        (
            &mut transfer[self.transfer_head..],
            &reception[..self.assign_head],
        )
    }

    /// Transfer spare and the written slave-data prefix, borrowed together.
    pub fn transfer_spare_and_slave_data(&mut self) -> (&mut [u8], &[u8]) {
        let (transfer, reception) = self.data.split_at_mut(TRANSFER_SIZE);
        (
            &mut transfer[self.transfer_head..],
            &reception[ASSIGN_SIZE..ASSIGN_SIZE + self.slave_data_head],
        )
    }

    /// Commit `count` bytes written into the transfer spare. Returns `false`
    /// and leaves the head unchanged on overflow.
    pub fn advance_transfer(&mut self, count: usize) -> bool {
        if self.transfer_head + count > TRANSFER_SIZE {
            return false;
        }
        self.transfer_head += count;
        true
    }

    /// Commit `count` bytes written into the self-assign spare.
    pub fn advance_assign(&mut self, count: usize) -> bool {
        if self.assign_head + count > ASSIGN_SIZE {
            return false;
        }
        self.assign_head += count;
        true
    }

    /// Commit `count` bytes written into the slave-data spare.
    pub fn advance_slave_data(&mut self, count: usize) -> bool {
        if self.slave_data_head + count > SLAVE_DATA_SIZE {
            return false;
        }
        self.slave_data_head += count;
        true
    }

    /// Start a fresh tick: zero the heads, keep the bytes.
    pub fn reset(&mut self) {
        self.transfer_head = 0;
        self.assign_head = 0;
        self.slave_data_head = 0;
    }
}

impl Default for NetworkBuffer {
    fn default() -> Self {
        Self::new()
    }
}
