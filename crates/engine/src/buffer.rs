//! Transfer buffers and their per-packet metadata
//!
//! A [`TransferBuffer`] is one reusable unit of isochronous transport memory:
//! `frames` packet slots of `packet_size` bytes each, laid out back to back.
//! Buffers are allocated once when a pipe is added and moved by value between
//! the free queue, the receive queue and the transport, so a buffer can never
//! be referenced from two places at once.

use common::DeathReason;

/// Completion status of a single isochronous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketStatus {
    /// Not yet transferred
    #[default]
    Idle,
    Completed,
    /// Fewer bytes than requested arrived
    Underrun,
    /// The device sent more than the slot could hold
    Overrun,
    /// CRC, bitstuff or other per-packet fault
    Error,
}

impl PacketStatus {
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            PacketStatus::Completed | PacketStatus::Underrun | PacketStatus::Overrun
        )
    }
}

/// Completion status of a whole transfer, as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Underrun,
    Overrun,
    /// Aborted by `abort`, sleep or shutdown
    Cancelled,
    /// Endpoint halted; recoverable once the stall is cleared
    Stall,
    NoDevice,
    NoBandwidth,
    TimedOut,
    Error,
}

/// How a pipe reacts to a completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Cancelled,
    Stall,
    Fatal(DeathReason),
}

impl TransferStatus {
    pub fn class(self) -> StatusClass {
        match self {
            TransferStatus::Completed | TransferStatus::Underrun | TransferStatus::Overrun => {
                StatusClass::Success
            }
            TransferStatus::Cancelled => StatusClass::Cancelled,
            TransferStatus::Stall => StatusClass::Stall,
            TransferStatus::NoDevice | TransferStatus::TimedOut => {
                StatusClass::Fatal(DeathReason::NotResponding)
            }
            TransferStatus::NoBandwidth => StatusClass::Fatal(DeathReason::NoBandwidth),
            TransferStatus::Error => StatusClass::Fatal(DeathReason::UnknownError),
        }
    }
}

/// Length and status of one packet slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDesc {
    /// Bytes requested (input) or queued for sending (output)
    pub length: usize,
    /// Bytes actually transferred
    pub actual_length: usize,
    pub status: PacketStatus,
}

#[derive(Debug)]
pub struct TransferBuffer {
    id: usize,
    packet_size: usize,
    data: Box<[u8]>,
    packets: Box<[IsoPacketDesc]>,
    sequence_frame: u64,
    arrival_time: u64,
    consumed: usize,
}

impl TransferBuffer {
    pub(crate) fn new(id: usize, packet_size: usize, frames: usize) -> Self {
        Self {
            id,
            packet_size,
            data: vec![0u8; packet_size * frames].into_boxed_slice(),
            packets: vec![IsoPacketDesc::default(); frames].into_boxed_slice(),
            sequence_frame: 0,
            arrival_time: 0,
            consumed: 0,
        }
    }

    /// Position of this buffer within its pipe's pool
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn frames(&self) -> usize {
        self.packets.len()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Total size of the data region in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// First hardware frame number represented by this buffer
    pub fn sequence_frame(&self) -> u64 {
        self.sequence_frame
    }

    /// Clock time of the first packet, set by the transport on completion
    pub fn arrival_time(&self) -> u64 {
        self.arrival_time
    }

    pub fn set_arrival_time(&mut self, micros: u64) {
        self.arrival_time = micros;
    }

    /// Packets already delivered to the client
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub(crate) fn set_consumed(&mut self, consumed: usize) {
        self.consumed = consumed;
    }

    pub fn packets(&self) -> &[IsoPacketDesc] {
        &self.packets
    }

    pub fn packets_mut(&mut self) -> &mut [IsoPacketDesc] {
        &mut self.packets
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Raw pointer to the data region, stable for the buffer's lifetime
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// Bytes received in packet `index`
    pub fn packet_data(&self, index: usize) -> &[u8] {
        let start = index * self.packet_size;
        let len = self.packets[index].actual_length.min(self.packet_size);
        &self.data[start..start + len]
    }

    /// Whole slot of packet `index`, regardless of its length
    pub fn packet_slot_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.packet_size;
        &mut self.data[start..start + self.packet_size]
    }

    /// Prepare for an input submission starting at `sequence_frame`
    pub(crate) fn reset_for_input(&mut self, sequence_frame: u64) {
        self.sequence_frame = sequence_frame;
        self.arrival_time = 0;
        self.consumed = 0;
        let packet_size = self.packet_size;
        for packet in self.packets.iter_mut() {
            *packet = IsoPacketDesc {
                length: packet_size,
                actual_length: 0,
                status: PacketStatus::Idle,
            };
        }
    }

    /// Clear contents and mark every packet idle and empty
    pub(crate) fn reset_for_output(&mut self) {
        self.data.fill(0);
        self.sequence_frame = 0;
        self.arrival_time = 0;
        self.consumed = 0;
        self.packets.fill(IsoPacketDesc::default());
    }

    /// Spread `used` bytes over the packet slots before an output submission
    pub(crate) fn set_output_lengths(&mut self, used: usize) {
        let packet_size = self.packet_size;
        for (i, packet) in self.packets.iter_mut().enumerate() {
            let start = i * packet_size;
            packet.length = used.saturating_sub(start).min(packet_size);
            packet.actual_length = 0;
            packet.status = PacketStatus::Idle;
        }
    }
}
