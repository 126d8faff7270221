//! Per-channel sequencing.
//!
//! Reliable commands are numbered per channel starting at 1 and delivered in
//! order: early arrivals wait in a reorder window until the gap before them
//! is filled. Unreliable packets carry the reliable sequence current when
//! they were sent; they are delivered only after that reliable command and
//! dropped once a newer one has been delivered or a newer unreliable packet
//! of the same reliable epoch has been seen.
//!
//! Sequence numbers are `u32` and compared with wrapping arithmetic.

use std::collections::HashMap;

use crate::protocol::{Command, MAX_FRAGMENT_COUNT, MAX_PACKET_SIZE};

/// How far ahead of the last delivered reliable sequence an arrival may be.
pub(crate) const RELIABLE_WINDOW: u32 = 4096;

/// Unreliable packets waiting for their reliable command.
const HELD_UNRELIABLE_LIMIT: usize = 256;

/// `a` is strictly after `b` in wrapping order.
pub(crate) fn sequence_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Result of offering a reliable command to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acceptance {
    /// Stored for in-order delivery. Must be acknowledged.
    Accepted,
    /// Already delivered or already waiting. Must be acknowledged again.
    Duplicate,
    /// Too far ahead; dropped without acknowledgement so the sender retries.
    OutOfWindow,
}

/// Something ready for the application, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ready {
    Reliable(Command),
    Unreliable(Vec<u8>),
}

#[derive(Debug)]
struct Held {
    reliable_sequence: u32,
    unreliable_sequence: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Assembly {
    start_sequence: u32,
    fragment_count: u32,
    next_fragment: u32,
    total_length: usize,
    data: Vec<u8>,
}

/// A fragment command's fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FragmentInfo {
    pub start_sequence: u32,
    pub fragment_number: u32,
    pub fragment_count: u32,
    pub total_length: u32,
    pub offset: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum FragmentError {
    #[error("fragment count {0} out of range")]
    BadCount(u32),
    #[error("total length {0} out of range")]
    BadLength(u32),
    #[error("fragment {number} of {start} does not continue the current packet")]
    OutOfOrder { start: u32, number: u32 },
    #[error("fragment overruns the declared packet length")]
    Overrun,
}

#[derive(Debug, Default)]
pub(crate) struct Channel {
    outgoing_reliable: u32,
    outgoing_unreliable: u32,
    incoming_reliable: u32,
    incoming_unreliable: u32,
    reorder: HashMap<u32, Command>,
    held: Vec<Held>,
    assembly: Option<Assembly>,
}

impl Channel {
    /// Sequence for the next reliable command. Starts a new unreliable epoch.
    pub(crate) fn next_reliable(&mut self) -> u32 {
        self.outgoing_reliable = self.outgoing_reliable.wrapping_add(1);
        self.outgoing_unreliable = 0;
        self.outgoing_reliable
    }

    /// `(reliable epoch, unreliable sequence)` for the next unreliable packet.
    pub(crate) fn next_unreliable(&mut self) -> (u32, u32) {
        self.outgoing_unreliable = self.outgoing_unreliable.wrapping_add(1);
        (self.outgoing_reliable, self.outgoing_unreliable)
    }

    /// Sequence the next reliable command will get.
    pub(crate) fn peek_reliable(&self) -> u32 {
        self.outgoing_reliable.wrapping_add(1)
    }

    pub(crate) fn accept_reliable(&mut self, sequence: u32, command: Command) -> Acceptance {
        if !sequence_after(sequence, self.incoming_reliable) {
            return Acceptance::Duplicate;
        }
        if sequence.wrapping_sub(self.incoming_reliable) > RELIABLE_WINDOW {
            return Acceptance::OutOfWindow;
        }
        if self.reorder.contains_key(&sequence) {
            return Acceptance::Duplicate;
        }
        self.reorder.insert(sequence, command);
        Acceptance::Accepted
    }

    /// Move everything now deliverable into `out`.
    pub(crate) fn drain_ready(&mut self, out: &mut Vec<Ready>) {
        loop {
            let next = self.incoming_reliable.wrapping_add(1);
            let Some(command) = self.reorder.remove(&next) else {
                break;
            };
            self.incoming_reliable = next;
            self.incoming_unreliable = 0;
            out.push(Ready::Reliable(command));
            self.release_held(out);
        }
    }

    /// Offer an unreliable packet. Returns it if it can be delivered now.
    pub(crate) fn accept_unreliable(
        &mut self,
        reliable_sequence: u32,
        unreliable_sequence: u32,
        data: Vec<u8>,
    ) -> Option<Vec<u8>> {
        if reliable_sequence == self.incoming_reliable {
            if sequence_after(unreliable_sequence, self.incoming_unreliable) {
                self.incoming_unreliable = unreliable_sequence;
                return Some(data);
            }
            return None;
        }
        if sequence_after(reliable_sequence, self.incoming_reliable)
            && reliable_sequence.wrapping_sub(self.incoming_reliable) <= RELIABLE_WINDOW
            && self.held.len() < HELD_UNRELIABLE_LIMIT
        {
            self.held.push(Held {
                reliable_sequence,
                unreliable_sequence,
                data,
            });
        }
        None
    }

    fn release_held(&mut self, out: &mut Vec<Ready>) {
        if self.held.is_empty() {
            return;
        }
        let current = self.incoming_reliable;
        let (mut now, later): (Vec<Held>, Vec<Held>) = std::mem::take(&mut self.held)
            .into_iter()
            .filter(|held| !sequence_after(current, held.reliable_sequence))
            .partition(|held| held.reliable_sequence == current);
        self.held = later;
        now.sort_by_key(|held| held.unreliable_sequence);
        for held in now {
            if sequence_after(held.unreliable_sequence, self.incoming_unreliable) {
                self.incoming_unreliable = held.unreliable_sequence;
                out.push(Ready::Unreliable(held.data));
            }
        }
    }

    /// Add an in-order fragment. Returns the whole packet once its last
    /// fragment arrives.
    pub(crate) fn reassemble(
        &mut self,
        info: FragmentInfo,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        if info.fragment_count == 0 || info.fragment_count > MAX_FRAGMENT_COUNT {
            self.assembly = None;
            return Err(FragmentError::BadCount(info.fragment_count));
        }
        if info.total_length as usize > MAX_PACKET_SIZE {
            self.assembly = None;
            return Err(FragmentError::BadLength(info.total_length));
        }
        if info.fragment_number == 0 {
            self.assembly = Some(Assembly {
                start_sequence: info.start_sequence,
                fragment_count: info.fragment_count,
                next_fragment: 0,
                total_length: info.total_length as usize,
                data: Vec::with_capacity(info.total_length as usize),
            });
        }
        let Some(assembly) = self.assembly.as_mut() else {
            return Err(FragmentError::OutOfOrder {
                start: info.start_sequence,
                number: info.fragment_number,
            });
        };
        if assembly.start_sequence != info.start_sequence
            || assembly.next_fragment != info.fragment_number
            || assembly.fragment_count != info.fragment_count
            || assembly.data.len() != info.offset as usize
        {
            self.assembly = None;
            return Err(FragmentError::OutOfOrder {
                start: info.start_sequence,
                number: info.fragment_number,
            });
        }
        if assembly.data.len() + data.len() > assembly.total_length {
            self.assembly = None;
            return Err(FragmentError::Overrun);
        }
        assembly.data.extend_from_slice(data);
        assembly.next_fragment += 1;
        if assembly.next_fragment < assembly.fragment_count {
            return Ok(None);
        }
        let complete = self.assembly.take().map(|assembly| assembly.data);
        match complete {
            Some(data) if data.len() == info.total_length as usize => Ok(Some(data)),
            _ => Err(FragmentError::BadLength(info.total_length)),
        }
    }
}
