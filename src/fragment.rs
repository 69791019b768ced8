/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use crate::error::ZrtpError;
use crate::packet::{self, FragmentInfo};
use crate::proto::*;

/// The single per-channel reassembly slot.
///
/// There is no protocol scenario in which the peer interleaves two
/// fragmented messages, so one slot keyed by message id suffices: a higher
/// id resets the slot for the new message, a lower id is rejected as out of
/// order, and fragments of the current id merge into a pre-sized buffer
/// indexed by their word offset.
#[derive(Default)]
pub(crate) struct ReassemblySlot {
    message_id: u16,
    message: Vec<u8>,
    /// (offset, length) in words of every fragment already merged.
    have: Vec<(u16, u16)>,
}

#[derive(Debug)]
pub(crate) enum Reassembly {
    Complete(Vec<u8>),
    Pending,
}

impl ReassemblySlot {
    pub fn insert(&mut self, info: FragmentInfo, fragment: &[u8]) -> Result<Reassembly, ZrtpError> {
        if fragment.len() != 4 * info.fragment_words as usize
            || info.offset_words.checked_add(info.fragment_words).map_or(true, |end| end > info.message_words)
            || info.message_words as usize * 4 > MAX_PACKET_SIZE
        {
            return Err(ZrtpError::InvalidPacket);
        }
        if info.message_id < self.message_id {
            return Err(ZrtpError::OutOfOrder);
        }
        if info.message_id > self.message_id || self.message.len() != 4 * info.message_words as usize {
            // A new message abandons whatever partial assembly we had.
            self.message_id = info.message_id;
            self.message = vec![0u8; 4 * info.message_words as usize];
            self.have.clear();
        }

        if !self.have.iter().any(|&(off, _)| off == info.offset_words) {
            let at = 4 * info.offset_words as usize;
            self.message[at..at + fragment.len()].copy_from_slice(fragment);
            self.have.push((info.offset_words, info.fragment_words));
        }

        let received: u32 = self.have.iter().map(|&(_, len)| len as u32).sum();
        if received == info.message_words as u32 {
            // Reset rather than remember the id: a retransmission of this
            // whole message must be able to reassemble again so the state
            // machine can treat it as a repetition.
            self.have.clear();
            self.message_id = 0;
            Ok(Reassembly::Complete(std::mem::take(&mut self.message)))
        } else {
            Ok(Reassembly::Pending)
        }
    }
}

/// A built outbound packet: either one wire buffer or a fragment train
/// sharing a message id. Sequence numbers and CRCs are stamped per send by
/// `send_with`, never at build time.
pub(crate) enum Wire {
    Single(Vec<u8>),
    Fragmented(Vec<Vec<u8>>),
}

impl Wire {
    /// Stamp fresh sequence numbers and CRCs and hand every buffer to the
    /// send callback. Returns the number of sequence numbers consumed.
    pub fn send_with(&mut self, mut next_sequence: u16, mut send: impl FnMut(&[u8]) -> bool) -> u16 {
        let buffers: &mut [Vec<u8>] = match self {
            Wire::Single(b) => std::slice::from_mut(b),
            Wire::Fragmented(b) => b,
        };
        let mut used = 0;
        for buf in buffers {
            packet::set_sequence_number(buf, next_sequence);
            next_sequence = next_sequence.wrapping_add(1);
            used += 1;
            send(buf);
        }
        used
    }
}

/// Wrap finished message bytes into wire packets, splitting into fragments
/// when header + message + CRC exceeds the MTU. All fragments share one
/// message id drawn from the per-channel counter.
pub(crate) fn packetize(message: &[u8], ssrc: u32, mtu: usize, message_counter: &mut u16) -> Wire {
    debug_assert!(message.len() % 4 == 0);
    if PACKET_OVERHEAD + message.len() <= mtu {
        let mut buf = vec![0u8; PACKET_OVERHEAD + message.len()];
        packet::write_header(&mut buf, false, ssrc);
        buf[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + message.len()].copy_from_slice(message);
        return Wire::Single(buf);
    }

    let message_id = *message_counter;
    *message_counter = message_counter.wrapping_add(1);

    // Largest whole-word payload that still fits.
    let max_chunk = (mtu.saturating_sub(FRAGMENTED_PACKET_OVERHEAD) / 4).max(1) * 4;
    let mut fragments = Vec::with_capacity(message.len() / max_chunk + 1);
    let mut offset = 0usize;
    while offset < message.len() {
        let chunk = max_chunk.min(message.len() - offset);
        let mut buf = vec![0u8; FRAGMENTED_PACKET_OVERHEAD + chunk];
        packet::write_header(&mut buf, true, ssrc);
        buf[12..14].copy_from_slice(&message_id.to_be_bytes());
        buf[14..16].copy_from_slice(&((message.len() / 4) as u16).to_be_bytes());
        buf[16..18].copy_from_slice(&((offset / 4) as u16).to_be_bytes());
        buf[18..20].copy_from_slice(&((chunk / 4) as u16).to_be_bytes());
        buf[FRAGMENTED_PACKET_HEADER_SIZE..FRAGMENTED_PACKET_HEADER_SIZE + chunk].copy_from_slice(&message[offset..offset + chunk]);
        fragments.push(buf);
        offset += chunk;
    }
    Wire::Fragmented(fragments)
}
