//! Wrapping `u16` sequence arithmetic for the UDP backends.

/// Whether `s1` is newer than `s2`, accounting for wraparound.
/// `sequence_greater_than(2, 1)` is true, `sequence_greater_than(0, 65535)` is true.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Receive-side window: newest sequence seen plus a 32-bit history of the
/// ones before it, ready to piggyback as `(ack, ack_bits)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckWindow {
    latest: u16,
    bits: u32,
    primed: bool,
}

impl AckWindow {
    /// Records `seq`. Returns `false` if it was already recorded.
    pub fn record(&mut self, seq: u16) -> bool {
        if !self.primed {
            self.primed = true;
            self.latest = seq;
            self.bits = 0;
            return true;
        }
        if seq == self.latest {
            return false;
        }
        if sequence_greater_than(seq, self.latest) {
            let shift = u32::from(seq.wrapping_sub(self.latest));
            self.bits = if shift > 32 {
                0
            } else {
                // Previous `latest` becomes bit (shift - 1).
                self.bits.checked_shl(shift).unwrap_or(0) | (1u32 << (shift - 1))
            };
            self.latest = seq;
            return true;
        }
        let back = u32::from(self.latest.wrapping_sub(seq));
        if back == 0 || back > 32 {
            // Too old to track; treat as new so reliable dedupe decides.
            return true;
        }
        let mask = 1u32 << (back - 1);
        let fresh = self.bits & mask == 0;
        self.bits |= mask;
        fresh
    }

    /// `(ack, ack_bits)` to stamp on the next outbound datagram.
    pub fn header(&self) -> (u16, u32) {
        (self.latest, self.bits)
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }
}

/// Sequences acknowledged by an `(ack, ack_bits)` header.
pub fn acked_sequences(ack: u16, ack_bits: u32) -> impl Iterator<Item = u16> {
    std::iter::once(ack).chain(
        (1..=32u16)
            .filter(move |i| ack_bits & (1u32 << (i - 1)) != 0)
            .map(move |i| ack.wrapping_sub(i)),
    )
}
