//! Per-remote jitter smoothing: a sequence-indexed ring of pending
//! packets, an arrival-time filter that tracks the sender's pacing, and
//! a source-latency conditioner that keeps the playback queue short.

use crate::Sequence;

pub const DEFAULT_NUM_SLOTS: usize = 2;

/// Fixed-size ring of packet slots indexed by the wrapping sequence
/// number. The head is the next sequence expected at the playback side;
/// a packet arriving at or beyond `head + N` advances the head,
/// dropping whatever falls out of the window.
pub struct JitterBuffer {
    slots: Vec<Option<Vec<u8>>>,
    head_sequence: Sequence,
    initialized: bool,
}

/// What happened to an enqueued packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue {
    /// Stored; `advanced` slots were expired to make room.
    Stored { advanced: usize },
    /// Sequence older than the head; dropped.
    Stale,
}

impl JitterBuffer {
    pub fn new(num_slots: usize) -> JitterBuffer {
        JitterBuffer {
            slots: (0..num_slots.max(1)).map(|_| None).collect(),
            head_sequence: 0,
            initialized: false,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn head_sequence(&self) -> Sequence {
        self.head_sequence
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn slot_index(&self, sequence: Sequence) -> usize {
        sequence as usize % self.slots.len()
    }

    /// Starts the ring at the first packet's sequence.
    pub fn init(&mut self, sequence: Sequence, packet: Vec<u8>) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head_sequence = sequence;
        let index = self.slot_index(sequence);
        self.slots[index] = Some(packet);
        self.initialized = true;
    }

    pub fn enqueue(&mut self, sequence: Sequence, packet: Vec<u8>) -> Enqueue {
        if !self.initialized {
            self.init(sequence, packet);
            return Enqueue::Stored { advanced: 0 };
        }

        let delta = sequence.wrapping_sub(self.head_sequence) as i16;
        if delta < 0 {
            return Enqueue::Stale;
        }

        let mut advanced = 0;
        while sequence.wrapping_sub(self.head_sequence) as usize >= self.slots.len() {
            let index = self.slot_index(self.head_sequence);
            self.slots[index] = None;
            self.head_sequence = self.head_sequence.wrapping_add(1);
            advanced += 1;
        }

        let index = self.slot_index(sequence);
        self.slots[index] = Some(packet);
        Enqueue::Stored { advanced }
    }

    /// Removes the head slot and advances. `None` means the packet at
    /// the head sequence never arrived (a gap to conceal).
    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        let index = self.slot_index(self.head_sequence);
        let packet = self.slots[index].take();
        self.head_sequence = self.head_sequence.wrapping_add(1);
        packet
    }

    /// True if any slot holds a packet.
    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }
}

/// Smooths packet arrival timestamps into an expected head-arrival
/// time. Single-pole filter in 16.16 fixed point; the playback thread
/// sleeps until `head_arrival + target_latency` before dequeueing.
pub struct ArrivalFilter {
    head_arrival: i64,
    period_us: i64,
    gain: i64,
}

/// Filter gain: 0.01 in 16.16 fixed point.
const ARRIVAL_FILTER_GAIN: i64 = 655;

impl ArrivalFilter {
    pub fn new(period_us: i64) -> ArrivalFilter {
        ArrivalFilter {
            head_arrival: 0,
            period_us,
            gain: ARRIVAL_FILTER_GAIN,
        }
    }

    pub fn init(&mut self, arrival_us: i64) {
        self.head_arrival = arrival_us;
    }

    /// Folds one observed arrival into the estimate. `slots_ahead` is
    /// the packet's distance from the current head sequence.
    pub fn observe(&mut self, slots_ahead: i64, arrival_us: i64) {
        let expected = self.head_arrival + slots_ahead * self.period_us;
        self.head_arrival += ((arrival_us - expected) * self.gain + 32768) >> 16;
    }

    /// Advances the estimate by one packet period after a dequeue.
    pub fn advance(&mut self) {
        self.head_arrival += self.period_us;
    }

    pub fn head_arrival_us(&self) -> i64 {
        self.head_arrival
    }
}

/// Conditioning decision for the next decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditioning {
    None,
    /// The playback queue has grown; shorten the next frame.
    Compress,
    /// The playback queue has drained; inject a silence frame.
    InjectSilence,
}

/// Tracks the downstream device's queue depth with a slow single-pole
/// filter and drives frame compression or silence injection when it
/// leaves the 0.5..1.0 hysteresis band.
pub struct SourceLatencyFilter {
    latency: f64,
    min_queued: f64,
}

impl SourceLatencyFilter {
    pub fn new(min_queued: usize) -> SourceLatencyFilter {
        SourceLatencyFilter {
            latency: 0.0,
            min_queued: min_queued as f64,
        }
    }

    pub fn observe(&mut self, pending: usize) -> Conditioning {
        self.latency = 0.99 * self.latency + 0.01 * (pending as f64 - self.min_queued);
        if self.latency > 1.0 {
            Conditioning::Compress
        } else if self.latency < -0.5 {
            Conditioning::InjectSilence
        } else {
            Conditioning::None
        }
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Pulls the estimate back toward the band after a correction was
    /// applied.
    pub fn corrected(&mut self, conditioning: Conditioning) {
        match conditioning {
            Conditioning::Compress => self.latency -= 1.0,
            Conditioning::InjectSilence => self.latency += 1.0,
            Conditioning::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: u8) -> Vec<u8> {
        vec![tag; 4]
    }

    #[test]
    fn test_in_order_packets_dequeue_in_order() {
        let mut jitter = JitterBuffer::new(4);
        for sequence in 10u16..14 {
            jitter.enqueue(sequence, packet(sequence as u8));
        }
        for sequence in 10u16..14 {
            assert_eq!(jitter.dequeue(), Some(packet(sequence as u8)));
        }
        assert_eq!(jitter.head_sequence(), 14);
    }

    #[test]
    fn test_reordered_packets_within_window() {
        let mut jitter = JitterBuffer::new(4);
        jitter.enqueue(100, packet(0));
        jitter.enqueue(102, packet(2));
        jitter.enqueue(101, packet(1));

        assert_eq!(jitter.dequeue(), Some(packet(0)));
        assert_eq!(jitter.dequeue(), Some(packet(1)));
        assert_eq!(jitter.dequeue(), Some(packet(2)));
    }

    #[test]
    fn test_gap_shows_as_empty_dequeue() {
        let mut jitter = JitterBuffer::new(4);
        jitter.enqueue(5, packet(5));
        jitter.enqueue(7, packet(7));

        assert_eq!(jitter.dequeue(), Some(packet(5)));
        assert_eq!(jitter.dequeue(), None); // sequence 6 never arrived
        assert_eq!(jitter.dequeue(), Some(packet(7)));
    }

    #[test]
    fn test_far_ahead_sequence_advances_head() {
        let mut jitter = JitterBuffer::new(2);
        jitter.enqueue(0, packet(0));
        jitter.enqueue(1, packet(1));

        // Sequence 4 is two windows ahead; packets 0..3 fall out.
        match jitter.enqueue(4, packet(4)) {
            Enqueue::Stored { advanced } => assert_eq!(advanced, 3),
            other => panic!("Unexpected result {:?}", other),
        }
        assert_eq!(jitter.head_sequence(), 3);
        assert_eq!(jitter.dequeue(), None);
        assert_eq!(jitter.dequeue(), Some(packet(4)));
    }

    #[test]
    fn test_stale_packets_are_dropped() {
        let mut jitter = JitterBuffer::new(4);
        jitter.enqueue(50, packet(0));
        jitter.dequeue();

        assert_eq!(jitter.enqueue(49, packet(9)), Enqueue::Stale);
        assert_eq!(jitter.enqueue(50, packet(9)), Enqueue::Stale);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jitter = JitterBuffer::new(4);
        jitter.enqueue(65534, packet(1));
        jitter.enqueue(65535, packet(2));
        jitter.enqueue(0, packet(3));

        assert_eq!(jitter.dequeue(), Some(packet(1)));
        assert_eq!(jitter.dequeue(), Some(packet(2)));
        assert_eq!(jitter.dequeue(), Some(packet(3)));
        assert_eq!(jitter.head_sequence(), 1);
    }

    #[test]
    fn test_every_payload_dequeued_once_with_bounded_reorder() {
        // Property check: any arrival order with reordering smaller
        // than the window delivers every payload exactly once, in
        // ascending sequence.
        let window = 8;
        let mut jitter = JitterBuffer::new(window);

        let mut arrivals: Vec<u16> = (0..64).collect();
        // Deterministic bounded shuffle: swap pairs three apart. The
        // first packet stays in place so the ring initializes at
        // sequence zero.
        for i in (1..arrivals.len() - 3).step_by(4) {
            arrivals.swap(i, i + 3);
        }

        let mut dequeued = Vec::new();
        for &sequence in &arrivals {
            jitter.enqueue(sequence, packet(sequence as u8));
            // Drain whenever the window is more than half full.
            while jitter.head_sequence() + (window as u16 / 2) < sequence {
                if let Some(data) = jitter.dequeue() {
                    dequeued.push(data[0]);
                }
            }
        }
        while jitter.has_pending() {
            if let Some(data) = jitter.dequeue() {
                dequeued.push(data[0]);
            }
        }

        let expected: Vec<u8> = (0..64).map(|v| v as u8).collect();
        assert_eq!(dequeued, expected);
    }

    #[test]
    fn test_arrival_filter_converges_to_steady_pacing() {
        let period = 20_000;
        let mut filter = ArrivalFilter::new(period);
        filter.init(1_000_000);

        // Packets arriving exactly on time leave the estimate alone.
        for slot in 1..50 {
            filter.observe(slot, 1_000_000 + slot * period);
        }
        assert_eq!(filter.head_arrival_us(), 1_000_000);

        // A consistently late source drags the estimate forward.
        for slot in 1..500 {
            filter.observe(slot, 1_000_000 + slot * period + 5_000);
        }
        assert!(filter.head_arrival_us() > 1_000_000);
    }

    #[test]
    fn test_latency_filter_hysteresis() {
        let mut filter = SourceLatencyFilter::new(1);

        // A long run at the minimum queue depth stays inside the band.
        for _ in 0..100 {
            assert_eq!(filter.observe(1), Conditioning::None);
        }

        // A persistently deep queue eventually requests compression.
        let mut saw_compress = false;
        for _ in 0..2000 {
            if filter.observe(4) == Conditioning::Compress {
                saw_compress = true;
                break;
            }
        }
        assert!(saw_compress);

        filter.corrected(Conditioning::Compress);
        assert!(filter.latency() <= 1.0);
    }
}
