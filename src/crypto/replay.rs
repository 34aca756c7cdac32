//! Anti-replay sliding window over record sequence numbers.

/// Window size in bits.
pub const REPLAY_WINDOW_SIZE: usize = 1024;

const WORDS: usize = REPLAY_WINDOW_SIZE / 64;

/// Anti-replay sliding window.
///
/// Bit `i` of the bitmap records sequence number `highest - i`. Records of
/// one key context may arrive on different paths, so moderately reordered
/// sequence numbers are accepted once.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: [u64; WORDS],
    highest: u64,
    initialized: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            highest: 0,
            initialized: false,
        }
    }

    /// Whether `seq` was already seen or is below the window.
    pub fn is_replay(&self, seq: u64) -> bool {
        if !self.initialized || seq > self.highest {
            return false;
        }
        let diff = self.highest - seq;
        if diff >= REPLAY_WINDOW_SIZE as u64 {
            return true;
        }
        let bit = diff as usize;
        self.bitmap[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Record `seq` as seen. Call only after the record authenticated.
    pub fn mark(&mut self, seq: u64) {
        if !self.initialized {
            self.initialized = true;
            self.highest = seq;
        } else if seq > self.highest {
            self.shift(seq - self.highest);
            self.highest = seq;
        }
        let diff = self.highest - seq;
        if diff < REPLAY_WINDOW_SIZE as u64 {
            let bit = diff as usize;
            self.bitmap[bit / 64] |= 1 << (bit % 64);
        }
    }

    fn shift(&mut self, by: u64) {
        if by >= REPLAY_WINDOW_SIZE as u64 {
            self.bitmap = [0; WORDS];
            return;
        }
        let words = (by / 64) as usize;
        let bits = (by % 64) as u32;

        for i in (0..WORDS).rev() {
            let lo = i.checked_sub(words).map_or(0, |j| self.bitmap[j]);
            let carry = match i.checked_sub(words + 1) {
                Some(j) if bits > 0 => self.bitmap[j] >> (64 - bits),
                _ => 0,
            };
            self.bitmap[i] = if bits > 0 { (lo << bits) | carry } else { lo };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let mut w = ReplayWindow::new();
        for seq in 0..200 {
            assert!(!w.is_replay(seq));
            w.mark(seq);
            assert!(w.is_replay(seq));
        }
    }

    #[test]
    fn test_reordered_accepted_once() {
        let mut w = ReplayWindow::new();
        w.mark(0);
        w.mark(5);
        assert!(!w.is_replay(3));
        w.mark(3);
        assert!(w.is_replay(3));
        assert!(!w.is_replay(4));
        assert!(w.is_replay(0));
    }

    #[test]
    fn test_shift_across_words() {
        let mut w = ReplayWindow::new();
        w.mark(10);
        w.mark(10 + 70);
        assert!(w.is_replay(10));
        assert!(!w.is_replay(11));

        w.mark(10 + 200);
        assert!(w.is_replay(10));
        assert!(w.is_replay(80));
        assert!(!w.is_replay(79));
    }

    #[test]
    fn test_below_window_rejected() {
        let mut w = ReplayWindow::new();
        w.mark(0);
        w.mark(REPLAY_WINDOW_SIZE as u64 + 10);
        assert!(w.is_replay(5));
    }
}
