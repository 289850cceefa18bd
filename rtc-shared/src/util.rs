/// Unwraps 16-bit RTP sequence numbers into a monotonic 64-bit space.
///
/// A step of more than half the sequence space is taken as a wrap in the
/// other direction.
#[derive(Default, Debug, Copy, Clone)]
pub struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    /// Unwraps `seq` relative to the last unwrapped value and remembers it.
    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = self.peek_unwrap(seq);
        self.last_unwrapped = Some(unwrapped);
        unwrapped
    }

    /// Unwraps `seq` without updating the reference point.
    pub fn peek_unwrap(&self, seq: u16) -> i64 {
        match self.last_unwrapped {
            None => seq as i64,
            Some(last) => {
                let last_seq = last & 0xFFFF;
                let mut diff = seq as i64 - last_seq;

                if diff > 0x8000 {
                    diff -= 0x10000;
                } else if diff < -0x8000 {
                    diff += 0x10000;
                }

                last + diff
            }
        }
    }

    pub fn last_unwrapped(&self) -> Option<i64> {
        self.last_unwrapped
    }

    pub fn reset(&mut self) {
        self.last_unwrapped = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_forward_wrap() {
        let mut u = SequenceUnwrapper::new();
        assert_eq!(u.unwrap(65534), 65534);
        assert_eq!(u.unwrap(65535), 65535);
        assert_eq!(u.unwrap(0), 65536);
        assert_eq!(u.unwrap(2), 65538);
    }

    #[test]
    fn test_unwrap_backward() {
        let mut u = SequenceUnwrapper::new();
        assert_eq!(u.unwrap(1), 1);
        assert_eq!(u.unwrap(65535), -1);
        assert_eq!(u.unwrap(3), 3);
    }

    #[test]
    fn test_peek_does_not_move() {
        let mut u = SequenceUnwrapper::new();
        u.unwrap(65535);
        assert_eq!(u.peek_unwrap(1), 65537);
        assert_eq!(u.peek_unwrap(65000), 65000);
        assert_eq!(u.last_unwrapped(), Some(65535));
    }
}
