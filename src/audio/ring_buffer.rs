use ringbuf::traits::{Consumer, Observer, RingBuffer as _};
use ringbuf::HeapRb;

/// Fixed-capacity sample FIFO used between the resamplers and the model.
///
/// Pushing never blocks: when the buffer is full the oldest unread samples
/// are overwritten and reading resumes at the oldest retained sample.
/// Popping more than is available returns what there is and can zero-fill
/// the rest of the destination.
pub struct RingBuffer {
    inner: HeapRb<f32>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: HeapRb::new(capacity.max(1)),
        }
    }

    /// Reallocate with a new capacity, discarding contents
    pub fn resize(&mut self, capacity: usize) {
        self.inner = HeapRb::new(capacity.max(1));
    }

    /// Discard contents without reallocating
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    /// Samples waiting to be popped
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Append samples, overwriting the oldest unread ones on overflow.
    ///
    /// Only the last `capacity` samples of an oversized push are kept.
    pub fn push(&mut self, data: &[f32]) {
        let capacity = self.capacity();
        let data = if data.len() > capacity {
            &data[data.len() - capacity..]
        } else {
            data
        };
        self.inner.push_slice_overwrite(data);
    }

    /// Push `count` zeros
    pub fn push_silence(&mut self, count: usize) {
        for _ in 0..count.min(self.capacity()) {
            let _ = self.inner.push_overwrite(0.0);
        }
    }

    /// Pop up to `dest.len()` samples into `dest`, returning how many were read.
    ///
    /// With `fill_with_zeros` the unread tail of `dest` is zeroed.
    pub fn pop(&mut self, dest: &mut [f32], fill_with_zeros: bool) -> usize {
        let read = self.inner.pop_slice(dest);
        if fill_with_zeros {
            dest[read..].fill(0.0);
        }
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_pop_in_order() {
        let mut rb = RingBuffer::new(8);
        rb.push(&[1.0, 2.0, 3.0]);
        assert_eq!(rb.available(), 3);

        let mut out = [0.0; 2];
        assert_eq!(rb.pop(&mut out, false), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(rb.available(), 1);
    }

    #[test]
    fn test_wraps_around() {
        let mut rb = RingBuffer::new(4);
        let mut out = [0.0; 3];
        rb.push(&[1.0, 2.0, 3.0]);
        rb.pop(&mut out, false);
        rb.push(&[4.0, 5.0, 6.0]);
        assert_eq!(rb.pop(&mut out, false), 3);
        assert_eq!(out, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut rb = RingBuffer::new(4);
        rb.push(&[1.0, 2.0, 3.0]);
        rb.push(&[4.0, 5.0, 6.0]);
        assert_eq!(rb.available(), 4);

        let mut out = [0.0; 4];
        rb.pop(&mut out, false);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_oversized_push_keeps_tail() {
        let mut rb = RingBuffer::new(3);
        rb.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut out = [0.0; 3];
        assert_eq!(rb.pop(&mut out, false), 3);
        assert_eq!(out, [3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_underrun_zero_fills() {
        let mut rb = RingBuffer::new(8);
        rb.push(&[0.5, 0.5]);
        let mut out = [9.0; 5];
        assert_eq!(rb.pop(&mut out, true), 2);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_underrun_without_fill_leaves_tail() {
        let mut rb = RingBuffer::new(8);
        rb.push(&[0.5]);
        let mut out = [9.0; 3];
        assert_eq!(rb.pop(&mut out, false), 1);
        assert_eq!(out, [0.5, 9.0, 9.0]);
    }

    #[test]
    fn test_clear_and_resize() {
        let mut rb = RingBuffer::new(8);
        rb.push(&[1.0; 6]);
        rb.clear();
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.capacity(), 8);

        rb.resize(0);
        assert_eq!(rb.capacity(), 1);
        rb.resize(16);
        assert_eq!(rb.capacity(), 16);
        assert_eq!(rb.available(), 0);
    }

    #[test]
    fn test_push_silence() {
        let mut rb = RingBuffer::new(4);
        rb.push(&[1.0]);
        rb.push_silence(2);
        let mut out = [9.0; 3];
        rb.pop(&mut out, false);
        assert_eq!(out, [1.0, 0.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_keeps_most_recent_capacity_samples(
            capacity in 1usize..64,
            pushes in proptest::collection::vec(proptest::collection::vec(-1.0f32..1.0, 0..40), 1..20)
        ) {
            let mut rb = RingBuffer::new(capacity);
            let mut history: Vec<f32> = Vec::new();

            for chunk in &pushes {
                rb.push(chunk);
                history.extend_from_slice(chunk);
                prop_assert!(rb.available() <= capacity);
            }

            let expected_len = history.len().min(capacity);
            prop_assert_eq!(rb.available(), expected_len);

            let mut out = vec![0.0f32; expected_len];
            rb.pop(&mut out, false);
            prop_assert_eq!(&out[..], &history[history.len() - expected_len..]);
        }
    }
}
