// # Sorted Point Buffer - Ingest Staging
//
// Accepts up to `capacity` unsorted key/value pairs, then emits them in
// non-decreasing key order. Payload bytes never move: the sort permutes two
// parallel index arrays with a bottom-up merge, alternating direction each
// level. When a merge segment is already ordered (the dominant case for the
// near-sorted batches replay produces) the segment is copied verbatim after
// a single comparison.

use crate::error::{ArchiveError, Result};
use crate::record::{FixedRecord, SortableKey, TreeStream};
use std::marker::PhantomData;

/// Two-phase life of the buffer: filling, then draining in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Writing,
    Reading,
}

pub struct SortedPointBuffer<K: SortableKey, V: FixedRecord> {
    keys: Vec<u8>,
    values: Vec<u8>,
    index_a: Vec<u32>,
    index_b: Vec<u32>,
    count: usize,
    capacity: usize,
    dequeue: usize,
    mode: BufferMode,
    end_of_stream: bool,
    _records: PhantomData<(K, V)>,
}

impl<K: SortableKey, V: FixedRecord> SortedPointBuffer<K, V> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(ArchiveError::InvalidInput(format!(
                "sorted buffer capacity {} out of range",
                capacity
            )));
        }
        Ok(Self {
            keys: vec![0; capacity * K::SIZE],
            values: vec![0; capacity * V::SIZE],
            index_a: vec![0; capacity],
            index_b: vec![0; capacity],
            count: 0,
            capacity,
            dequeue: 0,
            mode: BufferMode::Writing,
            end_of_stream: false,
            _records: PhantomData,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Append a pair. `Ok(false)` when the buffer is full; enqueueing while
    /// draining is a mode violation.
    pub fn try_enqueue(&mut self, key: &K, value: &V) -> Result<bool> {
        if self.mode != BufferMode::Writing {
            return Err(ArchiveError::ModeViolation(
                "enqueue while buffer is reading".to_string(),
            ));
        }
        if self.count == self.capacity {
            return Ok(false);
        }
        unsafe {
            key.write_ptr(self.keys.as_mut_ptr().add(self.count * K::SIZE));
            value.write_ptr(self.values.as_mut_ptr().add(self.count * V::SIZE));
        }
        self.count += 1;
        Ok(true)
    }

    /// Switch phases. Entering Reading sorts the buffer; returning to
    /// Writing clears it.
    pub fn set_mode(&mut self, mode: BufferMode) {
        if mode == self.mode {
            return;
        }
        match mode {
            BufferMode::Reading => {
                self.sort();
                self.dequeue = 0;
                self.end_of_stream = false;
                self.mode = BufferMode::Reading;
            }
            BufferMode::Writing => self.clear(),
        }
    }

    /// Drop all entries and return to the Writing phase.
    pub fn clear(&mut self) {
        self.count = 0;
        self.dequeue = 0;
        self.end_of_stream = false;
        self.mode = BufferMode::Writing;
    }

    #[inline]
    fn key_ptr(&self, index: u32) -> *const u8 {
        unsafe { self.keys.as_ptr().add(index as usize * K::SIZE) }
    }

    /// Sort the index arrays; payload bytes stay put.
    fn sort(&mut self) {
        let count = self.count;
        let keys = self.keys.as_ptr();
        let le = |left: u32, right: u32| unsafe {
            K::is_less_or_equal(
                keys.add(left as usize * K::SIZE),
                keys.add(right as usize * K::SIZE),
            )
        };

        // Pairwise init pass: runs of two, directly in order
        let mut x = 0;
        while x + 1 < count {
            if le(x as u32, (x + 1) as u32) {
                self.index_a[x] = x as u32;
                self.index_a[x + 1] = (x + 1) as u32;
            } else {
                self.index_a[x] = (x + 1) as u32;
                self.index_a[x + 1] = x as u32;
            }
            x += 2;
        }
        if count % 2 == 1 {
            self.index_a[count - 1] = (count - 1) as u32;
        }

        // Bottom-up merge, alternating A->B and B->A
        let mut stride = 2;
        let mut in_a = true;
        while stride < count {
            if in_a {
                Self::merge_level(&self.index_a[..count], &mut self.index_b[..count], stride, &le);
            } else {
                Self::merge_level(&self.index_b[..count], &mut self.index_a[..count], stride, &le);
            }
            in_a = !in_a;
            stride *= 2;
        }

        // Reads always go through index A
        if !in_a {
            std::mem::swap(&mut self.index_a, &mut self.index_b);
        }
    }

    fn merge_level(
        source: &[u32],
        destination: &mut [u32],
        stride: usize,
        le: &impl Fn(u32, u32) -> bool,
    ) {
        let count = source.len();
        let mut segment = 0;
        while segment < count {
            let middle = (segment + stride).min(count);
            let end = (segment + 2 * stride).min(count);
            if middle == end || le(source[middle - 1], source[middle]) {
                // Runs already ordered (or a lone tail run): copy verbatim
                destination[segment..end].copy_from_slice(&source[segment..end]);
            } else {
                let mut left = segment;
                let mut right = middle;
                let mut out = segment;
                while left < middle && right < end {
                    if le(source[left], source[right]) {
                        destination[out] = source[left];
                        left += 1;
                    } else {
                        destination[out] = source[right];
                        right += 1;
                    }
                    out += 1;
                }
                destination[out..out + (middle - left)].copy_from_slice(&source[left..middle]);
                let out = out + (middle - left);
                destination[out..out + (end - right)].copy_from_slice(&source[right..end]);
            }
            segment = end;
        }
    }
}

impl<K: SortableKey, V: FixedRecord> TreeStream<K, V> for SortedPointBuffer<K, V> {
    fn read_next(&mut self, key: &mut K, value: &mut V) -> Result<bool> {
        if self.mode != BufferMode::Reading {
            return Err(ArchiveError::ModeViolation(
                "read while buffer is writing".to_string(),
            ));
        }
        if self.end_of_stream || self.dequeue >= self.count {
            self.end_of_stream = true;
            return Ok(false);
        }
        let index = self.index_a[self.dequeue];
        unsafe {
            key.read_ptr(self.key_ptr(index));
            value.read_ptr(self.values.as_ptr().add(index as usize * V::SIZE));
        }
        self.dequeue += 1;
        Ok(true)
    }

    fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    fn set_end_of_stream(&mut self, end_of_stream: bool) {
        self.end_of_stream = end_of_stream;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HistorianKey, HistorianValue};

    fn key(timestamp: u64) -> HistorianKey {
        HistorianKey {
            timestamp,
            point_id: 1,
            entry_number: 0,
        }
    }

    fn value(tag: u64) -> HistorianValue {
        HistorianValue {
            value1: tag,
            value2: 0,
            value3: 0,
        }
    }

    fn drain(buffer: &mut SortedPointBuffer<HistorianKey, HistorianValue>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut k = HistorianKey::default();
        let mut v = HistorianValue::default();
        while buffer.read_next(&mut k, &mut v).unwrap() {
            out.push((k.timestamp, v.value1));
        }
        out
    }

    #[test]
    fn test_sorts_and_tracks_values() {
        let mut buffer = SortedPointBuffer::new(16).unwrap();
        for timestamp in [5u64, 3, 8, 1, 4, 9, 2, 6, 7] {
            assert!(buffer
                .try_enqueue(&key(timestamp), &value(timestamp * 10))
                .unwrap());
        }
        buffer.set_mode(BufferMode::Reading);

        let drained = drain(&mut buffer);
        let expected: Vec<(u64, u64)> = (1..=9).map(|t| (t, t * 10)).collect();
        assert_eq!(drained, expected);
        assert!(buffer.end_of_stream());
    }

    #[test]
    fn test_mode_violations() {
        let mut buffer: SortedPointBuffer<HistorianKey, HistorianValue> =
            SortedPointBuffer::new(4).unwrap();
        let mut k = HistorianKey::default();
        let mut v = HistorianValue::default();
        assert!(matches!(
            buffer.read_next(&mut k, &mut v),
            Err(ArchiveError::ModeViolation(_))
        ));

        buffer.try_enqueue(&key(1), &value(1)).unwrap();
        buffer.set_mode(BufferMode::Reading);
        assert!(matches!(
            buffer.try_enqueue(&key(2), &value(2)),
            Err(ArchiveError::ModeViolation(_))
        ));
    }

    #[test]
    fn test_full_buffer_returns_false() {
        let mut buffer = SortedPointBuffer::new(2).unwrap();
        assert!(buffer.try_enqueue(&key(1), &value(1)).unwrap());
        assert!(buffer.try_enqueue(&key(2), &value(2)).unwrap());
        assert!(!buffer.try_enqueue(&key(3), &value(3)).unwrap());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_clear_returns_to_writing() {
        let mut buffer = SortedPointBuffer::new(4).unwrap();
        buffer.try_enqueue(&key(2), &value(2)).unwrap();
        buffer.set_mode(BufferMode::Reading);
        drain(&mut buffer);

        buffer.set_mode(BufferMode::Writing);
        assert_eq!(buffer.mode(), BufferMode::Writing);
        assert!(buffer.is_empty());
        assert!(buffer.try_enqueue(&key(1), &value(1)).unwrap());
        buffer.set_mode(BufferMode::Reading);
        assert_eq!(drain(&mut buffer), vec![(1, 1)]);
    }

    #[test]
    fn test_duplicate_keys_all_survive() {
        let mut buffer = SortedPointBuffer::new(8).unwrap();
        for tag in 0..3u64 {
            buffer.try_enqueue(&key(7), &value(tag)).unwrap();
        }
        buffer.try_enqueue(&key(3), &value(99)).unwrap();
        buffer.set_mode(BufferMode::Reading);

        let drained = drain(&mut buffer);
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0], (3, 99));
        let mut tags: Vec<u64> = drained[1..].iter().map(|(_, tag)| *tag).collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![0, 1, 2]);
    }

    #[test]
    fn test_random_inputs_sort() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for size in [1usize, 2, 3, 31, 32, 33, 1000] {
            let mut buffer = SortedPointBuffer::new(size).unwrap();
            let mut expected: Vec<u64> = Vec::with_capacity(size);
            for _ in 0..size {
                let timestamp = rng.random_range(0..1_000_000);
                expected.push(timestamp);
                assert!(buffer.try_enqueue(&key(timestamp), &value(timestamp)).unwrap());
            }
            expected.sort_unstable();
            buffer.set_mode(BufferMode::Reading);
            let drained: Vec<u64> = drain(&mut buffer).into_iter().map(|(t, _)| t).collect();
            assert_eq!(drained, expected, "size {}", size);
        }
    }
}
