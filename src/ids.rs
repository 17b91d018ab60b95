use crate::error::SegmenterError;
use std::sync::atomic::{AtomicU32, Ordering};

/// Issues segment labels unique across all workers of one run.
///
/// Label 0 is the background value and never issued. The counter fails instead of wrapping.
#[derive(Debug, Default)]
pub struct SegmentIdAllocator {
    last: AtomicU32,
}

impl SegmentIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every issued label. Only valid between runs.
    pub fn reset(&self) {
        self.last.store(0, Ordering::Release);
    }

    pub fn next_id(&self) -> Result<u32, SegmenterError> {
        self.next_ids(1)
    }

    /// Reserve `count` consecutive labels, returning the first. `count` must not be 0.
    pub fn next_ids(&self, count: u32) -> Result<u32, SegmenterError> {
        if count == 0 {
            return Err(SegmenterError::LabelsExhausted);
        }
        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                last.checked_add(count)
            })
            .map(|previous| previous + 1)
            .map_err(|_| SegmenterError::LabelsExhausted)
    }

    /// Number of labels issued so far, equal to the highest label.
    pub fn issued(&self) -> u32 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_under_contention() {
        let ids = SegmentIdAllocator::new();
        let all = parking_lot::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for t in 0..8u32 {
                let ids = &ids;
                let all = &all;
                s.spawn(move || {
                    let mut local = Vec::new();
                    for i in 0..1000u32 {
                        if (i + t) % 3 == 0 {
                            let first = ids.next_ids(4).unwrap();
                            local.extend(first..first + 4);
                        } else {
                            local.push(ids.next_id().unwrap());
                        }
                    }
                    all.lock().extend(local);
                });
            }
        });
        let all = all.into_inner();
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert!(!unique.contains(&0));
        assert_eq!(ids.issued() as usize, all.len());
    }

    #[test]
    fn exhaustion_is_an_error() {
        let ids = SegmentIdAllocator::new();
        assert_eq!(ids.next_id(), Ok(1));
        assert_eq!(ids.next_ids(u32::MAX - 2), Ok(2));
        assert_eq!(ids.issued(), u32::MAX - 1);
        assert_eq!(ids.next_id(), Ok(u32::MAX));
        assert_eq!(ids.next_id(), Err(SegmenterError::LabelsExhausted));
        ids.reset();
        assert_eq!(ids.next_id(), Ok(1));
    }
}
