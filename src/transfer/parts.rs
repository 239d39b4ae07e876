//! 다운로드 측 구간 추적
//!
//! 받은 구간, 요청 중인 구간을 기록해 다음에 요청할 구간을 고른다.

use crate::range::{Range, RangeSet};

/// 청크 수신 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 새로 채운 바이트가 있음
    New,
    /// 이미 받은 구간 (버림)
    Duplicate,
}

#[derive(Debug)]
pub struct PartsTracker {
    size: u64,
    filled: RangeSet,
    /// 요청했지만 아직 다 받지 못한 구간
    outstanding: Vec<Range>,
    /// 요청해야 할 구간 (None 이면 파일 전체)
    wanted: Option<Vec<Range>>,
}

impl PartsTracker {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            filled: RangeSet::new(),
            outstanding: Vec::new(),
            wanted: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 로컬에서 이미 확보한 구간 표시
    pub fn mark_filled(&mut self, range: Range) {
        if !range.is_empty() {
            self.filled.insert(range);
        }
    }

    /// 요청할 구간을 제한 (delta 매칭 결과)
    pub fn restrict_to(&mut self, missing: Vec<Range>) {
        self.wanted = Some(missing);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn received_bytes(&self) -> u64 {
        self.filled.covered()
    }

    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            self.received_bytes() as f64 / self.size as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled.first_gap(Range::new(0, self.size)).is_none()
    }

    /// 아직 받지도, 요청하지도 않은 첫 구간 (최대 `max_len`)
    pub fn next_request(&mut self, max_len: u64) -> Option<Range> {
        let max_len = max_len.max(1);
        let whole = Range::new(0, self.size);
        let areas = match &self.wanted {
            Some(wanted) => wanted.clone(),
            None => vec![whole],
        };

        for area in areas {
            let Some(area) = area.intersection(&whole) else {
                continue;
            };
            for gap in self.filled.gaps(area) {
                if let Some(range) = self.first_unrequested(gap, max_len) {
                    self.outstanding.push(range);
                    return Some(range);
                }
            }
        }
        None
    }

    fn first_unrequested(&self, gap: Range, max_len: u64) -> Option<Range> {
        let mut start = gap.start;
        while start < gap.end() {
            match self
                .outstanding
                .iter()
                .filter(|r| r.contains(start))
                .map(|r| r.end())
                .max()
            {
                Some(end) => start = end,
                None => {
                    // 다음 요청 구간 시작 전까지만
                    let limit = self
                        .outstanding
                        .iter()
                        .map(|r| r.start)
                        .filter(|s| *s > start)
                        .min()
                        .unwrap_or(u64::MAX)
                        .min(gap.end());
                    let length = (limit - start).min(max_len);
                    return Some(Range::new(start, length));
                }
            }
        }
        None
    }

    /// 청크 수신 기록
    pub fn on_chunk(&mut self, range: Range) -> ChunkOutcome {
        if range.is_empty() || self.filled.contains(&range) {
            self.outstanding.retain(|r| !range.contains_range(r));
            return ChunkOutcome::Duplicate;
        }
        self.filled.insert(range);

        let filled = &self.filled;
        self.outstanding.retain(|r| !filled.contains(r));
        ChunkOutcome::New
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_requests_cover_file() {
        let mut tracker = PartsTracker::new(10_000);
        let mut requested = Vec::new();
        while let Some(range) = tracker.next_request(3_000) {
            requested.push(range);
        }
        assert_eq!(
            requested,
            vec![
                Range::new(0, 3_000),
                Range::new(3_000, 3_000),
                Range::new(6_000, 3_000),
                Range::new(9_000, 1_000),
            ]
        );
        assert_eq!(tracker.outstanding(), 4);
    }

    #[test]
    fn test_out_of_order_reconstruction() {
        let original: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut tracker = PartsTracker::new(original.len() as u64);

        let mut ranges = Vec::new();
        while let Some(range) = tracker.next_request(777) {
            ranges.push(range);
        }
        ranges.shuffle(&mut rand::thread_rng());

        let mut rebuilt = vec![0u8; original.len()];
        for range in &ranges {
            let (start, end) = (range.start as usize, range.end() as usize);
            assert_eq!(tracker.on_chunk(*range), ChunkOutcome::New);
            rebuilt[start..end].copy_from_slice(&original[start..end]);
        }

        assert!(tracker.is_complete());
        assert_eq!(rebuilt, original);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_chunk_discarded() {
        let mut tracker = PartsTracker::new(100);
        let range = tracker.next_request(50).unwrap();
        assert_eq!(tracker.on_chunk(range), ChunkOutcome::New);
        assert_eq!(tracker.on_chunk(range), ChunkOutcome::Duplicate);
        assert_eq!(tracker.received_bytes(), 50);
    }

    #[test]
    fn test_restricted_to_missing() {
        let mut tracker = PartsTracker::new(1_000);
        tracker.mark_filled(Range::new(0, 400));
        tracker.mark_filled(Range::new(600, 400));
        tracker.restrict_to(vec![Range::new(400, 200)]);

        assert_eq!(tracker.next_request(1_000), Some(Range::new(400, 200)));
        assert_eq!(tracker.next_request(1_000), None);
        tracker.on_chunk(Range::new(400, 200));
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_identical_basis_needs_nothing() {
        let mut tracker = PartsTracker::new(1_000);
        tracker.mark_filled(Range::new(0, 1_000));
        tracker.restrict_to(Vec::new());
        assert_eq!(tracker.next_request(100), None);
        assert!(tracker.is_complete());
    }
}
