//! 바이트/포트 구간 정의
//!
//! - Range: 시작 + 길이로 표현한 구간 (파일 바이트 범위, 포트 범위 공용)
//! - RangeSet: 겹치는 구간을 병합해 보관하는 집합 (수신 완료 영역 추적용)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 구간 `[start, start + length)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub length: u64,
}

impl Range {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// 양 끝을 포함하는 두 수로 구간 생성
    pub fn by_numbers(first: u64, last: u64) -> Self {
        let (lo, hi) = if first <= last { (first, last) } else { (last, first) };
        Self::new(lo, (hi - lo).saturating_add(1))
    }

    /// 끝 (exclusive). u64 를 넘으면 u64::MAX 로 고정.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// 끝 (exclusive). 상대가 보낸 구간은 이것으로 검사한다.
    pub fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value < self.end()
    }

    pub fn contains_range(&self, other: &Range) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// 두 구간의 교집합
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| Range::new(start, end - start))
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// 병합된 구간 집합
///
/// 내부적으로 `start -> end(exclusive)` 맵을 유지하며 인접/겹침 구간은 항상 하나로 합친다.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    spans: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 구간 추가 (겹치거나 맞닿은 구간과 병합)
    pub fn insert(&mut self, range: Range) {
        if range.is_empty() {
            return;
        }
        let mut start = range.start;
        let mut end = range.end();

        // 왼쪽 이웃과 병합
        if let Some((&s, &e)) = self.spans.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.spans.remove(&s);
            }
        }

        // 오른쪽으로 겹치는 구간 흡수
        let absorbed: Vec<(u64, u64)> = self
            .spans
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            end = end.max(e);
            self.spans.remove(&s);
        }

        self.spans.insert(start, end);
    }

    /// 구간 전체가 포함되어 있는지
    pub fn contains(&self, range: &Range) -> bool {
        if range.is_empty() {
            return true;
        }
        match self.spans.range(..=range.start).next_back() {
            Some((_, &e)) => e >= range.end(),
            None => false,
        }
    }

    /// 포함된 총 바이트 수
    pub fn covered(&self) -> u64 {
        self.spans.iter().map(|(s, e)| e - s).sum()
    }

    /// `within` 안에서 아직 포함되지 않은 첫 구간
    pub fn first_gap(&self, within: Range) -> Option<Range> {
        let mut cursor = within.start;
        for (&s, &e) in self.spans.range(..within.end()) {
            if e <= cursor {
                continue;
            }
            if s > cursor {
                return Some(Range::new(cursor, s.min(within.end()) - cursor));
            }
            cursor = e;
            if cursor >= within.end() {
                return None;
            }
        }
        (cursor < within.end()).then(|| Range::new(cursor, within.end() - cursor))
    }

    /// `within` 안의 모든 빈 구간
    pub fn gaps(&self, within: Range) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = within.start;
        while let Some(gap) = self.first_gap(Range::new(cursor, within.end() - cursor)) {
            cursor = gap.end();
            gaps.push(gap);
            if cursor >= within.end() {
                break;
            }
        }
        gaps
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range> + '_ {
        self.spans.iter().map(|(&s, &e)| Range::new(s, e - s))
    }
}
