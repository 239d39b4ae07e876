//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 청크 전송 기록
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    timestamp: Instant,
    size: usize,
}

/// 세션 하나(또는 한 방향 전체)의 바이트 카운터
#[derive(Debug, Clone)]
pub struct TransferCounter {
    /// 최근 청크 기록
    recent: VecDeque<ChunkRecord>,

    /// 윈도우 크기
    window_size: usize,

    /// 총 청크 수
    pub total_chunks: u64,

    /// 총 바이트
    pub total_bytes: u64,

    /// 시작 시간
    started: Instant,
}

impl TransferCounter {
    pub fn new(window_size: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
            total_chunks: 0,
            total_bytes: 0,
            started: Instant::now(),
        }
    }

    /// 청크 하나 전송/수신 기록
    pub fn chunk_transferred(&mut self, size: usize) {
        if self.recent.len() >= self.window_size {
            self.recent.pop_front();
        }
        self.recent.push_back(ChunkRecord {
            timestamp: Instant::now(),
            size,
        });

        self.total_chunks += 1;
        self.total_bytes += size as u64;
    }

    /// 최근 윈도우 기준 처리율 (bytes/sec)
    pub fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.recent.front(), self.recent.back()) else {
            return 0.0;
        };
        let duration = last.timestamp.duration_since(first.timestamp);
        if self.recent.len() < 2 || duration.is_zero() {
            return 0.0;
        }

        // 첫 기록은 구간 시작점이므로 제외
        let total_size: usize = self.recent.iter().skip(1).map(|r| r.size).sum();
        total_size as f64 / duration.as_secs_f64()
    }

    /// 시작 후 평균 처리율 (bytes/sec)
    pub fn average_rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for TransferCounter {
    fn default() -> Self {
        Self::new(100)
    }
}

/// 전송 코디네이터 전체 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 업로드 방향 카운터
    pub upload: TransferCounter,

    /// 다운로드 방향 카운터
    pub download: TransferCounter,

    pub completed_uploads: u64,
    pub completed_downloads: u64,
    pub broken_transfers: u64,
    pub aborted_transfers: u64,

    /// 로컬 매칭으로 재사용한 바이트 (delta 로 아낀 전송량)
    pub reused_bytes: u64,
}

impl TransferStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            start_time: Instant::now(),
            upload: TransferCounter::new(window_size),
            download: TransferCounter::new(window_size),
            completed_uploads: 0,
            completed_downloads: 0,
            broken_transfers: 0,
            aborted_transfers: 0,
            reused_bytes: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Up: {} bytes ({:.2} MB/s) | Down: {} bytes ({:.2} MB/s) | Reused: {} bytes | Completed: {}/{} | Broken: {} | Aborted: {}",
            self.elapsed().as_secs_f64(),
            self.upload.total_bytes,
            self.upload.rate() / 1_000_000.0,
            self.download.total_bytes,
            self.download.rate() / 1_000_000.0,
            self.reused_bytes,
            self.completed_uploads,
            self.completed_downloads,
            self.broken_transfers,
            self.aborted_transfers,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(100)
    }
}
