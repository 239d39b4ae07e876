//! 업로드 대역폭 제한 (토큰 버킷 pacing)

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct Bucket {
    /// 현재 사용 가능한 바이트 (음수면 빚)
    available: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct BandwidthLimiter {
    /// bytes/sec, 0 이면 무제한
    rate: u64,

    /// 최대 누적 버스트 (1초 분량)
    burst: f64,

    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            burst: rate as f64,
            bucket: Mutex::new(Bucket {
                available: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    // 호출 위치: 청크 전송 직전
    pub async fn acquire(&self, bytes: usize) {
        let delay = self.reserve(bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// 토큰을 미리 차감하고 기다려야 할 시간을 돌려준다
    pub fn reserve(&self, bytes: usize) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let dt = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.available = (bucket.available + dt * self.rate as f64).min(self.burst);
        bucket.last_refill = now;

        bucket.available -= bytes as f64;
        if bucket.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.available / self.rate as f64)
        }
    }
}
