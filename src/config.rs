//! 전송/연결 설정

use std::net::IpAddr;
use std::time::Duration;

use crate::range::Range;
use crate::{DEFAULT_MAX_FILE_CHUNK_SIZE, DEFAULT_UDT_PORT_RANGE_START};

/// 전송 코어 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 다운로드 측이 동시에 걸어두는 최대 RequestPart 수
    /// 업로드 측 대기 큐 상한은 이 값의 5배
    pub max_requests_queued: usize,

    /// FileChunk 한 개의 최대 크기 (바이트)
    pub max_file_chunk_size: u64,

    /// 업로드 측 요청 대기 타임아웃 (밀리초)
    /// 이 시간 동안 요청이 없으면 업로드 종료
    pub part_request_timeout_ms: u64,

    /// 다운로드 측 메시지 대기 타임아웃 (밀리초)
    pub download_timeout_ms: u64,

    /// NAT 통과 핸드쉐이크 응답 대기 타임아웃 (밀리초)
    pub udt_connection_timeout_ms: u64,

    /// 홀 펀칭 프로브 교환 타임아웃 (밀리초)
    pub udt_rendezvous_timeout_ms: u64,

    /// NAT 통과 소켓용 포트 범위
    pub udt_port_range: Range,

    /// 바인드 주소 (None 이면 모든 인터페이스)
    pub bind_address: Option<IpAddr>,

    /// NAT 통과 연결 수락 여부
    pub udt_connections_enabled: bool,

    /// 동시 업로드 수
    pub max_concurrent_uploads: usize,

    /// 동시 다운로드 수
    pub max_concurrent_downloads: usize,

    /// 부분 전송(parts record 교환)을 허용하는 최소 파일 크기
    pub min_size_for_part_transfers: u64,

    /// parts record 최소 블록 크기
    pub record_min_block_size: u32,

    /// parts record 최대 블록 수 (초과 시 블록 크기를 키움)
    pub record_max_blocks: u32,

    /// parts record 최대 블록 크기. 상대 record 도 이 값을 넘으면 거부한다.
    pub record_max_block_size: u32,

    /// 블록 해시 워커 수 (0이면 CPU 코어 수 사용)
    pub hash_workers: usize,

    /// 업로드 속도 제한 (bytes/sec, 0이면 무제한)
    pub upload_rate_limit: u64,

    /// 세션 상태 점검 주기 (밀리초)
    pub health_check_interval_ms: u64,

    /// 전송 속도 측정 윈도우 (청크 수)
    pub stats_window_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_requests_queued: 15,
            max_file_chunk_size: DEFAULT_MAX_FILE_CHUNK_SIZE,
            part_request_timeout_ms: 60_000,       // 1분
            download_timeout_ms: 60_000,           // 1분
            udt_connection_timeout_ms: 30_000,     // 30초
            udt_rendezvous_timeout_ms: 10_000,     // 10초
            udt_port_range: Range::new(DEFAULT_UDT_PORT_RANGE_START, 100),
            bind_address: None,
            udt_connections_enabled: true,
            max_concurrent_uploads: 8,
            max_concurrent_downloads: 16,
            min_size_for_part_transfers: 8 * 1024, // 8KB
            record_min_block_size: 4 * 1024,       // 4KB
            record_max_blocks: 16 * 1024,
            record_max_block_size: 16 * 1024 * 1024, // 16MB
            hash_workers: 0,                       // CPU 코어 수 사용
            upload_rate_limit: 0,                  // 무제한
            health_check_interval_ms: 15_000,      // 15초
            stats_window_size: 100,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 업로드 측 대기 큐 상한
    pub fn max_pending_requests(&self) -> usize {
        self.max_requests_queued * 5
    }

    pub fn part_request_timeout(&self) -> Duration {
        Duration::from_millis(self.part_request_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn udt_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.udt_connection_timeout_ms)
    }

    pub fn udt_rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.udt_rendezvous_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// 파일 크기에 맞는 parts record 블록 크기
    ///
    /// 최소 블록 크기에서 시작해 블록 수가 상한 이하가 될 때까지 두 배씩 키운다.
    pub fn record_block_size(&self, file_size: u64) -> u32 {
        let max_block = self.record_max_block_size.max(1) as u64;
        let mut block = (self.record_min_block_size.max(1) as u64).min(max_block);
        let max_blocks = self.record_max_blocks.max(1) as u64;
        while file_size.div_ceil(block) > max_blocks && block * 2 <= max_block {
            block *= 2;
        }
        block as u32
    }

    /// LAN 용 설정 (큰 청크, 많은 동시 요청)
    pub fn lan() -> Self {
        Self {
            max_requests_queued: 40,
            max_file_chunk_size: 128 * 1024,   // 128KB
            udt_connections_enabled: false,    // LAN 에서는 직접 연결
            max_concurrent_uploads: 16,
            max_concurrent_downloads: 32,
            ..Self::default()
        }
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            max_requests_queued: 5,
            max_file_chunk_size: 16 * 1024,    // 16KB
            max_concurrent_uploads: 2,
            max_concurrent_downloads: 4,
            record_max_blocks: 4 * 1024,
            hash_workers: 1,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_requests_queued: 8,
            max_file_chunk_size: 16 * 1024,
            part_request_timeout_ms: 120_000,  // 2분
            download_timeout_ms: 120_000,
            udt_connection_timeout_ms: 60_000,
            udt_rendezvous_timeout_ms: 20_000,
            health_check_interval_ms: 30_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_bound() {
        let config = Config::default();
        assert_eq!(config.max_pending_requests(), 75);
    }

    #[test]
    fn test_record_block_size_grows() {
        let config = Config {
            record_min_block_size: 4096,
            record_max_blocks: 4,
            ..Config::default()
        };
        assert_eq!(config.record_block_size(10_000), 4096);
        assert_eq!(config.record_block_size(4 * 4096), 4096);
        assert_eq!(config.record_block_size(4 * 4096 + 1), 8192);
        assert_eq!(config.record_block_size(0), 4096);
    }

    #[test]
    fn test_record_block_size_capped() {
        let config = Config {
            record_min_block_size: 4096,
            record_max_blocks: 4,
            record_max_block_size: 16 * 1024,
            ..Config::default()
        };
        assert_eq!(config.record_block_size(1024 * 1024), 16 * 1024);
        assert_eq!(config.record_block_size(u64::MAX), 16 * 1024);
    }
}
