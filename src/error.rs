//! 에러 타입 정의

use std::path::PathBuf;

use thiserror::Error;

use crate::peer::PeerId;

/// 전송/연결 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    /// 청크 전송 중 발생한 I/O 또는 프로토콜 위반
    #[error("전송 실패: {0}")]
    Transfer(String),

    #[error("파일 없음: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("사용 가능한 UDT 포트 없음")]
    NoPortsAvailable,

    #[error("{target} 연결용 릴레이 없음")]
    NoRelay { target: PeerId },

    #[error("자기 자신으로의 릴레이 연결 시도")]
    LoopbackConnection,

    #[error("UDT 포트 선택 실패")]
    PortSelectionFailed,

    #[error("이미 {0} 에 연결 시도 중")]
    AlreadyConnecting(PeerId),

    #[error("{0} 가 연결을 거부함")]
    ConnectionRefused(PeerId),

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("{0} 응답 대기 타임아웃")]
    Timeout(PeerId),

    #[error("{0} 에 연결되어 있지 않음")]
    NotConnected(PeerId),

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 세션이 깨질 때 보고할 사유 코드
    pub fn problem(&self) -> TransferProblem {
        match self {
            Error::FileNotFound(_) => TransferProblem::FileNotFound,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                TransferProblem::FileNotFound
            }
            Error::Io(_) => TransferProblem::IoException,
            Error::NotConnected(_) | Error::ConnectionClosed => TransferProblem::Disconnected,
            _ => TransferProblem::TransferException,
        }
    }
}

/// 전송 세션 중단 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferProblem {
    /// 청크 전송 중 일반 I/O 또는 프로토콜 위반
    TransferException,
    /// 잘못되었거나 현재 파일과 맞지 않는 RequestPart
    InvalidPart,
    FileNotFound,
    IoException,
    /// 예: 부분 전송 대상이 아닌 작은 파일에 대한 parts record 요청
    GeneralException,
    /// 상대가 더 이상 이 전송을 대기열에 두지 않음
    NotQueuedAtPartner,
    Disconnected,
}

impl std::fmt::Display for TransferProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferProblem::TransferException => "TRANSFER_EXCEPTION",
            TransferProblem::InvalidPart => "INVALID_PART",
            TransferProblem::FileNotFound => "FILE_NOT_FOUND",
            TransferProblem::IoException => "IO_EXCEPTION",
            TransferProblem::GeneralException => "GENERAL_EXCEPTION",
            TransferProblem::NotQueuedAtPartner => "NOT_QUEUED_AT_PARTNER",
            TransferProblem::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
