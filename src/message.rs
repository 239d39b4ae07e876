//! 프로토콜 메시지 정의
//!
//! 전송 세션 메시지와 NAT 통과(UDT) 핸드쉐이크 메시지를 하나의 닫힌 enum 으로 표현.
//! 직렬화는 `MessageHeader` + bincode payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::delta::FilePartsRecord;
use crate::peer::{FileInfo, PeerId};
use crate::range::Range;
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// 직접 채널의 첫 프레임 (노드 식별)
    Identify = 1,

    /// 다운로드 요청 (클라이언트 → 서버)
    RequestDownload = 2,

    /// 업로드 시작 알림 (서버 → 클라이언트)
    StartUpload = 3,

    /// 업로드 종료 (클라이언트 → 서버)
    StopUpload = 4,

    /// 업로드 중단 알림 (서버 → 클라이언트)
    AbortUpload = 5,

    /// 다운로드 중단 알림 (클라이언트 → 서버)
    AbortDownload = 6,

    /// 바이트 구간 요청
    RequestPart = 7,

    /// 요청된 바이트 전달
    FileChunk = 8,

    /// 블록 체크섬 목록 요청
    RequestFilePartsRecord = 9,

    /// 블록 체크섬 목록 응답
    ReplyFilePartsRecord = 10,

    /// NAT 통과 핸드쉐이크 (SYN/ACK/NACK)
    Udt = 11,
}

/// 메시지 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 메시지 길이 (헤더 제외)
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub peer: PeerId,
}

/// 다운로드 요청. 수신 측은 이 요청으로 업로드 세션을 만든다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDownload {
    pub file: FileInfo,
    pub start_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartUpload {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopUpload {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortUpload {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortDownload {
    pub file: FileInfo,
}

/// 바이트 구간 요청
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPart {
    pub file: FileInfo,
    pub range: Range,

    /// 다운로드 측 진행률 힌트 (0.0 ~ 1.0)
    pub progress: f64,
}

impl RequestPart {
    pub fn new(file: FileInfo, range: Range, progress: f64) -> Self {
        Self {
            file,
            range,
            progress,
        }
    }

    /// 같은 파일의 같은 구간 요청인지 (진행률 힌트 무시)
    pub fn same_request(&self, other: &RequestPart) -> bool {
        self.range == other.range && self.file == other.file
    }
}

/// 파일 데이터 조각
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file: FileInfo,

    /// 파일 내 오프셋
    pub offset: u64,

    /// 실제 데이터
    pub data: Bytes,

    /// CRC32 체크섬
    pub crc32: u32,
}

impl FileChunk {
    pub fn new(file: FileInfo, offset: u64, data: Bytes) -> Self {
        let crc32 = crc32fast::hash(&data);
        Self {
            file,
            offset,
            data,
            crc32,
        }
    }

    /// 이 청크가 덮는 구간
    pub fn range(&self) -> Range {
        Range::new(self.offset, self.data.len() as u64)
    }

    /// CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc32fast::hash(&self.data) == self.crc32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilePartsRecord {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFilePartsRecord {
    pub file: FileInfo,
    pub record: FilePartsRecord,
}

/// NAT 통과 핸드쉐이크 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UdtKind {
    Syn,
    Ack,
    Nack,
}

/// NAT 통과 핸드쉐이크 메시지
///
/// 릴레이 노드를 거쳐 `destination` 까지 전달된다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdtMessage {
    pub kind: UdtKind,

    /// 보낸 노드 (SYN 이면 시작 측, ACK/NACK 이면 응답 측)
    pub source: PeerId,

    /// 최종 목적지 노드
    pub destination: PeerId,

    /// SYN: 시작 측이 바인드한 포트, ACK: 응답 측이 바인드한 포트
    pub port: Option<u16>,
}

impl UdtMessage {
    pub fn syn(source: PeerId, destination: PeerId, port: u16) -> Self {
        Self {
            kind: UdtKind::Syn,
            source,
            destination,
            port: Some(port),
        }
    }

    pub fn ack(source: PeerId, destination: PeerId, port: u16) -> Self {
        Self {
            kind: UdtKind::Ack,
            source,
            destination,
            port: Some(port),
        }
    }

    pub fn nack(source: PeerId, destination: PeerId) -> Self {
        Self {
            kind: UdtKind::Nack,
            source,
            destination,
            port: None,
        }
    }
}

impl std::fmt::Display for UdtMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UDT {:?} {} -> {} (port {:?})",
            self.kind, self.source, self.destination, self.port
        )
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Identify(Identify),
    RequestDownload(RequestDownload),
    StartUpload(StartUpload),
    StopUpload(StopUpload),
    AbortUpload(AbortUpload),
    AbortDownload(AbortDownload),
    RequestPart(RequestPart),
    FileChunk(FileChunk),
    RequestFilePartsRecord(RequestFilePartsRecord),
    ReplyFilePartsRecord(ReplyFilePartsRecord),
    Udt(UdtMessage),
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Identify(_) => MessageType::Identify,
            Message::RequestDownload(_) => MessageType::RequestDownload,
            Message::StartUpload(_) => MessageType::StartUpload,
            Message::StopUpload(_) => MessageType::StopUpload,
            Message::AbortUpload(_) => MessageType::AbortUpload,
            Message::AbortDownload(_) => MessageType::AbortDownload,
            Message::RequestPart(_) => MessageType::RequestPart,
            Message::FileChunk(_) => MessageType::FileChunk,
            Message::RequestFilePartsRecord(_) => MessageType::RequestFilePartsRecord,
            Message::ReplyFilePartsRecord(_) => MessageType::ReplyFilePartsRecord,
            Message::Udt(_) => MessageType::Udt,
        }
    }

    /// 바이트로 직렬화 (헤더 + payload)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let header = MessageHeader::new(self.msg_type(), payload.len() as u32);
        let header_bytes = bincode::serialize(&header)?;

        let mut buf = Vec::with_capacity(header_bytes.len() + payload.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: MessageHeader = bincode::deserialize(bytes)?;
        if header.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        // bincode 헤더는 고정 길이이므로 다시 직렬화해서 크기 확인
        let header_size = bincode::serialized_size(&header)? as usize;
        let end = header_size + header.payload_len as usize;
        if bytes.len() < end {
            return Err(Error::Protocol(format!(
                "잘린 메시지: {} < {}",
                bytes.len(),
                end
            )));
        }

        let message: Message = bincode::deserialize(&bytes[header_size..end])?;
        if message.msg_type() != header.msg_type {
            return Err(Error::Protocol(format!(
                "메시지 타입 불일치: header {:?}, payload {:?}",
                header.msg_type,
                message.msg_type()
            )));
        }
        Ok(message)
    }
}
