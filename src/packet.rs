//! 패킷 정의 및 인코딩
//!
//! 와이어 포맷: 1바이트 태그 + 페이로드. 정수는 모두 빅엔디언.
//! UDP가 데이터그램 경계를 보장하므로 별도 프레이밍은 없음.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, SeqId, METADATA_SEQ};

/// 패킷 타입 (태그 값 = 서수)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// 연결 요청
    Connect = 0,

    /// 파일 요청 (UTF-8 파일 이름)
    RequestFile = 1,

    /// 카탈로그 요청
    RequestInfo = 2,

    /// 연결 요청 응답
    Ack = 3,

    /// 데이터 청크 (4바이트 시퀀스 ID + 내용)
    Data = 4,

    /// 전체 페이로드 길이 (4바이트)
    Metadata = 5,

    /// 청크 수신 확인 (4바이트 시퀀스 ID, -1 가능)
    Received = 6,

    /// 연결 종료
    Disconnect = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => PacketType::Connect,
            1 => PacketType::RequestFile,
            2 => PacketType::RequestInfo,
            3 => PacketType::Ack,
            4 => PacketType::Data,
            5 => PacketType::Metadata,
            6 => PacketType::Received,
            7 => PacketType::Disconnect,
            tag => return Err(Error::UnknownPacketType { tag }),
        })
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// 태그와 페이로드를 이어붙여 데이터그램 생성
pub fn encode(packet_type: PacketType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(packet_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// 통합 패킷 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect,
    RequestFile { name: String },
    RequestInfo,
    Ack,
    Data { seq: SeqId, content: Bytes },
    Metadata { total_len: u32 },
    Received { seq: SeqId },
    Disconnect,
}

impl Packet {
    /// 패킷 타입 반환
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect => PacketType::Connect,
            Packet::RequestFile { .. } => PacketType::RequestFile,
            Packet::RequestInfo => PacketType::RequestInfo,
            Packet::Ack => PacketType::Ack,
            Packet::Data { .. } => PacketType::Data,
            Packet::Metadata { .. } => PacketType::Metadata,
            Packet::Received { .. } => PacketType::Received,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// 인코딩된 크기 (태그 1바이트 + 페이로드)
    pub fn size(&self) -> usize {
        1 + match self {
            Packet::Connect | Packet::RequestInfo | Packet::Ack | Packet::Disconnect => 0,
            Packet::RequestFile { name } => name.len(),
            Packet::Data { content, .. } => 4 + content.len(),
            Packet::Metadata { .. } | Packet::Received { .. } => 4,
        }
    }

    /// METADATA 수신 확인 패킷
    pub fn metadata_received() -> Self {
        Packet::Received { seq: METADATA_SEQ }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(self.packet_type() as u8);

        match self {
            Packet::Connect | Packet::RequestInfo | Packet::Ack | Packet::Disconnect => {}
            Packet::RequestFile { name } => buf.put_slice(name.as_bytes()),
            Packet::Data { seq, content } => {
                buf.put_i32(*seq);
                buf.put_slice(content);
            }
            Packet::Metadata { total_len } => buf.put_u32(*total_len),
            Packet::Received { seq } => buf.put_i32(*seq),
        }

        buf.freeze()
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&tag, mut payload) = bytes.split_first().ok_or(Error::MalformedPacket {
            reason: "빈 데이터그램",
        })?;

        let packet = match PacketType::try_from(tag)? {
            PacketType::Connect => Packet::Connect,
            PacketType::RequestInfo => Packet::RequestInfo,
            PacketType::Ack => Packet::Ack,
            PacketType::Disconnect => Packet::Disconnect,
            PacketType::RequestFile => {
                let name = std::str::from_utf8(payload).map_err(|_| Error::MalformedPacket {
                    reason: "파일 이름이 UTF-8이 아님",
                })?;
                Packet::RequestFile {
                    name: name.to_owned(),
                }
            }
            PacketType::Data => {
                if payload.len() < 4 {
                    return Err(Error::MalformedPacket {
                        reason: "DATA 시퀀스 ID 누락",
                    });
                }
                let seq = payload.get_i32();
                Packet::Data {
                    seq,
                    content: Bytes::copy_from_slice(payload),
                }
            }
            PacketType::Metadata => {
                if payload.len() != 4 {
                    return Err(Error::MalformedPacket {
                        reason: "METADATA 길이 필드는 4바이트",
                    });
                }
                let total_len = payload.get_i32();
                let total_len = u32::try_from(total_len).map_err(|_| Error::MalformedPacket {
                    reason: "METADATA 길이가 음수",
                })?;
                Packet::Metadata { total_len }
            }
            PacketType::Received => {
                if payload.len() != 4 {
                    return Err(Error::MalformedPacket {
                        reason: "RECEIVED 시퀀스 ID는 4바이트",
                    });
                }
                Packet::Received {
                    seq: payload.get_i32(),
                }
            }
        };

        Ok(packet)
    }
}
