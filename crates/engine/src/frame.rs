//! 프레임 -- 처리 중인 패킷 하나
//!
//! 입력이 생성하거나 헬퍼가 재조립해서 만든 바이트 버퍼와 메타데이터입니다.
//! 레이어 체인은 프레임이 아니라 엔진의 [`LayerPool`](crate::layer::LayerPool)에
//! 있으며 프레임 처리 한 번 동안만 유효합니다.

use std::time::Duration;

use bytes::Bytes;

use crate::registry::ProtoId;

/// 프레임이 어디서 왔는지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// 입력 소스에서 읽음
    Input,
    /// 헬퍼가 재조립 후 재주입함
    Reinjected,
}

/// 처리 중인 패킷
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    timestamp: Duration,
    first_proto: ProtoId,
    origin: FrameOrigin,
}

impl Frame {
    /// 입력에서 읽은 프레임을 생성합니다.
    ///
    /// `timestamp`는 UNIX epoch 기준 캡처 시각입니다.
    pub fn new(data: impl Into<Bytes>, timestamp: Duration, first_proto: ProtoId) -> Self {
        Self {
            data: data.into(),
            timestamp,
            first_proto,
            origin: FrameOrigin::Input,
        }
    }

    /// 헬퍼가 재구성한 프레임을 생성합니다.
    pub fn reinjected(data: impl Into<Bytes>, timestamp: Duration, first_proto: ProtoId) -> Self {
        Self {
            origin: FrameOrigin::Reinjected,
            ..Self::new(data, timestamp, first_proto)
        }
    }

    /// 원시 바이트
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 원시 바이트 (공유 버퍼)
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 캡처 시각
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// 첫 레이어 프로토콜
    pub fn first_proto(&self) -> ProtoId {
        self.first_proto
    }

    pub fn origin(&self) -> FrameOrigin {
        self.origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_from_input() {
        let frame = Frame::new(vec![1u8, 2, 3], Duration::from_secs(5), ProtoId::UNDEFINED);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.origin(), FrameOrigin::Input);
        assert_eq!(frame.timestamp(), Duration::from_secs(5));
    }

    #[test]
    fn reinjected_frame_keeps_metadata() {
        let frame = Frame::reinjected(
            Bytes::from_static(b"abcd"),
            Duration::from_millis(1500),
            ProtoId::UNDEFINED,
        );
        assert_eq!(frame.origin(), FrameOrigin::Reinjected);
        assert_eq!(frame.data(), b"abcd");
        assert!(!frame.is_empty());
    }
}
