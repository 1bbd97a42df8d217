/**
 * ! RTMP 메시지의 프레이밍.
 * !
 * ! 청킹과 AMF 인코딩을 포함한 RTMP 와이어 코덱 전체는 외부 협력자의 몫이다.
 * ! 코어는 코어와 그 테스트를 구동하기에 충분한, 자기 기술적인(self-describing)
 * ! 간결한 프레이밍을 사용한다:
 * !
 * !     [1B kind][4B BE timestamp][4B BE length][payload]
 * !
 * ! kind 값은 RTMP 메시지 타입 id를 따른다 (audio=8, video=9, metadata=18,
 * ! command=20). 커맨드의 payload는 개행으로 구분된 이름과 아규먼트들이다.
 */

use std::convert::TryInto;
use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 프레임 헤더 길이. kind(1) + timestamp(4) + length(4).
pub const HEADER_LEN: usize = 9;

/// 하나의 payload가 가질 수 있는 최대 길이. 이를 넘는 프레임은 프로토콜 에러다.
const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Audio,
    Video,
    Metadata,
    Command,
}

impl MessageKind {
    fn to_u8(self) -> u8 {
        match self {
            MessageKind::Audio => 8,
            MessageKind::Video => 9,
            MessageKind::Metadata => 18,
            MessageKind::Command => 20,
        }
    }

    fn from_u8(v: u8) -> Option<MessageKind> {
        match v {
            8 => Some(MessageKind::Audio),
            9 => Some(MessageKind::Video),
            18 => Some(MessageKind::Metadata),
            20 => Some(MessageKind::Command),
            _ => None,
        }
    }

    /// 오디오/비디오/메타데이터, 즉 Source로 전달되는 미디어 계열인지 확인한다.
    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageKind::Audio | MessageKind::Video | MessageKind::Metadata
        )
    }
}

/**
 * 코어를 흐르는 하나의 메시지.
 *
 * payload는 'Bytes'이므로 Consumer fan-out을 위한 clone은 shallow이다.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpMessage {
    pub kind: MessageKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum FrameError {
    /// 완전한 프레임을 만들기에 충분한 바이트가 아직 모이지 않았다.
    Incomplete,
    Other(String),
}

impl RtmpMessage {
    pub fn audio(timestamp: u32, payload: Bytes) -> RtmpMessage {
        RtmpMessage {
            kind: MessageKind::Audio,
            timestamp,
            payload,
        }
    }

    pub fn video(timestamp: u32, payload: Bytes) -> RtmpMessage {
        RtmpMessage {
            kind: MessageKind::Video,
            timestamp,
            payload,
        }
    }

    pub fn metadata(timestamp: u32, payload: Bytes) -> RtmpMessage {
        RtmpMessage {
            kind: MessageKind::Metadata,
            timestamp,
            payload,
        }
    }

    /// 개행으로 구분된 이름/아규먼트로 커맨드 메시지를 만든다.
    pub fn command(name: &str, args: &[&str]) -> RtmpMessage {
        let mut text = String::from(name);
        for arg in args {
            text.push('\n');
            text.push_str(arg);
        }
        RtmpMessage {
            kind: MessageKind::Command,
            timestamp: 0,
            payload: Bytes::from(text),
        }
    }

    /**
     * 커맨드 payload를 (이름, 아규먼트들)로 해석한다.
     * 커맨드가 아니거나 UTF-8이 아니면 None을 반환한다.
     */
    pub fn as_command(&self) -> Option<(String, Vec<String>)> {
        if self.kind != MessageKind::Command {
            return None;
        }
        let text = std::str::from_utf8(&self.payload).ok()?;
        let mut parts = text.split('\n').map(|s| s.to_string());
        let name = parts.next()?;
        Some((name, parts.collect()))
    }

    /**
     * 버퍼에 완전한 메시지 하나가 있는지 확인한다.
     *
     * 파싱보다 훨씬 싸기 때문에, 수신 루프는 먼저 check로 프레임 경계를 찾은 뒤에
     * parse를 호출한다.
     */
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), FrameError> {
        let kind = get_u8(src)?;
        if MessageKind::from_u8(kind).is_none() {
            return Err(FrameError::Other(format!(
                "invalid message kind byte '{}'",
                kind
            )));
        }

        let _timestamp = get_u32(src)?;
        let len = get_u32(src)?;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Other(format!("payload too large: {}", len)));
        }

        skip(src, len as usize)
    }

    /// check가 성공한 버퍼에서 메시지 하나를 꺼낸다.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<RtmpMessage, FrameError> {
        let kind = match MessageKind::from_u8(get_u8(src)?) {
            Some(k) => k,
            None => return Err(FrameError::Other("invalid message kind".into())),
        };
        let timestamp = get_u32(src)?;
        let len = get_u32(src)? as usize;

        if src.remaining() < len {
            return Err(FrameError::Incomplete);
        }

        let start = src.position() as usize;
        let payload = Bytes::copy_from_slice(&src.get_ref()[start..start + len]);
        src.set_position((start + len) as u64);

        Ok(RtmpMessage {
            kind,
            timestamp,
            payload,
        })
    }

    /// 메시지의 헤더 9바이트를 만든다. gathered write에서 payload와 짝이 된다.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0] = self.kind.to_u8();
        hdr[1..5].copy_from_slice(&self.timestamp.to_be_bytes());
        let len: u32 = self.payload.len().try_into().unwrap_or(0);
        hdr[5..9].copy_from_slice(&len.to_be_bytes());
        hdr
    }

    /// 헤더와 payload를 버퍼에 인코딩한다.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.header());
        dst.put_slice(&self.payload);
    }
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, FrameError> {
    if !src.has_remaining() {
        return Err(FrameError::Incomplete);
    }
    Ok(src.get_u8())
}

fn get_u32(src: &mut Cursor<&[u8]>) -> Result<u32, FrameError> {
    if src.remaining() < 4 {
        return Err(FrameError::Incomplete);
    }
    Ok(src.get_u32())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), FrameError> {
    if src.remaining() < n {
        return Err(FrameError::Incomplete);
    }
    src.advance(n);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_media_message() {
        let msg = RtmpMessage::video(1234, Bytes::from_static(b"frame-data"));

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let data = buf.freeze();
        let mut cur = Cursor::new(&data[..]);
        RtmpMessage::check(&mut cur).unwrap();

        cur.set_position(0);
        let parsed = RtmpMessage::parse(&mut cur).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn partial_header_is_incomplete() {
        let msg = RtmpMessage::audio(7, Bytes::from_static(b"aac"));
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        // 헤더 중간에서 잘린 버퍼.
        let data = buf.freeze();
        let mut cur = Cursor::new(&data[..4]);
        match RtmpMessage::check(&mut cur) {
            Err(FrameError::Incomplete) => {}
            other => panic!("expected incomplete, got {:?}", other),
        }
    }

    #[test]
    fn partial_payload_is_incomplete() {
        let msg = RtmpMessage::audio(7, Bytes::from_static(b"aac-payload"));
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let data = buf.freeze();
        let mut cur = Cursor::new(&data[..HEADER_LEN + 3]);
        match RtmpMessage::check(&mut cur) {
            Err(FrameError::Incomplete) => {}
            other => panic!("expected incomplete, got {:?}", other),
        }
    }

    #[test]
    fn command_payload_splits_into_name_and_args() {
        let msg = RtmpMessage::command("connect", &["rtmp://host/live", "http://page"]);
        let (name, args) = msg.as_command().unwrap();
        assert_eq!(name, "connect");
        assert_eq!(args, vec!["rtmp://host/live", "http://page"]);
    }

    #[test]
    fn unknown_kind_is_protocol_error() {
        let mut raw = BytesMut::new();
        raw.put_u8(0x42);
        raw.put_u32(0);
        raw.put_u32(0);

        let data = raw.freeze();
        let mut cur = Cursor::new(&data[..]);
        match RtmpMessage::check(&mut cur) {
            Err(FrameError::Other(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }
}
