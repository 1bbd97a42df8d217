/**
 * ! RTMP 스택의 파사드.
 * !
 * ! 원격 피어와 메시지를 송수신한다. 'Connection'은 'Socket' 위에서 프레임 단위의
 * ! 연산을 제공하고, 바이트 레벨 프레이밍의 세부사항을 캡슐화한다. 'RtmpServer'는
 * ! 서버측 핸드셰이크/커맨드 교환을, 'RtmpClient'는 엣지 token traverse와 테스트가
 * ! 사용하는 클라이언트측을 제공한다.
 */

use std::cell::RefCell;
use std::io::{Cursor, IoSlice};
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::frame::{FrameError, MessageKind, RtmpMessage, HEADER_LEN};
use crate::socket::Socket;
use crate::{Error, Result};

/// 핸드셰이크 길이. 버전 1바이트 + 논스 8바이트.
const HANDSHAKE_LEN: usize = 9;
const RTMP_VERSION: u8 = 3;

/// 클라이언트의 종류. identify 단계에서 결정된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtmpConnType {
    Unknown,
    Play,
    FmlePublish,
    FlashPublish,
}

impl RtmpConnType {
    pub fn is_publish(self) -> bool {
        matches!(self, RtmpConnType::FmlePublish | RtmpConnType::FlashPublish)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RtmpConnType::Unknown => "unknown",
            RtmpConnType::Play => "play",
            RtmpConnType::FmlePublish => "fmle-publish",
            RtmpConnType::FlashPublish => "flash-publish",
        }
    }
}

/**
 * 커넥션의 요청 상태. connect 커맨드의 tcUrl에서 (vhost, app)을 뽑아낸다.
 *
 * tcUrl 형식: rtmp://host[:port]/app[?vhost=name]
 * vhost 파라미터가 없으면 host 부분이 vhost가 된다.
 */
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub ip: String,
    pub tc_url: String,
    pub page_url: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl Request {
    pub fn parse_tc_url(tc_url: &str, page_url: &str, ip: &str) -> Result<Request> {
        let rest = tc_url
            .strip_prefix("rtmp://")
            .ok_or_else(|| Error::Protocol(format!("invalid tcUrl: {}", tc_url)))?;

        let (host_port, app_part) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, ""),
        };

        let host = host_port.split(':').next().unwrap_or(host_port);

        // ?vhost=name 파라미터가 있으면 vhost를 덮어쓴다.
        let (app, vhost) = match app_part.find('?') {
            Some(pos) => {
                let query = &app_part[pos + 1..];
                let vhost = query
                    .split('&')
                    .find_map(|kv| kv.strip_prefix("vhost="))
                    .unwrap_or(host);
                (&app_part[..pos], vhost)
            }
            None => (app_part, host),
        };

        if app.is_empty() {
            return Err(Error::Protocol(format!("tcUrl without app: {}", tc_url)));
        }

        Ok(Request {
            ip: ip.to_string(),
            tc_url: tc_url.to_string(),
            page_url: page_url.to_string(),
            vhost: vhost.to_string(),
            app: app.to_string(),
            stream: String::new(),
        })
    }

    /// Source 허브의 키. (vhost, app, stream)을 하나의 문자열로 만든다.
    pub fn source_key(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// 커넥션의 응답 상태.
#[derive(Debug, Clone)]
pub struct Response {
    pub stream_id: u32,
}

impl Default for Response {
    fn default() -> Response {
        Response { stream_id: 1 }
    }
}

/**
 * 원격 피어와 'RtmpMessage'를 송수신한다.
 *
 * 읽기는 내부 버퍼를 사용한다. 완전한 하나의 프레임을 만들기에 충분한 바이트가
 * 모일 때까지 버퍼를 채우고, 프레임이 완성되면 파싱하여 호출자에게 반환한다.
 *
 * 쓰기는 메시지별 (헤더, payload) iovec 쌍을 만들어 하나의 gathered write로
 * 내보낸다. 여러 메시지를 한 번의 시스템 콜로 합치기 위한 것이다(merged-write).
 */
pub struct Connection {
    skt: Rc<Socket>,
    buffer: RefCell<BytesMut>,
}

impl Connection {
    pub fn new(skt: Rc<Socket>) -> Connection {
        Connection {
            skt,
            buffer: RefCell::new(BytesMut::with_capacity(4 * 1024)),
        }
    }

    pub fn socket(&self) -> &Rc<Socket> {
        &self.skt
    }

    /// 완전한 메시지 하나를 수신한다. 필요하면 소켓에서 더 읽는다.
    pub async fn recv_message(&self) -> Result<RtmpMessage> {
        loop {
            if let Some(msg) = self.parse_message()? {
                return Ok(msg);
            }

            /*
             * 버퍼를 채우는 동안에는 RefCell 대여를 잡지 않는다. 읽기 태스크가
             * 여기서 블로킹된 사이에 쓰기 태스크가 같은 'Connection'으로 전송할
             * 수 있어야 한다.
             */
            let mut chunk = [0u8; 4096];
            let nread = self.skt.read(&mut chunk).await?;
            self.buffer.borrow_mut().extend_from_slice(&chunk[..nread]);
        }
    }

    fn parse_message(&self) -> Result<Option<RtmpMessage>> {
        let mut buffer = self.buffer.borrow_mut();
        let mut cur = Cursor::new(&buffer[..]);

        match RtmpMessage::check(&mut cur) {
            Ok(()) => {
                let len = cur.position() as usize;
                cur.set_position(0);

                let msg = RtmpMessage::parse(&mut cur)
                    .map_err(|e| Error::Protocol(format!("{:?}", e)))?;
                buffer.advance(len);

                Ok(Some(msg))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(FrameError::Other(s)) => Err(Error::Protocol(s)),
        }
    }

    /// 메시지 묶음을 하나의 gathered write로 전송한다. 쓴 바이트 수를 반환한다.
    pub async fn send_messages(&self, msgs: &[RtmpMessage]) -> Result<usize> {
        if msgs.is_empty() {
            return Ok(0);
        }

        let headers: Vec<[u8; HEADER_LEN]> = msgs.iter().map(|m| m.header()).collect();

        let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(msgs.len() * 2);
        for (hdr, msg) in headers.iter().zip(msgs.iter()) {
            iovs.push(IoSlice::new(hdr));
            iovs.push(IoSlice::new(&msg.payload));
        }

        self.skt.writev(&iovs).await
    }

    pub async fn send_message(&self, msg: RtmpMessage) -> Result<usize> {
        self.send_messages(std::slice::from_ref(&msg)).await
    }
}

/**
 * 서버측 RTMP 스택.
 *
 * 핸드셰이크 → connect 커맨드 → identify → play/publish 진입까지의 커맨드 교환을
 * 담당한다. 와이어 세부사항은 'Connection'에 위임한다.
 */
pub struct RtmpServer {
    conn: Connection,
}

impl RtmpServer {
    pub fn new(skt: Rc<Socket>) -> RtmpServer {
        RtmpServer {
            conn: Connection::new(skt),
        }
    }

    pub fn socket(&self) -> &Rc<Socket> {
        self.conn.socket()
    }

    /**
     * 서버측 핸드셰이크. C0+C1을 읽고 동일한 논스로 S0+S1을 돌려준다.
     * 버전이 맞지 않으면 프로토콜 에러다.
     */
    pub async fn handshake(&self) -> Result<()> {
        let mut c01 = [0u8; HANDSHAKE_LEN];
        self.conn.socket().read_fully(&mut c01).await?;

        if c01[0] != RTMP_VERSION {
            return Err(Error::Protocol(format!(
                "handshake version mismatch: {}",
                c01[0]
            )));
        }

        self.conn.socket().write(&c01).await?;
        Ok(())
    }

    /// connect 커맨드를 읽고 tcUrl에서 (vhost, app)을 뽑는다.
    pub async fn connect_app(&self) -> Result<Request> {
        loop {
            let msg = self.conn.recv_message().await?;
            let (name, args) = match msg.as_command() {
                Some(v) => v,
                None => continue,
            };

            if name == "connect" {
                let tc_url = args
                    .get(0)
                    .ok_or_else(|| Error::Protocol("connect without tcUrl".into()))?;
                let page_url = args.get(1).map(|s| s.as_str()).unwrap_or("");

                let ip = self
                    .conn
                    .socket()
                    .peer_addr()
                    .map(|a| a.ip().to_string())
                    .unwrap_or_default();

                return Request::parse_tc_url(tc_url, page_url, &ip);
            }

            debug!(command = %name, "ignore command before connect");
        }
    }

    /// connect 커맨드에 성공 응답을 보낸다.
    pub async fn response_connect_app(&self) -> Result<()> {
        let res = RtmpMessage::command("result", &["NetConnection.Connect.Success"]);
        self.conn.send_message(res).await?;
        Ok(())
    }

    /// connect 커맨드를 거부한다. 훅 거절 등 admission 실패 시 사용한다.
    pub async fn response_connect_reject(&self, reason: &str) -> Result<()> {
        let res = RtmpMessage::command("result", &["NetConnection.Connect.Rejected", reason]);
        self.conn.send_message(res).await?;
        Ok(())
    }

    /**
     * 클라이언트의 종류를 판별한다.
     *
     * - play 커맨드: 플레이어.
     * - releaseStream 커맨드: FMLE publish 시퀀스의 시작.
     * - publish 커맨드: flash publish.
     *
     * 그 외의 커맨드는 무시하고 계속 읽는다.
     */
    pub async fn identify_client(&self) -> Result<(RtmpConnType, String)> {
        loop {
            let msg = self.conn.recv_message().await?;
            let (name, args) = match msg.as_command() {
                Some(v) => v,
                None => continue,
            };

            let stream = args.get(0).cloned().unwrap_or_default();
            match name.as_str() {
                "play" => return Ok((RtmpConnType::Play, stream)),
                "releaseStream" => return Ok((RtmpConnType::FmlePublish, stream)),
                "publish" => return Ok((RtmpConnType::FlashPublish, stream)),
                _ => {
                    debug!(command = %name, "ignore command while identifying");
                }
            }
        }
    }

    /// 플레이 시작을 알린다.
    pub async fn start_play(&self) -> Result<()> {
        let res = RtmpMessage::command("onStatus", &["NetStream.Play.Start"]);
        self.conn.send_message(res).await?;
        Ok(())
    }

    /**
     * FMLE publish 시퀀스. identify에서 releaseStream까지 읽었으므로,
     * FCPublish와 publish 커맨드를 마저 소비한 뒤 시작을 알린다.
     */
    pub async fn start_publish_fmle(&self) -> Result<()> {
        loop {
            let msg = self.conn.recv_message().await?;
            let (name, _args) = match msg.as_command() {
                Some(v) => v,
                None => continue,
            };

            match name.as_str() {
                "FCPublish" => continue,
                "publish" => break,
                _ => {
                    debug!(command = %name, "ignore command in fmle publish sequence");
                }
            }
        }

        let res = RtmpMessage::command("onStatus", &["NetStream.Publish.Start"]);
        self.conn.send_message(res).await?;
        Ok(())
    }

    /// flash publish는 publish 커맨드 하나로 시작한다. 바로 시작을 알린다.
    pub async fn start_publish_flash(&self) -> Result<()> {
        let res = RtmpMessage::command("onStatus", &["NetStream.Publish.Start"]);
        self.conn.send_message(res).await?;
        Ok(())
    }

    pub async fn recv_message(&self) -> Result<RtmpMessage> {
        self.conn.recv_message().await
    }

    pub async fn send_message(&self, msg: RtmpMessage) -> Result<usize> {
        self.conn.send_message(msg).await
    }

    pub async fn send_messages(&self, msgs: &[RtmpMessage]) -> Result<usize> {
        self.conn.send_messages(msgs).await
    }
}

/**
 * 클라이언트측 RTMP 스택.
 *
 * 엣지의 token traverse 인증이 원 서버로 connect를 재생(replay)할 때 사용하고,
 * 테스트의 시뮬레이션 클라이언트도 이것을 사용한다.
 */
pub struct RtmpClient {
    conn: Connection,
}

impl RtmpClient {
    pub fn new(skt: Rc<Socket>) -> RtmpClient {
        RtmpClient {
            conn: Connection::new(skt),
        }
    }

    /// 클라이언트측 핸드셰이크. C0+C1을 보내고 S0+S1을 기다린다.
    pub async fn handshake(&self) -> Result<()> {
        let mut c01 = [0u8; HANDSHAKE_LEN];
        c01[0] = RTMP_VERSION;
        // 논스는 에코 검증에만 쓰이므로 프로세스 시계면 충분하다.
        let nonce = std::process::id().to_be_bytes();
        c01[1..5].copy_from_slice(&nonce);

        self.conn.socket().write(&c01).await?;

        let mut s01 = [0u8; HANDSHAKE_LEN];
        self.conn.socket().read_fully(&mut s01).await?;

        if s01[0] != RTMP_VERSION {
            return Err(Error::Protocol(format!(
                "handshake version mismatch: {}",
                s01[0]
            )));
        }
        Ok(())
    }

    /// connect 커맨드를 보내고 성공 응답을 기다린다.
    pub async fn connect_app(&self, tc_url: &str, page_url: &str) -> Result<()> {
        let msg = RtmpMessage::command("connect", &[tc_url, page_url]);
        self.conn.send_message(msg).await?;

        let res = self.conn.recv_message().await?;
        match res.as_command() {
            Some((name, args))
                if name == "result"
                    && args.get(0).map(|s| s.as_str())
                        == Some("NetConnection.Connect.Success") =>
            {
                Ok(())
            }
            _ => Err(Error::Protocol("connect rejected by server".into())),
        }
    }

    /// play 커맨드를 보내고 시작 통지를 기다린다.
    pub async fn play(&self, stream: &str) -> Result<()> {
        let msg = RtmpMessage::command("play", &[stream]);
        self.conn.send_message(msg).await?;
        self.expect_on_status("NetStream.Play.Start").await
    }

    /// FMLE 시퀀스로 publish를 시작한다.
    pub async fn publish_fmle(&self, stream: &str) -> Result<()> {
        self.conn
            .send_message(RtmpMessage::command("releaseStream", &[stream]))
            .await?;
        self.conn
            .send_message(RtmpMessage::command("FCPublish", &[stream]))
            .await?;
        self.conn
            .send_message(RtmpMessage::command("publish", &[stream]))
            .await?;
        self.expect_on_status("NetStream.Publish.Start").await
    }

    /// flash 방식으로 publish를 시작한다.
    pub async fn publish_flash(&self, stream: &str) -> Result<()> {
        self.conn
            .send_message(RtmpMessage::command("publish", &[stream]))
            .await?;
        self.expect_on_status("NetStream.Publish.Start").await
    }

    async fn expect_on_status(&self, code: &str) -> Result<()> {
        loop {
            let res = self.conn.recv_message().await?;
            if let Some((name, args)) = res.as_command() {
                if name == "onStatus" {
                    if args.get(0).map(|s| s.as_str()) == Some(code) {
                        return Ok(());
                    }
                    return Err(Error::Protocol(format!(
                        "unexpected status: {:?}",
                        args.get(0)
                    )));
                }
            }
        }
    }

    pub async fn recv_message(&self) -> Result<RtmpMessage> {
        self.conn.recv_message().await
    }

    pub async fn send_message(&self, msg: RtmpMessage) -> Result<usize> {
        self.conn.send_message(msg).await
    }

    pub fn socket(&self) -> &Rc<Socket> {
        self.conn.socket()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tc_url_vhost_defaults_to_host() {
        let req = Request::parse_tc_url("rtmp://media.example.com/live", "", "1.2.3.4").unwrap();
        assert_eq!(req.vhost, "media.example.com");
        assert_eq!(req.app, "live");
        assert_eq!(req.ip, "1.2.3.4");
    }

    #[test]
    fn tc_url_vhost_param_overrides_host() {
        let req =
            Request::parse_tc_url("rtmp://127.0.0.1:1935/live?vhost=demo", "", "").unwrap();
        assert_eq!(req.vhost, "demo");
        assert_eq!(req.app, "live");
    }

    #[test]
    fn tc_url_without_app_is_rejected() {
        assert!(Request::parse_tc_url("rtmp://host", "", "").is_err());
        assert!(Request::parse_tc_url("http://host/live", "", "").is_err());
    }

    #[test]
    fn source_key_joins_identity() {
        let mut req = Request::parse_tc_url("rtmp://h/live?vhost=v", "", "").unwrap();
        req.stream = "foo".into();
        assert_eq!(req.source_key(), "v/live/foo");
    }
}
