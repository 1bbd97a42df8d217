/**
 * ! 리스너 패브릭.
 * !
 * ! (ip, port, 프로토콜, 리스너 타입)의 타입드 바인딩. 각 리스너는 자신의 타입
 * ! 태그를 알고 있으며, 수락한 디스크립터를 타입 태그와 함께 서버로 전달한다.
 * ! 서버는 태그를 보고 올바른 커넥션 변형을 고른다.
 * !
 * ! 스트림 리스너는 accept 태스크 하나를 소유한다. 데이터그램 리스너는 사용자가
 * ! 제공한 핸들러에 데이터그램을 직접 바인딩한다.
 */

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;
use tracing::{error, info, warn};

use crate::task::{CycleHandler, Task, TaskKind};
use crate::{Error, Result};

/**
 * 리스너의 타입 태그. 서버가 커넥션 변형을 고르는 기준이 된다.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    // RTMP 클라이언트.
    RtmpStream,
    // HTTP api.
    HttpApi,
    // HTTP 스트림. HDS/HLS/DASH.
    HttpStream,
    // UDP 스트림. MPEG-TS over udp.
    MpegTsOverUdp,
    // TCP 스트림. RTSP 스트림.
    Rtsp,
    // TCP 스트림. FLV over HTTP.
    Flv,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::RtmpStream => "rtmp",
            ListenerKind::HttpApi => "http-api",
            ListenerKind::HttpStream => "http-stream",
            ListenerKind::MpegTsOverUdp => "mpegts-udp",
            ListenerKind::Rtsp => "rtsp",
            ListenerKind::Flv => "flv",
        }
    }
}

/// 리스너가 수락한 TCP 디스크립터를 받는 쪽. 서버 혹은 캐스터가 구현한다.
#[async_trait(?Send)]
pub trait TcpConnHandler {
    async fn on_tcp_client(&self, kind: ListenerKind, stream: TcpStream) -> Result<()>;
}

/// 데이터그램 리스너의 핸들러.
#[async_trait(?Send)]
pub trait UdpPacketHandler {
    async fn on_udp_packet(&self, from: SocketAddr, data: &[u8]) -> Result<()>;
}

/**
 * TCP 리스너. accept 태스크를 소유하고, 새 디스크립터마다 핸들러를 호출한다.
 *
 * RTSP나 FLV처럼 캐스터와 짝을 이루는 리스너도 같은 구조를 쓴다. 핸들러만
 * 캐스터로 바뀐다.
 */
pub struct StreamListener {
    kind: ListenerKind,
    local_addr: SocketAddr,
    task: Task,
}

impl StreamListener {
    /**
     * 바인딩하고 accept 태스크를 가동한다.
     *
     * 바인딩 실패는 초기화 실패다. 가동 이후의 accept 에러는 지수 백오프로
     * 재시도한다.
     */
    pub async fn listen(
        handler: Rc<dyn TcpConnHandler>,
        kind: ListenerKind,
        ip: &str,
        port: u16,
    ) -> Result<StreamListener> {
        let listener = TcpListener::bind((ip, port))
            .await
            .map_err(|e| Error::RuntimeInit(format!("listen {} {}:{}: {}", kind.as_str(), ip, port, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::RuntimeInit(format!("listener addr: {}", e)))?;

        info!(kind = kind.as_str(), addr = %local_addr, "listener started");

        let mut task = Task::new(
            &format!("tcp-listen-{}", kind.as_str()),
            TaskKind::Endless,
            Duration::ZERO,
            Box::new(AcceptCycle {
                listener,
                kind,
                handler,
            }),
        );
        task.start().await?;

        Ok(StreamListener {
            kind,
            local_addr,
            task,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(&mut self) {
        self.task.stop().await;
    }
}

/// accept 태스크의 본문.
struct AcceptCycle {
    listener: TcpListener,
    kind: ListenerKind,
    handler: Rc<dyn TcpConnHandler>,
}

impl AcceptCycle {
    /**
     * 인바운드 커넥션을 수락한다.
     *
     * 에러는 백오프 & 재시도로 핸들링한다. 첫 실패 후 1초를 기다리고, 이어지는
     * 실패마다 대기 시간을 2배로 늘린다. 64초를 넘겨도 실패하면 에러를 반환한다.
     */
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => return Ok(stream),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

#[async_trait(?Send)]
impl CycleHandler for AcceptCycle {
    async fn cycle(&mut self) -> Result<()> {
        let stream = self.accept().await?;

        if let Err(err) = self.handler.on_tcp_client(self.kind, stream).await {
            error!(kind = self.kind.as_str(), cause = %err, "serve client failed");
        }
        Ok(())
    }
}

/**
 * UDP 리스너. 수신한 데이터그램을 핸들러에 직접 넘긴다. MPEG-TS over UDP 경로.
 */
pub struct UdpStreamListener {
    kind: ListenerKind,
    local_addr: SocketAddr,
    task: Task,
}

impl UdpStreamListener {
    pub async fn listen(
        handler: Rc<dyn UdpPacketHandler>,
        kind: ListenerKind,
        ip: &str,
        port: u16,
    ) -> Result<UdpStreamListener> {
        let socket = UdpSocket::bind((ip, port))
            .await
            .map_err(|e| Error::RuntimeInit(format!("listen {} {}:{}: {}", kind.as_str(), ip, port, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::RuntimeInit(format!("listener addr: {}", e)))?;

        info!(kind = kind.as_str(), addr = %local_addr, "udp listener started");

        let mut task = Task::new(
            &format!("udp-listen-{}", kind.as_str()),
            TaskKind::Endless,
            Duration::ZERO,
            Box::new(UdpCycle { socket, handler }),
        );
        task.start().await?;

        Ok(UdpStreamListener {
            kind,
            local_addr,
            task,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(&mut self) {
        self.task.stop().await;
    }
}

struct UdpCycle {
    socket: UdpSocket,
    handler: Rc<dyn UdpPacketHandler>,
}

#[async_trait(?Send)]
impl CycleHandler for UdpCycle {
    async fn cycle(&mut self) -> Result<()> {
        // 65535는 UDP 데이터그램의 이론상 최대치다.
        let mut buf = vec![0u8; 65535];
        let (len, from) = self.socket.recv_from(&mut buf).await?;

        if let Err(err) = self.handler.on_udp_packet(from, &buf[..len]).await {
            warn!(cause = %err, "handle udp packet failed");
        }
        Ok(())
    }
}

/// MPEG-TS over UDP의 자리 캐스터. 디먹스는 외부 협력자의 몫이므로 수신만 기록한다.
pub struct MpegtsOverUdpCaster;

#[async_trait(?Send)]
impl UdpPacketHandler for MpegtsOverUdpCaster {
    async fn on_udp_packet(&self, from: SocketAddr, data: &[u8]) -> Result<()> {
        tracing::debug!(from = %from, bytes = data.len(), "mpegts datagram");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingHandler {
        accepted: Rc<Cell<u32>>,
    }

    #[async_trait(?Send)]
    impl TcpConnHandler for CountingHandler {
        async fn on_tcp_client(&self, _kind: ListenerKind, _stream: TcpStream) -> Result<()> {
            self.accepted.set(self.accepted.get() + 1);
            Ok(())
        }
    }

    #[tokio::test]
    async fn accepted_stream_carries_listener_kind() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let accepted = Rc::new(Cell::new(0));
                let handler = Rc::new(CountingHandler {
                    accepted: accepted.clone(),
                });

                let mut listener = StreamListener::listen(
                    handler,
                    ListenerKind::RtmpStream,
                    "127.0.0.1",
                    0,
                )
                .await
                .unwrap();

                let addr = listener.local_addr();
                let _c1 = TcpStream::connect(addr).await.unwrap();
                let _c2 = TcpStream::connect(addr).await.unwrap();

                time::sleep(Duration::from_millis(50)).await;
                assert_eq!(accepted.get(), 2);

                listener.close().await;
            })
            .await;
    }
}
