/**
 * ! RTMP 커넥션의 서비스 로직.
 * !
 * ! 커넥션 하나는 one-shot 태스크로 돌아간다. cycle은 핸드셰이크 → connect-app →
 * ! admission → identify → play/publish 순으로 진행하고, 태스크의 마지막 행동으로
 * ! 소유자(커넥션 매니저)에게 자신의 제거를 요청한다.
 * !
 * ! 정책 노브(merged-write, realtime, TCP_NODELAY, publish 타임아웃)는 라이브
 * ! reload로 세션 중에 바뀔 수 있다. play/publish 루프는 매 iteration 노브를 다시
 * ! 읽는다.
 */

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::frame::RtmpMessage;
use crate::hooks::{HookBackend, HookEvent};
use crate::kbps::Kbps;
use crate::recv_thread::{PublishRecvThread, QueueRecvThread};
use crate::rtmp::{Request, Response, RtmpClient, RtmpConnType, RtmpServer};
use crate::socket::Socket;
use crate::source::{Consumer, Source, SourceHub, MW_MAX_MSGS};
use crate::task::{CycleHandler, TaskControl};
use crate::{Error, Result};

/// identify까지의 커맨드 교환에 쓰는 소켓 타임아웃.
const RTMP_TIMEOUT: Duration = Duration::from_secs(30);

/// 실시간 모드에서 메시지 도착을 살피는 주기. 배칭하지 않는다.
const REALTIME_TICK: Duration = Duration::from_millis(50);

/// 엣지 origin으로 connect를 재생할 때의 타임아웃.
const EDGE_TIMEOUT: Duration = Duration::from_secs(5);

/// 커넥션의 소유자. 태스크의 마지막 행동에서 제거를 요청받는다.
pub trait ConnOwner {
    /**
     * 커넥션 태스크가 종료하며 자신을 제거해 달라고 요청한다.
     *
     * 호출하는 태스크의 스택이 아직 살아있으므로, 소유자는 실제 삭제를 자신의
     * cycle까지 미뤄야 한다.
     */
    fn remove(&self, id: u64);
}

/**
 * vhost별 reload 콜백. 서버의 reload 디스패치가 해당 vhost의 커넥션에만 호출한다.
 *
 * vhost_removed를 제외한 콜백은 새 설정을 다시 읽어 메모리의 정책만 바꾼다.
 */
pub trait ReloadHandler {
    fn on_vhost_removed(&self, _vhost: &str) {}
    fn on_vhost_mw(&self, _vhost: &str) {}
    fn on_vhost_smi(&self, _vhost: &str) {}
    fn on_vhost_tcp_nodelay(&self, _vhost: &str) {}
    fn on_vhost_realtime(&self, _vhost: &str) {}
    fn on_vhost_p1stpt(&self, _vhost: &str) {}
    fn on_vhost_pnt(&self, _vhost: &str) {}
}

pub struct RtmpConn {
    id: u64,
    owner: Weak<dyn ConnOwner>,
    config: Rc<RefCell<Config>>,
    sources: SourceHub,
    hooks: Rc<dyn HookBackend>,

    skt: Rc<Socket>,
    rtmp: Rc<RtmpServer>,
    req: RefCell<Request>,
    res: RefCell<Response>,

    // 커넥션 태스크와 공유하는 loop 플래그. vhost 제거 시 내려간다.
    control: TaskControl,

    client_type: Cell<RtmpConnType>,
    // 라이브 플레이의 경과 시간.
    duration: Cell<Duration>,
    kbps: Kbps,

    // 정책 노브. reload 콜백이 갱신하고, 서비스 루프가 매 iteration 읽는다.
    mw_sleep: Cell<Duration>,
    mw_enabled: Cell<bool>,
    realtime: Cell<bool>,
    send_min_interval: Cell<Duration>,
    publish_1stpkt_timeout: Cell<Duration>,
    publish_normal_timeout: Cell<Duration>,
    tcp_nodelay: Cell<bool>,
    nodelay_applied: Cell<Option<bool>>,

    // token traverse의 origin별 성공/실패 횟수.
    edge_origin_success: Cell<u32>,
    edge_origin_failures: Cell<u32>,
}

impl RtmpConn {
    pub fn new(
        id: u64,
        stream: TcpStream,
        owner: Weak<dyn ConnOwner>,
        config: Rc<RefCell<Config>>,
        sources: SourceHub,
        hooks: Rc<dyn HookBackend>,
    ) -> RtmpConn {
        let skt = Rc::new(Socket::new(stream));
        let rtmp = Rc::new(RtmpServer::new(skt.clone()));
        let kbps = Kbps::new(skt.clone());

        RtmpConn {
            id,
            owner,
            config,
            sources,
            hooks,
            skt,
            rtmp,
            req: RefCell::new(Request::default()),
            res: RefCell::new(Response::default()),
            control: TaskControl::new(),
            client_type: Cell::new(RtmpConnType::Unknown),
            duration: Cell::new(Duration::ZERO),
            kbps,
            mw_sleep: Cell::new(Duration::ZERO),
            mw_enabled: Cell::new(false),
            realtime: Cell::new(false),
            send_min_interval: Cell::new(Duration::ZERO),
            publish_1stpkt_timeout: Cell::new(Duration::ZERO),
            publish_normal_timeout: Cell::new(Duration::ZERO),
            tcp_nodelay: Cell::new(false),
            nodelay_applied: Cell::new(None),
            edge_origin_success: Cell::new(0),
            edge_origin_failures: Cell::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn control(&self) -> TaskControl {
        self.control.clone()
    }

    pub fn vhost(&self) -> String {
        self.req.borrow().vhost.clone()
    }

    pub fn client_type(&self) -> RtmpConnType {
        self.client_type.get()
    }

    pub fn response(&self) -> Response {
        self.res.borrow().clone()
    }

    pub fn duration(&self) -> Duration {
        self.duration.get()
    }

    /// 정리를 요청한다. 서비스 루프는 다음 yield에서 종료한다.
    pub fn dispose(&self) {
        self.control.interrupt();
    }

    // 커넥션 태스크의 마지막 행동. 소유자에게 제거를 요청한다.
    pub(crate) fn on_task_stop(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }

    pub fn resample(&self) {
        self.kbps.resample();
    }

    pub fn get_send_bytes_delta(&self) -> u64 {
        self.kbps.get_send_bytes_delta()
    }

    pub fn get_recv_bytes_delta(&self) -> u64 {
        self.kbps.get_recv_bytes_delta()
    }

    pub fn cleanup(&self) {
        self.kbps.cleanup();
    }

    /**
     * 커넥션의 본 cycle.
     *
     * admission 어느 단계에서 실패하든, on_connect 훅이 성공했다면 on_close 훅을
     * 대칭으로 호출한다.
     */
    pub async fn do_cycle(&self) -> Result<()> {
        let peer = self
            .skt
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(id = self.id, ip = %peer, "serve rtmp client");

        // 핸드셰이크와 커맨드 교환이 영원히 매달리지 않도록 한다.
        self.skt.set_recv_timeout(Some(RTMP_TIMEOUT));
        self.skt.set_send_timeout(Some(RTMP_TIMEOUT));

        self.rtmp.handshake().await?;

        let req = self.rtmp.connect_app().await?;
        info!(
            id = self.id,
            tc_url = %req.tc_url,
            vhost = %req.vhost,
            app = %req.app,
            "connect app"
        );
        *self.req.borrow_mut() = req;

        self.check_vhost()?;

        // 엣지라면 origin으로 자격을 재생해 검증한다.
        let traverse = {
            let config = self.config.borrow();
            let req = self.req.borrow();
            config
                .vhost(&req.vhost)
                .map(|v| v.is_edge() && v.edge_token_traverse)
                .unwrap_or(false)
        };
        if traverse {
            self.check_edge_token_traverse_auth().await?;
        }

        let connect_hook_fired = match self.http_hooks_on_connect().await {
            Ok(fired) => fired,
            Err(err) => {
                // 훅 거절은 이 커넥션에 치명적이다.
                let _ = self.rtmp.response_connect_reject("hook rejected").await;
                return Err(err);
            }
        };

        let ret = self.service_cycle().await;

        if connect_hook_fired {
            self.http_hooks_on_close().await;
        }
        ret
    }

    async fn service_cycle(&self) -> Result<()> {
        self.rtmp.response_connect_app().await?;
        self.stream_service_cycle().await
    }

    /// 스트림 서비스. 클라이언트를 먼저 판별한다.
    async fn stream_service_cycle(&self) -> Result<()> {
        let (client_type, stream) = self.rtmp.identify_client().await?;
        self.client_type.set(client_type);
        self.req.borrow_mut().stream = stream;

        info!(
            id = self.id,
            client_type = client_type.as_str(),
            stream = %self.req.borrow().stream,
            "client identified"
        );

        self.load_vhost_policy();

        let source = {
            let req = self.req.borrow();
            self.sources.fetch_or_create(&req)
        };

        match client_type {
            RtmpConnType::Play => self.playing(source).await,
            RtmpConnType::FmlePublish | RtmpConnType::FlashPublish => {
                self.publishing(source).await
            }
            RtmpConnType::Unknown => Err(Error::Protocol("unknown client type".into())),
        }
    }

    /// vhost가 존재하는지, refer 규칙에 걸리는지 확인한다.
    fn check_vhost(&self) -> Result<()> {
        let config = self.config.borrow();
        let req = self.req.borrow();

        let vhost = config.vhost(&req.vhost).ok_or_else(|| {
            Error::AdmissionDenied(format!("vhost {} not found", req.vhost))
        })?;

        if !req.page_url.is_empty() {
            for pattern in &vhost.refer_deny {
                if req.page_url.contains(pattern) {
                    return Err(Error::AdmissionDenied(format!(
                        "refer denied by '{}'",
                        pattern
                    )));
                }
            }
        }
        Ok(())
    }

    /// vhost의 정책 노브를 커넥션 로컬 상태로 읽어온다.
    fn load_vhost_policy(&self) {
        let config = self.config.borrow();
        let req = self.req.borrow();
        let vhost = match config.vhost(&req.vhost) {
            Some(v) => v,
            None => return,
        };

        self.change_mw_sleep(vhost.mw_sleep());
        self.mw_enabled.set(vhost.mw_enabled);
        self.realtime.set(vhost.realtime);
        self.send_min_interval.set(vhost.send_min_interval());
        self.publish_1stpkt_timeout.set(vhost.publish_1stpkt_timeout());
        self.publish_normal_timeout.set(vhost.publish_normal_timeout());
        self.tcp_nodelay.set(vhost.tcp_nodelay);
    }

    /**
     * merged-write 마감을 조정한다. Consumer는 다음 wait에서 새 마감을 그대로
     * 받으므로 별도 통지가 필요 없다.
     */
    fn change_mw_sleep(&self, sleep: Duration) {
        self.mw_sleep.set(sleep);
    }

    /// TCP_NODELAY는 플래그가 바뀌는 순간에만 소켓에 적용한다.
    fn set_sock_options(&self) {
        let want = self.tcp_nodelay.get();
        if self.nodelay_applied.get() == Some(want) {
            return;
        }

        match self.skt.set_nodelay(want) {
            Ok(()) => {
                self.nodelay_applied.set(Some(want));
                debug!(id = self.id, nodelay = want, "apply tcp_nodelay");
            }
            Err(err) => {
                warn!(id = self.id, cause = %err, "set tcp_nodelay failed");
            }
        }
    }

    // ---- 플레이 ----

    async fn playing(&self, source: Source) -> Result<()> {
        self.http_hooks_on_play().await?;

        let mut consumer = source.create_consumer();
        self.rtmp.start_play().await?;

        /*
         * 플레이어는 제어 메시지를 영영 안 보낼 수도 있다. 수신 태스크의 첫
         * 읽기부터 무기한 대기여야 하므로, 태스크 가동 전에 타임아웃을 푼다.
         */
        self.skt.set_recv_timeout(None);

        let mut trd = QueueRecvThread::new(self.rtmp.clone());
        trd.start().await?;

        let ret = self.do_playing(&source, &mut consumer, &trd).await;

        trd.stop().await;
        self.http_hooks_on_stop().await;
        ret
    }

    /**
     * 플레이의 전경 루프.
     *
     * 수신 태스크가 버퍼링한 제어 메시지를 비우고, Consumer에서 merged-write
     * 마감까지 모인 메시지들을 하나의 gathered write로 내보낸다. 정책 노브는
     * reload로 바뀌었을 수 있으므로 매 iteration 다시 읽는다.
     */
    async fn do_playing(
        &self,
        _source: &Source,
        consumer: &mut Consumer,
        trd: &QueueRecvThread,
    ) -> Result<()> {
        let starttime = Instant::now();
        let mut last_batch: Option<Instant> = None;

        loop {
            if self.control.interrupted() {
                return Err(Error::SystemControl);
            }

            while let Some(msg) = trd.pump() {
                self.process_play_control_msg(consumer, msg)?;
            }
            if let Some(err) = trd.error_code() {
                return Err(err);
            }

            self.set_sock_options();

            let realtime = self.realtime.get();
            let mw_enabled = self.mw_enabled.get();
            let mw_sleep = self.mw_sleep.get();
            let smi = self.send_min_interval.get();

            // send_min_interval은 배치 간격의 하한이다.
            if !smi.is_zero() {
                if let Some(last) = last_batch {
                    let since = last.elapsed();
                    if since < smi {
                        time::sleep(smi - since).await;
                    }
                }
            }

            // realtime이면 merged-write는 무시된다.
            let msgs = if realtime || !mw_enabled || mw_sleep.is_zero() {
                consumer.dump_realtime(MW_MAX_MSGS, REALTIME_TICK).await
            } else {
                consumer.dump_packets(MW_MAX_MSGS, mw_sleep).await
            };
            last_batch = Some(Instant::now());

            if msgs.is_empty() {
                continue;
            }

            let nwrite = self.rtmp.send_messages(&msgs).await?;
            debug!(
                id = self.id,
                count = msgs.len(),
                bytes = nwrite,
                "send play batch"
            );

            self.duration.set(starttime.elapsed());
        }
    }

    /// 플레이어의 제어 메시지를 처리한다.
    fn process_play_control_msg(
        &self,
        consumer: &mut Consumer,
        msg: RtmpMessage,
    ) -> Result<()> {
        let (name, args) = match msg.as_command() {
            Some(v) => v,
            None => {
                debug!(id = self.id, "ignore non-command message from player");
                return Ok(());
            }
        };

        match name.as_str() {
            "closeStream" | "close" => {
                info!(id = self.id, "player closed stream");
                Err(Error::ClientGracefullyClosed)
            }
            "pause" => {
                let paused = args.get(0).map(|s| s == "true").unwrap_or(false);
                consumer.set_pause(paused);
                info!(id = self.id, paused, "player pause");
                Ok(())
            }
            "setBufferLength" => {
                debug!(id = self.id, len = ?args.get(0), "set buffer length");
                Ok(())
            }
            _ => {
                debug!(id = self.id, command = %name, "ignore play control message");
                Ok(())
            }
        }
    }

    // ---- 퍼블리시 ----

    async fn publishing(&self, source: Source) -> Result<()> {
        let is_edge = {
            let config = self.config.borrow();
            let req = self.req.borrow();
            config.vhost(&req.vhost).map(|v| v.is_edge()).unwrap_or(false)
        };

        self.acquire_publish(&source, is_edge)?;

        if let Err(err) = self.http_hooks_on_publish().await {
            self.release_publish(&source);
            return Err(err);
        }

        let start_ret = match self.client_type.get() {
            RtmpConnType::FmlePublish => self.rtmp.start_publish_fmle().await,
            _ => self.rtmp.start_publish_flash().await,
        };
        if let Err(err) = start_ret {
            self.release_publish(&source);
            return Err(err);
        }

        /*
         * 수신 태스크의 읽기는 무기한이다. 첫 패킷/일반 패킷 타임아웃은 전경
         * 감시자가 강제한다.
         */
        self.skt.set_recv_timeout(None);

        let mut trd = PublishRecvThread::new(self.rtmp.clone(), source.clone());
        let ret = match trd.start().await {
            Ok(()) => self.do_publishing(&source, &trd).await,
            Err(err) => Err(err),
        };

        trd.stop().await;

        // publish가 실제로 관측된 경우에만 unpublish 훅이 의미가 있다.
        let observed = trd.nb_msgs() > 0;
        self.release_publish(&source);
        if observed {
            self.http_hooks_on_unpublish().await;
        }
        ret
    }

    /**
     * 퍼블리시의 전경 루프. 타임아웃 감시자.
     *
     * 첫 패킷은 publish_1stpkt_timeout 안에, 이후 패킷은 publish_normal_timeout
     * 안에 도착해야 한다. 위반하면 커넥션을 닫는다. 타임아웃 노브는 reload로
     * 바뀔 수 있으므로 매 iteration 다시 읽는다.
     */
    async fn do_publishing(&self, _source: &Source, trd: &PublishRecvThread) -> Result<()> {
        loop {
            if self.control.interrupted() {
                return Err(Error::SystemControl);
            }

            let timeout = if trd.nb_msgs() == 0 {
                self.publish_1stpkt_timeout.get()
            } else {
                self.publish_normal_timeout.get()
            };

            match time::timeout(timeout, trd.wait()).await {
                Ok(()) => {
                    if let Some(err) = trd.error_code() {
                        return Err(err);
                    }
                }
                Err(_) => {
                    warn!(
                        id = self.id,
                        timeout_ms = timeout.as_millis() as u64,
                        nb_msgs = trd.nb_msgs(),
                        "publish timeout, close connection"
                    );
                    return Err(Error::SocketTimeout);
                }
            }
        }
    }

    fn acquire_publish(&self, source: &Source, is_edge: bool) -> Result<()> {
        source.acquire_publish(is_edge).map_err(|err| {
            warn!(id = self.id, source = source.key(), "publish already held");
            err
        })
    }

    fn release_publish(&self, source: &Source) {
        source.release_publish();
    }

    // ---- 엣지 token traverse ----

    /**
     * 설정된 origin들을 순회하며 클라이언트의 자격을 재생한다. 첫 성공에서
     * 멈추고, 전부 실패하면 admission을 거부한다.
     */
    async fn check_edge_token_traverse_auth(&self) -> Result<()> {
        let origins = {
            let config = self.config.borrow();
            let req = self.req.borrow();
            config
                .vhost(&req.vhost)
                .map(|v| v.edge_origins.clone())
                .unwrap_or_default()
        };
        let req = self.req.borrow().clone();

        for origin in &origins {
            match self.connect_origin(origin).await {
                Ok(client) => match self.do_token_traverse_auth(&client, &req).await {
                    Ok(()) => {
                        self.edge_origin_success.set(self.edge_origin_success.get() + 1);
                        info!(id = self.id, origin = %origin, "token traverse ok");
                        return Ok(());
                    }
                    Err(err) => {
                        self.edge_origin_failures.set(self.edge_origin_failures.get() + 1);
                        warn!(id = self.id, origin = %origin, cause = %err, "token traverse failed");
                    }
                },
                Err(err) => {
                    self.edge_origin_failures.set(self.edge_origin_failures.get() + 1);
                    warn!(id = self.id, origin = %origin, cause = %err, "connect origin failed");
                }
            }
        }

        Err(Error::EdgeTokenFail)
    }

    async fn connect_origin(&self, origin: &str) -> Result<RtmpClient> {
        let stream = TcpStream::connect(origin).await?;
        let skt = Rc::new(Socket::new(stream));
        skt.set_recv_timeout(Some(EDGE_TIMEOUT));
        skt.set_send_timeout(Some(EDGE_TIMEOUT));
        Ok(RtmpClient::new(skt))
    }

    async fn do_token_traverse_auth(&self, client: &RtmpClient, req: &Request) -> Result<()> {
        client.handshake().await?;
        client.connect_app(&req.tc_url, &req.page_url).await?;
        Ok(())
    }

    pub fn edge_origin_counters(&self) -> (u32, u32) {
        (self.edge_origin_success.get(), self.edge_origin_failures.get())
    }

    // ---- HTTP 훅 ----

    fn hook_url(&self, event: HookEvent) -> Option<String> {
        let config = self.config.borrow();
        let req = self.req.borrow();
        let hooks = &config.vhost(&req.vhost)?.hooks;

        match event {
            HookEvent::OnConnect => hooks.on_connect.clone(),
            HookEvent::OnClose => hooks.on_close.clone(),
            HookEvent::OnPublish => hooks.on_publish.clone(),
            HookEvent::OnUnpublish => hooks.on_unpublish.clone(),
            HookEvent::OnPlay => hooks.on_play.clone(),
            HookEvent::OnStop => hooks.on_stop.clone(),
        }
    }

    /// on_connect 훅. 실제로 호출했는지를 반환하여 on_close와 짝을 맞춘다.
    async fn http_hooks_on_connect(&self) -> Result<bool> {
        let url = match self.hook_url(HookEvent::OnConnect) {
            Some(u) => u,
            None => return Ok(false),
        };
        let req = self.req.borrow().clone();
        self.hooks
            .call(&url, HookEvent::OnConnect, self.id, &req)
            .await?;
        Ok(true)
    }

    async fn http_hooks_on_close(&self) {
        self.fire_and_forget(HookEvent::OnClose).await;
    }

    async fn http_hooks_on_publish(&self) -> Result<()> {
        let url = match self.hook_url(HookEvent::OnPublish) {
            Some(u) => u,
            None => return Ok(()),
        };
        let req = self.req.borrow().clone();
        self.hooks
            .call(&url, HookEvent::OnPublish, self.id, &req)
            .await
    }

    async fn http_hooks_on_unpublish(&self) {
        self.fire_and_forget(HookEvent::OnUnpublish).await;
    }

    async fn http_hooks_on_play(&self) -> Result<()> {
        let url = match self.hook_url(HookEvent::OnPlay) {
            Some(u) => u,
            None => return Ok(()),
        };
        let req = self.req.borrow().clone();
        self.hooks
            .call(&url, HookEvent::OnPlay, self.id, &req)
            .await
    }

    async fn http_hooks_on_stop(&self) {
        self.fire_and_forget(HookEvent::OnStop).await;
    }

    /// 종료 계열 훅은 실패해도 커넥션 정리를 막지 않는다.
    async fn fire_and_forget(&self, event: HookEvent) {
        let url = match self.hook_url(event) {
            Some(u) => u,
            None => return,
        };
        let req = self.req.borrow().clone();
        if let Err(err) = self.hooks.call(&url, event, self.id, &req).await {
            warn!(id = self.id, cause = %err, "notify hook failed");
        }
    }
}

/**
 * 커넥션을 one-shot 태스크에 싣기 위한 어댑터.
 *
 * cycle 하나가 커넥션 수명 전체이고, on_stop이 커넥션의 마지막 행동이다.
 */
pub struct ConnCycle {
    conn: Rc<RtmpConn>,
}

impl ConnCycle {
    pub fn new(conn: Rc<RtmpConn>) -> ConnCycle {
        ConnCycle { conn }
    }
}

#[async_trait(?Send)]
impl CycleHandler for ConnCycle {
    async fn cycle(&mut self) -> Result<()> {
        self.conn.do_cycle().await
    }

    fn on_stop(&mut self) {
        self.conn.on_task_stop();
    }
}

impl ReloadHandler for RtmpConn {
    fn on_vhost_removed(&self, vhost: &str) {
        info!(id = self.id, vhost = %vhost, "vhost removed, close connection");
        // 서비스 루프가 다음 yield에서 종료한다.
        self.control.interrupt();
    }

    fn on_vhost_mw(&self, vhost: &str) {
        let (sleep, enabled) = {
            let config = self.config.borrow();
            match config.vhost(vhost) {
                Some(v) => (v.mw_sleep(), v.mw_enabled),
                None => return,
            }
        };
        self.change_mw_sleep(sleep);
        self.mw_enabled.set(enabled);
        info!(id = self.id, mw_sleep_ms = sleep.as_millis() as u64, enabled, "reload mw");
    }

    fn on_vhost_smi(&self, vhost: &str) {
        let smi = {
            let config = self.config.borrow();
            match config.vhost(vhost) {
                Some(v) => v.send_min_interval(),
                None => return,
            }
        };
        self.send_min_interval.set(smi);
        info!(id = self.id, smi_ms = smi.as_millis() as u64, "reload send_min_interval");
    }

    fn on_vhost_tcp_nodelay(&self, vhost: &str) {
        let nodelay = {
            let config = self.config.borrow();
            match config.vhost(vhost) {
                Some(v) => v.tcp_nodelay,
                None => return,
            }
        };
        self.tcp_nodelay.set(nodelay);
        info!(id = self.id, nodelay, "reload tcp_nodelay");
    }

    fn on_vhost_realtime(&self, vhost: &str) {
        let realtime = {
            let config = self.config.borrow();
            match config.vhost(vhost) {
                Some(v) => v.realtime,
                None => return,
            }
        };
        self.realtime.set(realtime);
        info!(id = self.id, realtime, "reload realtime");
    }

    fn on_vhost_p1stpt(&self, vhost: &str) {
        let timeout = {
            let config = self.config.borrow();
            match config.vhost(vhost) {
                Some(v) => v.publish_1stpkt_timeout(),
                None => return,
            }
        };
        self.publish_1stpkt_timeout.set(timeout);
        info!(id = self.id, timeout_ms = timeout.as_millis() as u64, "reload publish 1stpkt timeout");
    }

    fn on_vhost_pnt(&self, vhost: &str) {
        let timeout = {
            let config = self.config.borrow();
            match config.vhost(vhost) {
                Some(v) => v.publish_normal_timeout(),
                None => return,
            }
        };
        self.publish_normal_timeout.set(timeout);
        info!(id = self.id, timeout_ms = timeout.as_millis() as u64, "reload publish normal timeout");
    }
}
