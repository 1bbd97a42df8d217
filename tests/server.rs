//! 서버 코어의 end-to-end 시나리오.
//!
//! 실제 루프백 TCP 위에서 시뮬레이션 클라이언트(RtmpClient)로 서버를 구동한다.
//! 모든 태스크는 current-thread 런타임의 'LocalSet' 위에서 돈다.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;
use tokio::time::{self, Instant};

use mini_rtmp::config::{Config, HooksConf, ListenConf, VhostConf};
use mini_rtmp::hooks::{HookBackend, HookEvent};
use mini_rtmp::listener::ListenerKind;
use mini_rtmp::rtmp::{Request, RtmpClient, RtmpServer};
use mini_rtmp::server::Server;
use mini_rtmp::socket::Socket;
use mini_rtmp::{MessageKind, Result, RtmpMessage};

/// 훅 호출을 기록만 하는 백엔드.
#[derive(Clone)]
struct RecordingHooks {
    calls: Rc<RefCell<Vec<String>>>,
}

impl RecordingHooks {
    fn new() -> RecordingHooks {
        RecordingHooks {
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn has(&self, action: &str) -> bool {
        self.calls.borrow().iter().any(|c| c == action)
    }
}

#[async_trait(?Send)]
impl HookBackend for RecordingHooks {
    async fn call(
        &self,
        _url: &str,
        event: HookEvent,
        _client_id: u64,
        _req: &Request,
    ) -> Result<()> {
        self.calls.borrow_mut().push(event.action().to_string());
        Ok(())
    }
}

/// 모든 훅이 설정된 vhost 하나짜리 설정을 만든다.
fn test_config(vhost: VhostConf) -> Config {
    let mut config = Config::default();
    config.pid_file = std::env::temp_dir().join(format!(
        "mini-rtmp-e2e-{}-{}.pid",
        std::process::id(),
        rand_suffix()
    ));
    config.listens.push(ListenConf {
        kind: ListenerKind::RtmpStream,
        ip: "127.0.0.1".to_string(),
        port: 0,
    });

    let mut vhost = vhost;
    vhost.hooks = HooksConf {
        on_connect: Some("test://on_connect".into()),
        on_close: Some("test://on_close".into()),
        on_publish: Some("test://on_publish".into()),
        on_unpublish: Some("test://on_unpublish".into()),
        on_play: Some("test://on_play".into()),
        on_stop: Some("test://on_stop".into()),
    };
    config.vhosts.insert("live".to_string(), vhost);
    config
}

fn rand_suffix() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

fn live_request(stream: &str) -> Request {
    let mut req = Request::default();
    req.tc_url = "rtmp://127.0.0.1/live?vhost=live".to_string();
    req.vhost = "live".to_string();
    req.app = "live".to_string();
    req.stream = stream.to_string();
    req
}

/// 임시 포트로 리스닝하는 서버를 만들고 주소를 돌려준다.
async fn start_server(
    config: Config,
    hooks: RecordingHooks,
) -> (Rc<mini_rtmp::server::ServerCore>, std::net::SocketAddr) {
    let mut server = Server::with_hooks(config, Rc::new(hooks));
    server.listen().await.unwrap();

    let addr = server.first_listener_addr().unwrap();
    let core = server.handle();

    // 수퍼비전 cycle을 배경에 돌린다. LocalSet이 끝나면 함께 내려간다.
    tokio::task::spawn_local(async move {
        let _ = server.cycle().await;
    });

    (core, addr)
}

async fn connect_client(addr: std::net::SocketAddr) -> RtmpClient {
    let stream = TcpStream::connect(addr).await.unwrap();
    let skt = Rc::new(Socket::new(stream));
    skt.set_recv_timeout(Some(Duration::from_secs(3)));
    skt.set_send_timeout(Some(Duration::from_secs(3)));

    let client = RtmpClient::new(skt);
    client.handshake().await.unwrap();
    client
        .connect_app("rtmp://127.0.0.1/live?vhost=live", "")
        .await
        .unwrap();
    client
}

/**
 * 시나리오 1: 플레이어 attach 후 graceful close.
 *
 * mw_sleep=350에서 30ms 간격의 프레임 10개는 하나의 gathered write로 8개 이상
 * 묶여 나와야 한다. 이후 closeStream은 커넥션을 정상 종료시키고 on_stop 훅을
 * 쏜다.
 */
#[tokio::test]
async fn player_attach_then_graceful_close() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let vhost = VhostConf {
                mw_sleep_ms: 350,
                mw_enabled: true,
                ..VhostConf::default()
            };
            let hooks = RecordingHooks::new();
            let (core, addr) = start_server(test_config(vhost), hooks.clone()).await;

            let client = connect_client(addr).await;
            client.play("foo").await.unwrap();

            // 플레이어가 attach된 Source에 프레임을 흘린다.
            let source = core.sources().fetch_or_create(&live_request("foo"));
            let t0 = Instant::now();
            let feeder = tokio::task::spawn_local({
                let source = source.clone();
                async move {
                    for i in 0..10u32 {
                        source.on_video(RtmpMessage::video(i * 30, Bytes::from_static(b"frame")));
                        time::sleep(Duration::from_millis(30)).await;
                    }
                }
            });

            let mut arrivals = Vec::new();
            for _ in 0..8 {
                let msg = client.recv_message().await.unwrap();
                assert_eq!(msg.kind, MessageKind::Video);
                arrivals.push(t0.elapsed());
            }
            feeder.await.unwrap();

            // 첫 프레임은 merged-write 마감 무렵에야 도착한다.
            assert!(
                arrivals[0] >= Duration::from_millis(250),
                "first frame arrived too early: {:?}",
                arrivals[0]
            );
            // 8개가 한 배치로 함께 도착한다.
            assert!(
                arrivals[7] - arrivals[0] <= Duration::from_millis(200),
                "batch spread too wide: {:?}",
                arrivals[7] - arrivals[0]
            );

            // graceful close.
            client
                .send_message(RtmpMessage::command("closeStream", &[]))
                .await
                .unwrap();
            time::sleep(Duration::from_millis(800)).await;

            let calls = hooks.calls();
            assert!(hooks.has("on_connect"), "calls: {:?}", calls);
            assert!(hooks.has("on_play"), "calls: {:?}", calls);
            assert!(hooks.has("on_stop"), "calls: {:?}", calls);
            assert!(hooks.has("on_close"), "calls: {:?}", calls);
        })
        .await;
}

/**
 * 시나리오 2: 퍼블리셔의 첫 패킷 타임아웃.
 *
 * publish는 성공하지만 미디어가 오지 않으면 publish_1stpkt_timeout에 커넥션이
 * 닫힌다. publish가 관측되지 않았으므로 on_unpublish는 호출되지 않고, on_close는
 * 호출된다.
 */
#[tokio::test]
async fn publisher_first_packet_timeout() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let vhost = VhostConf {
                publish_1stpkt_timeout_ms: 300,
                ..VhostConf::default()
            };
            let hooks = RecordingHooks::new();
            let (_core, addr) = start_server(test_config(vhost), hooks.clone()).await;

            let client = connect_client(addr).await;
            client.publish_flash("foo").await.unwrap();

            // 미디어를 보내지 않고 타임아웃을 기다린다.
            time::sleep(Duration::from_millis(900)).await;

            let calls = hooks.calls();
            assert!(hooks.has("on_publish"), "calls: {:?}", calls);
            assert!(!hooks.has("on_unpublish"), "calls: {:?}", calls);
            assert!(hooks.has("on_close"), "calls: {:?}", calls);
        })
        .await;
}

/**
 * 패킷이 규칙적으로 오는 퍼블리셔는 열린 채로 유지되고, 끊기면 일반 패킷
 * 타임아웃이 커넥션을 닫는다. 관측된 publish였으므로 on_unpublish가 호출된다.
 */
#[tokio::test]
async fn publisher_with_regular_packets_stays_open() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let vhost = VhostConf {
                publish_1stpkt_timeout_ms: 600,
                publish_normal_timeout_ms: 600,
                ..VhostConf::default()
            };
            let hooks = RecordingHooks::new();
            let (_core, addr) = start_server(test_config(vhost), hooks.clone()).await;

            let client = connect_client(addr).await;
            client.publish_flash("foo").await.unwrap();

            // 100ms 간격이면 타임아웃에 걸리지 않는다.
            for i in 0..10u32 {
                client
                    .send_message(RtmpMessage::video(i * 100, Bytes::from_static(b"frame")))
                    .await
                    .unwrap();
                time::sleep(Duration::from_millis(100)).await;
            }
            assert!(!hooks.has("on_close"), "calls: {:?}", hooks.calls());

            // 전송을 멈추면 일반 패킷 타임아웃이 닫는다.
            time::sleep(Duration::from_millis(1500)).await;

            let calls = hooks.calls();
            assert!(hooks.has("on_unpublish"), "calls: {:?}", calls);
            assert!(hooks.has("on_close"), "calls: {:?}", calls);
        })
        .await;
}

/**
 * 시나리오 3: 플레이 중 reload.
 *
 * mw_sleep=0, realtime=true로 reload하면 다음 배치부터 프레임이 개별로 전달된다.
 */
#[tokio::test]
async fn reload_mid_play_switches_to_realtime() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let vhost = VhostConf {
                mw_sleep_ms: 350,
                mw_enabled: true,
                ..VhostConf::default()
            };
            let config = test_config(vhost.clone());
            let hooks = RecordingHooks::new();
            let (core, addr) = start_server(config.clone(), hooks.clone()).await;

            let client = connect_client(addr).await;
            client.play("foo").await.unwrap();

            let source = core.sources().fetch_or_create(&live_request("foo"));

            // 배치 모드 확인용 워밍업 프레임.
            for i in 0..3u32 {
                source.on_video(RtmpMessage::video(i, Bytes::from_static(b"warm")));
            }
            for _ in 0..3 {
                client.recv_message().await.unwrap();
            }

            // 실시간으로 reload한다.
            let mut new_config = config.clone();
            {
                let v = new_config.vhosts.get_mut("live").unwrap();
                v.mw_sleep_ms = 0;
                v.realtime = true;
            }
            core.apply_reload(new_config);

            // 진행중인 merged-write 마감이 끝나길 기다린다.
            time::sleep(Duration::from_millis(500)).await;

            let feeder = tokio::task::spawn_local({
                let source = source.clone();
                async move {
                    for i in 0..5u32 {
                        source.on_video(RtmpMessage::video(1000 + i, Bytes::from_static(b"rt")));
                        time::sleep(Duration::from_millis(40)).await;
                    }
                }
            });

            let t0 = Instant::now();
            let mut arrivals = Vec::new();
            for _ in 0..5 {
                client.recv_message().await.unwrap();
                arrivals.push(t0.elapsed());
            }
            feeder.await.unwrap();

            // 개별 전달이면 5개가 한 clump이 아니라 공급 간격만큼 퍼져 도착한다.
            let spread = arrivals[4] - arrivals[0];
            assert!(
                spread >= Duration::from_millis(100),
                "frames arrived as one batch after realtime reload: {:?}",
                spread
            );
        })
        .await;
}

/**
 * FMLE 퍼블리셔 → Source → 플레이어의 전체 릴레이.
 *
 * 실시간 vhost에서 퍼블리셔가 보낸 프레임이 플레이어에게 순서대로 도달한다.
 */
#[tokio::test]
async fn fmle_publisher_feeds_player() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let vhost = VhostConf {
                realtime: true,
                mw_sleep_ms: 0,
                ..VhostConf::default()
            };
            let hooks = RecordingHooks::new();
            let (_core, addr) = start_server(test_config(vhost), hooks.clone()).await;

            // 플레이어가 먼저 attach한다.
            let player = connect_client(addr).await;
            player.play("foo").await.unwrap();

            let publisher = connect_client(addr).await;
            publisher.publish_fmle("foo").await.unwrap();

            for i in 0..3u32 {
                publisher
                    .send_message(RtmpMessage::video(i, Bytes::from_static(b"frame")))
                    .await
                    .unwrap();
                time::sleep(Duration::from_millis(30)).await;
            }

            let mut stamps = Vec::new();
            for _ in 0..3 {
                let msg = player.recv_message().await.unwrap();
                assert_eq!(msg.kind, MessageKind::Video);
                stamps.push(msg.timestamp);
            }
            assert_eq!(stamps, vec![0, 1, 2]);

            // 같은 스트림의 두 번째 퍼블리셔는 거절된다.
            let second = connect_client(addr).await;
            assert!(second.publish_flash("foo").await.is_err());
        })
        .await;
}

/**
 * 시나리오 4: 엣지 token traverse.
 *
 * origin A는 거부(즉시 닫음), origin B는 수락. 커넥션은 진행되어야 하고,
 * A는 한 번 시도되고 B가 connect를 서비스해야 한다.
 */
#[tokio::test]
async fn edge_token_traverse_first_success_wins() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // origin A: 수락 즉시 닫는다.
            let a_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let a_addr = a_listener.local_addr().unwrap();
            let a_hits = Rc::new(RefCell::new(0u32));
            tokio::task::spawn_local({
                let a_hits = a_hits.clone();
                async move {
                    loop {
                        let (stream, _) = a_listener.accept().await.unwrap();
                        *a_hits.borrow_mut() += 1;
                        drop(stream);
                    }
                }
            });

            // origin B: 최소한의 origin. 핸드셰이크와 connect를 서비스한다.
            let b_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let b_addr = b_listener.local_addr().unwrap();
            let b_served = Rc::new(RefCell::new(0u32));
            tokio::task::spawn_local({
                let b_served = b_served.clone();
                async move {
                    loop {
                        let (stream, _) = b_listener.accept().await.unwrap();
                        let skt = Rc::new(Socket::new(stream));
                        let rtmp = RtmpServer::new(skt);
                        if rtmp.handshake().await.is_ok()
                            && rtmp.connect_app().await.is_ok()
                            && rtmp.response_connect_app().await.is_ok()
                        {
                            *b_served.borrow_mut() += 1;
                        }
                        // 검증이 끝날 때까지 소켓을 잡아둔다.
                        time::sleep(Duration::from_secs(1)).await;
                    }
                }
            });

            let vhost = VhostConf {
                edge_origins: vec![a_addr.to_string(), b_addr.to_string()],
                edge_token_traverse: true,
                ..VhostConf::default()
            };
            let hooks = RecordingHooks::new();
            let (_core, addr) = start_server(test_config(vhost), hooks.clone()).await;

            // traverse가 통과해야 connect가 성공한다.
            let client = connect_client(addr).await;
            client.play("foo").await.unwrap();

            assert_eq!(*a_hits.borrow(), 1, "origin A must be tried once");
            assert_eq!(*b_served.borrow(), 1, "origin B must serve the replay");
        })
        .await;
}

/**
 * 시나리오 5: 시그널 reload.
 *
 * reload 시그널은 latch를 세우고, 서버 cycle이 정확히 한 번 소비하며 지운다.
 */
#[tokio::test]
async fn signal_reload_latch_consumed_once() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let vhost = VhostConf::default();
            let hooks = RecordingHooks::new();

            let mut server = Server::with_hooks(test_config(vhost), Rc::new(hooks));
            server.listen().await.unwrap();
            server.initialize_signal().unwrap();
            server.register_signal().await.unwrap();

            let core = server.handle();
            let latches = core.latches();
            tokio::task::spawn_local(async move {
                let _ = server.cycle().await;
            });

            nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();

            // 브릿지가 latch를 세운다.
            let mut seen = false;
            for _ in 0..100 {
                if latches.reload() {
                    seen = true;
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }

            // cycle이 소비하여 지운다. (브릿지보다 cycle이 먼저 돌았어도,
            // 지워져 있다는 것이 소비되었다는 뜻이다.)
            let mut cleared = false;
            for _ in 0..300 {
                if !latches.reload() {
                    cleared = true;
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }

            assert!(seen || cleared, "reload signal never reached the latch");
            assert!(cleared, "reload latch never consumed");
        })
        .await;
}

/**
 * 시나리오 6: pid 파일에 의한 이중 기동 방지.
 *
 * 같은 pid 파일을 쓰는 두 번째 인스턴스는 리스너를 열기 전에 실패한다.
 */
#[tokio::test]
async fn double_start_is_prevented_by_pid_file() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = test_config(VhostConf::default());

            let mut first = Server::with_hooks(config.clone(), Rc::new(RecordingHooks::new()));
            first.acquire_pid_file().unwrap();

            let mut second = Server::with_hooks(config, Rc::new(RecordingHooks::new()));
            match second.acquire_pid_file() {
                Err(mini_rtmp::Error::RuntimeInit(_)) => {}
                other => panic!("expected runtime-init error, got {:?}", other),
            }
        })
        .await;
}
