/**
 * ! 서버 코어.
 * !
 * ! 리스너, 시그널 브릿지, 커넥션 매니저를 소유한다. 기동 워크플로우는
 * ! initialize → initialize_signal → acquire_pid_file → listen →
 * ! register_signal → cycle 순서다.
 * !
 * ! 메인 cycle은 ~1초 주기로: graceful-quit latch를 보면 정리하고 반환한다.
 * ! reload latch를 보면 reload를 디스패치하고 latch를 지운다. gmc-stop을 보면
 * ! 커넥션만 정리하고 호출자에게 돌아간다. 그 외에는 좀비 커넥션을 수거하고
 * ! kbps를 샘플링한다.
 */

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use nix::fcntl::{flock, FlockArg};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn::{ConnCycle, ConnOwner, ReloadHandler, RtmpConn};
use crate::hooks::{HookBackend, HttpHooks};
use crate::listener::{
    ListenerKind, MpegtsOverUdpCaster, StreamListener, TcpConnHandler, UdpStreamListener,
};
use crate::signal::{SignalLatches, SignalManager};
use crate::source::SourceHub;
use crate::task::{Task, TaskKind};
use crate::{Error, Result};

/// 메인 cycle의 주기.
const SYS_CYCLE_INTERVAL: Duration = Duration::from_millis(1000);

/**
 * 서버 cycle의 핸들러. 호출자가 cycle마다 개입할 수 있는 seam이다.
 */
pub trait ServerCycle {
    fn initialize(&mut self) -> Result<()>;
    fn on_cycle(&mut self, connections: usize) -> Result<()>;
}

/**
 * 살아있는 커넥션들의 추적.
 *
 * 커넥션 목록은 서버 태스크만 변형한다(accept에서 추가, 수거에서 제거).
 * 커넥션 태스크는 종료하며 'remove'로 수거를 요청할 뿐이고, 실제 삭제는 요청한
 * 태스크가 완전히 반환된 뒤 서버 cycle이 수행한다. 자신의 스택 프레임을 스스로
 * 해제하는 일을 피하기 위함이다.
 */
pub struct ConnManager {
    conns: RefCell<Vec<ConnEntry>>,
    zombies: RefCell<Vec<u64>>,
    next_id: Cell<u64>,
}

struct ConnEntry {
    id: u64,
    conn: Rc<RtmpConn>,
    task: Task,
}

impl ConnManager {
    fn new() -> ConnManager {
        ConnManager {
            conns: RefCell::new(Vec::new()),
            zombies: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn insert(&self, entry: ConnEntry) {
        self.conns.borrow_mut().push(entry);
    }

    pub fn len(&self) -> usize {
        self.conns.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.borrow().is_empty()
    }

    /// 수거 요청 목록을 비운다. 태스크가 완전히 반환된 뒤이므로 안전하게 지운다.
    async fn drain_zombies(&self) {
        let ids: Vec<u64> = self.zombies.borrow_mut().drain(..).collect();
        if ids.is_empty() {
            return;
        }

        let mut removed = Vec::new();
        {
            let mut conns = self.conns.borrow_mut();
            for id in ids {
                if let Some(pos) = conns.iter().position(|e| e.id == id) {
                    removed.push(conns.remove(pos));
                }
            }
        }

        for mut entry in removed {
            entry.task.stop().await;
            info!(id = entry.id, "connection reaped");
        }
    }

    /// 살아있는 커넥션 전부를 정리한다. graceful 종료 경로.
    async fn dispose(&self) {
        let mut entries = std::mem::replace(&mut *self.conns.borrow_mut(), Vec::new());
        if entries.is_empty() {
            return;
        }

        // 먼저 전부 interrupt를 걸어 두고, 그 다음 차례로 종료를 기다린다.
        for entry in &entries {
            entry.conn.dispose();
        }
        for entry in &mut entries {
            entry.task.stop().await;
        }

        info!(count = entries.len(), "all connections disposed");
        self.zombies.borrow_mut().clear();
    }

    /// 해당 vhost의 커넥션에만 콜백을 돌린다. 무관한 vhost는 건드리지 않는다.
    fn for_each_vhost<F>(&self, vhost: &str, f: F)
    where
        F: Fn(&RtmpConn),
    {
        for entry in self.conns.borrow().iter() {
            if entry.conn.vhost() == vhost {
                f(&entry.conn);
            }
        }
    }

    fn resample_kbps(&self) -> (u64, u64) {
        let mut send = 0;
        let mut recv = 0;
        for entry in self.conns.borrow().iter() {
            entry.conn.resample();
            send += entry.conn.get_send_bytes_delta();
            recv += entry.conn.get_recv_bytes_delta();
            entry.conn.cleanup();
        }
        (send, recv)
    }
}

impl ConnOwner for ConnManager {
    fn remove(&self, id: u64) {
        // 호출자는 자신의 태스크 안이다. 삭제는 서버 cycle까지 미룬다.
        self.zombies.borrow_mut().push(id);
    }
}

/**
 * 서버의 공유 코어. 리스너의 accept 태스크와 시그널 브릿지가 함께 참조한다.
 */
pub struct ServerCore {
    config: Rc<RefCell<Config>>,
    sources: SourceHub,
    hooks: Rc<dyn HookBackend>,
    conns: Rc<ConnManager>,
    latches: Rc<SignalLatches>,
}

impl ServerCore {
    /**
     * 리스너가 넘긴 디스크립터로 커넥션 변형을 만들고 태스크를 가동한다.
     *
     * RTMP만 이 코어가 서비스한다. 나머지 타입(HTTP api/stream, RTSP, FLV)은
     * 외부 표면의 몫이므로 로깅하고 닫는다.
     */
    pub async fn accept_client(&self, kind: ListenerKind, stream: TcpStream) -> Result<()> {
        match kind {
            ListenerKind::RtmpStream => {}
            other => {
                info!(kind = other.as_str(), "close client of external surface");
                return Ok(());
            }
        }

        let id = self.conns.alloc_id();
        let owner: Rc<dyn ConnOwner> = self.conns.clone();
        let conn = Rc::new(RtmpConn::new(
            id,
            stream,
            Rc::downgrade(&owner),
            self.config.clone(),
            self.sources.clone(),
            self.hooks.clone(),
        ));

        let mut task = Task::with_control(
            &format!("conn-{}", id),
            TaskKind::OneShot,
            Duration::ZERO,
            conn.control(),
            Box::new(ConnCycle::new(conn.clone())),
        );

        if let Err(err) = task.start().await {
            warn!(id, cause = %err, "start connection task failed");
            return Err(Error::TaskCreate(format!("conn-{}: {}", id, err)));
        }

        // start와 insert 사이에 yield가 없어야 한다. 수거가 항상 entry를 찾는다.
        self.conns.insert(ConnEntry { id, conn, task });
        debug!(id, conns = self.conns.len(), "client accepted");
        Ok(())
    }

    /**
     * 새 설정을 적용하고, vhost별 변경분을 해당 vhost의 커넥션에만 전파한다.
     * 디스패치는 노브 단위다.
     */
    pub fn apply_reload(&self, new: Config) {
        let old = self.config.borrow().clone();
        *self.config.borrow_mut() = new.clone();

        for (name, old_vh) in &old.vhosts {
            let new_vh = match new.vhosts.get(name) {
                Some(v) => v,
                None => {
                    info!(vhost = %name, "vhost removed on reload");
                    self.conns
                        .for_each_vhost(name, |c| c.on_vhost_removed(name));
                    continue;
                }
            };

            if old_vh.mw_sleep_ms != new_vh.mw_sleep_ms
                || old_vh.mw_enabled != new_vh.mw_enabled
            {
                self.conns.for_each_vhost(name, |c| c.on_vhost_mw(name));
            }
            if old_vh.send_min_interval_ms != new_vh.send_min_interval_ms {
                self.conns.for_each_vhost(name, |c| c.on_vhost_smi(name));
            }
            if old_vh.tcp_nodelay != new_vh.tcp_nodelay {
                self.conns
                    .for_each_vhost(name, |c| c.on_vhost_tcp_nodelay(name));
            }
            if old_vh.realtime != new_vh.realtime {
                self.conns
                    .for_each_vhost(name, |c| c.on_vhost_realtime(name));
            }
            if old_vh.publish_1stpkt_timeout_ms != new_vh.publish_1stpkt_timeout_ms {
                self.conns.for_each_vhost(name, |c| c.on_vhost_p1stpt(name));
            }
            if old_vh.publish_normal_timeout_ms != new_vh.publish_normal_timeout_ms {
                self.conns.for_each_vhost(name, |c| c.on_vhost_pnt(name));
            }
        }

        info!("reload applied");
    }

    pub fn sources(&self) -> SourceHub {
        self.sources.clone()
    }

    pub fn latches(&self) -> Rc<SignalLatches> {
        self.latches.clone()
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }
}

#[async_trait(?Send)]
impl TcpConnHandler for ServerCore {
    async fn on_tcp_client(&self, kind: ListenerKind, stream: TcpStream) -> Result<()> {
        self.accept_client(kind, stream).await
    }
}

/**
 * pid 파일. 서버 수명 동안 advisory write-lock을 잡는다.
 *
 * 다른 인스턴스가 이미 잡고 있으면 획득이 실패하여 이중 기동을 막는다. 파일은
 * 지우지 않는다. 락이 풀리는 것으로 충분하다.
 */
pub struct PidFile {
    // 락의 수명 = 파일 핸들의 수명.
    _file: std::fs::File,
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<PidFile> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::RuntimeInit(format!("mkdir {}: {}", parent.display(), e)))?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::RuntimeInit(format!("open pid file {}: {}", path.display(), e)))?;

        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            Error::RuntimeInit(format!(
                "pid file {} locked by another instance: {}",
                path.display(),
                e
            ))
        })?;

        file.set_len(0)
            .and_then(|_| write!(file, "{}", std::process::id()))
            .map_err(|e| Error::RuntimeInit(format!("write pid file: {}", e)))?;

        Ok(PidFile {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/**
 * RTMP 서버. 초기화와 리스닝을 수행하고, 커넥션 서비스 태스크를 가동하며,
 * 클라이언트를 정리한다.
 */
pub struct Server {
    core: Rc<ServerCore>,
    signal_manager: SignalManager,
    cycle_handler: Option<Box<dyn ServerCycle>>,
    listeners: Vec<StreamListener>,
    udp_listeners: Vec<UdpStreamListener>,
    pid_file: Option<PidFile>,
    config_path: Option<PathBuf>,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server::with_hooks(config, Rc::new(HttpHooks::new()))
    }

    /// 테스트가 기록용 훅 백엔드를 주입할 수 있는 생성자.
    pub fn with_hooks(config: Config, hooks: Rc<dyn HookBackend>) -> Server {
        let latches = Rc::new(SignalLatches::new());
        let core = Rc::new(ServerCore {
            config: Rc::new(RefCell::new(config)),
            sources: SourceHub::new(),
            hooks,
            conns: Rc::new(ConnManager::new()),
            latches: latches.clone(),
        });

        Server {
            core,
            signal_manager: SignalManager::new(latches),
            cycle_handler: None,
            listeners: Vec::new(),
            udp_listeners: Vec::new(),
            pid_file: None,
            config_path: None,
        }
    }

    /// 공유 코어의 핸들. 테스트와 바이너리가 서버를 태스크에 옮긴 뒤에도 쓴다.
    pub fn handle(&self) -> Rc<ServerCore> {
        self.core.clone()
    }

    pub fn set_config_path(&mut self, path: Option<PathBuf>) {
        self.config_path = path;
    }

    pub fn initialize(&mut self, mut handler: Box<dyn ServerCycle>) -> Result<()> {
        handler.initialize()?;
        self.cycle_handler = Some(handler);
        Ok(())
    }

    /// 시그널 스트림을 설치한다. 브릿지 태스크는 register_signal에서 가동한다.
    pub fn initialize_signal(&mut self) -> Result<()> {
        self.signal_manager.initialize()
    }

    /// pid 파일에 advisory write-lock을 잡는다. 이중 기동 방지.
    pub fn acquire_pid_file(&mut self) -> Result<()> {
        let path = self.core.config.borrow().pid_file.clone();
        let pid_file = PidFile::acquire(&path)?;
        info!(path = %pid_file.path().display(), "pid file acquired");
        self.pid_file = Some(pid_file);
        Ok(())
    }

    /// 설정된 모든 리스너를 연다.
    pub async fn listen(&mut self) -> Result<()> {
        let listens = self.core.config.borrow().listens.clone();

        for lc in listens {
            match lc.kind {
                ListenerKind::MpegTsOverUdp => {
                    let listener = UdpStreamListener::listen(
                        Rc::new(MpegtsOverUdpCaster),
                        lc.kind,
                        &lc.ip,
                        lc.port,
                    )
                    .await?;
                    self.udp_listeners.push(listener);
                }
                _ => {
                    let handler: Rc<dyn TcpConnHandler> = self.core.clone();
                    let listener =
                        StreamListener::listen(handler, lc.kind, &lc.ip, lc.port).await?;
                    self.listeners.push(listener);
                }
            }
        }
        Ok(())
    }

    /// 첫 리스너의 실제 바인딩 주소. 테스트가 임시 포트를 쓸 때 필요하다.
    pub fn first_listener_addr(&self) -> Option<std::net::SocketAddr> {
        self.listeners.first().map(|l| l.local_addr())
    }

    /// 브릿지 태스크를 가동하여 시그널 수신을 시작한다.
    pub async fn register_signal(&mut self) -> Result<()> {
        self.signal_manager.start().await
    }

    /**
     * 메인 수퍼비전 루프.
     *
     * graceful-quit에서 정리 후 반환, gmc-stop에서는 커넥션만 비우고 반환한다.
     * reload latch는 정확히 한 번 소비된다.
     */
    pub async fn cycle(&mut self) -> Result<()> {
        loop {
            if self.core.latches.gracefully_quit() {
                info!("sig term, gracefully quit");
                self.dispose().await;
                return Ok(());
            }

            if self.core.latches.gmc_stop() {
                info!("gmc stop, clear connections and return");
                self.core.conns.dispose().await;
                return Ok(());
            }

            if self.core.latches.reload() {
                self.core.latches.clear_reload();
                if let Err(err) = self.do_reload() {
                    error!(cause = %err, "reload failed, keep previous config");
                }
            }

            self.core.conns.drain_zombies().await;
            self.resample_kbps();

            if let Some(handler) = self.cycle_handler.as_mut() {
                handler.on_cycle(self.core.conns.len())?;
            }

            time::sleep(SYS_CYCLE_INTERVAL).await;
        }
    }

    fn do_reload(&mut self) -> Result<()> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => {
                warn!("reload requested but no config path, ignored");
                return Ok(());
            }
        };

        let new = Config::load(&path)?;
        self.core.apply_reload(new);
        Ok(())
    }

    fn resample_kbps(&self) {
        let (send, recv) = self.core.conns.resample_kbps();
        if send > 0 || recv > 0 {
            debug!(
                send_kbps = send * 8 / 1000,
                recv_kbps = recv * 8 / 1000,
                "kbps resample"
            );
        }
    }

    /// 전체 정리. 리스너와 시그널 브릿지를 내리고 커넥션을 전부 정리한다.
    async fn dispose(&mut self) {
        for listener in &mut self.listeners {
            listener.close().await;
        }
        for listener in &mut self.udp_listeners {
            listener.close().await;
        }
        self.signal_manager.stop().await;
        self.core.conns.dispose().await;
    }
}
