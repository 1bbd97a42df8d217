//! mini-rtmp 서버.
//!
//! 이 파일은 이 라이브러리에 구현된 서버의 진입점이다. 커맨드라인을 파싱하고
//! 기동 워크플로우(초기화 → 시그널 → pid 파일 → 리스닝 → cycle)를 돌린다.
//!
//! 아규먼트 파싱에는 'structopt' crate를 사용한다.

use std::path::PathBuf;

use mini_rtmp::config::{Config, ListenConf};
use mini_rtmp::listener::ListenerKind;
use mini_rtmp::server::{Server, ServerCycle};
use mini_rtmp::{task, DEFAULT_PORT};

use structopt::StructOpt;
use tracing::debug;

#[derive(StructOpt)]
#[structopt(
    name = "mini-rtmp-server",
    version = env!("CARGO_PKG_VERSION"),
    about = "A live RTMP server"
)]
struct Cli {
    /// TOML 설정 파일 경로. 없으면 기본값으로 기동한다.
    #[structopt(short = "c", long = "conf")]
    conf: Option<PathBuf>,

    /// RTMP 리스닝 포트. 설정 파일이 리스너를 정의하면 무시된다.
    #[structopt(short = "p", long = "port")]
    port: Option<String>,
}

/// 기본 cycle 핸들러. 커넥션 수만 로깅한다.
struct DefaultCycle;

impl ServerCycle for DefaultCycle {
    fn initialize(&mut self) -> mini_rtmp::Result<()> {
        Ok(())
    }

    fn on_cycle(&mut self, connections: usize) -> mini_rtmp::Result<()> {
        debug!(connections, "server cycle");
        Ok(())
    }
}

pub fn main() -> mini_rtmp::Result<()> {
    // 로깅을 활성화한다.
    // 자세한 내용: https://docs.rs/tracing
    tracing_subscriber::fmt::try_init()
        .map_err(|e| mini_rtmp::Error::RuntimeInit(format!("init logging: {}", e)))?;

    let cli = Cli::from_args();

    let mut config = match &cli.conf {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // 설정이 리스너를 주지 않으면 커맨드라인 포트(혹은 기본 포트)로 RTMP를 연다.
    if config.listens.is_empty() {
        let port = cli
            .port
            .as_deref()
            .unwrap_or(DEFAULT_PORT)
            .parse::<u16>()
            .map_err(|e| mini_rtmp::Error::Config(format!("invalid port: {}", e)))?;
        config.listens.push(ListenConf {
            kind: ListenerKind::RtmpStream,
            ip: "0.0.0.0".to_string(),
            port,
        });
    }

    // 이벤트 루프를 부트스트랩하고 모든 태스크를 단일 쓰레드에 싣는다.
    let rt = task::init_runtime()?;
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(run_master(config, cli.conf)))
}

async fn run_master(config: Config, conf_path: Option<PathBuf>) -> mini_rtmp::Result<()> {
    let mut server = Server::new(config);
    server.set_config_path(conf_path);

    server.initialize(Box::new(DefaultCycle))?;
    server.initialize_signal()?;
    server.acquire_pid_file()?;
    server.listen().await?;
    server.register_signal().await?;

    server.cycle().await
}
