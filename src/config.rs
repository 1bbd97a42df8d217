/**
 * ! 코어가 참조하는 설정.
 * !
 * ! TOML 파일에서 로딩한다. 리스너 바인딩, pid 파일 경로, vhost별 정책 노브로
 * ! 구성된다. reload는 새 'Config'를 만들어 서버에 적용하는 방식이며, vhost별
 * ! 변경분은 해당 vhost의 커넥션들에게만 콜백으로 전파된다.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::listener::ListenerKind;
use crate::{Error, Result};

/// vhost 파라미터가 없는 클라이언트가 떨어지는 기본 vhost.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listens: Vec<ListenConf>,

    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    #[serde(default)]
    pub vhosts: HashMap<String, VhostConf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ListenConf {
    pub kind: ListenerKind,

    #[serde(default = "default_ip")]
    pub ip: String,

    pub port: u16,
}

/**
 * vhost 하나의 정책 노브.
 *
 * merged-write, 실시간 모드, TCP_NODELAY, publish 타임아웃, refer 규칙, 엣지
 * origin 목록, HTTP 훅 url. 모두 라이브 커넥션이 매 iteration 다시 읽는 값들이다.
 */
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VhostConf {
    /// merged-write 마감 (ms). 0이면 배칭하지 않는다.
    #[serde(default = "default_mw_sleep")]
    pub mw_sleep_ms: u64,

    #[serde(default = "default_true")]
    pub mw_enabled: bool,

    /// 배치 간 최소 간격 (ms). 0이면 제한하지 않는다.
    #[serde(default)]
    pub send_min_interval_ms: u64,

    /// 실시간 모드. 켜지면 merged-write를 무시한다.
    #[serde(default)]
    pub realtime: bool,

    #[serde(default)]
    pub tcp_nodelay: bool,

    #[serde(default = "default_publish_1stpkt_timeout")]
    pub publish_1stpkt_timeout_ms: u64,

    #[serde(default = "default_publish_normal_timeout")]
    pub publish_normal_timeout_ms: u64,

    /// pageUrl이 이 목록의 패턴을 포함하면 admission을 거부한다.
    #[serde(default)]
    pub refer_deny: Vec<String>,

    /// 비어있지 않으면 이 vhost는 엣지다. "host:port" 목록.
    #[serde(default)]
    pub edge_origins: Vec<String>,

    /// 엣지에서 클라이언트 자격을 origin으로 재생하여 검증한다.
    #[serde(default)]
    pub edge_token_traverse: bool,

    #[serde(default)]
    pub hooks: HooksConf,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HooksConf {
    pub on_connect: Option<String>,
    pub on_close: Option<String>,
    pub on_publish: Option<String>,
    pub on_unpublish: Option<String>,
    pub on_play: Option<String>,
    pub on_stop: Option<String>,
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("./objs/mini-rtmp.pid")
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_mw_sleep() -> u64 {
    350
}

fn default_true() -> bool {
    true
}

fn default_publish_1stpkt_timeout() -> u64 {
    20000
}

fn default_publish_normal_timeout() -> u64 {
    5000
}

impl Default for VhostConf {
    fn default() -> VhostConf {
        VhostConf {
            mw_sleep_ms: default_mw_sleep(),
            mw_enabled: true,
            send_min_interval_ms: 0,
            realtime: false,
            tcp_nodelay: false,
            publish_1stpkt_timeout_ms: default_publish_1stpkt_timeout(),
            publish_normal_timeout_ms: default_publish_normal_timeout(),
            refer_deny: Vec::new(),
            edge_origins: Vec::new(),
            edge_token_traverse: false,
            hooks: HooksConf::default(),
        }
    }
}

impl VhostConf {
    pub fn mw_sleep(&self) -> Duration {
        Duration::from_millis(self.mw_sleep_ms)
    }

    pub fn send_min_interval(&self) -> Duration {
        Duration::from_millis(self.send_min_interval_ms)
    }

    pub fn publish_1stpkt_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_1stpkt_timeout_ms)
    }

    pub fn publish_normal_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_normal_timeout_ms)
    }

    pub fn is_edge(&self) -> bool {
        !self.edge_origins.is_empty()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listens: Vec::new(),
            pid_file: default_pid_file(),
            vhosts: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| Error::Config(format!("parse config: {}", e)))
    }

    /**
     * vhost 설정을 찾는다. 없으면 '__defaultVhost__'로 폴백한다.
     * 둘 다 없으면 None이며, admission 단계에서 거부된다.
     */
    pub fn vhost(&self, name: &str) -> Option<&VhostConf> {
        self.vhosts
            .get(name)
            .or_else(|| self.vhosts.get(DEFAULT_VHOST))
    }
}
