/**
 * ! 시그널 브릿지.
 * !
 * ! OS 시그널을 in-band 이벤트로 바꾼다. 시그널 스트림마다 작은 포워더가 시그널
 * ! 번호를 채널(self-pipe의 아날로그)에 넣고, endless 태스크 하나가 번호를 읽어
 * ! latch를 세운다. 서버 cycle은 매 pass마다 latch를 관찰한다.
 * !
 * ! 채널은 바운드되어 있다. 가득 차면 조용히 버린다. 시그널 의미론은 어차피
 * ! 엣지 병합(edge-coalesced)이므로 수용 가능하다.
 */

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;
use nix::libc::{SIGHUP, SIGINT, SIGTERM, SIGUSR2};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::task::{CycleHandler, Task, TaskKind};
use crate::{Error, Result};

/// reload를 요청하는 시그널.
pub const SIGNAL_RELOAD: i32 = SIGHUP;

/**
 * 프로세스 전역의 시그널 latch들.
 *
 * 브릿지 태스크가 쓰고 서버 태스크가 읽는다. yield 경계를 사이에 둔
 * 단일-작성자/단일-독자이므로 락이 필요 없다(단일 쓰레드 불변식).
 */
pub struct SignalLatches {
    reload: Cell<bool>,
    gmc_stop: Cell<bool>,
    gracefully_quit: Cell<bool>,

    // 메모리 체크 모드. 켜져 있으면 SIGINT/SIGUSR2가 gmc-stop으로 간다.
    gmc_enabled: Cell<bool>,
}

impl SignalLatches {
    pub fn new() -> SignalLatches {
        SignalLatches {
            reload: Cell::new(false),
            gmc_stop: Cell::new(false),
            gracefully_quit: Cell::new(false),
            gmc_enabled: Cell::new(false),
        }
    }

    pub fn set_gmc_enabled(&self, on: bool) {
        self.gmc_enabled.set(on);
    }

    pub fn reload(&self) -> bool {
        self.reload.get()
    }

    pub fn clear_reload(&self) {
        self.reload.set(false);
    }

    pub fn gmc_stop(&self) -> bool {
        self.gmc_stop.get()
    }

    pub fn gracefully_quit(&self) -> bool {
        self.gracefully_quit.get()
    }

    /// 브릿지가 디코딩한 시그널 번호를 latch로 바꾼다.
    pub fn on_signal(&self, signo: i32) {
        if signo == SIGNAL_RELOAD {
            self.reload.set(true);
            return;
        }
        if signo == SIGTERM {
            self.gracefully_quit.set(true);
            return;
        }
        if signo == SIGINT || signo == SIGUSR2 {
            if self.gmc_enabled.get() {
                self.gmc_stop.set(true);
            } else {
                self.gracefully_quit.set(true);
            }
        }
    }
}

impl Default for SignalLatches {
    fn default() -> SignalLatches {
        SignalLatches::new()
    }
}

/**
 * 시그널 스트림과 브릿지 태스크의 관리자.
 *
 * 'initialize'가 스트림과 포워더를 설치하고, 'start'가 브릿지 태스크를 가동한다.
 */
pub struct SignalManager {
    latches: Rc<SignalLatches>,
    rx: Option<mpsc::Receiver<i32>>,
    task: Option<Task>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SignalManager {
    pub fn new(latches: Rc<SignalLatches>) -> SignalManager {
        SignalManager {
            latches,
            rx: None,
            task: None,
            forwarders: Vec::new(),
        }
    }

    /// 시그널 핸들러(스트림)를 설치하고 채널에 연결한다.
    pub fn initialize(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel(32);

        let kinds = [
            (SignalKind::hangup(), SIGHUP),
            (SignalKind::terminate(), SIGTERM),
            (SignalKind::interrupt(), SIGINT),
            (SignalKind::user_defined2(), SIGUSR2),
        ];

        for (kind, signo) in kinds.iter() {
            let mut stream = signal(*kind)
                .map_err(|e| Error::RuntimeInit(format!("install signal {}: {}", signo, e)))?;
            let tx = tx.clone();
            let signo = *signo;

            /*
             * 포워더는 시그널 핸들러의 아날로그다. 할당도 락도 없이 번호 하나를
             * 넣기만 한다. 채널이 가득 차면 조용히 버린다.
             */
            let handle = tokio::task::spawn_local(async move {
                while stream.recv().await.is_some() {
                    let _ = tx.try_send(signo);
                }
            });
            self.forwarders.push(handle);
        }

        self.rx = Some(rx);
        Ok(())
    }

    /// 브릿지 태스크를 가동한다.
    pub async fn start(&mut self) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::RuntimeInit("signal manager not initialized".into()))?;

        let mut task = Task::new(
            "signal",
            TaskKind::Endless,
            std::time::Duration::ZERO,
            Box::new(SignalCycle {
                rx,
                latches: self.latches.clone(),
            }),
        );
        task.start().await?;
        self.task = Some(task);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop().await;
        }
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
    }
}

/// 브릿지 태스크의 본문. 번호 하나를 읽어 latch로 바꾼다.
struct SignalCycle {
    rx: mpsc::Receiver<i32>,
    latches: Rc<SignalLatches>,
}

#[async_trait(?Send)]
impl CycleHandler for SignalCycle {
    async fn cycle(&mut self) -> Result<()> {
        match self.rx.recv().await {
            Some(signo) => {
                info!(signo, "signal received");
                self.latches.on_signal(signo);
                Ok(())
            }
            // 모든 포워더가 내려갔다. 브릿지도 끝낸다.
            None => Err(Error::SystemControl),
        }
    }
}
