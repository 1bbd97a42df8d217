/**
 * ! 협력형 태스크 런타임.
 * !
 * ! 단일 OS 쓰레드 위에서 다수의 소켓 태스크를 다중화한다. 모든 태스크는 명시적
 * ! 중단 지점(소켓 I/O, sleep, join)에서만 yield하며, 중단 지점 사이의 공유 상태
 * ! 접근은 락 없이 안전하다.
 * !
 * ! 태스크 모델:
 * !
 * !     handler.on_start()
 * !     loop:
 * !         handler.on_before_cycle()
 * !         handler.cycle()
 * !         handler.on_end_cycle()
 * !         if !loop then break
 * !         sleep(interval)
 * !     handler.on_stop()
 * !
 * ! 외부에서 'stop'을 호출하면 loop 플래그를 내리고 진행중인 cycle future를 중단
 * ! 지점에서 취소한다. 블로킹된 소켓 I/O가 에러로 반환되어 루프가 자연스럽게
 * ! 끝나는 것과 같은 효과이다.
 */

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::{Error, Result};

/// 태스크 컨텍스트 id 생성기. 프로세스 전역에서 단조 증가한다.
static NEXT_CID: AtomicI64 = AtomicI64::new(0);

fn generate_cid() -> i64 {
    NEXT_CID.fetch_add(1, Ordering::Relaxed)
}

/**
 * 태스크의 루프 규율.
 *
 * - 'Endless': 외부에서 멈출 때까지 cycle을 반복한다. join 불가.
 * - 'OneShot': cycle이 한 번 반환되면 스스로 loop 플래그를 내린다. 커넥션 태스크가
 *   이 flavor를 사용한다.
 * - 'Reusable': 외부에서 stop할 때까지 반복하며, stop 후 다시 start할 수 있다.
 * - 'ReusableInterruptible': 'Reusable'과 같지만 cycle 본문이 자체 내부 루프를
 *   가지는 경우를 위해 interrupt 플래그를 스스로 세우고/읽을 수 있다.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Endless,
    OneShot,
    Reusable,
    ReusableInterruptible,
}

impl TaskKind {
    /**
     * join 가능 여부는 flavor가 결정한다. 재사용 가능한 태스크는 외부에서 반드시
     * stop으로 멈추므로 join하고, endless/one-shot은 분리(detach)된 채 종료 latch로만
     * 수렴을 확인한다.
     */
    fn joinable(self) -> bool {
        matches!(self, TaskKind::Reusable | TaskKind::ReusableInterruptible)
    }
}

/**
 * 태스크의 사이클 핸들러. 콜백 인터페이스.
 *
 * 'cycle'을 제외한 모든 콜백은 선택적이다. 핸들러는 무시할 수 있다.
 *
 * cycle 본문에 자체 루프가 있다면 반드시 'TaskControl::interrupted'를 확인해야
 * 한다. 그렇지 않으면 외부 stop이 소켓 에러로 루프를 깨지 못하는 경우(예: 순수
 * sleep 루프) 죽지 않는 루프가 된다.
 *
 * 태스크가 자기 자신을 끝내려면 cycle 안에서 'stop'을 호출해서는 안 되며,
 * 'TaskControl::interrupt'(loop 플래그만 내린다)를 사용해야 한다. 'stop'은 다른
 * 태스크 혹은 소유 객체의 teardown 전용이다.
 */
#[async_trait(?Send)]
pub trait CycleHandler {
    /// 태스크 기동 직후, 부모의 'start'가 반환되기 전에 한 번 호출된다.
    async fn on_start(&mut self) {}

    async fn on_before_cycle(&mut self) -> Result<()> {
        Ok(())
    }

    /// 태스크의 본문. 반드시 블로킹 연산(소켓 I/O 혹은 sleep)을 포함해야 한다.
    async fn cycle(&mut self) -> Result<()>;

    async fn on_end_cycle(&mut self) -> Result<()> {
        Ok(())
    }

    /// 태스크 본문이 반환된 뒤 마지막으로 한 번 호출된다. 동기 콜백이다.
    fn on_stop(&mut self) {}
}

/**
 * loop 플래그의 공유 핸들.
 *
 * 'interrupt'는 플래그를 내리기만 할 뿐 실제로 태스크를 깨우지 않는다. 내부 루프를
 * 가진 cycle 본문이 'interrupted'를 폴링하며 협력하도록 하기 위한 것이다.
 * ReusableInterruptible flavor의 핸들러가 이 핸들을 들고 들어간다.
 */
#[derive(Clone)]
pub struct TaskControl {
    looping: Rc<Cell<bool>>,
}

impl TaskControl {
    pub fn new() -> TaskControl {
        TaskControl {
            looping: Rc::new(Cell::new(false)),
        }
    }

    /// loop 플래그를 내린다. 태스크는 다음 yield에서 종료한다.
    pub fn interrupt(&self) {
        self.looping.set(false);
    }

    pub fn interrupted(&self) -> bool {
        !self.looping.get()
    }

    fn set_looping(&self, v: bool) {
        self.looping.set(v);
    }

    fn can_loop(&self) -> bool {
        self.looping.get()
    }
}

impl Default for TaskControl {
    fn default() -> TaskControl {
        TaskControl::new()
    }
}

/// 태스크의 공유 상태. 부모와 태스크 본문이 함께 본다.
struct TaskState {
    name: String,
    kind: TaskKind,
    interval: Duration,
    control: TaskControl,
    cid: Cell<i64>,
    can_run: Cell<bool>,
    really_terminated: Cell<bool>,

    /*
     * 기동 핸드셰이크와 중단에 쓰는 알림들.
     *
     * 'started'는 본문이 cid를 발행하고 on_start를 마친 시점,
     * 'run'은 부모가 기록을 마치고 본문의 진행을 허가한 시점,
     * 'interrupt'는 외부 stop이 진행중인 cycle/sleep를 취소해야 하는 시점이다.
     *
     * notify_one의 permit 저장 특성에 의존한다. 본문이 아직 대기 지점에 도달하지
     * 않았더라도 신호가 유실되지 않는다.
     */
    started: Notify,
    run: Notify,
    interrupt: Notify,
}

/**
 * 협력형 태스크.
 *
 * 'start'는 본문 코루틴을 가동하고, 본문이 컨텍스트 id를 발행할 때까지 호출자를
 * 멈춘 뒤, 진행 latch를 풀어준다. 부모는 'start'가 반환된 시점에 자식의 cid를
 * 알고 있어야 하고, 자식은 부모가 기록을 마치기 전에 cycle 로직을 실행해서는 안
 * 되기 때문이다.
 *
 * 'stop'은 멱등이다. 여러 번 호출해도 된다. joinable한 태스크는 join이 완료를
 * 보고하더라도 본문이 실제로 반환되었음을 종료 latch로 한 번 더 확인한다.
 * join이 신뢰 가능한 플랫폼에서 둘 다 필요한지는 불분명하지만, 안전을 위해 둘 다
 * 유지한다.
 */
pub struct Task {
    state: Rc<TaskState>,
    handler: Rc<RefCell<Option<Box<dyn CycleHandler>>>>,
    join: Option<JoinHandle<()>>,
}

impl Task {
    pub fn new(
        name: &str,
        kind: TaskKind,
        interval: Duration,
        handler: Box<dyn CycleHandler>,
    ) -> Task {
        Task::with_control(name, kind, interval, TaskControl::new(), handler)
    }

    /**
     * 핸들러가 자신의 loop 플래그를 폴링해야 하는 경우(ReusableInterruptible),
     * 호출자가 미리 만든 'TaskControl'을 핸들러와 태스크 양쪽에 공유시킨다.
     */
    pub fn with_control(
        name: &str,
        kind: TaskKind,
        interval: Duration,
        control: TaskControl,
        handler: Box<dyn CycleHandler>,
    ) -> Task {
        Task {
            state: Rc::new(TaskState {
                name: name.to_string(),
                kind,
                interval,
                control,
                cid: Cell::new(-1),
                can_run: Cell::new(false),
                really_terminated: Cell::new(true),
                started: Notify::new(),
                run: Notify::new(),
                interrupt: Notify::new(),
            }),
            handler: Rc::new(RefCell::new(Some(handler))),
            join: None,
        }
    }

    /// 부모가 기록해 두는 컨텍스트 id. 'start'가 반환된 뒤에는 0 이상이다.
    pub fn cid(&self) -> i64 {
        self.state.cid.get()
    }

    pub fn control(&self) -> TaskControl {
        self.state.control.clone()
    }

    pub fn interrupt(&self) {
        self.state.control.interrupt();
    }

    pub fn interrupted(&self) -> bool {
        self.state.control.interrupted()
    }

    /**
     * 태스크를 가동한다. 이미 가동중이면 무시한다.
     *
     * 본문이 cid를 발행하고 on_start를 마칠 때까지 대기한 뒤, 진행 latch를 풀고
     * 반환한다. 반환 시점에 'cid() >= 0'이고 on_start는 정확히 한 번 호출되어 있다.
     */
    pub async fn start(&mut self) -> Result<()> {
        if self.join.is_some() {
            info!(task = %self.state.name, "task already running");
            return Ok(());
        }

        let handler = match self.handler.borrow_mut().take() {
            Some(h) => h,
            None => {
                /*
                 * 핸들러 슬롯이 비어 있다는 것은 이전 본문이 아직 반환하지 않았다는
                 * 뜻이다. stop 없이 start를 다시 호출한 경우이다.
                 */
                return Err(Error::TaskCreate(format!(
                    "task {} handler still in flight",
                    self.state.name
                )));
            }
        };

        self.state.cid.set(-1);
        self.state.can_run.set(false);
        self.state.control.set_looping(true);

        let state = self.state.clone();
        let slot = self.handler.clone();
        self.join = Some(tokio::task::spawn_local(task_cycle(state, slot, handler)));

        // cid가 준비될 때까지 대기한다. 부모가 cid를 가져가기 위함이다.
        while self.state.cid.get() < 0 {
            self.state.started.notified().await;
        }

        // 이제 cycle 본문이 진행해도 된다.
        self.state.can_run.set(true);
        self.state.run.notify_one();

        Ok(())
    }

    /**
     * 태스크를 멈추고 종료를 기다린다. 이미 멈췄다면 무시한다.
     *
     * loop 플래그를 내리고 진행중인 cycle을 중단 지점에서 취소한다. joinable하면
     * join하고, 이후 본문이 실제로 반환되었음을 종료 latch로 확인한다.
     */
    pub async fn stop(&mut self) {
        let join = match self.join.take() {
            Some(j) => j,
            None => return,
        };

        self.state.control.set_looping(false);

        /*
         * 인터럽트를 보내 블로킹된 cycle/sleep을 깨운다. permit이 저장되므로 본문이
         * 아직 대기 지점에 도달하지 않았어도 유실되지 않는다. 기동 핸드셰이크에서
         * 멈춰 있을 가능성도 함께 풀어준다.
         */
        self.state.interrupt.notify_one();
        self.state.run.notify_one();

        if self.state.kind.joinable() {
            if join.await.is_err() {
                warn!(task = %self.state.name, "ignore join task failed");
            }
        } else {
            drop(join);
        }

        /*
         * join 결과와 무관하게 본문이 실제로 반환될 때까지 기다린다.
         * join 불가능한 태스크도 stop 시 반드시 종료를 보장해야 한다.
         */
        while !self.state.really_terminated.get() {
            time::sleep(Duration::from_millis(10)).await;

            if self.state.really_terminated.get() {
                break;
            }
            warn!(task = %self.state.name, "wait task to actually terminated");
        }

        self.state.cid.set(-1);
        self.state.can_run.set(false);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        /*
         * 정상 teardown은 stop이다. destructor는 await할 수 없으므로 남아있는
         * 본문은 abort로 강제 회수한다.
         */
        if let Some(join) = self.join.take() {
            self.state.control.set_looping(false);
            join.abort();
        }
    }
}

/// 태스크의 본문. 기동 핸드셰이크 후 디스패치 루프를 돈다.
async fn task_cycle(
    state: Rc<TaskState>,
    slot: Rc<RefCell<Option<Box<dyn CycleHandler>>>>,
    mut handler: Box<dyn CycleHandler>,
) {
    state.cid.set(generate_cid());
    info!(task = %state.name, cid = state.cid.get(), "task cycle start");

    handler.on_start().await;

    // 본문이 살아있음을 표시한 뒤에 부모를 깨운다.
    state.really_terminated.set(false);
    state.started.notify_one();

    // 부모가 cid를 기록할 때까지 cycle 로직을 실행하지 않는다.
    while !state.can_run.get() && state.control.can_loop() {
        state.run.notified().await;
    }

    while state.control.can_loop() {
        dispatch(&state, handler.as_mut()).await;

        // one-shot은 첫 cycle 반환 직후 스스로 루프를 끝낸다.
        if state.kind == TaskKind::OneShot {
            state.control.set_looping(false);
        }

        if !state.control.can_loop() {
            break;
        }

        // 핫패스에서는 sleep하지 않는다. interval이 0이면 바로 다음 pass로 간다.
        if !state.interval.is_zero() {
            tokio::select! {
                _ = time::sleep(state.interval) => {}
                _ = state.interrupt.notified() => {}
            }
        }
    }

    state.really_terminated.set(true);
    handler.on_stop();

    // 재가동을 위해 핸들러를 슬롯에 되돌려 둔다.
    *slot.borrow_mut() = Some(handler);

    info!(task = %state.name, "task cycle finished");
}

/**
 * yield 사이의 단일 pass.
 *
 * on_before_cycle이 실패하면 cycle과 on_end_cycle을 건너뛰고 sleep으로 간다.
 * cycle이 실패하면 on_end_cycle을 건너뛴다. 클라이언트의 정상 종료와 내부 제어
 * 에러는 info로, 그 외는 warn으로 로깅하고 루프는 계속된다.
 */
async fn dispatch(state: &TaskState, handler: &mut dyn CycleHandler) {
    if let Err(err) = handler.on_before_cycle().await {
        warn!(task = %state.name, cause = %err, "on before cycle failed, ignored and retry");
        return;
    }

    /*
     * 외부 stop의 인터럽트는 진행중인 cycle future를 중단 지점에서 취소한다.
     * 블로킹된 소켓 대기가 에러로 반환되는 것과 동등하게 취급한다.
     */
    let res = tokio::select! {
        res = handler.cycle() => res,
        _ = state.interrupt.notified() => Err(Error::SystemControl),
    };

    if let Err(err) = res {
        if err.is_client_gracefully_closed() || err.is_system_control() {
            info!(task = %state.name, cause = %err, "cycle finished");
        } else {
            warn!(task = %state.name, cause = %err, "cycle failed, ignored and retry");
        }
        return;
    }

    if let Err(err) = handler.on_end_cycle().await {
        warn!(task = %state.name, cause = %err, "on end cycle failed, ignored and retry");
    }
}

/**
 * 이벤트 루프를 부트스트랩한다.
 *
 * 호스트에서 사용 가능한 최적의 readiness 메커니즘(리눅스 epoll, BSD kqueue)은
 * tokio가 선택한다. 모든 태스크는 단일 OS 쓰레드의 'LocalSet' 위에서 돈다.
 */
pub fn init_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::RuntimeInit(format!("build event loop: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    /// 콜백 호출 횟수를 기록하는 테스트용 핸들러.
    struct Probe {
        starts: Rc<Cell<u32>>,
        cycles: Rc<Cell<u32>>,
        stops: Rc<Cell<u32>>,
        fail_before: bool,
    }

    #[async_trait(?Send)]
    impl CycleHandler for Probe {
        async fn on_start(&mut self) {
            self.starts.set(self.starts.get() + 1);
        }

        async fn on_before_cycle(&mut self) -> Result<()> {
            if self.fail_before {
                return Err(Error::Protocol("before".into()));
            }
            Ok(())
        }

        async fn cycle(&mut self) -> Result<()> {
            self.cycles.set(self.cycles.get() + 1);
            // cycle은 반드시 블로킹 연산을 포함해야 한다.
            time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }

        fn on_stop(&mut self) {
            self.stops.set(self.stops.get() + 1);
        }
    }

    fn probe() -> (Probe, Rc<Cell<u32>>, Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let starts = Rc::new(Cell::new(0));
        let cycles = Rc::new(Cell::new(0));
        let stops = Rc::new(Cell::new(0));
        let p = Probe {
            starts: starts.clone(),
            cycles: cycles.clone(),
            stops: stops.clone(),
            fail_before: false,
        };
        (p, starts, cycles, stops)
    }

    #[tokio::test]
    async fn start_publishes_cid_and_runs_on_start_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (p, starts, _, _) = probe();
                let mut task = Task::new("probe", TaskKind::Endless, Duration::ZERO, Box::new(p));

                assert_eq!(task.cid(), -1);
                task.start().await.unwrap();

                assert!(task.cid() >= 0);
                assert_eq!(starts.get(), 1);

                task.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn stop_runs_on_stop_once_and_sets_terminated() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (p, _, _, stops) = probe();
                let mut task = Task::new("probe", TaskKind::Endless, Duration::ZERO, Box::new(p));

                task.start().await.unwrap();
                time::sleep(Duration::from_millis(20)).await;

                task.stop().await;
                assert_eq!(stops.get(), 1);
                assert!(task.state.really_terminated.get());

                // stop은 멱등이다.
                task.stop().await;
                assert_eq!(stops.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn one_shot_cycles_exactly_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (p, _, cycles, stops) = probe();
                let mut task = Task::new("oneshot", TaskKind::OneShot, Duration::ZERO, Box::new(p));

                task.start().await.unwrap();

                // 본문이 스스로 종료할 때까지 기다린다.
                while !task.state.really_terminated.get() {
                    time::sleep(Duration::from_millis(5)).await;
                }

                assert_eq!(cycles.get(), 1);
                assert_eq!(stops.get(), 1);

                task.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn reusable_restarts_without_leaking() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (p, starts, _, stops) = probe();
                let mut task =
                    Task::new("reuse", TaskKind::Reusable, Duration::from_millis(1), Box::new(p));

                for round in 1..=3u32 {
                    task.start().await.unwrap();
                    time::sleep(Duration::from_millis(15)).await;
                    task.stop().await;

                    assert_eq!(starts.get(), round);
                    assert_eq!(stops.get(), round);
                }
            })
            .await;
    }

    #[tokio::test]
    async fn interrupt_flag_breaks_inner_loop() {
        // cycle 본문이 내부 루프에서 interrupted를 폴링하며 협력하는 flavor.
        struct Inner {
            control: TaskControl,
            seen: Rc<Cell<bool>>,
        }

        #[async_trait(?Send)]
        impl CycleHandler for Inner {
            async fn cycle(&mut self) -> Result<()> {
                while !self.control.interrupted() {
                    time::sleep(Duration::from_millis(2)).await;
                }
                self.seen.set(true);
                Ok(())
            }
        }

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let control = TaskControl::new();
                let seen = Rc::new(Cell::new(false));
                let handler = Inner {
                    control: control.clone(),
                    seen: seen.clone(),
                };
                let mut task = Task::with_control(
                    "inner",
                    TaskKind::ReusableInterruptible,
                    Duration::ZERO,
                    control.clone(),
                    Box::new(handler),
                );

                task.start().await.unwrap();
                time::sleep(Duration::from_millis(10)).await;

                control.interrupt();
                time::sleep(Duration::from_millis(10)).await;
                assert!(seen.get());

                task.stop().await;
            })
            .await;
    }
}
