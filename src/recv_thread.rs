/**
 * ! 커넥션 서비스가 쓰는 수신 태스크들.
 * !
 * ! 플레이 모드의 'QueueRecvThread'는 클라이언트의 제어 메시지(pause,
 * ! setBufferLength, closeStream)를 읽어 큐에 쌓고, 전경 cycle이 큐를 비운다.
 * ! 퍼블리시 모드의 'PublishRecvThread'는 미디어 메시지를 읽어 Source로 바로
 * ! 전달하고, 메시지 도착마다 전경의 타임아웃 감시자를 깨운다.
 * !
 * ! 둘 다 ReusableInterruptible flavor다. 읽기 에러를 만나면 에러를 슬롯에
 * ! 보관하고 스스로 interrupt하여 종료한다. 전경은 슬롯을 보고 커넥션을 정리한다.
 */

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::frame::{MessageKind, RtmpMessage};
use crate::rtmp::RtmpServer;
use crate::source::Source;
use crate::task::{CycleHandler, Task, TaskControl, TaskKind};
use crate::{Error, Result};

/**
 * 플레이 모드의 수신 태스크.
 *
 * 전경 cycle이 merged-write 마감을 기다리는 동안에도 클라이언트의 제어 메시지를
 * 놓치지 않도록, 읽기를 전담하는 태스크가 메시지를 버퍼링한다.
 */
pub struct QueueRecvThread {
    task: Task,
    queue: Rc<RefCell<VecDeque<RtmpMessage>>>,
    error: Rc<RefCell<Option<Error>>>,
}

impl QueueRecvThread {
    pub fn new(rtmp: Rc<RtmpServer>) -> QueueRecvThread {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let error = Rc::new(RefCell::new(None));
        let control = TaskControl::new();

        let handler = QueueRecvCycle {
            rtmp,
            queue: queue.clone(),
            error: error.clone(),
            control: control.clone(),
        };
        let task = Task::with_control(
            "queue-recv",
            TaskKind::ReusableInterruptible,
            Duration::ZERO,
            control,
            Box::new(handler),
        );

        QueueRecvThread { task, queue, error }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.task.start().await
    }

    pub async fn stop(&mut self) {
        self.task.stop().await;
    }

    pub fn empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// 버퍼링된 메시지 하나를 꺼낸다.
    pub fn pump(&self) -> Option<RtmpMessage> {
        self.queue.borrow_mut().pop_front()
    }

    /// 수신 태스크가 만난 에러. 있으면 전경은 커넥션을 정리해야 한다.
    pub fn error_code(&self) -> Option<Error> {
        self.error.borrow().clone()
    }
}

struct QueueRecvCycle {
    rtmp: Rc<RtmpServer>,
    queue: Rc<RefCell<VecDeque<RtmpMessage>>>,
    error: Rc<RefCell<Option<Error>>>,
    control: TaskControl,
}

#[async_trait(?Send)]
impl CycleHandler for QueueRecvCycle {
    async fn cycle(&mut self) -> Result<()> {
        if self.control.interrupted() {
            return Err(Error::SystemControl);
        }

        match self.rtmp.recv_message().await {
            Ok(msg) => {
                self.queue.borrow_mut().push_back(msg);
                Ok(())
            }
            Err(err) => {
                /*
                 * 에러를 보관하고 스스로 종료한다. stop은 전경(소유자)의 몫이므로
                 * 여기서는 loop 플래그만 내린다.
                 */
                *self.error.borrow_mut() = Some(err.clone());
                self.control.interrupt();
                Err(err)
            }
        }
    }
}

/**
 * 퍼블리시 모드의 수신 태스크.
 *
 * 읽은 미디어를 Source로 전달하고 메시지 수를 센다. 전경은 'wait'로 도착을
 * 기다리며 첫 패킷/일반 패킷 타임아웃을 강제한다.
 */
pub struct PublishRecvThread {
    task: Task,
    nb_msgs: Rc<Cell<u64>>,
    error: Rc<RefCell<Option<Error>>>,
    wakeup: Rc<Notify>,
}

impl PublishRecvThread {
    pub fn new(rtmp: Rc<RtmpServer>, source: Source) -> PublishRecvThread {
        let nb_msgs = Rc::new(Cell::new(0));
        let error = Rc::new(RefCell::new(None));
        let wakeup = Rc::new(Notify::new());
        let control = TaskControl::new();

        let handler = PublishRecvCycle {
            rtmp,
            source,
            nb_msgs: nb_msgs.clone(),
            error: error.clone(),
            wakeup: wakeup.clone(),
            control: control.clone(),
        };
        let task = Task::with_control(
            "publish-recv",
            TaskKind::ReusableInterruptible,
            Duration::ZERO,
            control,
            Box::new(handler),
        );

        PublishRecvThread {
            task,
            nb_msgs,
            error,
            wakeup,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.task.start().await
    }

    pub async fn stop(&mut self) {
        self.task.stop().await;
    }

    /// 지금까지 수신한 메시지 수. 0이면 첫 패킷이 아직 오지 않은 것이다.
    pub fn nb_msgs(&self) -> u64 {
        self.nb_msgs.get()
    }

    pub fn error_code(&self) -> Option<Error> {
        self.error.borrow().clone()
    }

    /// 다음 메시지 도착 혹은 수신 태스크의 종료를 기다린다.
    pub async fn wait(&self) {
        self.wakeup.notified().await;
    }
}

struct PublishRecvCycle {
    rtmp: Rc<RtmpServer>,
    source: Source,
    nb_msgs: Rc<Cell<u64>>,
    error: Rc<RefCell<Option<Error>>>,
    wakeup: Rc<Notify>,
    control: TaskControl,
}

impl PublishRecvCycle {
    /**
     * 수신한 메시지를 Source로 보낸다.
     *
     * 미디어 계열은 종류별로 전달하고, unpublish 계열 커맨드는 클라이언트의 정상
     * 종료로 취급한다.
     */
    fn process_publish_message(&self, msg: RtmpMessage) -> Result<()> {
        match msg.kind {
            MessageKind::Audio => {
                self.source.on_audio(msg);
                Ok(())
            }
            MessageKind::Video => {
                self.source.on_video(msg);
                Ok(())
            }
            MessageKind::Metadata => {
                self.source.on_metadata(msg);
                Ok(())
            }
            MessageKind::Command => {
                if let Some((name, _args)) = msg.as_command() {
                    match name.as_str() {
                        "FCUnpublish" | "unpublish" | "closeStream" => {
                            debug!(command = %name, "publisher closed stream");
                            return Err(Error::ClientGracefullyClosed);
                        }
                        _ => {
                            debug!(command = %name, "ignore command while publishing");
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

#[async_trait(?Send)]
impl CycleHandler for PublishRecvCycle {
    async fn cycle(&mut self) -> Result<()> {
        if self.control.interrupted() {
            return Err(Error::SystemControl);
        }

        let res = match self.rtmp.recv_message().await {
            Ok(msg) => {
                self.nb_msgs.set(self.nb_msgs.get() + 1);
                self.process_publish_message(msg)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &res {
            *self.error.borrow_mut() = Some(err.clone());
            self.control.interrupt();
        }

        // 도착이든 종료든 전경의 타임아웃 감시자를 깨운다.
        self.wakeup.notify_one();
        res
    }
}
