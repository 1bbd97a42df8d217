/**
 * ! 미디어 fan-out 허브.
 * !
 * ! 퍼블리셔 하나가 'Source'에 메시지를 쓰면, attach된 각 'Consumer'가 버퍼링된
 * ! 사본을 수신한다. 허브는 (vhost/app/stream) 키로 'Source'들을 보관한다.
 * !
 * ! 허브의 공유 상태는 mutex로 보호된다. mutex는 'std::sync::Mutex'이다. Tokio의
 * ! mutex가 아니다. 락을 잡은 상태에서 취하는 비동기 연산이 없고, 크리티컬 섹션이
 * ! 아주 작기 때문이다.
 * !
 * ! 순서 보장: 한 퍼블리셔가 보낸 메시지는 각 Consumer에게 수신 순서대로 전달된다.
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::frame::RtmpMessage;
use crate::rtmp::Request;
use crate::{Error, Result};

/// Consumer 하나가 밀릴 수 있는 최대 메시지 수. 넘치면 가장 오래된 것부터 버린다.
const CONSUMER_QUEUE_SIZE: usize = 1024;

/// 한 번의 merged-write 배치에 담는 최대 메시지 수.
pub const MW_MAX_MSGS: usize = 128;

/**
 * 허브 핸들. clone은 shallow이며 레퍼런스 카운트만 증가시킨다.
 */
#[derive(Clone)]
pub struct SourceHub {
    shared: Arc<HubShared>,
}

struct HubShared {
    state: Mutex<HubState>,
}

struct HubState {
    sources: HashMap<String, Source>,
}

impl SourceHub {
    pub fn new() -> SourceHub {
        SourceHub {
            shared: Arc::new(HubShared {
                state: Mutex::new(HubState {
                    sources: HashMap::new(),
                }),
            }),
        }
    }

    /// (vhost, app, stream) 키에 해당하는 Source를 꺼내거나 만든다.
    pub fn fetch_or_create(&self, req: &Request) -> Source {
        let key = req.source_key();
        let mut state = self.shared.state.lock().unwrap();

        state
            .sources
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(source = %key, "create new source");
                Source::new(key)
            })
            .clone()
    }
}

impl Default for SourceHub {
    fn default() -> SourceHub {
        SourceHub::new()
    }
}

/**
 * 하나의 라이브 스트림.
 *
 * 퍼블리셔의 독점 claim과 Consumer fan-out을 직렬화한다. clone은 같은 스트림에
 * 대한 또 하나의 핸들이다.
 */
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    key: String,
    sender: broadcast::Sender<RtmpMessage>,
    publishing: Mutex<bool>,
}

impl Source {
    fn new(key: String) -> Source {
        let (sender, _) = broadcast::channel(CONSUMER_QUEUE_SIZE);
        Source {
            inner: Arc::new(SourceInner {
                key,
                sender,
                publishing: Mutex::new(false),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /**
     * publish를 독점 claim한다.
     *
     * 이미 다른 퍼블리셔가 잡고 있으면 실패한다. 엣지의 re-publish는 예외로
     * 기존 claim을 이어받는다.
     */
    pub fn acquire_publish(&self, is_edge: bool) -> Result<()> {
        let mut publishing = self.inner.publishing.lock().unwrap();

        if *publishing && !is_edge {
            return Err(Error::PublishAlreadyHeld);
        }
        *publishing = true;
        Ok(())
    }

    /// claim을 풀어 Source를 다시 비어있는 상태로 돌린다.
    pub fn release_publish(&self) {
        *self.inner.publishing.lock().unwrap() = false;
    }

    pub fn is_publishing(&self) -> bool {
        *self.inner.publishing.lock().unwrap()
    }

    pub fn on_audio(&self, msg: RtmpMessage) {
        self.broadcast(msg);
    }

    pub fn on_video(&self, msg: RtmpMessage) {
        self.broadcast(msg);
    }

    pub fn on_metadata(&self, msg: RtmpMessage) {
        self.broadcast(msg);
    }

    fn broadcast(&self, msg: RtmpMessage) {
        // 수신자가 없으면 send는 실패하지만, 라이브 전달에서는 버리는 게 맞다.
        let _ = self.inner.sender.send(msg);
    }

    /// 플레이어 하나를 attach한다.
    pub fn create_consumer(&self) -> Consumer {
        Consumer {
            rx: self.inner.sender.subscribe(),
            paused: false,
        }
    }

    /// attach된 플레이어 수.
    pub fn consumer_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

/**
 * 플레이어 하나가 받는 스트림의 버퍼링된 사본.
 *
 * 느린 Consumer는 가장 오래된 메시지부터 잃는다(라이브 전달이므로 수용 가능).
 */
pub struct Consumer {
    rx: broadcast::Receiver<RtmpMessage>,
    paused: bool,
}

impl Consumer {
    /**
     * merged-write 마감까지 기다리며 최대 'max'개의 메시지를 모은다.
     *
     * 마감('wait')이 지나면 그때까지 모인 메시지를 반환한다. 재설정(reload)으로
     * 바뀐 마감은 다음 호출에서 바로 적용된다.
     */
    pub async fn dump_packets(&mut self, max: usize, wait: Duration) -> Vec<RtmpMessage> {
        if self.paused {
            // pause 중에는 전달하지 않는다. 마감만 소비하고 빈 배치를 돌려준다.
            time::sleep(wait).await;
            return Vec::new();
        }

        let mut out = Vec::new();
        let deadline = Instant::now() + wait;

        while out.len() < max {
            match time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(msg)) => out.push(msg),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!(dropped = n, "consumer lagged, drop oldest messages");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                // 마감 도달.
                Err(_) => break,
            }
        }

        out
    }

    /**
     * 실시간 모드의 전달. 배칭하지 않는다.
     *
     * 'tick' 안에 도착한 첫 메시지와 그 시점에 이미 쌓여있던 메시지들만 바로
     * 반환한다. 아무것도 오지 않으면 빈 배치를 돌려주어 호출자가 제어 메시지와
     * 인터럽트를 폴링할 수 있게 한다.
     */
    pub async fn dump_realtime(&mut self, max: usize, tick: Duration) -> Vec<RtmpMessage> {
        if self.paused {
            time::sleep(tick).await;
            return Vec::new();
        }

        let mut out = Vec::new();

        match time::timeout(tick, self.rx.recv()).await {
            Ok(Ok(msg)) => out.push(msg),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!(dropped = n, "consumer lagged, drop oldest messages");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return out,
            Err(_) => return out,
        }

        // 이미 큐에 있던 것까지만 쓸어담는다.
        while out.len() < max {
            match self.rx.try_recv() {
                Ok(msg) => out.push(msg),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(dropped = n, "consumer lagged, drop oldest messages");
                }
                Err(_) => break,
            }
        }

        out
    }

    pub fn set_pause(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(stream: &str) -> Request {
        let mut req = Request::parse_tc_url("rtmp://h/live?vhost=live", "", "").unwrap();
        req.stream = stream.to_string();
        req
    }

    #[test]
    fn publish_claim_is_exclusive() {
        let hub = SourceHub::new();
        let source = hub.fetch_or_create(&request("foo"));

        source.acquire_publish(false).unwrap();
        match source.acquire_publish(false) {
            Err(Error::PublishAlreadyHeld) => {}
            other => panic!("expected already-held, got {:?}", other),
        }

        // 엣지의 re-publish는 기존 claim을 이어받는다.
        source.acquire_publish(true).unwrap();

        source.release_publish();
        source.acquire_publish(false).unwrap();
    }

    #[test]
    fn hub_returns_same_source_for_same_key() {
        let hub = SourceHub::new();
        let a = hub.fetch_or_create(&request("foo"));
        let b = hub.fetch_or_create(&request("foo"));
        let c = hub.fetch_or_create(&request("bar"));

        a.acquire_publish(false).unwrap();
        assert!(b.is_publishing());
        assert!(!c.is_publishing());
    }

    #[tokio::test]
    async fn dump_collects_until_deadline() {
        let hub = SourceHub::new();
        let source = hub.fetch_or_create(&request("foo"));
        let mut consumer = source.create_consumer();

        // 40ms 간격으로 10 프레임을 흘려보낸다.
        let feeder = {
            let source = source.clone();
            tokio::spawn(async move {
                for i in 0..10u32 {
                    source.on_video(RtmpMessage::video(i * 40, Bytes::from_static(b"f")));
                    time::sleep(Duration::from_millis(40)).await;
                }
            })
        };

        let batch = consumer
            .dump_packets(MW_MAX_MSGS, Duration::from_millis(350))
            .await;
        // 350ms 마감까지 8개 이상이 한 배치로 모여야 한다.
        assert!(batch.len() >= 8, "batch too small: {}", batch.len());

        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn realtime_dump_returns_single_frames() {
        let hub = SourceHub::new();
        let source = hub.fetch_or_create(&request("foo"));
        let mut consumer = source.create_consumer();

        source.on_video(RtmpMessage::video(0, Bytes::from_static(b"f")));

        let batch = consumer
            .dump_realtime(MW_MAX_MSGS, Duration::from_millis(100))
            .await;
        assert_eq!(batch.len(), 1);

        // 더 오는 게 없으면 tick 후 빈 배치.
        let batch = consumer
            .dump_realtime(MW_MAX_MSGS, Duration::from_millis(20))
            .await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn order_is_preserved_per_consumer() {
        let hub = SourceHub::new();
        let source = hub.fetch_or_create(&request("foo"));
        let mut consumer = source.create_consumer();

        for i in 0..5u32 {
            source.on_audio(RtmpMessage::audio(i, Bytes::from_static(b"a")));
        }

        let batch = consumer
            .dump_packets(MW_MAX_MSGS, Duration::from_millis(10))
            .await;
        let stamps: Vec<u32> = batch.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![0, 1, 2, 3, 4]);
    }
}
