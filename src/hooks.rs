/**
 * ! HTTP 훅.
 * !
 * ! 커넥션 수명 주기의 이벤트를 설정된 url로 통지한다. fire-and-wait 방식이며,
 * ! on_connect / on_publish / on_play에 대한 non-2xx 응답은 해당 단계에 치명적이다.
 * ! on_close / on_unpublish / on_stop의 실패는 로깅만 한다(호출측 책임).
 */

use async_trait::async_trait;
use serde_json::json;

use crate::rtmp::Request;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    OnConnect,
    OnClose,
    OnPublish,
    OnUnpublish,
    OnPlay,
    OnStop,
}

impl HookEvent {
    pub fn action(self) -> &'static str {
        match self {
            HookEvent::OnConnect => "on_connect",
            HookEvent::OnClose => "on_close",
            HookEvent::OnPublish => "on_publish",
            HookEvent::OnUnpublish => "on_unpublish",
            HookEvent::OnPlay => "on_play",
            HookEvent::OnStop => "on_stop",
        }
    }
}

/**
 * 훅 백엔드의 seam. 기본 구현은 HTTP POST이고, 테스트는 기록용 백엔드를 주입한다.
 */
#[async_trait(?Send)]
pub trait HookBackend {
    async fn call(
        &self,
        url: &str,
        event: HookEvent,
        client_id: u64,
        req: &Request,
    ) -> Result<()>;
}

/// reqwest 기반의 기본 백엔드.
pub struct HttpHooks {
    client: reqwest::Client,
}

impl HttpHooks {
    pub fn new() -> HttpHooks {
        HttpHooks {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHooks {
    fn default() -> HttpHooks {
        HttpHooks::new()
    }
}

#[async_trait(?Send)]
impl HookBackend for HttpHooks {
    async fn call(
        &self,
        url: &str,
        event: HookEvent,
        client_id: u64,
        req: &Request,
    ) -> Result<()> {
        let body = json!({
            "action": event.action(),
            "client_id": client_id,
            "ip": req.ip,
            "vhost": req.vhost,
            "app": req.app,
            "stream": req.stream,
            "tcUrl": req.tc_url,
            "pageUrl": req.page_url,
        });

        let res = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::HookRejected(format!("{} {}: {}", event.action(), url, e)))?;

        if !res.status().is_success() {
            return Err(Error::HookRejected(format!(
                "{} {}: status {}",
                event.action(),
                url,
                res.status()
            )));
        }
        Ok(())
    }
}
