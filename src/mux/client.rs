use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use yamux::Mode as YamuxMode;

use super::session::MuxSession;
use super::sticky::StickyConn;
use crate::common::Address;
use crate::error::{Result, TunnelError};
use crate::tunnel::{BoxConn, SharedPacketConn, TunnelClient, TunnelKind};

type SessionMap = HashMap<u32, Arc<MuxSession>>;

/// Mux 客户端会话池
///
/// 拨号时复用子流数低于并发上限的会话，没有可用会话时才建立新的底层连接。
/// 后台每 `idle_timeout / 4` 清理一次已断开或空闲超时的会话。
pub struct MuxClient {
    underlay: Arc<dyn TunnelClient>,
    sessions: Arc<Mutex<SessionMap>>,
    concurrency: usize,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl MuxClient {
    pub fn new(
        underlay: Arc<dyn TunnelClient>,
        concurrency: usize,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let sessions = Arc::new(Mutex::new(SessionMap::new()));
        tokio::spawn(sweep_loop(sessions.clone(), idle_timeout, cancel.clone()));
        Self {
            underlay,
            sessions,
            concurrency,
            idle_timeout,
            cancel,
        }
    }

    /// 当前池中的会话数
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// 池中所有会话的 (id, 活跃子流数)
    pub fn session_stats(&self) -> Vec<(u32, usize)> {
        self.sessions
            .lock()
            .values()
            .map(|s| (s.id(), s.live_streams()))
            .collect()
    }

    /// 立即执行一次清理
    pub fn sweep(&self) {
        sweep(&self.sessions, self.idle_timeout);
    }

    /// 在已有会话中预留一个名额
    fn reserve_existing(&self) -> Option<Arc<MuxSession>> {
        self.sessions
            .lock()
            .values()
            .find(|s| s.try_reserve(self.concurrency))
            .cloned()
    }

    async fn open_session(&self) -> Result<Arc<MuxSession>> {
        let conn = self.underlay.dial_conn(None, Some(TunnelKind::Mux)).await?;
        let mut sessions = self.sessions.lock();
        let id = loop {
            let id = rand::rng().random::<u32>();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = MuxSession::spawn(
            id,
            StickyConn::new(conn),
            YamuxMode::Client,
            None,
            self.cancel.child_token(),
        );
        // 新会话的第一个名额属于本次拨号
        session.try_reserve(self.concurrency);
        sessions.insert(id, session.clone());
        info!("Mux session {:08x} opened, {} in pool", id, sessions.len());
        Ok(session)
    }
}

#[async_trait]
impl TunnelClient for MuxClient {
    async fn dial_conn(&self, _addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }
        let session = match self.reserve_existing() {
            Some(session) => session,
            None => self.open_session().await?,
        };
        let stream = session.open_reserved().await?;
        debug!("Mux stream opened on session {:08x}", stream.session_id());
        Ok(Box::new(stream))
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("mux carries packets through simplesocks"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
        self.underlay.close().await
    }
}

fn sweep(sessions: &Mutex<SessionMap>, idle_timeout: Duration) {
    sessions.lock().retain(|id, session| {
        let evict = session.is_closed()
            || (session.live_streams() == 0 && session.idle_for() >= idle_timeout);
        if evict {
            session.close();
            info!("Mux session {:08x} evicted", id);
        }
        !evict
    });
}

async fn sweep_loop(sessions: Arc<Mutex<SessionMap>>, idle_timeout: Duration, cancel: CancellationToken) {
    let period = (idle_timeout / 4).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => sweep(&sessions, idle_timeout),
        }
    }
    for (_, session) in sessions.lock().drain() {
        session.close();
    }
    debug!("Mux sweeper stopped");
}
