//! 会话监管：取消与暂停
//!
//! 每个请求一个 CancellationToken（新请求开始时替换已取消的旧 token）；暂停通过 watch 通道表达，
//! 等待方在组与组之间 await 恢复，不轮询。

use std::sync::Mutex;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 请求级生命周期管理：取消令牌与暂停状态
#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: Mutex<CancellationToken>,
    paused: watch::Sender<bool>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel_token: Mutex::new(CancellationToken::new()),
            paused,
        }
    }

    fn token_slot(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        match self.cancel_token.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 为新请求准备 token：上一个请求已被取消时换一个新的
    pub fn begin_request(&self) -> CancellationToken {
        let mut slot = self.token_slot();
        if slot.is_cancelled() {
            *slot = CancellationToken::new();
        }
        slot.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.token_slot().clone()
    }

    /// 触发取消：在途任务跑完，之后不再派发
    pub fn cancel(&self) {
        self.token_slot().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token_slot().is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    /// 暂停时等待恢复或取消；返回 false 表示已取消
    pub async fn wait_if_paused(&self, token: &CancellationToken) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if token.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return !token.is_cancelled();
                    }
                }
            }
        }
    }

    /// 创建子 token（用于单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.token_slot().child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
