//! 任务调度：限制同时执行的 Agent 任务数
//!
//! 同一并行组内的任务并发执行，但在途数量不超过 max_parallel_agents（Semaphore）。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 任务调度器
pub struct TaskScheduler {
    agent_semaphore: Arc<Semaphore>,
    max_parallel: usize,
    in_flight: Arc<AtomicUsize>,
}

/// 执行许可；释放时在途计数减一
pub struct AgentPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AgentPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskScheduler {
    pub fn new(max_parallel_agents: usize) -> Self {
        let max_parallel = max_parallel_agents.max(1);
        Self {
            agent_semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 获取执行许可；信号量关闭时返回 None
    pub async fn acquire(&self) -> Option<AgentPermit> {
        let permit = self.agent_semaphore.clone().acquire_owned().await.ok()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(AgentPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let scheduler = Arc::new(TaskScheduler::new(2));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let scheduler = scheduler.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = scheduler.acquire().await.unwrap();
                peak.fetch_max(scheduler.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(TaskScheduler::new(0).max_parallel(), 1);
    }
}
