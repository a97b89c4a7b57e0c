//! Timer-driven background tasks.
//!
//! Each task is an independent loop: sleep for its interval, run the body,
//! log any failure, repeat. A failing tick never ends the loop.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::BotHandle;
use crate::handler::BoxFuture;
use crate::tasks::{self, TaskGroup};

pub type PeriodicFn = Arc<dyn Fn(BotHandle) -> BoxFuture + Send + Sync>;

#[derive(Clone)]
pub struct PeriodicTask {
    pub name: String,
    pub interval: Duration,
    pub task: PeriodicFn,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PeriodicTask {
    pub fn new<F>(name: &str, interval: Duration, task: F) -> Self
    where
        F: Fn(BotHandle) -> BoxFuture + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            interval,
            task: Arc::new(task),
        }
    }
}

/// Start one loop per task inside `group`. Returns immediately.
pub fn start(tasks: &[PeriodicTask], handle: &BotHandle, group: &TaskGroup) {
    for task in tasks {
        tracing::info!(task = %task.name, interval = ?task.interval, "Starting periodic task");
        group.spawn(
            format!("periodic:{}", task.name),
            run_forever(task.clone(), handle.clone()),
        );
    }
}

async fn run_forever(task: PeriodicTask, handle: BotHandle) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(task.interval).await;
        tasks::supervise(task.name.clone(), async { (task.task)(handle.clone()).await }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn failing_ticks_keep_looping() {
        let config = BotConfig::new("irc.example.org", "bot", &["#a"]);
        let (handle, _rx) = BotHandle::new(&config);
        let group = TaskGroup::new();

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let flaky = PeriodicTask::new("flaky", Duration::from_secs(10), move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n % 2 == 0 {
                    anyhow::bail!("tick {n} failed");
                }
                Ok(())
            })
        });

        start(&[flaky], &handle, &group);
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        group.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panic_before_future_keeps_looping() {
        let config = BotConfig::new("irc.example.org", "bot", &["#a"]);
        let (handle, _rx) = BotHandle::new(&config);
        let group = TaskGroup::new();

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let brittle = PeriodicTask::new("brittle", Duration::from_secs(10), move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick blew up");
            }
            Box::pin(async { anyhow::Ok(()) })
        });

        start(&[brittle], &handle, &group);
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 6);
        assert_eq!(group.len(), 1);
        group.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_independently() {
        let config = BotConfig::new("irc.example.org", "bot", &["#a"]);
        let (handle, mut rx) = BotHandle::new(&config);
        let group = TaskGroup::new();

        let fast = PeriodicTask::new("fast", Duration::from_secs(1), |bot| {
            Box::pin(async move { bot.send("fast", "#a").await })
        });
        let stuck = PeriodicTask::new("stuck", Duration::from_millis(500), |_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                anyhow::Ok(())
            })
        });

        start(&[stuck, fast], &handle, &group);
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().to_line(), "PRIVMSG #a :fast");
        }
        group.shutdown().await;
    }
}
