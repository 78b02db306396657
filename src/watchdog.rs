//! Liveness supervision during a machine start.
//!
//! The watchdog polls the supervising parent, the hypervisor helper and the
//! network proxy. The command proxy is auxiliary and not watched. The first
//! death it sees ends the watch; cancellation ends it too.

use crate::process::{self, ProcessRegistry, ProcessRole, ProcessStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How often liveness is polled.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Why the watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// The owner asked it to stop.
    Cancelled,
    /// A supervised process is gone.
    Died {
        /// Which process.
        role: ProcessRole,
        /// Its pid.
        pid: u32,
        /// Exit code, when the process was our child and got reaped.
        exit_code: Option<i32>,
    },
}

impl WatchdogEvent {
    /// Convert a death into the error the start operation returns.
    ///
    /// A hypervisor that exited cleanly is a shutdown from inside the guest,
    /// not a failure.
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            WatchdogEvent::Cancelled => Ok(()),
            WatchdogEvent::Died {
                role: ProcessRole::Parent,
                pid,
                ..
            } => Err(crate::Error::ParentDead(pid)),
            WatchdogEvent::Died {
                role: ProcessRole::Hypervisor,
                exit_code: Some(0),
                ..
            } => Ok(()),
            WatchdogEvent::Died { role, pid, .. } => Err(crate::Error::ProcessDied {
                role: role.to_string(),
                pid,
            }),
        }
    }
}

/// Polls the parent and the core helpers in a [`ProcessRegistry`].
#[derive(Debug, Clone)]
pub struct Watchdog {
    ppid: u32,
    registry: Arc<ProcessRegistry>,
    interval: Duration,
}

impl Watchdog {
    /// Watch `ppid` and everything in `registry`.
    pub fn new(ppid: u32, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            ppid,
            registry,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Override the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One liveness pass.
    pub fn check(&self) -> Option<WatchdogEvent> {
        if !process::is_alive(self.ppid) {
            return Some(WatchdogEvent::Died {
                role: ProcessRole::Parent,
                pid: self.ppid,
                exit_code: None,
            });
        }
        for role in [ProcessRole::Hypervisor, ProcessRole::NetworkProxy] {
            if let Some(ProcessStatus::Exited(exit_code)) = self.registry.check(role) {
                return Some(WatchdogEvent::Died {
                    role,
                    pid: self.registry.pid(role).unwrap_or_default(),
                    exit_code,
                });
            }
        }
        None
    }

    /// Poll until something dies or `cancel` flips to true (or its sender drops).
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> WatchdogEvent {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *cancel.borrow() {
                return WatchdogEvent::Cancelled;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(event) = self.check() {
                        tracing::warn!(?event, "supervised process exited");
                        return event;
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return WatchdogEvent::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel() {
        let registry = Arc::new(ProcessRegistry::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            Watchdog::new(std::process::id(), registry)
                .with_interval(Duration::from_millis(10))
                .run(rx),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), WatchdogEvent::Cancelled);
    }

    #[tokio::test]
    async fn test_dead_parent() {
        let registry = Arc::new(ProcessRegistry::new());
        let (_tx, rx) = watch::channel(false);
        let event = Watchdog::new(99_999_999, registry).run(rx).await;
        assert!(matches!(
            event,
            WatchdogEvent::Died {
                role: ProcessRole::Parent,
                ..
            }
        ));
        assert!(matches!(event.into_result(), Err(crate::Error::ParentDead(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_helper() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 4"])
            .spawn()
            .unwrap();
        let registry = Arc::new(ProcessRegistry::new());
        registry.register(ProcessRole::NetworkProxy, child.id());

        let (_tx, rx) = watch::channel(false);
        let event = tokio::time::timeout(
            Duration::from_secs(5),
            Watchdog::new(std::process::id(), registry)
                .with_interval(Duration::from_millis(10))
                .run(rx),
        )
        .await
        .unwrap();
        assert_eq!(
            event,
            WatchdogEvent::Died {
                role: ProcessRole::NetworkProxy,
                pid: child.id(),
                exit_code: Some(4),
            }
        );
        assert!(matches!(
            event.into_result(),
            Err(crate::Error::ProcessDied { .. })
        ));
    }

    #[test]
    fn test_clean_hypervisor_exit_is_ok() {
        let event = WatchdogEvent::Died {
            role: ProcessRole::Hypervisor,
            pid: 10,
            exit_code: Some(0),
        };
        assert!(event.into_result().is_ok());
        let event = WatchdogEvent::Died {
            role: ProcessRole::Hypervisor,
            pid: 10,
            exit_code: Some(1),
        };
        assert!(event.into_result().is_err());
    }
}
