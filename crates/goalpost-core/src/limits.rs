//! Scoped resource limits around handler invocations.
//!
//! The memory cap is a process address-space rlimit installed for the
//! duration of the handler call and restored on drop. The wall-clock cap
//! is a timeout on the handler future; cancellation drops the savepoint
//! and surfaces as an ordinary handler failure.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::settings::EngineSettings;

/// Raised (as an `anyhow` source) when the wall-clock cap fires.
#[derive(Debug, thiserror::Error)]
#[error("handler exceeded time limit of {0:?}")]
pub struct TimesUp(pub Duration);

/// RAII guard that caps the process address space while alive.
///
/// The cap is process-wide, so concurrent handlers in the same process
/// share whatever limit is currently installed; the original soft limit is
/// restored when the guard drops. On non-Unix targets this is a no-op.
pub struct MemoryLimitGuard {
    #[cfg(unix)]
    original_soft: Option<libc::rlim_t>,
}

impl MemoryLimitGuard {
    pub fn new(limit_mib: Option<u64>) -> Self {
        #[cfg(unix)]
        {
            let Some(limit_mib) = limit_mib else {
                return Self {
                    original_soft: None,
                };
            };

            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            // SAFETY: plain libc calls on a stack-owned struct.
            let got = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut current) };
            if got != 0 {
                tracing::warn!("getrlimit(RLIMIT_AS) failed; memory cap not applied");
                return Self {
                    original_soft: None,
                };
            }

            let capped = libc::rlimit {
                rlim_cur: (limit_mib * 1024 * 1024) as libc::rlim_t,
                rlim_max: current.rlim_max,
            };
            let set = unsafe { libc::setrlimit(libc::RLIMIT_AS, &capped) };
            if set != 0 {
                tracing::warn!(limit_mib, "setrlimit(RLIMIT_AS) failed; memory cap not applied");
                return Self {
                    original_soft: None,
                };
            }

            Self {
                original_soft: Some(current.rlim_cur),
            }
        }
        #[cfg(not(unix))]
        {
            if limit_mib.is_some() {
                tracing::warn!("memory limits are only supported on unix");
            }
            Self {}
        }
    }
}

impl Drop for MemoryLimitGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original_soft) = self.original_soft {
            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            // SAFETY: plain libc calls on a stack-owned struct.
            if unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut current) } == 0 {
                let restored = libc::rlimit {
                    rlim_cur: original_soft,
                    rlim_max: current.rlim_max,
                };
                if unsafe { libc::setrlimit(libc::RLIMIT_AS, &restored) } != 0 {
                    tracing::warn!("failed to restore RLIMIT_AS soft limit");
                }
            }
        }
    }
}

/// Run a handler future under the configured memory and wall-clock caps.
///
/// Both limit violations surface as `Err`, which dispatch treats like any
/// other handler failure.
pub async fn run_with_limits<T, F>(settings: &EngineSettings, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let _memory_guard = MemoryLimitGuard::new(settings.memory_limit_mib);

    match settings.time_limit() {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(TimesUp(limit).into()),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_limits_passes_through() {
        let settings = EngineSettings::default();
        let result: Result<i32> = run_with_limits(&settings, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_fires() {
        let settings = EngineSettings {
            time_limit_seconds: Some(1),
            ..EngineSettings::default()
        };
        let result: Result<()> = run_with_limits(&settings, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<TimesUp>().is_some(), "unexpected error: {err:#}");
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_allows_fast_handlers() {
        let settings = EngineSettings {
            time_limit_seconds: Some(3),
            ..EngineSettings::default()
        };
        let result: Result<()> = run_with_limits(&settings, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(result.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn disabled_memory_guard_is_noop() {
        let guard = MemoryLimitGuard::new(None);
        assert!(guard.original_soft.is_none());
        drop(guard);
    }
}
