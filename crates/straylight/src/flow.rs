//! Session-flow control: the outer concurrency discipline.
//!
//! Requests within one conversation are strictly serial; different
//! conversations run in parallel up to the worker pool's bound. Each
//! conversation key owns a fair FIFO mutex - a request queued behind the
//! lock that gets cancelled simply drops out of the wait queue, which is
//! exactly the queued-cancellation contract.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::debug;

use straylight_common::error::{ErrorKind, ProxyError};

/// Sender half of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fires the signal; every clone of the paired [`CancelSignal`]
    /// observes it at its next suspension point.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of a cancellation signal; cloneable per request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for callers without cancellation.
    ///
    /// The sender is dropped immediately; `cancelled()` treats a closed
    /// channel as never-firing.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever if the
    /// handle is dropped without firing.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender dropped without cancelling: never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a linked cancel handle/signal pair.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

fn cancelled_error() -> ProxyError {
    ProxyError::new(
        ErrorKind::Cancelled,
        "request was cancelled before producing a reply",
    )
}

/// Serializes requests per conversation and bounds global parallelism.
pub struct FlowController {
    conversation_locks: DashMap<String, Arc<Mutex<()>>>,
    workers: Arc<Semaphore>,
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("conversations", &self.conversation_locks.len())
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}

impl FlowController {
    /// Creates a controller with the configured worker bound.
    #[must_use]
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            conversation_locks: DashMap::new(),
            workers: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    /// Submits work for a conversation.
    ///
    /// The work runs only when it reaches the head of the conversation's
    /// queue and a pool worker is free. The deadline covers the work
    /// itself, not the time spent queued. On completion - success or
    /// failure - the conversation advances to its next queued request.
    ///
    /// # Errors
    ///
    /// `cancelled` when the signal fires first (queued or in-flight),
    /// `timeout_error` when the deadline elapses; otherwise whatever the
    /// work returns.
    pub async fn submit<F, T>(
        &self,
        conversation_key: &str,
        deadline: Option<Duration>,
        mut cancel: CancelSignal,
        work: F,
    ) -> Result<T, ProxyError>
    where
        F: Future<Output = Result<T, ProxyError>>,
    {
        let lock = self
            .conversation_locks
            .entry(conversation_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        // Head-of-queue wait; a cancelled waiter drops out of the FIFO.
        let guard = tokio::select! {
            guard = lock.lock() => guard,
            () = cancel.cancelled() => {
                debug!(conversation = conversation_key, "cancelled while queued");
                return Err(cancelled_error());
            }
        };

        let _permit = tokio::select! {
            permit = self.workers.acquire() => permit.map_err(|_| {
                ProxyError::new(ErrorKind::ApiError, "worker pool is shut down")
            })?,
            () = cancel.cancelled() => {
                drop(guard);
                return Err(cancelled_error());
            }
        };

        let result = match deadline {
            Some(deadline) => tokio::select! {
                outcome = tokio::time::timeout(deadline, work) => outcome.map_or_else(
                    |_| Err(ProxyError::new(
                        ErrorKind::TimeoutError,
                        format!("request exceeded its {}ms deadline", deadline.as_millis()),
                    )),
                    |inner| inner,
                ),
                () = cancel.cancelled() => Err(cancelled_error()),
            },
            None => tokio::select! {
                outcome = work => outcome,
                () = cancel.cancelled() => Err(cancelled_error()),
            },
        };

        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Arc as StdArc;
    use std::time::Instant;

    use tokio::sync::Mutex as TokioMutex;

    use super::*;

    #[tokio::test]
    async fn test_intra_conversation_serialization() {
        // Three requests on one conversation; the first is slow. Each
        // request's start must come after the previous one's finish.
        let flow = StdArc::new(FlowController::new(8));
        let spans: StdArc<TokioMutex<Vec<(Instant, Instant)>>> =
            StdArc::new(TokioMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let flow = StdArc::clone(&flow);
            let spans = StdArc::clone(&spans);
            handles.push(tokio::spawn(async move {
                flow.submit("conversation-a", None, CancelSignal::never(), async {
                    let started = Instant::now();
                    let delay = if i == 0 { 200 } else { 20 };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    spans.lock().await.push((started, Instant::now()));
                    Ok(())
                })
                .await
            }));
            // Stagger submissions so the queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let spans = spans.lock().await;
        assert_eq!(spans.len(), 3);
        for pair in spans.windows(2) {
            assert!(pair[1].0 >= pair[0].1, "requests overlapped within a conversation");
        }
    }

    #[tokio::test]
    async fn test_parallel_conversations_overlap() {
        let flow = StdArc::new(FlowController::new(8));
        let started = Instant::now();

        let a = {
            let flow = StdArc::clone(&flow);
            tokio::spawn(async move {
                flow.submit("conversation-a", None, CancelSignal::never(), async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                })
                .await
            })
        };
        let b = {
            let flow = StdArc::clone(&flow);
            tokio::spawn(async move {
                flow.submit("conversation-b", None, CancelSignal::never(), async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                })
                .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Two serialized 150ms requests would need 300ms.
        assert!(started.elapsed() < Duration::from_millis(280));
    }

    #[tokio::test]
    async fn test_queued_cancellation_removes_from_queue() {
        let flow = StdArc::new(FlowController::new(8));
        let (handle, signal) = cancel_pair();

        // Occupy the conversation.
        let blocker = {
            let flow = StdArc::clone(&flow);
            tokio::spawn(async move {
                flow.submit("conversation-a", None, CancelSignal::never(), async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = {
            let flow = StdArc::clone(&flow);
            tokio::spawn(async move {
                flow.submit("conversation-a", None, signal, async { Ok(()) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let err = queued.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        // The blocker is unaffected.
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inflight_cancellation() {
        let flow = FlowController::new(8);
        let (handle, signal) = cancel_pair();

        let work = flow.submit("conversation-a", None, signal, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        tokio::pin!(work);

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(50)) => handle.cancel(),
            _ = &mut work => panic!("work finished before cancellation"),
        }

        let err = work.await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout_error() {
        let flow = FlowController::new(8);
        let err = flow
            .submit(
                "conversation-a",
                Some(Duration::from_millis(50)),
                CancelSignal::never(),
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimeoutError);
    }

    #[tokio::test]
    async fn test_conversation_advances_after_failure() {
        let flow = FlowController::new(8);

        let failed: Result<(), ProxyError> = flow
            .submit("conversation-a", None, CancelSignal::never(), async {
                Err(ProxyError::new(ErrorKind::ApiError, "boom"))
            })
            .await;
        assert!(failed.is_err());

        // The queue is free for the next request.
        flow.submit("conversation-a", None, CancelSignal::never(), async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_parallelism() {
        let flow = StdArc::new(FlowController::new(2));
        let peak = StdArc::new(TokioMutex::new((0_u32, 0_u32)));

        let mut handles = Vec::new();
        for i in 0..6 {
            let flow = StdArc::clone(&flow);
            let peak = StdArc::clone(&peak);
            handles.push(tokio::spawn(async move {
                flow.submit(&format!("conversation-{i}"), None, CancelSignal::never(), async {
                    {
                        let mut p = peak.lock().await;
                        p.0 += 1;
                        p.1 = p.1.max(p.0);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    peak.lock().await.0 -= 1;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.lock().await.1 <= 2, "worker bound exceeded");
    }
}
