//! Delay and leading-edge throttle wrappers around an async trigger.
//!
//! Wrappers compose: `Delay::new(Throttle::new(handler, 60s), 30s)` waits 30s on every
//! call, then lets at most one call per 60s through to `handler`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// An async action fired with one argument.
#[async_trait]
pub trait TriggerHandler<T: Send + 'static>: Send + Sync {
    type Error: Send;

    async fn call(&self, arg: T) -> Result<(), Self::Error>;
}

/// Adapter turning an async closure into a [`TriggerHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler(f)
}

#[async_trait]
impl<T, F, Fut, E> TriggerHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Send,
{
    type Error = E;

    async fn call(&self, arg: T) -> Result<(), E> {
        (self.0)(arg).await
    }
}

/// Waits a fixed duration before forwarding each call.
pub struct Delay<H> {
    inner: H,
    wait: Duration,
}

impl<H> Delay<H> {
    pub fn new(inner: H, wait: Duration) -> Self {
        Self { inner, wait }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<T, H> TriggerHandler<T> for Delay<H>
where
    T: Send + 'static,
    H: TriggerHandler<T>,
{
    type Error = H::Error;

    async fn call(&self, arg: T) -> Result<(), H::Error> {
        tokio::time::sleep(self.wait).await;
        self.inner.call(arg).await
    }
}

/// Whether a throttled call reached the inner handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    Executed,
    Suppressed,
}

/// Leading-edge throttle: the first call runs, later calls within `interval` of the
/// last executed one are dropped.
///
/// The check and the inner call run under one lock, so concurrent callers queue
/// behind an executing call and then observe its timestamp. The timestamp is taken
/// when a call starts executing, whatever its result.
pub struct Throttle<H> {
    inner: H,
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl<H> Throttle<H> {
    pub fn new(inner: H, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn call<T>(&self, arg: T) -> Result<ThrottleOutcome, H::Error>
    where
        T: Send + 'static,
        H: TriggerHandler<T>,
    {
        let mut last_call = self.last_call.lock().await;
        let now = Instant::now();

        if let Some(previous) = *last_call {
            let elapsed = now.duration_since(previous);
            if elapsed < self.interval {
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "Throttled call suppressed"
                );
                return Ok(ThrottleOutcome::Suppressed);
            }
        }

        *last_call = Some(now);
        self.inner.call(arg).await?;
        Ok(ThrottleOutcome::Executed)
    }
}

#[async_trait]
impl<T, H> TriggerHandler<T> for Throttle<H>
where
    T: Send + 'static,
    H: TriggerHandler<T>,
{
    type Error = H::Error;

    async fn call(&self, arg: T) -> Result<(), H::Error> {
        Throttle::call(self, arg).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting() -> (
        Arc<AtomicU32>,
        FnHandler<impl Fn(&'static str) -> std::future::Ready<Result<(), String>>>,
    ) {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let handler = handler_fn(move |_: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<(), String>(()))
        });
        (count, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_calls_execute_once() {
        let (count, handler) = counting();
        let throttle = Throttle::new(handler, Duration::from_secs(60));

        assert_eq!(throttle.call("a").await, Ok(ThrottleOutcome::Executed));
        assert_eq!(throttle.call("b").await, Ok(ThrottleOutcome::Suppressed));
        assert_eq!(throttle.call("c").await, Ok(ThrottleOutcome::Suppressed));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(throttle.call("d").await, Ok(ThrottleOutcome::Executed));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_still_starts_the_interval() {
        let throttle = Throttle::new(
            handler_fn(|_: ()| async { Err::<(), _>("boom") }),
            Duration::from_secs(60),
        );

        assert_eq!(throttle.call(()).await, Err("boom"));
        assert_eq!(throttle.call(()).await, Ok(ThrottleOutcome::Suppressed));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_before_calling() {
        let (count, handler) = counting();
        let delay = Arc::new(Delay::new(handler, Duration::from_secs(30)));

        let task = tokio::spawn({
            let delay = delay.clone();
            async move { delay.call("x").await }
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_throttle_collapses_a_burst() {
        let (count, handler) = counting();
        let chain = Arc::new(Delay::new(
            Throttle::new(handler, Duration::from_secs(60)),
            Duration::from_secs(30),
        ));

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let chain = chain.clone();
                tokio::spawn(async move { TriggerHandler::call(chain.as_ref(), "burst").await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
