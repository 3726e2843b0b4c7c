use std::{future::Future, pin::pin, rc::Rc, time::Duration};

use futures::future::{self, Either, FutureExt, LocalBoxFuture};
use futures_channel::oneshot;
use tokio::time::MissedTickBehavior;

use crate::FetchError;

/// Boxed fetcher shared by an engine and its poll timer.
pub(crate) type Fetcher<R, V> = Rc<dyn Fn(R) -> LocalBoxFuture<'static, Result<V, FetchError>>>;

/// Boxed page fetcher.
pub(crate) type PageFetcher<R, P, T> =
    Rc<dyn Fn(R, P) -> LocalBoxFuture<'static, Result<Vec<T>, FetchError>>>;

pub(crate) fn make_fetcher<R, V, E, Fu>(fetcher: impl Fn(R) -> Fu + 'static) -> Fetcher<R, V>
where
    Fu: Future<Output = Result<V, E>> + 'static,
    E: Into<FetchError>,
{
    Rc::new(move |request| {
        let fetch = fetcher(request);
        async move { fetch.await.map_err(Into::into) }.boxed_local()
    })
}

pub(crate) fn make_page_fetcher<R, P, T, E, Fu>(
    fetcher: impl Fn(R, P) -> Fu + 'static,
) -> PageFetcher<R, P, T>
where
    Fu: Future<Output = Result<Vec<T>, E>> + 'static,
    E: Into<FetchError>,
{
    Rc::new(move |request, page| {
        let fetch = fetcher(request, page);
        async move { fetch.await.map_err(Into::into) }.boxed_local()
    })
}

/// Runs `fut` until it completes or `cancellation` fires (or its sender is dropped).
pub(crate) async fn execute_with_cancellation<T, Fu>(
    fut: Fu,
    cancellation: oneshot::Receiver<()>,
) -> Result<T, ()>
where
    Fu: Future<Output = T>,
{
    let fut = pin!(fut);
    match future::select(fut, cancellation).await {
        Either::Left((result, _)) => Ok(result),
        Either::Right((cancelled, _)) => {
            if cancelled.is_err() {
                tracing::debug!("poll cancellation sender dropped");
            }
            Err(())
        }
    }
}

/// Calls `tick` every `period`, first one period from now, until `tick` returns false or the
/// schedule is cancelled.
pub(crate) fn spawn_polling(
    period: Duration,
    cancellation: oneshot::Receiver<()>,
    mut tick: impl FnMut() -> bool + 'static,
) {
    let start = tokio::time::Instant::now() + period;
    tokio::task::spawn_local(async move {
        let ticks = async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick() {
                    break;
                }
            }
        };
        let _ = execute_with_cancellation(ticks, cancellation).await;
    });
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::task::LocalSet;

    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancellation_stops_polling() {
        LocalSet::new()
            .run_until(async {
                let ticks = Rc::new(Cell::new(0));
                let (sender, receiver) = oneshot::channel();

                spawn_polling(Duration::from_secs(1), receiver, {
                    let ticks = ticks.clone();
                    move || {
                        ticks.set(ticks.get() + 1);
                        true
                    }
                });

                tokio::time::sleep(Duration::from_millis(3_500)).await;
                assert_eq!(ticks.get(), 3);

                sender.send(()).unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(ticks.get(), 3);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn tick_can_end_the_schedule() {
        LocalSet::new()
            .run_until(async {
                let ticks = Rc::new(Cell::new(0));
                let (_sender, receiver) = oneshot::channel();

                spawn_polling(Duration::from_secs(1), receiver, {
                    let ticks = ticks.clone();
                    move || {
                        ticks.set(ticks.get() + 1);
                        ticks.get() < 2
                    }
                });

                tokio::time::sleep(Duration::from_secs(10)).await;
                assert_eq!(ticks.get(), 2);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fetcher_errors_convert_into_fetch_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("offline")]
        struct Offline;

        let fetcher: Fetcher<u32, u32> = make_fetcher(|request: u32| async move {
            if request == 0 {
                Err(Offline)
            } else {
                Ok(request * 2)
            }
        });

        assert_eq!(fetcher(2).await.unwrap(), 4);
        assert_eq!(fetcher(0).await.unwrap_err().to_string(), "offline");
    }
}
