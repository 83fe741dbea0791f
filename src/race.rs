use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::select_all;
use futures_util::task::noop_waker_ref;

/// A boxed, pinned future, the common currency `first_to_finish` races.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Races a named set of awaitables and returns every one that finished in
/// the same scheduling quantum as the first. Every awaitable that did not
/// win is dropped (cancelled) before this returns.
///
/// Normally exactly one entry finishes first; simultaneous completion is
/// possible (e.g. a timer firing the same tick a message arrives) and
/// callers must handle every key present in the result.
pub async fn first_to_finish<T>(
    named: Vec<(&'static str, BoxFuture<'_, T>)>,
) -> HashMap<&'static str, T> {
    let mut names: Vec<&'static str> = named.iter().map(|(name, _)| *name).collect();
    let futs: Vec<_> = named.into_iter().map(|(_, fut)| fut).collect();

    let (value, idx, mut remaining) = select_all(futs).await;
    let mut results = HashMap::new();
    results.insert(names.remove(idx), value);

    // Drain anything else that is already ready in this same quantum before
    // we drop (cancel) the rest.
    let waker = noop_waker_ref();
    let mut cx = Context::from_waker(waker);
    let mut i = 0;
    while i < remaining.len() {
        match Pin::new(&mut remaining[i]).poll(&mut cx) {
            Poll::Ready(value) => {
                results.insert(names.remove(i), value);
                drop(remaining.remove(i));
            }
            Poll::Pending => i += 1,
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn single_winner() {
        let fast: BoxFuture<'_, &'static str> = Box::pin(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            "fast"
        });
        let slow: BoxFuture<'_, &'static str> = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "slow"
        });

        let result = first_to_finish(vec![("fast", fast), ("slow", slow)]).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result.get("fast"), Some(&"fast"));
    }

    #[tokio::test]
    async fn losers_are_cancelled_not_lost() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let polled_to_completion = Arc::new(AtomicBool::new(false));
        let flag = polled_to_completion.clone();

        let immediate: BoxFuture<'_, u8> = Box::pin(async { 1u8 });
        let never: BoxFuture<'_, u8> = Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
            2u8
        });

        let result = first_to_finish(vec![("immediate", immediate), ("never", never)]).await;
        assert_eq!(result.get("immediate"), Some(&1));
        assert!(!result.contains_key("never"));
        assert!(!polled_to_completion.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn already_ready_futures_tie() {
        let a: BoxFuture<'_, u8> = Box::pin(async { 1u8 });
        let b: BoxFuture<'_, u8> = Box::pin(async { 2u8 });

        let result = first_to_finish(vec![("a", a), ("b", b)]).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result.get("a"), Some(&1));
        assert_eq!(result.get("b"), Some(&2));
    }
}
