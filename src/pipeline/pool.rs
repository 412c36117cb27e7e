//! Continuously refilling bounded pool. At most `limit` futures are in flight;
//! as soon as one finishes the next item starts. Results are tagged with the
//! item's logical index and written back in input order.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Ordered, fail-fast: the first error drops every in-flight future and is
/// returned; no partial output survives.
pub async fn try_map_bounded<T, R, E, F, Fut>(
    items: Vec<T>,
    limit: usize,
    f: F,
) -> Result<Vec<R>, E>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let total = items.len();
    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut in_flight = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let fut = f(index, item);
            async move { (index, fut.await) }
        })
        .buffer_unordered(limit.max(1));

    while let Some((index, result)) = in_flight.next().await {
        slots[index] = Some(result?);
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Ordered, isolated: every item yields its own result.
pub async fn map_bounded<T, R, E, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<Result<R, E>>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let total = items.len();
    let mut slots: Vec<Option<Result<R, E>>> =
        std::iter::repeat_with(|| None).take(total).collect();
    let mut in_flight = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let fut = f(index, item);
            async move { (index, fut.await) }
        })
        .buffer_unordered(limit.max(1));

    while let Some((index, result)) = in_flight.next().await {
        slots[index] = Some(result);
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn keeps_input_order_under_random_latency() {
        let delays: Vec<u64> = {
            let mut rng = rand::rng();
            (0..12).map(|_| rng.random_range(1..20)).collect()
        };
        let out: Result<Vec<usize>, ()> = try_map_bounded(delays, 3, |index, delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(index * 10)
        })
        .await;
        let expected: Vec<usize> = (0..12).map(|i| i * 10).collect();
        assert_eq!(out, Ok(expected));
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        for limit in 1..=4 {
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let out: Result<Vec<()>, ()> = try_map_bounded((0..10).collect(), limit, |_, _: i32| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
            assert!(out.is_ok());
            assert!(peak.load(Ordering::SeqCst) <= limit, "limit {limit}");
        }
    }

    #[tokio::test]
    async fn first_error_fails_the_batch() {
        let out: Result<Vec<usize>, String> =
            try_map_bounded((0..6).collect(), 2, |index, _: u8| async move {
                if index == 3 {
                    Err(format!("item {index} failed"))
                } else {
                    Ok(index)
                }
            })
            .await;
        assert_eq!(out, Err("item 3 failed".to_string()));
    }

    #[tokio::test]
    async fn isolated_results_keep_position() {
        let out: Vec<Result<usize, usize>> =
            map_bounded(vec![5u64, 1, 3], 2, |index, delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if index == 1 { Err(index) } else { Ok(index) }
            })
            .await;
        assert_eq!(out, vec![Ok(0), Err(1), Ok(2)]);
    }
}
