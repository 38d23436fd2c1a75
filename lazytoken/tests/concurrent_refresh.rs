use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

use lazytoken::{issuer::TokenIssuer, AudienceRef, IssuedToken, TokenCache};
use lazytoken_clock::{DurationSecs, TestClock, UnixTime};

/// Issues `tok1`, `tok2`, … and takes a while doing it
#[derive(Clone, Default)]
struct SlowIssuer {
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl TokenIssuer for SlowIssuer {
    type Error = std::convert::Infallible;

    fn issue(&mut self, _: &AudienceRef) -> Result<IssuedToken, Self::Error> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        thread::sleep(Duration::from_millis(100));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(IssuedToken::new(format!("tok{}", n), DurationSecs(1000)))
    }
}

fn stale_cache(issuer: &SlowIssuer) -> TokenCache<SlowIssuer, TestClock> {
    let clock = TestClock::new(UnixTime(0));
    let cache = TokenCache::builder(issuer.clone(), "https://api.example.com/")
        .with_clock(clock.clone())
        .build()
        .unwrap();

    clock.set(UnixTime(920));
    cache
}

#[test]
fn concurrent_callers_share_a_single_refresh() {
    const CALLERS: usize = 16;

    let issuer = SlowIssuer::default();
    let cache = stale_cache(&issuer);
    let barrier = Barrier::new(CALLERS);

    let tokens: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_token().unwrap().as_str().to_owned()
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(issuer.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(tokens.iter().all(|t| t == "tok2"), "{:?}", tokens);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_and_sync_callers_share_a_single_refresh() {
    let issuer = SlowIssuer::default();
    let cache = stale_cache(&issuer);

    let mut tasks = Vec::new();
    for i in 0..12 {
        let cache = cache.clone();
        if i % 2 == 0 {
            tasks.push(tokio::spawn(async move { cache.get_token_async().await }));
        } else {
            tasks.push(tokio::spawn(async move {
                tokio::task::spawn_blocking(move || cache.get_token())
                    .await
                    .unwrap()
            }));
        }
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().as_str(), "tok2");
    }

    assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(issuer.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn readers_of_a_fresh_token_never_reach_the_issuer() {
    let issuer = SlowIssuer::default();
    let clock = TestClock::new(UnixTime(0));
    let cache = TokenCache::builder(issuer.clone(), "https://api.example.com/")
        .with_clock(clock)
        .build()
        .unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..100 {
                    assert_eq!(cache.get_token().unwrap().as_str(), "tok1");
                }
            });
        }
    });

    assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
}
