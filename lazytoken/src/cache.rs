use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use arc_swap::ArcSwap;
use lazytoken_clock::{Clock, DurationSecs, System};
use thiserror::Error;

use crate::{
    issuer::TokenIssuer,
    tokens::{LifetimeTooShort, MinExpirationDelay, RefreshPolicy},
    AccessToken, Audience, AudienceRef, CachedToken, TokenStatus,
};

/// An error obtaining a token from a [`TokenCache`]
#[derive(Debug, Error)]
pub enum TokenCacheError<E> {
    /// The issuer failed to produce a token
    ///
    /// The previously cached token, if any, remains in place.
    #[error("error requesting token from issuer")]
    Issuer(#[source] E),
    /// The issuer produced a token that would be stale as soon as it arrived
    ///
    /// This indicates a misconfigured minimum expiration delay. Retrying will
    /// not help until the configuration changes.
    #[error(
        "issued token's lifetime ({lifetime}) is shorter than the configured minimum expiration delay ({min_expiration_delay})"
    )]
    LifetimeTooShort {
        /// The lifetime of the rejected token
        lifetime: DurationSecs,
        /// The configured minimum expiration delay
        min_expiration_delay: DurationSecs,
    },
    /// The background worker was shut down before obtaining a token
    #[error("token worker was cancelled before completing")]
    Cancelled,
}

impl<E> From<LifetimeTooShort> for TokenCacheError<E> {
    fn from(err: LifetimeTooShort) -> Self {
        Self::LifetimeTooShort {
            lifetime: err.lifetime,
            min_expiration_delay: err.min_expiration_delay,
        }
    }
}

struct Inner<I, C> {
    /// Refresh gate, held across the check, issue and install of a new token
    issuer: Mutex<I>,
    audience: Audience,
    policy: RefreshPolicy<C>,
    current: ArcSwap<CachedToken>,
}

/// A cache for an access token that renews the token when it is accessed
/// shortly before it expires
///
/// The cache is a cheap handle; clones share the same token and the same
/// issuer. A token is considered stale once it has less than the minimum
/// expiration delay left to live. Stale tokens are never returned: the
/// access that observes a stale token refreshes it first, and concurrent
/// accesses wait on that single refresh rather than starting their own.
///
/// Nothing happens in the background. An idle cache makes no requests.
///
/// ```
/// use lazytoken::{issuer::TokenIssuer, AudienceRef, IssuedToken, TokenCache};
/// use lazytoken_clock::DurationSecs;
///
/// struct Fixed;
///
/// impl TokenIssuer for Fixed {
///     type Error = std::convert::Infallible;
///
///     fn issue(&mut self, _: &AudienceRef) -> Result<IssuedToken, Self::Error> {
///         Ok(IssuedToken::new("tok1", DurationSecs(3600)))
///     }
/// }
///
/// let cache = TokenCache::new(Fixed, "https://api.example.com/")?;
/// assert_eq!(cache.get_token()?.as_str(), "tok1");
/// assert_eq!(cache.min_expiration_delay(), DurationSecs(360));
/// # Ok::<(), lazytoken::TokenCacheError<std::convert::Infallible>>(())
/// ```
#[must_use]
pub struct TokenCache<I, C = System> {
    inner: Arc<Inner<I, C>>,
}

impl<I, C> Clone for TokenCache<I, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, C: fmt::Debug> fmt::Debug for TokenCache<I, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("audience", &self.inner.audience)
            .field("min_expiration_delay", &self.inner.policy.min_expiration_delay())
            .field("current", &self.inner.current.load_full())
            .field("clock", self.inner.policy.clock())
            .finish_non_exhaustive()
    }
}

impl<I: TokenIssuer> TokenCache<I, System> {
    /// Constructs a new cache using the default configuration
    ///
    /// The first token is obtained immediately. See [`TokenCacheBuilder::build`].
    pub fn new(
        issuer: I,
        audience: impl Into<Audience>,
    ) -> Result<Self, TokenCacheError<I::Error>> {
        Self::builder(issuer, audience).build()
    }

    /// Starts configuring a new cache
    pub fn builder(issuer: I, audience: impl Into<Audience>) -> TokenCacheBuilder<I, System> {
        TokenCacheBuilder {
            issuer,
            audience: audience.into(),
            min_expiration_delay: MinExpirationDelay::default(),
            clock: System,
        }
    }
}

impl<I: TokenIssuer, C: Clock> TokenCache<I, C> {
    /// Gets an access token with at least the minimum expiration delay left
    /// to live
    ///
    /// Blocks while the issuer is called if the cached token is stale. Returns
    /// without blocking on the issuer otherwise.
    ///
    /// # Errors
    ///
    /// Returns the issuer's error if a refresh was needed and failed, or
    /// [`TokenCacheError::LifetimeTooShort`] if the issued token was rejected.
    /// In both cases the cached token is left unchanged and the next call will
    /// try again.
    pub fn get_token(&self) -> Result<AccessToken, TokenCacheError<I::Error>> {
        Ok(self.fresh_token()?.access_token().to_owned())
    }

    /// Gets the currently cached token record without refreshing it
    pub fn cached_token(&self) -> Arc<CachedToken> {
        self.inner.current.load_full()
    }

    /// Gets the lifetime status of the cached token
    pub fn token_status(&self) -> TokenStatus {
        self.inner
            .current
            .load()
            .token_status_with_clock(self.inner.policy.clock())
    }

    fn fresh_token(&self) -> Result<Arc<CachedToken>, TokenCacheError<I::Error>> {
        let current = self.inner.current.load_full();
        if !self.inner.policy.needs_refresh(&current) {
            return Ok(current);
        }

        let mut issuer = self
            .inner
            .issuer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another caller may have refreshed while we waited on the gate.
        let current = self.inner.current.load_full();
        if !self.inner.policy.needs_refresh(&current) {
            tracing::trace!("token refreshed by concurrent caller");
            return Ok(current);
        }

        tracing::debug!(
            audience = %self.inner.audience,
            stale = current.stale().0,
            expiry = current.expiry().0,
            "cached token is stale, requesting new token"
        );

        let issued = issuer
            .issue(&self.inner.audience)
            .map_err(TokenCacheError::Issuer)?;
        let token = Arc::new(self.inner.policy.accept(issued)?);

        tracing::info!(
            lifetime = token.lifetime().0,
            stale = token.stale().0,
            expiry = token.expiry().0,
            "installed new token"
        );

        self.inner.current.store(Arc::clone(&token));
        Ok(token)
    }
}

impl<I, C> TokenCache<I, C>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Gets an access token without blocking the current task
    ///
    /// Runs [`get_token`][Self::get_token] on the runtime's blocking pool, so
    /// it shares the same refresh gate as synchronous callers.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime. If the issuer panics, the
    /// panic is resumed on the awaiting task.
    pub async fn get_token_async(&self) -> Result<AccessToken, TokenCacheError<I::Error>> {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.get_token()).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(TokenCacheError::Cancelled),
        }
    }
}

impl<I, C> TokenCache<I, C> {
    /// The audience requested from the issuer
    pub fn audience(&self) -> &AudienceRef {
        &self.inner.audience
    }

    /// The minimum expiration delay in effect
    ///
    /// Fixed for the life of the cache, whether configured or derived from the
    /// first token.
    pub fn min_expiration_delay(&self) -> DurationSecs {
        self.inner.policy.min_expiration_delay()
    }
}

/// Configuration for a [`TokenCache`]
#[derive(Debug)]
#[must_use]
pub struct TokenCacheBuilder<I, C = System> {
    issuer: I,
    audience: Audience,
    min_expiration_delay: MinExpirationDelay,
    clock: C,
}

impl<I, C> TokenCacheBuilder<I, C> {
    /// Sets how long before expiry a token must be refreshed
    ///
    /// Every token issued, including the first, must live at least this long.
    /// Defaults to one tenth of the lifetime of the first token. A delay of
    /// zero refreshes a token only once it has expired.
    pub fn with_min_expiration_delay(mut self, delay: impl Into<MinExpirationDelay>) -> Self {
        self.min_expiration_delay = delay.into();
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenCacheBuilder<I, D> {
        TokenCacheBuilder {
            issuer: self.issuer,
            audience: self.audience,
            min_expiration_delay: self.min_expiration_delay,
            clock,
        }
    }
}

impl<I: TokenIssuer, C: Clock> TokenCacheBuilder<I, C> {
    /// Obtains the first token and constructs the cache
    ///
    /// # Errors
    ///
    /// Fails with the same errors as [`TokenCache::get_token`] if the first
    /// token cannot be obtained or is rejected. No cache is produced.
    #[tracing::instrument(skip(self), fields(audience = %self.audience))]
    pub fn build(mut self) -> Result<TokenCache<I, C>, TokenCacheError<I::Error>> {
        let first = self
            .issuer
            .issue(&self.audience)
            .map_err(TokenCacheError::Issuer)?;
        let (policy, token) =
            RefreshPolicy::for_first_token(self.min_expiration_delay, first, self.clock)?;

        tracing::info!(
            lifetime = token.lifetime().0,
            min_expiration_delay = policy.min_expiration_delay().0,
            expiry = token.expiry().0,
            "obtained first token"
        );

        Ok(TokenCache {
            inner: Arc::new(Inner {
                issuer: Mutex::new(self.issuer),
                audience: self.audience,
                policy,
                current: ArcSwap::from_pointee(token),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        panic::{self, AssertUnwindSafe},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use lazytoken_clock::{TestClock, UnixTime};

    use super::*;
    use crate::IssuedToken;

    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("issuer unavailable")]
    struct Unavailable;

    enum Step {
        Token(&'static str, u64),
        Fail,
        Panic,
    }

    #[derive(Clone, Default)]
    struct ScriptedIssuer {
        steps: Arc<Mutex<VecDeque<Step>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedIssuer {
        fn then(self, step: Step) -> Self {
            self.steps.lock().unwrap().push_back(step);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenIssuer for ScriptedIssuer {
        type Error = Unavailable;

        fn issue(&mut self, audience: &AudienceRef) -> Result<IssuedToken, Self::Error> {
            assert_eq!(audience.as_str(), "https://api.example.com/");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            match step.expect("unexpected call to issuer") {
                Step::Token(token, lifetime) => {
                    Ok(IssuedToken::new(token, DurationSecs(lifetime)))
                }
                Step::Fail => Err(Unavailable),
                Step::Panic => panic!("issuer blew up"),
            }
        }
    }

    fn build(
        issuer: &ScriptedIssuer,
        clock: &TestClock,
        delay: Option<u64>,
    ) -> Result<TokenCache<ScriptedIssuer, TestClock>, TokenCacheError<Unavailable>> {
        let mut builder = TokenCache::builder(issuer.clone(), "https://api.example.com/")
            .with_clock(clock.clone());
        if let Some(delay) = delay {
            builder = builder.with_min_expiration_delay(DurationSecs(delay));
        }
        builder.build()
    }

    #[test]
    fn refreshes_once_remaining_lifetime_drops_below_derived_delay() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 1000))
            .then(Step::Token("tok2", 1000));
        let cache = build(&issuer, &clock, None).unwrap();

        assert_eq!(cache.min_expiration_delay(), DurationSecs(100));
        assert_eq!(issuer.calls(), 1);

        clock.set(UnixTime(850));
        assert_eq!(cache.get_token().unwrap().as_str(), "tok1");
        assert_eq!(issuer.calls(), 1);

        clock.set(UnixTime(920));
        assert_eq!(cache.token_status(), TokenStatus::Stale);
        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 2);

        let cached = cache.cached_token();
        assert_eq!(cached.issued(), UnixTime(920));
        assert_eq!(cached.expiry(), UnixTime(1920));
        assert_eq!(cache.token_status(), TokenStatus::Fresh);
    }

    #[test]
    fn fresh_token_is_served_without_calling_issuer() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default().then(Step::Token("tok1", 600));
        let cache = build(&issuer, &clock, Some(60)).unwrap();

        for t in [0, 100, 300, 540] {
            clock.set(UnixTime(t));
            assert_eq!(cache.get_token().unwrap().as_str(), "tok1");
        }
        assert_eq!(issuer.calls(), 1);
    }

    #[test]
    fn derived_delay_survives_tokens_with_other_lifetimes() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 1000))
            .then(Step::Token("tok2", 200));
        let cache = build(&issuer, &clock, None).unwrap();

        clock.set(UnixTime(901));
        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(cache.min_expiration_delay(), DurationSecs(100));
        assert_eq!(cache.cached_token().stale(), UnixTime(1001));
    }

    #[test]
    fn short_first_lifetime_is_refreshed_at_expiry() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 5))
            .then(Step::Token("tok2", 5));
        let cache = build(&issuer, &clock, None).unwrap();
        assert_eq!(cache.min_expiration_delay(), DurationSecs::ZERO);

        clock.set(UnixTime(4));
        assert_eq!(cache.get_token().unwrap().as_str(), "tok1");

        clock.set(UnixTime(5));
        assert_eq!(cache.token_status(), TokenStatus::Expired);
        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 2);
    }

    #[test]
    fn zero_fixed_delay_refreshes_only_once_expired() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 600))
            .then(Step::Token("tok2", 600));
        let cache = build(&issuer, &clock, Some(0)).unwrap();

        clock.set(UnixTime(599));
        assert_eq!(cache.get_token().unwrap().as_str(), "tok1");

        clock.set(UnixTime(600));
        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 2);
    }

    #[test]
    fn construction_fails_when_issuer_fails() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default().then(Step::Fail);

        let err = build(&issuer, &clock, None).unwrap_err();
        assert!(matches!(err, TokenCacheError::Issuer(Unavailable)));
    }

    #[test]
    fn construction_fails_when_first_token_is_shorter_than_delay() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default().then(Step::Token("tok1", 50));

        let err = build(&issuer, &clock, Some(60)).unwrap_err();
        assert!(matches!(
            err,
            TokenCacheError::LifetimeTooShort {
                lifetime: DurationSecs(50),
                min_expiration_delay: DurationSecs(60),
            }
        ));
    }

    #[test]
    fn short_lived_refresh_is_rejected_and_cached_token_kept() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 600))
            .then(Step::Token("short", 50))
            .then(Step::Token("tok2", 600));
        let cache = build(&issuer, &clock, Some(60)).unwrap();

        clock.set(UnixTime(550));
        let err = cache.get_token().unwrap_err();
        assert_eq!(
            err.to_string(),
            "issued token's lifetime (50s) is shorter than the configured minimum expiration delay (60s)"
        );
        assert_eq!(cache.cached_token().access_token().as_str(), "tok1");

        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 3);
    }

    #[test]
    fn issuer_failure_keeps_cached_token_and_next_access_retries() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 1000))
            .then(Step::Fail)
            .then(Step::Token("tok2", 1000));
        let cache = build(&issuer, &clock, None).unwrap();

        clock.set(UnixTime(950));
        let err = cache.get_token().unwrap_err();
        assert!(matches!(err, TokenCacheError::Issuer(Unavailable)));
        assert_eq!(cache.cached_token().access_token().as_str(), "tok1");
        assert_eq!(cache.token_status(), TokenStatus::Stale);

        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 3);
    }

    #[test]
    fn issuer_error_is_exposed_as_source() {
        use std::error::Error as _;

        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default().then(Step::Fail);

        let err = build(&issuer, &clock, None).unwrap_err();
        assert_eq!(err.to_string(), "error requesting token from issuer");
        assert_eq!(err.source().unwrap().to_string(), "issuer unavailable");
    }

    #[test]
    fn panicking_issuer_does_not_wedge_the_cache() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 1000))
            .then(Step::Panic)
            .then(Step::Token("tok2", 1000));
        let cache = build(&issuer, &clock, None).unwrap();

        clock.set(UnixTime(950));
        let result = panic::catch_unwind(AssertUnwindSafe(|| cache.get_token()));
        assert!(result.is_err());
        assert_eq!(cache.cached_token().access_token().as_str(), "tok1");

        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
    }

    #[test]
    fn clones_share_the_cached_token() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 1000))
            .then(Step::Token("tok2", 1000));
        let cache = build(&issuer, &clock, None).unwrap();
        let other = cache.clone();

        clock.set(UnixTime(950));
        assert_eq!(other.get_token().unwrap().as_str(), "tok2");
        assert_eq!(cache.get_token().unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 2);
    }

    #[test]
    fn debug_output_hides_access_token() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default().then(Step::Token("very-secret-token", 1000));
        let cache = build(&issuer, &clock, None).unwrap();

        let debug = format!("{:?}", cache);
        assert!(debug.contains("***ACCESS TOKEN***"));
        assert!(!debug.contains("very-secret-token"));
    }

    #[tokio::test]
    async fn async_access_matches_sync_access() {
        let clock = TestClock::new(UnixTime(0));
        let issuer = ScriptedIssuer::default()
            .then(Step::Token("tok1", 1000))
            .then(Step::Fail)
            .then(Step::Token("tok2", 1000));
        let cache = build(&issuer, &clock, None).unwrap();

        clock.set(UnixTime(850));
        assert_eq!(cache.get_token_async().await.unwrap().as_str(), "tok1");
        assert_eq!(issuer.calls(), 1);

        clock.set(UnixTime(920));
        let err = cache.get_token_async().await.unwrap_err();
        assert!(matches!(err, TokenCacheError::Issuer(Unavailable)));
        assert_eq!(cache.get_token_async().await.unwrap().as_str(), "tok2");
        assert_eq!(issuer.calls(), 3);
    }
}
