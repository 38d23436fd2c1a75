use lazytoken_clock::{Clock, DurationSecs, System, UnixTime};
use serde::Serialize;

use super::{AccessToken, AccessTokenRef, IdToken, IdTokenRef};

/// A token as returned by the issuing authority
#[derive(Clone, Debug)]
pub struct IssuedToken {
    access_token: AccessToken,
    lifetime: DurationSecs,
    id_token: Option<IdToken>,
    scope: Option<String>,
    token_type: Option<String>,
}

impl IssuedToken {
    /// Constructs an issued token that will be valid for `lifetime` from the
    /// moment it is received
    pub fn new(access_token: impl Into<AccessToken>, lifetime: DurationSecs) -> Self {
        Self {
            access_token: access_token.into(),
            lifetime,
            id_token: None,
            scope: None,
            token_type: None,
        }
    }

    /// Attaches an ID token
    pub fn with_id_token(mut self, id_token: impl Into<IdToken>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    /// Attaches the scope granted by the authority
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Attaches the token type reported by the authority, usually `Bearer`
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    /// The lifetime reported by the authority
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }
}

/// A token held by the cache along with its lifetime information
///
/// Records are never modified once created; a refresh replaces the record
/// wholesale.
#[derive(Debug, Serialize)]
pub struct CachedToken {
    access_token: AccessToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<IdToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    lifetime: DurationSecs,
    issued: UnixTime,
    stale: UnixTime,
    expiry: UnixTime,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is fresh and will be served as-is
    Fresh,
    /// The token is valid, but the next access will refresh it
    Stale,
    /// The token is no longer valid
    Expired,
}

impl CachedToken {
    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the ID token, if one was issued
    #[inline]
    pub fn id_token(&self) -> Option<&IdTokenRef> {
        self.id_token.as_deref()
    }

    /// Gets the scope granted by the authority, if reported
    #[inline]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Gets the token type reported by the authority
    #[inline]
    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    /// Gets the token's lifetime as reported by the authority
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the token was received
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the last moment at which the token is still fresh
    #[inline]
    pub fn stale(&self) -> UnixTime {
        self.stale
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the interval during which the token will be served without refresh
    #[inline]
    pub fn fresh_interval(&self) -> std::ops::RangeInclusive<UnixTime> {
        self.issued..=self.stale
    }

    /// Gets the interval during which the token is valid
    #[inline]
    pub fn valid_interval(&self) -> std::ops::Range<UnixTime> {
        self.issued..self.expiry
    }

    /// Gets the token's current lifetime status
    #[inline]
    pub fn token_status(&self) -> TokenStatus {
        self.token_status_with_clock(&System)
    }

    /// Gets the token's lifetime status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, clock: &C) -> TokenStatus {
        self.token_status_at(clock.now())
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time >= self.expiry {
            TokenStatus::Expired
        } else if time <= self.stale {
            TokenStatus::Fresh
        } else {
            TokenStatus::Stale
        }
    }

    /// Gets a duration for how much longer the token will be fresh based on the
    /// current time as reported by the provided clock
    #[inline]
    pub fn until_stale_with_clock<C: Clock>(&self, clock: &C) -> DurationSecs {
        self.until_stale_at(clock.now())
    }

    /// Gets a duration for how much longer the token would be fresh as of the
    /// provided time
    #[inline]
    pub fn until_stale_at(&self, time: UnixTime) -> DurationSecs {
        self.stale - time
    }

    /// Gets a duration for how much longer the token will be valid based on the
    /// current time as reported by the provided clock
    #[inline]
    pub fn until_expired_with_clock<C: Clock>(&self, clock: &C) -> DurationSecs {
        self.until_expired_at(clock.now())
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry - time
    }
}

/// How long before expiry a token must be refreshed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MinExpirationDelay {
    /// A fixed number of seconds
    ///
    /// Every issued token must have a lifetime of at least this long. A delay
    /// of zero refreshes a token only once it has expired.
    Fixed(DurationSecs),
    /// One tenth of the lifetime of the first token obtained, rounded down
    ///
    /// The delay is fixed once derived, even if later tokens have a
    /// different lifetime.
    #[default]
    FractionOfFirstLifetime,
}

impl MinExpirationDelay {
    const LIFETIME_DIVISOR: u64 = 10;

    fn resolve(self, first_lifetime: DurationSecs) -> DurationSecs {
        match self {
            Self::Fixed(delay) => delay,
            Self::FractionOfFirstLifetime => first_lifetime / Self::LIFETIME_DIVISOR,
        }
    }
}

impl From<DurationSecs> for MinExpirationDelay {
    fn from(delay: DurationSecs) -> Self {
        Self::Fixed(delay)
    }
}

/// A token's lifetime was too short to be used under the configured delay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LifetimeTooShort {
    pub(crate) lifetime: DurationSecs,
    pub(crate) min_expiration_delay: DurationSecs,
}

/// The resolved refresh window along with the clock used to judge it
#[derive(Clone, Debug)]
pub(crate) struct RefreshPolicy<C> {
    min_expiration_delay: DurationSecs,
    clock: C,
}

impl<C> RefreshPolicy<C> {
    #[inline]
    pub(crate) fn min_expiration_delay(&self) -> DurationSecs {
        self.min_expiration_delay
    }

    #[inline]
    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> RefreshPolicy<C> {
    /// Resolves the configured delay against the first issued token
    ///
    /// The first token is held to an explicitly configured delay just like
    /// every later one.
    pub(crate) fn for_first_token(
        delay: MinExpirationDelay,
        first: IssuedToken,
        clock: C,
    ) -> Result<(Self, CachedToken), LifetimeTooShort> {
        let policy = Self {
            min_expiration_delay: delay.resolve(first.lifetime),
            clock,
        };
        let token = policy.accept(first)?;
        Ok((policy, token))
    }

    /// Whether the token has less than the minimum delay left before expiry
    pub(crate) fn needs_refresh(&self, token: &CachedToken) -> bool {
        token.token_status_with_clock(&self.clock) != TokenStatus::Fresh
    }

    /// Stamps an issued token with its lifetime information
    pub(crate) fn accept(&self, issued: IssuedToken) -> Result<CachedToken, LifetimeTooShort> {
        if issued.lifetime < self.min_expiration_delay {
            return Err(LifetimeTooShort {
                lifetime: issued.lifetime,
                min_expiration_delay: self.min_expiration_delay,
            });
        }

        let now = self.clock.now();
        let expiry = now + issued.lifetime;
        Ok(CachedToken {
            access_token: issued.access_token,
            id_token: issued.id_token,
            scope: issued.scope,
            token_type: issued.token_type,
            lifetime: issued.lifetime,
            issued: now,
            stale: expiry - self.min_expiration_delay,
            expiry,
        })
    }
}
