//! Token issuers

use crate::{AudienceRef, IssuedToken};
use std::error;

#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod oauth2;

/// A source of freshly minted tokens
///
/// Each call is an independent request for a new token. Calls are made
/// synchronously and may block for the duration of a network round-trip.
/// A [`TokenCache`][crate::TokenCache] never calls its issuer concurrently.
pub trait TokenIssuer: Send {
    /// The error type returned in the event that issuing a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a new token for `audience`
    fn issue(&mut self, audience: &AudienceRef) -> Result<IssuedToken, Self::Error>;
}

impl<I: TokenIssuer + ?Sized> TokenIssuer for Box<I> {
    type Error = I::Error;

    #[inline]
    fn issue(&mut self, audience: &AudienceRef) -> Result<IssuedToken, Self::Error> {
        (**self).issue(audience)
    }
}
