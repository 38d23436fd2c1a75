//! A self-refreshing cache for access tokens
//!
//! Clients that attach a bearer token to every outbound request should not each
//! negotiate with the token authority. A [`TokenCache`] holds the most recent
//! token issued for an audience, hands it out on demand, and obtains a new one
//! when the current token gets close to expiring.
//!
//! Renewal is pull-based. There is no timer and no background task: the access
//! that finds the cached token stale performs the refresh. Under concurrent
//! access at most one refresh is in flight at a time, and every caller waiting
//! on it receives its result.
//!
//! # Refresh window
//!
//! A token is served as long as it has at least the _minimum expiration delay_
//! left to live. The delay may be configured explicitly; otherwise it is
//! derived from the first token as one tenth of that token's lifetime and
//! stays fixed for the life of the cache. A token issued with a lifetime
//! shorter than the delay is rejected, since it would be stale on arrival.
//!
//! # General Flow (Client Credentials)
//!
//! ```
//! use lazytoken::{issuer::oauth2, Audience, ClientId, ClientSecret, TokenCache};
//! use lazytoken_clock::DurationSecs;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = oauth2::dto::ClientCredentials {
//!     client_id: ClientId::from_static("my-client"),
//!     client_secret: ClientSecret::from_static("my-secret"),
//! };
//!
//! let issuer = oauth2::ClientCredentialsIssuer::for_domain(
//!     reqwest::blocking::Client::new(),
//!     "tenant.example.com",
//!     credentials,
//! )?;
//!
//! let builder = TokenCache::builder(issuer, Audience::management_api("tenant.example.com"))
//!     .with_min_expiration_delay(DurationSecs(60));
//! # /* Commented out due to this trying to interact with the world.
//! let cache = builder.build()?;
//!
//! let token = cache.get_token()?;
//! tracing::info!(token = format_args!("{:#?}", token), "access token");
//! # */
//! # drop(builder);
//! # Ok(())
//! # }
//! ```
//!
//! From asynchronous code, use [`TokenCache::get_token_async`], which runs the
//! same logic on the runtime's blocking pool.
//!
//! # Features
//!
//! * `oauth2` (default): Provides an issuer for the OAuth2 _client credentials_
//!   flow using a blocking [reqwest] client.
//! * `rustls-tls` / `default-tls`: Selects the TLS backend used by that client.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod cache;
pub mod issuer;
mod tokens;

pub use braids::*;
pub use cache::{TokenCache, TokenCacheBuilder, TokenCacheError};
pub use tokens::{CachedToken, IssuedToken, MinExpirationDelay, TokenStatus};
