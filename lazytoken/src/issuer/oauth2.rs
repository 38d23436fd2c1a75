//! A token issuer that uses an OAuth2 server as an authority

use std::{marker::PhantomData, sync::Arc};

use reqwest::blocking::{Client, RequestBuilder};
use thiserror::Error;

use super::TokenIssuer;
use crate::{AudienceRef, IssuedToken};

pub mod dto;

const GRANT_TYPE: &str = "client_credentials";

/// An issuer that performs the client credentials flow
///
/// Requests are made with a blocking HTTP client. Do not call
/// [`issue`][TokenIssuer::issue] directly from within an asynchronous
/// runtime; use [`TokenCache::get_token_async`][crate::TokenCache::get_token_async]
/// instead.
#[derive(Debug)]
pub struct ClientCredentialsIssuer<T = JsonBody> {
    client: Client,
    token_url: reqwest::Url,
    credentials: Arc<dto::ClientCredentials>,
    content_type: PhantomData<fn() -> T>,
}

impl ClientCredentialsIssuer<JsonBody> {
    /// Constructs a new client credentials issuer
    pub fn new(
        client: Client,
        token_url: reqwest::Url,
        credentials: impl Into<Arc<dto::ClientCredentials>>,
    ) -> Self {
        Self {
            client,
            token_url,
            credentials: credentials.into(),
            content_type: PhantomData,
        }
    }

    /// Constructs an issuer for the token endpoint of a tenant's domain,
    /// `https://{domain}/oauth/token`
    pub fn for_domain(
        client: Client,
        domain: &str,
        credentials: impl Into<Arc<dto::ClientCredentials>>,
    ) -> Result<Self, url::ParseError> {
        let token_url = reqwest::Url::parse(&format!(
            "https://{}/oauth/token",
            domain.trim_end_matches('/')
        ))?;
        Ok(Self::new(client, token_url, credentials))
    }

    /// Configures the issuer to send credentials to
    /// the authority as form data
    pub fn using_form_data(self) -> ClientCredentialsIssuer<FormBody> {
        ClientCredentialsIssuer {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            content_type: PhantomData,
        }
    }
}

impl<T: RequestType> TokenIssuer for ClientCredentialsIssuer<T> {
    type Error = TokenRequestError;

    fn issue(&mut self, audience: &AudienceRef) -> Result<IssuedToken, Self::Error> {
        request_token::<T>(
            &self.client,
            self.token_url.clone(),
            &self.credentials,
            audience,
        )
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
}

#[tracing::instrument(
    err,
    skip(client, token_url, credentials, audience),
    fields(
        token_url = %token_url,
        credentials.grant_type = GRANT_TYPE,
        credentials.client_id = %credentials.client_id,
        credentials.audience = %audience,
    ),
)]
fn request_token<T: RequestType>(
    client: &Client,
    token_url: reqwest::Url,
    credentials: &dto::ClientCredentials,
    audience: &AudienceRef,
) -> Result<IssuedToken, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let payload = dto::ClientCredentialsRequest {
        credentials,
        audience,
    };
    let req = T::attach_payload(client.post(token_url), &payload);
    let resp = req.send().map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp.text().map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp.bytes().map_err(TokenRequestError::BodyReadError)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    tracing::info!(
        has_id_token = resp.id_token.is_some(),
        lifetime = resp.expires_in.0,
        "received new token"
    );

    Ok(resp.into())
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(request: RequestBuilder, payload: &S)
        -> RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: RequestBuilder,
        payload: &S,
    ) -> RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: RequestBuilder,
        payload: &S,
    ) -> RequestBuilder {
        request.form(payload)
    }
}
