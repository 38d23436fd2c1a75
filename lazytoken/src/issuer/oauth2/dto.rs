//! DTOs for interacting with OAuth2 token endpoints

use lazytoken_clock::DurationSecs;
use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, AudienceRef, ClientId, ClientSecret, IdToken, IssuedToken};

/// Client credentials
#[derive(Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// The body of a client credentials grant for a single audience
pub(super) struct ClientCredentialsRequest<'a> {
    pub credentials: &'a ClientCredentials,
    pub audience: &'a AudienceRef,
}

impl Serialize for ClientCredentialsRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ClientCredentialsRequest", 4)?;
        ser.serialize_field("grant_type", super::GRANT_TYPE)?;
        ser.serialize_field("client_id", &self.credentials.client_id)?;
        ser.serialize_field("client_secret", &self.credentials.client_secret)?;
        ser.serialize_field("audience", self.audience)?;
        ser.end()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub id_token: Option<IdToken>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: DurationSecs,
}

impl From<TokenResponse> for IssuedToken {
    fn from(resp: TokenResponse) -> Self {
        let mut token = IssuedToken::new(resp.access_token, resp.expires_in);
        if let Some(id_token) = resp.id_token {
            token = token.with_id_token(id_token);
        }
        if let Some(scope) = resp.scope {
            token = token.with_scope(scope);
        }
        if let Some(token_type) = resp.token_type {
            token = token.with_token_type(token_type);
        }
        token
    }
}
