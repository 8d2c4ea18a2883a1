//! Bearer token challenge/response authentication
use http::header::HeaderValue;
use http::Method;
use http_auth::{parser::ChallengeParser, ChallengeRef};
use reqwest::header::USER_AGENT;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::EndpointConfig;
use crate::errors::{RegistryError, Result};
use crate::secrets::{Authenticable, Authorization, RegistryAuth};
use crate::token::RegistryToken;

/// Client id reported when trading an identity token for a bearer token
const OAUTH_CLIENT_ID: &str = "jib";

/// A `WWW-Authenticate: Bearer ...` challenge sent by a registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Where tokens are requested
    pub realm: String,
    /// The service the token is issued for
    pub service: Option<String>,
    /// The scope the registry asked for, if any
    pub scope: Option<String>,
}

impl TryFrom<&HeaderValue> for BearerChallenge {
    type Error = String;

    fn try_from(value: &HeaderValue) -> std::result::Result<Self, Self::Error> {
        let parser = ChallengeParser::new(
            value
                .to_str()
                .map_err(|e| format!("cannot convert header value to string: {:?}", e))?,
        );
        parser
            .filter_map(|parser_res| {
                let challenge_ref = parser_res.ok()?;
                BearerChallenge::try_from(&challenge_ref).ok()
            })
            .next()
            .ok_or_else(|| "Cannot find Bearer challenge".to_string())
    }
}

impl TryFrom<&ChallengeRef<'_>> for BearerChallenge {
    type Error = String;

    fn try_from(value: &ChallengeRef<'_>) -> std::result::Result<Self, Self::Error> {
        if !value.scheme.eq_ignore_ascii_case("Bearer") {
            return Err(format!(
                "BearerChallenge doesn't support challenge scheme {:?}",
                value.scheme
            ));
        }
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (k, v) in &value.params {
            if k.eq_ignore_ascii_case("realm") {
                realm = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("service") {
                service = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("scope") {
                scope = Some(v.to_unescaped());
            }
        }

        let realm = realm.ok_or("missing required parameter realm")?;

        Ok(BearerChallenge {
            realm,
            service,
            scope,
        })
    }
}

#[derive(Serialize)]
struct RefreshTokenForm<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    service: &'a str,
    scope: String,
    client_id: &'static str,
}

/// Obtains bearer tokens from the realm a registry delegated authentication to.
///
/// Built by [`RegistryClient::registry_authenticator`] when the registry
/// answers its probe with a bearer challenge.
///
/// [`RegistryClient::registry_authenticator`]: crate::client::RegistryClient::registry_authenticator
#[derive(Clone, Debug)]
pub struct RegistryAuthenticator {
    realm: String,
    service: String,
    image_name: String,
    source_image_name: Option<String>,
    http: reqwest::Client,
    user_agent: String,
}

impl RegistryAuthenticator {
    pub(crate) fn new(
        challenge: BearerChallenge,
        endpoint: &EndpointConfig,
        http: reqwest::Client,
        user_agent: String,
    ) -> Self {
        RegistryAuthenticator {
            realm: challenge.realm,
            service: challenge
                .service
                .unwrap_or_else(|| endpoint.server().to_string()),
            image_name: endpoint.image_name().to_string(),
            source_image_name: endpoint.source_image_name().map(str::to_string),
            http,
            user_agent,
        }
    }

    /// The token endpoint
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// The service tokens are requested for
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Requests a token for a single scope, e.g. `repository:library/openjdk:pull`
    pub async fn authenticate(
        &self,
        scope: &str,
        credentials: &RegistryAuth,
    ) -> Result<Authorization> {
        self.request_token(&[scope.to_string()], credentials).await
    }

    /// Requests a token allowed to pull the image
    pub async fn authenticate_pull(&self, credentials: &RegistryAuth) -> Result<Authorization> {
        let scopes = [format!("repository:{}:pull", self.image_name)];
        self.request_token(&scopes, credentials).await
    }

    /// Requests a token allowed to push the image, and to pull from the mount
    /// source repository when there is one
    pub async fn authenticate_push(&self, credentials: &RegistryAuth) -> Result<Authorization> {
        let mut scopes = vec![format!("repository:{}:pull,push", self.image_name)];
        match &self.source_image_name {
            Some(source) if source != &self.image_name => {
                scopes.push(format!("repository:{source}:pull"));
            }
            _ => {}
        }
        self.request_token(&scopes, credentials).await
    }

    async fn request_token(
        &self,
        scopes: &[String],
        credentials: &RegistryAuth,
    ) -> Result<Authorization> {
        let identity_token = credentials.identity_token();
        let method = if identity_token.is_some() {
            Method::POST
        } else {
            Method::GET
        };
        let failure = |reason: String| RegistryError::Authentication {
            method: method.clone(),
            url: self.realm.clone(),
            reason,
        };
        let realm = Url::parse(&self.realm)
            .map_err(|e| failure(format!("invalid realm: {e}")))?;

        debug!(realm = %self.realm, service = %self.service, ?scopes, "Making authentication call");

        let request = match identity_token {
            Some(refresh_token) => self.http.post(realm).form(&RefreshTokenForm {
                grant_type: "refresh_token",
                refresh_token,
                service: &self.service,
                scope: scopes.join(" "),
                client_id: OAUTH_CLIENT_ID,
            }),
            None => {
                let mut query = vec![("service", self.service.as_str())];
                query.extend(scopes.iter().map(|scope| ("scope", scope.as_str())));
                self.http
                    .get(realm)
                    .query(&query)
                    .apply_authentication(credentials)
            }
        };

        let request = match self.user_agent.as_str() {
            "" => request,
            user_agent => request.header(USER_AGENT, user_agent),
        };
        let response = request
            .send()
            .await
            .map_err(|e| failure(format!("cannot reach the authentication realm: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| failure(format!("cannot read the token response: {e}")))?;
        if status != reqwest::StatusCode::OK {
            debug!(%status, "Failed to authenticate: {}", text);
            return Err(failure(format!("HTTP {status}: {text}")));
        }

        let token: RegistryToken = serde_json::from_str(&text)
            .map_err(|e| failure(format!("cannot decode the token response: {e}")))?;
        debug!(?token, ?scopes, "Successfully authenticated");
        Ok(Authorization::bearer(token.into_token()))
    }
}
