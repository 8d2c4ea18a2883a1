use http::{Method, StatusCode};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::Response;
use tracing::debug;
use url::Url;

use super::{CallSite, RegistryEndpoint};
use crate::auth::BearerChallenge;
use crate::errors::Result;

/// `GET /v2/`, telling whether the registry wants a bearer token
pub(crate) struct AuthProbe;

impl RegistryEndpoint for AuthProbe {
    type Output = Option<BearerChallenge>;

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, api_base: &Url) -> Result<Url> {
        Ok(api_base.clone())
    }

    fn description(&self) -> String {
        "probe authentication".to_string()
    }

    async fn handle_response(&self, _site: &CallSite, _response: Response) -> Result<Self::Output> {
        debug!("Registry does not require authentication");
        Ok(None)
    }

    async fn handle_error(&self, site: &CallSite, response: Response) -> Result<Self::Output> {
        if response.status() != StatusCode::UNAUTHORIZED {
            debug!(status = %response.status(), url = %site.url, "Probe did not receive a challenge");
            return Ok(None);
        }
        let challenge = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .find_map(|value| match BearerChallenge::try_from(value) {
                Ok(challenge) => Some(challenge),
                Err(error) => {
                    debug!(%error, "Ignoring authentication challenge");
                    None
                }
            });
        if challenge.is_none() {
            debug!("No bearer challenge, falling back to static credentials");
        }
        Ok(challenge)
    }
}
