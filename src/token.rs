//! Registry bearer tokens and the access claims they carry
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use serde::Deserialize;
use tracing::{debug, trace};

/// A token granted during the OAuth2-like workflow for registries.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RegistryToken {
    Token { token: String },
    AccessToken { access_token: String },
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = String::from("<redacted>");
        match self {
            RegistryToken::Token { .. } => {
                f.debug_struct("Token").field("token", &redacted).finish()
            }
            RegistryToken::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("access_token", &redacted)
                .finish(),
        }
    }
}

impl RegistryToken {
    pub fn into_token(self) -> String {
        match self {
            RegistryToken::Token { token } => token,
            RegistryToken::AccessToken { access_token } => access_token,
        }
    }
}

/// The repositories a bearer token appears to grant access to.
///
/// `Indeterminate` means the token could not be read; it is never the same
/// as a readable token granting nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryGrants {
    /// The token is not a readable registry token
    Indeterminate,
    /// Repository name to the actions granted on it
    Granted(BTreeMap<String, BTreeSet<String>>),
}

impl RepositoryGrants {
    /// Whether `action` is granted on `repository`, or `None` when indeterminate
    pub fn allows(&self, repository: &str, action: &str) -> Option<bool> {
        match self {
            RepositoryGrants::Indeterminate => None,
            RepositoryGrants::Granted(grants) => Some(
                grants
                    .get(repository)
                    .is_some_and(|actions| actions.contains(action)),
            ),
        }
    }

    /// Whether the token could not be read
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, RepositoryGrants::Indeterminate)
    }
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    access: Option<Vec<AccessClaim>>,
}

#[derive(Debug, Deserialize)]
struct AccessClaim {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    actions: Option<Vec<String>>,
}

/// Reads the repository access claims of a registry bearer token.
///
/// A registry token is a JWT: three base64 segments (header, payload,
/// signature) joined by dots, with a payload like
/// `{"access":[{"type":"repository","name":"library/openjdk","actions":["pull"]}]}`.
///
/// The signature is NOT verified. The result is only a hint for skipping
/// requests that would fail anyway and must never be used to grant or deny
/// access.
pub fn decode_repository_grants(token: &str) -> RepositoryGrants {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        trace!(segments = segments.len(), "Token is not a JWT");
        return RepositoryGrants::Indeterminate;
    }

    let Some(payload) = decode_segment(segments[1]) else {
        debug!("Token payload is not base64");
        return RepositoryGrants::Indeterminate;
    };

    let value: serde_json::Value = match serde_json::from_slice(&payload) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => {
            debug!("Token payload is not a JSON object");
            return RepositoryGrants::Indeterminate;
        }
    };
    let claims = match serde_json::from_value::<TokenPayload>(value) {
        Ok(TokenPayload {
            access: Some(claims),
        }) => claims,
        Ok(_) => return RepositoryGrants::Indeterminate,
        Err(error) => {
            debug!(?error, "Token payload has malformed access claims");
            return RepositoryGrants::Indeterminate;
        }
    };

    let mut grants: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for claim in claims {
        if claim.kind.as_deref() != Some("repository") {
            continue;
        }
        let Some(name) = claim.name else {
            continue;
        };
        grants
            .entry(name)
            .or_default()
            .extend(claim.actions.unwrap_or_default());
    }
    RepositoryGrants::Granted(grants)
}

/// JWTs use unpadded url-safe base64, but some issuers pad or use the standard alphabet
fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let trimmed = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    /// Builds an unsigned token around the given payload text
    pub(crate) fn token_with_payload(payload: &str) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode("signature")
        )
    }

    fn granted(entries: &[(&str, &[&str])]) -> RepositoryGrants {
        RepositoryGrants::Granted(
            entries
                .iter()
                .map(|(name, actions)| {
                    (
                        name.to_string(),
                        actions.iter().map(|a| a.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_registry_token_deserialize() {
        // 'token' field, standalone
        let rt: RegistryToken = serde_json::from_str(r#"{"token": "abc"}"#).unwrap();
        assert_eq!(rt.into_token(), "abc");

        // 'access_token' field, standalone
        let rt: RegistryToken = serde_json::from_str(r#"{"access_token": "xyz"}"#).unwrap();
        assert_eq!(rt.into_token(), "xyz");

        // both fields, 'token' field takes precedence
        let rt: RegistryToken =
            serde_json::from_str(r#"{"access_token": "xyz", "token": "abc"}"#).unwrap();
        assert_eq!(rt.into_token(), "abc");

        // numeric 'token' field, but string 'access_token' field does not result in parse error
        let rt: RegistryToken =
            serde_json::from_str(r#"{"access_token": "xyz", "token": 300}"#).unwrap();
        assert_eq!(rt.into_token(), "xyz");

        // missing fields results in parse error
        assert!(serde_json::from_str::<RegistryToken>(r#"{"some": "thing"}"#).is_err());

        // bad JSON results in parse error
        assert!(serde_json::from_str::<RegistryToken>(r#"{"token": "abc""#).is_err());
    }

    #[test]
    fn wrong_segment_count_is_indeterminate() {
        for token in ["", "abc", "a.b", "a.b.c.d", "...."] {
            assert_eq!(
                decode_repository_grants(token),
                RepositoryGrants::Indeterminate,
                "token {:?}",
                token
            );
        }
    }

    #[test]
    fn undecodable_payload_is_indeterminate() {
        assert!(decode_repository_grants("a.!!!not-base64!!!.c").is_indeterminate());
        // base64 but not JSON
        let token = format!("a.{}.c", URL_SAFE_NO_PAD.encode("not json"));
        assert!(decode_repository_grants(&token).is_indeterminate());
        // JSON but not an object
        let token = token_with_payload(r#"[{"access": []}]"#);
        assert!(decode_repository_grants(&token).is_indeterminate());
        // object without access claims
        let token = token_with_payload(r#"{"iss": "auth.docker.io"}"#);
        assert!(decode_repository_grants(&token).is_indeterminate());
    }

    #[test]
    fn decodes_repository_claims() {
        let token = token_with_payload(
            r#"{"access":[{"type":"repository","name":"library/openjdk","actions":["pull","push"]}]}"#,
        );
        assert_eq!(
            decode_repository_grants(&token),
            granted(&[("library/openjdk", &["pull", "push"])])
        );
    }

    #[test]
    fn empty_access_list_is_determinate_and_empty() {
        let grants = decode_repository_grants(&token_with_payload(r#"{"access":[]}"#));
        assert_eq!(grants, RepositoryGrants::Granted(BTreeMap::new()));
        assert_ne!(grants, RepositoryGrants::Indeterminate);
        assert_eq!(grants.allows("library/openjdk", "pull"), Some(false));
    }

    #[test]
    fn claims_are_filtered_and_unioned() {
        let token = token_with_payload(
            r#"{"access":[
                {"type":"repository","name":"a","actions":["pull"]},
                {"type":"registry","name":"catalog","actions":["*"]},
                {"type":"repository","name":"a","actions":["push"]},
                {"type":"repository","name":"b"}
            ]}"#,
        );
        let grants = decode_repository_grants(&token);
        assert_eq!(grants, granted(&[("a", &["pull", "push"]), ("b", &[])]));
        assert_eq!(grants.allows("b", "pull"), Some(false));
        assert_eq!(grants.allows("catalog", "*"), Some(false));
    }

    #[test]
    fn accepts_padded_standard_base64_payloads() {
        let payload = r#"{"access":[{"type":"repository","name":"x","actions":["pull"]}]}"#;
        let token = format!("header.{}.signature", STANDARD.encode(payload));
        assert_eq!(decode_repository_grants(&token).allows("x", "pull"), Some(true));
    }

    #[test]
    fn header_segment_is_never_parsed() {
        let payload = r#"{"access":[{"type":"repository","name":"x","actions":["push"]}]}"#;
        let token = format!("%%not a header%%.{}.", URL_SAFE_NO_PAD.encode(payload));
        assert_eq!(decode_repository_grants(&token).allows("x", "push"), Some(true));
    }

    #[test]
    fn decodes_tokens_signed_with_hmac() {
        use hmac::{Hmac, Mac};
        use jwt::SignWithKey;
        use sha2::Sha256;

        #[derive(serde::Serialize)]
        struct Claims {
            access: Vec<serde_json::Value>,
        }

        let key: Hmac<Sha256> = Hmac::new_from_slice(b"some-secret").unwrap();
        let claims = Claims {
            access: vec![serde_json::json!({
                "type": "repository",
                "name": "library/openjdk",
                "actions": ["pull"]
            })],
        };
        let token = claims.sign_with_key(&key).unwrap();
        assert_eq!(
            decode_repository_grants(&token),
            granted(&[("library/openjdk", &["pull"])])
        );
    }
}
