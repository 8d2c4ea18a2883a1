//! Deciding whether a cross-repository blob mount is worth attempting
use tracing::debug;

use crate::secrets::Authorization;
use crate::token::{decode_repository_grants, RepositoryGrants};

/// Returns whether a mount of a blob from `source_repository` may succeed.
///
/// Only a bearer token that can be read and does not grant `pull` on the
/// source repository rules a mount out. In every other case the mount is
/// attempted and the registry decides; a refused mount costs one request and
/// the push falls back to a regular upload.
pub fn can_attempt_blob_mount(
    authorization: Option<&Authorization>,
    source_repository: &str,
) -> bool {
    let Some(authorization) = authorization else {
        return true;
    };
    if !authorization.is_bearer() {
        return true;
    }
    match decode_repository_grants(authorization.token()) {
        RepositoryGrants::Indeterminate => true,
        grants => {
            let allowed = grants.allows(source_repository, "pull") == Some(true);
            if !allowed {
                debug!(
                    source_repository,
                    "Token does not grant pull on the mount source"
                );
            }
            allowed
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::token::test::token_with_payload;
    use rstest::rstest;

    fn pull_token(repository: &str) -> Authorization {
        Authorization::bearer(token_with_payload(&format!(
            r#"{{"access":[{{"type":"repository","name":"{repository}","actions":["pull"]}}]}}"#
        )))
    }

    #[test]
    fn attempts_without_authorization() {
        assert!(can_attempt_blob_mount(None, "x"));
    }

    #[test]
    fn attempts_with_basic_authorization() {
        let auth = Authorization::basic("user", "pass");
        assert!(can_attempt_blob_mount(Some(&auth), "x"));
    }

    #[rstest]
    #[case::opaque("some-opaque-token")]
    #[case::four_segments("a.b.c.d")]
    #[case::not_json("e30.bm90IGpzb24.c2ln")]
    fn attempts_with_unreadable_bearer_token(#[case] token: &str) {
        let auth = Authorization::bearer(token);
        assert!(can_attempt_blob_mount(Some(&auth), "x"));
    }

    #[rstest]
    #[case::granted("lib/x", true)]
    #[case::other_repository("lib/y", false)]
    fn follows_readable_bearer_token(#[case] source: &str, #[case] expected: bool) {
        let auth = pull_token("lib/x");
        assert_eq!(can_attempt_blob_mount(Some(&auth), source), expected);
    }

    #[test]
    fn push_only_grant_is_not_enough() {
        let auth = Authorization::new(
            "BEARER",
            token_with_payload(
                r#"{"access":[{"type":"repository","name":"lib/x","actions":["push"]}]}"#,
            ),
        );
        assert!(!can_attempt_blob_mount(Some(&auth), "lib/x"));
    }

    #[test]
    fn empty_grants_rule_out_the_mount() {
        let auth = Authorization::bearer(token_with_payload(r#"{"access":[]}"#));
        assert!(!can_attempt_blob_mount(Some(&auth), "lib/x"));
    }
}
