use regex::{Regex, RegexBuilder};

/// DOMAIN_REGEXP matches a registry host with an optional port. IPv6 hosts
/// must be bracketed.
pub const DOMAIN_REGEXP: &str = r"(?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*|\[[0-9a-fA-F:.]+\])(?::[0-9]+)?";

/// NAME_REGEXP matches a repository path, made of lowercase components
/// separated by slashes.
pub const NAME_REGEXP: &str =
    r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*";

/// TAG_REGEXP matches a tag.
pub const TAG_REGEXP: &str = r"[\w][\w.-]{0,127}";

lazy_static! {
    pub static ref ANCHORED_DOMAIN: Regex = must_compile(&anchored(DOMAIN_REGEXP));
    pub static ref ANCHORED_NAME: Regex = must_compile(&anchored(NAME_REGEXP));
    pub static ref ANCHORED_TAG: Regex = must_compile(&anchored(TAG_REGEXP));
}

fn anchored(r: &str) -> String {
    format!("^(?:{r})$")
}

pub fn must_compile(r: &str) -> Regex {
    RegexBuilder::new(r)
        .size_limit(10 * (1 << 21))
        .build()
        .unwrap()
}
