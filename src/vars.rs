//! Substitution of `<var:name>` placeholders inside instruction text.
//!
//! The variable map is captured earlier in request processing (the host's
//! `<setvar[name]:value>` mechanism) and treated here as an immutable
//! snapshot for one resolution pass. A missing variable is left in place and
//! logged, never escalated: a typo in a variable name should not break the
//! whole rewrite.

use lazy_static::lazy_static;
use log::warn;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;

lazy_static! {
    static ref VAR_MATCH_RE: Regex = Regex::new(r"<var:([^<>]+)>").unwrap();
}

/// Replaces every `<var:name>` in `text` with its value from `variables`.
///
/// Returns the input borrowed when it contains no variable syntax at all, so
/// the common case allocates nothing.
pub fn substitute_variables<'a>(text: &'a str, variables: &HashMap<String, String>) -> Cow<'a, str> {
    if !text.contains("<var:") {
        return Cow::Borrowed(text);
    }
    VAR_MATCH_RE.replace_all(text, |captures: &Captures| {
        let name = &captures[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                warn!("prompt variable {:?} is not set; leaving placeholder as-is", name);
                captures[0].to_string()
            }
        }
    })
}
