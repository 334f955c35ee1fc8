//! Namespace codec: how upstream identifiers are made globally unique.
//!
//! Tool and prompt names become `server-local`, resource URIs become
//! `scheme://server/rest`, and progress tokens become `server-n-42` or
//! `server-s-token`. Decoding input we did not produce never fails; it
//! yields no server name and the value unchanged.
//!
//! Known limitation: server names cannot contain `-`, but local names may,
//! so `decode_name` splits on the first `-` only.

use toolmux_mcp::ProgressToken;

/// Longest global name handed to the downstream client.
pub const MAX_NAME_LEN: usize = 64;

/// Retries the uniqueness helper makes before giving up on an item.
pub const MAX_UNIQUE_ATTEMPTS: usize = 16;

const SEPARATOR: char = '-';
const SCHEME_SEPARATOR: &str = "://";

/// Result of decoding a namespaced value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<T> {
    /// Owning server, when the value carried one.
    pub server: Option<String>,
    /// The upstream-local value (or the input, when nothing was decoded).
    pub local: T,
}

impl<T> Decoded<T> {
    fn foreign(value: T) -> Self {
        Self {
            server: None,
            local: value,
        }
    }

    fn owned_by(server: &str, local: T) -> Self {
        Self {
            server: Some(server.to_string()),
            local,
        }
    }
}

/// Keep the last `max` characters of `value`.
fn truncate_front(value: String, max: usize) -> String {
    let len = value.chars().count();
    if len <= max {
        return value;
    }
    value.chars().skip(len - max).collect()
}

pub fn encode_name(server: &str, local: &str) -> String {
    truncate_front(format!("{server}{SEPARATOR}{local}"), MAX_NAME_LEN)
}

pub fn decode_name(value: &str) -> Decoded<String> {
    match value.split_once(SEPARATOR) {
        Some((server, local)) => Decoded::owned_by(server, local.to_string()),
        None => Decoded::foreign(value.to_string()),
    }
}

/// Pick a global name for `local` that `is_taken` rejects.
///
/// Tries `encode_name(server, local)` first, then `local1` .. `local16`
/// (front-truncated like every name). `None` means the item should be
/// skipped.
pub fn unique_name(server: &str, local: &str, is_taken: impl Fn(&str) -> bool) -> Option<String> {
    let candidate = encode_name(server, local);
    if !is_taken(&candidate) {
        return Some(candidate);
    }
    (1..=MAX_UNIQUE_ATTEMPTS)
        .map(|attempt| truncate_front(format!("{local}{attempt}"), MAX_NAME_LEN))
        .find(|candidate| !is_taken(candidate))
}

pub fn encode_uri(server: &str, uri: &str) -> String {
    match uri.split_once(SCHEME_SEPARATOR) {
        Some((scheme, rest)) => format!("{scheme}{SCHEME_SEPARATOR}{server}/{rest}"),
        None => encode_name(server, uri),
    }
}

pub fn decode_uri(value: &str) -> Decoded<String> {
    let Some((scheme, rest)) = value.split_once(SCHEME_SEPARATOR) else {
        return Decoded::foreign(value.to_string());
    };
    match rest.split_once('/') {
        Some((server, remainder)) if !server.is_empty() => {
            Decoded::owned_by(server, format!("{scheme}{SCHEME_SEPARATOR}{remainder}"))
        }
        _ => Decoded::foreign(value.to_string()),
    }
}

pub fn encode_progress_token(server: &str, token: &ProgressToken) -> ProgressToken {
    ProgressToken::String(match token {
        ProgressToken::Number(n) => format!("{server}{SEPARATOR}n{SEPARATOR}{n}"),
        ProgressToken::String(s) => format!("{server}{SEPARATOR}s{SEPARATOR}{s}"),
    })
}

pub fn decode_progress_token(token: &ProgressToken) -> Decoded<ProgressToken> {
    let ProgressToken::String(value) = token else {
        return Decoded::foreign(token.clone());
    };

    let mut parts = value.splitn(3, SEPARATOR);
    let (Some(server), Some(tag), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
        return Decoded::foreign(token.clone());
    };

    match tag {
        "n" => match rest.parse::<i64>() {
            Ok(n) => Decoded::owned_by(server, ProgressToken::Number(n)),
            Err(_) => Decoded::foreign(token.clone()),
        },
        "s" => Decoded::owned_by(server, ProgressToken::String(rest.to_string())),
        _ => Decoded::foreign(token.clone()),
    }
}
