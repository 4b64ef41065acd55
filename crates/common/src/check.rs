//! Check command parsing and validation.
//!
//! Checks travel and persist as token lists, e.g.
//! `["http", "get", "http://x.example/"]`. Parsing them into [`Check`]
//! happens once at every boundary: the server validates a check when a
//! job is created, the node when a job list arrives. Running a check is
//! the node's business and lives with the node.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed check command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Check {
    /// Host lookup.
    Dns { host: String },
    /// HTTP GET; fails unless the response status is 200.
    HttpGet { url: String },
    /// HTTP HEAD; same semantics as GET.
    HttpHead { url: String },
    /// HTTP POST with a text body.
    HttpPost { url: String, body: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CheckParseError {
    #[error("unknown check")]
    UnknownCheck,
    #[error("wrong number of parameters")]
    WrongParams,
}

/// Parses a token list into a [`Check`].
pub fn parse(tokens: &[String]) -> Result<Check, CheckParseError> {
    if tokens.len() < 2 {
        return Err(CheckParseError::WrongParams);
    }
    match tokens[0].as_str() {
        "dns" => match &tokens[1..] {
            [host] => Ok(Check::Dns { host: host.clone() }),
            _ => Err(CheckParseError::WrongParams),
        },
        "http" => match tokens[1].as_str() {
            "get" => match &tokens[2..] {
                [url] => Ok(Check::HttpGet { url: url.clone() }),
                _ => Err(CheckParseError::WrongParams),
            },
            "head" => match &tokens[2..] {
                [url] => Ok(Check::HttpHead { url: url.clone() }),
                _ => Err(CheckParseError::WrongParams),
            },
            "post" => match &tokens[2..] {
                [url, body] => Ok(Check::HttpPost {
                    url: url.clone(),
                    body: body.clone(),
                }),
                _ => Err(CheckParseError::WrongParams),
            },
            _ => Err(CheckParseError::UnknownCheck),
        },
        _ => Err(CheckParseError::UnknownCheck),
    }
}

/// True if the token list is a well-formed check. Performs no I/O.
pub fn validate(tokens: &[String]) -> bool {
    parse(tokens).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &[&str]) -> Vec<String> {
        s.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn parses_known_families() {
        assert_eq!(
            parse(&toks(&["dns", "x.example"])),
            Ok(Check::Dns { host: "x.example".into() })
        );
        assert_eq!(
            parse(&toks(&["http", "get", "http://x/"])),
            Ok(Check::HttpGet { url: "http://x/".into() })
        );
        assert_eq!(
            parse(&toks(&["http", "head", "http://x/"])),
            Ok(Check::HttpHead { url: "http://x/".into() })
        );
        assert_eq!(
            parse(&toks(&["http", "post", "http://x/", "body"])),
            Ok(Check::HttpPost { url: "http://x/".into(), body: "body".into() })
        );
    }

    #[test]
    fn arity_errors() {
        for bad in [
            vec!["dns"],
            vec!["dns", "a", "b"],
            vec!["http", "get"],
            vec!["http", "get", "u", "v"],
            vec!["http", "post", "u"],
            vec![],
            vec!["http"],
        ] {
            assert_eq!(
                parse(&toks(&bad)),
                Err(CheckParseError::WrongParams),
                "tokens {bad:?}"
            );
        }
    }

    #[test]
    fn unknown_families() {
        assert_eq!(parse(&toks(&["icmp", "x"])), Err(CheckParseError::UnknownCheck));
        assert_eq!(
            parse(&toks(&["http", "delete", "u"])),
            Err(CheckParseError::UnknownCheck)
        );
    }

    #[test]
    fn validate_is_pure_parse() {
        assert!(validate(&toks(&["dns", "x.example"])));
        assert!(!validate(&toks(&["dns"])));
        assert!(!validate(&toks(&["nope", "x"])));
    }
}
