//! Quoted string-array codec.
//!
//! Check output is stored in the `result` database column as a bracketed
//! list of quoted strings, one space between elements:
//!
//! ```text
//! ["HTTP/1.1 200 OK" "GET / HTTP/1.1\r\n..." ""]
//! ```
//!
//! Strings are quoted with the conventional backslash escapes
//! (`\a \b \f \n \r \t \v \\ \"`), `\xHH` for other control bytes and
//! `\uHHHH` / `\UHHHHHHHH` for non-ASCII characters, so the column stays
//! printable. `parse(&print(s)) == s` for any list of strings.

use std::fmt::Write as _;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrArrayError {
    #[error("syntax error")]
    Syntax,
    #[error("invalid escape sequence")]
    BadEscape,
    #[error("invalid UTF-8 in quoted string")]
    BadUtf8,
}

/// Renders `a` as a bracketed list of quoted strings.
pub fn print(a: &[String]) -> String {
    let mut out = String::with_capacity(a.iter().map(|s| s.len() + 4).sum::<usize>() + 2);
    out.push('[');
    for (i, s) in a.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        quote_into(s, &mut out);
    }
    out.push(']');
    out
}

/// Parses the output of [`print`] back into the original list.
pub fn parse(s: &str) -> Result<Vec<String>, StrArrayError> {
    let inner = s
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or(StrArrayError::Syntax)?;
    let mut rest = inner;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (tok, after) = take_quoted(rest)?;
        out.push(unquote(tok)?);
        rest = after;
        if !rest.is_empty() {
            // exactly one space between elements
            rest = rest.strip_prefix(' ').ok_or(StrArrayError::Syntax)?;
            if rest.is_empty() {
                return Err(StrArrayError::Syntax);
            }
        }
    }
    Ok(out)
}

/// Splits one `"..."` token off the front of `s`, returning it with the
/// quotes still attached.
fn take_quoted(s: &str) -> Result<(&str, &str), StrArrayError> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'"') {
        return Err(StrArrayError::Syntax);
    }
    let mut escape = false;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        if escape {
            escape = false;
        } else if b == b'\\' {
            escape = true;
        } else if b == b'"' {
            return Ok((&s[..i + 1], &s[i + 1..]));
        }
    }
    Err(StrArrayError::Syntax)
}

fn quote_into(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if c.is_ascii() => out.push(c),
            c if (c as u32) <= 0xffff => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => {
                let _ = write!(out, "\\U{:08x}", c as u32);
            }
        }
    }
    out.push('"');
}

/// Unquotes a single `"..."` token, decoding the escape set above plus
/// three-digit octal escapes. `\xHH` and `\ooo` denote raw bytes; the
/// decoded byte sequence must still be valid UTF-8.
pub fn unquote(s: &str) -> Result<String, StrArrayError> {
    let inner = s
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or(StrArrayError::Syntax)?;
    let mut out: Vec<u8> = Vec::with_capacity(inner.len());
    let mut it = inner.chars();
    while let Some(c) = it.next() {
        if c == '"' {
            // an unescaped quote can only be the terminator
            return Err(StrArrayError::Syntax);
        }
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let e = it.next().ok_or(StrArrayError::BadEscape)?;
        match e {
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            '\\' => out.push(b'\\'),
            '"' => out.push(b'"'),
            'x' => out.push(take_radix(&mut it, 2, 16)? as u8),
            '0'..='7' => {
                let mut v = e.to_digit(8).ok_or(StrArrayError::BadEscape)?;
                for _ in 0..2 {
                    let d = it.next().and_then(|c| c.to_digit(8));
                    v = v * 8 + d.ok_or(StrArrayError::BadEscape)?;
                }
                if v > 0xff {
                    return Err(StrArrayError::BadEscape);
                }
                out.push(v as u8);
            }
            'u' => push_scalar(&mut out, take_radix(&mut it, 4, 16)?)?,
            'U' => push_scalar(&mut out, take_radix(&mut it, 8, 16)?)?,
            _ => return Err(StrArrayError::BadEscape),
        }
    }
    String::from_utf8(out).map_err(|_| StrArrayError::BadUtf8)
}

fn take_radix(
    it: &mut std::str::Chars<'_>,
    digits: usize,
    radix: u32,
) -> Result<u32, StrArrayError> {
    let mut v: u32 = 0;
    for _ in 0..digits {
        let d = it
            .next()
            .and_then(|c| c.to_digit(radix))
            .ok_or(StrArrayError::BadEscape)?;
        v = v.checked_mul(radix).ok_or(StrArrayError::BadEscape)? + d;
    }
    Ok(v)
}

fn push_scalar(out: &mut Vec<u8>, v: u32) -> Result<(), StrArrayError> {
    let c = char::from_u32(v).ok_or(StrArrayError::BadEscape)?;
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(a: &[&str]) {
        let owned: Vec<String> = a.iter().map(|s| s.to_string()).collect();
        let printed = print(&owned);
        assert_eq!(parse(&printed).unwrap(), owned, "printed: {printed}");
    }

    #[test]
    fn empty_array() {
        assert_eq!(print(&[]), "[]");
        assert_eq!(parse("[]").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn simple_roundtrip() {
        roundtrip(&["one", "two", "three"]);
    }

    #[test]
    fn empty_element() {
        roundtrip(&[""]);
        roundtrip(&["", "x", ""]);
    }

    #[test]
    fn escapes_roundtrip() {
        roundtrip(&["two\r\n", "quo\"te", "back\\slash", "tab\tbell\x07"]);
        roundtrip(&["\x00\x01\x1f\x7f"]);
    }

    #[test]
    fn unicode_roundtrip() {
        roundtrip(&["žąsis", "日本語", "🦀", "mixed ascii žž"]);
    }

    #[test]
    fn printed_form_is_ascii() {
        let printed = print(&["žąsis\n".to_string()]);
        assert!(printed.is_ascii(), "got: {printed}");
    }

    #[test]
    fn known_form() {
        assert_eq!(
            print(&["one".into(), "two\r\n".into()]),
            r#"["one" "two\r\n"]"#
        );
    }

    #[test]
    fn octal_and_hex_escapes_parse() {
        assert_eq!(parse(r#"["\101\x42"]"#).unwrap(), vec!["AB".to_string()]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("[").is_err());
        assert!(parse(r#"["a""#).is_err());
        assert!(parse(r#"["a""b"]"#).is_err()); // missing space
        assert!(parse(r#"["a"  "b"]"#).is_err()); // two spaces
        assert!(parse(r#"["a" ]"#).is_err()); // trailing space
        assert!(parse(r#"[x]"#).is_err());
        assert!(parse(r#"["\q"]"#).is_err());
        assert!(parse(r#"["\xzz"]"#).is_err());
    }

    #[test]
    fn rejects_invalid_utf8_bytes() {
        // \xcc alone is not valid UTF-8
        assert_eq!(parse(r#"["\xcc"]"#), Err(StrArrayError::BadUtf8));
    }

    #[test]
    fn random_roundtrip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x42);
        for _ in 0..200 {
            let n = rng.gen_range(0..4);
            let a: Vec<String> = (0..n)
                .map(|_| {
                    let len = rng.gen_range(0..16);
                    (0..len)
                        .map(|_| {
                            // bias towards awkward characters
                            match rng.gen_range(0..4) {
                                0 => char::from_u32(rng.gen_range(0..0x20)).unwrap(),
                                1 => *[b'"', b'\\', b' ', b'[', b']'].map(char::from)
                                    .get(rng.gen_range(0..5))
                                    .unwrap(),
                                2 => char::from_u32(rng.gen_range(0x20..0x7f)).unwrap(),
                                _ => loop {
                                    if let Some(c) = char::from_u32(rng.gen_range(0x80..0x11000)) {
                                        break c;
                                    }
                                },
                            }
                        })
                        .collect()
                })
                .collect();
            let printed = print(&a);
            assert_eq!(parse(&printed).unwrap(), a, "printed: {printed}");
        }
    }
}
