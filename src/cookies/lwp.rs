//! libwww-perl `Set-Cookie3` cookie file format.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};

use super::{CookieEntry, CookieError, clamp_expiry};

pub const LWP_HEADER: &str = "#LWP-Cookies-2.0";
const LWP_MAGIC: &str = "#LWP-Cookies-";
const LINE_PREFIX: &str = "Set-Cookie3:";
const EXPIRES_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

pub(crate) fn read_file(path: &Path) -> Result<Vec<CookieEntry>, CookieError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CookieError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_lwp(&contents)
}

pub(crate) fn write_file(path: &Path, entries: &[CookieEntry]) -> Result<(), CookieError> {
    std::fs::write(path, render_lwp(entries)).map_err(|source| CookieError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Render cookies as an LWP cookie file.
pub fn render_lwp(entries: &[CookieEntry]) -> String {
    let mut out = String::from(LWP_HEADER);
    out.push('\n');
    for entry in entries {
        out.push_str(LINE_PREFIX);
        out.push(' ');
        out.push_str(&render_line(entry));
        out.push('\n');
    }
    out
}

fn render_line(entry: &CookieEntry) -> String {
    let mut words = vec![
        format!("{}={}", quote(&entry.name), quote(&entry.value)),
        format!("path={}", quote(&entry.path)),
        format!("domain={}", quote(&entry.domain)),
        "path_spec".to_string(),
    ];
    if entry.domain.starts_with('.') {
        words.push("domain_dot".into());
    }
    if entry.secure {
        words.push("secure".into());
    }
    match entry.expires.map(clamp_expiry).and_then(|secs| DateTime::from_timestamp(secs, 0)) {
        Some(expires) => words.push(format!("expires=\"{}\"", expires.format(EXPIRES_FORMAT))),
        None => words.push("discard".into()),
    }
    if entry.http_only {
        words.push("HttpOnly=None".into());
    }
    words.push("version=0".into());
    words.join("; ")
}

fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Parse an LWP cookie file. The magic header line is mandatory.
pub fn parse_lwp(contents: &str) -> Result<Vec<CookieEntry>, CookieError> {
    let mut lines = contents.lines().enumerate();
    match lines.next() {
        Some((_, first)) if first.trim_start().starts_with(LWP_MAGIC) => {}
        _ => {
            return Err(CookieError::Malformed {
                line: 1,
                reason: "missing #LWP-Cookies header".into(),
            });
        }
    }

    let mut entries = Vec::new();
    for (index, line) in lines {
        let line = line.trim();
        let Some(rest) = line.strip_prefix(LINE_PREFIX) else {
            continue;
        };
        let entry = parse_line(rest).map_err(|reason| CookieError::Malformed {
            line: index + 1,
            reason,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Result<CookieEntry, String> {
    let mut words = split_words(line)?.into_iter();
    let (name, value) = words.next().ok_or("empty cookie line")?;
    let value = value.unwrap_or_default();

    let mut domain = None;
    let mut path = None;
    let mut secure = false;
    let mut expires = None;
    let mut discard = false;
    let mut http_only = false;

    for (key, val) in words {
        match key.to_ascii_lowercase().as_str() {
            "domain" => domain = val,
            "path" => path = val,
            "secure" => secure = true,
            "discard" => discard = true,
            "httponly" => http_only = true,
            "expires" => {
                if let Some(raw) = val {
                    let parsed = NaiveDateTime::parse_from_str(raw.trim(), EXPIRES_FORMAT)
                        .map_err(|err| format!("bad expires `{raw}`: {err}"))?;
                    expires = Some(parsed.and_utc().timestamp());
                }
            }
            _ => {}
        }
    }

    let domain = domain.filter(|d| !d.is_empty()).ok_or("cookie without domain")?;
    let mut entry = CookieEntry::new(name, value, domain)
        .with_path(path.unwrap_or_else(|| "/".into()))
        .with_secure(secure)
        .with_http_only(http_only);
    if !discard {
        entry = entry.with_expires(expires);
    }
    Ok(entry)
}

/// Split `k=v; k2="quoted; v"; flag` into key/value pairs.
fn split_words(line: &str) -> Result<Vec<(String, Option<String>)>, String> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ';') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_string();

        let value = if chars.peek() == Some(&'=') {
            chars.next();
            while chars.peek().is_some_and(|c| *c == ' ') {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(format!("unterminated quote after `{key}`"));
                }
                Some(value)
            } else {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                Some(value.trim().to_string())
            }
        } else {
            None
        };

        if key.is_empty() {
            return Err("empty attribute name".into());
        }
        words.push((key, value));
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::MAX_COOKIE_EXPIRY;

    #[test]
    fn renders_and_parses_lwp_lines() {
        let entries = vec![
            CookieEntry::new("cf_clearance", "abc-123", ".example.com")
                .with_secure(true)
                .with_http_only(true)
                .with_expires(Some(1_900_000_000)),
            CookieEntry::new("theme", "dark", "www.example.com").with_path("/app"),
        ];
        let rendered = render_lwp(&entries);
        assert!(rendered.starts_with(LWP_HEADER));
        assert!(rendered.contains(
            "Set-Cookie3: cf_clearance=\"abc-123\"; path=\"/\"; domain=\".example.com\"; path_spec; domain_dot; secure; expires=\"2030-03-17 17:46:40Z\"; HttpOnly=None; version=0"
        ));

        let parsed = parse_lwp(&rendered).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn far_future_expiry_is_clamped_on_write() {
        let mut entry = CookieEntry::new("a", "b", "example.com");
        entry.expires = Some(i64::MAX);
        let parsed = parse_lwp(&render_lwp(&[entry])).unwrap();
        assert_eq!(parsed[0].expires, Some(MAX_COOKIE_EXPIRY));
    }

    #[test]
    fn rejects_files_without_magic() {
        assert!(matches!(
            parse_lwp("Set-Cookie3: a=b; domain=x.com\n"),
            Err(CookieError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn reports_bad_lines() {
        let text = format!("{LWP_HEADER}\nSet-Cookie3: a=b; path=\"/\"\n");
        assert!(matches!(parse_lwp(&text), Err(CookieError::Malformed { line: 2, .. })));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let text = format!("{LWP_HEADER}\n# comment\n\nSet-Cookie3: a=b; domain=example.com; discard\n");
        let parsed = parse_lwp(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].is_session());
    }
}
