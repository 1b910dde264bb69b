use std::borrow::Cow;

/// Short, log-safe stand-in for a token: keeps a 4 character prefix so two
/// tokens can be told apart in logs.
pub fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.chars().count() <= 8 {
        return "REDACTED".to_string();
    }
    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}…REDACTED")
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }

    (0..=hay.len() - nee.len()).find(|&i| {
        hay[i..i + nee.len()]
            .iter()
            .zip(nee)
            .all(|(a, b)| a.to_ascii_lowercase() == b.to_ascii_lowercase())
    })
}

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '~' | '+' | '/' | '=')
}

/// Replaces the value following every occurrence of `marker`.
fn redact_after(text: &str, marker: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(idx) = find_ascii_case_insensitive(rest, marker) else {
            out.push_str(rest);
            break;
        };
        let end = idx + marker.len();
        out.push_str(&rest[..end]);
        rest = &rest[end..];

        let mut consumed = 0;
        for ch in rest.chars() {
            if !is_token_char(ch) {
                break;
            }
            consumed += ch.len_utf8();
        }
        if consumed > 0 {
            out.push_str("REDACTED");
        }
        rest = &rest[consumed..];
    }
    out
}

const MARKERS: [&str; 6] = [
    "Bearer ",
    "token=",
    "\"token\":\"",
    "\"bearerToken\":\"",
    "\"refreshToken\":\"",
    "refresh_token=",
];

/// Strips bearer and refresh tokens from free text (error messages, urls,
/// json bodies) before it is logged or surfaced to the UI.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    if !MARKERS
        .iter()
        .any(|m| find_ascii_case_insensitive(input, m).is_some())
    {
        return Cow::Borrowed(input);
    }

    let mut value = input.to_string();
    for marker in MARKERS {
        value = redact_after(&value, marker);
    }

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}
