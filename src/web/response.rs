use url::Url;

/// Extracts the bare MIME type out of a `Content-Type` header value.
pub fn mime_type(content_type: Option<&str>) -> Option<String> {
    content_type.map(|value| {
        value
            .split(';')
            .next()
            .unwrap_or(value)
            .trim()
            .to_ascii_lowercase()
    })
}

/// Infers the filename of a downloaded file.
///
/// The `Content-Disposition` filename wins when present; the server encodes
/// UTF-8 names through an ISO-8859-1 header, so the raw header bytes are
/// decoded as UTF-8 and HTML entities are unescaped. Fallback is the last
/// path segment of the final, post-redirect URL.
pub fn infer_filename(content_disposition: Option<&[u8]>, final_url: &Url) -> String {
    if let Some(name) = content_disposition.and_then(filename_from_disposition) {
        return name;
    }

    final_url
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or("")
        .to_string()
}

fn filename_from_disposition(header: &[u8]) -> Option<String> {
    let header = String::from_utf8_lossy(header).into_owned();

    for parameter in header.split(';') {
        let (name, value) = match parameter.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        if !name.trim().eq_ignore_ascii_case("filename") {
            continue;
        }

        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            return None;
        }
        return Some(unescape_entities(value));
    }

    None
}

/// Unescapes the HTML entities the server is known to emit inside filenames.
pub fn unescape_entities(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('&') {
        result.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            result.push_str(tail);
            return result;
        };

        let entity = &tail[1..end];
        match entity {
            "amp" => result.push('&'),
            "lt" => result.push('<'),
            "gt" => result.push('>'),
            "quot" => result.push('"'),
            "apos" => result.push('\''),
            "nbsp" => result.push('\u{a0}'),
            _ => {
                let decoded = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32);
                match decoded {
                    Some(c) => result.push(c),
                    None => {
                        // unknown entity, keep it verbatim
                        result.push_str(&tail[..=end]);
                    }
                }
            }
        }
        rest = &tail[end + 1..];
    }
    result.push_str(rest);

    result
}
