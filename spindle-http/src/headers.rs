//! Helpers for building and inspecting header lists.

use spindle_h2::HeaderField;

/// Request header block with the four mandatory pseudo-headers.
pub fn request_headers(method: &str, path: &str, authority: &str) -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", method.to_owned()),
        HeaderField::new(":scheme", "http"),
        HeaderField::new(":path", path.to_owned()),
        HeaderField::new(":authority", authority.to_owned()),
    ]
}

/// Response header block carrying only `:status`.
pub fn response_headers(status: u16) -> Vec<HeaderField> {
    vec![HeaderField::new(":status", status.to_string())]
}

/// First value of `name`. Names are lowercase on the wire, so the
/// comparison ignores ASCII case.
pub fn header<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
        .map(|h| &h.value[..])
}

/// The `:status` of a response header block.
pub fn status(headers: &[HeaderField]) -> Option<u16> {
    std::str::from_utf8(header(headers, ":status")?).ok()?.parse().ok()
}

/// The `:method` and `:path` of a request header block.
pub fn method_and_path(headers: &[HeaderField]) -> Option<(&str, &str)> {
    let method = std::str::from_utf8(header(headers, ":method")?).ok()?;
    let path = std::str::from_utf8(header(headers, ":path")?).ok()?;
    Some((method, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_pseudo_headers() {
        let headers = request_headers("GET", "/index.html", "example.com");
        assert_eq!(method_and_path(&headers), Some(("GET", "/index.html")));
        assert_eq!(header(&headers, ":authority"), Some(&b"example.com"[..]));
        assert!(headers.iter().all(|h| h.is_pseudo()));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(status(&response_headers(204)), Some(204));
        assert_eq!(status(&[HeaderField::new(":status", "abc")]), None);
        assert_eq!(status(&[]), None);
    }

    #[test]
    fn lookup_ignores_case() {
        let headers = vec![HeaderField::new("content-type", "text/plain")];
        assert_eq!(header(&headers, "Content-Type"), Some(&b"text/plain"[..]));
        assert_eq!(header(&headers, "content-length"), None);
    }
}
