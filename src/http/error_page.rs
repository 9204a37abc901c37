//! Synthesized HTTP/1.0 error responses returned to the client when a
//! session aborts before or instead of a backend answer.

use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

pub const SERVER_NAME: &str = "janus";

const DEFAULT_STYLE: &str =
    "body { background-color: #a00000; color: white; font-family: sans-serif; }";

const HTTP_DATE: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn status_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Render a complete HTTP/1.0 response carrying the error document.
///
/// The detail line is suppressed for 500-class codes so internal failure
/// reasons never leak to the client; the label (set by the matching rule)
/// is always shown when present.
pub fn render(code: u16, reason: &str, label: Option<&str>, style: Option<&str>) -> Vec<u8> {
    let text = status_text(code);
    let detail = if code >= 500 { "" } else { reason };
    let style = style.unwrap_or(DEFAULT_STYLE);

    let mut body = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>{code} {text}</title>\n\
         <style type=\"text/css\"><!--\n{style}\n--></style>\n</head>\n\
         <body>\n<h1>{code} {text}</h1>\n<div id=\"m\">{detail}</div>\n"
    );
    if let Some(label) = label {
        body.push_str(&format!("<div id=\"l\">{label}</div>\n"));
    }
    body.push_str(&format!("<hr><address>{SERVER_NAME}</address>\n</body>\n</html>\n"));

    let date = OffsetDateTime::now_utc()
        .format(HTTP_DATE)
        .unwrap_or_default();

    let mut response = format!(
        "HTTP/1.0 {code} {text}\r\n\
         Date: {date}\r\n\
         Server: {SERVER_NAME}\r\n\
         Connection: close\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_shown_for_client_errors() {
        let page = String::from_utf8(render(403, "rejecting request", Some("blocked"), None)).unwrap();
        assert!(page.starts_with("HTTP/1.0 403 Forbidden\r\n"));
        assert!(page.contains("rejecting request"));
        assert!(page.contains("blocked"));
        assert!(page.contains("Connection: close"));
    }

    #[test]
    fn detail_suppressed_for_server_errors() {
        let page = String::from_utf8(render(500, "invalid content length", None, None)).unwrap();
        assert!(page.contains("500 Internal Server Error"));
        assert!(!page.contains("invalid content length"));
    }

    #[test]
    fn content_length_matches_body() {
        let raw = render(504, "connect timeout", None, None);
        let page = String::from_utf8(raw).unwrap();
        let (head, body) = page.split_once("\r\n\r\n").unwrap();
        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(len, body.len());
    }
}
