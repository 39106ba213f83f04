use bytes::Bytes;
use hyper::{
    HeaderMap, Method, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};

use crate::error::ArchiveError;

/// HTTP exchanges move through the archive fully buffered; the surrounding
/// proxy collects streaming bodies before handing them over.
pub type Request = hyper::Request<Bytes>;
pub type Response = hyper::Response<Bytes>;

const MAX_WIRE_HEADERS: usize = 128;

/// The host a request addresses: its URL authority when the URL is absolute,
/// otherwise its `Host` header. Port is kept verbatim when present.
pub fn request_host(request: &Request) -> Option<&str> {
    if let Some(authority) = request.uri().authority() {
        return Some(authority.as_str());
    }
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
}

/// Writes the request in its canonical HTTP/1.1 wire form: origin-form
/// request line, `Host` first, remaining headers in map order, then the body
/// framed by `Content-Length` (or re-chunked when the request carried a
/// `Transfer-Encoding`).
pub fn serialize_request(request: &Request) -> Result<Vec<u8>, ArchiveError> {
    let host = request_host(request).ok_or_else(|| {
        ArchiveError::Serialization(format!("request for {} has no host", request.uri()))
    })?;
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut wire = Vec::new();
    wire.extend_from_slice(request.method().as_str().as_bytes());
    wire.push(b' ');
    wire.extend_from_slice(target.as_bytes());
    wire.extend_from_slice(b" HTTP/1.1\r\n");
    wire.extend_from_slice(b"Host: ");
    wire.extend_from_slice(host.as_bytes());
    wire.extend_from_slice(b"\r\n");

    write_headers(
        &mut wire,
        request.headers(),
        &[header::HOST, header::CONTENT_LENGTH, header::TRANSFER_ENCODING],
    );

    let body = request.body();
    if is_chunked(request.headers()) {
        wire.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
        write_chunked(&mut wire, body);
    } else if !body.is_empty() {
        wire.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        wire.extend_from_slice(body);
    } else {
        wire.extend_from_slice(b"\r\n");
    }
    Ok(wire)
}

/// Writes the response in its canonical HTTP/1.1 wire form. The request
/// method decides body framing: HEAD responses and 1xx/204/304 statuses are
/// written without one.
pub fn serialize_response(
    response: &Response,
    request_method: &Method,
) -> Result<Vec<u8>, ArchiveError> {
    let status = response.status();

    let mut wire = Vec::new();
    wire.extend_from_slice(b"HTTP/1.1 ");
    wire.extend_from_slice(status.as_str().as_bytes());
    wire.push(b' ');
    wire.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    wire.extend_from_slice(b"\r\n");

    if !response_allows_body(status, request_method) {
        // A HEAD response may carry a Content-Length describing the body it
        // elided; pass it through untouched.
        write_headers(&mut wire, response.headers(), &[header::TRANSFER_ENCODING]);
        wire.extend_from_slice(b"\r\n");
        return Ok(wire);
    }

    write_headers(
        &mut wire,
        response.headers(),
        &[header::CONTENT_LENGTH, header::TRANSFER_ENCODING],
    );

    let body = response.body();
    if is_chunked(response.headers()) {
        wire.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
        write_chunked(&mut wire, body);
    } else {
        wire.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        wire.extend_from_slice(body);
    }
    Ok(wire)
}

pub fn parse_request(wire: &[u8]) -> Result<Request, ArchiveError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_WIRE_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);
    let head_len = match parsed.parse(wire) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(ArchiveError::Parse("truncated request head".to_owned()));
        }
        Err(err) => {
            return Err(ArchiveError::Parse(format!("malformed request head: {err}")));
        }
    };

    let method = parsed
        .method
        .and_then(|name| Method::from_bytes(name.as_bytes()).ok())
        .ok_or_else(|| ArchiveError::Parse("request line has no usable method".to_owned()))?;
    let uri = parsed
        .path
        .ok_or_else(|| ArchiveError::Parse("request line has no target".to_owned()))?
        .parse::<Uri>()
        .map_err(|err| ArchiveError::Parse(format!("invalid request target: {err}")))?;
    let headers = collect_headers(parsed.headers)?;

    let framing = if is_chunked(&headers) {
        BodyFraming::Chunked
    } else if let Some(length) = content_length(&headers)? {
        BodyFraming::Length(length)
    } else {
        BodyFraming::Empty
    };
    let body = read_body(&wire[head_len..], framing)?;

    let mut request = hyper::Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::from(body))
        .map_err(|err| ArchiveError::Parse(format!("assemble parsed request: {err}")))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Parses response bytes recorded for a request made with `request_method`,
/// which decides whether a body is expected at all.
pub fn parse_response(wire: &[u8], request_method: &Method) -> Result<Response, ArchiveError> {
    if wire.is_empty() {
        return Err(ArchiveError::Parse(
            "response bytes are empty (recorded failure)".to_owned(),
        ));
    }

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_WIRE_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);
    let head_len = match parsed.parse(wire) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(ArchiveError::Parse("truncated response head".to_owned()));
        }
        Err(err) => {
            return Err(ArchiveError::Parse(format!("malformed response head: {err}")));
        }
    };

    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ArchiveError::Parse("status line has no usable code".to_owned()))?;
    let headers = collect_headers(parsed.headers)?;

    let framing = if !response_allows_body(status, request_method) {
        BodyFraming::Empty
    } else if is_chunked(&headers) {
        BodyFraming::Chunked
    } else if let Some(length) = content_length(&headers)? {
        BodyFraming::Length(length)
    } else {
        BodyFraming::ToEnd
    };
    let body = read_body(&wire[head_len..], framing)?;

    let mut response = hyper::Response::builder()
        .status(status)
        .body(Bytes::from(body))
        .map_err(|err| ArchiveError::Parse(format!("assemble parsed response: {err}")))?;
    *response.headers_mut() = headers;
    Ok(response)
}

enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    ToEnd,
}

fn read_body(rest: &[u8], framing: BodyFraming) -> Result<Vec<u8>, ArchiveError> {
    match framing {
        BodyFraming::Empty => Ok(Vec::new()),
        BodyFraming::ToEnd => Ok(rest.to_vec()),
        BodyFraming::Length(length) => {
            if rest.len() < length {
                return Err(ArchiveError::Parse(format!(
                    "body truncated: expected {length} bytes, have {}",
                    rest.len()
                )));
            }
            Ok(rest[..length].to_vec())
        }
        BodyFraming::Chunked => decode_chunked(rest),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ArchiveError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for entry in raw {
        let name = HeaderName::from_bytes(entry.name.as_bytes()).map_err(|err| {
            ArchiveError::Parse(format!("invalid header name `{}`: {err}", entry.name))
        })?;
        let value = HeaderValue::from_bytes(entry.value).map_err(|err| {
            ArchiveError::Parse(format!("invalid value for header `{}`: {err}", entry.name))
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, ArchiveError> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|text| text.trim().parse::<usize>().ok())
        .map(Some)
        .ok_or_else(|| {
            ArchiveError::Parse(format!("invalid content-length header: {value:?}"))
        })
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(header::TRANSFER_ENCODING).iter().any(|value| {
        value.to_str().is_ok_and(|codings| {
            codings
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        })
    })
}

fn response_allows_body(status: StatusCode, request_method: &Method) -> bool {
    if *request_method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn write_headers(wire: &mut Vec<u8>, headers: &HeaderMap, skip: &[HeaderName]) {
    for (name, value) in headers {
        if skip.contains(name) {
            continue;
        }
        wire.extend_from_slice(name.as_str().as_bytes());
        wire.extend_from_slice(b": ");
        wire.extend_from_slice(value.as_bytes());
        wire.extend_from_slice(b"\r\n");
    }
}

fn write_chunked(wire: &mut Vec<u8>, body: &[u8]) {
    if !body.is_empty() {
        wire.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        wire.extend_from_slice(body);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0\r\n\r\n");
}

fn decode_chunked(mut rest: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut body = Vec::new();
    loop {
        let line_end = find_crlf(rest)
            .ok_or_else(|| ArchiveError::Parse("chunked body missing size line".to_owned()))?;
        let size_line = std::str::from_utf8(&rest[..line_end])
            .map_err(|err| ArchiveError::Parse(format!("chunk size is not text: {err}")))?;
        // Chunk extensions after `;` are ignored.
        let size_field = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16).map_err(|err| {
            ArchiveError::Parse(format!("invalid chunk size `{size_field}`: {err}"))
        })?;
        rest = &rest[line_end + 2..];

        if size == 0 {
            // Trailers, if any, end the recording; nothing reads past them.
            return Ok(body);
        }
        if rest.len() < size + 2 {
            return Err(ArchiveError::Parse(format!(
                "chunk truncated: need {size} bytes plus CRLF, have {}",
                rest.len()
            )));
        }
        body.extend_from_slice(&rest[..size]);
        if &rest[size..size + 2] != b"\r\n" {
            return Err(ArchiveError::Parse("chunk missing CRLF terminator".to_owned()));
        }
        rest = &rest[size + 2..];
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|window| window == b"\r\n")
}
