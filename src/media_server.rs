use std::collections::HashMap;
use std::fs;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::io::Read;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::collection::{Collection, Entry};
use crate::service::{Service, XML_DECLARATION, soap_fault};
use crate::{NAME, SysInfo, VERSION};

const HTTP_PROTOCOL_NAME: &str = "HTTP";

const HTTP_PROTOCOL_VERSION: &str = "1.1";

const HTTP_RESPONSE_OK: &str = "200 OK";

const HTTP_RESPONSE_PARTIAL_CONTENT: &str = "206 PARTIAL CONTENT";

const HTTP_RESPONSE_BAD_REQUEST: &str = "400 BAD REQUEST";

const HTTP_RESPONSE_UNAUTHORIZED: &str = "401 UNAUTHORIZED";

const HTTP_RESPONSE_NOT_FOUND: &str = "404 NOT FOUND";

const HTTP_RESPONSE_METHOD_NOT_ALLOWED: &str = "405 METHOD NOT ALLOWED";

const HTTP_RESPONSE_RANGE_NOT_SATISFIABLE: &str = "416 RANGE NOT SATISFIABLE";

const HTTP_RESPONSE_INTERNAL_SERVER_ERROR: &str = "500 Internal Server Error";

const HTTP_RESPONSE_NOT_IMPLEMENTED: &str = "501 NOT IMPLEMENTED";

const CONTENT_TYPE_XML: &str = "text/xml; charset=\"utf-8\"";

const MANUFACTURER: &str = "midlari";

/// Everything the HTTP side serves: identity for the descriptions, the
/// service table for control, the collection for media bytes. Immutable
/// after startup, shared across connection threads.
pub struct MediaServer {
    pub sys_info: Arc<SysInfo>,
    pub services: Vec<Service>,
    pub collection: Arc<Collection>,
}

#[derive(Debug)]
enum ParseRequestError {
    EmptyRequest,
    InvalidRequestLine(String),
    IoError(std::io::Error),
}

impl std::fmt::Display for ParseRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EmptyRequest => {
                write!(f, "empty request")
            }
            Self::InvalidRequestLine(line) => {
                write!(f, "invalid request line: {line}")
            }
            Self::IoError(err) => {
                write!(f, "error reading request: {err}")
            }
        }
    }
}

impl std::error::Error for ParseRequestError {}

/// Header names are case-insensitive on the wire (control points send
/// `Soapaction`, `SOAPACTION` and everything in between), so names are
/// folded to lowercase on insert and lookups never have to care.
#[derive(Debug, Default)]
struct Headers(HashMap<String, String>);

impl Headers {
    fn insert(&mut self, name: &str, value: &str) {
        self.0
            .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug)]
struct Request {
    method: String,
    path: String,
    headers: Headers,
    body: Option<String>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// One line off the stream with its line ending removed. `None` means the
/// peer closed the connection. Bare LF is tolerated; renderer firmware is
/// sloppy about line endings.
fn read_crlf_line(
    buf_reader: &mut BufReader<impl Read>,
) -> std::io::Result<Option<String>> {
    let mut line = String::with_capacity(100);
    if buf_reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let end = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(end);
    Ok(Some(line))
}

fn read_body(content_length: usize, buf_reader: &mut BufReader<impl Read>) -> Option<String> {
    if content_length == 0 {
        return None;
    }
    let mut buf = vec![0; content_length];
    if let Err(e) = buf_reader.read_exact(&mut buf) {
        error!("could not read body: {e}");
        return None;
    }
    match String::from_utf8(buf) {
        Ok(body) => Some(body),
        Err(e) => {
            error!("body is not UTF8: {e}");
            None
        }
    }
}

fn parse_http_request_line(
    request_line: &str,
) -> std::result::Result<(String, String), ParseRequestError> {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(_protocol), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseRequestError::InvalidRequestLine(
            request_line.to_string(),
        ));
    };
    Ok((method.to_string(), path.to_string()))
}

fn parse_request(
    buf_reader: &mut BufReader<impl Read>,
) -> std::result::Result<Request, ParseRequestError> {
    let request_line = match read_crlf_line(buf_reader) {
        Ok(Some(line)) => line,
        Ok(None) => return Err(ParseRequestError::EmptyRequest),
        Err(err) => return Err(ParseRequestError::IoError(err)),
    };
    debug!("Request: {request_line}");

    let (method, path) = parse_http_request_line(&request_line)?;

    // headers run until the blank line; a peer that hangs up early just
    // ends the table where it stopped
    let mut headers = Headers::default();
    loop {
        match read_crlf_line(buf_reader) {
            Ok(Some(line)) if line.is_empty() => break,
            Ok(Some(line)) => match line.split_once(':') {
                Some((name, value)) => headers.insert(name, value),
                None => warn!("ignoring header line without a colon: {line:?}"),
            },
            Ok(None) => break,
            Err(err) => {
                error!("error reading headers: {err}");
                break;
            }
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let body = read_body(content_length, buf_reader);

    Ok(Request {
        method,
        path,
        headers,
        body,
    })
}

struct Response {
    status: &'static str,
    content_type: Option<String>,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    fn empty(status: &'static str) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn xml(status: &'static str, body: String) -> Self {
        Self {
            status,
            content_type: Some(CONTENT_TYPE_XML.to_string()),
            headers: Vec::new(),
            body: body.into_bytes(),
        }
    }

    fn status_code(&self) -> &str {
        self.status.split(' ').next().unwrap_or(self.status)
    }
}

pub fn handle_device_connection(
    server: &MediaServer,
    peer: IpAddr,
    input_stream: impl Read,
    mut output_stream: impl std::io::Write,
) {
    let start = Instant::now();
    let mut buf_reader = BufReader::new(input_stream);

    let request = match parse_request(&mut buf_reader) {
        Ok(request) => request,
        Err(ParseRequestError::EmptyRequest) => {
            debug!("empty request from {peer}");
            return;
        }
        Err(err @ ParseRequestError::IoError(_)) => {
            warn!("could not parse request from {peer}: {err}");
            return;
        }
        Err(err @ ParseRequestError::InvalidRequestLine(_)) => {
            warn!("bad request from {peer}: {err}");
            write_response(HTTP_RESPONSE_BAD_REQUEST, None, &[], &[], &mut output_stream);
            return;
        }
    };

    let response = route(server, peer, &request);

    write_response(
        response.status,
        response.content_type.as_deref(),
        &response.headers,
        &response.body,
        &mut output_stream,
    );

    let user_agent = request.header("User-Agent").unwrap_or("-");
    info!(
        "{peer} {} {} {} {:.2?} {user_agent}",
        request.method,
        request.path,
        response.status_code(),
        start.elapsed(),
    );
}

/// The whole URL space. Access control comes first: a device reachable
/// beyond the private network stays silent about everything it has.
fn route(server: &MediaServer, peer: IpAddr, request: &Request) -> Response {
    if !is_private(peer) {
        warn!("rejecting {} from non-private address {peer}", request.path);
        return Response::empty(HTTP_RESPONSE_UNAUTHORIZED);
    }

    if request.path == "/" {
        if request.method != "GET" {
            return Response::empty(HTTP_RESPONSE_METHOD_NOT_ALLOWED);
        }
        return Response::xml(HTTP_RESPONSE_OK, device_description(server));
    }

    let segments: Vec<&str> = request.path.split('/').collect();
    match segments.as_slice() {
        ["", "media", id] => media_response(server, request, id),
        ["", index, endpoint] => match index.parse::<usize>() {
            Ok(index) => match server.services.get(index) {
                Some(service) => service_response(service, request, endpoint),
                None => Response::empty(HTTP_RESPONSE_NOT_FOUND),
            },
            Err(_) => Response::empty(HTTP_RESPONSE_NOT_FOUND),
        },
        _ => {
            debug!("unknown path: {}", request.path);
            Response::empty(HTTP_RESPONSE_NOT_FOUND)
        }
    }
}

fn service_response(service: &Service, request: &Request, endpoint: &str) -> Response {
    match endpoint {
        "service" => {
            if request.method != "GET" {
                return Response::empty(HTTP_RESPONSE_METHOD_NOT_ALLOWED);
            }
            Response::xml(HTTP_RESPONSE_OK, service.description.render_scpd())
        }
        "control" => {
            if request.method != "POST" {
                return Response::empty(HTTP_RESPONSE_METHOD_NOT_ALLOWED);
            }
            let body = request.body.as_deref().unwrap_or_default();
            match service.control(body) {
                Ok(envelope) => Response::xml(HTTP_RESPONSE_OK, envelope),
                Err(err) => {
                    warn!("control failed: {err}");
                    Response::xml(HTTP_RESPONSE_INTERNAL_SERVER_ERROR, soap_fault(&err))
                }
            }
        }
        "event" => {
            // GENA is an open extension; SUBSCRIBE and friends all land here
            info!(
                "event subscription attempt: {} (cb {})",
                request.method,
                request.header("CALLBACK").unwrap_or("-")
            );
            Response::empty(HTTP_RESPONSE_NOT_IMPLEMENTED)
        }
        _ => Response::empty(HTTP_RESPONSE_NOT_FOUND),
    }
}

fn device_description(server: &MediaServer) -> String {
    let sys_info = &server.sys_info;
    let device_type = &sys_info.device_type;
    let friendly_name = xml::escape::escape_str_attribute(&sys_info.friendly_name);
    let device_uuid = sys_info.device_uuid;

    let mut services = String::new();
    for (i, service) in server.services.iter().enumerate() {
        services.push_str(&format!(
            "<service><serviceType>{}</serviceType><serviceId>{}</serviceId><SCPDURL>/{i}/service</SCPDURL><controlURL>/{i}/control</controlURL><eventSubURL>/{i}/event</eventSubURL></service>",
            service.service_type, service.id,
        ));
    }

    format!(
        r#"{XML_DECLARATION}<root xmlns="urn:schemas-upnp-org:device-1-0" configId="0"><specVersion><major>1</major><minor>0</minor></specVersion><device><deviceType>{device_type}</deviceType><friendlyName>{friendly_name}</friendlyName><manufacturer>{MANUFACTURER}</manufacturer><modelName>{NAME}/{VERSION}</modelName><UDN>uuid:{device_uuid}</UDN><serviceList>{services}</serviceList></device></root>"#
    )
}

fn media_response(server: &MediaServer, request: &Request, id: &str) -> Response {
    let Ok(id) = id.parse::<usize>() else {
        return Response::empty(HTTP_RESPONSE_NOT_FOUND);
    };
    let entry = server.collection.get(id);
    let Some(Entry::Item(item)) = entry else {
        if let Some(entry) = entry {
            debug!("/media/{id} is {}, not an item", entry.title());
        }
        return Response::empty(HTTP_RESPONSE_NOT_FOUND);
    };
    if request.method != "GET" {
        return Response::empty(HTTP_RESPONSE_METHOD_NOT_ALLOWED);
    }

    let content = match fs::read(&item.path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("{} went away after indexing", item.path.display());
            return Response::empty(HTTP_RESPONSE_NOT_FOUND);
        }
        Err(err) => {
            error!("could not read {}: {err}", item.path.display());
            return Response::empty(HTTP_RESPONSE_INTERNAL_SERVER_ERROR);
        }
    };

    let length = content.len() as u64;
    let content_type = if item.mime == "*" {
        "application/octet-stream".to_string()
    } else {
        item.mime.clone()
    };

    // renderers seek with single byte ranges
    match request.header("Range") {
        Some(value) if value.trim_start().starts_with("bytes=") => {
            match parse_byte_range(value, length) {
                Some((start, end)) => {
                    let body = content[start as usize..=end as usize].to_vec();
                    Response {
                        status: HTTP_RESPONSE_PARTIAL_CONTENT,
                        content_type: Some(content_type),
                        headers: vec![
                            ("Accept-Ranges", "bytes".to_string()),
                            ("Content-Range", format!("bytes {start}-{end}/{length}")),
                        ],
                        body,
                    }
                }
                None => Response {
                    status: HTTP_RESPONSE_RANGE_NOT_SATISFIABLE,
                    content_type: None,
                    headers: vec![("Content-Range", format!("bytes */{length}"))],
                    body: Vec::new(),
                },
            }
        }
        // a Range in units we don't know is served whole
        _ => Response {
            status: HTTP_RESPONSE_OK,
            content_type: Some(content_type),
            headers: vec![("Accept-Ranges", "bytes".to_string())],
            body: content,
        },
    }
}

/// `bytes=a-b`, `bytes=a-` and the suffix form `bytes=-n`; only the first
/// range of a list is honoured.
fn parse_byte_range(value: &str, length: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let spec = spec.split(',').next()?.trim();
    let (start, end) = spec.split_once('-')?;

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || length == 0 {
            return None;
        }
        let suffix = suffix.min(length);
        return Some((length - suffix, length - 1));
    }

    let start: u64 = start.parse().ok()?;
    if start >= length {
        return None;
    }
    let end: u64 = if end.is_empty() {
        length - 1
    } else {
        end.parse().ok()?
    };
    if start > end {
        return None;
    }
    Some((start, end.min(length - 1)))
}

/// RFC 1918 only. Loopback and IPv6 peers are rejected too; the server
/// binds an IPv4 interface and advertises itself to the private network.
fn is_private(peer: IpAddr) -> bool {
    match peer {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

fn write_response(
    result: &str,
    content_type: Option<&str>,
    extra_headers: &[(&'static str, String)],
    content: &[u8],
    output_stream: &mut impl std::io::Write,
) {
    let length = content.len();
    let status_line = format!("{HTTP_PROTOCOL_NAME}/{HTTP_PROTOCOL_VERSION} {result}");
    let mut response_headers = status_line;
    if let Some(content_type) = content_type {
        response_headers.push_str(&format!("\r\nContent-Type: {content_type}"));
    }
    for (name, value) in extra_headers {
        response_headers.push_str(&format!("\r\n{name}: {value}"));
    }
    response_headers.push_str(&format!("\r\nContent-Length: {length}\r\n\r\n"));

    let response = [response_headers.as_bytes(), content].concat();
    if let Err(err) = output_stream.write_all(&response[..]) {
        error!("error writing response: {err}");
    }
}
