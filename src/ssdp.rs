// SSDP frames HTTP/1.1 message syntax over UDP datagrams. Everything that
// goes on or comes off the multicast group passes through here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::SysInfo;

pub const SSDP_IPV4_MULTICAST_ADDRESS: &str = "239.255.255.250:1900";

const HTTP_PROTOCOL_NAME: &str = "HTTP";

const HTTP_PROTOCOL_VERSION: &str = "1.1";

const HTTP_MATCH_ANY_RESOURCE: &str = "*";

const HTTP_RESPONSE_OK: &str = "200 OK";

const HTTP_HEADER_SEP: &str = ":";

pub const HTTP_METHOD_NOTIFY: &str = "NOTIFY";

pub const HTTP_METHOD_SEARCH: &str = "M-SEARCH";

pub const NTS_ALIVE: &str = "ssdp:alive";

pub const NTS_BYEBYE: &str = "ssdp:byebye";

pub const ALL_SEARCH_TARGET: &str = "ssdp:all";

pub const ROOT_DEVICE_TYPE: &str = "upnp:rootdevice";

// No reboot tracking, so both are pinned to zero.
const BOOT_ID: &str = "0";

const CONFIG_ID: &str = "0";

/// One advertised identity role: what goes in NT (or ST) and USN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub nt: String,
    pub usn: String,
}

/// The record set a device announces. The same records, in the same order,
/// are used for alive bursts, byebye bursts and `ssdp:all` search responses:
/// rootdevice, then the bare uuid, then the device type, then one per
/// distinct service type.
pub fn announcements(sys_info: &SysInfo) -> Vec<Announcement> {
    let uuid_urn = sys_info.uuid_urn();

    let mut records = vec![
        Announcement {
            nt: ROOT_DEVICE_TYPE.to_string(),
            usn: format!("{uuid_urn}::{ROOT_DEVICE_TYPE}"),
        },
        Announcement {
            nt: uuid_urn.clone(),
            usn: uuid_urn.clone(),
        },
        Announcement {
            nt: sys_info.device_type.clone(),
            usn: format!("{uuid_urn}::{}", sys_info.device_type),
        },
    ];

    let mut seen: Vec<&str> = Vec::new();
    for service_type in &sys_info.service_types {
        if seen.contains(&service_type.as_str()) {
            continue;
        }
        seen.push(service_type);
        records.push(Announcement {
            nt: service_type.clone(),
            usn: format!("{uuid_urn}::{service_type}"),
        });
    }

    records
}

pub fn notify_alive(sys_info: &SysInfo, record: &Announcement) -> String {
    let nt = &record.nt;
    let usn = &record.usn;
    let location = &sys_info.base_url;
    let server = sys_info.server_tokens();
    let search_port = sys_info.search_port;
    format!(
        "{HTTP_METHOD_NOTIFY} {HTTP_MATCH_ANY_RESOURCE} {HTTP_PROTOCOL_NAME}/{HTTP_PROTOCOL_VERSION}\r\n\
         HOST: {SSDP_IPV4_MULTICAST_ADDRESS}\r\n\
         CACHE-CONTROL: max-age = {}\r\n\
         LOCATION: {location}\r\n\
         NT: {nt}\r\n\
         NTS: {NTS_ALIVE}\r\n\
         SERVER: {server}\r\n\
         USN: {usn}\r\n\
         BOOTID.UPNP.ORG: {BOOT_ID}\r\n\
         CONFIGID.UPNP.ORG: {CONFIG_ID}\r\n\
         SEARCHPORT.UPNP.ORG: {search_port}\r\n\
         \r\n",
        sys_info.interval.as_secs()
    )
}

/// byebye deliberately carries no LOCATION, SERVER, CACHE-CONTROL or
/// SEARCHPORT; the device is going away, there is nothing to fetch.
pub fn notify_byebye(record: &Announcement) -> String {
    let nt = &record.nt;
    let usn = &record.usn;
    format!(
        "{HTTP_METHOD_NOTIFY} {HTTP_MATCH_ANY_RESOURCE} {HTTP_PROTOCOL_NAME}/{HTTP_PROTOCOL_VERSION}\r\n\
         HOST: {SSDP_IPV4_MULTICAST_ADDRESS}\r\n\
         NT: {nt}\r\n\
         NTS: {NTS_BYEBYE}\r\n\
         USN: {usn}\r\n\
         BOOTID.UPNP.ORG: {BOOT_ID}\r\n\
         CONFIGID.UPNP.ORG: {CONFIG_ID}\r\n\
         \r\n"
    )
}

pub fn search_response(sys_info: &SysInfo, record: &Announcement, response_date: &str) -> String {
    let st = &record.nt;
    let usn = &record.usn;
    let location = &sys_info.base_url;
    let server = sys_info.server_tokens();
    let search_port = sys_info.search_port;
    format!(
        "{HTTP_PROTOCOL_NAME}/{HTTP_PROTOCOL_VERSION} {HTTP_RESPONSE_OK}\r\n\
         CACHE-CONTROL: max-age = {}\r\n\
         DATE: {response_date}\r\n\
         EXT:\r\n\
         LOCATION: {location}\r\n\
         SERVER: {server}\r\n\
         ST: {st}\r\n\
         USN: {usn}\r\n\
         BOOTID.UPNP.ORG: {BOOT_ID}\r\n\
         CONFIGID.UPNP.ORG: {CONFIG_ID}\r\n\
         SEARCHPORT.UPNP.ORG: {search_port}\r\n\
         \r\n",
        sys_info.interval.as_secs()
    )
}

#[derive(Debug, PartialEq)]
pub struct SsdpMessage {
    pub request_line: String,
    pub headers: HashMap<String, String>,
}

impl SsdpMessage {
    /// Header names are case-insensitive on the wire; some control points
    /// send `St:` or `Mx:`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .and_then(|k| self.headers.get(k))
            .map(String::as_str)
    }
}

#[derive(Debug)]
pub struct InvalidSsdpMessage {
    msg: String,
}

impl std::fmt::Display for InvalidSsdpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "invalid ssdp message: {}", self.msg)
    }
}

impl std::error::Error for InvalidSsdpMessage {}

impl From<&str> for InvalidSsdpMessage {
    fn from(msg: &str) -> Self {
        Self {
            msg: msg.to_string(),
        }
    }
}

impl From<String> for InvalidSsdpMessage {
    fn from(msg: String) -> Self {
        Self { msg }
    }
}

pub fn parse_ssdp_message(data: &[u8]) -> std::result::Result<SsdpMessage, InvalidSsdpMessage> {
    let data = String::from_utf8(data.to_vec())
        .map_err(|err| InvalidSsdpMessage::from(format!("not UTF8: {err}")))?;
    let mut iter = data.lines();
    let request_line = iter.next().ok_or("failed to get request line")?;

    let mut headers = HashMap::new();
    for line in iter {
        if line.is_empty() {
            break;
        }
        let mut parts = line.splitn(2, HTTP_HEADER_SEP);
        let key = parts.next().ok_or("failed to get key")?.trim().to_string();
        let value = parts
            .next()
            .ok_or_else(|| format!("failed to get value for key {key}"))?
            .trim()
            .to_string();
        headers.insert(key, value);
    }

    Ok(SsdpMessage {
        request_line: request_line.to_string(),
        headers,
    })
}

pub fn parse_request_line(request_line: &str) -> std::result::Result<(String, String, String), String> {
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or("failed to get method")?
        .trim()
        .to_string();
    if method != HTTP_METHOD_NOTIFY && method != HTTP_METHOD_SEARCH {
        return Err(format!("invalid method: {method}"));
    }

    let request_target = parts
        .next()
        .ok_or("failed to get request target")?
        .trim()
        .to_string();
    if request_target != HTTP_MATCH_ANY_RESOURCE {
        return Err(format!("invalid request target: {request_target}"));
    }

    let protocol = parts
        .next()
        .ok_or("failed to get protocol")?
        .trim()
        .to_string();
    if protocol != format!("{HTTP_PROTOCOL_NAME}/{HTTP_PROTOCOL_VERSION}") {
        return Err(format!("invalid protocol: {protocol}"));
    }

    Ok((method, request_target, protocol))
}

/// some sources say an RFC 1123 date must be GMT and GMT only.
pub fn format_rfc1123(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::new_test_sys_info;

    #[test]
    fn test_announcements() {
        let sys_info = new_test_sys_info();
        let records = announcements(&sys_info);

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].nt, "upnp:rootdevice");
        assert_eq!(
            records[0].usn,
            "uuid:5c863963-f2a2-491e-8b60-079cdadad147::upnp:rootdevice"
        );
        assert_eq!(records[1].nt, "uuid:5c863963-f2a2-491e-8b60-079cdadad147");
        assert_eq!(records[1].usn, "uuid:5c863963-f2a2-491e-8b60-079cdadad147");
        assert_eq!(records[2].nt, "urn:schemas-upnp-org:device:MediaServer:1");
        assert_eq!(
            records[2].usn,
            "uuid:5c863963-f2a2-491e-8b60-079cdadad147::urn:schemas-upnp-org:device:MediaServer:1"
        );
        assert_eq!(
            records[3].nt,
            "urn:schemas-upnp-org:service:ContentDirectory:1"
        );
        assert_eq!(
            records[3].usn,
            "uuid:5c863963-f2a2-491e-8b60-079cdadad147::urn:schemas-upnp-org:service:ContentDirectory:1"
        );
    }

    #[test]
    fn test_announcements_collapse_duplicate_service_types() {
        let mut sys_info = new_test_sys_info();
        sys_info
            .service_types
            .push("urn:schemas-upnp-org:service:ContentDirectory:1".to_string());
        sys_info
            .service_types
            .push("urn:schemas-upnp-org:service:ConnectionManager:1".to_string());

        let records = announcements(&sys_info);

        // rootdevice + uuid + device type + two distinct service types
        assert_eq!(records.len(), 5);
        assert_eq!(
            records[4].nt,
            "urn:schemas-upnp-org:service:ConnectionManager:1"
        );
    }

    #[test]
    fn test_notify_alive_round_trips_through_the_codec() {
        let sys_info = new_test_sys_info();
        let records = announcements(&sys_info);

        let advertisement = notify_alive(&sys_info, &records[0]);
        let message = parse_ssdp_message(advertisement.as_bytes()).unwrap();

        let (method, target, protocol) = parse_request_line(&message.request_line).unwrap();
        assert_eq!(method, "NOTIFY");
        assert_eq!(target, "*");
        assert_eq!(protocol, "HTTP/1.1");

        assert_eq!(message.header("NT"), Some("upnp:rootdevice"));
        assert_eq!(message.header("NTS"), Some("ssdp:alive"));
        assert_eq!(
            message.header("USN"),
            Some("uuid:5c863963-f2a2-491e-8b60-079cdadad147::upnp:rootdevice")
        );
        assert_eq!(message.header("HOST"), Some("239.255.255.250:1900"));
        assert_eq!(message.header("LOCATION"), Some("http://192.168.1.9:8200/"));
        assert_eq!(message.header("CACHE-CONTROL"), Some("max-age = 3"));
        assert_eq!(message.header("SERVER"), Some("a/1 UPnP/1.0 midlari/0.1.0"));
        assert_eq!(message.header("BOOTID.UPNP.ORG"), Some("0"));
        assert_eq!(message.header("CONFIGID.UPNP.ORG"), Some("0"));
        assert_eq!(message.header("SEARCHPORT.UPNP.ORG"), Some("1900"));
    }

    #[test]
    fn test_notify_byebye_carries_no_location() {
        let sys_info = new_test_sys_info();
        let records = announcements(&sys_info);

        let advertisement = notify_byebye(&records[2]);
        let message = parse_ssdp_message(advertisement.as_bytes()).unwrap();

        assert_eq!(message.header("NTS"), Some("ssdp:byebye"));
        assert_eq!(
            message.header("NT"),
            Some("urn:schemas-upnp-org:device:MediaServer:1")
        );
        assert_eq!(message.header("LOCATION"), None);
        assert_eq!(message.header("SERVER"), None);
        assert_eq!(message.header("CACHE-CONTROL"), None);
        assert_eq!(message.header("SEARCHPORT.UPNP.ORG"), None);
        assert_eq!(message.header("BOOTID.UPNP.ORG"), Some("0"));
    }

    #[test]
    fn test_search_response_shape() {
        let sys_info = new_test_sys_info();
        let records = announcements(&sys_info);

        let response = search_response(&sys_info, &records[3], "Mon, 24 Nov 2025 21:28:32 GMT");

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        let message = parse_ssdp_message(response.as_bytes()).unwrap();
        assert_eq!(message.header("EXT"), Some(""));
        assert_eq!(message.header("DATE"), Some("Mon, 24 Nov 2025 21:28:32 GMT"));
        assert_eq!(
            message.header("ST"),
            Some("urn:schemas-upnp-org:service:ContentDirectory:1")
        );
        assert_eq!(
            message.header("USN"),
            Some("uuid:5c863963-f2a2-491e-8b60-079cdadad147::urn:schemas-upnp-org:service:ContentDirectory:1")
        );
        assert_eq!(message.header("LOCATION"), Some("http://192.168.1.9:8200/"));
    }

    #[test]
    fn test_parse_request_line() {
        let request_line = r#"M-SEARCH * HTTP/1.1"#;
        let (method, request_target, protocol) = parse_request_line(request_line).unwrap();
        assert_eq!(method, "M-SEARCH");
        assert_eq!(request_target, "*");
        assert_eq!(protocol, "HTTP/1.1");
    }

    #[test]
    fn test_parse_request_line_with_invalid_method() {
        let request_line = r#"HELLO * HTTP/1.1"#;
        assert!(parse_request_line(request_line).is_err())
    }

    #[test]
    fn test_parse_request_line_with_invalid_target() {
        let request_line = r#"M-SEARCH 1 HTTP/1.1"#;
        assert!(parse_request_line(request_line).is_err())
    }

    #[test]
    fn test_parse_request_line_with_invalid_protocol() {
        let request_line = r#"M-SEARCH * HTTP/a.b"#;
        assert!(parse_request_line(request_line).is_err())
    }

    #[test]
    fn test_parse_search() {
        let data = r#"M-SEARCH * HTTP/1.1
St: urn:schemas-upnp-org:service:ContentDirectory:1
Host: 239.255.255.250:1900
Mx: 3
Man: "ssdp:discover"
"#;
        let message = parse_ssdp_message(data.as_bytes()).unwrap();
        assert_eq!(message.request_line, "M-SEARCH * HTTP/1.1");
        assert_eq!(
            message.header("ST"),
            Some("urn:schemas-upnp-org:service:ContentDirectory:1")
        );
        assert_eq!(message.header("HOST"), Some("239.255.255.250:1900"));
        assert_eq!(message.header("MX"), Some("3"));
        assert_eq!(message.header("MAN"), Some("\"ssdp:discover\""));
    }

    #[test]
    fn test_format_rfc1123() {
        use chrono::TimeZone;

        let dt = Utc.with_ymd_and_hms(2025, 11, 24, 21, 28, 32).unwrap();
        let formatted = format_rfc1123(dt);
        assert_eq!(formatted, "Mon, 24 Nov 2025 21:28:32 GMT");
    }
}
