use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use socket2::{SockAddr, Socket};

use crate::SocketToMe;
use crate::SysInfo;
use crate::ssdp::{
    ALL_SEARCH_TARGET, Announcement, HTTP_METHOD_SEARCH, SsdpMessage, announcements,
    format_rfc1123, notify_alive, notify_byebye, parse_request_line, parse_ssdp_message,
    search_response,
};

// Devices on the same network wake up together; the spread keeps the group
// from bursting in lockstep.
const JITTER_UPPER_MILLIS: u64 = 300;

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..JITTER_UPPER_MILLIS))
}

/// Advertise the device until the shutdown channel fires, then revoke the
/// announcements with a byebye burst. Send failures during normal operation
/// are logged and dropped; the next tick repairs discovery.
pub fn advertise(
    sys_info: &SysInfo,
    socket: &mut dyn SocketToMe,
    group: &SockAddr,
    shutdown: &Receiver<()>,
) {
    info!(
        "start advertising uuid:{} every {:?}",
        sys_info.device_uuid, sys_info.interval
    );

    loop {
        match shutdown.recv_timeout(sys_info.interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        send_alive_burst(sys_info, socket, group);
    }

    send_byebye_burst(sys_info, socket, group);
    info!("end advertising");
}

fn send_alive_burst(sys_info: &SysInfo, socket: &mut dyn SocketToMe, group: &SockAddr) {
    for (i, record) in announcements(sys_info).iter().enumerate() {
        if i > 0 {
            thread::sleep(jitter());
        }
        debug!("notify alive {}", record.usn);
        let advertisement = notify_alive(sys_info, record);
        if let Err(err) = socket.send_to(advertisement.as_bytes(), group) {
            error!("error sending advertisement: {err}");
        }
    }
}

/// Best effort: a failed byebye ends the sequence, the cache-control
/// lifetime cleans up after us anyway.
fn send_byebye_burst(sys_info: &SysInfo, socket: &mut dyn SocketToMe, group: &SockAddr) {
    for (i, record) in announcements(sys_info).iter().enumerate() {
        if i > 0 {
            thread::sleep(jitter());
        }
        debug!("notify byebye {}", record.usn);
        let advertisement = notify_byebye(record);
        if let Err(err) = socket.send_to(advertisement.as_bytes(), group) {
            error!("error sending byebye: {err}");
            return;
        }
    }
}

/// An accepted M-SEARCH, stamped with where it came from.
#[derive(Debug)]
pub struct SearchRequest {
    pub message: SsdpMessage,
    pub src: SocketAddr,
}

/// One reader per socket. Datagrams that do not decode as an M-SEARCH
/// request (peer NOTIFYs, stray responses, noise) are dropped without
/// comment beyond trace level. The socket must carry a read timeout or the
/// shutdown flag is never observed.
pub fn read_search_requests(
    socket: &Socket,
    requests: &Sender<SearchRequest>,
    shutdown: &Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut buffer = Vec::with_capacity(1024);
        match socket.recv_from(buffer.spare_capacity_mut()) {
            Ok((received, src)) => {
                unsafe {
                    buffer.set_len(received);
                }

                let Some(src) = src.as_socket() else {
                    trace!("dropping datagram from a non-IP source");
                    continue;
                };

                let message = match parse_ssdp_message(&buffer) {
                    Ok(message) => message,
                    Err(err) => {
                        trace!("dropping datagram from {src}: {err}");
                        continue;
                    }
                };

                match parse_request_line(&message.request_line) {
                    Ok((method, _, _)) if method == HTTP_METHOD_SEARCH => {
                        if requests.send(SearchRequest { message, src }).is_err() {
                            // dispatcher is gone, nothing left to do
                            return;
                        }
                    }
                    Ok(_) => {
                        trace!("ignoring {} from {src}", message.request_line);
                    }
                    Err(err) => {
                        trace!("dropping datagram from {src}: {err}");
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
            }
            Err(err) => {
                error!("error reading search socket: {err}");
                return;
            }
        }
    }
}

/// Drain the shared request channel and answer each search with the records
/// its ST matches, one datagram per record.
pub fn reply_search(
    sys_info: &SysInfo,
    requests: &Receiver<SearchRequest>,
    socket: &mut dyn SocketToMe,
    shutdown: &Arc<AtomicBool>,
) {
    info!("start replying to searches");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match requests.recv_timeout(Duration::from_millis(100)) {
            Ok(request) => handle_search_request(sys_info, &request, socket),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("end replying to searches");
}

/// Which records answer which search target: `ssdp:all` gets every record;
/// anything else gets exactly the records whose NT equals the target, which
/// covers rootdevice, our uuid, our device type and our service types.
/// Everything else gets silence.
fn matching_records(sys_info: &SysInfo, st: &str) -> Vec<Announcement> {
    let records = announcements(sys_info);
    if st == ALL_SEARCH_TARGET {
        return records;
    }
    records.into_iter().filter(|r| r.nt == st).collect()
}

pub fn handle_search_request(
    sys_info: &SysInfo,
    request: &SearchRequest,
    socket: &mut dyn SocketToMe,
) {
    let Some(st) = request.message.header("ST") else {
        debug!("search from {} without ST header, ignoring", request.src);
        return;
    };
    let st = st.to_string();

    let records = matching_records(sys_info, &st);
    if records.is_empty() {
        trace!("not our search target: {st}");
        return;
    }

    info!("search from {}: {st}", request.src);

    let response_date = format_rfc1123(Utc::now());
    let src = SockAddr::from(request.src);
    for record in &records {
        debug!("respond {}", record.usn);
        let response = search_response(sys_info, record, &response_date);
        if let Err(err) = socket.send_to(response.as_bytes(), &src) {
            // UDP; discovery is self-repairing, no retry
            warn!("error sending search response to {}: {err}", request.src);
        }
    }
}
