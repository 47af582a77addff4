//! A tiny embedded syslog receiver.
//!
//! Purely an operational convenience for containers that have no other
//! syslog collector: bind any combination of TCP, UDP, and a UNIX datagram
//! socket, and print whatever lines show up on stdout. Not a replacement
//! for a real syslog daemon — no persistence, no rotation, no forwarding.

use std::io::{BufRead, BufReader, Read};
use std::net::{TcpListener, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;

use crate::config::{LogFormat, SyslogConfig};

/// Best-effort extraction of (host, message) out of one syslog line,
/// handling RFC 3164 and RFC 5424 framing; `Auto` just tries 5424 first
/// and falls back to treating the whole (PRI-stripped) line as the
/// message. RFC 6587's octet-counting is handled by the TCP reader before
/// a line ever reaches this function.
pub fn format_line(format: LogFormat, raw: &str, peer: &str) -> String {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
    let body = strip_priority(raw.trim_end_matches(['\r', '\n']));
    let (host, content) = split_host_and_message(format, body);
    format!("{now} {peer} {host} {content}")
}

fn strip_priority(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix('<')
        && let Some(end) = rest.find('>')
    {
        return &rest[end + 1..];
    }
    line
}

fn split_host_and_message(format: LogFormat, body: &str) -> (String, String) {
    let effective = match format {
        LogFormat::Auto if body.starts_with(|c: char| c.is_ascii_digit()) => LogFormat::Rfc5424,
        LogFormat::Auto => LogFormat::Rfc3164,
        other => other,
    };

    match effective {
        LogFormat::Rfc5424 => {
            // VERSION TIMESTAMP HOST APP PROCID MSGID [SD] MSG
            let mut parts = body.splitn(7, ' ');
            let _version = parts.next();
            let _timestamp = parts.next();
            let host = parts.next().unwrap_or("-").to_string();
            let rest: String = parts.collect::<Vec<_>>().join(" ");
            (host, rest)
        }
        _ => {
            // Mmm dd hh:mm:ss HOST TAG: MSG
            let mut parts = body.splitn(5, ' ');
            let _month = parts.next();
            let _day = parts.next();
            let _time = parts.next();
            let host = parts.next().unwrap_or("-").to_string();
            let rest: String = parts.collect::<Vec<_>>().join(" ");
            (host, rest)
        }
    }
}

/// Octet-counted TCP framing per RFC 6587: `"<len> <payload>"` repeated.
fn read_octet_counted(reader: &mut impl BufRead, out: &mut String) -> std::io::Result<bool> {
    let mut len_buf = Vec::new();
    let n = reader.read_until(b' ', &mut len_buf)?;
    if n == 0 {
        return Ok(false);
    }
    let len_str = String::from_utf8_lossy(&len_buf);
    let Ok(len) = len_str.trim().parse::<usize>() else {
        return Ok(false);
    };
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    out.push_str(&String::from_utf8_lossy(&payload));
    Ok(true)
}

pub struct SyslogSink {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SyslogSink {
    /// Start listeners for every transport configured, or return `None` if
    /// none were requested.
    pub fn start(cfg: &SyslogConfig) -> Option<SyslogSink> {
        if !cfg.enabled() {
            return None;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        if let Some(addr) = &cfg.tcp {
            match TcpListener::bind(addr) {
                Ok(listener) => handles.push(spawn_tcp(listener, cfg.format, Arc::clone(&shutdown))),
                Err(e) => warn!("cannot bind syslog tcp {addr}: {e}"),
            }
        }
        if let Some(addr) = &cfg.udp {
            match UdpSocket::bind(addr) {
                Ok(socket) => handles.push(spawn_udp(socket, cfg.format, Arc::clone(&shutdown))),
                Err(e) => warn!("cannot bind syslog udp {addr}: {e}"),
            }
        }
        if let Some(path) = &cfg.unix {
            let path = PathBuf::from(path);
            let _ = std::fs::remove_file(&path);
            match UnixDatagram::bind(&path) {
                Ok(socket) => handles.push(spawn_unix(socket, cfg.format, Arc::clone(&shutdown))),
                Err(e) => warn!("cannot bind syslog unix socket {}: {e}", path.display()),
            }
        }

        Some(SyslogSink { shutdown, handles })
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn_tcp(listener: TcpListener, format: LogFormat, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    listener
        .set_nonblocking(true)
        .expect("setting tcp listener nonblocking");
    thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let shutdown = Arc::clone(&shutdown);
                    thread::spawn(move || {
                        let mut reader = BufReader::new(stream);
                        loop {
                            if shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            let mut line = String::new();
                            let ok = if format == LogFormat::Rfc6587 {
                                read_octet_counted(&mut reader, &mut line).unwrap_or(false)
                            } else {
                                matches!(reader.read_line(&mut line), Ok(n) if n > 0)
                            };
                            if !ok {
                                break;
                            }
                            println!("{}", format_line(format, &line, &peer.to_string()));
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(std::time::Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("syslog tcp accept error: {e}");
                    break;
                }
            }
        }
    })
}

fn spawn_udp(socket: UdpSocket, format: LogFormat, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    socket
        .set_read_timeout(Some(std::time::Duration::from_millis(200)))
        .expect("setting udp read timeout");
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while !shutdown.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let line = String::from_utf8_lossy(&buf[..n]);
                    println!("{}", format_line(format, &line, &peer.to_string()));
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("syslog udp recv error: {e}");
                    break;
                }
            }
        }
    })
}

fn spawn_unix(socket: UnixDatagram, format: LogFormat, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    socket
        .set_read_timeout(Some(std::time::Duration::from_millis(200)))
        .expect("setting unix datagram read timeout");
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while !shutdown.load(Ordering::SeqCst) {
            match socket.recv(&mut buf) {
                Ok(n) => {
                    let line = String::from_utf8_lossy(&buf[..n]);
                    println!("{}", format_line(format, &line, "unix"));
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("syslog unix recv error: {e}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_rfc3164_line() {
        let line = "<34>Oct 11 22:14:15 myhost su: 'su root' failed";
        let formatted = format_line(LogFormat::Rfc3164, line, "127.0.0.1:514");
        assert!(formatted.contains("myhost"));
        assert!(formatted.contains("su: 'su root' failed"));
    }

    #[test]
    fn formats_rfc5424_line() {
        let line = "<34>1 2003-10-11T22:14:15.003Z mymachine su - ID47 - trouble";
        let formatted = format_line(LogFormat::Rfc5424, line, "127.0.0.1:514");
        assert!(formatted.contains("mymachine"));
        assert!(formatted.contains("trouble"));
    }
}
