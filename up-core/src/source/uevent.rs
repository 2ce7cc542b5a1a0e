//! Kernel uevent watcher.
//!
//! One blocking worker thread on a NETLINK_KOBJECT_UEVENT socket. The
//! socket is polled with a 1 s timeout so a stop request is honored well
//! inside the daemon's shutdown budget. Events on the power_supply
//! subsystem map to per-source changes; add/remove traffic on the input,
//! bluetooth and usb subsystems triggers a re-enumeration, which is how
//! peripheral hot-plug is picked up.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use up_error::{Result, UpowerError};

use super::{EventSink, SourceEvent, Subscription};

/// Subsystems whose traffic the daemon cares about.
const WATCHED_SUBSYSTEMS: &[&str] = &["power_supply", "input", "bluetooth", "usb"];

/// Receive buffer; uevent datagrams are well under a page.
const RECV_BUF_SIZE: usize = 8192;

pub(super) fn spawn_watcher(sink: EventSink) -> Result<Subscription> {
    let fd = open_uevent_socket()?;
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();

    let handle = std::thread::Builder::new()
        .name("uevent-watcher".into())
        .spawn(move || {
            watch_loop(fd, worker_stop, sink);
            // SAFETY: fd was opened by open_uevent_socket and is owned by this thread.
            unsafe { libc::close(fd) };
            debug!("uevent watcher stopped");
        })
        .map_err(UpowerError::Io)?;

    Ok(Subscription::new(stop, handle))
}

fn open_uevent_socket() -> Result<RawFd> {
    // SAFETY: plain socket/bind syscalls with a zero-initialized sockaddr_nl;
    // the fd is checked before use and closed by the worker on exit.
    unsafe {
        let fd = libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        );
        if fd < 0 {
            return Err(UpowerError::AdapterUnavailable {
                adapter: "uevent",
                reason: format!("socket: {}", io::Error::last_os_error()),
            });
        }

        let mut addr: libc::sockaddr_nl = std::mem::zeroed();
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0;
        // group 1 is the kernel's uevent broadcast group
        addr.nl_groups = 1;

        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        );
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(UpowerError::AdapterUnavailable {
                adapter: "uevent",
                reason: format!("bind: {}", err),
            });
        }

        Ok(fd)
    }
}

fn watch_loop(fd: RawFd, stop: Arc<AtomicBool>, sink: EventSink) {
    let mut buf = [0u8; RECV_BUF_SIZE];

    while !stop.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd points at a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("uevent poll failed: {}", err);
            break;
        }
        if rc == 0 {
            continue;
        }

        // SAFETY: buf is a valid writable buffer of RECV_BUF_SIZE bytes.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("uevent recv failed: {}", err);
            break;
        }
        if n == 0 {
            continue;
        }

        if let Some(event) = parse_uevent(&buf[..n as usize]) {
            trace!(?event, "uevent");
            sink(event);
        }
    }
}

/// Decode one uevent datagram into a source event, or None for traffic the
/// daemon does not care about.
fn parse_uevent(data: &[u8]) -> Option<SourceEvent> {
    // udev re-broadcasts with its own framing; the daemon only wants the
    // kernel's own messages
    if data.starts_with(b"libudev") {
        return None;
    }

    let mut action = None;
    let mut devpath = None;
    let mut subsystem = None;

    for field in data.split(|b| *b == 0) {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        if let Some(value) = field.strip_prefix("ACTION=") {
            action = Some(value);
        } else if let Some(value) = field.strip_prefix("DEVPATH=") {
            devpath = Some(value);
        } else if let Some(value) = field.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(value);
        }
    }

    let subsystem = subsystem?;
    if !WATCHED_SUBSYSTEMS.contains(&subsystem) {
        return None;
    }
    let action = action?;

    if subsystem == "power_supply" {
        let sysname = devpath?.rsplit('/').next()?.to_string();
        return match action {
            "change" => Some(SourceEvent::Changed { sysname }),
            "add" | "remove" | "move" => Some(SourceEvent::Rescan),
            _ => None,
        };
    }

    // Peripheral buses: device (re-)creation means the power_supply view
    // may have shifted under us
    match action {
        "add" | "remove" => Some(SourceEvent::Rescan),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_parse_power_supply_change() {
        let data = frame(&[
            "change@/devices/LNXSYSTM:00/ACPI0003:00/power_supply/AC",
            "ACTION=change",
            "DEVPATH=/devices/LNXSYSTM:00/ACPI0003:00/power_supply/AC",
            "SUBSYSTEM=power_supply",
        ]);
        assert_eq!(
            parse_uevent(&data),
            Some(SourceEvent::Changed {
                sysname: "AC".into()
            })
        );
    }

    #[test]
    fn test_parse_power_supply_add_requests_rescan() {
        let data = frame(&[
            "add@/devices/foo/power_supply/hidpp_battery_0",
            "ACTION=add",
            "DEVPATH=/devices/foo/power_supply/hidpp_battery_0",
            "SUBSYSTEM=power_supply",
        ]);
        assert_eq!(parse_uevent(&data), Some(SourceEvent::Rescan));
    }

    #[test]
    fn test_parse_bluetooth_add_requests_rescan() {
        let data = frame(&[
            "add@/devices/bt/hci0",
            "ACTION=add",
            "DEVPATH=/devices/bt/hci0",
            "SUBSYSTEM=bluetooth",
        ]);
        assert_eq!(parse_uevent(&data), Some(SourceEvent::Rescan));
    }

    #[test]
    fn test_parse_ignores_other_subsystems_and_udev() {
        let data = frame(&[
            "change@/devices/pci0/drm/card0",
            "ACTION=change",
            "DEVPATH=/devices/pci0/drm/card0",
            "SUBSYSTEM=drm",
        ]);
        assert_eq!(parse_uevent(&data), None);
        assert_eq!(parse_uevent(b"libudev\x00whatever"), None);
    }
}
