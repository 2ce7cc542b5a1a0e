//! OpenBSD APM adapter.
//!
//! A single character device (`/dev/apm`) exposes the whole power picture
//! through one ioctl, so this adapter fabricates two synthetic sources
//! (`/ac` and `/batt`) and translates the composite power-info struct into
//! the shared attribute vocabulary. Change notifications come from a
//! kqueue worker blocked on the same device.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use up_error::{Result, UpowerError};
use up_protocol::DeviceKind;

use super::{EventSink, RawSnapshot, RawSource, SourceAdapter, SourceEvent, Subscription};

const APM_DEVICE: &str = "/dev/apm";

// machine/apmvar.h battery_state values
const APM_BATT_HIGH: u8 = 0;
const APM_BATT_LOW: u8 = 1;
const APM_BATT_CRITICAL: u8 = 2;
const APM_BATT_CHARGING: u8 = 3;
const APM_BATTERY_ABSENT: u8 = 4;

// machine/apmvar.h ac_state values
const APM_AC_ON: u8 = 1;

/// struct apm_power_info from machine/apmvar.h
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ApmPowerInfo {
    battery_state: u8,
    ac_state: u8,
    battery_life: u8,
    spare1: u8,
    minutes_left: u32,
    spare2: [u32; 6],
}

/// _IOR('A', 3, struct apm_power_info): IOC_OUT | size<<16 | 'A'<<8 | 3
const APM_IOC_GETPOWER: libc::c_ulong = 0x4000_0000
    | ((std::mem::size_of::<ApmPowerInfo>() as libc::c_ulong & 0x1fff) << 16)
    | (b'A' as libc::c_ulong) << 8
    | 3;

pub struct ApmAdapter {
    fd: RawFd,
}

impl ApmAdapter {
    pub fn new() -> Result<Self> {
        // SAFETY: open with a static NUL-terminated path; fd checked below.
        let fd = unsafe { libc::open(b"/dev/apm\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        if fd < 0 {
            return Err(UpowerError::AdapterUnavailable {
                adapter: "apm",
                reason: format!("cannot open {}: {}", APM_DEVICE, io::Error::last_os_error()),
            });
        }
        debug!("apm adapter opened {} (fd {})", APM_DEVICE, fd);
        Ok(Self { fd })
    }

    fn read_power_info(&self) -> Result<ApmPowerInfo> {
        // SAFETY: the ioctl writes exactly sizeof(ApmPowerInfo) bytes into info.
        unsafe {
            let mut info: ApmPowerInfo = std::mem::zeroed();
            if libc::ioctl(self.fd, APM_IOC_GETPOWER, &mut info as *mut ApmPowerInfo) < 0 {
                return Err(UpowerError::AdapterUnavailable {
                    adapter: "apm",
                    reason: format!("APM_IOC_GETPOWER: {}", io::Error::last_os_error()),
                });
            }
            Ok(info)
        }
    }
}

impl Drop for ApmAdapter {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this adapter and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

fn battery_status(state: u8) -> &'static str {
    match state {
        APM_BATT_HIGH => "Full",
        APM_BATT_LOW => "Discharging",
        APM_BATT_CRITICAL => "Empty",
        APM_BATT_CHARGING => "Charging",
        APM_BATTERY_ABSENT => "Empty",
        _ => "Unknown",
    }
}

impl SourceAdapter for ApmAdapter {
    fn name(&self) -> &'static str {
        "apm"
    }

    fn enumerate(&mut self) -> Result<Vec<RawSource>> {
        Ok(vec![
            RawSource {
                identity: "/ac".into(),
                native_path: "/ac".into(),
                kind: DeviceKind::LinePower,
                power_supply: true,
            },
            RawSource {
                identity: "/batt".into(),
                native_path: "/batt".into(),
                kind: DeviceKind::Battery,
                power_supply: true,
            },
        ])
    }

    fn subscribe(&mut self, sink: EventSink) -> Result<Subscription> {
        let fd = self.fd;
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("apm-watcher".into())
            .spawn(move || {
                kevent_loop(fd, worker_stop, sink);
                debug!("apm watcher stopped");
            })
            .map_err(UpowerError::Io)?;

        Ok(Subscription::new(stop, handle))
    }

    fn refresh(&self, source: &RawSource) -> Result<RawSnapshot> {
        let info = self.read_power_info()?;
        let mut snap = RawSnapshot::new();

        match source.identity.as_str() {
            "/ac" => {
                snap.insert_str("type", "Mains");
                snap.insert_str("online", if info.ac_state == APM_AC_ON { "1" } else { "0" });
            }
            "/batt" => {
                snap.insert_str("type", "Battery");
                snap.insert_str(
                    "present",
                    if info.battery_state == APM_BATTERY_ABSENT { "0" } else { "1" },
                );
                snap.insert_str("status", battery_status(info.battery_state));
                snap.insert_str("capacity", &info.battery_life.to_string());
                // minutes_left is ~0u32 when the firmware has no estimate
                if info.minutes_left != u32::MAX && info.minutes_left > 0 {
                    snap.insert_str("minutes_left", &info.minutes_left.to_string());
                }
            }
            other => return Err(UpowerError::SourceNotFound(other.to_string())),
        }

        Ok(snap)
    }
}

/// Blocking kqueue wait on the apm fd; power-change events wake both
/// synthetic sources.
fn kevent_loop(fd: RawFd, stop: Arc<AtomicBool>, sink: EventSink) {
    // SAFETY: kqueue/kevent with properly initialized structs; kq is closed
    // on every exit path from this function.
    unsafe {
        let kq = libc::kqueue();
        if kq < 0 {
            warn!("kqueue failed: {}", io::Error::last_os_error());
            return;
        }

        let mut ev: libc::kevent = std::mem::zeroed();
        ev.ident = fd as libc::uintptr_t;
        ev.filter = libc::EVFILT_READ;
        ev.flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
        if libc::kevent(kq, &ev, 1, std::ptr::null_mut(), 0, std::ptr::null()) < 0 {
            warn!("kevent register failed: {}", io::Error::last_os_error());
            libc::close(kq);
            return;
        }

        let timeout = libc::timespec {
            tv_sec: 1,
            tv_nsec: 0,
        };

        while !stop.load(Ordering::SeqCst) {
            let mut out: libc::kevent = std::mem::zeroed();
            let rc = libc::kevent(kq, std::ptr::null(), 0, &mut out, 1, &timeout);
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("kevent wait failed: {}", err);
                break;
            }
            if rc == 0 {
                continue;
            }
            if out.ident == fd as libc::uintptr_t {
                sink(SourceEvent::Changed {
                    sysname: "ac".into(),
                });
                sink(SourceEvent::Changed {
                    sysname: "batt".into(),
                });
            }
        }

        libc::close(kq);
    }
}
