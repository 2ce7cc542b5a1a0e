//! HID UPS adapter.
//!
//! USB UPSes speak the HID Power Device usage pages. The adapter scans the
//! hiddev character devices, keeps the ones whose vendor id is on the known
//! UPS allowlist, and reads a small set of well-known usages per refresh.
//! There is no kernel change notification worth having here; the backend
//! polls these sources on the configured cadence.

use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, trace};

use up_error::{Result, UpowerError};
use up_protocol::DeviceKind;

use super::{EventSink, RawSnapshot, RawSource, SourceAdapter, Subscription};

/// USB vendors known to ship HID Power Device UPSes
const UPS_VENDORS: &[u16] = &[
    0x0463, // MGE / Eaton
    0x051d, // APC
    0x03f0, // HP
    0x050d, // Belkin
    0x0764, // Cyber Power
    0x0d9f, // Powercom
    0x09ae, // Tripp Lite
];

/// How many hiddev minors to probe
const MAX_HIDDEV: u32 = 16;

// HID Power Device / Battery System usages (page << 16 | usage)
const USAGE_CHARGING: u32 = 0x0085_0044;
const USAGE_DISCHARGING: u32 = 0x0085_0045;
const USAGE_REMAINING_CAPACITY: u32 = 0x0085_0066;
const USAGE_RUNTIME_TO_EMPTY: u32 = 0x0085_0068;
const USAGE_AC_PRESENT: u32 = 0x0085_00d0;

/// struct hiddev_devinfo from linux/hiddev.h
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HiddevDevinfo {
    bustype: u32,
    busnum: u32,
    devnum: u32,
    ifnum: u32,
    vendor: i16,
    product: i16,
    version: i16,
    num_applications: u32,
}

/// struct hiddev_usage_ref from linux/hiddev.h
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HiddevUsageRef {
    report_type: u32,
    report_id: u32,
    field_index: u32,
    usage_index: u32,
    usage_code: u32,
    value: i32,
}

const HID_REPORT_TYPE_FEATURE: u32 = 3;
const HID_REPORT_ID_UNKNOWN: u32 = 0xffff_ffff;

// linux _IOC(dir, type, nr, size); dir: read = 2, write = 1
const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

const HIDIOCGDEVINFO: libc::c_ulong = ioc(2, b'H', 0x03, std::mem::size_of::<HiddevDevinfo>());
const HIDIOCGUSAGE: libc::c_ulong = ioc(3, b'H', 0x0b, std::mem::size_of::<HiddevUsageRef>());

pub struct HidUpsAdapter;

impl HidUpsAdapter {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &str) -> Option<RawFd> {
        let cpath = std::ffi::CString::new(path).ok()?;
        // SAFETY: open with a NUL-terminated path; fd checked before use.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            trace!("cannot open {}: {}", path, io::Error::last_os_error());
            None
        } else {
            Some(fd)
        }
    }

    fn devinfo(fd: RawFd) -> Option<HiddevDevinfo> {
        // SAFETY: the ioctl writes exactly sizeof(HiddevDevinfo) into info.
        unsafe {
            let mut info: HiddevDevinfo = std::mem::zeroed();
            if libc::ioctl(fd, HIDIOCGDEVINFO, &mut info as *mut HiddevDevinfo) < 0 {
                return None;
            }
            Some(info)
        }
    }

    fn read_usage(fd: RawFd, usage_code: u32) -> Option<i32> {
        // SAFETY: the ioctl reads and writes only the passed usage_ref.
        unsafe {
            let mut uref = HiddevUsageRef {
                report_type: HID_REPORT_TYPE_FEATURE,
                report_id: HID_REPORT_ID_UNKNOWN,
                field_index: 0,
                usage_index: 0,
                usage_code,
                value: 0,
            };
            if libc::ioctl(fd, HIDIOCGUSAGE, &mut uref as *mut HiddevUsageRef) < 0 {
                return None;
            }
            Some(uref.value)
        }
    }
}

impl Default for HidUpsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceAdapter for HidUpsAdapter {
    fn name(&self) -> &'static str {
        "hidups"
    }

    fn enumerate(&mut self) -> Result<Vec<RawSource>> {
        let mut sources = Vec::new();

        for minor in 0..MAX_HIDDEV {
            let path = format!("/dev/usb/hiddev{}", minor);
            let Some(fd) = Self::open(&path) else {
                continue;
            };
            let info = Self::devinfo(fd);
            // SAFETY: fd was opened above and is not used past this close.
            unsafe { libc::close(fd) };

            let Some(info) = info else { continue };
            let vendor = info.vendor as u16;
            if !UPS_VENDORS.contains(&vendor) {
                continue;
            }
            let product = info.product as u16;
            debug!(
                "found HID UPS at {} (vendor {:04x}, product {:04x})",
                path, vendor, product
            );
            sources.push(RawSource {
                identity: format!("ups-{:04x}-{:04x}", vendor, product),
                native_path: path,
                kind: DeviceKind::Ups,
                power_supply: true,
            });
        }

        Ok(sources)
    }

    fn subscribe(&mut self, _sink: EventSink) -> Result<Subscription> {
        // Feature reports are poll-only
        Err(UpowerError::EventsNotSupported("hidups"))
    }

    fn refresh(&self, source: &RawSource) -> Result<RawSnapshot> {
        let Some(fd) = Self::open(&source.native_path) else {
            return Err(UpowerError::SourceNotFound(source.identity.clone()));
        };

        let mut snap = RawSnapshot::new();
        snap.insert_str("type", "UPS");
        snap.insert_str("present", "1");

        let charging = Self::read_usage(fd, USAGE_CHARGING).unwrap_or(0) != 0;
        let discharging = Self::read_usage(fd, USAGE_DISCHARGING).unwrap_or(0) != 0;
        snap.insert_str(
            "status",
            if charging {
                "Charging"
            } else if discharging {
                "Discharging"
            } else {
                "Unknown"
            },
        );

        if let Some(ac) = Self::read_usage(fd, USAGE_AC_PRESENT) {
            snap.insert_str("online", if ac != 0 { "1" } else { "0" });
        }
        if let Some(capacity) = Self::read_usage(fd, USAGE_REMAINING_CAPACITY) {
            snap.insert_str("capacity", &capacity.to_string());
        }
        if let Some(runtime) = Self::read_usage(fd, USAGE_RUNTIME_TO_EMPTY) {
            if runtime > 0 {
                snap.insert_str("runtime_to_empty", &runtime.to_string());
            }
        }

        // SAFETY: fd was opened at the top of this function.
        unsafe { libc::close(fd) };
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_kernel_headers() {
        // Spot values computed from linux/hiddev.h definitions
        assert_eq!(HIDIOCGDEVINFO, 0x801c_4803);
        assert_eq!(HIDIOCGUSAGE, 0xc018_480b);
    }
}
