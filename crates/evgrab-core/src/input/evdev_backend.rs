// Evgrab Input Layer - evdev Backend
// Kernel input devices opened read-only and queried through evdev ioctls

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use super::event::RawEvent;
use super::source::{Capabilities, DeviceBackend, DeviceState, EventBatch, EventSource};
use crate::codes::{EV_ABS, EV_KEY, EV_LED, EV_SW};

/// Events read per `fetch`
const READ_BATCH: usize = 64;

const EVENT_SIZE: usize = mem::size_of::<libc::input_event>();

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

// Generic _IOC layout (x86, arm, riscv): dir:2 size:14 type:8 nr:8
const fn evdev_ioc(dir: u32, nr: u32, size: usize) -> libc::Ioctl {
    ((dir << 30) | ((size as u32) << 16) | ((b'E' as u32) << 8) | nr) as libc::Ioctl
}

const EVIOCGNAME: u32 = 0x06;
const EVIOCGKEY: u32 = 0x18;
const EVIOCGLED: u32 = 0x19;
const EVIOCGSW: u32 = 0x1b;
const EVIOCGBIT: u32 = 0x20;
const EVIOCGABS: u32 = 0x40;
const EVIOCGRAB: libc::Ioctl = evdev_ioc(IOC_WRITE, 0x90, mem::size_of::<libc::c_int>());

/// Backend opening `/dev/input/event*` nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvdevBackend;

impl DeviceBackend for EvdevBackend {
    type Source = EvdevSource;

    fn open(&self, path: &Path) -> io::Result<EvdevSource> {
        // Never opened for writing: nothing is ever injected into the device
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(EvdevSource { file })
    }
}

/// An evdev device opened read-only in non-blocking mode.
pub struct EvdevSource {
    file: File,
}

impl AsRawFd for EvdevSource {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl EvdevSource {
    /// Run a read ioctl filling `buf`, returning how many bytes the kernel wrote
    fn ioctl_read(&self, nr: u32, buf: &mut [u8]) -> io::Result<usize> {
        let request = evdev_ioc(IOC_READ, nr, buf.len());
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, buf.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((rc as usize).min(buf.len()))
    }

    /// Codes whose bit is set in the bitmask returned by `nr`
    fn bits(&self, nr: u32, count: usize) -> io::Result<BTreeSet<u16>> {
        let mut buf = vec![0u8; count.div_ceil(8)];
        let len = self.ioctl_read(nr, &mut buf)?;
        Ok(set_bits(&buf[..len]))
    }

    fn supported(&self, event_type: u16, count: usize) -> io::Result<BTreeSet<u16>> {
        self.bits(EVIOCGBIT + u32::from(event_type), count)
    }

    fn name(&self) -> Option<String> {
        let mut buf = [0u8; 256];
        let len = self.ioctl_read(EVIOCGNAME, &mut buf).ok()?;
        let name = buf[..len].split(|b| *b == 0).next().unwrap_or_default();
        Some(String::from_utf8_lossy(name).into_owned())
    }

    fn abs_value(&self, axis: u16) -> io::Result<i32> {
        let mut info = libc::input_absinfo {
            value: 0,
            minimum: 0,
            maximum: 0,
            fuzz: 0,
            flat: 0,
            resolution: 0,
        };
        let request = evdev_ioc(
            IOC_READ,
            EVIOCGABS + u32::from(axis),
            mem::size_of::<libc::input_absinfo>(),
        );
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, &mut info) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(info.value)
    }

    fn set_grab(&mut self, grab: bool) -> io::Result<()> {
        let value = libc::c_int::from(grab);
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), EVIOCGRAB, value) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl EventSource for EvdevSource {
    fn fetch(&mut self) -> io::Result<EventBatch> {
        let mut buf = [0u8; EVENT_SIZE * READ_BATCH];
        let read = self.file.read(&mut buf)?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(buf[..read]
            .chunks_exact(EVENT_SIZE)
            .map(|chunk| {
                let raw: libc::input_event =
                    unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast()) };
                RawEvent::from(evdev::InputEvent::from(raw))
            })
            .collect())
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        let event_types = self.bits(EVIOCGBIT, libc::EV_CNT)?;
        let of_type = |event_type: u16, count: usize| {
            if event_types.contains(&event_type) {
                self.supported(event_type, count)
            } else {
                Ok(BTreeSet::new())
            }
        };

        Ok(Capabilities {
            name: self.name(),
            keys: of_type(EV_KEY, libc::KEY_CNT)?,
            leds: of_type(EV_LED, libc::LED_CNT)?,
            switches: of_type(EV_SW, libc::SW_CNT)?,
            absolute_axes: of_type(EV_ABS, libc::ABS_CNT)?,
            event_types,
        })
    }

    fn current_state(&self) -> io::Result<DeviceState> {
        let event_types = self.bits(EVIOCGBIT, libc::EV_CNT)?;
        let mut state = DeviceState::default();

        if event_types.contains(&EV_KEY) {
            state.keys = self.bits(EVIOCGKEY, libc::KEY_CNT)?;
        }
        if event_types.contains(&EV_LED) {
            state.leds = self.bits(EVIOCGLED, libc::LED_CNT)?;
        }
        if event_types.contains(&EV_SW) {
            state.switches = self.bits(EVIOCGSW, libc::SW_CNT)?;
        }
        if event_types.contains(&EV_ABS) {
            for axis in self.supported(EV_ABS, libc::ABS_CNT)? {
                state.absolute.insert(axis, self.abs_value(axis)?);
            }
        }
        Ok(state)
    }

    fn grab(&mut self) -> io::Result<()> {
        self.set_grab(true)
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.set_grab(false)
    }
}

fn set_bits(mask: &[u8]) -> BTreeSet<u16> {
    mask.iter()
        .enumerate()
        .flat_map(|(byte, &bits)| {
            (0..8u16)
                .filter(move |&bit| bits & (1u8 << bit) != 0)
                .map(move |bit| byte as u16 * 8 + bit)
        })
        .collect()
}
