// Scripted device backend shared by the integration tests.
//
// Every opened source owns one end of a UnixStream pair; queuing events for a
// device writes a byte to the other end so the real multiplexer sees it ready.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use evgrab_core::codes::{EV_KEY, EV_SYN};
use evgrab_core::{
    Capabilities, Decoded, DeviceBackend, DeviceState, EventSink, EventSource, RawEvent,
    ShutdownHandle,
};

pub fn key(code: u16, value: i32) -> RawEvent {
    RawEvent::new(EV_KEY, code, value)
}

struct Opened {
    path: PathBuf,
    queue: VecDeque<io::Result<Vec<RawEvent>>>,
    bell: UnixStream,
}

#[derive(Default)]
pub struct World {
    next_id: usize,
    opened: HashMap<usize, Opened>,
    grabbed: HashSet<PathBuf>,
    pub missing: HashSet<PathBuf>,
    pub states: HashMap<PathBuf, DeviceState>,
    pub grabs: Vec<PathBuf>,
    pub ungrabs: Vec<PathBuf>,
    pub closes: Vec<PathBuf>,
}

impl World {
    pub fn new() -> Rc<RefCell<World>> {
        Rc::new(RefCell::new(World::default()))
    }

    fn first_open(&mut self, path: &Path) -> &mut Opened {
        let id = self
            .opened
            .iter()
            .filter(|(_, opened)| opened.path == path)
            .map(|(id, _)| *id)
            .min()
            .unwrap_or_else(|| panic!("{} is not open", path.display()));
        self.opened.get_mut(&id).unwrap()
    }

    /// Queue one read's worth of events on the first handle open on `path`
    pub fn push(&mut self, path: &str, events: Vec<RawEvent>) {
        self.push_result(path, Ok(events));
    }

    /// Make the next read on `path` fail
    pub fn push_error(&mut self, path: &str, errno: i32) {
        self.push_result(path, Err(io::Error::from_raw_os_error(errno)));
    }

    fn push_result(&mut self, path: &str, batch: io::Result<Vec<RawEvent>>) {
        let opened = self.first_open(Path::new(path));
        opened.queue.push_back(batch);
        opened.bell.write_all(&[1]).unwrap();
    }

    pub fn is_grabbed(&self, path: &str) -> bool {
        self.grabbed.contains(Path::new(path))
    }

    pub fn grabbed_count(&self) -> usize {
        self.grabbed.len()
    }

    pub fn open_count(&self) -> usize {
        self.opened.len()
    }
}

pub struct FakeSource {
    id: usize,
    path: PathBuf,
    world: Rc<RefCell<World>>,
    readiness: UnixStream,
}

impl AsRawFd for FakeSource {
    fn as_raw_fd(&self) -> RawFd {
        self.readiness.as_raw_fd()
    }
}

impl FakeSource {
    fn drain_readiness(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.readiness.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl EventSource for FakeSource {
    fn fetch(&mut self) -> io::Result<evgrab_core::input::EventBatch> {
        let batch = {
            let mut world = self.world.borrow_mut();
            world
                .opened
                .get_mut(&self.id)
                .and_then(|opened| opened.queue.pop_front())
        };
        match batch {
            Some(batch) => batch.map(|events| events.into_iter().collect()),
            None => {
                self.drain_readiness();
                Err(io::ErrorKind::WouldBlock.into())
            }
        }
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        Ok(Capabilities {
            name: Some(format!("Fake {}", self.path.display())),
            event_types: [EV_SYN, EV_KEY].into_iter().collect(),
            keys: (1..=120).collect::<BTreeSet<u16>>(),
            ..Capabilities::default()
        })
    }

    fn current_state(&self) -> io::Result<DeviceState> {
        Ok(self
            .world
            .borrow()
            .states
            .get(&self.path)
            .cloned()
            .unwrap_or_default())
    }

    fn grab(&mut self) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        if !world.grabbed.insert(self.path.clone()) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        world.grabs.push(self.path.clone());
        Ok(())
    }

    fn ungrab(&mut self) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        world.grabbed.remove(&self.path);
        world.ungrabs.push(self.path.clone());
        Ok(())
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        let mut world = self.world.borrow_mut();
        world.opened.remove(&self.id);
        world.closes.push(self.path.clone());
    }
}

pub struct FakeBackend {
    world: Rc<RefCell<World>>,
}

impl FakeBackend {
    pub fn new(world: &Rc<RefCell<World>>) -> Self {
        Self {
            world: world.clone(),
        }
    }
}

impl DeviceBackend for FakeBackend {
    type Source = FakeSource;

    fn open(&self, path: &Path) -> io::Result<FakeSource> {
        let mut world = self.world.borrow_mut();
        if world.missing.contains(path) {
            return Err(io::ErrorKind::NotFound.into());
        }
        let (readiness, bell) = UnixStream::pair()?;
        readiness.set_nonblocking(true)?;

        let id = world.next_id;
        world.next_id += 1;
        world.opened.insert(
            id,
            Opened {
                path: path.to_path_buf(),
                queue: VecDeque::new(),
                bell,
            },
        );
        Ok(FakeSource {
            id,
            path: path.to_path_buf(),
            world: self.world.clone(),
            readiness,
        })
    }
}

/// Sink that records everything and can stop the loop after N records.
#[derive(Default)]
pub struct Collector {
    pub announced: Vec<PathBuf>,
    pub records: Vec<(PathBuf, Decoded)>,
    pub stop_after: Option<usize>,
    pub shutdown: Option<ShutdownHandle>,
}

impl Collector {
    pub fn rendered(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|(path, decoded)| {
                format!("{} {} {}", path.display(), decoded.status, decoded.record)
            })
            .collect()
    }
}

impl EventSink for Collector {
    fn announce(&mut self, path: &Path) {
        self.announced.push(path.to_path_buf());
    }

    fn emit(&mut self, path: &Path, decoded: &Decoded) {
        self.records.push((path.to_path_buf(), decoded.clone()));
        if Some(self.records.len()) == self.stop_after {
            if let Some(shutdown) = &self.shutdown {
                shutdown.request();
            }
        }
    }
}
