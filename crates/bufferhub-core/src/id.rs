//! Buffer identifiers, the id generator seam and the shared id counter

use crate::config::HubConfig;
use crate::shm::SharedMemory;
use crate::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// System-unique buffer identifier
///
/// `0` is reserved: it marks buffers whose id was never specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

impl BufferId {
    /// The "not specified" id
    pub const INVALID: BufferId = BufferId(0);

    /// Wrap a raw id, rejecting the reserved value
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Raw value
    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<BufferId> for u32 {
    fn from(id: BufferId) -> u32 {
        id.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of buffer ids
pub trait IdGenerator: Send + Sync {
    /// Hand out an id that is not currently in use. Never returns
    /// [`BufferId::INVALID`].
    fn allocate(&self) -> Result<BufferId>;

    /// Return an id to the generator. Returns false if it was not in use.
    fn free(&self, id: BufferId) -> bool;
}

const MAGIC: u32 = 0x4248_4944; // "BHID"
const VERSION: u32 = 1;

/// Create/open rounds before giving up on a region that is mid-setup or
/// mid-teardown in another process
const OPEN_ATTEMPTS: u32 = 64;

/// Header of the id counter region
#[repr(C)]
struct IdCounterHeader {
    magic: AtomicU32,
    version: u32,
    /// Last id handed out by any process, 0 before the first
    last_id: AtomicU32,
    /// Live generators across all processes
    mapping_count: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<IdCounterHeader>() == 16);

const fn next_after(last: u32) -> u32 {
    if last == u32::MAX {
        1
    } else {
        last + 1
    }
}

/// Id generator backed by a counter in shared memory
///
/// Every generator opened under the same name prefix, in any process, draws
/// from the same counter, so ids increase system-wide and wrap from
/// `u32::MAX` back to 1. The region lives while at least one generator has
/// it mapped.
pub struct BufferHubIdGenerator {
    shm: SharedMemory,
    /// Ids this generator handed out and has not seen freed
    issued: Mutex<HashSet<u32>>,
}

impl BufferHubIdGenerator {
    /// Map the id counter of `config`'s prefix, creating it on first use
    #[tracing::instrument(skip(config), fields(prefix = %config.shm_prefix))]
    pub fn open_or_create(config: &HubConfig) -> Result<Self> {
        let name = config.id_shm_name();
        let mut last_error = None;

        for _ in 0..OPEN_ATTEMPTS {
            match Self::create_region(&name) {
                Ok(shm) => {
                    debug!(name = %name, "created id counter");
                    return Ok(Self::from_region(shm));
                }
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            match Self::open_region(&name) {
                Ok(shm) => return Ok(Self::from_region(shm)),
                Err(e) => {
                    debug!(name = %name, error = %e, "id counter not ready, retrying");
                    last_error = Some(e);
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::SharedMemory(format!("{}: cannot map id counter", name))))
    }

    fn from_region(shm: SharedMemory) -> Self {
        Self {
            shm,
            issued: Mutex::new(HashSet::new()),
        }
    }

    fn create_region(name: &str) -> Result<SharedMemory> {
        let mut shm = SharedMemory::create(name, std::mem::size_of::<IdCounterHeader>())?;
        let header = shm.as_mut_ptr() as *mut IdCounterHeader;
        // Safety: fresh region sized for the header; openers wait for the magic.
        unsafe {
            ptr::addr_of_mut!((*header).version).write(VERSION);
            let header = &*header;
            header.last_id.store(0, Ordering::Relaxed);
            header.mapping_count.store(1, Ordering::Relaxed);
            header.magic.store(MAGIC, Ordering::Release);
        }
        shm.set_owner(false);
        Ok(shm)
    }

    fn open_region(name: &str) -> Result<SharedMemory> {
        let shm = SharedMemory::open(name)?;
        if shm.size() < std::mem::size_of::<IdCounterHeader>() {
            return Err(Error::InvalidMetadata(format!(
                "{}: id counter region of {} bytes is too small",
                name,
                shm.size()
            )));
        }

        // Safety: size checked above.
        let header = unsafe { &*(shm.as_ptr() as *const IdCounterHeader) };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MAGIC {
            return Err(Error::InvalidMetadata(format!(
                "{}: bad id counter magic {:#x}",
                name, magic
            )));
        }
        if header.version != VERSION {
            return Err(Error::InvalidMetadata(format!(
                "{}: id counter version mismatch: expected {}, got {}",
                name, VERSION, header.version
            )));
        }
        header
            .mapping_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .map_err(|_| Error::SharedMemory(format!("{}: id counter is being removed", name)))?;
        Ok(shm)
    }

    fn header(&self) -> &IdCounterHeader {
        // Safety: both constructors verified the mapping holds a header.
        unsafe { &*(self.shm.as_ptr() as *const IdCounterHeader) }
    }

    /// Name of the counter's shared memory object
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Last id handed out under this prefix by any process
    pub fn last_issued(&self) -> u32 {
        self.header().last_id.load(Ordering::Acquire)
    }

    /// Number of ids this generator currently has out
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdGenerator for BufferHubIdGenerator {
    /// Draw the next id from the shared counter, skipping ids this generator
    /// still has out. Ids held by other processes are caught when the
    /// buffer's shared memory objects turn out to exist already.
    fn allocate(&self) -> Result<BufferId> {
        let mut issued = self.lock();
        if issued.len() >= u32::MAX as usize {
            return Err(Error::IdExhausted);
        }

        loop {
            let previous = match self.header().last_id.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |last| Some(next_after(last)),
            ) {
                Ok(previous) | Err(previous) => previous,
            };
            let candidate = next_after(previous);
            if issued.insert(candidate) {
                return Ok(BufferId(candidate));
            }
        }
    }

    fn free(&self, id: BufferId) -> bool {
        self.lock().remove(&id.get())
    }
}

impl Drop for BufferHubIdGenerator {
    fn drop(&mut self) {
        let previous = self.header().mapping_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            error!(name = self.name(), "id counter mapping count underflow");
            return;
        }
        let last = previous == 1;
        self.shm.set_owner(last);
        debug!(name = self.name(), last, "detached id counter");
    }
}

impl fmt::Debug for BufferHubIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHubIdGenerator")
            .field("name", &self.name())
            .field("last_issued", &self.last_issued())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tag: &str) -> HubConfig {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        HubConfig::with_prefix(&format!("/bufferhub_id_{}_{}", tag, ts))
    }

    #[test]
    fn test_reserved_id() {
        assert!(BufferId::new(0).is_none());
        assert!(!BufferId::INVALID.is_valid());
        assert_eq!(BufferId::new(7).map(u32::from), Some(7));
    }

    #[test]
    fn test_ids_increase_and_are_nonzero() {
        let gen = BufferHubIdGenerator::open_or_create(&config("inc")).unwrap();
        let a = gen.allocate().unwrap();
        let b = gen.allocate().unwrap();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert_eq!(gen.in_use(), 2);
        assert_eq!(gen.last_issued(), 2);
    }

    #[test]
    fn test_generators_share_one_counter() {
        let config = config("shared");
        let first = BufferHubIdGenerator::open_or_create(&config).unwrap();
        let second = BufferHubIdGenerator::open_or_create(&config).unwrap();
        assert_eq!(first.name(), second.name());

        let a = first.allocate().unwrap();
        let b = second.allocate().unwrap();
        let c = first.allocate().unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));
        // each generator only frees what it handed out
        assert!(!second.free(a));
        assert!(first.free(a));
    }

    #[test]
    fn test_free() {
        let gen = BufferHubIdGenerator::open_or_create(&config("free")).unwrap();
        let a = gen.allocate().unwrap();
        assert!(gen.free(a));
        assert!(!gen.free(a));
        // freed ids are not reissued right away
        assert_eq!(gen.allocate().unwrap().get(), 2);
    }

    #[test]
    fn test_wraps_and_skips_used() {
        let gen = BufferHubIdGenerator::open_or_create(&config("wrap")).unwrap();
        let first = gen.allocate().unwrap();
        gen.header().last_id.store(u32::MAX - 1, Ordering::Release);
        assert_eq!(gen.allocate().unwrap().get(), u32::MAX);
        // 1 is still in use, so the wrap lands on 2
        assert_eq!(first.get(), 1);
        assert_eq!(gen.allocate().unwrap().get(), 2);
    }

    #[test]
    fn test_last_generator_removes_counter() {
        let config = config("unlink");
        let first = BufferHubIdGenerator::open_or_create(&config).unwrap();
        let second = BufferHubIdGenerator::open_or_create(&config).unwrap();
        first.allocate().unwrap();

        drop(first);
        assert!(SharedMemory::open(&config.id_shm_name()).is_ok());
        drop(second);
        assert!(SharedMemory::open(&config.id_shm_name()).is_err());

        let fresh = BufferHubIdGenerator::open_or_create(&config).unwrap();
        assert_eq!(fresh.allocate().unwrap().get(), 1);
    }

    #[test]
    fn test_open_rejects_foreign_region() {
        let config = config("foreign");
        let _other = SharedMemory::create(&config.id_shm_name(), 4).unwrap();
        assert!(BufferHubIdGenerator::open_or_create(&config).is_err());
    }

    #[test]
    fn test_concurrent_allocations_unique() {
        let config = config("threads");
        // keeps the counter alive while threads come and go
        let _keep = BufferHubIdGenerator::open_or_create(&config).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let gen = BufferHubIdGenerator::open_or_create(&config).unwrap();
                    (0..100).map(|_| gen.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 800);
    }
}
