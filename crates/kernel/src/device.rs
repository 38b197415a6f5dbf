//! Host-side device model: tagged buffers, an allocation budget and two
//! asynchronous in-order queues.
//!
//! Each queue is a worker thread fed through an `mpsc` channel. `dispatch`
//! snapshots the kernel's argument record and returns immediately; jobs run
//! in FIFO order. Nothing orders work across the two queues except an
//! explicit [`DeviceQueue::finish`] on each of them.
//!
//! Enqueue-time failures (bad index space, dead worker) are returned by the
//! enqueue call itself. A kernel that fails while executing poisons its queue:
//! later jobs on that queue are skipped and the error is returned by the next
//! `finish`, blocking read or map on the queue.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use bytemuck::Pod;

use crate::error::{DeviceError, KernelError, QueueKind};
use crate::kernels::{Kernel, KernelId, NdRange};

/// Smallest element count of any device buffer. Empty host arrays still get a
/// valid, bindable allocation.
pub const MIN_BUF_LEN: usize = 1;

/// Kernel-side access rights of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Uploaded once at creation; kernels may only read it.
    ReadOnly,
    /// Mutated in place by kernels.
    ReadWrite,
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

struct BufferInner<T> {
    tag: &'static str,
    access: Access,
    len: usize,
    data: RwLock<Vec<T>>,
}

/// Shared handle to a device-resident array.
///
/// Cloning the handle does not copy the data; kernel argument records hold
/// clones of the handles they are bound to.
pub struct DeviceBuffer<T> {
    inner: Arc<BufferInner<T>>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("tag", &self.inner.tag)
            .field("access", &self.inner.access)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl<T: Pod + Send + Sync> DeviceBuffer<T> {
    /// Identifying tag used in error reports.
    pub fn tag(&self) -> &'static str {
        self.inner.tag
    }

    /// Kernel-side access rights.
    pub fn access(&self) -> Access {
        self.inner.access
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True for a zero-length buffer; never the case for context allocations.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Size of the allocation in bytes.
    pub fn byte_size(&self) -> u64 {
        (self.inner.len * std::mem::size_of::<T>()) as u64
    }

    /// True if both handles refer to the same allocation.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>, KernelError> {
        self.inner
            .data
            .read()
            .map_err(|_| KernelError::Poisoned { tag: self.inner.tag })
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>, KernelError> {
        if self.inner.access == Access::ReadOnly {
            return Err(KernelError::ReadOnly { tag: self.inner.tag });
        }
        self.inner
            .data
            .write()
            .map_err(|_| KernelError::Poisoned { tag: self.inner.tag })
    }
}

/// Write access to a buffer held between a map and its unmap.
///
/// Dropping the guard unmaps the buffer. No kernel can touch the buffer while
/// it is mapped.
pub struct MappedBuffer<'a, T> {
    guard: RwLockWriteGuard<'a, Vec<T>>,
    tag: &'static str,
    queue: QueueKind,
    log: EventLog,
}

impl<T> Deref for MappedBuffer<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard
    }
}

impl<T> DerefMut for MappedBuffer<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.guard
    }
}

impl<T> Drop for MappedBuffer<'_, T> {
    fn drop(&mut self) {
        self.log.record(QueueEvent::Unmap {
            queue: self.queue,
            tag: self.tag,
        });
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Host-visible queue operation, recorded in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Start of orchestrator step `t`.
    Step(u64),
    /// Kernel enqueued.
    Dispatch {
        /// Queue the kernel went to
        queue: QueueKind,
        /// Which kernel
        kernel: KernelId,
        /// Index space it was launched over
        range: NdRange,
    },
    /// Blocking drain.
    Finish {
        /// Queue drained
        queue: QueueKind,
    },
    /// Blocking whole-buffer read.
    Read {
        /// Queue the read was issued on
        queue: QueueKind,
        /// Buffer tag
        tag: &'static str,
    },
    /// Blocking whole-buffer write.
    Write {
        /// Queue the write was issued on
        queue: QueueKind,
        /// Buffer tag
        tag: &'static str,
    },
    /// Buffer mapped for host write.
    Map {
        /// Queue the map was issued on
        queue: QueueKind,
        /// Buffer tag
        tag: &'static str,
    },
    /// Mapping released.
    Unmap {
        /// Queue the buffer was mapped on
        queue: QueueKind,
        /// Buffer tag
        tag: &'static str,
    },
}

/// Optional shared record of queue operations. Disabled logs drop everything.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Option<Arc<Mutex<Vec<QueueEvent>>>>,
}

impl EventLog {
    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self { events: None }
    }

    /// A fresh, empty recording log.
    pub fn enabled() -> Self {
        Self {
            events: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Whether events are kept.
    pub fn is_enabled(&self) -> bool {
        self.events.is_some()
    }

    /// Append `event` if the log is enabled.
    pub fn record(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            if let Ok(mut list) = events.lock() {
                list.push(event);
            }
        }
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<QueueEvent> {
        self.events
            .as_ref()
            .and_then(|e| e.lock().ok().map(|list| list.clone()))
            .unwrap_or_default()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        if let Some(events) = &self.events {
            if let Ok(mut list) = events.lock() {
                list.clear();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() -> Result<(), DeviceError> + Send + 'static>;

enum Command {
    Run(Job),
    Fence(mpsc::Sender<Option<DeviceError>>),
}

fn worker_loop(rx: mpsc::Receiver<Command>) {
    let mut failure: Option<DeviceError> = None;
    for cmd in rx {
        match cmd {
            Command::Run(job) => {
                if failure.is_none() {
                    if let Err(err) = job() {
                        tracing::error!(error = %err, "queued job failed");
                        failure = Some(err);
                    }
                }
            }
            Command::Fence(reply) => {
                let _ = reply.send(failure.take());
            }
        }
    }
}

/// One in-order asynchronous work queue.
pub struct DeviceQueue {
    kind: QueueKind,
    sender: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    log: EventLog,
}

impl DeviceQueue {
    fn spawn(kind: QueueKind, log: EventLog) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("{}-queue", kind).to_lowercase())
            .spawn(move || worker_loop(rx))
            .map_err(|e| DeviceError::Allocation {
                tag: format!("{kind} queue"),
                bytes: 0,
                reason: e.to_string(),
            })?;
        Ok(Self {
            kind,
            sender: Some(tx),
            worker: Some(worker),
            log,
        })
    }

    /// Which of the two queues this is.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    fn lost(&self) -> DeviceError {
        DeviceError::QueueLost { queue: self.kind }
    }

    fn send(&self, cmd: Command) -> Result<(), DeviceError> {
        self.sender
            .as_ref()
            .ok_or_else(|| self.lost())?
            .send(cmd)
            .map_err(|_| self.lost())
    }

    /// Enqueue `kernel` over `range`.
    ///
    /// The argument record is cloned at this point, so rebinding the caller's
    /// record afterwards does not affect work already queued.
    pub fn dispatch<K: Kernel>(&self, kernel: &K, range: NdRange) -> Result<(), DeviceError> {
        let queue = self.kind;
        range.validate().map_err(|source| DeviceError::Dispatch {
            kernel: K::ID.name(),
            queue,
            source,
        })?;
        self.log.record(QueueEvent::Dispatch {
            queue,
            kernel: K::ID,
            range,
        });
        let args = kernel.clone();
        self.send(Command::Run(Box::new(move || {
            args.run(&range).map_err(|source| DeviceError::Dispatch {
                kernel: K::ID.name(),
                queue,
                source,
            })
        })))
    }

    /// Block until every job queued so far has completed.
    pub fn finish(&self) -> Result<(), DeviceError> {
        self.log.record(QueueEvent::Finish { queue: self.kind });
        self.drain()
    }

    fn drain(&self) -> Result<(), DeviceError> {
        let (tx, rx) = mpsc::channel();
        self.send(Command::Fence(tx))?;
        match rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(self.lost()),
        }
    }

    /// Blocking read of the whole buffer after all queued work completes.
    pub fn read_buffer<T: Pod + Send + Sync>(&self, buf: &DeviceBuffer<T>) -> Result<Vec<T>, DeviceError> {
        self.log.record(QueueEvent::Read {
            queue: self.kind,
            tag: buf.tag(),
        });
        self.drain()?;
        let data = buf.read().map_err(|e| DeviceError::Transfer {
            tag: buf.tag().to_string(),
            reason: e.to_string(),
        })?;
        Ok(data.clone())
    }

    /// Blocking overwrite of a read-write buffer.
    pub fn write_buffer<T: Pod + Send + Sync>(&self, buf: &DeviceBuffer<T>, data: &[T]) -> Result<(), DeviceError> {
        if buf.access() == Access::ReadOnly {
            return Err(DeviceError::ReadOnly {
                tag: buf.tag().to_string(),
            });
        }
        if data.len() != buf.len() {
            return Err(DeviceError::Transfer {
                tag: buf.tag().to_string(),
                reason: format!("host array has {} elements, buffer {}", data.len(), buf.len()),
            });
        }
        self.log.record(QueueEvent::Write {
            queue: self.kind,
            tag: buf.tag(),
        });
        self.drain()?;
        let mut dst = buf.write().map_err(|e| DeviceError::Transfer {
            tag: buf.tag().to_string(),
            reason: e.to_string(),
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Blocking map for host write. The buffer is unmapped when the returned
    /// guard is dropped.
    pub fn map_write<'a, T: Pod + Send + Sync>(
        &self,
        buf: &'a DeviceBuffer<T>,
    ) -> Result<MappedBuffer<'a, T>, DeviceError> {
        if buf.access() == Access::ReadOnly {
            return Err(DeviceError::ReadOnly {
                tag: buf.tag().to_string(),
            });
        }
        self.log.record(QueueEvent::Map {
            queue: self.kind,
            tag: buf.tag(),
        });
        self.drain()?;
        let guard = buf.write().map_err(|e| DeviceError::Transfer {
            tag: buf.tag().to_string(),
            reason: e.to_string(),
        })?;
        Ok(MappedBuffer {
            guard,
            tag: buf.tag(),
            queue: self.kind,
            log: self.log.clone(),
        })
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(queue = %self.kind, "queue worker panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Both queues plus buffer allocation against an optional byte budget.
///
/// Two independent limits apply to each allocation: `budget` caps the total
/// of all live buffers, `max_buffer_size` caps any single buffer.
pub struct DeviceContext {
    gpu: DeviceQueue,
    cpu: DeviceQueue,
    budget: Option<u64>,
    max_buffer_size: Option<u64>,
    allocated: AtomicU64,
    log: EventLog,
}

impl DeviceContext {
    /// Create both queues. `budget` caps the total bytes of live buffers.
    pub fn new(budget: Option<u64>) -> Result<Self, DeviceError> {
        Self::with_log(budget, EventLog::disabled())
    }

    /// Like [`DeviceContext::new`], recording every queue operation.
    pub fn with_event_log(budget: Option<u64>) -> Result<Self, DeviceError> {
        Self::with_log(budget, EventLog::enabled())
    }

    fn with_log(budget: Option<u64>, log: EventLog) -> Result<Self, DeviceError> {
        let gpu = DeviceQueue::spawn(QueueKind::Gpu, log.clone())?;
        let cpu = DeviceQueue::spawn(QueueKind::Cpu, log.clone())?;
        Ok(Self {
            gpu,
            cpu,
            budget,
            max_buffer_size: None,
            allocated: AtomicU64::new(0),
            log,
        })
    }

    /// Cap the size of every individual buffer, e.g. at an adapter's
    /// `max_buffer_size`. Does not count towards the total budget.
    pub fn with_max_buffer_size(mut self, limit: Option<u64>) -> Self {
        self.max_buffer_size = limit;
        self
    }

    /// GPU-class queue.
    pub fn gpu(&self) -> &DeviceQueue {
        &self.gpu
    }

    /// CPU-class queue.
    pub fn cpu(&self) -> &DeviceQueue {
        &self.cpu
    }

    /// Shared event log of both queues.
    pub fn events(&self) -> &EventLog {
        &self.log
    }

    /// Cap on the total bytes of live buffers.
    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    /// Cap on the bytes of any single buffer.
    pub fn max_buffer_size(&self) -> Option<u64> {
        self.max_buffer_size
    }

    /// Bytes currently allocated through this context.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Full synchronisation: drain the GPU queue, then the CPU queue.
    pub fn barrier(&self) -> Result<(), DeviceError> {
        self.gpu.finish()?;
        self.cpu.finish()
    }

    /// Allocate a buffer initialised from `data`.
    pub fn create_buffer<T: Pod + Send + Sync>(
        &self,
        tag: &'static str,
        access: Access,
        data: &[T],
    ) -> Result<DeviceBuffer<T>, DeviceError> {
        let len = data.len().max(MIN_BUF_LEN);
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        if let Some(limit) = self.max_buffer_size.filter(|&limit| bytes > limit) {
            return Err(DeviceError::Allocation {
                tag: tag.to_string(),
                bytes,
                reason: format!("single buffer limit of {limit} bytes exceeded"),
            });
        }
        let budget = self.budget;
        self.allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.checked_add(bytes)?;
                match budget {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map_err(|used| DeviceError::Allocation {
                tag: tag.to_string(),
                bytes,
                reason: format!(
                    "device budget of {} bytes exceeded ({used} already in use)",
                    budget.unwrap_or(u64::MAX)
                ),
            })?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|e| DeviceError::Allocation {
                tag: tag.to_string(),
                bytes,
                reason: e.to_string(),
            })?;
        storage.extend_from_slice(data);
        storage.resize(len, T::zeroed());

        tracing::debug!(tag, bytes, ?access, "device buffer allocated");
        Ok(DeviceBuffer {
            inner: Arc::new(BufferInner {
                tag,
                access,
                len,
                data: RwLock::new(storage),
            }),
        })
    }

    /// Allocate a zero-filled buffer of `len` elements.
    pub fn create_zeroed<T: Pod + Send + Sync>(
        &self,
        tag: &'static str,
        access: Access,
        len: usize,
    ) -> Result<DeviceBuffer<T>, DeviceError> {
        self.create_buffer(tag, access, &vec![T::zeroed(); len])
    }
}
