use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use stagefeed_core::{DeviceId, ExecutionStream, Result, StageError};

use crate::allocation::Region;

type Op = Box<dyn FnOnce() -> std::result::Result<(), String> + Send>;

/// In-order execution queue for one device, backed by a worker thread.
///
/// Cloning yields another handle to the same queue. The worker drains any
/// remaining work and exits once the last handle is dropped.
#[derive(Clone)]
pub struct DeviceStream {
    shared: Arc<StreamShared>,
    _worker: Arc<Worker>,
}

struct StreamShared {
    device: DeviceId,
    index: usize,
    queue: Mutex<StreamQueue>,
    work_ready: Condvar,
    /// First failure since the last completion point.
    error: Mutex<Option<String>>,
}

#[derive(Default)]
struct StreamQueue {
    ops: VecDeque<Op>,
    shutdown: bool,
}

struct Worker {
    shared: Arc<StreamShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl DeviceStream {
    /// Spawn a new stream worker for `device`.
    pub fn new(device: DeviceId, index: usize) -> Result<Self> {
        let shared = Arc::new(StreamShared {
            device,
            index,
            queue: Mutex::new(StreamQueue::default()),
            work_ready: Condvar::new(),
            error: Mutex::new(None),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("stream-{device}-{index}"))
            .spawn(move || run_worker(worker_shared))
            .map_err(|e| StageError::Stream(format!("stream creation failed: {e}")))?;

        Ok(Self {
            shared: shared.clone(),
            _worker: Arc::new(Worker {
                shared,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Whether two handles refer to the same queue.
    pub fn same_as(&self, other: &DeviceStream) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Enqueue a host function. It runs after all previously enqueued work.
    pub fn launch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(move || {
            f();
            Ok(())
        }));
    }

    /// Enqueue a write of `bytes` into `dst`.
    pub fn write_async(&self, dst: &Region, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() != dst.len() {
            return Err(StageError::InvalidRegion(format!(
                "write of {} bytes into region of {} bytes",
                bytes.len(),
                dst.len()
            )));
        }
        let dst = dst.clone();
        self.enqueue(Box::new(move || {
            dst.write(|out| out.copy_from_slice(&bytes));
            Ok(())
        }));
        Ok(())
    }

    fn enqueue(&self, op: Op) {
        self.shared.queue.lock().ops.push_back(op);
        self.shared.work_ready.notify_one();
    }
}

impl ExecutionStream for DeviceStream {
    type Region = Region;
    type Event = Event;

    fn device(&self) -> DeviceId {
        self.shared.device
    }

    fn copy_async(&self, src: &Region, dst: &Region) -> Result<()> {
        if src.len() != dst.len() {
            return Err(StageError::InvalidRegion(format!(
                "copy length mismatch: source {} bytes, destination {} bytes",
                src.len(),
                dst.len()
            )));
        }
        let (src, dst) = (src.clone(), dst.clone());
        self.enqueue(Box::new(move || dst.copy_from(&src).map_err(|e| e.to_string())));
        Ok(())
    }

    fn record_event(&self) -> Event {
        let event = Event::pending(self.shared.device);
        let signal = event.clone();
        let shared = self.shared.clone();
        self.enqueue(Box::new(move || {
            match shared.error.lock().take() {
                Some(err) => signal.finish(Err(err)),
                None => signal.finish(Ok(())),
            }
            Ok(())
        }));
        event
    }

    fn wait_event(&self, event: &Event) {
        if event.is_complete() && event.failure().is_none() {
            return;
        }
        let event = event.clone();
        self.enqueue(Box::new(move || event.wait().map_err(|e| e.to_string())));
    }

    fn synchronize(&self) -> Result<()> {
        self.record_event().wait()
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("device", &self.shared.device)
            .field("index", &self.shared.index)
            .finish()
    }
}

fn run_worker(shared: Arc<StreamShared>) {
    loop {
        let op = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(op) = queue.ops.pop_front() {
                    break Some(op);
                }
                if queue.shutdown {
                    break None;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        let Some(op) = op else {
            return;
        };

        if let Err(err) = op() {
            tracing::warn!(
                device = %shared.device,
                stream = shared.index,
                error = %err,
                "stream operation failed"
            );
            shared.error.lock().get_or_insert(err);
        }
    }
}

/// Completion marker recorded into a stream.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    device: Option<DeviceId>,
    state: Mutex<EventState>,
    done: Condvar,
}

#[derive(Clone)]
enum EventState {
    Pending,
    Complete,
    Failed(String),
}

impl Event {
    fn pending(device: DeviceId) -> Self {
        Self {
            inner: Arc::new(EventInner {
                device: Some(device),
                state: Mutex::new(EventState::Pending),
                done: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete and belongs to no stream.
    pub fn completed() -> Self {
        Self {
            inner: Arc::new(EventInner {
                device: None,
                state: Mutex::new(EventState::Complete),
                done: Condvar::new(),
            }),
        }
    }

    fn finish(&self, result: std::result::Result<(), String>) {
        let mut state = self.inner.state.lock();
        *state = match result {
            Ok(()) => EventState::Complete,
            Err(err) => EventState::Failed(err),
        };
        self.inner.done.notify_all();
    }

    /// Device of the stream that recorded this event.
    pub fn device(&self) -> Option<DeviceId> {
        self.inner.device
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.inner.state.lock(), EventState::Pending)
    }

    /// The stream failure reported by this event, if it has completed with one.
    pub fn failure(&self) -> Option<String> {
        match &*self.inner.state.lock() {
            EventState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Block until the event completes.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while matches!(*state, EventState::Pending) {
            self.inner.done.wait(&mut state);
        }
        match &*state {
            EventState::Failed(err) => Err(StageError::Stream(err.clone())),
            _ => Ok(()),
        }
    }

    pub fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.inner.device)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A pool of streams for overlapping staging work across bindings.
pub struct StreamPool {
    device: DeviceId,
    streams: Mutex<Vec<StreamHandle>>,
    all: Vec<DeviceStream>,
    default_stream: DeviceStream,
    pool_size: usize,
}

/// Handle to a stream borrowed from the pool.
pub struct StreamHandle {
    stream: DeviceStream,
    index: usize,
}

impl StreamHandle {
    pub fn stream(&self) -> &DeviceStream {
        &self.stream
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("device", &self.stream.device())
            .field("index", &self.index)
            .finish()
    }
}

impl StreamPool {
    /// Create a pool of `count` streams plus one shared default stream.
    pub fn new(device: DeviceId, count: usize) -> Result<Self> {
        let default_stream = DeviceStream::new(device, count)?;

        let mut streams = Vec::with_capacity(count);
        let mut all = Vec::with_capacity(count + 1);
        for i in 0..count {
            let stream = DeviceStream::new(device, i)?;
            all.push(stream.clone());
            streams.push(StreamHandle { stream, index: i });
        }
        all.push(default_stream.clone());

        Ok(Self {
            device,
            streams: Mutex::new(streams),
            all,
            default_stream,
            pool_size: count,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Borrow a stream from the pool. Returns `None` if all streams are in use.
    pub fn try_acquire(&self) -> Option<StreamHandle> {
        self.streams.lock().pop()
    }

    /// Return a stream to the pool after use.
    pub fn release(&self, handle: StreamHandle) {
        self.streams.lock().push(handle);
    }

    /// Stream shared by everyone who could not get a dedicated one.
    pub fn default_stream(&self) -> &DeviceStream {
        &self.default_stream
    }

    /// Number of streams in this pool, not counting the default stream.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of streams currently available.
    pub fn available(&self) -> usize {
        self.streams.lock().len()
    }

    /// Wait for all work on every stream of this device.
    pub fn sync_all(&self) -> Result<()> {
        for stream in &self.all {
            stream.synchronize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use stagefeed_core::Placement;

    use super::*;
    use crate::allocation::Allocation;

    #[test]
    fn work_runs_in_submission_order() {
        let stream = DeviceStream::new(DeviceId::Gpu(0), 0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            stream.launch(move || {
                if i % 4 == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                log.lock().push(i);
            });
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn copy_is_visible_after_event() {
        let stream = DeviceStream::new(DeviceId::Gpu(0), 0).unwrap();
        let src = Allocation::from_bytes(Placement::native(DeviceId::Cpu), vec![9, 8, 7, 6]);
        let dst = Allocation::zeroed(Placement::native(DeviceId::Gpu(0)), 4);

        stream.launch(|| std::thread::sleep(Duration::from_millis(5)));
        stream
            .copy_async(&Region::whole(src), &Region::whole(dst.clone()))
            .unwrap();
        let event = stream.record_event();
        event.wait().unwrap();
        assert!(event.is_complete());
        assert_eq!(event.device(), Some(DeviceId::Gpu(0)));
        assert_eq!(Region::whole(dst).to_vec(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn cross_stream_wait_orders_work() {
        let producer = DeviceStream::new(DeviceId::Gpu(0), 0).unwrap();
        let consumer = DeviceStream::new(DeviceId::Gpu(0), 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        producer.launch(move || {
            std::thread::sleep(Duration::from_millis(10));
            c.store(1, Ordering::SeqCst);
        });
        let ready = producer.record_event();

        consumer.wait_event(&ready);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (c, s) = (counter.clone(), seen.clone());
        consumer.launch(move || s.store(c.load(Ordering::SeqCst), Ordering::SeqCst));
        consumer.synchronize().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_surface_at_next_event() {
        let stream = DeviceStream::new(DeviceId::Gpu(0), 0).unwrap();
        let dst = Allocation::zeroed(Placement::native(DeviceId::Gpu(0)), 2);
        let region = Region::whole(dst);
        // Length is validated eagerly, so fail through a host function instead.
        stream.enqueue(Box::new(|| Err("simulated fault".to_string())));
        stream.write_async(&region, vec![1, 2]).unwrap();

        let err = stream.synchronize().unwrap_err();
        assert!(err.to_string().contains("simulated fault"));
        // The failure is reported once.
        stream.synchronize().unwrap();
        assert_eq!(region.to_vec(), vec![1, 2]);
    }

    #[test]
    fn pool_acquire_and_release() {
        let pool = StreamPool::new(DeviceId::Gpu(1), 2).unwrap();
        assert_eq!(pool.available(), 2);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert!(!a.stream().same_as(b.stream()));
        assert_eq!(a.stream().device(), DeviceId::Gpu(1));
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
        pool.sync_all().unwrap();
    }
}
