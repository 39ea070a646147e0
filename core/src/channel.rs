//! Serialized request channel to the SunPCi device.
//!
//! The device tolerates exactly one outstanding request, so the backend is
//! owned by a dedicated worker thread and every caller queues work for it.
//! The request timeout counts from the moment the worker picks a job up.
//! Time spent queued behind another request is bounded separately, and a job
//! whose caller stopped waiting before it was picked up is never run. A reply
//! that arrives after its caller timed out is dropped by the worker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use sunpci_common::{
    DeviceBackend, DriverHandle, FramebufferMap, Request, Response, Result, SunPciError,
};
use tracing::{debug, debug_span, warn};

use crate::lock;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Queue wait allowed per job, as a multiple of the request timeout.
const QUEUE_WAIT_FACTOR: u32 = 4;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const ABANDONED: u8 = 2;

/// Hand-off between a waiting caller and the worker for one job.
struct Ticket<T> {
    state: Arc<AtomicU8>,
    reply: mpsc::SyncSender<Reply<T>>,
}

impl<T> Ticket<T> {
    /// Claim the job for execution. Fails if the caller already gave up.
    fn claim(&self) -> bool {
        if self
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // the caller may have timed out already; it then never reads this
        let _ = self.reply.send(Reply::Started);
        true
    }

    fn finish(&self, result: Result<T>) -> bool {
        self.reply.send(Reply::Done(result)).is_ok()
    }
}

enum Reply<T> {
    Started,
    Done(Result<T>),
}

enum Job {
    Request {
        request: Request,
        ticket: Ticket<Response>,
    },
    MapFramebuffer {
        len: usize,
        ticket: Ticket<Box<dyn FramebufferMap>>,
    },
}

struct Shared {
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    timeout: Duration,
    queue_timeout: Duration,
}

/// Cloneable handle to the device worker.
///
/// All clones feed the same queue, so requests from the session controller
/// and from every subsystem controller are executed strictly one at a time.
#[derive(Clone)]
pub struct DeviceChannel {
    shared: Arc<Shared>,
}

impl DeviceChannel {
    /// Open the device node at `path` and start the worker.
    pub fn open(path: &str, timeout: Duration) -> Result<Self> {
        let handle = DriverHandle::open_path(path)?;
        Self::with_backend(Box::new(handle), timeout)
    }

    /// Start a worker over an arbitrary backend.
    pub fn with_backend(backend: Box<dyn DeviceBackend>, timeout: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("sunpci-channel".to_string())
            .spawn(move || run_worker(backend, receiver))
            .map_err(|e| {
                SunPciError::IoFault(Errno::from_raw(
                    e.raw_os_error().unwrap_or(Errno::EAGAIN as i32),
                ))
            })?;

        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Some(sender)),
                timeout,
                queue_timeout: timeout.saturating_mul(QUEUE_WAIT_FACTOR),
            }),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Longest time a job may wait behind other requests before it is dropped.
    pub fn queue_timeout(&self) -> Duration {
        self.shared.queue_timeout
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.queue).is_some()
    }

    /// Validate `request` and run it on the device.
    ///
    /// Validation failures are reported without the device being touched.
    pub fn execute(&self, request: Request) -> Result<Response> {
        request.validate()?;

        let name = request.name();
        let (ticket, pending) = Pending::new();
        self.enqueue(Job::Request { request, ticket })?;
        self.await_reply(name, pending)
    }

    /// Map `len` bytes of guest video memory on the worker thread.
    pub fn map_framebuffer(&self, len: usize) -> Result<Box<dyn FramebufferMap>> {
        let (ticket, pending) = Pending::new();
        self.enqueue(Job::MapFramebuffer { len, ticket })?;
        self.await_reply("MAP_FRAMEBUFFER", pending)
    }

    /// Stop accepting requests.
    ///
    /// A request already on the worker finishes; its reply is discarded if
    /// nobody is waiting. Later calls fail with [`SunPciError::ChannelClosed`].
    pub fn close(&self) {
        if lock(&self.shared.queue).take().is_some() {
            debug!("Device channel closed");
        }
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let queue = lock(&self.shared.queue);
        let sender = queue.as_ref().ok_or(SunPciError::ChannelClosed)?;
        sender.send(job).map_err(|_| SunPciError::ChannelClosed)
    }

    fn await_reply<T>(&self, name: &str, pending: Pending<T>) -> Result<T> {
        match pending.replies.recv_timeout(self.shared.queue_timeout) {
            Ok(Reply::Started) => {}
            Ok(Reply::Done(result)) => return result,
            Err(RecvTimeoutError::Timeout) => {
                if pending.abandon() {
                    let millis = self.shared.queue_timeout.as_millis() as u64;
                    warn!("{} still queued after {} ms, dropped", name, millis);
                    return Err(SunPciError::Timeout(millis));
                }
                // picked up just as the wait ran out; Started is already sent
                let started = pending.replies.recv_timeout(self.shared.timeout);
                if let Err(RecvTimeoutError::Disconnected) = started {
                    return Err(SunPciError::ChannelClosed);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Err(SunPciError::ChannelClosed),
        }

        match pending.replies.recv_timeout(self.shared.timeout) {
            Ok(Reply::Done(result)) => result,
            Ok(Reply::Started) => Err(SunPciError::IoFault(Errno::EPROTO)),
            Err(RecvTimeoutError::Timeout) => {
                let millis = self.shared.timeout.as_millis() as u64;
                warn!("{} did not complete within {} ms", name, millis);
                Err(SunPciError::Timeout(millis))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SunPciError::ChannelClosed),
        }
    }
}

/// Caller side of a [`Ticket`].
struct Pending<T> {
    state: Arc<AtomicU8>,
    replies: mpsc::Receiver<Reply<T>>,
}

impl<T> Pending<T> {
    fn new() -> (Ticket<T>, Self) {
        let state = Arc::new(AtomicU8::new(QUEUED));
        let (reply, replies) = mpsc::sync_channel(2);
        let ticket = Ticket {
            state: state.clone(),
            reply,
        };
        (ticket, Self { state, replies })
    }

    /// Withdraw a job that has not been picked up yet.
    fn abandon(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Error for a reply whose shape does not match the request.
pub(crate) fn unexpected_response(request: &str, response: &Response) -> SunPciError {
    warn!("Unexpected reply to {}: {:?}", request, std::mem::discriminant(response));
    SunPciError::IoFault(Errno::EPROTO)
}

fn run_worker(mut backend: Box<dyn DeviceBackend>, jobs: mpsc::Receiver<Job>) {
    for job in jobs {
        match job {
            Job::Request { request, ticket } => {
                let span = debug_span!("request", opcode = request.opcode(), name = request.name());
                let _enter = span.enter();
                if !ticket.claim() {
                    debug!("caller gave up before the request ran, skipped");
                    continue;
                }
                let result = backend.submit(&request);
                match &result {
                    Ok(_) => debug!("completed"),
                    Err(e) => debug!("failed: {}", e),
                }
                if !ticket.finish(result) {
                    debug!("caller gave up waiting, reply discarded");
                }
            }
            Job::MapFramebuffer { len, ticket } => {
                if !ticket.claim() {
                    debug!("framebuffer mapping withdrawn before it ran");
                    continue;
                }
                let result = backend.map_framebuffer(len);
                if !ticket.finish(result) {
                    debug!("framebuffer mapping no longer wanted");
                }
            }
        }
    }
    debug!("Device worker exiting");
}
