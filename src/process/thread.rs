//! The launcher thread
//!
//! All launcher state lives on one dedicated OS thread. Callers on any other
//! thread post closures onto its queue; binders post their events onto the
//! same queue, so every transition is applied in arrival order by a single
//! writer.

use std::fmt;
use std::ops::Deref;
use std::thread::{self, JoinHandle, ThreadId};

use futures::future::join_all;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;

use super::launcher::Launcher;
use super::pending::{LaunchedProcess, SpawnRequest};
use super::service::{EventSink, ServiceBinder, ServiceEvent};
use super::simulated::{SimulatedBinder, SimulatedDevice};
use crate::utils::{LauncherConfig, LauncherError, Result};

/// Name given to the launcher's OS thread
pub const LAUNCHER_THREAD_NAME: &str = "binix-launcher";

type Job<B> = Box<dyn FnOnce(&mut Launcher<B>) + Send + 'static>;

enum Task<B: ServiceBinder> {
    Run(Job<B>),
    Event(ServiceEvent),
    Shutdown,
}

/// Cloneable handle for posting work to the launcher thread
pub struct LauncherHandle<B: ServiceBinder> {
    tx: UnboundedSender<Task<B>>,
    thread_id: ThreadId,
}

impl<B: ServiceBinder> Clone for LauncherHandle<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            thread_id: self.thread_id,
        }
    }
}

impl<B: ServiceBinder> fmt::Debug for LauncherHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LauncherHandle")
            .field("thread_id", &self.thread_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<B: ServiceBinder + 'static> LauncherHandle<B> {
    /// Whether the caller is running on the launcher thread
    pub fn is_launcher_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `job` on the launcher thread without waiting for it
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut Launcher<B>) + Send + 'static,
    {
        self.tx
            .send(Task::Run(Box::new(job)))
            .map_err(|_| LauncherError::LauncherShutDown)
    }

    /// Run `job` on the launcher thread and wait for its result.
    ///
    /// Must not be called from an async context or from the launcher thread.
    pub fn run_blocking<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut Launcher<B>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_launcher_thread() {
            return Err(LauncherError::BlockingOnLauncherThread);
        }
        let (tx, rx) = oneshot::channel();
        self.post(move |launcher| {
            let _ = tx.send(job(launcher));
        })?;
        rx.blocking_recv().map_err(|_| LauncherError::LauncherShutDown)
    }

    /// Run `job` on the launcher thread and await its result
    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut Launcher<B>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move |launcher| {
            let _ = tx.send(job(launcher));
        })?;
        rx.await.map_err(|_| LauncherError::LauncherShutDown)
    }

    /// Submit a request and wait until its worker completes setup or fails.
    ///
    /// Any callback already set on the request is replaced.
    pub async fn launch(&self, mut request: SpawnRequest) -> Result<LaunchedProcess> {
        let (tx, rx) = oneshot::channel();
        request.set_callback(Box::new(move |outcome: Result<LaunchedProcess>| {
            let _ = tx.send(outcome);
        }));
        // Failures reach the callback as well, so the dispatch result is not needed here.
        self.post(move |launcher| {
            let _ = launcher.launch(request);
        })?;
        rx.await.map_err(|_| LauncherError::LauncherShutDown)?
    }

    /// Submit several requests in order and wait for all of them
    pub async fn launch_all<I>(&self, requests: I) -> Vec<Result<LaunchedProcess>>
    where
        I: IntoIterator<Item = SpawnRequest>,
    {
        join_all(requests.into_iter().map(|request| self.launch(request))).await
    }

    /// Sink that delivers binder events onto this launcher thread
    pub fn events(&self) -> EventSink {
        event_sink(self.tx.clone())
    }
}

fn event_sink<B: ServiceBinder + 'static>(tx: UnboundedSender<Task<B>>) -> EventSink {
    EventSink::new(move |event| tx.send(Task::Event(event)).is_ok())
}

/// Owner of the launcher thread; shuts it down when dropped
pub struct LauncherThread<B: ServiceBinder> {
    handle: LauncherHandle<B>,
    join: Option<JoinHandle<()>>,
}

impl<B: ServiceBinder + Send + 'static> LauncherThread<B> {
    /// Start the launcher thread.
    ///
    /// `make_binder` receives the sink its events must be posted to.
    pub fn spawn<F>(config: LauncherConfig, make_binder: F) -> std::io::Result<Self>
    where
        F: FnOnce(EventSink) -> B,
    {
        let (tx, rx) = unbounded_channel();
        let binder = make_binder(event_sink(tx.clone()));
        let launcher = Launcher::new(config, binder);

        let join = thread::Builder::new()
            .name(LAUNCHER_THREAD_NAME.to_string())
            .spawn(move || run_loop(launcher, rx))?;
        let thread_id = join.thread().id();
        log::debug!("{} thread started", LAUNCHER_THREAD_NAME);

        Ok(Self {
            handle: LauncherHandle { tx, thread_id },
            join: Some(join),
        })
    }
}

impl LauncherThread<SimulatedBinder> {
    /// Start a launcher over a fresh [`SimulatedDevice`]
    pub fn simulated(config: LauncherConfig) -> std::io::Result<(Self, SimulatedDevice)> {
        let mut device = None;
        let thread = Self::spawn(config, |sink| {
            let simulated = SimulatedDevice::new(sink);
            let binder = simulated.binder();
            device = Some(simulated);
            binder
        })?;
        let device = device.ok_or_else(|| std::io::Error::other("binder factory not called"))?;
        Ok((thread, device))
    }
}

impl<B: ServiceBinder> LauncherThread<B> {
    pub fn handle(&self) -> LauncherHandle<B> {
        self.handle.clone()
    }

    /// Stop the thread after it finishes the tasks already queued
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.handle.tx.send(Task::Shutdown);
        if thread::current().id() == self.handle.thread_id {
            return;
        }
        if join.join().is_err() {
            log::warn!("{} thread panicked", LAUNCHER_THREAD_NAME);
        }
    }
}

impl<B: ServiceBinder> Deref for LauncherThread<B> {
    type Target = LauncherHandle<B>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<B: ServiceBinder> Drop for LauncherThread<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<B: ServiceBinder>(mut launcher: Launcher<B>, mut rx: UnboundedReceiver<Task<B>>) {
    while let Some(task) = rx.blocking_recv() {
        if !run_task(&mut launcher, task) {
            break;
        }
    }
    // Refuse new work, but still run what was queued before the close.
    rx.close();
    while let Ok(task) = rx.try_recv() {
        run_task(&mut launcher, task);
    }
    launcher.shutdown();
    log::debug!("{} thread stopped", LAUNCHER_THREAD_NAME);
}

/// Apply one task; false on `Shutdown`
fn run_task<B: ServiceBinder>(launcher: &mut Launcher<B>, task: Task<B>) -> bool {
    match task {
        Task::Run(job) => job(launcher),
        Task::Event(event) => launcher.handle_event(event),
        Task::Shutdown => return false,
    }
    true
}
