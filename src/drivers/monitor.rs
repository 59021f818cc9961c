use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use ndarray::s;

use crate::config::{MonitorConfig, ServerConfig};
use crate::drivers::{ChannelMask, CircularBuffer, FaError, SampleWindow, Subscription};
use crate::types::{MonitorEvent, MonitorState, STOP_REASON};

/// Longest window for which every new block triggers an update; longer
/// windows update every `SCROLL_THRESHOLD` samples so they scroll.
pub const SCROLL_THRESHOLD: usize = 10_000;

/// Decides when enough new samples have arrived to notify the owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cadence {
    notify_size: usize,
    update_size: usize,
    accumulated: usize,
}

impl Cadence {
    pub fn new(notify_size: usize, update_size: usize) -> Self {
        Self {
            notify_size,
            update_size: update_size.max(1),
            accumulated: 0,
        }
    }

    pub fn resize(&mut self, notify_size: usize, update_size: usize) {
        self.notify_size = notify_size;
        self.update_size = update_size.max(1);
        self.accumulated = 0;
    }

    /// Counts `samples` new samples. Returns the snapshot size when a
    /// notification is due; the surplus over `update_size` carries forward.
    pub fn advance(&mut self, samples: usize) -> Option<usize> {
        self.accumulated += samples;
        if self.accumulated >= self.update_size {
            self.accumulated -= self.update_size;
            Some(self.notify_size)
        } else {
            None
        }
    }

    pub fn notify_size(&self) -> usize {
        self.notify_size
    }

    pub fn update_size(&self) -> usize {
        self.update_size
    }

    pub fn accumulated(&self) -> usize {
        self.accumulated
    }
}

/// State shared between the owner and the reader thread.
struct Shared {
    buffer: Mutex<CircularBuffer>,
    cadence: Mutex<Cadence>,
    scale: f64,
}

impl Shared {
    fn snapshot(&self, size: usize) -> SampleWindow {
        let window = lock(&self.buffer).read(size);
        window * self.scale
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    running: Arc<AtomicBool>,
    /// Second handle on the subscription socket, used to unblock the reader.
    socket: TcpStream,
    handle: JoinHandle<()>,
}

/// Streams one channel from the FA server into a circular buffer on a
/// background thread and reports progress as [`MonitorEvent`]s.
pub struct StreamMonitor {
    server: ServerConfig,
    read_size: usize,
    channel: u8,
    shared: Arc<Shared>,
    events: Sender<MonitorEvent>,
    worker: Option<Worker>,
}

impl StreamMonitor {
    pub fn new(
        server: ServerConfig,
        config: &MonitorConfig,
        channel: u8,
        events: Sender<MonitorEvent>,
    ) -> Result<Self, FaError> {
        config.validate()?;
        let shared = Shared {
            buffer: Mutex::new(CircularBuffer::new(config.buffer_size)),
            cadence: Mutex::new(Cadence::new(config.read_size, config.read_size)),
            scale: config.scale,
        };
        Ok(Self {
            server,
            read_size: config.read_size,
            channel,
            shared: Arc::new(shared),
            events,
            worker: None,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn state(&self) -> MonitorState {
        match &self.worker {
            None => MonitorState::Idle,
            Some(worker) if worker.handle.is_finished() => MonitorState::Idle,
            Some(worker) if worker.running.load(Ordering::Acquire) => MonitorState::Running,
            Some(_) => MonitorState::Stopping,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Subscribes to the current channel and launches the reader thread.
    ///
    /// A failed connect or subscribe is returned to the caller (and reported
    /// as a `Stopped` event) without entering the running state.
    pub fn start(&mut self) -> Result<(), FaError> {
        self.reap();
        if self.worker.is_some() {
            return Err(FaError::AlreadyRunning);
        }
        let channel = self.channel;
        let subscription = match Subscription::open(&self.server, ChannelMask::single(channel)) {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!("unable to subscribe to channel {channel}: {err}");
                self.events
                    .send(MonitorEvent::Stopped {
                        reason: format!("Unable to connect to server: {err}"),
                    })
                    .ok();
                return Err(err);
            }
        };
        let socket = subscription.shutdown_handle()?;

        lock(&self.shared.buffer).reset();
        {
            let mut cadence = lock(&self.shared.cadence);
            let (notify, update) = (cadence.notify_size(), cadence.update_size());
            cadence.resize(notify, update);
        }

        let running = Arc::new(AtomicBool::new(true));
        let reader = Reader {
            subscription,
            channel,
            read_size: self.read_size,
            running: Arc::clone(&running),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("fa-monitor-{channel}"))
            .spawn(move || reader.run())?;
        info!("monitoring channel {channel} on {}", self.server.address());
        self.worker = Some(Worker {
            running,
            socket,
            handle,
        });
        Ok(())
    }

    /// Stops the reader and waits for it to exit. The connection is closed
    /// by the time this returns. Does nothing when idle.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);
        // Unblocks a pending receive; the reader sees the cleared flag.
        let _ = worker.socket.shutdown(Shutdown::Both);
        if worker.handle.join().is_err() {
            error!("reader thread for channel {} panicked", self.channel);
        }
        debug!("monitor for channel {} stopped", self.channel);
    }

    /// Switches to another channel, resubscribing if currently running.
    pub fn set_channel(&mut self, channel: u8) -> Result<(), FaError> {
        self.reap();
        let running = self.worker.is_some();
        self.stop();
        self.channel = channel;
        if running {
            self.start()?;
        }
        Ok(())
    }

    /// Changes the snapshot size and the number of new samples between
    /// notifications without restarting the reader.
    pub fn resize(&self, notify_size: usize, update_size: usize) {
        lock(&self.shared.cadence).resize(notify_size, update_size);
    }

    /// Shows `timebase` samples, updating every block for short windows and
    /// every `SCROLL_THRESHOLD` samples beyond that.
    pub fn set_timebase(&self, timebase: usize) {
        self.resize(timebase, timebase.min(SCROLL_THRESHOLD));
    }

    pub fn cadence(&self) -> Cadence {
        lock(&self.shared.cadence).clone()
    }

    /// Latest `notify_size` samples, scaled. Safe to call while running.
    pub fn read(&self) -> SampleWindow {
        let size = lock(&self.shared.cadence).notify_size();
        self.shared.snapshot(size)
    }

    /// Joins a reader that has already exited on its own.
    fn reap(&mut self) {
        let finished = self
            .worker
            .as_ref()
            .map_or(false, |w| !w.running.load(Ordering::Acquire));
        if finished {
            self.stop();
        }
    }
}

impl Drop for StreamMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Reader {
    subscription: Subscription,
    channel: u8,
    read_size: usize,
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
    events: Sender<MonitorEvent>,
}

impl Reader {
    fn run(mut self) {
        self.events
            .send(MonitorEvent::Connected {
                channel: self.channel,
            })
            .ok();
        let reason = loop {
            if !self.running.load(Ordering::Acquire) {
                break STOP_REASON.to_owned();
            }
            match self.subscription.read(self.read_size) {
                Ok(block) => {
                    // Only one channel is subscribed.
                    let block = block.slice(s![.., 0, ..]).mapv(f64::from);
                    lock(&self.shared.buffer).write(block.view());
                    let due = lock(&self.shared.cadence).advance(self.read_size);
                    if let Some(size) = due {
                        let window = self.shared.snapshot(size);
                        self.events.send(MonitorEvent::DataReady(window)).ok();
                    }
                }
                Err(_) if !self.running.load(Ordering::Acquire) => {
                    break STOP_REASON.to_owned();
                }
                Err(err) => break err.to_string(),
            }
        };
        self.running.store(false, Ordering::Release);
        self.subscription.close();
        info!("channel {} stream ended: {reason}", self.channel);
        self.events.send(MonitorEvent::Stopped { reason }).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::protocol::tests::{mock_server, read_request};
    use crate::drivers::{DisplayMode, ModeKind};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn monitor_config(read_size: usize) -> MonitorConfig {
        MonitorConfig {
            buffer_size: 20_000,
            read_size,
            scale: 1e-3,
        }
    }

    /// Accepts `connections` subscriptions in turn, reporting each request
    /// line and holding the socket open until the client hangs up.
    fn idle_server(connections: usize) -> (ServerConfig, Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for _ in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                tx.send(read_request(&stream)).ok();
                stream.write_all(&[0]).unwrap();
                let mut sink = [0u8; 64];
                while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
            }
        });
        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            ..ServerConfig::default()
        };
        (server, rx)
    }

    #[test]
    fn cadence_keeps_surplus() {
        let mut cadence = Cadence::new(10_000, 2500);
        assert_eq!(cadence.advance(1000), None);
        assert_eq!(cadence.advance(1000), None);
        assert_eq!(cadence.advance(1000), Some(10_000));
        assert_eq!(cadence.accumulated(), 500);
        assert_eq!(cadence.advance(1000), None);
        assert_eq!(cadence.advance(1000), Some(10_000));
        assert_eq!(cadence.accumulated(), 0);
        cadence.advance(700);
        cadence.resize(1000, 1000);
        assert_eq!(cadence.accumulated(), 0);
    }

    #[test]
    fn streams_zero_samples_to_the_owner() {
        let server = mock_server(|mut stream| {
            let request = read_request(&stream);
            assert_eq!(request, format!("SR{}\n", ChannelMask::single(3).to_wire()));
            stream.write_all(&[0]).unwrap();
            stream.write_all(&vec![0u8; 8 * 5000]).unwrap();
        });
        let (tx, rx) = mpsc::channel();
        let mut monitor = StreamMonitor::new(server, &monitor_config(1000), 3, tx).unwrap();
        monitor.set_timebase(1000);
        monitor.start().unwrap();

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            MonitorEvent::Connected { channel: 3 }
        ));
        let mut windows = Vec::new();
        let reason = loop {
            match rx.recv_timeout(WAIT).unwrap() {
                MonitorEvent::DataReady(window) => windows.push(window),
                MonitorEvent::Stopped { reason } => break reason,
                MonitorEvent::Connected { .. } => panic!("connected twice"),
            }
        };
        assert_eq!(windows.len(), 5);
        assert_eq!(reason, FaError::EndOfStream.to_string());

        let mut raw = DisplayMode::new(ModeKind::Raw, 1000, 10072.0);
        let out = raw.compute(windows[4].view());
        assert_eq!(out.values.dim(), (1000, 2));
        assert!(out.values.iter().all(|&v| v == 0.0));

        let mut fft = DisplayMode::new(ModeKind::Fft, 1000, 10072.0);
        let out = fft.compute(monitor.read().view());
        assert_eq!(out.values.dim(), (500, 2));
        assert!(out.values.iter().all(|&v| v == 0.0));

        // The reader ended on its own; the monitor can be reused.
        assert_ne!(monitor.state(), MonitorState::Running);
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn stop_interrupts_a_blocked_read() {
        let (server, requests) = idle_server(1);
        let (tx, rx) = mpsc::channel();
        let mut monitor = StreamMonitor::new(server, &monitor_config(1000), 9, tx).unwrap();
        monitor.start().unwrap();
        requests.recv_timeout(WAIT).unwrap();
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            MonitorEvent::Connected { channel: 9 }
        ));
        assert!(matches!(monitor.start(), Err(FaError::AlreadyRunning)));

        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Idle);
        match rx.recv_timeout(WAIT).unwrap() {
            MonitorEvent::Stopped { reason } => assert_eq!(reason, STOP_REASON),
            other => panic!("unexpected event {other:?}"),
        }
        // Stopping twice is harmless.
        monitor.stop();
    }

    #[test]
    fn set_channel_resubscribes_when_running() {
        let (server, requests) = idle_server(2);
        let (tx, rx) = mpsc::channel();
        let mut monitor = StreamMonitor::new(server, &monitor_config(100), 3, tx).unwrap();
        monitor.start().unwrap();
        assert_eq!(
            requests.recv_timeout(WAIT).unwrap(),
            format!("SR{}\n", ChannelMask::single(3).to_wire())
        );
        monitor.set_channel(5).unwrap();
        assert_eq!(
            requests.recv_timeout(WAIT).unwrap(),
            format!("SR{}\n", ChannelMask::single(5).to_wire())
        );
        assert!(monitor.is_running());
        monitor.stop();

        let events: Vec<_> = rx.try_iter().collect();
        let stops = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::Stopped { .. }))
            .count();
        assert_eq!(stops, 2);
    }

    #[test]
    fn set_channel_when_idle_only_records() {
        let (tx, _rx) = mpsc::channel();
        let mut monitor =
            StreamMonitor::new(ServerConfig::default(), &monitor_config(100), 1, tx).unwrap();
        monitor.set_channel(42).unwrap();
        assert_eq!(monitor.channel(), 42);
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn failed_subscribe_stays_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            ..ServerConfig::default()
        };
        let (tx, rx) = mpsc::channel();
        let mut monitor = StreamMonitor::new(server, &monitor_config(100), 1, tx).unwrap();
        assert!(matches!(monitor.start(), Err(FaError::Connect { .. })));
        assert_eq!(monitor.state(), MonitorState::Idle);
        match rx.recv_timeout(WAIT).unwrap() {
            MonitorEvent::Stopped { reason } => assert!(reason.starts_with("Unable to connect")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn resize_applies_to_reads() {
        let (tx, _rx) = mpsc::channel();
        let monitor =
            StreamMonitor::new(ServerConfig::default(), &monitor_config(100), 1, tx).unwrap();
        monitor.resize(2500, 1000);
        assert_eq!(monitor.read().dim(), (2500, 2));
        monitor.set_timebase(50_000);
        let cadence = monitor.cadence();
        assert_eq!(cadence.notify_size(), 50_000);
        assert_eq!(cadence.update_size(), SCROLL_THRESHOLD);
        // Snapshots never exceed the history kept.
        assert_eq!(monitor.read().nrows(), 20_000);
    }
}
