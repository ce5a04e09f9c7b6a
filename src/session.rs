//! Per-accessory session supervisor.
//!
//! A [`Session`] owns one device's report stream and its [`DeviceState`]. It
//! polls the full state, opens the stream, applies every report in arrival
//! order and tells its [`AccessoryController`] about each change. When the
//! stream dies on its own the session restarts it with backoff, re-polling
//! first so partial updates always land on a fresh snapshot.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use strum_macros::Display;
use tokio::{
    select,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, error, info, instrument, trace, warn, Instrument, Span};

use crate::{
    accessory::AccessoryController,
    command::CommandResult,
    config::SessionConfig,
    error::{Error, Result},
    protocol::{
        codec::{FrameCodec, RxFrame},
        setting::Setting,
        state::{DeviceState, Report, TemperatureUnit},
    },
    transport::{Request, Subscription, Transport},
};

/// Decoded frames buffered between the stream reader and the model.
const FRAME_BUFFER: usize = 64;

#[derive(Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Crashed,
}

pub struct Session<T, C> {
    inner: Arc<Inner<T, C>>,
}

impl<T, C> Clone for Session<T, C> {
    fn clone(&self) -> Self {
        Session {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T, C> {
    name: String,
    transport: T,
    controller: C,
    config: SessionConfig,

    device: Mutex<Option<DeviceState>>,
    // cancelled on teardown, detaching in-flight commands
    commands: Mutex<CancellationToken>,
    supervision: Mutex<Option<StreamTask>>,
    status: watch::Sender<SessionState>,
}

struct StreamTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamTask {
    async fn stop(self) {
        self.stop.cancel();

        if let Err(err) = self.task.await {
            error!("stream task failed: {err}");
        }
    }
}

enum RunEnd {
    Expected,
    Crashed { reports: usize },
}

impl<T: Transport, C: AccessoryController> Session<T, C> {
    pub fn new(name: impl Into<String>, transport: T, controller: C, config: SessionConfig) -> Self {
        let (status, _) = watch::channel(SessionState::Idle);

        Session {
            inner: Arc::new(Inner {
                name: name.into(),
                transport,
                controller,
                config,
                device: Mutex::new(None),
                commands: Mutex::new(CancellationToken::new()),
                supervision: Mutex::new(None),
                status,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn controller(&self) -> &C {
        &self.inner.controller
    }

    pub fn status(&self) -> SessionState {
        *self.inner.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.status.subscribe()
    }

    /// A copy of the current model, if a snapshot has been taken.
    pub async fn state(&self) -> Option<DeviceState> {
        self.inner.device.lock().await.clone()
    }

    /// Poll the full state and open the report stream. A stream that is
    /// already running is stopped first.
    #[instrument(skip_all, fields(accessory = %self.inner.name))]
    pub async fn start_session(&self) -> Result<()> {
        let mut supervision = self.inner.supervision.lock().await;

        if let Some(running) = supervision.take() {
            debug!("Stopping running stream before starting a new one");
            self.inner.cancel_commands().await;
            running.stop().await;
        }

        if let Err(err) = self.inner.poll().await {
            self.inner.set_status(SessionState::Idle);
            return Err(err);
        }

        self.inner.set_status(SessionState::Starting);

        let subscription = match self.inner.transport.subscribe() {
            Ok(subscription) => subscription,
            Err(err) => {
                self.inner.set_status(SessionState::Idle);
                return Err(err);
            }
        };

        self.inner.set_status(SessionState::Streaming);
        info!("Streaming reports");

        let stop = CancellationToken::new();
        let task = tokio::spawn(self.inner.clone().supervise(subscription, stop.clone()).instrument(Span::current()));
        *supervision = Some(StreamTask { stop, task });

        Ok(())
    }

    /// Stop the stream and detach in-flight commands. Ending a session
    /// that is not running is a no-op.
    #[instrument(skip_all, fields(accessory = %self.inner.name))]
    pub async fn end_session(&self) {
        self.inner.cancel_commands().await;

        let running = self.inner.supervision.lock().await.take();
        match running {
            Some(running) => running.stop().await,
            None => debug!("No stream running"),
        }

        self.inner.set_status(SessionState::Idle);
    }

    /// Write one raw field value. A full snapshot in the command's output
    /// replaces the model.
    #[instrument(skip(self), fields(accessory = %self.inner.name))]
    pub async fn issue_command(&self, field: &str, value: i64) -> Result<CommandResult> {
        let request = Request::Set(vec![(field.to_string(), value)]);
        let result = self.inner.request(request, self.inner.config.command_timeout).await?;

        if let Some(report) = &result.snapshot {
            match DeviceState::from_full(report) {
                Ok(state) => self.inner.replace_state(state).await,
                Err(err) => debug!("set confirmation is not a full snapshot: {err}"),
            }
        }

        Ok(result)
    }

    /// Apply `setting` to the model right away, then send it to the device.
    /// The model keeps the optimistic value even if the command fails; the
    /// next report from the device settles it.
    #[instrument(skip_all, fields(accessory = %self.inner.name, %setting))]
    pub async fn apply_setting(&self, setting: Setting) -> Result<CommandResult> {
        {
            let mut device = self.inner.device.lock().await;
            let state = device.as_mut().ok_or(Error::NotReady)?;
            setting.apply(state);
            self.inner.controller.on_partial_update(state);
        }

        self.issue_command(setting.field(), setting.raw_value()).await.map_err(|err| {
            warn!("Failed to apply {setting}");
            error!("{err}");
            err
        })
    }

    /// Change the local display unit. Nothing is sent to the device.
    pub async fn set_temperature_unit(&self, unit: TemperatureUnit) -> Result<()> {
        let mut device = self.inner.device.lock().await;
        let state = device.as_mut().ok_or(Error::NotReady)?;
        state.set_temperature_unit(unit);
        self.inner.controller.on_partial_update(state);
        Ok(())
    }
}

impl<T: Transport, C: AccessoryController> Inner<T, C> {
    fn set_status(&self, status: SessionState) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("{previous} -> {status}");
        }
    }

    async fn cancel_commands(&self) {
        let mut commands = self.commands.lock().await;
        std::mem::replace(&mut *commands, CancellationToken::new()).cancel();
    }

    async fn request(&self, request: Request, timeout: Duration) -> Result<CommandResult> {
        let cancelled = self.commands.lock().await.clone();

        select! {
            biased;
            _ = cancelled.cancelled() => Err(Error::Cancelled),
            result = self.transport.request(request, timeout) => result,
        }
    }

    async fn poll(&self) -> Result<()> {
        let result = self.request(Request::Status, self.config.poll_timeout).await?;
        let report = result.snapshot.ok_or_else(|| Error::no_report("status output"))?;
        let state = DeviceState::from_full(&report)?;

        self.replace_state(state).await;
        Ok(())
    }

    /// Install a fresh snapshot, keeping the local display unit.
    async fn replace_state(&self, state: DeviceState) {
        let mut device = self.device.lock().await;
        let unit = device.as_ref().map(DeviceState::temperature_unit).unwrap_or_default();
        let state = state.with_temperature_unit(unit);

        self.controller.on_full_state(&state);
        *device = Some(state);
    }

    /// Apply one streamed report. The first report of a model-less session
    /// is taken as the full state; sessions poll before streaming, so in
    /// practice every streamed report is partial.
    async fn apply_report(&self, report: &Report) -> bool {
        let mut device = self.device.lock().await;

        match device.as_mut() {
            Some(state) => match state.apply_partial(report) {
                Ok(()) => {
                    self.controller.on_partial_update(state);
                    true
                }
                Err(err) => {
                    warn!("Dropping partial update: {err}");
                    false
                }
            },
            None => match DeviceState::from_full(report) {
                Ok(state) => {
                    self.controller.on_full_state(&state);
                    *device = Some(state);
                    true
                }
                Err(err) => {
                    warn!("Dropping first report: {err}");
                    false
                }
            },
        }
    }

    async fn apply_frame(&self, frame: RxFrame) -> bool {
        match frame {
            RxFrame::Report(report) => self.apply_report(&report).await,
            RxFrame::Echo => {
                trace!("Dropping buffer echo");
                false
            }
            RxFrame::Malformed(err) => {
                warn!("{err}");
                false
            }
        }
    }

    /// Drain one subscription until it ends or `stop` fires.
    async fn run(&self, subscription: Subscription, stop: &CancellationToken) -> RunEnd {
        let Subscription { reader, handle } = subscription;
        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_BUFFER);

        let reader = tokio::spawn(
            async move {
                let mut frames = FramedRead::new(reader, FrameCodec::new());

                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(frame) => {
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!("Stream read failed: {err}");
                            break;
                        }
                    }
                }
            }
            .instrument(Span::current()),
        );

        let mut reports = 0;
        let expected = loop {
            select! {
                biased;
                _ = stop.cancelled() => break true,
                frame = frames_rx.recv() => match frame {
                    Some(frame) => {
                        if self.apply_frame(frame).await {
                            reports += 1;
                        }
                    }
                    None => break false,
                },
            }
        };

        let grace = self.config.termination_grace;
        match tokio::time::timeout(grace, handle.close()).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => warn!("Failed to stop stream: {err}"),
            Err(_) => warn!("Stream did not stop within {grace:?}"),
        }
        reader.abort();

        if expected {
            self.set_status(SessionState::Stopping);
            debug!("Stream stopped");
        } else {
            error!("{}", Error::SessionCrashed("report stream ended unexpectedly".to_string()));
            self.set_status(SessionState::Crashed);
        }

        self.controller.on_session_ended(expected);

        if expected {
            RunEnd::Expected
        } else {
            RunEnd::Crashed { reports }
        }
    }

    /// Re-poll and reopen the stream after a crash.
    async fn resume(&self) -> Result<Subscription> {
        self.poll().await?;
        self.set_status(SessionState::Starting);
        self.transport.subscribe()
    }

    async fn supervise(self: Arc<Self>, mut subscription: Subscription, stop: CancellationToken) {
        let policy = &self.config.restart;
        let mut attempt = 0;

        loop {
            match self.run(subscription, &stop).await {
                RunEnd::Expected => return,
                RunEnd::Crashed { reports } if reports > 0 => attempt = 0,
                RunEnd::Crashed { .. } => (),
            }

            subscription = loop {
                if !policy.allows(attempt) {
                    if policy.enabled {
                        error!("Giving up on the stream after {attempt} restart attempts");
                    }
                    return;
                }

                let delay = policy.delay(attempt);
                attempt += 1;
                info!("Restarting stream in {delay:?} (attempt {attempt})");

                select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => (),
                }

                let resumed = select! {
                    biased;
                    _ = stop.cancelled() => return,
                    resumed = self.resume() => resumed,
                };

                match resumed {
                    Ok(subscription) => break subscription,
                    // commands are only cancelled when the session is torn down
                    Err(Error::Cancelled) => {
                        debug!("Restart abandoned, session is ending");
                        return;
                    }
                    Err(err) => {
                        error!("Restart failed: {err}");
                        self.set_status(SessionState::Crashed);
                    }
                }
            };

            self.set_status(SessionState::Streaming);
            info!("Streaming reports");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio::{
        io::{AsyncWriteExt, DuplexStream},
        sync::oneshot,
    };

    use super::*;
    use crate::{
        config::RestartPolicy,
        protocol::state::tests::{full_report, report},
        transport::SubscriptionHandle,
    };

    struct MockStream {
        writer: DuplexStream,
        closed: oneshot::Receiver<()>,
    }

    impl MockStream {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    struct MockHandle {
        closed: oneshot::Sender<()>,
    }

    impl SubscriptionHandle for MockHandle {
        fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>> {
            let _ = self.closed.send(());
            Box::pin(async { Ok(()) })
        }
    }

    struct MockTransport {
        status: StdMutex<String>,
        status_delay: StdMutex<Duration>,
        set_delay: Duration,
        spawn_fails: bool,
        requests: Arc<StdMutex<Vec<Request>>>,
        streams: mpsc::UnboundedSender<MockStream>,
    }

    impl MockTransport {
        fn new() -> (Self, mpsc::UnboundedReceiver<MockStream>) {
            let (streams, streams_rx) = mpsc::unbounded_channel();
            let transport = MockTransport {
                status: StdMutex::new(serde_json::to_string(&full_report()).unwrap()),
                status_delay: StdMutex::new(Duration::ZERO),
                set_delay: Duration::ZERO,
                spawn_fails: false,
                requests: Default::default(),
                streams,
            };
            (transport, streams_rx)
        }
    }

    impl Transport for MockTransport {
        fn request(&self, request: Request, _timeout: Duration) -> BoxFuture<'_, Result<CommandResult>> {
            self.requests.lock().unwrap().push(request.clone());
            let status = self.status.lock().unwrap().clone();
            let status_delay = *self.status_delay.lock().unwrap();

            Box::pin(async move {
                match request {
                    Request::Status => {
                        tokio::time::sleep(status_delay).await;
                        Ok(CommandResult::from_output(status))
                    }
                    Request::Set(_) => {
                        tokio::time::sleep(self.set_delay).await;
                        Ok(CommandResult::from_output(Bytes::new()))
                    }
                }
            })
        }

        fn subscribe(&self) -> Result<Subscription> {
            if self.spawn_fails {
                return Err(Error::SpawnFailed {
                    program: "aircontrol".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }

            let (reader, writer) = tokio::io::duplex(4096);
            let (closed_tx, closed) = oneshot::channel();
            self.streams.send(MockStream { writer, closed }).unwrap();

            Ok(Subscription {
                reader: Box::new(reader),
                handle: Box::new(MockHandle { closed: closed_tx }),
            })
        }
    }

    #[derive(Debug)]
    enum Event {
        Full(DeviceState),
        Partial(DeviceState),
        Ended(bool),
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
    }

    impl AccessoryController for Recorder {
        fn on_full_state(&self, state: &DeviceState) {
            let _ = self.events.send(Event::Full(state.clone()));
        }

        fn on_partial_update(&self, state: &DeviceState) {
            let _ = self.events.send(Event::Partial(state.clone()));
        }

        fn on_session_ended(&self, expected: bool) {
            let _ = self.events.send(Event::Ended(expected));
        }
    }

    type TestSession<T> = Session<T, Recorder>;

    fn new_session<T: Transport>(transport: T, restart: RestartPolicy) -> (TestSession<T>, mpsc::UnboundedReceiver<Event>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            termination_grace: Duration::from_secs(2),
            restart,
            ..Default::default()
        };

        (Session::new("Living Room", transport, Recorder { events }, config), events_rx)
    }

    fn fast_restart() -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            max_attempts: Some(3),
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        }
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_start_stream_and_end_session() {
        let (transport, mut streams) = MockTransport::new();
        let (session, mut events) = new_session(transport, RestartPolicy::disabled());

        session.start_session().await.unwrap();
        assert_eq!(session.status(), SessionState::Streaming);

        match next(&mut events).await {
            Event::Full(state) => {
                assert!(state.active());
                assert_eq!(state.current_temperature(), 23.5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut stream = next(&mut streams).await;
        stream.send(r#"{"type":"Buffer","data":[2,0]}"#).await;
        stream.send("not json").await;
        stream.send(r#"{"D03102":0}"#).await;

        match next(&mut events).await {
            Event::Partial(state) => {
                assert!(!state.active());
                assert_eq!(state.current_temperature(), 23.5);
            }
            other => panic!("unexpected {other:?}"),
        }

        session.end_session().await;
        assert!(matches!(next(&mut events).await, Event::Ended(true)));
        assert!(stream.closed.await.is_ok());
        assert_eq!(session.status(), SessionState::Idle);

        session.end_session().await;
        assert!(events.try_recv().is_err());
        assert!(!session.state().await.unwrap().active());
    }

    #[tokio::test]
    async fn test_stream_crash_is_unexpected() {
        let (transport, mut streams) = MockTransport::new();
        let (session, mut events) = new_session(transport, RestartPolicy::disabled());

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Full(_)));

        let stream = next(&mut streams).await;
        drop(stream.writer);

        assert!(matches!(next(&mut events).await, Event::Ended(false)));
        assert_eq!(session.status(), SessionState::Crashed);
        assert!(stream.closed.await.is_ok());

        session.end_session().await;
        assert_eq!(session.status(), SessionState::Idle);
        assert!(events.try_recv().is_err());
        assert!(streams.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_failures_leave_session_idle() {
        let (transport, mut streams) = MockTransport::new();
        *transport.status.lock().unwrap() = json!({ "D03102": 1 }).to_string();
        let (session, _events) = new_session(transport, RestartPolicy::disabled());

        let err = session.start_session().await.unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot { .. }), "{err}");
        assert_eq!(session.status(), SessionState::Idle);
        assert!(streams.try_recv().is_err());

        let (mut transport, _streams) = MockTransport::new();
        transport.spawn_fails = true;
        let (session, mut events) = new_session(transport, RestartPolicy::disabled());

        let err = session.start_session().await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }), "{err}");
        assert_eq!(session.status(), SessionState::Idle);
        assert!(matches!(next(&mut events).await, Event::Full(_)));
    }

    #[tokio::test]
    async fn test_status_without_report() {
        let (transport, _streams) = MockTransport::new();
        *transport.status.lock().unwrap() = String::new();
        let (session, _events) = new_session(transport, RestartPolicy::disabled());

        let err = session.start_session().await.unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_restart_after_crash_repolls() {
        let (transport, mut streams) = MockTransport::new();
        let requests = transport.requests.clone();
        let (session, mut events) = new_session(transport, fast_restart());

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Full(_)));

        session.set_temperature_unit(TemperatureUnit::Fahrenheit).await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Partial(_)));

        let first = next(&mut streams).await;
        drop(first.writer);
        assert!(matches!(next(&mut events).await, Event::Ended(false)));

        match next(&mut events).await {
            Event::Full(state) => assert_eq!(state.temperature_unit(), TemperatureUnit::Fahrenheit),
            other => panic!("unexpected {other:?}"),
        }

        let mut second = next(&mut streams).await;
        second.send(r#"{"D03105":1}"#).await;
        match next(&mut events).await {
            Event::Partial(state) => assert!(state.light()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.status(), SessionState::Streaming);
        assert_eq!(
            requests.lock().unwrap().iter().filter(|r| **r == Request::Status).count(),
            2
        );

        session.end_session().await;
        assert!(matches!(next(&mut events).await, Event::Ended(true)));
        assert!(second.closed.await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_gives_up() {
        let (transport, mut streams) = MockTransport::new();
        let (session, mut events) = new_session(transport, fast_restart());

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Full(_)));

        // streams that die before reporting anything do not reset the budget
        for _ in 0..3 {
            drop(next(&mut streams).await.writer);
            assert!(matches!(next(&mut events).await, Event::Ended(false)));
            assert!(matches!(next(&mut events).await, Event::Full(_)));
        }

        drop(next(&mut streams).await.writer);
        assert!(matches!(next(&mut events).await, Event::Ended(false)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.status(), SessionState::Crashed);
        assert!(streams.try_recv().is_err());
        assert!(events.try_recv().is_err());

        session.end_session().await;
        assert_eq!(session.status(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_end_session_during_restart_poll() {
        let (transport, mut streams) = MockTransport::new();
        let (session, mut events) = new_session(transport, fast_restart());

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Full(_)));

        *session.inner.transport.status_delay.lock().unwrap() = Duration::from_secs(30);
        drop(next(&mut streams).await.writer);
        assert!(matches!(next(&mut events).await, Event::Ended(false)));

        // let the backoff pass so the restart is stuck in its poll
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(1), session.end_session())
            .await
            .unwrap();
        assert_eq!(session.status(), SessionState::Idle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.status(), SessionState::Idle);
        assert!(events.try_recv().is_err());
        assert!(streams.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_first_report_without_model_is_full_state() {
        let (transport, _streams) = MockTransport::new();
        let (session, mut events) = new_session(transport, RestartPolicy::disabled());

        // a partial report cannot seed the model
        assert!(!session.inner.apply_report(&report(json!({ "D03102": 0 }))).await);
        assert!(session.state().await.is_none());
        assert!(events.try_recv().is_err());

        assert!(session.inner.apply_report(&full_report()).await);
        match next(&mut events).await {
            Event::Full(state) => assert!(state.active()),
            other => panic!("unexpected {other:?}"),
        }

        assert!(session.inner.apply_report(&report(json!({ "D03102": 0 }))).await);
        match next(&mut events).await {
            Event::Partial(state) => {
                assert!(!state.active());
                assert_eq!(state.name(), "Living Room");
            }
            other => panic!("unexpected {other:?}"),
        }

        // a report that fails to decode leaves the model untouched
        assert!(!session.inner.apply_report(&report(json!({ "D03102": "on", "D03105": 1 }))).await);
        assert!(!session.state().await.unwrap().light());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_apply_setting() {
        let (transport, _streams) = MockTransport::new();
        let requests = transport.requests.clone();
        let (session, mut events) = new_session(transport, RestartPolicy::disabled());

        assert!(matches!(session.apply_setting(Setting::Light(true)).await, Err(Error::NotReady)));
        assert!(matches!(
            session.set_temperature_unit(TemperatureUnit::Celsius).await,
            Err(Error::NotReady)
        ));

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Full(_)));

        session.apply_setting(Setting::Light(true)).await.unwrap();
        match next(&mut events).await {
            Event::Partial(state) => {
                assert!(state.light());
                assert!(state.active());
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            requests.lock().unwrap().last(),
            Some(&Request::Set(vec![("D03105".to_string(), 1)]))
        );

        session.end_session().await;
    }

    #[tokio::test]
    async fn test_end_session_cancels_inflight_command() {
        let (mut transport, _streams) = MockTransport::new();
        transport.set_delay = Duration::from_secs(30);
        let (session, _events) = new_session(transport, RestartPolicy::disabled());

        session.start_session().await.unwrap();

        let command = tokio::spawn({
            let session = session.clone();
            async move { session.issue_command("D03130", 100).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.end_session().await;

        let result = tokio::time::timeout(Duration::from_secs(1), command).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // commands issued after teardown run again
        let (transport, _streams) = MockTransport::new();
        let (session, _events) = new_session(transport, RestartPolicy::disabled());
        session.end_session().await;
        assert!(session.issue_command("D03130", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_start_replaces_stream() {
        let (transport, mut streams) = MockTransport::new();
        let (session, mut events) = new_session(transport, RestartPolicy::disabled());

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Full(_)));
        let first = next(&mut streams).await;

        session.start_session().await.unwrap();
        assert!(matches!(next(&mut events).await, Event::Ended(true)));
        assert!(matches!(next(&mut events).await, Event::Full(_)));
        assert!(first.closed.await.is_ok());

        let _second = next(&mut streams).await;
        assert_eq!(session.status(), SessionState::Streaming);

        session.end_session().await;
        assert!(matches!(next(&mut events).await, Event::Ended(true)));
    }

    #[tokio::test]
    async fn test_presentation_writes_reach_device() {
        use crate::accessory::{
            handle_write, tests::RecordingPresentation, Characteristic, HeaterCooler, Service, Value,
        };

        let (transport, _streams) = MockTransport::new();
        let requests = transport.requests.clone();
        let accessory = HeaterCooler::new(RecordingPresentation::default(), "A1B2");
        let session = Session::new("Living Room", transport, accessory, SessionConfig::default());

        session.start_session().await.unwrap();

        handle_write(&session, Service::Backlight, Characteristic::On, Value::Bool(true))
            .await
            .unwrap();
        assert_eq!(
            requests.lock().unwrap().last(),
            Some(&Request::Set(vec![("D03105".to_string(), 1)]))
        );

        handle_write(&session, Service::HeaterCooler, Characteristic::TemperatureDisplayUnits, Value::Int(1))
            .await
            .unwrap();
        assert_eq!(session.state().await.unwrap().temperature_unit(), TemperatureUnit::Fahrenheit);
        assert_eq!(requests.lock().unwrap().len(), 2);

        handle_write(&session, Service::HeaterCooler, Characteristic::Name, "Bedroom".into())
            .await
            .unwrap();
        assert_eq!(requests.lock().unwrap().len(), 2);

        session.end_session().await;
    }

    #[cfg(unix)]
    mod process {
        use std::path::Path;

        use super::*;
        use crate::{config::DeviceConfig, transport::AirControl};

        fn aircontrol(dir: &Path, observe: &str) -> AirControl {
            let status = serde_json::to_string(&full_report()).unwrap();
            let script = format!(
                "case \"$*\" in\n  *status-observe*) {observe} ;;\n  *status*) echo '{status}' ;;\nesac\n"
            );

            let path = dir.join("aircontrol.sh");
            std::fs::write(&path, script).unwrap();

            AirControl::new(path, DeviceConfig::new("127.0.0.1")).with_interpreter("sh", vec![])
        }

        #[tokio::test]
        async fn test_teardown_kills_stream_process() {
            let dir = tempfile::tempdir().unwrap();
            let transport = aircontrol(dir.path(), r#"echo '{"D03102":0}'; exec sleep 30"#);
            let (session, mut events) = new_session(transport, RestartPolicy::disabled());

            session.start_session().await.unwrap();
            assert!(matches!(next(&mut events).await, Event::Full(_)));
            match next(&mut events).await {
                Event::Partial(state) => assert!(!state.active()),
                other => panic!("unexpected {other:?}"),
            }

            let start = std::time::Instant::now();
            session.end_session().await;
            assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());

            assert!(matches!(next(&mut events).await, Event::Ended(true)));
            assert!(events.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_undecodable_stderr_does_not_end_stream() {
            let dir = tempfile::tempdir().unwrap();
            let transport = aircontrol(
                dir.path(),
                r#"printf '\377\n' >&2; sleep 0.5; echo more >&2; echo '{"D03102":0}'; exec sleep 30"#,
            );
            let (session, mut events) = new_session(transport, RestartPolicy::disabled());

            session.start_session().await.unwrap();
            assert!(matches!(next(&mut events).await, Event::Full(_)));
            match next(&mut events).await {
                Event::Partial(state) => assert!(!state.active()),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(session.status(), SessionState::Streaming);

            session.end_session().await;
            assert!(matches!(next(&mut events).await, Event::Ended(true)));
        }

        #[tokio::test]
        async fn test_stream_process_exit_is_a_crash() {
            let dir = tempfile::tempdir().unwrap();
            let transport = aircontrol(dir.path(), r#"echo '{"D03102":0}'; exit 1"#);
            let (session, mut events) = new_session(transport, RestartPolicy::disabled());

            session.start_session().await.unwrap();
            assert!(matches!(next(&mut events).await, Event::Full(_)));
            assert!(matches!(next(&mut events).await, Event::Partial(_)));
            assert!(matches!(next(&mut events).await, Event::Ended(false)));
            assert_eq!(session.status(), SessionState::Crashed);

            session.end_session().await;
            assert!(events.try_recv().is_err());
        }
    }
}
