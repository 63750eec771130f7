use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::decoder::{self, DecodeError};
use crate::device::state::{ObservedState, TransitionKind};
use crate::device::{self, CommandRequest, DeviceFamily, DeviceStateValue};
use crate::mqtt::client::MqttSession;
use crate::mqtt::{ConnectError, InboundMessage, TransportLink};

use super::wait::{WaitPolicy, poll_until};
use super::{Ack, CommandError, QueryError, SessionPhase};

/// A classified state change, handed to the registered listener.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub kind: TransitionKind,
    pub previous: Option<DeviceStateValue>,
    pub value: DeviceStateValue,
}

type TransitionListener = Box<dyn Fn(&TransitionEvent) + Send + Sync>;

/// Synchronizes local belief state with one device over a broker session.
///
/// The inbound task spawned by `start()` is the sole writer of the observed
/// state; every other operation takes snapshots under a short-held lock.
/// Waits (`query_state`, command confirmation) poll those snapshots and are
/// always bounded.
pub struct SyncEngine {
    config: Config,
    shared: Arc<EngineShared>,
    link: Mutex<Option<Arc<dyn TransportLink>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

struct EngineShared {
    family: DeviceFamily,
    observed: Mutex<ObservedState>,
    phase: Mutex<SessionPhase>,
    listener: Mutex<Option<TransitionListener>>,
}

impl EngineShared {
    fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("phase lock")
    }

    fn set_phase(&self, next: SessionPhase) {
        *self.phase.lock().expect("phase lock") = next;
    }

    fn is_running(&self) -> bool {
        self.phase() == SessionPhase::Running
    }

    fn snapshot(&self) -> Option<DeviceStateValue> {
        self.observed.lock().expect("state lock").value()
    }

    /// Inbound path: decode, update belief, notify on real transitions.
    /// Decode failures are logged and dropped; they never end the session.
    fn handle_inbound(&self, msg: &InboundMessage) {
        debug!(
            "Message from `{}`: {}",
            msg.topic,
            String::from_utf8_lossy(&msg.payload)
        );

        let value = match decoder::decode(&msg.payload, self.family) {
            Ok(value) => value,
            Err(DecodeError::MissingField(field)) => {
                debug!("Ignoring message without usable `{field}` field");
                return;
            }
            Err(e) => {
                warn!("Failed to parse status message: {e}");
                return;
            }
        };

        let (kind, previous, steady_for) = {
            let mut observed = self.observed.lock().expect("state lock");
            let previous = observed.value();
            let steady_for = observed.last_changed_at().map(|at| at.elapsed());
            (observed.observe(value), previous, steady_for)
        };

        match kind {
            TransitionKind::InitialObservation => debug!("Initial observation: {value}"),
            TransitionKind::Changed => {
                if let (Some(previous), Some(steady_for)) = (previous, steady_for) {
                    debug!("State changed: {previous} -> {value} (held {steady_for:?})");
                }
            }
            TransitionKind::Unchanged => return,
        }

        let event = TransitionEvent {
            kind,
            previous,
            value,
        };
        if let Some(listener) = &*self.listener.lock().expect("listener lock") {
            listener(&event);
        }
    }
}

impl SyncEngine {
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                family: config.device.family,
                observed: Mutex::new(ObservedState::new()),
                phase: Mutex::new(SessionPhase::Created),
                listener: Mutex::new(None),
            }),
            link: Mutex::new(None),
            inbound_task: Mutex::new(None),
            config,
        }
    }

    /// Register a callback for initial observations and state changes.
    /// Long-running monitors use this to log transitions as they happen.
    pub fn set_transition_listener(
        &self,
        listener: impl Fn(&TransitionEvent) + Send + Sync + 'static,
    ) {
        *self.shared.listener.lock().expect("listener lock") = Some(Box::new(listener));
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Open a broker session under a freshly minted client id, subscribe to
    /// the status topic, and prompt an immediate status push. Returns once
    /// the session is established; it does not wait for an observation.
    pub async fn start(&self) -> Result<(), ConnectError> {
        {
            let mut phase = self.shared.phase.lock().expect("phase lock");
            match *phase {
                SessionPhase::Connecting | SessionPhase::Connected | SessionPhase::Running => {
                    return Err(ConnectError::SessionActive);
                }
                _ => *phase = SessionPhase::Connecting,
            }
        }

        let client_id = self.config.device.mint_client_id();
        info!(
            "Connecting to {}:{} as `{client_id}`",
            self.config.broker.host, self.config.broker.port
        );
        if self.shared.observed.lock().expect("state lock").received() {
            debug!("Belief from the previous session is retained until refreshed");
        }

        let (session, mut inbound) =
            match MqttSession::connect(&self.config.broker, &self.config.device, &client_id).await
            {
                Ok(established) => established,
                Err(e) => {
                    self.shared.set_phase(SessionPhase::Failed);
                    return Err(e);
                }
            };
        self.shared.set_phase(SessionPhase::Connected);

        let link: Arc<dyn TransportLink> = Arc::new(session);
        info!("Requesting state from `{}`", self.config.device.get_topic);
        if let Err(e) = link
            .publish(&self.config.device.get_topic, device::state_query_payload())
            .await
        {
            warn!("Failed to request device state: {e}");
        }
        *self.link.lock().expect("link lock") = Some(Arc::clone(&link));

        self.shared.set_phase(SessionPhase::Running);

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                shared.handle_inbound(&msg);
            }
            // The transport closes the stream only when the connection is
            // gone. stop() tears the session down itself.
            let mut phase = shared.phase.lock().expect("phase lock");
            if *phase == SessionPhase::Running {
                warn!("Broker connection lost");
                *phase = SessionPhase::Failed;
            }
        });
        *self.inbound_task.lock().expect("task lock") = Some(task);

        Ok(())
    }

    /// Non-blocking read of the last observed state.
    pub fn current_state(&self) -> Option<DeviceStateValue> {
        self.shared.snapshot()
    }

    /// Block the caller (not the inbound path) until an observation exists
    /// or the budget runs out, polling at the configured cadence.
    pub async fn query_state(&self, timeout: Duration) -> Result<DeviceStateValue, QueryError> {
        let policy = WaitPolicy::new(timeout, self.config.wait.query_interval);
        let outcome = poll_until(policy, || {
            if !self.shared.is_running() {
                return Some(Err(QueryError::NotConnected));
            }
            self.shared.snapshot().map(Ok)
        })
        .await;
        outcome.unwrap_or(Err(QueryError::Timeout))
    }

    /// Validate and publish a command. With `confirm`, poll the observed
    /// state until it matches the commanded target or the budget runs out;
    /// a confirmation timeout means the command went out but the state
    /// change was never seen, not that the publish failed.
    pub async fn send_command(
        &self,
        cmd: &CommandRequest,
        confirm: bool,
        timeout: Duration,
    ) -> Result<Ack, CommandError> {
        let (target, payload) = self
            .config
            .device
            .family
            .resolve_command(cmd.as_str())
            .ok_or_else(|| CommandError::InvalidCommand(cmd.as_str().to_string()))?;

        if !self.shared.is_running() {
            return Err(CommandError::NotConnected);
        }
        let link = self
            .link
            .lock()
            .expect("link lock")
            .clone()
            .ok_or(CommandError::NotConnected)?;
        let topic = self
            .config
            .device
            .command_topic
            .as_deref()
            .ok_or_else(|| CommandError::InvalidCommand(cmd.as_str().to_string()))?;

        info!(
            "Publishing to `{topic}`: {}",
            String::from_utf8_lossy(&payload)
        );
        link.publish(topic, payload).await?;

        if !confirm {
            return Ok(Ack::Sent);
        }

        let policy = WaitPolicy::new(timeout, self.config.wait.confirm_interval);
        let outcome = poll_until(policy, || {
            if !self.shared.is_running() {
                return Some(Err(CommandError::NotConnected));
            }
            (self.shared.snapshot() == Some(target)).then_some(Ok(Ack::Confirmed))
        })
        .await;
        outcome.unwrap_or(Err(CommandError::ConfirmationTimeout))
    }

    /// End the session. Safe to call repeatedly and concurrently with an
    /// in-flight wait; waiters observe the phase change on their next poll.
    pub async fn stop(&self) {
        let link = self.link.lock().expect("link lock").take();
        let task = self.inbound_task.lock().expect("task lock").take();
        self.shared.set_phase(SessionPhase::Stopped);

        if let Some(task) = task {
            task.abort();
        }
        if let Some(link) = link {
            link.disconnect().await;
            info!("Disconnected from MQTT broker");
        }
    }

    #[cfg(test)]
    fn install_link(&self, link: Arc<dyn TransportLink>) {
        *self.link.lock().expect("link lock") = Some(link);
        self.shared.set_phase(SessionPhase::Running);
    }

    #[cfg(test)]
    fn inject(&self, payload: &[u8]) {
        self.shared.handle_inbound(&InboundMessage {
            topic: self.config.device.status_topic.clone(),
            payload: payload.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::{BrokerConfig, DeviceConfig, WaitConfig};
    use crate::device::{ContactState, PowerState};
    use crate::mqtt::PublishError;

    use super::*;

    #[derive(Default)]
    struct FakeLink {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail_publish: bool,
        disconnects: AtomicUsize,
    }

    impl FakeLink {
        fn failing() -> Self {
            Self {
                fail_publish: true,
                ..Self::default()
            }
        }

        fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransportLink for FakeLink {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail_publish {
                return Err(PublishError("broker rejected publish".into()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(family: DeviceFamily) -> Config {
        let status_topic = match family {
            DeviceFamily::Plug => "zigbee2mqtt/Power Plug",
            DeviceFamily::ContactSensor => "zigbee2mqtt/Contact Sensor",
            DeviceFamily::LeakSensor => "zigbee2mqtt/Water Leak Detector",
        }
        .to_string();
        let command_topic = matches!(family, DeviceFamily::Plug)
            .then(|| format!("{status_topic}/set"));

        Config {
            broker: BrokerConfig {
                host: "localhost".into(),
                port: 1883,
                username: None,
                password: None,
                connect_timeout: Duration::from_secs(10),
            },
            device: DeviceConfig {
                family,
                get_topic: format!("{status_topic}/get"),
                command_topic,
                status_topic,
                client_id_prefix: "test-client".into(),
            },
            wait: WaitConfig {
                query_timeout: Duration::from_secs(5),
                query_interval: Duration::from_millis(500),
                confirm_timeout: Duration::from_secs(10),
                confirm_interval: Duration::from_secs(1),
            },
        }
    }

    fn running_engine(family: DeviceFamily) -> (Arc<SyncEngine>, Arc<FakeLink>) {
        let engine = Arc::new(SyncEngine::new(config(family)));
        let link = Arc::new(FakeLink::default());
        engine.install_link(link.clone());
        (engine, link)
    }

    #[tokio::test]
    async fn invalid_command_is_rejected_without_publishing() {
        let (engine, link) = running_engine(DeviceFamily::Plug);
        let err = engine
            .send_command(&CommandRequest::new("toggle"), false, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidCommand(_)));
        assert!(link.published().is_empty());
    }

    #[tokio::test]
    async fn sensors_reject_every_command() {
        let (engine, link) = running_engine(DeviceFamily::ContactSensor);
        let err = engine
            .send_command(&CommandRequest::new("on"), false, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidCommand(_)));
        assert!(link.published().is_empty());
    }

    #[tokio::test]
    async fn commands_require_an_active_session() {
        let engine = SyncEngine::new(config(DeviceFamily::Plug));
        let err = engine
            .send_command(&CommandRequest::new("on"), false, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected));
    }

    #[tokio::test]
    async fn fire_and_forget_publishes_the_exact_payload() {
        let (engine, link) = running_engine(DeviceFamily::Plug);
        let ack = engine
            .send_command(&CommandRequest::new("on"), false, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(ack, Ack::Sent);

        let published = link.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "zigbee2mqtt/Power Plug/set");
        assert_eq!(published[0].1, br#"{"state":"ON"}"#);
    }

    #[tokio::test]
    async fn publish_failure_is_surfaced_to_the_caller() {
        let engine = SyncEngine::new(config(DeviceFamily::Plug));
        engine.install_link(Arc::new(FakeLink::failing()));
        let err = engine
            .send_command(&CommandRequest::new("off"), false, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::PublishFailed(_)));
        // A failed publish does not end the session.
        assert_eq!(engine.phase(), SessionPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_succeeds_when_the_device_echoes_the_state() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);

        let echo = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            echo.inject(br#"{"state":"ON"}"#);
        });

        let start = tokio::time::Instant::now();
        let ack = engine
            .send_command(&CommandRequest::new("on"), true, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(ack, Ack::Confirmed);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_times_out_when_the_device_stays_silent() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);

        let start = tokio::time::Instant::now();
        let err = engine
            .send_command(&CommandRequest::new("on"), true, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ConfirmationTimeout));
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_ignores_a_stale_opposite_state() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);
        engine.inject(br#"{"state":"OFF"}"#);

        let err = engine
            .send_command(&CommandRequest::new("on"), true, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ConfirmationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_confirmation_wait() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);

        let stopper = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stopper.stop().await;
        });

        let start = tokio::time::Instant::now();
        let err = engine
            .send_command(&CommandRequest::new("on"), true, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn query_returns_an_observation_that_arrives_mid_wait() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);

        let echo = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            echo.inject(br#"{"state":"OFF"}"#);
        });

        let state = engine.query_state(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, DeviceStateValue::Power(PowerState::Off));
    }

    #[tokio::test(start_paused = true)]
    async fn query_times_out_when_nothing_arrives() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);

        let start = tokio::time::Instant::now();
        let err = engine.query_state(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, QueryError::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(5));
        // The failed query fabricates nothing.
        assert_eq!(engine.current_state(), None);
    }

    #[tokio::test]
    async fn query_without_a_session_reports_not_connected() {
        let engine = SyncEngine::new(config(DeviceFamily::Plug));
        let err = engine.query_state(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, QueryError::NotConnected);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (engine, link) = running_engine(DeviceFamily::Plug);
        engine.stop().await;
        engine.stop().await;
        assert_eq!(link.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(engine.phase(), SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn inbound_messages_update_state_and_notify_the_listener() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);
        let events: Arc<Mutex<Vec<(TransitionKind, DeviceStateValue)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.set_transition_listener(move |event| {
            sink.lock().unwrap().push((event.kind, event.value));
        });

        engine.inject(br#"{"state":"ON"}"#);
        engine.inject(br#"{"state":"ON"}"#);
        engine.inject(br#"{"state":"OFF"}"#);

        assert_eq!(
            engine.current_state(),
            Some(DeviceStateValue::Power(PowerState::Off))
        );
        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (
                    TransitionKind::InitialObservation,
                    DeviceStateValue::Power(PowerState::On)
                ),
                (
                    TransitionKind::Changed,
                    DeviceStateValue::Power(PowerState::Off)
                ),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_inbound_leaves_state_untouched() {
        let (engine, _link) = running_engine(DeviceFamily::Plug);
        engine.inject(b"not json");
        engine.inject(br#"{"battery":97}"#);
        assert_eq!(engine.current_state(), None);

        engine.inject(br#"{"state":"ON"}"#);
        engine.inject(b"{\"state\":");
        assert_eq!(
            engine.current_state(),
            Some(DeviceStateValue::Power(PowerState::On))
        );
    }

    #[tokio::test]
    async fn contact_observations_round_trip() {
        let (engine, _link) = running_engine(DeviceFamily::ContactSensor);
        engine.inject(br#"{"contact":false}"#);
        assert_eq!(
            engine.current_state(),
            Some(DeviceStateValue::Contact(ContactState::Open))
        );
        engine.inject(br#"{"contact":true}"#);
        assert_eq!(
            engine.current_state(),
            Some(DeviceStateValue::Contact(ContactState::Closed))
        );
    }
}
