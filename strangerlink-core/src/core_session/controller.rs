/*
   SessionController

   Owns everything one client has in flight: the participant, the search
   task, the live channel and endpoint, the media capture and the message
   history. The rest of the application talks to it only through a
   `SessionHandle`, which packages each call as a `SessionCommand` and waits
   for the reply on a oneshot.

   Inputs are multiplexed in a single select loop:

    ┌──────────────┐   commands    ┌────────────────────────────────────┐
    │ SessionHandle│──────────────►│          SessionController         │
    └──────────────┘               │                                    │
                                   │  search task ─► Match              │
    ┌──────────────┐   events      │  peer channel ─► WireFrame         │
    │ presentation │◄──────────────│  safety queue ─► SafetyOutcome     │
    └──────────────┘               │  frame ticker (while Connected)    │
                                   └────────────────────────────────────┘

   Status: Idle -> Searching -> Connected -> Disconnected, with skip
   tearing down and going straight back to Searching.
*/

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::errors::{SessionError, SessionResult};
use super::media::{MediaCapture, MediaSource};
use super::types::{
    Message, Participant, SessionEvent, SessionSnapshot, SessionStatus, WireFrame,
};
use crate::config::Config;
use crate::core_rendezvous::{
    Match, MatchError, MatchingOrchestrator, PeerChannel, PeerEndpoint, PeerMetadata,
    PeerTransport,
};
use crate::core_safety::{FrameSampler, SafetyClassifier, SafetyOutcome, SafetyScheduler};
use crate::metrics::{self, MESSAGES_RECEIVED, MESSAGES_SENT};

const COMMAND_BUFFER: usize = 32;

/// External collaborators a session runs against
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn PeerTransport>,
    pub classifier: Arc<dyn SafetyClassifier>,
    pub media: Arc<dyn MediaSource>,
    /// Fixes slot ordering, for tests and simulations
    pub seed: Option<u64>,
}

impl SessionDeps {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        classifier: Arc<dyn SafetyClassifier>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        Self {
            transport,
            classifier,
            media,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Commands sent to the controller
#[derive(Debug)]
enum SessionCommand {
    StartSearch {
        participant: Participant,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<SessionResult<Message>>,
    },
    Skip {
        reply: oneshot::Sender<SessionResult<()>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    SetVideoEnabled {
        enabled: bool,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Exit {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running session controller
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Spawn a controller; returns the handle, the event stream and the task
    pub fn spawn(
        config: &Config,
        deps: SessionDeps,
    ) -> (Self, mpsc::Receiver<SessionEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(config.session.event_buffer);

        let controller = SessionController::new(config, deps, command_rx, event_tx);
        let task = tokio::spawn(controller.run());

        (SessionHandle { command_tx }, event_rx, task)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        response.await.map_err(|_| SessionError::ControllerClosed)
    }

    /// Begin searching as `participant`
    pub async fn start_search(&self, participant: Participant) -> SessionResult<()> {
        self.request(|reply| SessionCommand::StartSearch { participant, reply })
            .await?
    }

    /// Send a chat message; only valid while connected
    pub async fn send_text(&self, text: impl Into<String>) -> SessionResult<Message> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendText { text, reply })
            .await?
    }

    /// Tear down the current partner or search and look for someone new
    pub async fn skip(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Skip { reply }).await?
    }

    pub async fn set_muted(&self, muted: bool) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetMuted { muted, reply })
            .await?
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetVideoEnabled { enabled, reply })
            .await?
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Release every resource and stop the controller. Safe to call again.
    pub async fn exit(&self) -> SessionResult<()> {
        match self.request(|reply| SessionCommand::Exit { reply }).await {
            Ok(()) | Err(SessionError::ControllerClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct ActiveSession {
    channel: PeerChannel,
    endpoint: Box<dyn PeerEndpoint>,
    peer: PeerMetadata,
    /// Partner's incoming video, sampled for moderation
    remote_video: Option<Box<dyn FrameSampler>>,
}

type SearchTask = JoinHandle<Result<Match, MatchError>>;

struct SessionController {
    orchestrator: Arc<MatchingOrchestrator>,
    media_source: Arc<dyn MediaSource>,
    safety: SafetyScheduler,
    commands: mpsc::Receiver<SessionCommand>,
    outcomes: mpsc::Receiver<SafetyOutcome>,
    events: mpsc::Sender<SessionEvent>,
    frame_ticker: Interval,

    participant: Option<Participant>,
    status: SessionStatus,
    /// Bumped on every new search so stale safety outcomes can be dropped
    epoch: u64,
    search: Option<SearchTask>,
    active: Option<ActiveSession>,
    media: Option<Box<dyn MediaCapture>>,
    history: Vec<Message>,
    muted: bool,
    video_enabled: bool,
}

async fn join_search(search: &mut Option<SearchTask>) -> Result<Result<Match, MatchError>, JoinError> {
    match search {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn recv_frame(active: &mut Option<ActiveSession>) -> Option<Vec<u8>> {
    match active {
        Some(session) => session.channel.recv().await,
        None => std::future::pending().await,
    }
}

fn frame_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl SessionController {
    fn new(
        config: &Config,
        deps: SessionDeps,
        commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let mut orchestrator = MatchingOrchestrator::new(deps.transport, &config.matching);
        if let Some(seed) = deps.seed {
            orchestrator = orchestrator.with_seed(seed);
        }
        let (safety, outcomes) = SafetyScheduler::new(
            deps.classifier,
            config.safety.classifier_timeout,
            config.session.event_buffer,
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            media_source: deps.media,
            safety,
            commands,
            outcomes,
            events,
            frame_ticker: frame_ticker(config.safety.frame_scan_interval),
            participant: None,
            status: SessionStatus::Idle,
            epoch: 0,
            search: None,
            active: None,
            media: None,
            history: Vec::new(),
            muted: false,
            video_enabled: true,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                result = join_search(&mut self.search) => {
                    self.search = None;
                    self.on_search_finished(result).await;
                }

                frame = recv_frame(&mut self.active) => match frame {
                    Some(bytes) => self.on_peer_frame(&bytes).await,
                    None => self.on_partner_gone().await,
                },

                Some(outcome) = self.outcomes.recv() => self.on_safety_outcome(outcome),

                _ = self.frame_ticker.tick(), if self.status == SessionStatus::Connected => {
                    self.sample_frame();
                }
            }
        }
        debug!("session controller stopped");
    }

    /// Returns false once the controller should stop
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::StartSearch { participant, reply } => {
                let _ = reply.send(self.start_search(participant).await);
            }
            SessionCommand::SendText { text, reply } => {
                let _ = reply.send(self.send_text(text).await);
            }
            SessionCommand::Skip { reply } => {
                let _ = reply.send(self.skip().await);
            }
            SessionCommand::SetMuted { muted, reply } => {
                self.muted = muted;
                if let Some(media) = self.media.as_mut() {
                    media.set_audio_enabled(!muted);
                }
                let _ = reply.send(Ok(()));
            }
            SessionCommand::SetVideoEnabled { enabled, reply } => {
                self.video_enabled = enabled;
                if let Some(media) = self.media.as_mut() {
                    media.set_video_enabled(enabled);
                }
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Exit { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Never waits on the presentation layer; a full queue drops the event
    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        let peer = self.active.as_ref().map(|session| session.peer.clone());
        self.emit(SessionEvent::StatusChanged { status, peer });
    }

    fn append(&mut self, message: Message) {
        self.history.push(message.clone());
        self.emit(SessionEvent::MessageAppended(message));
    }

    fn notice(&mut self, text: impl Into<String>) {
        self.append(Message::system(text));
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            peer: self.active.as_ref().map(|session| session.peer.clone()),
            history: self.history.clone(),
            muted: self.muted,
            video_enabled: self.video_enabled,
        }
    }

    async fn start_search(&mut self, participant: Participant) -> SessionResult<()> {
        if self.search.is_some() || self.active.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        if self.media.is_none() {
            match self.media_source.acquire().await {
                Ok(mut capture) => {
                    capture.set_audio_enabled(!self.muted);
                    capture.set_video_enabled(self.video_enabled);
                    self.media = Some(capture);
                }
                Err(e) => {
                    warn!(error = %e, "media unavailable, not starting");
                    self.emit(SessionEvent::StartFailed(e.to_string()));
                    self.notice("Permissions required for video chat.");
                    return Err(SessionError::Media(e));
                }
            }
        }

        info!(local_id = %participant.local_id, interests = ?participant.interests, "session starting");
        self.participant = Some(participant);
        self.begin_search().await;
        Ok(())
    }

    async fn begin_search(&mut self) {
        let Some(participant) = self.participant.as_ref() else {
            return;
        };
        let metadata = participant.metadata();
        self.epoch += 1;

        let orchestrator = self.orchestrator.clone();
        self.search = Some(tokio::spawn(async move {
            orchestrator.find_match(&metadata).await
        }));
        self.set_status(SessionStatus::Searching);
    }

    /// Abort the search task and wait until everything it held is dropped
    async fn cancel_search(&mut self) {
        if let Some(task) = self.search.take() {
            task.abort();
            let _ = task.await;
        }
    }

    /// Drop the live session, telling the partner first when `notify`
    async fn release_session(&mut self, notify: bool) {
        if let Some(mut session) = self.active.take() {
            if notify {
                if let Ok(bye) = WireFrame::Bye.encode() {
                    let _ = session.channel.try_send(bye);
                }
            }
            session.channel.close();
            session.endpoint.close().await;
            debug!(peer = %session.peer.peer_id, "session released");
        }
    }

    async fn skip(&mut self) -> SessionResult<()> {
        if self.participant.is_none() {
            return Err(SessionError::NotStarted);
        }
        self.cancel_search().await;
        self.release_session(true).await;
        self.history.clear();
        self.emit(SessionEvent::HistoryCleared);
        self.begin_search().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.cancel_search().await;
        self.release_session(true).await;
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        if self.status != SessionStatus::Idle {
            self.set_status(SessionStatus::Idle);
        }
        info!("session exited");
    }

    async fn send_text(&mut self, text: String) -> SessionResult<Message> {
        if !self.status.can_compose() {
            return Err(SessionError::NotConnected);
        }
        let local_id = match self.participant.as_ref() {
            Some(participant) => participant.local_id.clone(),
            None => return Err(SessionError::NotConnected),
        };
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let message = Message::text(local_id, text);
        let payload = WireFrame::from(&message).encode()?;
        // A partner that stops draining its channel is treated as gone
        let sent = match self.active.as_ref() {
            Some(session) => session.channel.try_send(payload),
            None => return Err(SessionError::NotConnected),
        };
        if let Err(e) = sent {
            warn!(error = %e, "chat frame not delivered");
            self.on_partner_gone().await;
            return Err(SessionError::Transport(e));
        }
        metrics::record_counter(MESSAGES_SENT, 1);

        self.append(message.clone());
        self.safety
            .check_text(self.epoch, message.id.clone(), message.text.clone());
        Ok(message)
    }

    async fn on_search_finished(&mut self, result: Result<Result<Match, MatchError>, JoinError>) {
        match result {
            Ok(Ok(found)) => self.enter_connected(found),
            Ok(Err(MatchError::RoundsExhausted(rounds))) => {
                info!(rounds, "search gave up");
                self.set_status(SessionStatus::Disconnected);
                self.notice("No partner found. Try again.");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "search rejected");
                self.set_status(SessionStatus::Disconnected);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                warn!(error = %e, "search task failed");
                self.set_status(SessionStatus::Disconnected);
            }
        }
    }

    fn enter_connected(&mut self, found: Match) {
        let peer = found.channel.remote_metadata().clone();
        info!(peer = %peer.peer_id, role = ?found.role, "partner connected");

        let local_interests = self
            .participant
            .as_ref()
            .map(|p| p.interests.clone())
            .unwrap_or_default();
        let shared: Vec<String> = local_interests
            .iter()
            .filter(|mine| {
                peer.interests
                    .iter()
                    .any(|theirs| theirs.eq_ignore_ascii_case(mine))
            })
            .cloned()
            .collect();
        let topics = if shared.is_empty() { local_interests } else { shared };

        let remote_video = self.media_source.remote_feed(&peer);
        self.active = Some(ActiveSession {
            channel: found.channel,
            endpoint: found.endpoint,
            peer: peer.clone(),
            remote_video,
        });
        self.frame_ticker.reset();
        self.set_status(SessionStatus::Connected);
        self.notice(format!("You are now chatting with {}.", peer.display_name));
        self.safety.fetch_ice_breakers(self.epoch, topics);
    }

    async fn on_peer_frame(&mut self, bytes: &[u8]) {
        match WireFrame::decode(bytes) {
            Ok(WireFrame::Chat {
                id,
                sender_id,
                text,
                timestamp,
                kind,
            }) => {
                metrics::record_counter(MESSAGES_RECEIVED, 1);
                self.append(Message {
                    id,
                    sender_id,
                    text,
                    timestamp,
                    kind,
                });
            }
            Ok(WireFrame::Bye) => self.on_partner_gone().await,
            Err(e) => debug!(error = %e, "ignoring malformed frame"),
        }
    }

    async fn on_partner_gone(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.release_session(false).await;
        self.set_status(SessionStatus::Disconnected);
        self.notice("Partner disconnected.");
    }

    fn on_safety_outcome(&mut self, outcome: SafetyOutcome) {
        if outcome.epoch() != self.epoch {
            trace!(epoch = outcome.epoch(), current = self.epoch, "dropping stale safety outcome");
            return;
        }
        match outcome {
            SafetyOutcome::Text { verdict, .. } => {
                if !verdict.is_safe {
                    let reason = verdict.reason.unwrap_or_else(|| "unsafe".to_string());
                    self.notice(format!("Message flagged: {}.", reason));
                }
            }
            SafetyOutcome::Frame { verdict, .. } => {
                if verdict.blur_required && self.status == SessionStatus::Connected {
                    self.emit(SessionEvent::VideoBlurred);
                    self.notice("Video blurred by moderation.");
                }
            }
            SafetyOutcome::IceBreakers { suggestions, .. } => {
                if self.status == SessionStatus::Connected {
                    self.emit(SessionEvent::IceBreakers(suggestions));
                }
            }
        }
    }

    fn sample_frame(&mut self) {
        // Scanning pauses while the local camera is off
        if !self.video_enabled {
            return;
        }
        let frame = self
            .active
            .as_mut()
            .and_then(|session| session.remote_video.as_mut())
            .and_then(|feed| feed.sample_frame());
        if let Some(frame) = frame {
            self.safety.check_frame(self.epoch, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_rendezvous::MemoryNetwork;
    use crate::core_safety::PermissiveClassifier;
    use crate::core_session::media::NullMediaSource;
    use crate::test_utils::{participant, recv_until, test_config, DeniedMediaSource};

    fn deps(network: &Arc<MemoryNetwork>) -> SessionDeps {
        SessionDeps::new(
            network.clone(),
            Arc::new(PermissiveClassifier),
            Arc::new(NullMediaSource),
        )
    }

    fn assert_send_sync<T: Send + Sync + ?Sized>() {}

    #[test]
    fn test_controller_state_crosses_threads() {
        assert_send_sync::<Box<dyn MediaCapture>>();
        assert_send_sync::<Box<dyn FrameSampler>>();
        assert_send_sync::<SessionController>();
    }

    #[tokio::test]
    async fn test_commands_before_start() {
        let network = Arc::new(MemoryNetwork::new());
        let (handle, _events, _task) = SessionHandle::spawn(&test_config(), deps(&network));

        assert_eq!(handle.send_text("hi").await, Err(SessionError::NotConnected));
        assert_eq!(handle.skip().await, Err(SessionError::NotStarted));
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert!(snapshot.history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_searching_blocks_composition() {
        let network = Arc::new(MemoryNetwork::new());
        let (handle, mut events, _task) = SessionHandle::spawn(&test_config(), deps(&network));

        handle.start_search(participant("a", &[])).await.unwrap();
        recv_until(&mut events, |e| {
            matches!(e, SessionEvent::StatusChanged { status: SessionStatus::Searching, .. })
        })
        .await;

        assert_eq!(handle.send_text("hello").await, Err(SessionError::NotConnected));
        assert_eq!(
            handle.start_search(participant("a", &[])).await,
            Err(SessionError::AlreadyStarted)
        );
    }

    #[tokio::test]
    async fn test_media_denial_is_fatal_to_start() {
        let network = Arc::new(MemoryNetwork::new());
        let deps = SessionDeps::new(
            network.clone(),
            Arc::new(PermissiveClassifier),
            Arc::new(DeniedMediaSource),
        );
        let (handle, mut events, _task) = SessionHandle::spawn(&test_config(), deps);

        let result = handle.start_search(participant("a", &[])).await;
        assert!(matches!(result, Err(SessionError::Media(_))));
        assert!(matches!(events.recv().await, Some(SessionEvent::StartFailed(_))));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert!(snapshot.history[0].is_system());
        assert!(network.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_reflected_in_snapshot() {
        let network = Arc::new(MemoryNetwork::new());
        let (handle, _events, _task) = SessionHandle::spawn(&test_config(), deps(&network));

        handle.set_muted(true).await.unwrap();
        handle.set_video_enabled(false).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.muted);
        assert!(!snapshot.video_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_twice_is_ok() {
        let network = Arc::new(MemoryNetwork::new());
        let (handle, _events, task) = SessionHandle::spawn(&test_config(), deps(&network));

        handle.start_search(participant("a", &[])).await.unwrap();
        handle.exit().await.unwrap();
        handle.exit().await.unwrap();
        task.await.unwrap();

        assert!(network.registered().is_empty());
        assert_eq!(handle.snapshot().await, Err(SessionError::ControllerClosed));
    }
}
