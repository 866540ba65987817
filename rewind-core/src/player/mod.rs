//! The playback state machine.
//!
//! One actor thread owns every piece of mutable playback state.  Inputs
//! arrive as [`PlayerCommand`] messages, completions from the source worker
//! arrive as generation-tagged events, and timers are timed waits on the
//! same channel.  A transition that supersedes in-flight work bumps the
//! generation and cancels the old token; results from earlier generations
//! are ignored when they straggle in.

mod worker;

pub use worker::AdvanceOutcome;

use std::{
    collections::BTreeMap,
    mem,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::{
    actor::{Actor, ActorHandle, ActorOp, Capacity},
    error::Error,
    source::{Message, MessageSource, Progress, Severity, SourceInfo, TopicInfo},
    time::Timestamp,
    util::CancelToken,
};

use self::worker::{SourceRequest, SourceWorker};

#[derive(Clone)]
pub struct PlaybackConfig {
    pub min_speed: f64,
    pub max_speed: f64,
    /// How long a seek may run before the listener sees BUFFERING.
    pub seek_buffering_delay: Duration,
    /// How long a tick may run before the listener sees BUFFERING.
    pub tick_buffering_delay: Duration,
    /// Wall-clock length of one play tick.
    pub frame_pace: Duration,
    /// How far past the start time the first frame collects messages.
    pub start_skip: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_speed: 0.1,
            max_speed: 10.0,
            seek_buffering_delay: Duration::from_millis(100),
            tick_buffering_delay: Duration::from_millis(500),
            frame_pace: Duration::from_millis(16),
            start_skip: Duration::from_millis(99),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Preinit,
    Initialize,
    StartPlay,
    Idle,
    SeekBackfill,
    Play,
    ResetIterator,
    Closed,
}

/// Coarse health indicator surfaced to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Presence {
    Initializing,
    Present,
    Buffering,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PreloadPolicy {
    Full,
    Partial,
}

pub type Subscriptions = BTreeMap<String, PreloadPolicy>;

/// Snapshot emitted to the listener.  `messages` is moved out of the player
/// at emission time, so a batch is delivered exactly once.
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub phase: Phase,
    pub presence: Presence,
    pub current_time: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub is_playing: bool,
    pub speed: f64,
    pub topics: Vec<TopicInfo>,
    pub messages: Vec<Message>,
    pub progress: Progress,
}

/// The single consumer of state snapshots.  Called on the player thread, so
/// a slow listener naturally back-pressures emissions; errors are logged and
/// swallowed.
pub trait PlayerListener: Send {
    fn on_state(&mut self, state: PlayerState) -> Result<(), Error>;
}

pub enum PlayerCommand {
    SetListener(Box<dyn PlayerListener>),
    SetSubscriptions(Subscriptions),
    Play,
    PlayUntil(Timestamp),
    Pause,
    Seek(Timestamp),
    SetSpeed(f64),
    Close,
}

pub enum PlayerEvent {
    Command(PlayerCommand),
    Initialized {
        result: Result<SourceInfo, Error>,
        generation: u64,
    },
    BackfillLoaded {
        result: Result<Vec<Message>, Error>,
        time: Timestamp,
        progress: Progress,
        generation: u64,
    },
    IteratorReset {
        result: Result<(), Error>,
        generation: u64,
    },
    Advanced {
        result: Result<AdvanceOutcome, Error>,
        generation: u64,
    },
    SourceProblem {
        connection_id: u64,
        severity: Severity,
        message: String,
    },
    Timer(TimerEvent),
}

#[derive(Debug, Clone, Copy)]
pub enum TimerEvent {
    StartPlay,
    SeekBuffering { generation: u64 },
    TickBuffering { generation: u64 },
    Tick { generation: u64 },
}

pub struct Player {
    config: PlaybackConfig,
    worker: ActorHandle<SourceRequest>,
    this: Sender<PlayerEvent>,
    listener: Option<Box<dyn PlayerListener>>,
    phase: Phase,
    presence: Presence,
    initialized: bool,
    start_time: Timestamp,
    end_time: Timestamp,
    current_time: Timestamp,
    seek_target: Option<Timestamp>,
    until_time: Option<Timestamp>,
    is_playing: bool,
    speed: f64,
    topics: Vec<TopicInfo>,
    subscriptions: Subscriptions,
    // Set when the subscription set changes mid-tick; the play loop swaps
    // the iterator at the next tick boundary.
    subscriptions_changed: bool,
    messages: Vec<Message>,
    progress: Progress,
    generation: u64,
    cancel: CancelToken,
    tick_started: Option<Instant>,
    timer: Option<(Instant, TimerEvent)>,
}

impl Player {
    pub fn new(
        source: Box<dyn MessageSource>,
        config: PlaybackConfig,
        this: Sender<PlayerEvent>,
    ) -> Player {
        let events = this.clone();
        let worker = SourceWorker::spawn("source-worker", Capacity::Unbounded, move |_| {
            SourceWorker::new(source, events)
        });
        Player {
            config,
            worker,
            this,
            listener: None,
            phase: Phase::Preinit,
            presence: Presence::Initializing,
            initialized: false,
            start_time: Timestamp::ZERO,
            end_time: Timestamp::ZERO,
            current_time: Timestamp::ZERO,
            seek_target: None,
            until_time: None,
            is_playing: false,
            speed: 1.0,
            topics: Vec::new(),
            subscriptions: Subscriptions::new(),
            subscriptions_changed: false,
            messages: Vec::new(),
            progress: Progress::default(),
            generation: 0,
            cancel: CancelToken::new(),
            tick_started: None,
            timer: None,
        }
    }

    /// Starts the player on its own thread and returns the command handle.
    pub fn spawn(source: Box<dyn MessageSource>, config: PlaybackConfig) -> PlayerHandle {
        let handle = <Player as Actor>::spawn("playback", Capacity::Unbounded, move |send| {
            Player::new(source, config, send)
        });
        PlayerHandle { handle }
    }

    fn next_op(&self) -> ActorOp<Self> {
        if self.phase == Phase::Closed {
            return ActorOp::Shutdown;
        }
        match &self.timer {
            Some((deadline, event)) => ActorOp::WaitOr {
                timeout: deadline.saturating_duration_since(Instant::now()),
                timeout_msg: PlayerEvent::Timer(*event),
            },
            None => ActorOp::Continue,
        }
    }

    fn handle_command(&mut self, cmd: PlayerCommand) {
        match cmd {
            PlayerCommand::SetListener(listener) => self.handle_set_listener(listener),
            PlayerCommand::SetSubscriptions(subs) => self.handle_set_subscriptions(subs),
            PlayerCommand::Play => self.handle_play(None),
            PlayerCommand::PlayUntil(time) => self.handle_play(Some(time)),
            PlayerCommand::Pause => self.handle_pause(),
            PlayerCommand::Seek(time) => self.handle_seek(time),
            PlayerCommand::SetSpeed(speed) => self.handle_set_speed(speed),
            PlayerCommand::Close => self.handle_close(),
        }
    }

    fn handle_set_listener(&mut self, listener: Box<dyn PlayerListener>) {
        if self.listener.is_some() {
            log::error!("{}", Error::ListenerAlreadySet);
            return;
        }
        self.listener = Some(listener);
        self.emit();
        self.phase = Phase::Initialize;
        let generation = self.generation;
        let _ = self.worker.send(SourceRequest::Initialize { generation });
    }

    fn handle_initialized(&mut self, result: Result<SourceInfo, Error>, generation: u64) {
        if generation != self.generation {
            log::info!("stale initialize result received, ignoring");
            return;
        }
        match result {
            Ok(info) => {
                self.start_time = info.start;
                self.end_time = info.end;
                self.topics = info.topics;
                self.initialized = true;
                if let Some(target) = self.seek_target {
                    self.seek_target = Some(target.clamp_to(self.start_time, self.end_time));
                }
                self.current_time = self.seek_target.unwrap_or(self.start_time);
                self.presence = Presence::Present;
                self.emit();
                // Start-play runs after anything already queued has been
                // seen, so an early seek can still take over.
                let _ = self.this.send(PlayerEvent::Timer(TimerEvent::StartPlay));
            }
            Err(err) => {
                log::error!("failed to initialize source: {}", err);
                self.presence = Presence::Error;
                self.phase = Phase::Preinit;
                self.emit();
            }
        }
    }

    fn enter_start_play(&mut self) {
        if !self.initialized || self.phase != Phase::Initialize {
            return;
        }
        if self.seek_target.is_some() {
            self.enter_seek_backfill();
            return;
        }
        self.phase = Phase::StartPlay;
        self.bump_generation();
        let generation = self.generation;
        let _ = self.worker.send(SourceRequest::Reset {
            start: self.start_time,
            topics: self.subscribed_topics(),
            generation,
        });
        // Collect a little past the start so the first frame is non-empty
        // even for sources with sparse early messages.
        let until = self
            .start_time
            .add_duration(self.config.start_skip)
            .clamp_to(self.start_time, self.end_time);
        let _ = self.worker.send(SourceRequest::Advance {
            until,
            cancel: self.cancel.clone(),
            generation,
        });
    }

    fn enter_seek_backfill(&mut self) {
        let Some(target) = self.seek_target else {
            return;
        };
        let target = target.clamp_to(self.start_time, self.end_time);
        self.seek_target = Some(target);
        self.phase = Phase::SeekBackfill;
        self.bump_generation();
        let generation = self.generation;
        let _ = self.worker.send(SourceRequest::Backfill {
            topics: self.subscribed_topics(),
            time: target,
            cancel: self.cancel.clone(),
            generation,
        });
        self.timer = Some((
            Instant::now() + self.config.seek_buffering_delay,
            TimerEvent::SeekBuffering { generation },
        ));
    }

    fn handle_backfill_loaded(
        &mut self,
        result: Result<Vec<Message>, Error>,
        time: Timestamp,
        progress: Progress,
        generation: u64,
    ) {
        if generation != self.generation {
            log::info!("stale backfill result received, ignoring");
            return;
        }
        self.timer = None;
        self.progress = progress;
        match result {
            Ok(messages) => {
                self.messages = messages;
                let target = self.seek_target.take().unwrap_or(time);
                self.current_time = target;
                self.presence = Presence::Present;
                self.emit();
                let generation = self.generation;
                let _ = self.worker.send(SourceRequest::Reset {
                    start: target.add_nanos(1),
                    topics: self.subscribed_topics(),
                    generation,
                });
                if self.is_playing {
                    self.begin_play();
                } else {
                    self.phase = Phase::Idle;
                }
            }
            Err(Error::Aborted) => {
                log::debug!("backfill pass superseded");
            }
            Err(err) => {
                log::warn!("backfill failed: {}", err);
                self.phase = Phase::Idle;
                self.presence = Presence::Present;
                self.emit();
            }
        }
    }

    fn begin_play(&mut self) {
        self.phase = Phase::Play;
        self.subscriptions_changed = false;
        self.begin_tick();
    }

    fn begin_tick(&mut self) {
        if self.current_time >= self.end_time {
            self.pause_at_bound();
            return;
        }
        if let Some(until) = self.until_time {
            if self.current_time >= until {
                self.until_time = None;
                self.pause_at_bound();
                return;
            }
        }
        self.tick_started = Some(Instant::now());
        // One tick advances a frame's worth of source time, scaled by the
        // playback speed.
        let advance = (self.config.frame_pace.as_nanos() as f64 * self.speed) as i64;
        let mut tick_end = self
            .current_time
            .add_nanos(advance)
            .clamp_to(self.start_time, self.end_time);
        if let Some(until) = self.until_time {
            tick_end = tick_end.min(until);
        }
        let generation = self.generation;
        let _ = self.worker.send(SourceRequest::Advance {
            until: tick_end,
            cancel: self.cancel.clone(),
            generation,
        });
        self.timer = Some((
            Instant::now() + self.config.tick_buffering_delay,
            TimerEvent::TickBuffering { generation },
        ));
    }

    fn pause_at_bound(&mut self) {
        self.is_playing = false;
        self.phase = Phase::Idle;
        self.timer = None;
        self.emit();
    }

    fn handle_advanced(&mut self, result: Result<AdvanceOutcome, Error>, generation: u64) {
        if generation != self.generation {
            log::info!("stale advance result received, ignoring");
            return;
        }
        self.timer = None;
        match result {
            Ok(outcome) => {
                self.progress = outcome.progress;
                match self.phase {
                    Phase::StartPlay => {
                        // Leave the clock at the start when the window held
                        // nothing.
                        if !outcome.batch.is_empty() {
                            self.current_time = outcome.reached;
                        }
                        self.messages.extend(outcome.batch);
                        self.presence = Presence::Present;
                        self.emit();
                        if self.is_playing {
                            self.begin_play();
                        } else {
                            self.phase = Phase::Idle;
                        }
                    }
                    Phase::Play => {
                        self.current_time = outcome.reached;
                        self.messages.extend(outcome.batch);
                        self.presence = Presence::Present;
                        self.emit();
                        if self.subscriptions_changed {
                            self.enter_reset_iterator();
                        } else {
                            let at = self
                                .tick_started
                                .map(|t0| t0 + self.config.frame_pace)
                                .unwrap_or_else(Instant::now);
                            self.timer = Some((
                                at,
                                TimerEvent::Tick {
                                    generation: self.generation,
                                },
                            ));
                        }
                    }
                    Phase::Idle => {
                        // Paused mid-tick; still deliver what it gathered.
                        self.current_time = outcome.reached;
                        self.messages.extend(outcome.batch);
                        self.presence = Presence::Present;
                        self.emit();
                    }
                    _ => {
                        log::debug!("advance completed in phase {:?}", self.phase);
                    }
                }
            }
            Err(err) => {
                log::warn!("iterator advance failed: {}", err);
                self.phase = Phase::Idle;
                self.presence = Presence::Present;
                self.emit();
            }
        }
    }

    fn enter_reset_iterator(&mut self) {
        self.phase = Phase::ResetIterator;
        self.subscriptions_changed = false;
        let generation = self.generation;
        let _ = self.worker.send(SourceRequest::Reset {
            start: self.current_time.add_nanos(1),
            topics: self.subscribed_topics(),
            generation,
        });
    }

    fn handle_iterator_reset(&mut self, result: Result<(), Error>, generation: u64) {
        if generation != self.generation {
            return;
        }
        match result {
            Ok(()) => {
                if self.phase == Phase::ResetIterator {
                    if self.is_playing {
                        self.begin_play();
                    } else {
                        self.phase = Phase::Idle;
                    }
                }
            }
            Err(err) => {
                log::warn!("failed to reset the iterator: {}", err);
                self.phase = Phase::Idle;
            }
        }
    }

    fn handle_play(&mut self, until: Option<Timestamp>) {
        self.is_playing = true;
        if let Some(until) = until {
            self.until_time = Some(until.clamp_to(self.start_time, self.end_time));
        }
        self.emit();
        if self.initialized && self.phase == Phase::Idle {
            self.begin_play();
        }
    }

    fn handle_pause(&mut self) {
        self.is_playing = false;
        self.until_time = None;
        if self.phase == Phase::Play {
            self.phase = Phase::Idle;
            self.timer = None;
        }
        self.emit();
    }

    fn handle_seek(&mut self, time: Timestamp) {
        if !self.initialized {
            // Clamped once the bounds are known.
            self.seek_target = Some(time);
            return;
        }
        let time = time.clamp_to(self.start_time, self.end_time);
        if time == self.current_time {
            return;
        }
        self.seek_target = Some(time);
        self.enter_seek_backfill();
    }

    fn handle_set_speed(&mut self, speed: f64) {
        if !speed.is_finite() {
            log::warn!("ignoring non-finite playback speed");
            return;
        }
        self.speed = speed.clamp(self.config.min_speed, self.config.max_speed);
        self.emit();
    }

    fn handle_set_subscriptions(&mut self, subscriptions: Subscriptions) {
        if subscriptions == self.subscriptions {
            return;
        }
        self.subscriptions = subscriptions;
        if self.phase == Phase::Play && self.is_playing {
            self.subscriptions_changed = true;
            return;
        }
        if matches!(
            self.phase,
            Phase::Idle | Phase::SeekBackfill | Phase::Play | Phase::StartPlay
        ) && !self.is_playing
        {
            // Refresh the frame at the current time under the new set.
            self.seek_target = Some(self.current_time);
            self.enter_seek_backfill();
        }
    }

    fn handle_close(&mut self) {
        self.phase = Phase::Closed;
        self.bump_generation();
        self.timer = None;
        self.listener = None;
        let _ = self.worker.send(SourceRequest::Quit);
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        self.timer = None;
        match event {
            TimerEvent::StartPlay => self.enter_start_play(),
            TimerEvent::SeekBuffering { generation } => {
                if generation == self.generation && self.phase == Phase::SeekBackfill {
                    // The backfill is slow; show buffering at the target.
                    self.presence = Presence::Buffering;
                    self.messages.clear();
                    if let Some(target) = self.seek_target {
                        self.current_time = target;
                    }
                    self.emit();
                }
            }
            TimerEvent::TickBuffering { generation } => {
                if generation == self.generation && self.phase == Phase::Play {
                    self.presence = Presence::Buffering;
                    self.emit();
                }
            }
            TimerEvent::Tick { generation } => {
                if generation == self.generation && self.phase == Phase::Play {
                    self.begin_tick();
                }
            }
        }
    }

    fn bump_generation(&mut self) {
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        self.generation += 1;
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    fn emit(&mut self) {
        if self.listener.is_none() {
            return;
        }
        let state = PlayerState {
            phase: self.phase,
            presence: self.presence,
            current_time: self.current_time,
            start_time: self.start_time,
            end_time: self.end_time,
            is_playing: self.is_playing,
            speed: self.speed,
            topics: self.topics.clone(),
            messages: mem::take(&mut self.messages),
            progress: self.progress.clone(),
        };
        if let Some(listener) = self.listener.as_mut() {
            if let Err(err) = listener.on_state(state) {
                log::warn!("listener failed: {}", err);
            }
        }
    }
}

impl Actor for Player {
    type Message = PlayerEvent;
    type Error = Error;

    fn handle(&mut self, event: PlayerEvent) -> Result<ActorOp<Self>, Error> {
        if self.phase == Phase::Closed {
            return Ok(ActorOp::Shutdown);
        }
        match event {
            PlayerEvent::Command(cmd) => self.handle_command(cmd),
            PlayerEvent::Initialized { result, generation } => {
                self.handle_initialized(result, generation)
            }
            PlayerEvent::BackfillLoaded {
                result,
                time,
                progress,
                generation,
            } => self.handle_backfill_loaded(result, time, progress, generation),
            PlayerEvent::IteratorReset { result, generation } => {
                self.handle_iterator_reset(result, generation)
            }
            PlayerEvent::Advanced { result, generation } => {
                self.handle_advanced(result, generation)
            }
            PlayerEvent::SourceProblem {
                connection_id,
                severity,
                message,
            } => {
                log::warn!(
                    "source problem (iterator {}, {:?}): {}",
                    connection_id,
                    severity,
                    message
                );
            }
            PlayerEvent::Timer(event) => self.handle_timer(event),
        }
        Ok(self.next_op())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.worker.send(SourceRequest::Quit);
    }
}

/// Command surface over a spawned [`Player`].
pub struct PlayerHandle {
    handle: ActorHandle<PlayerEvent>,
}

impl PlayerHandle {
    pub fn sender(&self) -> Sender<PlayerEvent> {
        self.handle.sender()
    }

    pub fn set_listener(&self, listener: Box<dyn PlayerListener>) {
        self.command(PlayerCommand::SetListener(listener));
    }

    pub fn set_subscriptions(&self, subscriptions: Subscriptions) {
        self.command(PlayerCommand::SetSubscriptions(subscriptions));
    }

    pub fn play(&self) {
        self.command(PlayerCommand::Play);
    }

    pub fn play_until(&self, time: Timestamp) {
        self.command(PlayerCommand::PlayUntil(time));
    }

    pub fn pause(&self) {
        self.command(PlayerCommand::Pause);
    }

    pub fn seek(&self, time: Timestamp) {
        self.command(PlayerCommand::Seek(time));
    }

    pub fn set_speed(&self, speed: f64) {
        self.command(PlayerCommand::SetSpeed(speed));
    }

    pub fn close(&self) {
        self.command(PlayerCommand::Close);
    }

    pub fn join(self) {
        self.handle.join();
    }

    fn command(&self, cmd: PlayerCommand) {
        let _ = self.handle.send(PlayerEvent::Command(cmd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CacheConfig,
        fetch::HttpFetcher,
        format::BagWriter,
        source::{BagSource, BackfillRequest, IterItem, IterateRequest, MessageIter},
        test_util::RangedServer,
    };
    use crossbeam_channel::{Receiver, RecvTimeoutError};
    use std::{collections::HashSet, io::Cursor, thread};

    fn t(sec: i64) -> Timestamp {
        Timestamp { sec, nsec: 0 }
    }

    fn ts(sec: i64, nsec: u32) -> Timestamp {
        Timestamp { sec, nsec }
    }

    fn msg(topic: &str, time: Timestamp) -> Message {
        Message {
            topic: topic.into(),
            receive_time: time,
            size_bytes: 4,
            payload: b"data".to_vec(),
            schema: "schema".into(),
        }
    }

    struct MockSource {
        info: SourceInfo,
        // Sorted by receive time.
        messages: Vec<Message>,
        backfill_delay: Duration,
        fail_initialize: bool,
    }

    impl MockSource {
        fn new(start: Timestamp, end: Timestamp, topics: &[&str]) -> MockSource {
            MockSource {
                info: SourceInfo {
                    start,
                    end,
                    topics: topics
                        .iter()
                        .map(|name| TopicInfo {
                            name: (*name).into(),
                            schema: "schema".into(),
                        })
                        .collect(),
                },
                messages: Vec::new(),
                backfill_delay: Duration::ZERO,
                fail_initialize: false,
            }
        }

        fn with_messages(mut self, messages: Vec<Message>) -> MockSource {
            self.messages = messages;
            self
        }
    }

    impl MessageSource for MockSource {
        fn initialize(&mut self) -> Result<SourceInfo, Error> {
            if self.fail_initialize {
                return Err(Error::Network("mock initialize failure".into()));
            }
            Ok(self.info.clone())
        }

        fn iterate(&self, request: IterateRequest) -> Result<MessageIter, Error> {
            let topics: HashSet<String> = request.topics.into_iter().collect();
            let start = request.start.unwrap_or(self.info.start);
            let end = request.end.unwrap_or(self.info.end);
            let mut items: Vec<Result<IterItem, Error>> = self
                .messages
                .iter()
                .filter(|m| {
                    topics.contains(&m.topic) && m.receive_time >= start && m.receive_time <= end
                })
                .cloned()
                .map(|m| Ok(IterItem::Message(m)))
                .collect();
            if request.reverse {
                items.reverse();
            }
            let bound = if request.reverse { start } else { end };
            items.push(Ok(IterItem::Stamp(bound)));
            Ok(Box::new(items.into_iter()))
        }

        fn backfill(&self, request: BackfillRequest) -> Result<Vec<Message>, Error> {
            if !self.backfill_delay.is_zero() {
                thread::sleep(self.backfill_delay);
            }
            if let Some(cancel) = &request.cancel {
                if cancel.is_cancelled() {
                    return Err(Error::Aborted);
                }
            }
            let mut out = Vec::new();
            for topic in &request.topics {
                if let Some(found) = self
                    .messages
                    .iter()
                    .filter(|m| &m.topic == topic && m.receive_time <= request.time)
                    .last()
                {
                    out.push(found.clone());
                }
            }
            out.sort_by_key(|m| m.receive_time);
            Ok(out)
        }

        fn progress(&self) -> Progress {
            Progress::complete()
        }

        fn terminate(&mut self) {}
    }

    struct ChannelListener(Sender<PlayerState>);

    impl PlayerListener for ChannelListener {
        fn on_state(&mut self, state: PlayerState) -> Result<(), Error> {
            self.0.send(state).map_err(Error::from)
        }
    }

    fn test_config() -> PlaybackConfig {
        PlaybackConfig {
            frame_pace: Duration::from_millis(4),
            ..PlaybackConfig::default()
        }
    }

    fn spawn_player(source: MockSource) -> (PlayerHandle, Receiver<PlayerState>) {
        spawn_player_with(Box::new(source), test_config())
    }

    fn spawn_player_with(
        source: Box<dyn MessageSource>,
        config: PlaybackConfig,
    ) -> (PlayerHandle, Receiver<PlayerState>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let player = Player::spawn(source, config);
        player.set_listener(Box::new(ChannelListener(tx)));
        (player, rx)
    }

    fn wait_for(
        rx: &Receiver<PlayerState>,
        what: &str,
        pred: impl Fn(&PlayerState) -> bool,
    ) -> PlayerState {
        collect_until(rx, what, pred).pop().unwrap()
    }

    /// Drains states until `pred` matches, returning everything seen up to
    /// and including the match.
    fn collect_until(
        rx: &Receiver<PlayerState>,
        what: &str,
        pred: impl Fn(&PlayerState) -> bool,
    ) -> Vec<PlayerState> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(state) => {
                    let done = pred(&state);
                    seen.push(state);
                    if done {
                        return seen;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => panic!("player went away: {what}"),
            }
        }
        panic!("timed out waiting for {what}");
    }

    fn subs(topics: &[&str]) -> Subscriptions {
        topics
            .iter()
            .map(|name| ((*name).into(), PreloadPolicy::Full))
            .collect()
    }

    #[test]
    fn initialization_reports_the_recording() {
        let source = MockSource::new(t(0), t(100), &["/a", "/b"]);
        let (player, rx) = spawn_player(source);

        let state = wait_for(&rx, "initialized state", |s| {
            s.presence == Presence::Present && s.topics.len() == 2
        });
        assert_eq!(state.start_time, t(0));
        assert_eq!(state.end_time, t(100));
        assert_eq!(state.current_time, t(0));
        assert!(!state.is_playing);
        assert_eq!(state.speed, 1.0);

        player.close();
        player.join();
    }

    #[test]
    fn initialization_failure_leaves_the_player_usable() {
        let mut source = MockSource::new(t(0), t(100), &["/a"]);
        source.fail_initialize = true;
        let (player, rx) = spawn_player(source);

        wait_for(&rx, "error state", |s| s.presence == Presence::Error);
        // Time inputs are no-ops while uninitialized, but must not wedge.
        player.seek(t(10));
        player.play();
        player.close();
        player.join();
    }

    #[test]
    fn seek_clamps_to_the_recording_bounds() {
        let source = MockSource::new(t(0), t(100), &["/a"]);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);

        player.seek(t(150));
        wait_for(&rx, "clamp to end", |s| s.current_time == t(100));

        player.seek(t(-10));
        wait_for(&rx, "clamp to start", |s| s.current_time == t(0));

        player.close();
        player.join();
    }

    #[test]
    fn speed_clamps_to_the_configured_bounds() {
        let source = MockSource::new(t(0), t(100), &["/a"]);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);

        player.set_speed(0.05);
        wait_for(&rx, "speed floor", |s| s.speed == 0.1);
        player.set_speed(15.0);
        wait_for(&rx, "speed ceiling", |s| s.speed == 10.0);

        player.close();
        player.join();
    }

    #[test]
    fn seek_backfills_subscribed_messages() {
        let source = MockSource::new(t(0), t(100), &["/t1", "/t2"]).with_messages(vec![
            msg("/t1", t(42)),
            msg("/t2", t(43)),
        ]);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);

        player.set_subscriptions(subs(&["/t1"]));
        player.seek(t(42));
        let state = wait_for(&rx, "seek done", |s| {
            s.current_time == t(42) && !s.messages.is_empty()
        });
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].topic, "/t1");
        assert_eq!(state.messages[0].receive_time, t(42));

        player.close();
        player.join();
    }

    #[test]
    fn play_to_the_end_auto_pauses() {
        let source = MockSource::new(t(0), t(1), &["/a"]);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);

        player.seek(ts(0, 900_000_000));
        wait_for(&rx, "seeked near the end", |s| {
            s.current_time == ts(0, 900_000_000)
        });

        player.play();
        let state = wait_for(&rx, "auto-pause at end", |s| {
            !s.is_playing && s.current_time == t(1)
        });
        assert_eq!(state.phase, Phase::Idle);

        player.close();
        player.join();
    }

    #[test]
    fn play_until_pauses_at_the_bound() {
        let source = MockSource::new(t(0), t(10), &["/a"]);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);

        player.set_speed(10.0);
        player.play_until(t(1));
        wait_for(&rx, "pause at bound", |s| {
            !s.is_playing && s.current_time == t(1)
        });

        player.close();
        player.join();
    }

    #[test]
    fn newer_seek_supersedes_an_in_flight_one() {
        let mut source = MockSource::new(t(0), t(100), &["/t1"]).with_messages(vec![
            msg("/t1", t(10)),
            msg("/t1", t(20)),
        ]);
        source.backfill_delay = Duration::from_millis(30);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);
        player.set_subscriptions(subs(&["/t1"]));
        wait_for(&rx, "subscription refresh", |s| s.presence == Presence::Present);

        player.seek(t(10));
        player.seek(t(20));
        let seen = collect_until(&rx, "converged on the newer seek", |s| {
            s.current_time == t(20) && !s.messages.is_empty()
        });
        // The superseded pass never surfaced.
        assert!(seen.iter().all(|s| s.current_time != t(10)));
        assert_eq!(seen.last().unwrap().messages[0].receive_time, t(20));

        player.close();
        player.join();
    }

    #[test]
    fn subscription_change_refreshes_the_current_frame() {
        let source = MockSource::new(t(0), t(100), &["/t1", "/t2"]).with_messages(vec![
            msg("/t1", t(0)),
            msg("/t2", t(0)),
        ]);
        let (player, rx) = spawn_player(source);
        wait_for(&rx, "initialized", |s| s.presence == Presence::Present);

        player.set_subscriptions(subs(&["/t2"]));
        let state = wait_for(&rx, "refreshed frame", |s| !s.messages.is_empty());
        assert_eq!(state.messages[0].topic, "/t2");

        // Re-sending the same set is a no-op: the player stays quiet.
        player.set_subscriptions(subs(&["/t2"]));
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(150)),
            Err(RecvTimeoutError::Timeout)
        ));

        player.close();
        player.join();
    }

    #[test]
    fn plays_a_recording_over_ranged_http() {
        let bag = {
            let mut writer = BagWriter::new(Cursor::new(Vec::new())).unwrap();
            let a = writer.add_topic("/a", "s_a").unwrap();
            let b = writer.add_topic("/b", "s_b").unwrap();
            writer.write_message(a, ts(0, 0), b"a0").unwrap();
            writer.write_message(b, ts(0, 250_000_000), b"b0").unwrap();
            writer.write_message(a, ts(0, 500_000_000), b"a1").unwrap();
            writer.write_message(a, ts(1, 0), b"a2").unwrap();
            writer.write_message(a, ts(1, 500_000_000), b"a3").unwrap();
            writer.write_message(a, ts(2, 0), b"a4").unwrap();
            writer.finish().unwrap().into_inner()
        };
        let server = RangedServer::new(bag);
        let source = BagSource::new(
            Box::new(HttpFetcher::new(server.url())),
            CacheConfig::default(),
        );
        let (player, rx) = spawn_player_with(Box::new(source), test_config());

        let state = wait_for(&rx, "initialized over http", |s| {
            s.presence == Presence::Present && s.topics.len() == 2
        });
        assert_eq!(state.start_time, ts(0, 0));
        assert_eq!(state.end_time, ts(2, 0));

        player.set_subscriptions(subs(&["/a", "/b"]));
        player.seek(ts(0, 750_000_000));
        let state = wait_for(&rx, "seek backfill over http", |s| {
            s.current_time == ts(0, 750_000_000) && !s.messages.is_empty()
        });
        assert_eq!(
            state
                .messages
                .iter()
                .map(|m| (m.topic.as_str(), m.receive_time))
                .collect::<Vec<_>>(),
            vec![("/b", ts(0, 250_000_000)), ("/a", ts(0, 500_000_000))]
        );

        player.set_speed(10.0);
        player.play();
        let seen = collect_until(&rx, "played to the end", |s| {
            !s.is_playing && s.current_time == ts(2, 0)
        });
        let played: Vec<Timestamp> = seen
            .iter()
            .flat_map(|s| s.messages.iter())
            .map(|m| m.receive_time)
            .collect();
        assert_eq!(played, vec![ts(1, 0), ts(1, 500_000_000), ts(2, 0)]);

        player.close();
        player.join();
    }
}

