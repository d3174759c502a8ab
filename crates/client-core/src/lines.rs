//! Three-line state machine
//!
//! The line manager is a pure subscriber: it mirrors session events into
//! per-line UI state, owns line selection, and issues exactly one kind of
//! command back to the core (hold, through [`CallCommands`]) when switching
//! away from a live line. It never reads the client's internal maps.

use crate::audio::tones::ToneEngine;
use crate::call::{CallDirection, CallState, SessionId, LINE_COUNT};
use crate::client::SoftphoneClient;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventBus, HoldAction};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The narrow command surface the line manager is allowed to use.
#[async_trait]
pub trait CallCommands: Send + Sync {
    async fn hold_session(&self, session_id: &SessionId) -> ClientResult<()>;
    /// Keep the core's default-session choice in sync with selection.
    fn selection_changed(&self, line: Option<u8>);
}

#[async_trait]
impl CallCommands for SoftphoneClient {
    async fn hold_session(&self, session_id: &SessionId) -> ClientResult<()> {
        self.hold_call(session_id).await
    }

    fn selection_changed(&self, line: Option<u8>) {
        self.note_selected_line(line);
    }
}

/// UI-facing state of one line key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    Idle,
    Ringing,
    Calling,
    Active,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineState {
    pub line_number: u8,
    pub session_id: Option<SessionId>,
    pub state: LineStatus,
    pub caller_name: Option<String>,
    pub caller_number: Option<String>,
    pub duration_seconds: u64,
    pub on_hold: bool,
    pub muted: bool,
    pub direction: Option<CallDirection>,
}

impl LineState {
    fn idle(line_number: u8) -> Self {
        LineState {
            line_number,
            session_id: None,
            state: LineStatus::Idle,
            caller_name: None,
            caller_number: None,
            duration_seconds: 0,
            on_hold: false,
            muted: false,
            direction: None,
        }
    }
}

struct LineInner {
    lines: Mutex<[LineState; LINE_COUNT]>,
    selected: Mutex<Option<u8>>,
    commands: Arc<dyn CallCommands>,
    bus: EventBus,
    tones: Arc<ToneEngine>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The three-line coordinator.
#[derive(Clone)]
pub struct LineManager {
    inner: Arc<LineInner>,
}

impl LineManager {
    pub fn new(bus: EventBus, commands: Arc<dyn CallCommands>, tones: Arc<ToneEngine>) -> Self {
        LineManager {
            inner: Arc::new(LineInner {
                lines: Mutex::new([LineState::idle(1), LineState::idle(2), LineState::idle(3)]),
                selected: Mutex::new(None),
                commands,
                bus,
                tones,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the event pump and the 1 Hz duration ticker.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let manager = self.clone();
        let mut rx = self.inner.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => manager.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "line manager lagged on the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let manager = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.tick();
            }
        }));
    }

    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Current state of all three lines.
    pub fn lines(&self) -> [LineState; LINE_COUNT] {
        self.inner.lines.lock().clone()
    }

    pub fn line(&self, line: u8) -> Option<LineState> {
        if !(1..=LINE_COUNT as u8).contains(&line) {
            return None;
        }
        Some(self.inner.lines.lock()[line as usize - 1].clone())
    }

    pub fn selected_line(&self) -> Option<u8> {
        *self.inner.selected.lock()
    }

    /// User clicked a line key.
    ///
    /// Re-selecting the current line is a no-op refresh. Switching away
    /// from a line whose session is active (and not already held) holds it
    /// first; a line already on hold is never toggled.
    pub async fn select_line(&self, line: u8) -> ClientResult<()> {
        if !(1..=LINE_COUNT as u8).contains(&line) {
            return Err(ClientError::Internal {
                message: format!("line {} out of range", line),
            });
        }
        let previous = *self.inner.selected.lock();
        if previous == Some(line) {
            debug!(line, "line re-selected; no-op");
            return Ok(());
        }

        if let Some(previous) = previous {
            let to_hold = {
                let lines = self.inner.lines.lock();
                let prev_state = &lines[previous as usize - 1];
                if prev_state.state == LineStatus::Active && !prev_state.on_hold {
                    prev_state.session_id.clone()
                } else {
                    None
                }
            };
            if let Some(session_id) = to_hold {
                if let Err(e) = self.inner.commands.hold_session(&session_id).await {
                    warn!(error = %e, "auto-hold on line switch failed");
                }
            }
        }

        *self.inner.selected.lock() = Some(line);
        self.inner.commands.selection_changed(Some(line));
        self.inner.bus.emit(ClientEvent::LineSelected { line });
        Ok(())
    }

    // ===== event mirroring =====

    async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::SessionCreated { session } => {
                let line = session.line;
                {
                    let mut lines = self.inner.lines.lock();
                    let Some(entry) = lines.get_mut(line as usize - 1) else {
                        return;
                    };
                    entry.session_id = Some(session.session_id.clone());
                    entry.direction = Some(session.direction);
                    entry.caller_number = Some(session.remote_number.clone());
                    entry.caller_name = session.remote_display_name.clone();
                    entry.duration_seconds = 0;
                    entry.on_hold = false;
                    entry.muted = false;
                    entry.state = match session.direction {
                        CallDirection::Outgoing => LineStatus::Calling,
                        CallDirection::Incoming => LineStatus::Ringing,
                    };
                }
                match session.direction {
                    CallDirection::Outgoing => {
                        // Placing a call selects its line.
                        *self.inner.selected.lock() = Some(line);
                        self.inner.commands.selection_changed(Some(line));
                        self.inner.bus.emit(ClientEvent::LineSelected { line });
                    }
                    CallDirection::Incoming => {
                        // Call waiting: an incoming ring while another line
                        // carries a live call gets the short double beep.
                        let other_busy = {
                            let lines = self.inner.lines.lock();
                            lines.iter().any(|l| {
                                l.line_number != line
                                    && matches!(l.state, LineStatus::Active | LineStatus::Hold)
                            })
                        };
                        if other_busy {
                            self.inner.tones.play_call_waiting();
                        }
                    }
                }
            }
            ClientEvent::SessionStateChanged {
                session_id,
                line,
                state,
            } => {
                self.update_line(line, &session_id, |entry| {
                    entry.state = match state {
                        CallState::Initiating
                        | CallState::Calling
                        | CallState::Connecting => LineStatus::Calling,
                        CallState::Ringing => match entry.direction {
                            Some(CallDirection::Incoming) => LineStatus::Ringing,
                            _ => LineStatus::Calling,
                        },
                        CallState::Established | CallState::Terminating => LineStatus::Active,
                        CallState::Hold => LineStatus::Hold,
                        CallState::Terminated | CallState::Failed => LineStatus::Idle,
                    };
                    if state == CallState::Hold {
                        entry.on_hold = true;
                    } else if state == CallState::Established {
                        entry.on_hold = false;
                    }
                });
            }
            ClientEvent::SessionAnswered { session_id, line } => {
                self.update_line(line, &session_id, |entry| {
                    entry.state = LineStatus::Active;
                });
            }
            ClientEvent::SessionModified { session_id, action } => {
                if let Some(line) = self.line_of(&session_id) {
                    self.update_line(line, &session_id, |entry| match action {
                        HoldAction::Hold => {
                            entry.on_hold = true;
                            entry.state = LineStatus::Hold;
                        }
                        HoldAction::Unhold => {
                            entry.on_hold = false;
                            entry.state = LineStatus::Active;
                        }
                    });
                }
            }
            ClientEvent::SessionMuted { session_id, muted } => {
                if let Some(line) = self.line_of(&session_id) {
                    self.update_line(line, &session_id, |entry| entry.muted = muted);
                }
            }
            ClientEvent::SessionTerminated {
                session_id, line, ..
            } => {
                {
                    let mut lines = self.inner.lines.lock();
                    if let Some(entry) = lines.get_mut(line as usize - 1) {
                        if entry.session_id.as_ref() == Some(&session_id) {
                            *entry = LineState::idle(line);
                        }
                    }
                }
                let mut selected = self.inner.selected.lock();
                if *selected == Some(line) {
                    *selected = None;
                    self.inner.commands.selection_changed(None);
                }
            }
            _ => {}
        }
    }

    fn line_of(&self, session_id: &SessionId) -> Option<u8> {
        self.inner
            .lines
            .lock()
            .iter()
            .find(|l| l.session_id.as_ref() == Some(session_id))
            .map(|l| l.line_number)
    }

    fn update_line(&self, line: u8, session_id: &SessionId, f: impl FnOnce(&mut LineState)) {
        let mut lines = self.inner.lines.lock();
        let Some(entry) = lines.get_mut(line as usize - 1) else {
            return;
        };
        if entry.session_id.as_ref() != Some(session_id) {
            return;
        }
        f(entry);
    }

    /// 1 Hz duration tick; hold pauses the counter.
    fn tick(&self) {
        let updates: Vec<(SessionId, u8, u64)> = {
            let mut lines = self.inner.lines.lock();
            lines
                .iter_mut()
                .filter(|l| l.state == LineStatus::Active)
                .filter_map(|l| {
                    l.duration_seconds += 1;
                    l.session_id
                        .clone()
                        .map(|id| (id, l.line_number, l.duration_seconds))
                })
                .collect()
        };
        for (session_id, line, seconds) in updates {
            self.inner.bus.emit(ClientEvent::SessionDurationChanged {
                session_id,
                line,
                seconds,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::NullAudioSink;
    use crate::call::CallInfo;
    use chrono::Utc;

    struct RecordingCommands {
        held: Mutex<Vec<SessionId>>,
    }

    #[async_trait]
    impl CallCommands for RecordingCommands {
        async fn hold_session(&self, session_id: &SessionId) -> ClientResult<()> {
            self.held.lock().push(session_id.clone());
            Ok(())
        }

        fn selection_changed(&self, _line: Option<u8>) {}
    }

    fn manager_with_commands() -> (LineManager, Arc<RecordingCommands>, EventBus) {
        let bus = EventBus::new(64);
        let commands = Arc::new(RecordingCommands {
            held: Mutex::new(Vec::new()),
        });
        let tones = Arc::new(ToneEngine::new(Arc::new(NullAudioSink)));
        let manager = LineManager::new(bus.clone(), commands.clone(), tones);
        (manager, commands, bus)
    }

    fn call_info(id: &str, line: u8, direction: CallDirection) -> CallInfo {
        CallInfo {
            session_id: SessionId::from_raw(id),
            line,
            direction,
            remote_number: "2000".to_string(),
            remote_display_name: None,
            state: CallState::Initiating,
            call_type: None,
            created_at: Utc::now(),
            answered_at: None,
            duration_seconds: 0,
            on_hold: false,
            muted: false,
            locally_answered: false,
        }
    }

    #[tokio::test]
    async fn outgoing_call_selects_its_line() {
        let (manager, _commands, _bus) = manager_with_commands();
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s1", 1, CallDirection::Outgoing),
            })
            .await;
        assert_eq!(manager.selected_line(), Some(1));
        assert_eq!(manager.lines()[0].state, LineStatus::Calling);
    }

    #[tokio::test]
    async fn incoming_call_does_not_steal_selection() {
        let (manager, _commands, _bus) = manager_with_commands();
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s1", 1, CallDirection::Outgoing),
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s2", 2, CallDirection::Incoming),
            })
            .await;
        assert_eq!(manager.selected_line(), Some(1));
        assert_eq!(manager.lines()[1].state, LineStatus::Ringing);
    }

    #[tokio::test]
    async fn switching_lines_holds_the_active_one() {
        let (manager, commands, _bus) = manager_with_commands();
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s1", 1, CallDirection::Outgoing),
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionAnswered {
                session_id: SessionId::from_raw("s1"),
                line: 1,
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s2", 2, CallDirection::Incoming),
            })
            .await;

        manager.select_line(2).await.unwrap();
        assert_eq!(manager.selected_line(), Some(2));
        assert_eq!(&*commands.held.lock(), &[SessionId::from_raw("s1")]);
    }

    #[tokio::test]
    async fn held_line_is_not_re_held_on_switch() {
        let (manager, commands, _bus) = manager_with_commands();
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s1", 1, CallDirection::Outgoing),
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionAnswered {
                session_id: SessionId::from_raw("s1"),
                line: 1,
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionModified {
                session_id: SessionId::from_raw("s1"),
                action: HoldAction::Hold,
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s2", 2, CallDirection::Incoming),
            })
            .await;

        manager.select_line(2).await.unwrap();
        assert!(commands.held.lock().is_empty());
    }

    #[tokio::test]
    async fn reselecting_is_a_no_op() {
        let (manager, commands, _bus) = manager_with_commands();
        manager.select_line(1).await.unwrap();
        manager.select_line(1).await.unwrap();
        assert!(commands.held.lock().is_empty());
        assert_eq!(manager.selected_line(), Some(1));
    }

    #[tokio::test]
    async fn termination_clears_line_and_selection() {
        let (manager, _commands, _bus) = manager_with_commands();
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s1", 1, CallDirection::Outgoing),
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionTerminated {
                session_id: SessionId::from_raw("s1"),
                line: 1,
                direction: CallDirection::Outgoing,
                reason: "test".to_string(),
            })
            .await;
        assert_eq!(manager.lines()[0].state, LineStatus::Idle);
        assert_eq!(manager.selected_line(), None);
    }

    #[tokio::test]
    async fn duration_ticks_only_active_lines() {
        let (manager, _commands, _bus) = manager_with_commands();
        manager
            .handle_event(ClientEvent::SessionCreated {
                session: call_info("s1", 1, CallDirection::Outgoing),
            })
            .await;
        manager
            .handle_event(ClientEvent::SessionAnswered {
                session_id: SessionId::from_raw("s1"),
                line: 1,
            })
            .await;
        manager.tick();
        manager.tick();
        assert_eq!(manager.lines()[0].duration_seconds, 2);

        manager
            .handle_event(ClientEvent::SessionModified {
                session_id: SessionId::from_raw("s1"),
                action: HoldAction::Hold,
            })
            .await;
        manager.tick();
        assert_eq!(manager.lines()[0].duration_seconds, 2);
    }
}
