use std::collections::{BTreeMap, HashMap};

use corazon_protocol::{EngineEvent, ThreadItem};

/// Wall-clock timing of one turn, in unix milliseconds.
///
/// A reasoning item starts at its first observation and ends at its own
/// completion, at the completion of any other item, or at turn completion,
/// whichever comes first.
#[derive(Debug)]
pub struct TurnTimer {
    execute_started_at: i64,
    turn_started_at: Option<i64>,
    turn_duration_ms: Option<u64>,
    reasoning_started_at: HashMap<String, i64>,
    reasoning_durations: BTreeMap<String, u64>,
}

impl TurnTimer {
    pub fn new(now: i64) -> Self {
        Self {
            execute_started_at: now,
            turn_started_at: None,
            turn_duration_ms: None,
            reasoning_started_at: HashMap::new(),
            reasoning_durations: BTreeMap::new(),
        }
    }

    /// Record an engine event observed at `now`. Must run before the event
    /// is normalized so `turn.completed` carries final durations.
    pub fn observe(&mut self, event: &EngineEvent, now: i64) {
        match event {
            EngineEvent::TurnStarted => self.turn_started_at = Some(now),
            EngineEvent::TurnCompleted { .. } => {
                let started = self.turn_started_at.unwrap_or(self.execute_started_at);
                self.turn_duration_ms = Some(elapsed(started, now));
                self.finalize_pending(now);
            }
            _ => {}
        }

        let Some((_, item)) = event.as_item() else {
            return;
        };
        let completed = matches!(event, EngineEvent::ItemCompleted { .. });
        match item {
            ThreadItem::Reasoning(reasoning) => {
                if self.reasoning_durations.contains_key(&reasoning.id) {
                    return;
                }
                self.reasoning_started_at
                    .entry(reasoning.id.clone())
                    .or_insert(now);
                if completed {
                    self.finalize(&reasoning.id, now);
                }
            }
            _ if completed => self.finalize_pending(now),
            _ => {}
        }
    }

    /// Close out timing after the event stream ended.
    pub fn finish(&mut self, now: i64) {
        if self.turn_duration_ms.is_none() {
            if let Some(started) = self.turn_started_at {
                self.turn_duration_ms = Some(elapsed(started, now));
            }
        }
    }

    pub fn turn_duration_ms(&self) -> Option<u64> {
        self.turn_duration_ms
    }

    pub fn reasoning_durations(&self) -> &BTreeMap<String, u64> {
        &self.reasoning_durations
    }

    /// Durations for the `turn.completed` event; `None` when no reasoning
    /// was observed.
    pub fn reasoning_summary(&self) -> Option<BTreeMap<String, u64>> {
        (!self.reasoning_durations.is_empty()).then(|| self.reasoning_durations.clone())
    }

    fn finalize(&mut self, reasoning_id: &str, now: i64) {
        if self.reasoning_durations.contains_key(reasoning_id) {
            return;
        }
        let started = self
            .reasoning_started_at
            .remove(reasoning_id)
            .unwrap_or(now);
        self.reasoning_durations
            .insert(reasoning_id.to_string(), elapsed(started, now));
    }

    fn finalize_pending(&mut self, now: i64) {
        let pending: Vec<String> = self.reasoning_started_at.keys().cloned().collect();
        for reasoning_id in pending {
            self.finalize(&reasoning_id, now);
        }
    }
}

fn elapsed(started: i64, now: i64) -> u64 {
    u64::try_from(now.saturating_sub(started)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corazon_protocol::{CommandExecutionItem, ReasoningItem, Usage};

    fn reasoning(id: &str, completed: bool) -> EngineEvent {
        let item = ThreadItem::Reasoning(ReasoningItem {
            id: id.into(),
            text: "thinking".into(),
        });
        if completed {
            EngineEvent::ItemCompleted { item }
        } else {
            EngineEvent::ItemUpdated { item }
        }
    }

    fn command_completed() -> EngineEvent {
        EngineEvent::ItemCompleted {
            item: ThreadItem::CommandExecution(CommandExecutionItem {
                id: "c1".into(),
                command: "ls".into(),
                aggregated_output: String::new(),
                exit_code: Some(0),
                status: "completed".into(),
            }),
        }
    }

    #[test]
    fn reasoning_duration_spans_first_to_completed() {
        let mut timer = TurnTimer::new(0);
        timer.observe(&EngineEvent::TurnStarted, 100);
        timer.observe(&reasoning("r1", false), 150);
        timer.observe(&reasoning("r1", false), 400);
        timer.observe(&reasoning("r1", true), 950);
        // A repeated completion does not move the duration.
        timer.observe(&reasoning("r1", true), 2_000);
        assert_eq!(timer.reasoning_durations().get("r1"), Some(&800));
    }

    #[test]
    fn other_item_completion_closes_pending_reasoning() {
        let mut timer = TurnTimer::new(0);
        timer.observe(&reasoning("r1", false), 10);
        timer.observe(&command_completed(), 70);
        assert_eq!(timer.reasoning_durations().get("r1"), Some(&60));
    }

    #[test]
    fn turn_completion_sets_duration_and_closes_reasoning() {
        let mut timer = TurnTimer::new(1_000);
        timer.observe(&reasoning("r1", false), 1_100);
        timer.observe(
            &EngineEvent::TurnCompleted {
                usage: Usage::default(),
            },
            1_500,
        );
        // No turn.started: measured from execute start.
        assert_eq!(timer.turn_duration_ms(), Some(500));
        assert_eq!(timer.reasoning_durations().get("r1"), Some(&400));
        assert_eq!(timer.reasoning_summary().unwrap().len(), 1);
    }

    #[test]
    fn finish_measures_turn_without_completion() {
        let mut timer = TurnTimer::new(0);
        assert_eq!(timer.reasoning_summary(), None);
        timer.finish(50);
        assert_eq!(timer.turn_duration_ms(), None);
        timer.observe(&EngineEvent::TurnStarted, 100);
        timer.finish(90);
        assert_eq!(timer.turn_duration_ms(), Some(0));
    }
}
