//! Browser highlight state and the two-digit shortcut recognizer.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::SEQUENCE_DISPLAY_HOLD;
use crate::hierarchy::SeriesKey;

/// What the browser list highlights. Highlighting never binds a viewport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    patient: Option<String>,
    study: Option<(String, String)>,
    series: Option<SeriesKey>,
}

impl Selection {
    pub fn select_patient(&mut self, patient_id: &str) {
        if self.patient.as_deref() != Some(patient_id) {
            self.study = None;
            self.series = None;
        }
        self.patient = Some(patient_id.to_string());
    }

    pub fn select_study(&mut self, patient_id: &str, study_uid: &str) {
        self.select_patient(patient_id);
        let study = (patient_id.to_string(), study_uid.to_string());
        if self.study.as_ref() != Some(&study) {
            self.series = None;
        }
        self.study = Some(study);
    }

    /// Highlights a series together with its study and patient.
    pub fn select_series(&mut self, key: &SeriesKey) {
        self.select_study(&key.patient_id, &key.study_uid);
        self.series = Some(key.clone());
    }

    pub fn series(&self) -> Option<&SeriesKey> {
        self.series.as_ref()
    }

    pub fn is_patient_selected(&self, patient_id: &str) -> bool {
        self.patient.as_deref() == Some(patient_id)
    }

    pub fn is_study_selected(&self, patient_id: &str, study_uid: &str) -> bool {
        self.study
            .as_ref()
            .is_some_and(|(patient, study)| patient == patient_id && study == study_uid)
    }

    pub fn is_series_selected(&self, key: &SeriesKey) -> bool {
        self.series.as_ref() == Some(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Layout,
    StackScroll,
    Zoom,
    WindowLevel,
    Length,
    Angle,
    Presets,
}

impl Tool {
    pub fn label(self) -> &'static str {
        match self {
            Self::Layout => "Layout",
            Self::StackScroll => "Stack Scroll",
            Self::Zoom => "Zoom",
            Self::WindowLevel => "W/L",
            Self::Length => "Length",
            Self::Angle => "Angle",
            Self::Presets => "Presets",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    ActivateTool(Tool),
    ResetActiveViewport,
}

pub fn shortcut_action(sequence: &str) -> Option<ShortcutAction> {
    let action = match sequence {
        "11" => ShortcutAction::ActivateTool(Tool::Layout),
        "12" => ShortcutAction::ActivateTool(Tool::StackScroll),
        "21" => ShortcutAction::ActivateTool(Tool::Zoom),
        "22" => ShortcutAction::ActivateTool(Tool::WindowLevel),
        "31" => ShortcutAction::ActivateTool(Tool::Length),
        "32" => ShortcutAction::ActivateTool(Tool::Angle),
        "41" => ShortcutAction::ResetActiveViewport,
        "51" => ShortcutAction::ActivateTool(Tool::Presets),
        _ => return None,
    };
    Some(action)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Not a sequence key.
    Ignored,
    /// First digit stored, waiting for the second.
    Pending,
    /// Two digits collected. `action` is `None` for sequences without a binding.
    Completed {
        sequence: String,
        action: Option<ShortcutAction>,
    },
}

/// Collects two consecutive digit presses into a sequence.
///
/// Time is passed in by the caller so the recognizer stays deterministic.
#[derive(Debug, Clone)]
pub struct KeySequence {
    timeout: Duration,
    pending: Option<(char, Instant)>,
    display: Option<(String, Instant)>,
}

impl KeySequence {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: None,
            display: None,
        }
    }

    pub fn press(&mut self, key: char, now: Instant) -> KeyOutcome {
        if !('1'..='5').contains(&key) {
            return KeyOutcome::Ignored;
        }
        self.expire(now);

        match self.pending.take() {
            None => {
                self.pending = Some((key, now));
                self.display = Some((key.to_string(), now + self.timeout));
                KeyOutcome::Pending
            }
            Some((first, _)) => {
                let sequence = format!("{first}{key}");
                let action = shortcut_action(&sequence);
                match action {
                    Some(action) => info!("Shortcut {sequence}: {action:?}"),
                    None => info!("Unknown key sequence: {sequence}"),
                }
                self.display = Some((sequence.clone(), now + SEQUENCE_DISPLAY_HOLD));
                KeyOutcome::Completed { sequence, action }
            }
        }
    }

    /// Forgets a half-typed sequence once its window has passed.
    pub fn expire(&mut self, now: Instant) {
        if let Some((digit, started)) = self.pending {
            if now.saturating_duration_since(started) >= self.timeout {
                debug!("Key sequence {digit} timed out");
                self.pending = None;
            }
        }
        if self.display.as_ref().is_some_and(|(_, until)| now >= *until) {
            self.display = None;
        }
    }

    /// Sequence to show on screen right now.
    pub fn display(&self, now: Instant) -> Option<&str> {
        self.display
            .as_ref()
            .filter(|(_, until)| now < *until)
            .map(|(text, _)| text.as_str())
    }

    /// When the recognizer next changes on its own.
    pub fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.map(|(_, started)| started + self.timeout);
        let display = self.display.as_ref().map(|(_, until)| *until);
        pending.into_iter().chain(display).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn slow_second_digit_does_not_fire() {
        let start = Instant::now();
        let mut keys = KeySequence::new(TIMEOUT);
        assert_eq!(keys.press('4', start), KeyOutcome::Pending);
        assert_eq!(keys.press('1', start + ms(1001)), KeyOutcome::Pending);
        assert_eq!(keys.next_deadline(), Some(start + ms(2001)));
    }

    #[test]
    fn quick_sequence_fires_exactly_once() {
        let start = Instant::now();
        let mut keys = KeySequence::new(TIMEOUT);
        let outcomes = [
            keys.press('4', start),
            keys.press('1', start + ms(300)),
            keys.press('1', start + ms(400)),
        ];
        let fired = outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    KeyOutcome::Completed {
                        action: Some(ShortcutAction::ResetActiveViewport),
                        ..
                    }
                )
            })
            .count();
        assert_eq!(fired, 1);
        assert_eq!(outcomes[2], KeyOutcome::Pending);
    }

    #[test]
    fn non_sequence_keys_are_ignored() {
        let start = Instant::now();
        let mut keys = KeySequence::new(TIMEOUT);
        assert_eq!(keys.press('6', start), KeyOutcome::Ignored);
        assert_eq!(keys.press('a', start), KeyOutcome::Ignored);
        keys.press('2', start);
        assert_eq!(keys.press('0', start), KeyOutcome::Ignored);
        assert_eq!(
            keys.press('2', start + ms(10)),
            KeyOutcome::Completed {
                sequence: "22".to_string(),
                action: Some(ShortcutAction::ActivateTool(Tool::WindowLevel)),
            }
        );
    }

    #[test]
    fn unknown_sequences_complete_without_action() {
        let start = Instant::now();
        let mut keys = KeySequence::new(TIMEOUT);
        keys.press('5', start);
        assert_eq!(
            keys.press('5', start + ms(10)),
            KeyOutcome::Completed {
                sequence: "55".to_string(),
                action: None,
            }
        );
        assert_eq!(keys.next_deadline(), Some(start + ms(10) + SEQUENCE_DISPLAY_HOLD));
    }

    #[test]
    fn completed_sequence_stays_visible_for_hold_time() {
        let start = Instant::now();
        let mut keys = KeySequence::new(TIMEOUT);
        keys.press('3', start);
        assert_eq!(keys.display(start + ms(500)), Some("3"));
        keys.press('1', start + ms(500));
        assert_eq!(keys.display(start + ms(1900)), Some("31"));
        assert_eq!(keys.display(start + ms(2000)), None);

        keys.expire(start + ms(2000));
        assert_eq!(keys.next_deadline(), None);
    }

    #[test]
    fn pending_digit_disappears_after_timeout() {
        let start = Instant::now();
        let mut keys = KeySequence::new(TIMEOUT);
        keys.press('1', start);
        assert_eq!(keys.next_deadline(), Some(start + TIMEOUT));
        keys.expire(start + TIMEOUT);
        assert_eq!(keys.next_deadline(), None);
        assert_eq!(keys.display(start + TIMEOUT), None);
    }

    #[test]
    fn shortcut_table() {
        assert_eq!(shortcut_action("41"), Some(ShortcutAction::ResetActiveViewport));
        assert_eq!(
            shortcut_action("12"),
            Some(ShortcutAction::ActivateTool(Tool::StackScroll))
        );
        assert_eq!(shortcut_action("42"), None);
        assert_eq!(shortcut_action("4"), None);
    }

    #[test]
    fn selecting_series_highlights_its_parents() {
        let mut selection = Selection::default();
        let key = SeriesKey::new("P1", "S1", "1.1");
        selection.select_series(&key);
        assert!(selection.is_patient_selected("P1"));
        assert!(selection.is_study_selected("P1", "S1"));
        assert!(selection.is_series_selected(&key));

        selection.select_study("P1", "S2");
        assert!(selection.series().is_none());
        assert!(selection.is_study_selected("P1", "S2"));

        selection.select_patient("P2");
        assert!(!selection.is_study_selected("P1", "S2"));
        assert!(selection.is_patient_selected("P2"));
    }
}
