//! Live tracking of per-session world state.
//!
//! The tracker watches client-bound traffic after rewriting, so everything
//! it records is in client space. Its registry feeds two consumers: entity
//! cleanup on disconnect or transfer, and the transfer handshake's reset
//! synthesis, which must clear every piece of transient state that does not
//! survive a world change (status effects, weather, scoreboards, boss bars,
//! game rules).
//!
//! Tracking is suspended while a new backend's traffic is quarantined and
//! its world-init has not arrived yet, because ids are not rewritable until
//! the rewrite tables exist.

use std::collections::{HashMap, HashSet};

use proxy_protocol::{Field, Message, MessageKind};

/// Registry of live, client-space world state for one session.
#[derive(Debug, Default)]
pub struct EntityTracker {
    suspended: bool,
    entities: HashSet<i32>,
    status_effects: HashMap<i32, HashSet<u64>>,
    boss_bars: HashSet<[u8; 16]>,
    scoreboard_objectives: HashSet<String>,
    weather_active: bool,
    modified_game_rules: HashSet<String>,
}

impl EntityTracker {
    /// Creates an empty, active tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker that starts suspended, for connections whose
    /// rewrite tables do not exist yet.
    pub fn suspended() -> Self {
        Self {
            suspended: true,
            ..Self::default()
        }
    }

    /// Stops observing messages until [`resume`](Self::resume).
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Resumes observing messages.
    pub fn resume(&mut self) {
        self.suspended = false;
    }

    /// True while tracking is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Entity ids currently tracked, in client space.
    pub fn entities(&self) -> &HashSet<i32> {
        &self.entities
    }

    /// Observes one client-bound message, post-rewrite.
    ///
    /// No-op while suspended.
    pub fn observe(&mut self, message: &Message) {
        if self.suspended {
            return;
        }
        match message.kind {
            MessageKind::EntitySpawn => {
                if let Some(id) = message.entity_id() {
                    self.entities.insert(id);
                }
            }
            MessageKind::EntityDespawn => {
                if let Some(id) = message.entity_id() {
                    self.entities.remove(&id);
                    self.status_effects.remove(&id);
                }
            }
            MessageKind::StatusEffect => {
                if let (Some(id), Some(effect)) = (message.entity_id(), message.uint()) {
                    self.status_effects.entry(id).or_default().insert(effect);
                }
            }
            MessageKind::RemoveStatusEffect => {
                if let (Some(id), Some(effect)) = (message.entity_id(), message.uint()) {
                    if let Some(effects) = self.status_effects.get_mut(&id) {
                        effects.remove(&effect);
                        if effects.is_empty() {
                            self.status_effects.remove(&id);
                        }
                    }
                }
            }
            MessageKind::BossBarAdd => {
                if let Some(id) = raw_bar_id(message) {
                    self.boss_bars.insert(id);
                }
            }
            MessageKind::BossBarRemove => {
                if let Some(id) = raw_bar_id(message) {
                    self.boss_bars.remove(&id);
                }
            }
            MessageKind::ScoreboardObjective => {
                if let Some(name) = message.text() {
                    self.scoreboard_objectives.insert(name.to_string());
                }
            }
            MessageKind::ScoreboardRemove => {
                if let Some(name) = message.text() {
                    self.scoreboard_objectives.remove(name);
                }
            }
            MessageKind::WeatherChange => {
                self.weather_active = message.uint().unwrap_or(0) != 0;
            }
            MessageKind::GameRule => {
                // A value-less game-rule message restores the default.
                if let Some(name) = message.text() {
                    if message.uint().is_some() {
                        self.modified_game_rules.insert(name.to_string());
                    } else {
                        self.modified_game_rules.remove(name);
                    }
                }
            }
            _ => {}
        }
    }

    /// Synthesizes the remove/clear instructions that erase every tracked
    /// piece of transient state from the client.
    ///
    /// Used by the transfer handshake after the real dimension change, so
    /// the new backend starts from a clean slate.
    pub fn synthesize_reset(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        for (&entity, effects) in &self.status_effects {
            for &effect in effects {
                messages.push(Message::remove_status_effect(entity, effect));
            }
        }
        for &bar in &self.boss_bars {
            messages.push(Message::boss_bar_remove(bar));
        }
        for objective in &self.scoreboard_objectives {
            messages.push(Message::scoreboard_remove(objective.clone()));
        }
        if self.weather_active {
            messages.push(Message::weather_clear());
        }
        for rule in &self.modified_game_rules {
            messages.push(Message::game_rule_reset(rule.clone()));
        }
        messages
    }

    /// Forgets everything tracked. Called when the old world is discarded.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.status_effects.clear();
        self.boss_bars.clear();
        self.scoreboard_objectives.clear();
        self.weather_active = false;
        self.modified_game_rules.clear();
    }
}

fn raw_bar_id(message: &Message) -> Option<[u8; 16]> {
    message.fields.iter().find_map(|field| match field {
        Field::Raw(bytes) => bytes.as_slice().try_into().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_despawn_update_registry() {
        let mut tracker = EntityTracker::new();
        tracker.observe(&Message::new(
            MessageKind::EntitySpawn,
            vec![Field::EntityId(5)],
        ));
        assert!(tracker.entities().contains(&5));

        tracker.observe(&Message::new(
            MessageKind::EntityDespawn,
            vec![Field::EntityId(5)],
        ));
        assert!(!tracker.entities().contains(&5));
    }

    #[test]
    fn suspended_tracker_ignores_messages() {
        let mut tracker = EntityTracker::new();
        tracker.suspend();
        tracker.observe(&Message::new(
            MessageKind::EntitySpawn,
            vec![Field::EntityId(5)],
        ));
        assert!(tracker.entities().is_empty());

        tracker.resume();
        tracker.observe(&Message::new(
            MessageKind::EntitySpawn,
            vec![Field::EntityId(5)],
        ));
        assert!(tracker.entities().contains(&5));
    }

    #[test]
    fn reset_synthesis_covers_all_transient_state() {
        let mut tracker = EntityTracker::new();
        tracker.observe(&Message::new(
            MessageKind::StatusEffect,
            vec![Field::EntityId(9), Field::UInt(2)],
        ));
        tracker.observe(&Message::new(
            MessageKind::BossBarAdd,
            vec![Field::Raw(vec![1; 16])],
        ));
        tracker.observe(&Message::new(
            MessageKind::ScoreboardObjective,
            vec![Field::Text("kills".to_string())],
        ));
        tracker.observe(&Message::new(
            MessageKind::WeatherChange,
            vec![Field::UInt(1)],
        ));
        tracker.observe(&Message::new(
            MessageKind::GameRule,
            vec![Field::Text("keepInventory".to_string()), Field::UInt(1)],
        ));

        let reset = tracker.synthesize_reset();
        assert_eq!(reset.len(), 5);
        assert!(reset
            .iter()
            .any(|m| m.kind == MessageKind::RemoveStatusEffect && m.entity_id() == Some(9)));
        assert!(reset.iter().any(|m| m.kind == MessageKind::BossBarRemove));
        assert!(reset
            .iter()
            .any(|m| m.kind == MessageKind::ScoreboardRemove && m.text() == Some("kills")));
        assert!(reset
            .iter()
            .any(|m| m.kind == MessageKind::WeatherChange && m.uint() == Some(0)));
        assert!(reset
            .iter()
            .any(|m| m.kind == MessageKind::GameRule && m.text() == Some("keepInventory")));
    }

    #[test]
    fn modified_game_rules_are_reset_to_defaults() {
        let mut tracker = EntityTracker::new();
        tracker.observe(&Message::new(
            MessageKind::GameRule,
            vec![Field::Text("doDaylightCycle".to_string()), Field::UInt(0)],
        ));

        let reset = tracker.synthesize_reset();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].kind, MessageKind::GameRule);
        assert_eq!(reset[0].text(), Some("doDaylightCycle"));
        // The restore-default form carries no value.
        assert_eq!(reset[0].uint(), None);

        // A rule already restored to its default needs no reset.
        tracker.observe(&Message::game_rule_reset("doDaylightCycle"));
        assert!(tracker.synthesize_reset().is_empty());
    }

    #[test]
    fn cleared_effects_are_not_resynthesized() {
        let mut tracker = EntityTracker::new();
        tracker.observe(&Message::new(
            MessageKind::StatusEffect,
            vec![Field::EntityId(9), Field::UInt(2)],
        ));
        tracker.observe(&Message::remove_status_effect(9, 2));
        assert!(tracker.synthesize_reset().is_empty());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut tracker = EntityTracker::new();
        tracker.observe(&Message::new(
            MessageKind::EntitySpawn,
            vec![Field::EntityId(5)],
        ));
        tracker.observe(&Message::new(
            MessageKind::WeatherChange,
            vec![Field::UInt(1)],
        ));
        tracker.clear();
        assert!(tracker.entities().is_empty());
        assert!(tracker.synthesize_reset().is_empty());
    }
}
