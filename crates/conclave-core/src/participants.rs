use crate::events::{ConferenceEvent, ParticipantInfo};

/// Participants currently in the conference.
///
/// Owned by the event bus task and updated from participant events
/// before they reach listeners.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: Vec<ParticipantInfo>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_participant(&mut self, info: ParticipantInfo) {
        if !self.participants.iter().any(|p| p.id == info.id) {
            self.participants.push(info);
        }
    }

    /// Replace an existing entry, or add it if the create was missed.
    pub fn update_participant(&mut self, info: ParticipantInfo) {
        match self.participant_mut(&info.id) {
            Some(existing) => *existing = info,
            None => self.participants.push(info),
        }
    }

    pub fn remove_participant(&mut self, id: &str) {
        self.participants.retain(|p| p.id != id);
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    #[cfg(test)]
    fn participant(&self, id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn participant_mut(&mut self, id: &str) -> Option<&mut ParticipantInfo> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    #[cfg(test)]
    fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Apply a roster-affecting event; other events are ignored.
    pub fn apply(&mut self, event: &ConferenceEvent) {
        match event {
            ConferenceEvent::ParticipantJoined(info) => self.add_participant(info.clone()),
            ConferenceEvent::ParticipantUpdated(info) => self.update_participant(info.clone()),
            ConferenceEvent::ParticipantLeft(id) => self.remove_participant(id),
            ConferenceEvent::Disconnect { .. } | ConferenceEvent::Bye => self.clear(),
            _ => {}
        }
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_participant(id: &str, name: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: id.to_string(),
            display_name: name.to_string(),
            uri: None,
            is_muted: false,
            is_presenting: false,
        }
    }

    #[test]
    fn add_and_retrieve_participant() {
        let mut roster = Roster::new();
        roster.add_participant(make_participant("p1", "Alice"));
        assert_eq!(roster.participant_count(), 1);
        assert_eq!(roster.participant("p1").unwrap().display_name, "Alice");
    }

    #[test]
    fn no_duplicate_participants() {
        let mut roster = Roster::new();
        roster.add_participant(make_participant("p1", "Alice"));
        roster.add_participant(make_participant("p1", "Alice"));
        assert_eq!(roster.participant_count(), 1);
    }

    #[test]
    fn update_replaces_or_inserts() {
        let mut roster = Roster::new();
        roster.add_participant(make_participant("p1", "Alice"));

        let mut muted = make_participant("p1", "Alice");
        muted.is_muted = true;
        roster.update_participant(muted);
        roster.update_participant(make_participant("p2", "Bob"));

        assert!(roster.participant("p1").unwrap().is_muted);
        assert_eq!(roster.participant_count(), 2);
    }

    #[test]
    fn remove_participant() {
        let mut roster = Roster::new();
        roster.add_participant(make_participant("p1", "Alice"));
        roster.add_participant(make_participant("p2", "Bob"));
        roster.remove_participant("p1");
        assert_eq!(roster.participant_count(), 1);
        assert!(roster.participant("p1").is_none());
        assert!(roster.participant("p2").is_some());
    }

    #[test]
    fn apply_follows_participant_events() {
        let mut roster = Roster::new();
        roster.apply(&ConferenceEvent::ParticipantJoined(make_participant("p1", "Alice")));
        roster.apply(&ConferenceEvent::ParticipantJoined(make_participant("p2", "Bob")));
        roster.apply(&ConferenceEvent::ParticipantLeft("p1".into()));
        roster.apply(&ConferenceEvent::PresentationStop);
        assert_eq!(roster.participants(), &[make_participant("p2", "Bob")]);

        roster.apply(&ConferenceEvent::Bye);
        assert_eq!(roster.participant_count(), 0);
    }
}
