//! Best-effort player tracking from console text.
//!
//! Log formats differ between server distributions, so the matcher sits behind
//! [`PlayerLogParser`] and can be replaced (or disabled with [`NoPlayerTracking`])
//! without touching lifecycle code.

use std::{collections::BTreeSet, fmt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Joined(String),
    Left(String),
}

pub trait PlayerLogParser: Send + Sync + fmt::Debug {
    fn parse(&self, line: &str) -> Option<PlayerEvent>;
}

/// Matches `...]: <name> joined the game` / `...]: <name> left the game`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VanillaLogPatterns;

const JOINED: &str = " joined the game";
const LEFT: &str = " left the game";

fn is_player_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn name_before<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.match_indices("]: ").find_map(|(idx, sep)| {
        let rest = &line[idx + sep.len()..];
        let (name, _) = rest.split_once(marker)?;
        is_player_name(name).then_some(name)
    })
}

impl PlayerLogParser for VanillaLogPatterns {
    fn parse(&self, line: &str) -> Option<PlayerEvent> {
        if let Some(name) = name_before(line, JOINED) {
            return Some(PlayerEvent::Joined(name.to_string()));
        }
        name_before(line, LEFT).map(|name| PlayerEvent::Left(name.to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlayerTracking;

impl PlayerLogParser for NoPlayerTracking {
    fn parse(&self, _line: &str) -> Option<PlayerEvent> {
        None
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConnectedPlayers(BTreeSet<String>);

impl ConnectedPlayers {
    pub(crate) fn apply(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Joined(name) => {
                self.0.insert(name);
            }
            PlayerEvent::Left(name) => {
                self.0.remove(&name);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vanilla_join_and_leave() {
        let p = VanillaLogPatterns;
        assert_eq!(
            p.parse("[12:00:01] [Server thread/INFO]: Steve joined the game"),
            Some(PlayerEvent::Joined("Steve".to_string()))
        );
        assert_eq!(
            p.parse("[12:05:44] [Server thread/INFO]: Alex_99 left the game"),
            Some(PlayerEvent::Left("Alex_99".to_string()))
        );
    }

    #[test]
    fn ignores_chat_and_unrelated_lines() {
        let p = VanillaLogPatterns;
        assert_eq!(p.parse("[12:00:01] [Server thread/INFO]: Done (3.2s)!"), None);
        assert_eq!(
            p.parse("[12:00:01] [Server thread/INFO]: <Steve> bob joined the game lol"),
            None
        );
        assert_eq!(p.parse("Steve joined the game"), None);
    }

    #[test]
    fn connected_set_follows_events() {
        let mut set = ConnectedPlayers::default();
        set.apply(PlayerEvent::Joined("Steve".into()));
        set.apply(PlayerEvent::Joined("Alex".into()));
        set.apply(PlayerEvent::Left("Steve".into()));
        assert_eq!(set.names(), ["Alex"]);
        set.clear();
        assert!(set.names().is_empty());
    }

    #[test]
    fn disabled_tracker_never_matches() {
        assert_eq!(
            NoPlayerTracking.parse("[x]: Steve joined the game"),
            None
        );
    }
}
