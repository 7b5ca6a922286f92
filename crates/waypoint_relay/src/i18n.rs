//! Localized message lookup.
//!
//! Every player-facing string goes through a [`MessageBundle`]. Lookups that
//! miss fall back to the key itself, so a hole in a bundle degrades to an
//! ugly message instead of a panic or an empty line.

use std::collections::HashMap;

/// Key to localized text mapping with `{0}`-style placeholder substitution.
#[derive(Debug, Clone)]
pub struct MessageBundle {
    messages: HashMap<String, String>,
}

impl MessageBundle {
    /// An empty bundle. Every lookup falls back to its key.
    pub fn empty() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// The built-in English bundle covering every key the relay emits.
    pub fn with_defaults() -> Self {
        let mut bundle = Self::empty();
        for (key, text) in [
            ("err.noAdmin", "You are not the administrator of this room"),
            ("relay.notFound", "Player {0} not found"),
            ("relay.ambiguous", "Multiple players match {0}, be more specific"),
            ("relay.kickOk", "Kick : {0} OK"),
            ("relay.banOk", "BAN : {0} OK"),
            (
                "relay.banWindowClosed",
                "The game has been running too long to ban players",
            ),
            ("relay.allmute.on", "All players are now muted"),
            ("relay.allmute.off", "All players are now unmuted"),
            ("relay.kicked", "You have been kicked from the room"),
            ("relay.banned", "You are banned from this room"),
            ("relay.roomClosed", "The host has left, the room is closed"),
            ("command.missingParam", "Too few command arguments."),
            ("clientCommands.help", "Get command help"),
        ] {
            bundle.insert(key, text);
        }
        bundle
    }

    pub fn insert(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.messages.insert(key.into(), text.into());
    }

    /// Localized text for `key`, or the key itself when unknown.
    pub fn get(&self, key: &str) -> String {
        match self.messages.get(key) {
            Some(text) => text.clone(),
            None => key.to_string(),
        }
    }

    /// Localized text with positional `{0}`, `{1}`, ... placeholders filled.
    pub fn format(&self, key: &str, args: &[&str]) -> String {
        let mut text = self.get(key);
        for (i, arg) in args.iter().enumerate() {
            text = text.replace(&format!("{{{}}}", i), arg);
        }
        text
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for MessageBundle {
    fn default() -> Self {
        Self::with_defaults()
    }
}
