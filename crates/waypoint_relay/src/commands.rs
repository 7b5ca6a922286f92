//! Chat command dispatch and the relay client command set.
//!
//! Chat lines starting with the registry prefix are interpreted as commands;
//! anything else stays ordinary chat. Policy refusals (not the admin, target
//! not found, ban window closed) are answered as system chat lines, never as
//! errors, so a misbehaving client can at worst annoy itself.

use crate::ban::epoch_secs;
use crate::i18n::MessageBundle;
use crate::room::{RelayParticipant, RelayRoom};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use waypoint_net::proto;
use waypoint_net::ConnectionChannel;

/// The caller's context while one of its chat lines is being handled.
pub struct RelaySender {
    channel: ConnectionChannel,
    room: Arc<RelayRoom>,
    bundle: Arc<MessageBundle>,
}

impl RelaySender {
    pub fn new(channel: ConnectionChannel, room: Arc<RelayRoom>, bundle: Arc<MessageBundle>) -> Self {
        Self {
            channel,
            room,
            bundle,
        }
    }

    pub fn channel(&self) -> &ConnectionChannel {
        &self.channel
    }

    pub fn room(&self) -> &Arc<RelayRoom> {
        &self.room
    }

    pub fn bundle(&self) -> &MessageBundle {
        &self.bundle
    }

    /// System line to this caller only. A failed send marks the connection
    /// suspect and closes it.
    pub async fn system_message(&self, text: &str) {
        if self.channel.send(&proto::system_message(text)).await.is_err() {
            self.channel.close(Some(self.room.group())).await;
        }
    }

    pub async fn message_key(&self, key: &str) {
        let text = self.bundle.get(key);
        self.system_message(&text).await;
    }

    pub async fn message_fmt(&self, key: &str, args: &[&str]) {
        let text = self.bundle.format(key, args);
        self.system_message(&text).await;
    }

    /// True when the caller is the room admin; otherwise tells them off.
    pub async fn require_admin(&self) -> bool {
        if self.room.is_admin(&self.channel).await {
            return true;
        }
        self.message_key("err.noAdmin").await;
        false
    }
}

type Handler =
    Box<dyn for<'a> Fn(&'a CommandRegistry, &'a [String], &'a RelaySender) -> BoxFuture<'a, ()> + Send + Sync>;

struct Command {
    name: String,
    param_hint: String,
    description: String,
    handler: Handler,
}

/// Named commands behind one prefix, dispatched case-insensitively.
pub struct CommandRegistry {
    prefix: String,
    commands: Vec<Command>,
    index: HashMap<String, usize>,
}

impl CommandRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a command. A non-empty `param_hint` makes the first argument
    /// mandatory. A description of `HIDE` keeps the command out of help; a
    /// leading `#` marks the rest as a raw literal instead of a bundle key.
    pub fn register<F>(&mut self, name: &str, param_hint: &str, description: &str, handler: F)
    where
        F: for<'a> Fn(&'a CommandRegistry, &'a [String], &'a RelaySender) -> BoxFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.index.insert(name.to_lowercase(), self.commands.len());
        self.commands.push(Command {
            name: name.to_string(),
            param_hint: param_hint.to_string(),
            description: description.to_string(),
            handler: Box::new(handler),
        });
    }

    /// Try to interpret `line` as a command. Returns false when the line is
    /// plain chat and should be handled as such.
    pub async fn handle(&self, line: &str, sender: &RelaySender) -> bool {
        let Some(rest) = line.strip_prefix(&self.prefix) else {
            return false;
        };
        let mut tokens = rest.split_whitespace();
        let Some(name) = tokens.next() else {
            return false;
        };
        let Some(&idx) = self.index.get(&name.to_lowercase()) else {
            return false;
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();

        let command = &self.commands[idx];
        if !command.param_hint.is_empty() && args.is_empty() {
            sender.message_key("command.missingParam").await;
            return true;
        }
        (command.handler)(self, &args, sender).await;
        true
    }

    /// The help listing, one indented line per visible command.
    pub fn render_help(&self, bundle: &MessageBundle) -> String {
        let mut out = String::new();
        for command in &self.commands {
            if command.description == "HIDE" {
                continue;
            }
            let description = match command.description.strip_prefix('#') {
                Some(raw) => raw.to_string(),
                None => bundle.get(&command.description),
            };
            out.push_str("   ");
            out.push_str(&command.name);
            if !command.param_hint.is_empty() {
                out.push(' ');
                out.push_str(&command.param_hint);
            }
            out.push_str(" - ");
            out.push_str(&description);
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("prefix", &self.prefix)
            .field("commands", &self.commands.len())
            .finish()
    }
}

/// Resolve a command target. Purely numeric tokens match a site exactly;
/// anything else is a case-insensitive name substring search. Two or more
/// matches select nobody.
pub async fn find_player(sender: &RelaySender, token: &str) -> Option<RelayParticipant> {
    let room = sender.room();
    if let Ok(site) = token.parse::<u32>() {
        match room.participant(site) {
            Some(participant) => return Some(participant),
            None => {
                sender.message_fmt("relay.notFound", &[token]).await;
                return None;
            }
        }
    }

    let mut matches = room.find_by_name(token).into_iter();
    match (matches.next(), matches.next()) {
        (Some(participant), None) => Some(participant),
        (Some(_), Some(_)) => {
            sender.message_fmt("relay.ambiguous", &[token]).await;
            None
        }
        (None, _) => {
            sender.message_fmt("relay.notFound", &[token]).await;
            None
        }
    }
}

fn help_command<'a>(
    registry: &'a CommandRegistry,
    _args: &'a [String],
    sender: &'a RelaySender,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let listing = registry.render_help(sender.bundle());
        sender.system_message(&listing).await;
    })
}

fn jump_command<'a>(
    _registry: &'a CommandRegistry,
    args: &'a [String],
    sender: &'a RelaySender,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        // The host stays anchored; moving it would strand the whole room.
        if sender.room().is_admin(sender.channel()).await {
            sender.system_message("You Is ADMIN!").await;
            return;
        }
        let Some(target) = args.first() else { return };
        if sender.channel().send(&proto::relay_jump(target)).await.is_err() {
            sender.channel().close(Some(sender.room().group())).await;
        }
    })
}

fn kickx_command<'a>(
    _registry: &'a CommandRegistry,
    args: &'a [String],
    sender: &'a RelaySender,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        if !sender.require_admin().await {
            return;
        }
        let Some(token) = args.first() else { return };
        let Some(target) = find_player(sender, token).await else {
            return;
        };
        sender.room().bans().kick(&target.profile.uuid, epoch_secs());
        let reason = sender.bundle().get("relay.kicked");
        sender.room().kick(&target, &reason).await;
        sender
            .message_fmt("relay.kickOk", &[&target.profile.name])
            .await;
    })
}

fn ban_command<'a>(
    _registry: &'a CommandRegistry,
    args: &'a [String],
    sender: &'a RelaySender,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        if !sender.require_admin().await {
            return;
        }
        let now = epoch_secs();
        if !sender.room().can_ban_at(now) {
            sender.message_key("relay.banWindowClosed").await;
            return;
        }
        let Some(token) = args.first() else { return };
        let Some(target) = find_player(sender, token).await else {
            return;
        };
        sender.room().bans().kick_forever(&target.profile.uuid);
        sender
            .room()
            .bans()
            .ban_ip(&target.channel.ip().to_string());
        let reason = sender.bundle().get("relay.banned");
        sender.room().kick(&target, &reason).await;
        sender
            .message_fmt("relay.banOk", &[&target.profile.name])
            .await;
    })
}

fn allmute_command<'a>(
    _registry: &'a CommandRegistry,
    _args: &'a [String],
    sender: &'a RelaySender,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        if !sender.require_admin().await {
            return;
        }
        let muted = sender.room().toggle_allmute();
        let key = if muted {
            "relay.allmute.on"
        } else {
            "relay.allmute.off"
        };
        sender.message_key(key).await;
    })
}

/// The command set every relay participant gets.
pub fn relay_client_commands() -> CommandRegistry {
    let mut registry = CommandRegistry::new(".");
    registry.register("help", "", "clientCommands.help", help_command);
    registry.register("jump", "<ip/id>", "#Jump to another relay or server", jump_command);
    registry.register("kickx", "<Name/Position>", "#Kick Player", kickx_command);
    registry.register("ban", "<Name/Position>", "#Ban Player", ban_command);
    registry.register("allmute", "", "#All Player mute", allmute_command);
    registry
}
