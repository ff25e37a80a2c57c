use crate::{
    api::RestClient,
    bus::{Event, EventBus, NotificationLevel},
    chat::{Attachment, ConversationKey, Message, MessageId, Outgoing},
    entity::{Participant, ParticipantId},
    session::{ChatSession, Subscription},
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

const HELP: &str = "\
Commands:
  /dm <user-id>        open a direct conversation
  /channel <id>        open a server channel
  /attach <url>        send an uploaded file
  /retry               resend the last failed message
  /leave               close the current conversation
  /help                show this text
  /quit                exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Direct(ParticipantId),
    Channel(String),
    Attach(String),
    Retry,
    Leave,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// `None` for blank input.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Say(line.to_string()));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        let command = match (name, arg) {
            ("dm", id) if !id.is_empty() => Command::Direct(ParticipantId::new(id)),
            ("channel", id) if !id.is_empty() => Command::Channel(id.to_string()),
            ("attach", url) if !url.is_empty() => Command::Attach(url.to_string()),
            ("retry", _) => Command::Retry,
            ("leave", _) => Command::Leave,
            ("help", _) => Command::Help,
            ("quit", _) | ("exit", _) => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        };
        Some(command)
    }
}

/// Turns snapshots into terminal lines, printing only messages that are new or
/// changed since the previous snapshot.
#[derive(Debug, Default)]
pub struct Renderer {
    names: HashMap<ParticipantId, Participant>,
    printed: HashMap<MessageId, String>,
}

impl Renderer {
    pub fn remember(&mut self, participant: Participant) {
        self.names.insert(participant.id.clone(), participant);
    }

    pub fn reset(&mut self) {
        self.printed.clear();
    }

    pub fn line(&self, message: &Message) -> String {
        let author = self.names.get(&message.sender_id);
        let (initial, name) = match author {
            Some(author) => (author.initial(), author.display_name().to_string()),
            None => (
                crate::entity::summary_initial(message.sender_id.as_str()),
                message.sender_id.to_string(),
            ),
        };

        let body = match (&message.attachment, &message.text) {
            (Some(file), _) => format!("[{} {}] {}", file.kind.as_str(), file.file_name, file.url),
            (None, Some(text)) => text.clone(),
            (None, None) => String::new(),
        };

        format!("[{}] {} {}: {}", message.delivery, initial, name, body)
    }

    /// Lines of messages whose rendering differs from the previous snapshot,
    /// in snapshot order. Removed messages print nothing.
    pub fn diff(&mut self, snapshot: &[Message]) -> Vec<String> {
        let mut printed = HashMap::with_capacity(snapshot.len());
        let mut changed = Vec::new();
        for message in snapshot {
            let line = self.line(message);
            if self.printed.get(&message.id) != Some(&line) {
                changed.push(line.clone());
            }
            printed.insert(message.id.clone(), line);
        }
        self.printed = printed;
        changed
    }
}

pub struct TerminalInterface {
    session: ChatSession,
    rest: Arc<RestClient>,
    bus: Arc<EventBus>,
    renderer: Arc<Mutex<Renderer>>,
    view: Option<Subscription>,
}

impl TerminalInterface {
    pub fn new(session: ChatSession, rest: Arc<RestClient>, bus: Arc<EventBus>) -> Self {
        let mut renderer = Renderer::default();
        renderer.remember(session.identity().participant.clone());
        Self {
            session,
            rest,
            bus,
            renderer: Arc::new(Mutex::new(renderer)),
            view: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.spawn_notice_printer();
        println!("{}", HELP);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(command) = Command::parse(&line) else {
                continue;
            };
            if command == Command::Quit {
                break;
            }
            self.handle(command).await;
        }

        info!("Terminal input closed");
        Ok(())
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Say(text) => self.send(Outgoing::Text(text)),
            Command::Attach(url) => self.send(Outgoing::Attachment(Attachment::from_url(url))),
            Command::Direct(friend) => {
                match self.rest.fetch_user(&friend).await {
                    Ok(profile) => self.with_renderer(|r| r.remember(profile)),
                    Err(e) => warn!(%friend, "Could not load profile: {}", e),
                }
                let key = ConversationKey::direct(self.session.identity().id().clone(), friend);
                self.open(key);
            }
            Command::Channel(channel) => self.open(ConversationKey::channel(channel)),
            Command::Retry => match self.session.last_failed() {
                Some(token) => {
                    if let Err(e) = self.session.retry(token) {
                        println!("! {}", e);
                    }
                }
                None => println!("! nothing to retry"),
            },
            Command::Leave => {
                self.view = None;
                self.session.deactivate();
            }
            Command::Help => println!("{}", HELP),
            Command::Unknown(input) => println!("! unknown command: {}", input),
            Command::Quit => {}
        }
    }

    fn send(&self, outgoing: Outgoing) {
        if let Err(e) = self.session.send(outgoing) {
            println!("! {}", e);
        }
    }

    fn open(&mut self, key: ConversationKey) {
        // Drop the old subscription first so no stale lines print
        self.view = None;
        self.with_renderer(Renderer::reset);
        println!("-- {} --", key);

        let renderer = self.renderer.clone();
        self.view = Some(self.session.subscribe(key.clone(), move |snapshot| {
            let lines = renderer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .diff(&snapshot);
            for line in lines {
                println!("{}", line);
            }
        }));
        self.session.activate(key);
    }

    fn with_renderer(&self, f: impl FnOnce(&mut Renderer)) {
        let mut renderer = self.renderer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *renderer);
    }

    fn spawn_notice_printer(&self) {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    Event::Notification { level, message } => {
                        let marker = match level {
                            NotificationLevel::Info => "*",
                            NotificationLevel::Warning | NotificationLevel::Error => "!",
                        };
                        println!("{} {}", marker, message);
                    }
                    Event::HistoryFailed { key, reason } => {
                        println!("! could not load history of {}: {}", key, reason);
                    }
                    _ => {}
                }
            }
        });
    }
}
