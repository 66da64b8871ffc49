//! Terminal rendering of the message log.

use std::collections::HashMap;

use colored::*;

use crate::message_log::{Message, MessageStatus};
use crate::patch::Role;

fn role_label(message: &Message) -> ColoredString {
    let label = match (&message.role, message.publisher.as_deref()) {
        (Role::Assistant, Some(publisher)) => publisher.to_string(),
        (role, _) => role.to_string(),
    };
    match message.role {
        Role::User => label.bright_green().bold(),
        Role::Assistant => label.bright_cyan().bold(),
        Role::System => label.bright_yellow().bold(),
    }
}

/// Header line: role or publisher, title, id and status.
pub fn render_header(message: &Message) -> String {
    let status = match message.status {
        MessageStatus::Generating => "generating".bright_magenta(),
        MessageStatus::Completed => "completed".dimmed(),
    };
    let title = if message.title.is_empty() {
        String::new()
    } else {
        format!(" {}", message.title.bright_white())
    };
    format!(
        "[{}]{} {} {}",
        role_label(message),
        title,
        message.id.dimmed(),
        status
    )
}

pub fn render_message(message: &Message) -> String {
    let mut out = render_header(message);
    if !message.action_title.is_empty() {
        out.push_str(&format!(
            "\n  {} {}",
            "action:".bright_yellow(),
            message.action_title
        ));
    }
    if !message.thinking.is_empty() {
        out.push_str(&format!("\n{}", message.thinking.dimmed().italic()));
    }
    if !message.content.is_empty() {
        out.push('\n');
        out.push_str(&message.content);
    }
    out
}

pub fn render_log(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "(no messages)".dimmed().to_string();
    }
    let rule = "=".repeat(50).bright_blue().to_string();
    messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join(&format!("\n{rule}\n"))
}

/// Tracks how much of each message's content has been printed so streaming
/// output can be written incrementally.
#[derive(Debug, Default)]
pub struct LivePrinter {
    printed: HashMap<String, usize>,
}

impl LivePrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content not yet printed for `message`.
    ///
    /// A message whose content shrank (rollback, continuation replay) is
    /// printed again from the start.
    pub fn unprinted<'a>(&mut self, message: &'a Message) -> &'a str {
        let content = message.content.as_str();
        let seen = self.printed.entry(message.id.clone()).or_insert(0);
        let start = if *seen <= content.len() && content.is_char_boundary(*seen) {
            *seen
        } else {
            0
        };
        *seen = content.len();
        &content[start..]
    }

    pub fn is_new(&self, id: &str) -> bool {
        !self.printed.contains_key(id)
    }
}
