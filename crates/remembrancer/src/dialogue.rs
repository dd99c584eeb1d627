//! Per-chat conversation state machine.
//!
//! Free text is interpreted through the chat's current mode; commands mostly
//! switch modes. Every step does its storage reads and writes before the next
//! update is looked at, so a chat's mode and scratch fields never race.

use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use rand::seq::SliceRandom;
use serde_json::json;
use tracing::{error, warn};

use crate::clock;
use crate::store::{Awaiting, Mode, ReminderStore, StoreError};
use crate::telegram::{Inbound, MessageSender, SendOptions};

const COMMANDS: &[&str] = &[
    "/start",
    "/help",
    "/commands",
    "/reminder",
    "/format",
    "/cancel",
    "/list",
    "/timezone",
    "/delete",
];

/// Replies for free text outside of any dialogue.
const PHRASES: &[&str] = &[
    "I only understand commands. Try /commands",
    "Hmm. That doesn't look like a command to me",
    "If you want a reminder, /reminder is the way",
    "I'd love to chat, but all I do is remember things",
    "Not sure what to do with that. /help?",
    "My vocabulary is limited to /commands",
];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const APOLOGY: &str = "Error with connection to database. It's bad. \
    Trying again won't help. Try something else. Sorry for this";

const START_TEXT: &str = "Hi! My name is Remembrancer
I am a bot for reminding you important things

To start enjoying the world of reminders type /reminder
But first better check /format

To get help /help";

const HELP_TEXT: &str = "Do not worry. I'll help you to navigate

Set a reminder /reminder
At the specified time I will send you the specified text

Check your reminders /list
Lists all your reminders which aren't sent yet

Change or set timezone /timezone
I need this to record date and time in the right form

Exit if there is something to exit /cancel

If you do not understand the format of all these messages check /format";

pub struct Dialogue<'a, S, R> {
    sender: &'a S,
    store: &'a R,
}

impl<'a, S, R> Dialogue<'a, S, R>
where
    S: MessageSender + Sync,
    R: ReminderStore + Sync,
{
    pub fn new(sender: &'a S, store: &'a R) -> Self {
        Self { sender, store }
    }

    /// Handles one inbound event end to end. Storage trouble is reported to
    /// the user and never escapes to the poll loop.
    pub async fn handle(&self, inbound: Inbound) {
        let chat_id = inbound.chat_id;
        let result = match &inbound.text {
            None => {
                self.random_phrase(chat_id).await;
                Ok(())
            }
            Some(text) if text.starts_with('/') => self.command(chat_id, text).await,
            Some(text) => {
                self.free_text(chat_id, text, inbound.keyboard_message_id)
                    .await
            }
        };

        if let Err(e) = result {
            match e {
                StoreError::Unavailable => warn!(chat_id, "Store unavailable; dropping update"),
                e => error!(chat_id, error = %e, "Store operation failed"),
            }
            self.say(chat_id, APOLOGY).await;
        }
    }

    async fn command(&self, chat_id: i64, text: &str) -> Result<(), StoreError> {
        let command = text.split_whitespace().next().unwrap_or(text);
        let mode = self.store.chat_mode(chat_id).await?.unwrap_or_default();

        if mode != Mode::Normal && !matches!(command, "/cancel" | "/format") {
            // Re-entering the current mode is harmless but must not reset
            // scratch state; everything else has to /cancel first.
            let reenter = matches!(
                (command, mode),
                ("/reminder", Mode::Reminder(_))
                    | ("/timezone", Mode::Timezone)
                    | ("/delete", Mode::Delete)
            );
            let reply = if reenter {
                format!("You are already in {} mode", mode.name())
            } else {
                format!("You can't do this in {} mode", mode.name())
            };
            self.say(chat_id, &reply).await;
            return Ok(());
        }

        match command {
            "/start" => self.say(chat_id, START_TEXT).await,
            "/help" => self.say(chat_id, HELP_TEXT).await,
            "/commands" => {
                let reply = format!("<b>Available commands</b>:\n{}", COMMANDS.join("\n"));
                self.say_html(chat_id, &reply).await;
            }
            "/reminder" => self.enter_reminder(chat_id).await?,
            "/format" => self.format_help(chat_id).await?,
            "/cancel" => self.cancel(chat_id, mode).await?,
            "/list" => self.list(chat_id).await?,
            "/timezone" => self.enter_timezone(chat_id).await?,
            "/delete" => self.enter_delete(chat_id).await?,
            other => {
                self.say(chat_id, &format!("Command {other} not found")).await;
            }
        }
        Ok(())
    }

    async fn free_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard_message_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let mode = self.store.chat_mode(chat_id).await?.unwrap_or_default();
        match mode {
            Mode::Normal => {
                self.random_phrase(chat_id).await;
                Ok(())
            }
            Mode::Reminder(awaiting) => self.reminder_step(chat_id, awaiting, text).await,
            Mode::Timezone => self.timezone_step(chat_id, text).await,
            Mode::Delete => self.delete_step(chat_id, text, keyboard_message_id).await,
        }
    }

    async fn enter_reminder(&self, chat_id: i64) -> Result<(), StoreError> {
        if self.store.timezone(chat_id).await?.is_none() {
            self.say(chat_id, "Wait. I don't know your timezone. Let me record it")
                .await;
            return self.enter_timezone(chat_id).await;
        }
        self.store
            .set_chat_mode(chat_id, Mode::Reminder(Awaiting::Date))
            .await?;
        self.say(chat_id, "Enter date").await;
        Ok(())
    }

    async fn enter_timezone(&self, chat_id: i64) -> Result<(), StoreError> {
        self.store.set_chat_mode(chat_id, Mode::Timezone).await?;
        match self.store.timezone(chat_id).await? {
            None => self.say(chat_id, "Enter timezone").await,
            Some(offset) => {
                let offset = if offset > 0 {
                    format!("+{offset}")
                } else {
                    offset.to_string()
                };
                self.say(
                    chat_id,
                    &format!(
                        "Your timezone is {offset}. Enter timezone to change it or /cancel to keep it"
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn enter_delete(&self, chat_id: i64) -> Result<(), StoreError> {
        let reminders = self.store.chat_reminders(chat_id).await?;
        if reminders.is_empty() {
            self.say(chat_id, "You have no reminders").await;
            return Ok(());
        }
        let Some(offset) = self.store.timezone(chat_id).await? else {
            self.say(chat_id, "Wait. I don't know your timezone. Let me record it")
                .await;
            return self.enter_timezone(chat_id).await;
        };

        self.store.set_chat_mode(chat_id, Mode::Delete).await?;

        let rows: Vec<serde_json::Value> = reminders
            .iter()
            .map(|reminder| {
                let label = local_stamp(offset, reminder.fire_at);
                json!([{ "text": label, "callback_data": label }])
            })
            .collect();
        self.sender
            .send(
                chat_id,
                "Select reminder to delete",
                SendOptions {
                    html: false,
                    markup: Some(json!({ "inline_keyboard": rows })),
                },
            )
            .await;
        Ok(())
    }

    async fn cancel(&self, chat_id: i64, mode: Mode) -> Result<(), StoreError> {
        if mode == Mode::Normal {
            self.say(chat_id, "You are already in normal mode").await;
        } else {
            self.store.set_chat_mode(chat_id, Mode::Normal).await?;
            self.say(chat_id, "Now you are in normal mode").await;
        }
        Ok(())
    }

    async fn format_help(&self, chat_id: i64) -> Result<(), StoreError> {
        let now = Utc::now().naive_utc();
        let offset = self
            .store
            .timezone(chat_id)
            .await?
            .map(i32::abs)
            .unwrap_or(12);
        let reply = format!(
            "Date format: {day}/{month} or {day}/{month}/{year}\n\
             Time format: {hour:02}:{minute:02}\n\
             Timezone format: {offset} or -{offset}",
            day = now.day(),
            month = now.month(),
            year = now.year(),
            hour = now.hour(),
            minute = now.minute(),
        );
        self.say(chat_id, &reply).await;
        Ok(())
    }

    async fn list(&self, chat_id: i64) -> Result<(), StoreError> {
        let reminders = self.store.chat_reminders(chat_id).await?;
        if reminders.is_empty() {
            self.say(chat_id, "You have no reminders").await;
            return Ok(());
        }
        let Some(offset) = self.store.timezone(chat_id).await? else {
            self.say(chat_id, "Wait. I don't know your timezone. Let me record it")
                .await;
            return self.enter_timezone(chat_id).await;
        };

        let mut reply = String::from("Your reminders:");
        for (i, reminder) in reminders.iter().enumerate() {
            reply.push_str(&format!(
                "\n{}. {} <i>{}</i>",
                i + 1,
                local_stamp(offset, reminder.fire_at),
                reminder.text,
            ));
        }
        self.say_html(chat_id, &reply).await;
        Ok(())
    }

    async fn reminder_step(
        &self,
        chat_id: i64,
        awaiting: Awaiting,
        text: &str,
    ) -> Result<(), StoreError> {
        match awaiting {
            Awaiting::Date => self.reminder_date_step(chat_id, text).await,
            Awaiting::Time => self.reminder_time_step(chat_id, text).await,
            Awaiting::Text => self.reminder_text_step(chat_id, text).await,
        }
    }

    async fn reminder_date_step(&self, chat_id: i64, text: &str) -> Result<(), StoreError> {
        if !clock::validate_date(text) {
            self.say(chat_id, "Date is invalid (/format)").await;
            return Ok(());
        }
        self.store.save_scratch_date(chat_id, text).await?;
        self.store
            .set_chat_mode(chat_id, Mode::Reminder(Awaiting::Time))
            .await?;
        self.say(chat_id, "Enter time").await;
        Ok(())
    }

    async fn reminder_time_step(&self, chat_id: i64, text: &str) -> Result<(), StoreError> {
        if !clock::validate_time(text) {
            self.say(chat_id, "Time is invalid (/format)").await;
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        let offset = self.store.timezone(chat_id).await?;
        let date = self.store.scratch_date(chat_id).await?;
        let Some(fire_at) = combine(offset, now, date.as_deref(), Some(text)) else {
            self.say(chat_id, "Something went wrong").await;
            self.store.set_chat_mode(chat_id, Mode::Normal).await?;
            return Ok(());
        };

        if !clock::is_future(fire_at, now) {
            self.say(
                chat_id,
                "You are trying to set a reminder in the past. I can't do that",
            )
            .await;
            self.store.set_chat_mode(chat_id, Mode::Normal).await?;
            return Ok(());
        }

        self.store.save_scratch_time(chat_id, text).await?;
        self.store
            .set_chat_mode(chat_id, Mode::Reminder(Awaiting::Text))
            .await?;
        self.say(chat_id, "Enter reminder text (- to make a reminder without text)")
            .await;
        Ok(())
    }

    async fn reminder_text_step(&self, chat_id: i64, text: &str) -> Result<(), StoreError> {
        let now = Utc::now().naive_utc();
        let offset = self.store.timezone(chat_id).await?;
        let date = self.store.scratch_date(chat_id).await?;
        let time = self.store.scratch_time(chat_id).await?;
        let Some(fire_at) = combine(offset, now, date.as_deref(), time.as_deref()) else {
            self.say(chat_id, "Something went wrong").await;
            self.store.set_chat_mode(chat_id, Mode::Normal).await?;
            return Ok(());
        };

        // "-" sets a reminder without a body
        let body = if text == "-" { "" } else { text };

        match self.store.insert_reminder(chat_id, fire_at, body).await {
            Ok(()) => {
                // Offset is present here, or `combine` would have bailed.
                let local = clock::to_local(offset.unwrap_or(0), fire_at);
                self.say(
                    chat_id,
                    &format!(
                        "Reminder is set on {} {} {}, {:02}:{:02}",
                        local.day(),
                        MONTH_NAMES[local.month0() as usize],
                        local.year(),
                        local.hour(),
                        local.minute(),
                    ),
                )
                .await;
            }
            Err(StoreError::Duplicate) => {
                self.say(chat_id, "Error. You already have a reminder with the same time")
                    .await;
            }
            // No write happened, so the mode is deliberately left as-is.
            Err(e @ StoreError::Unavailable) => return Err(e),
            Err(e) => {
                error!(chat_id, error = %e, "Failed to persist reminder");
                self.say(chat_id, "Something went wrong. Reminder is not set")
                    .await;
            }
        }

        self.store.set_chat_mode(chat_id, Mode::Normal).await?;
        Ok(())
    }

    async fn timezone_step(&self, chat_id: i64, text: &str) -> Result<(), StoreError> {
        let Some(offset) = clock::parse_offset(text) else {
            self.say(chat_id, "Wrong format. Check /format").await;
            return Ok(());
        };
        self.store.set_timezone(chat_id, offset).await?;
        self.say(chat_id, "Timezone is set").await;
        self.store.set_chat_mode(chat_id, Mode::Normal).await?;
        Ok(())
    }

    async fn delete_step(
        &self,
        chat_id: i64,
        text: &str,
        keyboard_message_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut parts = text.split_whitespace();
        let (Some(date), Some(time), None) = (parts.next(), parts.next(), parts.next()) else {
            self.say(chat_id, "Wrong format. Check /format").await;
            return Ok(());
        };
        if !clock::validate_date(date) || !clock::validate_time(time) {
            self.say(chat_id, "Wrong format. Check /format").await;
            return Ok(());
        }
        // Deletion needs the full D/M/Y form, as rendered by /list.
        let Some(local) = clock::parse_local(date, time) else {
            self.say(chat_id, "Wrong format. Check /format").await;
            return Ok(());
        };
        let Some(offset) = self.store.timezone(chat_id).await? else {
            self.say(chat_id, "Wait. I don't know your timezone. Let me record it")
                .await;
            return self.enter_timezone(chat_id).await;
        };

        let fire_at = clock::to_utc(offset, local);
        let Some(reminder) = self.store.reminder_at(chat_id, fire_at).await? else {
            self.say(chat_id, "There is no reminder at this time").await;
            return Ok(());
        };

        self.store
            .delete_reminder(reminder.chat_id, reminder.fire_at)
            .await?;
        self.say(chat_id, "Reminder deleted").await;
        self.store.set_chat_mode(chat_id, Mode::Normal).await?;
        if let Some(message_id) = keyboard_message_id {
            self.sender.clear_markup(chat_id, message_id).await;
        }
        Ok(())
    }

    async fn random_phrase(&self, chat_id: i64) {
        let phrase = PHRASES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("...");
        self.say(chat_id, phrase).await;
    }

    async fn say(&self, chat_id: i64, text: &str) {
        self.sender.send(chat_id, text, SendOptions::default()).await;
    }

    async fn say_html(&self, chat_id: i64, text: &str) {
        self.sender
            .send(
                chat_id,
                text,
                SendOptions {
                    html: true,
                    markup: None,
                },
            )
            .await;
    }
}

/// Combines scratch date/time tokens into a UTC fire instant. `None` when the
/// offset or either token is missing, or when the pair doesn't parse.
fn combine(
    offset_hours: Option<i32>,
    now_utc: NaiveDateTime,
    date: Option<&str>,
    time: Option<&str>,
) -> Option<NaiveDateTime> {
    let offset_hours = offset_hours?;
    let date = clock::resolve_year(offset_hours, now_utc, date?);
    let local = clock::parse_local(&date, time?)?;
    Some(clock::to_utc(offset_hours, local))
}

fn local_stamp(offset_hours: i32, fire_at_utc: NaiveDateTime) -> String {
    let local = clock::to_local(offset_hours, fire_at_utc);
    format!(
        "{:02}/{:02}/{} {:02}:{:02}",
        local.day(),
        local.month(),
        local.year(),
        local.hour(),
        local.minute(),
    )
}
