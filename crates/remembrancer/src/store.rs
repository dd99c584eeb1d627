//! Reminder and chat-state persistence.
//!
//! Every operation is a short, independently committed statement. An
//! unreachable database surfaces as [`StoreError::Unavailable`] so callers
//! can degrade to a no-op instead of crashing the poll loop.

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is unreachable")]
    Unavailable,
    #[error("a reminder already exists at this time")]
    Duplicate,
    #[error("query failed: {0}")]
    Query(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
            _ => StoreError::Query(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Date,
    Time,
    Text,
}

/// Dialogue mode of a chat. The reminder sub-state lives inside the
/// `Reminder` variant, so a mode can never carry a stray `awaits_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    Reminder(Awaiting),
    Timezone,
    Delete,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Reminder(_) => "reminder",
            Mode::Timezone => "timezone",
            Mode::Delete => "delete",
        }
    }

    /// Splits the mode into its persisted `(chat_mode, awaits_for)` columns.
    pub fn to_columns(self) -> (&'static str, &'static str) {
        match self {
            Mode::Normal => ("normal", ""),
            Mode::Reminder(Awaiting::Date) => ("reminder", "date"),
            Mode::Reminder(Awaiting::Time) => ("reminder", "time"),
            Mode::Reminder(Awaiting::Text) => ("reminder", "text"),
            Mode::Timezone => ("timezone", ""),
            Mode::Delete => ("delete", ""),
        }
    }

    pub fn from_columns(mode: &str, awaits_for: &str) -> Option<Self> {
        match (mode, awaits_for) {
            ("normal", "") => Some(Mode::Normal),
            ("reminder", "date") => Some(Mode::Reminder(Awaiting::Date)),
            ("reminder", "time") => Some(Mode::Reminder(Awaiting::Time)),
            ("reminder", "text") => Some(Mode::Reminder(Awaiting::Text)),
            ("timezone", "") => Some(Mode::Timezone),
            ("delete", "") => Some(Mode::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub chat_id: i64,
    /// UTC, minute precision. Unique per chat.
    pub fire_at: NaiveDateTime,
    pub text: String,
}

#[async_trait]
pub trait ReminderStore {
    async fn chat_mode(&self, chat_id: i64) -> Result<Option<Mode>, StoreError>;
    async fn set_chat_mode(&self, chat_id: i64, mode: Mode) -> Result<(), StoreError>;

    async fn timezone(&self, chat_id: i64) -> Result<Option<i32>, StoreError>;
    async fn set_timezone(&self, chat_id: i64, offset_hours: i32) -> Result<(), StoreError>;

    async fn scratch_date(&self, chat_id: i64) -> Result<Option<String>, StoreError>;
    async fn scratch_time(&self, chat_id: i64) -> Result<Option<String>, StoreError>;
    async fn save_scratch_date(&self, chat_id: i64, date: &str) -> Result<(), StoreError>;
    async fn save_scratch_time(&self, chat_id: i64, time: &str) -> Result<(), StoreError>;

    async fn insert_reminder(
        &self,
        chat_id: i64,
        fire_at: NaiveDateTime,
        text: &str,
    ) -> Result<(), StoreError>;
    async fn chat_reminders(&self, chat_id: i64) -> Result<Vec<Reminder>, StoreError>;
    async fn reminder_at(
        &self,
        chat_id: i64,
        fire_at: NaiveDateTime,
    ) -> Result<Option<Reminder>, StoreError>;
    /// Reminders whose fire instant is less than one second away from `now`,
    /// i.e. due now or overdue.
    async fn due_reminders(&self, now: NaiveDateTime) -> Result<Vec<Reminder>, StoreError>;
    async fn delete_reminder(&self, chat_id: i64, fire_at: NaiveDateTime)
    -> Result<(), StoreError>;
}

/// Postgres-backed store. The pool connects lazily, so construction succeeds
/// even while the database is down; individual operations then report
/// [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect_lazy(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ReminderStore for PgStore {
    async fn chat_mode(&self, chat_id: i64) -> Result<Option<Mode>, StoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT chat_mode, awaits_for FROM chat WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(mode, awaits_for)| Mode::from_columns(&mode, &awaits_for)))
    }

    async fn set_chat_mode(&self, chat_id: i64, mode: Mode) -> Result<(), StoreError> {
        let (chat_mode, awaits_for) = mode.to_columns();
        sqlx::query(
            "INSERT INTO chat (chat_id, chat_mode, awaits_for) VALUES ($1, $2, $3) \
             ON CONFLICT (chat_id) DO UPDATE \
             SET chat_mode = EXCLUDED.chat_mode, awaits_for = EXCLUDED.awaits_for",
        )
        .bind(chat_id)
        .bind(chat_mode)
        .bind(awaits_for)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn timezone(&self, chat_id: i64) -> Result<Option<i32>, StoreError> {
        let row: Option<(Option<i32>,)> =
            sqlx::query_as("SELECT timezone FROM chat WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(timezone,)| timezone))
    }

    async fn set_timezone(&self, chat_id: i64, offset_hours: i32) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat (chat_id, chat_mode, awaits_for, timezone) \
             VALUES ($1, 'normal', '', $2) \
             ON CONFLICT (chat_id) DO UPDATE SET timezone = EXCLUDED.timezone",
        )
        .bind(chat_id)
        .bind(offset_hours)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scratch_date(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT reminder_date FROM scratch WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(date,)| date))
    }

    async fn scratch_time(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT reminder_time FROM scratch WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(time,)| time))
    }

    async fn save_scratch_date(&self, chat_id: i64, date: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scratch (chat_id, reminder_date) VALUES ($1, $2) \
             ON CONFLICT (chat_id) DO UPDATE SET reminder_date = EXCLUDED.reminder_date",
        )
        .bind(chat_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_scratch_time(&self, chat_id: i64, time: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scratch (chat_id, reminder_time) VALUES ($1, $2) \
             ON CONFLICT (chat_id) DO UPDATE SET reminder_time = EXCLUDED.reminder_time",
        )
        .bind(chat_id)
        .bind(time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_reminder(
        &self,
        chat_id: i64,
        fire_at: NaiveDateTime,
        text: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO reminder (chat_id, fire_at, reminder_text) VALUES ($1, $2, $3)")
            .bind(chat_id)
            .bind(fire_at)
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn chat_reminders(&self, chat_id: i64) -> Result<Vec<Reminder>, StoreError> {
        let rows: Vec<(i64, NaiveDateTime, String)> = sqlx::query_as(
            "SELECT chat_id, fire_at, reminder_text FROM reminder \
             WHERE chat_id = $1 ORDER BY fire_at",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_reminder).collect())
    }

    async fn reminder_at(
        &self,
        chat_id: i64,
        fire_at: NaiveDateTime,
    ) -> Result<Option<Reminder>, StoreError> {
        let row: Option<(i64, NaiveDateTime, String)> = sqlx::query_as(
            "SELECT chat_id, fire_at, reminder_text FROM reminder \
             WHERE chat_id = $1 AND fire_at = $2",
        )
        .bind(chat_id)
        .bind(fire_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(into_reminder))
    }

    async fn due_reminders(&self, now: NaiveDateTime) -> Result<Vec<Reminder>, StoreError> {
        let cutoff = now + Duration::seconds(1);
        let rows: Vec<(i64, NaiveDateTime, String)> = sqlx::query_as(
            "SELECT chat_id, fire_at, reminder_text FROM reminder \
             WHERE fire_at < $1 ORDER BY fire_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_reminder).collect())
    }

    async fn delete_reminder(
        &self,
        chat_id: i64,
        fire_at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM reminder WHERE chat_id = $1 AND fire_at = $2")
            .bind(chat_id)
            .bind(fire_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn into_reminder((chat_id, fire_at, text): (i64, NaiveDateTime, String)) -> Reminder {
    Reminder {
        chat_id,
        fire_at,
        text,
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory store for exercising the dialogue and sweeper without a
    //! database.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct Inner {
        modes: HashMap<i64, Mode>,
        timezones: HashMap<i64, i32>,
        scratch_dates: HashMap<i64, String>,
        scratch_times: HashMap<i64, String>,
        reminders: Vec<Reminder>,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
        unavailable: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every subsequent operation fail with `Unavailable`.
        pub fn go_offline(&self) {
            self.unavailable.store(true, Ordering::SeqCst);
        }

        pub fn reminders(&self) -> Vec<Reminder> {
            self.inner.lock().unwrap().reminders.clone()
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ReminderStore for MemoryStore {
        async fn chat_mode(&self, chat_id: i64) -> Result<Option<Mode>, StoreError> {
            self.check()?;
            Ok(self.inner.lock().unwrap().modes.get(&chat_id).copied())
        }

        async fn set_chat_mode(&self, chat_id: i64, mode: Mode) -> Result<(), StoreError> {
            self.check()?;
            self.inner.lock().unwrap().modes.insert(chat_id, mode);
            Ok(())
        }

        async fn timezone(&self, chat_id: i64) -> Result<Option<i32>, StoreError> {
            self.check()?;
            Ok(self.inner.lock().unwrap().timezones.get(&chat_id).copied())
        }

        async fn set_timezone(&self, chat_id: i64, offset_hours: i32) -> Result<(), StoreError> {
            self.check()?;
            self.inner
                .lock()
                .unwrap()
                .timezones
                .insert(chat_id, offset_hours);
            Ok(())
        }

        async fn scratch_date(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
            self.check()?;
            Ok(self.inner.lock().unwrap().scratch_dates.get(&chat_id).cloned())
        }

        async fn scratch_time(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
            self.check()?;
            Ok(self.inner.lock().unwrap().scratch_times.get(&chat_id).cloned())
        }

        async fn save_scratch_date(&self, chat_id: i64, date: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner
                .lock()
                .unwrap()
                .scratch_dates
                .insert(chat_id, date.to_string());
            Ok(())
        }

        async fn save_scratch_time(&self, chat_id: i64, time: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner
                .lock()
                .unwrap()
                .scratch_times
                .insert(chat_id, time.to_string());
            Ok(())
        }

        async fn insert_reminder(
            &self,
            chat_id: i64,
            fire_at: NaiveDateTime,
            text: &str,
        ) -> Result<(), StoreError> {
            self.check()?;
            let mut inner = self.inner.lock().unwrap();
            if inner
                .reminders
                .iter()
                .any(|r| r.chat_id == chat_id && r.fire_at == fire_at)
            {
                return Err(StoreError::Duplicate);
            }
            inner.reminders.push(Reminder {
                chat_id,
                fire_at,
                text: text.to_string(),
            });
            Ok(())
        }

        async fn chat_reminders(&self, chat_id: i64) -> Result<Vec<Reminder>, StoreError> {
            self.check()?;
            let mut reminders: Vec<Reminder> = self
                .inner
                .lock()
                .unwrap()
                .reminders
                .iter()
                .filter(|r| r.chat_id == chat_id)
                .cloned()
                .collect();
            reminders.sort_by_key(|r| r.fire_at);
            Ok(reminders)
        }

        async fn reminder_at(
            &self,
            chat_id: i64,
            fire_at: NaiveDateTime,
        ) -> Result<Option<Reminder>, StoreError> {
            self.check()?;
            Ok(self
                .inner
                .lock()
                .unwrap()
                .reminders
                .iter()
                .find(|r| r.chat_id == chat_id && r.fire_at == fire_at)
                .cloned())
        }

        async fn due_reminders(&self, now: NaiveDateTime) -> Result<Vec<Reminder>, StoreError> {
            self.check()?;
            let cutoff = now + Duration::seconds(1);
            Ok(self
                .inner
                .lock()
                .unwrap()
                .reminders
                .iter()
                .filter(|r| r.fire_at < cutoff)
                .cloned()
                .collect())
        }

        async fn delete_reminder(
            &self,
            chat_id: i64,
            fire_at: NaiveDateTime,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.inner
                .lock()
                .unwrap()
                .reminders
                .retain(|r| !(r.chat_id == chat_id && r.fire_at == fire_at));
            Ok(())
        }
    }
}
