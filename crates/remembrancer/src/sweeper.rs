//! Due-reminder delivery sweep, run once per polling cycle.

use chrono::{Duration, NaiveDateTime};
use tracing::{info, warn};

use crate::store::{Reminder, ReminderStore, StoreError};
use crate::telegram::{MessageSender, SendOptions};

/// Reminders further past due than this are dropped without delivery, so a
/// restart after downtime doesn't unleash a backlog storm.
const STALE_CUTOFF_SECS: i64 = 30;

/// Delivers every due reminder once. Successful and stale reminders are
/// deleted; failed sends stay queued for the next cycle.
pub async fn sweep<S, R>(sender: &S, store: &R, now: NaiveDateTime) -> Result<(), StoreError>
where
    S: MessageSender + Sync,
    R: ReminderStore + Sync,
{
    let due = store.due_reminders(now).await?;
    for reminder in due {
        if now - reminder.fire_at > Duration::seconds(STALE_CUTOFF_SECS) {
            info!(
                chat_id = reminder.chat_id,
                fire_at = %reminder.fire_at,
                "Dropping stale reminder"
            );
            store
                .delete_reminder(reminder.chat_id, reminder.fire_at)
                .await?;
            continue;
        }

        if deliver(sender, &reminder).await {
            store
                .delete_reminder(reminder.chat_id, reminder.fire_at)
                .await?;
        } else {
            warn!(
                chat_id = reminder.chat_id,
                fire_at = %reminder.fire_at,
                "Delivery failed; reminder stays queued"
            );
        }
    }
    Ok(())
}

async fn deliver<S: MessageSender + Sync>(sender: &S, reminder: &Reminder) -> bool {
    let mut text = String::from("<b>You have a reminder</b>");
    if !reminder.text.is_empty() {
        text.push_str(&format!(":\n<i>{}</i>", reminder.text));
    }
    sender
        .send(
            reminder.chat_id,
            &text,
            SendOptions {
                html: true,
                markup: None,
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::telegram::recording::RecordingSender;

    const CHAT: i64 = 42;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn stale_reminder_is_dropped_without_delivery() {
        let sender = RecordingSender::new();
        let store = MemoryStore::new();
        let now = dt("2023-06-15 12:00:40");
        store
            .insert_reminder(CHAT, dt("2023-06-15 12:00:00"), "too late")
            .await
            .unwrap();

        sweep(&sender, &store, now).await.unwrap();

        assert!(store.reminders().is_empty());
        assert!(sender.texts().is_empty());
    }

    #[tokio::test]
    async fn overdue_within_grace_window_is_delivered_and_deleted() {
        let sender = RecordingSender::new();
        let store = MemoryStore::new();
        let now = dt("2023-06-15 12:00:10");
        store
            .insert_reminder(CHAT, dt("2023-06-15 12:00:00"), "water the plants")
            .await
            .unwrap();

        sweep(&sender, &store, now).await.unwrap();

        assert!(store.reminders().is_empty());
        let texts = sender.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(
            texts[0],
            "<b>You have a reminder</b>:\n<i>water the plants</i>"
        );
    }

    #[tokio::test]
    async fn failed_delivery_keeps_reminder_queued() {
        let sender = RecordingSender::new();
        sender.reject_sends();
        let store = MemoryStore::new();
        let now = dt("2023-06-15 12:00:10");
        store
            .insert_reminder(CHAT, dt("2023-06-15 12:00:00"), "retry me")
            .await
            .unwrap();

        sweep(&sender, &store, now).await.unwrap();

        assert_eq!(store.reminders().len(), 1);
        assert_eq!(sender.texts().len(), 1);
    }

    #[tokio::test]
    async fn empty_text_sends_only_the_header() {
        let sender = RecordingSender::new();
        let store = MemoryStore::new();
        let now = dt("2023-06-15 12:00:00");
        store
            .insert_reminder(CHAT, dt("2023-06-15 12:00:00"), "")
            .await
            .unwrap();

        sweep(&sender, &store, now).await.unwrap();

        assert_eq!(sender.texts(), vec!["<b>You have a reminder</b>".to_string()]);
    }

    #[tokio::test]
    async fn future_reminder_is_untouched() {
        let sender = RecordingSender::new();
        let store = MemoryStore::new();
        let now = dt("2023-06-15 12:00:00");
        store
            .insert_reminder(CHAT, dt("2023-06-15 12:05:00"), "not yet")
            .await
            .unwrap();

        sweep(&sender, &store, now).await.unwrap();

        assert_eq!(store.reminders().len(), 1);
        assert!(sender.texts().is_empty());
    }

    #[tokio::test]
    async fn exactly_thirty_seconds_late_is_still_delivered() {
        let sender = RecordingSender::new();
        let store = MemoryStore::new();
        let now = dt("2023-06-15 12:00:30");
        store
            .insert_reminder(CHAT, dt("2023-06-15 12:00:00"), "boundary")
            .await
            .unwrap();

        sweep(&sender, &store, now).await.unwrap();

        assert!(store.reminders().is_empty());
        assert_eq!(sender.texts().len(), 1);
    }
}
