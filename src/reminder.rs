//! Reminder dispatcher: once per minute, match active reminders against the
//! wall clock and email the owners of the ones that are due.
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::StorageError;
use crate::model::{to_row, ActiveReminder, Collection, ReminderConfig, ReminderLog, ReminderLogStatus};
use crate::notifier::Notifier;
use crate::store::RecordStore;

/// The single instant every reminder in one tick is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSlot {
    pub date: NaiveDate,
    /// "HH:MM"
    pub time: String,
    /// 0 = Monday .. 6 = Sunday
    pub weekday: u8,
}

impl TickSlot {
    pub fn capture(now: NaiveDateTime) -> Self {
        Self {
            date: now.date(),
            time: now.format("%H:%M").to_string(),
            weekday: now.weekday().num_days_from_monday() as u8,
        }
    }
}

pub fn is_due(reminder: &ReminderConfig, slot: &TickSlot) -> bool {
    reminder.active && reminder.scheduled_hhmm() == slot.time && reminder.repeats_on(slot.weekday)
}

/// Fallback text when a reminder has no description.
pub fn default_description(kind: &str) -> &'static str {
    match kind {
        "feeding" => "Time to feed!",
        "medicine" => "Time for medicine!",
        "cleaning" => "Time to clean up!",
        "vaccine" => "Time for a vaccination!",
        _ => "Reminder time!",
    }
}

/// Subject and body of the email sent for a due reminder.
pub fn compose(row: &ActiveReminder) -> (String, String) {
    let r = &row.reminder;
    let description = r
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default_description(&r.kind));
    let subject = format!("Pet reminder - {}", r.title);
    let body = format!(
        "Your pet {pet} needs attention:\n\n\
         Type: {kind}\n\
         Title: {title}\n\
         Time: {time}\n\
         Description: {description}\n\n\
         Please take care of it soon!\n",
        pet = row.contact.pet_name,
        kind = r.kind,
        title = r.title,
        time = r.scheduled_hhmm(),
    );
    (subject, body)
}

/// Outcome counters for one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub undeliverable: usize,
    /// Rows the store returned but that could not be decoded.
    pub invalid: usize,
}

/// Reminder slots already fired today.
#[derive(Debug, Default)]
struct FiredSlots {
    date: Option<NaiveDate>,
    fired: HashSet<(String, String)>,
}

impl FiredSlots {
    /// Returns true the first time `(reminder_id, slot)` is seen.
    fn mark(&mut self, reminder_id: &str, slot: &TickSlot) -> bool {
        if self.date != Some(slot.date) {
            self.fired.clear();
            self.date = Some(slot.date);
        }
        self.fired.insert((reminder_id.to_string(), slot.time.clone()))
    }
}

/// Admits at most one tick per calendar minute.
#[derive(Debug, Default)]
pub struct MinuteGate {
    last: Option<TickSlot>,
}

impl MinuteGate {
    /// True if `slot` has not been admitted yet. Admitting a slot closes it even
    /// if the tick that follows fails.
    pub fn admit(&mut self, slot: &TickSlot) -> bool {
        if self.last.as_ref() == Some(slot) {
            return false;
        }
        self.last = Some(slot.clone());
        true
    }
}

pub struct ReminderDispatcher {
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    fired: Option<FiredSlots>,
}

impl ReminderDispatcher {
    pub fn new(store: Arc<dyn RecordStore>, notifier: Arc<dyn Notifier>, dedup: bool) -> Self {
        Self {
            store,
            notifier,
            fired: dedup.then(FiredSlots::default),
        }
    }

    /// Evaluate every active reminder against `now`. A store failure abandons
    /// the whole tick; a send failure only loses that one notification.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Result<TickReport, StorageError> {
        self.evaluate(&TickSlot::capture(now)).await
    }

    #[instrument(skip_all, fields(time = %slot.time, weekday = slot.weekday))]
    async fn evaluate(&mut self, slot: &TickSlot) -> Result<TickReport, StorageError> {
        let rows = self.store.active_reminders().await?;
        let mut report = TickReport {
            evaluated: rows.len(),
            ..Default::default()
        };

        for row in &rows {
            let row = match row {
                Ok(row) => row,
                Err(bad) => {
                    warn!(reminder_id = %bad.reminder_id, reason = %bad.reason, "skipping unusable reminder row");
                    report.invalid += 1;
                    continue;
                }
            };
            if !is_due(&row.reminder, slot) {
                continue;
            }
            report.due += 1;
            let reminder_id = row.reminder.id.as_str();

            if let Some(fired) = &mut self.fired {
                if !fired.mark(reminder_id, slot) {
                    debug!(reminder_id, "already fired in this slot");
                    report.duplicates += 1;
                    continue;
                }
            }

            let Some(to) = row
                .contact
                .owner_email
                .as_deref()
                .filter(|e| !e.trim().is_empty())
            else {
                warn!(reminder_id, pet = %row.contact.pet_name, "pet has no owner email; skipping");
                report.undeliverable += 1;
                continue;
            };

            let (subject, body) = compose(row);
            let status = match self.notifier.send(to, &subject, &body).await {
                Ok(()) => {
                    info!(reminder_id, to, "reminder sent");
                    report.sent += 1;
                    ReminderLogStatus::Pending
                }
                Err(e) => {
                    error!(reminder_id, to, error = %e, "failed to send reminder");
                    report.failed += 1;
                    ReminderLogStatus::Missed
                }
            };
            self.record_log(reminder_id, status).await;
        }

        Ok(report)
    }

    async fn record_log(&self, reminder_id: &str, status: ReminderLogStatus) {
        let log = ReminderLog {
            reminder_id: reminder_id.to_string(),
            status,
            executed_at: Utc::now(),
        };
        let result = match to_row(&log) {
            Ok(row) => self.store.insert(Collection::ReminderLogs, row).await,
            Err(e) => Err(StorageError::Encode(e)),
        };
        if let Err(e) = result {
            warn!(reminder_id, status = status.as_str(), error = %e, "failed to record reminder log");
        }
    }

    /// Poll the local wall clock every `poll_interval` and run at most one tick
    /// per calendar minute. Never returns.
    pub async fn run_forever(mut self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gate = MinuteGate::default();
        info!(poll_secs = poll_interval.as_secs(), "reminder dispatcher started");

        loop {
            ticker.tick().await;
            let slot = TickSlot::capture(Local::now().naive_local());
            if !gate.admit(&slot) {
                continue;
            }
            match self.evaluate(&slot).await {
                Ok(report) if report.due > 0 || report.invalid > 0 => {
                    info!(?report, "reminder tick complete")
                }
                Ok(report) => debug!(?report, "reminder tick complete"),
                Err(e) => error!(error = %e, "reminder tick abandoned"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PetContact;

    fn at(date: (i32, u32, u32), hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(hour, minute, 17)
            .unwrap()
    }

    // 2026-10-20 is a Tuesday.
    const TUESDAY: (i32, u32, u32) = (2026, 10, 20);
    const WEDNESDAY: (i32, u32, u32) = (2026, 10, 21);

    fn reminder(time: &str, days: Option<Vec<u8>>) -> ReminderConfig {
        ReminderConfig {
            id: "r-1".into(),
            pet_id: "p-1".into(),
            title: "Breakfast".into(),
            kind: "feeding".into(),
            description: None,
            scheduled_time: time.into(),
            repeat_days: days,
            active: true,
        }
    }

    #[test]
    fn capture_uses_monday_first_weekdays() {
        let slot = TickSlot::capture(at(TUESDAY, 9, 0));
        assert_eq!(slot.weekday, 1);
        assert_eq!(slot.time, "09:00");
        assert_eq!(TickSlot::capture(at((2026, 10, 25), 0, 0)).weekday, 6);
    }

    #[test]
    fn repeat_days_restrict_firing() {
        let r = reminder("09:00", Some(vec![1, 3]));
        assert!(is_due(&r, &TickSlot::capture(at(TUESDAY, 9, 0))));
        assert!(!is_due(&r, &TickSlot::capture(at(WEDNESDAY, 9, 0))));
        assert!(!is_due(&r, &TickSlot::capture(at(TUESDAY, 9, 1))));
    }

    #[test]
    fn empty_or_absent_repeat_days_mean_every_day() {
        for days in [None, Some(vec![])] {
            let r = reminder("18:30", days);
            for day in 19..=25 {
                assert!(is_due(&r, &TickSlot::capture(at((2026, 10, day), 18, 30))));
                assert!(!is_due(&r, &TickSlot::capture(at((2026, 10, day), 18, 31))));
            }
        }
    }

    #[test]
    fn seconds_in_scheduled_time_are_ignored() {
        let r = reminder("07:45:00", None);
        assert!(is_due(&r, &TickSlot::capture(at(TUESDAY, 7, 45))));
    }

    #[test]
    fn inactive_reminders_never_fire() {
        let mut r = reminder("09:00", None);
        r.active = false;
        assert!(!is_due(&r, &TickSlot::capture(at(TUESDAY, 9, 0))));
    }

    #[test]
    fn compose_includes_details_and_placeholder() {
        let row = ActiveReminder {
            reminder: reminder("09:00:00", None),
            contact: PetContact {
                pet_name: "Mochi".into(),
                owner_email: Some("owner@example.com".into()),
            },
        };
        let (subject, body) = compose(&row);
        assert_eq!(subject, "Pet reminder - Breakfast");
        assert!(body.contains("Mochi"));
        assert!(body.contains("Type: feeding"));
        assert!(body.contains("Title: Breakfast"));
        assert!(body.contains("Time: 09:00\n"));
        assert!(body.contains("Description: Time to feed!"));

        let mut row = row;
        row.reminder.description = Some("Half a cup of kibble".into());
        let (_, body) = compose(&row);
        assert!(body.contains("Description: Half a cup of kibble"));
    }

    #[test]
    fn minute_gate_admits_each_minute_once() {
        let mut gate = MinuteGate::default();
        let first = TickSlot::capture(at(TUESDAY, 9, 0));
        assert!(gate.admit(&first));
        // A second poll later in the same minute.
        let again = TickSlot::capture(
            NaiveDate::from_ymd_opt(2026, 10, 20)
                .unwrap()
                .and_hms_opt(9, 0, 48)
                .unwrap(),
        );
        assert!(!gate.admit(&again));
        assert!(gate.admit(&TickSlot::capture(at(TUESDAY, 9, 1))));
        // Same wall-clock minute on another day is a new slot.
        assert!(gate.admit(&TickSlot::capture(at(WEDNESDAY, 9, 1))));
    }

    #[test]
    fn fired_slots_reset_on_new_day() {
        let mut fired = FiredSlots::default();
        let tue = TickSlot::capture(at(TUESDAY, 9, 0));
        assert!(fired.mark("r-1", &tue));
        assert!(!fired.mark("r-1", &tue));
        assert!(fired.mark("r-2", &tue));
        let wed = TickSlot::capture(at(WEDNESDAY, 9, 0));
        assert!(fired.mark("r-1", &wed));
        assert_eq!(fired.fired.len(), 1);
    }
}
