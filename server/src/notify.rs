//! Narrow contracts the admission queue consumes, plus the wording of every
//! status message a waiting player can receive
//!
//! Delivery itself belongs to the network layer. The queue only decides what
//! to say and when; a failed delivery is never reported back.

use crate::ledger::SubjectId;
use shared::BackendStatus;
use std::collections::HashSet;

/// Whether a waiting subject still exists
pub trait LivenessCheck {
    fn is_live(&self, subject: SubjectId) -> bool;
}

/// A snapshot of live subject ids taken just before a queue operation
impl LivenessCheck for HashSet<SubjectId> {
    fn is_live(&self, subject: SubjectId) -> bool {
        self.contains(&subject)
    }
}

/// Best-effort, fire-and-forget delivery of status text to a subject
pub trait NotificationSink {
    /// One-off chat style message
    fn notify(&self, subject: SubjectId, message: &str);

    /// Persistent progress indicator (action bar, boss bar, ...)
    fn show_progress(&self, subject: SubjectId, text: &str);

    fn clear_progress(&self, subject: SubjectId);
}

/// Coarse wait estimate derived from a queue position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBand {
    Next,
    ShortWait,
    FewMinutes,
    LongerWait,
}

impl WaitBand {
    pub fn for_position(position: usize) -> Self {
        match position {
            0 | 1 => WaitBand::Next,
            2..=3 => WaitBand::ShortWait,
            4..=10 => WaitBand::FewMinutes,
            _ => WaitBand::LongerWait,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WaitBand::Next => "next",
            WaitBand::ShortWait => "short wait",
            WaitBand::FewMinutes => "a few minutes",
            WaitBand::LongerWait => "longer wait",
        }
    }
}

pub fn progress_text(target: &str, position: usize, size: usize) -> String {
    format!(
        "Queue for {}: position {}/{} ({})",
        target,
        position,
        size,
        WaitBand::for_position(position).label()
    )
}

/// Message sent to a subject as it joins the queue
pub fn availability_message(target: &str, status: Option<&BackendStatus>) -> String {
    let availability = match status {
        None => format!("{} is not a known server, you will be removed from the queue", target),
        Some(status) if !status.online => {
            format!("{} is offline, you will be sent once it is back", target)
        }
        Some(status) if status.is_full() => format!(
            "{} is full ({}/{}), you will be sent when a slot frees up",
            target, status.current_count, status.max_count
        ),
        Some(status) => format!(
            "{} is online ({}/{})",
            target, status.current_count, status.max_count
        ),
    };

    format!(
        "Joined the queue for {}. {}. The queue is ordered by rank first, then by join time.",
        target, availability
    )
}

pub fn invalid_target_message(target: &str) -> String {
    format!("Destination {} is invalid, you have been removed from the queue", target)
}

pub fn transfer_failed_message(target: &str, reason: &str) -> String {
    format!(
        "Transfer to {} failed ({}), you keep your place in the queue",
        target, reason
    )
}

pub fn sending_message(target: &str) -> String {
    format!("Sending you to {}...", target)
}
