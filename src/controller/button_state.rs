use tracing::debug;

use super::packet::KeyReport;

/// Key identifier of the Backbone button
pub const PRIMARY_KEY_ID: u8 = 22;
/// Key identifier of the screenshot button
pub const SECONDARY_KEY_ID: u8 = 23;

/// Folds the two physical buttons into one special button
///
/// Only transitions of the combined state are reported, so holding both
/// buttons never produces a second press and releasing one of them while the
/// other is still held produces nothing.
#[derive(Debug, Clone, Default)]
pub struct ButtonTracker {
    primary: bool,
    secondary: bool,
}

impl ButtonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn combined(&self) -> bool {
        self.primary || self.secondary
    }

    /// Apply a key transition, returning the new combined state if it changed
    pub fn apply(&mut self, report: KeyReport) -> Option<bool> {
        let previous = self.combined();

        match report.key_id {
            PRIMARY_KEY_ID => self.primary = report.is_down,
            SECONDARY_KEY_ID => self.secondary = report.is_down,
            other => {
                debug!("Ignoring key {} (down: {})", other, report.is_down);
            }
        }

        let current = self.combined();
        (current != previous).then_some(current)
    }
}
