/// Lockstep clock state for one peer. The authority drives `frame`
/// directly and uses the pause bookkeeping; a client additionally mirrors
/// the authority's announcements and holds the pending sync-check pair.
///
/// `frame` is the last fully executed frame. `ceiling` is the highest
/// frame this peer is allowed to execute without a fresh announcement.
#[derive(Debug, Default)]
pub struct FrameClock {
    frame: u32,
    announced: u32,
    ceiling: u32,
    token: u8,
    sync_frame: u32,
    sync_seeds: Option<[u32; 2]>,
    paused: bool,
    min_unpause: u32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn announced(&self) -> u32 {
        self.announced
    }

    pub fn token(&self) -> u8 {
        self.token
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Frames the authority has executed that we have not.
    pub fn behind(&self) -> u32 {
        self.announced.saturating_sub(self.frame)
    }

    /// Apply a frame announcement. Both values only ever move forward; a
    /// lagging duplicate or reordered announcement never rolls us back.
    pub fn observe_frame(&mut self, frame: u32, ceiling: u32, token: Option<u8>) {
        self.announced = self.announced.max(frame);
        self.ceiling = self.ceiling.max(ceiling);
        if let Some(token) = token {
            self.token = token;
        }
    }

    /// Record a sync-check pair for a frame we have not executed yet.
    /// Returns false if the pair arrived too late to be checked.
    pub fn observe_sync(&mut self, frame: u32, seeds: [u32; 2]) -> bool {
        if frame < self.frame {
            return false;
        }
        self.sync_frame = frame;
        self.sync_seeds = Some(seeds);
        true
    }

    /// The pending sync pair, if the clock has reached its frame. The
    /// caller compares these against the locally computed seeds while the
    /// simulation still sits at that exact frame.
    pub fn due_check(&mut self) -> Option<[u32; 2]> {
        if self.sync_seeds.is_some() && self.frame == self.sync_frame {
            self.sync_seeds.take()
        } else {
            None
        }
    }

    pub fn can_step(&self) -> bool {
        !self.paused && self.frame < self.ceiling
    }

    pub fn advance(&mut self) -> u32 {
        self.frame += 1;
        self.frame
    }

    /// Client side: a freshly applied snapshot puts the simulation at
    /// `frame`. Announcements observed during the transfer are kept, so
    /// the catch-up window is already open. A sync pair recorded for a
    /// frame before the capture point can no longer be checked.
    pub fn resume_at(&mut self, frame: u32) {
        self.frame = frame;
        self.announced = self.announced.max(frame);
        if self.sync_frame < frame {
            self.sync_seeds = None;
        }
    }

    /// Authority side: freeze the counter. Refused while commands stamped
    /// during an earlier pause are still waiting to execute, so a session
    /// can never pause itself past them.
    pub fn pause(&mut self) -> bool {
        if self.frame < self.min_unpause {
            return false;
        }
        self.paused = true;
        true
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }

    /// Authority side: a command was stamped for `frame` while paused.
    pub fn defer_pause_until(&mut self, frame: u32) {
        self.min_unpause = self.min_unpause.max(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcements_are_monotonic() {
        let mut clock = FrameClock::new();
        clock.observe_frame(10, 14, Some(7));
        clock.observe_frame(8, 12, None);

        assert_eq!(clock.announced(), 10);
        assert_eq!(clock.ceiling(), 14);
        assert_eq!(clock.token(), 7);
    }

    #[test]
    fn stepping_stops_at_the_ceiling() {
        let mut clock = FrameClock::new();
        clock.observe_frame(0, 2, None);

        assert!(clock.can_step());
        clock.advance();
        assert!(clock.can_step());
        clock.advance();
        assert!(!clock.can_step());

        clock.observe_frame(2, 4, None);
        assert!(clock.can_step());
    }

    #[test]
    fn sync_check_fires_at_its_exact_frame() {
        let mut clock = FrameClock::new();
        clock.observe_frame(0, 10, None);
        assert!(clock.observe_sync(3, [11, 22]));

        clock.advance();
        assert_eq!(clock.due_check(), None);
        clock.advance();
        clock.advance();
        assert_eq!(clock.due_check(), Some([11, 22]));
        assert_eq!(clock.due_check(), None);
    }

    #[test]
    fn sync_check_for_the_current_frame_is_due_now() {
        let mut clock = FrameClock::new();
        clock.observe_frame(0, 10, None);
        clock.advance();
        clock.advance();

        assert!(clock.observe_sync(2, [5, 6]));
        assert_eq!(clock.due_check(), Some([5, 6]));
    }

    #[test]
    fn stale_sync_check_is_rejected() {
        let mut clock = FrameClock::new();
        clock.observe_frame(0, 10, None);
        clock.advance();
        clock.advance();
        clock.advance();

        assert!(!clock.observe_sync(2, [5, 6]));
        assert_eq!(clock.due_check(), None);
    }

    #[test]
    fn resume_keeps_the_catch_up_window_open() {
        let mut clock = FrameClock::new();
        clock.observe_frame(120, 124, None);
        assert!(clock.observe_sync(40, [1, 2]));

        clock.resume_at(100);
        assert_eq!(clock.frame(), 100);
        assert_eq!(clock.behind(), 20);
        assert!(clock.can_step());
        // The pair for frame 40 predates the capture point.
        while clock.can_step() {
            clock.advance();
            assert_eq!(clock.due_check(), None);
        }
    }

    #[test]
    fn pause_waits_for_stamped_commands() {
        let mut clock = FrameClock::new();
        assert!(clock.pause());
        clock.defer_pause_until(5);
        clock.unpause();

        assert!(!clock.pause());
        while clock.frame() < 5 {
            clock.advance();
        }
        assert!(clock.pause());
    }

    #[test]
    fn paused_clock_does_not_step() {
        let mut clock = FrameClock::new();
        clock.observe_frame(0, 5, None);
        assert!(clock.pause());
        assert!(!clock.can_step());
        clock.unpause();
        assert!(clock.can_step());
    }
}
