use std::mem;

/// Quiesce bookkeeping of one node.
///
/// An idle shard stops ticking its peer after `threshold` quiet ticks,
/// which silences heartbeats and election traffic across the whole group.
/// Any activity wakes it back up.
#[derive(Debug)]
pub(crate) struct QuiesceState {
    enabled: bool,
    threshold: u64,
    current_tick: u64,
    idle_since: u64,
    quiesced: bool,
    new_quiesce: bool,
}

impl QuiesceState {
    pub(crate) fn new(enabled: bool, threshold: u64) -> Self {
        QuiesceState {
            enabled,
            threshold,
            current_tick: 0,
            idle_since: 0,
            quiesced: false,
            new_quiesce: false,
        }
    }

    pub(crate) fn quiesced(&self) -> bool {
        self.quiesced
    }

    pub(crate) fn tick(&mut self) {
        self.current_tick += 1;
        if !self.enabled || self.quiesced {
            return;
        }
        if self.current_tick - self.idle_since > self.threshold {
            tracing::info!(idle_ticks = self.current_tick - self.idle_since, "entering quiesce");
            self.quiesced = true;
            self.new_quiesce = true;
        }
    }

    /// Edge flag: true exactly once per quiesce entry, for the
    /// enter-quiesce broadcast that aligns the peers.
    pub(crate) fn new_quiesce_state(&mut self) -> bool {
        mem::take(&mut self.new_quiesce)
    }

    /// Proposals, reads, config changes and inbound non-local traffic all
    /// count as activity.
    pub(crate) fn record_activity(&mut self) {
        if !self.enabled {
            return;
        }
        self.idle_since = self.current_tick;
        if self.quiesced {
            tracing::info!("exiting quiesce");
            self.quiesced = false;
            self.new_quiesce = false;
        }
    }

    /// A peer announced it is quiescing; follow without re-broadcasting.
    pub(crate) fn join_quiesce(&mut self) {
        if !self.enabled || self.quiesced {
            return;
        }
        tracing::debug!("joining quiesce on peer announcement");
        self.quiesced = true;
        self.new_quiesce = false;
    }
}

#[cfg(test)]
mod quiesce_test {
    use super::*;

    #[test]
    fn test_enter_after_threshold_idle_ticks() -> anyhow::Result<()> {
        let mut qs = QuiesceState::new(true, 10);

        for _ in 0..10 {
            qs.tick();
            assert!(!qs.quiesced());
        }
        qs.tick();
        assert!(qs.quiesced());
        assert!(qs.new_quiesce_state());
        // the edge reports once
        assert!(!qs.new_quiesce_state());

        Ok(())
    }

    #[test]
    fn test_activity_defers_and_exits() -> anyhow::Result<()> {
        let mut qs = QuiesceState::new(true, 10);

        for _ in 0..8 {
            qs.tick();
        }
        qs.record_activity();
        for _ in 0..10 {
            qs.tick();
            assert!(!qs.quiesced());
        }
        qs.tick();
        assert!(qs.quiesced());

        qs.record_activity();
        assert!(!qs.quiesced());
        assert!(!qs.new_quiesce_state());

        Ok(())
    }

    #[test]
    fn test_disabled_never_quiesces() -> anyhow::Result<()> {
        let mut qs = QuiesceState::new(false, 2);
        for _ in 0..100 {
            qs.tick();
        }
        assert!(!qs.quiesced());
        Ok(())
    }

    #[test]
    fn test_join_on_peer_announcement() -> anyhow::Result<()> {
        let mut qs = QuiesceState::new(true, 10);
        qs.join_quiesce();
        assert!(qs.quiesced());
        // joining must not trigger another broadcast
        assert!(!qs.new_quiesce_state());
        Ok(())
    }
}
