//! Recovery after unsolicited disconnects.

use std::time::Duration;

use crate::config::ReconnectConfig;
use crate::link::TransportLink;
use crate::wizard::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link considered live, notifications expected.
    Attached,
    /// Link lost and not yet known to be good again.
    Detached,
}

/// What [`ReconnectPolicy::on_disconnect`] did about a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The flow is complete; the peripheral is rebooting.
    Ignored,
    /// Link is back. `rescan` asks the caller to refresh the network list.
    Recovered { rescan: bool },
    /// Automatic recovery gave up; the user has to re-run discovery.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    state: LinkState,
    max_attempts: u32,
    backoff: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            state: LinkState::Detached,
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Record a successful connect.
    pub fn mark_attached(&mut self) {
        self.state = LinkState::Attached;
    }

    /// Record an explicit disconnect.
    pub fn mark_detached(&mut self) {
        self.state = LinkState::Detached;
    }

    /// Handle a disconnect signal received while the wizard is at `step`.
    ///
    /// Makes up to `max_attempts` reconnects, waiting `backoff` before the
    /// second and doubling it for each further attempt. A link that is
    /// already back (the writer's own retry got there first) counts as
    /// recovered without another attempt.
    pub async fn on_disconnect<L>(&mut self, link: &mut L, step: Step) -> Recovery
    where
        L: TransportLink + ?Sized,
    {
        if step == Step::Complete {
            log::debug!("disconnect after completion, ignoring");
            return Recovery::Ignored;
        }
        self.state = LinkState::Detached;
        let rescan = step == Step::Wifi;

        if link.is_connected().await {
            log::info!("link already re-established");
            self.state = LinkState::Attached;
            return Recovery::Recovered { rescan };
        }

        let mut delay = self.backoff;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            log::info!("reconnect attempt {attempt}/{}", self.max_attempts);
            match link.reconnect().await {
                Ok(()) => {
                    self.state = LinkState::Attached;
                    return Recovery::Recovered { rescan };
                }
                Err(e) => log::warn!("reconnect attempt {attempt} failed: {e}"),
            }
        }
        Recovery::Failed
    }
}
