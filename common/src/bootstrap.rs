use log::{info, warn};

use crate::{
    config::BootstrapTiming,
    indicator::{Delay, Heartbeat, Indicator},
    types::ConnectionState,
};

/// Network join and provisioning primitives of the radio stack.
pub trait NetworkLink {
    fn set_hostname(&mut self, name: &str);
    fn has_credentials(&mut self) -> bool;
    fn begin_provisioning(&mut self);
    fn provisioning_complete(&mut self) -> bool;
    fn stop_provisioning(&mut self);
    /// Start connecting with the stored credentials. Returns `false` when the
    /// request could not be issued; it is retried after the next join poll.
    fn begin_join(&mut self) -> bool;
    fn is_joined(&mut self) -> bool;
    /// Keep rejoining after future drops for the rest of the process lifetime.
    fn enable_auto_reconnect(&mut self);
}

impl<T: NetworkLink + ?Sized> NetworkLink for &mut T {
    fn set_hostname(&mut self, name: &str) {
        (**self).set_hostname(name)
    }

    fn has_credentials(&mut self) -> bool {
        (**self).has_credentials()
    }

    fn begin_provisioning(&mut self) {
        (**self).begin_provisioning()
    }

    fn provisioning_complete(&mut self) -> bool {
        (**self).provisioning_complete()
    }

    fn stop_provisioning(&mut self) {
        (**self).stop_provisioning()
    }

    fn begin_join(&mut self) -> bool {
        (**self).begin_join()
    }

    fn is_joined(&mut self) -> bool {
        (**self).is_joined()
    }

    fn enable_auto_reconnect(&mut self) {
        (**self).enable_auto_reconnect()
    }
}

/// Drives the node from "no network" to `Joined`. Each `step` performs one
/// poll of the current state, so tests can walk the machine one state at a
/// time. There is no failure exit: provisioning and joining are retried for
/// as long as it takes.
#[derive(Debug, Clone)]
pub struct ConnectivityBootstrapper {
    timing: BootstrapTiming,
    state: ConnectionState,
    heartbeat: Heartbeat,
    history: Vec<ConnectionState>,
    polls: u64,
    join_issued: bool,
}

impl ConnectivityBootstrapper {
    pub fn new(timing: BootstrapTiming) -> Self {
        Self {
            timing,
            state: ConnectionState::Unprovisioned,
            heartbeat: Heartbeat::default(),
            history: vec![ConnectionState::Unprovisioned],
            polls: 0,
            join_issued: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Every state entered so far, starting with `Unprovisioned`.
    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    /// Unsuccessful provisioning/join polls so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn step<L, I, D>(
        &mut self,
        link: &mut L,
        indicator: &mut I,
        delay: &mut D,
    ) -> ConnectionState
    where
        L: NetworkLink + ?Sized,
        I: Indicator,
        D: Delay,
    {
        match self.state {
            ConnectionState::Unprovisioned => {
                if link.has_credentials() {
                    self.enter_joining(link);
                } else {
                    warn!("no stored network credentials; waiting for provisioning");
                    link.begin_provisioning();
                    self.transition(ConnectionState::Provisioning);
                }
            }
            ConnectionState::Provisioning => {
                if link.provisioning_complete() {
                    info!("provisioning complete");
                    self.enter_joining(link);
                } else {
                    self.wait(self.timing.provisioning_poll_ms, indicator, delay);
                }
            }
            ConnectionState::Joining => {
                if self.join_issued && link.is_joined() {
                    link.stop_provisioning();
                    indicator.set(true);
                    self.transition(ConnectionState::Joined);
                } else {
                    self.wait(self.timing.join_poll_ms, indicator, delay);
                    if !self.join_issued {
                        warn!("join request was not accepted; retrying");
                        self.join_issued = link.begin_join();
                    }
                }
            }
            ConnectionState::Joined => {}
        }

        self.state
    }

    /// Block until joined.
    pub fn run<L, I, D>(
        &mut self,
        device_name: &str,
        link: &mut L,
        indicator: &mut I,
        delay: &mut D,
    ) -> ConnectionState
    where
        L: NetworkLink + ?Sized,
        I: Indicator,
        D: Delay,
    {
        link.set_hostname(device_name);
        while self.step(link, indicator, delay) != ConnectionState::Joined {}
        info!("`{device_name}` joined the network after {} poll(s)", self.polls);
        self.state
    }

    fn enter_joining<L: NetworkLink + ?Sized>(&mut self, link: &mut L) {
        link.enable_auto_reconnect();
        self.join_issued = link.begin_join();
        self.transition(ConnectionState::Joining);
    }

    fn wait<I: Indicator, D: Delay>(&mut self, period_ms: u64, indicator: &mut I, delay: &mut D) {
        delay.delay_ms(period_ms);
        self.heartbeat.toggle(indicator);
        self.polls = self.polls.saturating_add(1);
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(next > self.state, "connection state must only advance");
        info!("connectivity: {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
        self.history.push(next);
    }
}

/// Run a fresh bootstrapper to completion.
pub fn bootstrap<L, I, D>(
    device_name: &str,
    timing: BootstrapTiming,
    link: &mut L,
    indicator: &mut I,
    delay: &mut D,
) -> ConnectionState
where
    L: NetworkLink + ?Sized,
    I: Indicator,
    D: Delay,
{
    ConnectivityBootstrapper::new(timing).run(device_name, link, indicator, delay)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{LinkCall, RecordingIndicator, ScriptedLink, VirtualDelay};

    #[test]
    fn unprovisioned_device_walks_every_state() {
        let mut link = ScriptedLink::new(false, 2, 3);
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();
        let mut bootstrapper = ConnectivityBootstrapper::new(BootstrapTiming::default());

        let state = bootstrapper.run("esp-airq-thing-1", &mut link, &mut indicator, &mut delay);

        assert_eq!(state, ConnectionState::Joined);
        assert_eq!(
            bootstrapper.history(),
            &[
                ConnectionState::Unprovisioned,
                ConnectionState::Provisioning,
                ConnectionState::Joining,
                ConnectionState::Joined,
            ]
        );
        assert_eq!(delay.calls, vec![1_000, 1_000, 500, 500, 500]);
        // The heartbeat phase carries over from provisioning into joining.
        assert_eq!(indicator.levels, vec![true, false, true, false, true, true]);
        assert_eq!(
            link.calls,
            vec![
                LinkCall::SetHostname("esp-airq-thing-1".to_string()),
                LinkCall::BeginProvisioning,
                LinkCall::EnableAutoReconnect,
                LinkCall::BeginJoin,
                LinkCall::StopProvisioning,
            ]
        );
    }

    #[test]
    fn stored_credentials_skip_provisioning() {
        let mut link = ScriptedLink::new(true, 0, 1);
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();
        let mut bootstrapper = ConnectivityBootstrapper::new(BootstrapTiming::default());

        bootstrapper.run("node", &mut link, &mut indicator, &mut delay);

        assert_eq!(
            bootstrapper.history(),
            &[
                ConnectionState::Unprovisioned,
                ConnectionState::Joining,
                ConnectionState::Joined,
            ]
        );
        assert!(!link.calls.contains(&LinkCall::BeginProvisioning));
        assert_eq!(indicator.levels.last(), Some(&true));
    }

    #[test]
    fn each_step_polls_once() {
        let mut link = ScriptedLink::new(false, 1, 1);
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();
        let mut bootstrapper = ConnectivityBootstrapper::new(BootstrapTiming::default());

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(bootstrapper.step(&mut link, &mut indicator, &mut delay));
        }

        assert_eq!(
            seen,
            vec![
                ConnectionState::Provisioning,
                ConnectionState::Provisioning,
                ConnectionState::Joining,
                ConnectionState::Joining,
                ConnectionState::Joined,
                ConnectionState::Joined,
            ]
        );
        assert_eq!(bootstrapper.polls(), 2);
    }

    #[test]
    fn rejected_join_request_is_reissued() {
        let mut link = ScriptedLink::new(true, 0, 1).rejecting_joins(2);
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();
        let mut bootstrapper = ConnectivityBootstrapper::new(BootstrapTiming::default());

        let state = bootstrapper.run("node", &mut link, &mut indicator, &mut delay);

        assert_eq!(state, ConnectionState::Joined);
        assert_eq!(
            link.calls,
            vec![
                LinkCall::SetHostname("node".to_string()),
                LinkCall::EnableAutoReconnect,
                LinkCall::BeginJoin,
                LinkCall::BeginJoin,
                LinkCall::BeginJoin,
                LinkCall::StopProvisioning,
            ]
        );
        // Two retries, then one unsuccessful poll of the accepted join.
        assert_eq!(delay.calls, vec![500, 500, 500]);
        assert_eq!(bootstrapper.polls(), 3);
    }

    #[test]
    fn state_never_regresses_under_long_join() {
        let mut link = ScriptedLink::new(false, 0, 250);
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();

        let state = bootstrap(
            "node",
            BootstrapTiming::default(),
            &mut link,
            &mut indicator,
            &mut delay,
        );

        assert_eq!(state, ConnectionState::Joined);
        assert_eq!(delay.calls.len(), 250);
        assert!(delay.calls.iter().all(|&ms| ms == 500));
    }
}
