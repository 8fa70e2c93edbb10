/// Registration Lifecycle - Stateright Model
/// Formally verifies the REGISTER flow: challenge → auth → refresh → de-register
///
/// Run with: cargo test --release registration_model -- --nocapture

use stateright::*;

/// Lifecycle states matching the registration controller
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum RegState {
    Disconnected,
    Connecting,
    Challenging,
    Authenticated,
    Refreshing,
    BackingOff,
    Terminating,
    Terminated,
}

/// Events that can occur while registered
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum RegAction {
    Start,
    SocketOpened,
    SocketFailed,
    Receive401ThenOk,
    ReceiveUnexpected,
    RequestTimeout,
    BackoffElapsed,
    RefreshDue,
    Shutdown,
    DeregisterSettled,
}

/// Controller state including the observable side effects
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RegModel {
    pub state: RegState,
    pub sentinel_touched: bool,
    pub ever_authenticated: bool,
    pub deregister_attempts: u8,
    pub refresh_cycles: u8,
}

/// Configuration for the model checker
#[derive(Clone)]
pub struct RegistrationChecker {
    pub max_refresh_cycles: u8,
}

impl Default for RegistrationChecker {
    fn default() -> Self {
        Self {
            max_refresh_cycles: 3,
        }
    }
}

impl Model for RegistrationChecker {
    type State = RegModel;
    type Action = RegAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![RegModel {
            state: RegState::Disconnected,
            sentinel_touched: false,
            ever_authenticated: false,
            deregister_attempts: 0,
            refresh_cycles: 0,
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        match &state.state {
            RegState::Disconnected => {
                actions.push(RegAction::Start);
            }

            RegState::Connecting => {
                actions.push(RegAction::SocketOpened);
                actions.push(RegAction::SocketFailed);
            }

            RegState::Challenging | RegState::Refreshing => {
                actions.push(RegAction::Receive401ThenOk);
                actions.push(RegAction::ReceiveUnexpected);
                actions.push(RegAction::RequestTimeout);
                actions.push(RegAction::Shutdown);
            }

            RegState::Authenticated => {
                if state.refresh_cycles < self.max_refresh_cycles {
                    actions.push(RegAction::RefreshDue);
                }
                actions.push(RegAction::Shutdown);
            }

            RegState::BackingOff => {
                actions.push(RegAction::BackoffElapsed);
                actions.push(RegAction::Shutdown);
            }

            RegState::Terminating => {
                actions.push(RegAction::DeregisterSettled);
            }

            RegState::Terminated => {
                // Terminal state - no actions
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            RegAction::Start => {
                next.state = RegState::Connecting;
            }

            RegAction::SocketOpened => {
                next.state = RegState::Challenging;
            }

            RegAction::SocketFailed => {
                next.state = RegState::BackingOff;
            }

            RegAction::Receive401ThenOk => {
                next.state = RegState::Authenticated;
                next.sentinel_touched = true;
                next.ever_authenticated = true;
            }

            RegAction::ReceiveUnexpected | RegAction::RequestTimeout => {
                next.state = RegState::BackingOff;
            }

            RegAction::BackoffElapsed => {
                next.state = RegState::Challenging;
            }

            RegAction::RefreshDue => {
                next.state = RegState::Refreshing;
                next.refresh_cycles = state.refresh_cycles.saturating_add(1);
            }

            RegAction::Shutdown => {
                next.state = RegState::Terminating;
                next.deregister_attempts = state.deregister_attempts.saturating_add(1);
            }

            RegAction::DeregisterSettled => {
                next.state = RegState::Terminated;
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            // Safety: the sentinel only moves after an authenticated 200 OK
            Property::always("sentinel_requires_auth", |_, state: &RegModel| {
                !state.sentinel_touched || state.ever_authenticated
            }),
            // Safety: a refresh presupposes a prior successful registration
            Property::always("refresh_requires_auth", |_, state: &RegModel| {
                state.state != RegState::Refreshing || state.ever_authenticated
            }),
            // Safety: exactly one de-registration per shutdown
            Property::always("deregister_at_most_once", |_, state: &RegModel| {
                state.deregister_attempts <= 1
            }),
            // Safety: the terminal state is only reached through de-registration
            Property::always("terminated_after_deregister", |_, state: &RegModel| {
                state.state != RegState::Terminated || state.deregister_attempts == 1
            }),
            // Liveness: the lifecycle can always be driven to completion
            Property::eventually("terminates", |_, state: &RegModel| {
                state.state == RegState::Terminated
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn registration_model_check_safety() {
        let checker = RegistrationChecker::default().checker().spawn_bfs().join();

        println!("States explored: {}", checker.unique_state_count());

        checker.assert_properties();
    }

    #[test]
    fn registration_model_happy_path() {
        // Disconnected → Connecting → Challenging → Authenticated → Refreshing → ... → Terminated
        let model = RegistrationChecker::default();

        let mut state = model.init_states()[0].clone();
        assert_eq!(state.state, RegState::Disconnected);

        state = model.next_state(&state, RegAction::Start).unwrap();
        assert_eq!(state.state, RegState::Connecting);

        state = model.next_state(&state, RegAction::SocketOpened).unwrap();
        assert_eq!(state.state, RegState::Challenging);

        state = model.next_state(&state, RegAction::Receive401ThenOk).unwrap();
        assert_eq!(state.state, RegState::Authenticated);
        assert!(state.sentinel_touched);

        state = model.next_state(&state, RegAction::RefreshDue).unwrap();
        assert_eq!(state.state, RegState::Refreshing);

        state = model.next_state(&state, RegAction::Receive401ThenOk).unwrap();
        assert_eq!(state.state, RegState::Authenticated);

        state = model.next_state(&state, RegAction::Shutdown).unwrap();
        assert_eq!(state.state, RegState::Terminating);
        assert_eq!(state.deregister_attempts, 1);

        state = model.next_state(&state, RegAction::DeregisterSettled).unwrap();
        assert_eq!(state.state, RegState::Terminated);
    }

    #[test]
    fn registration_model_backoff_path() {
        let model = RegistrationChecker::default();

        let mut state = model.init_states()[0].clone();
        state = model.next_state(&state, RegAction::Start).unwrap();
        state = model.next_state(&state, RegAction::SocketOpened).unwrap();

        // 403 with Retry-After, or a request timeout
        state = model.next_state(&state, RegAction::ReceiveUnexpected).unwrap();
        assert_eq!(state.state, RegState::BackingOff);
        assert!(!state.sentinel_touched);

        state = model.next_state(&state, RegAction::BackoffElapsed).unwrap();
        assert_eq!(state.state, RegState::Challenging);
    }
}
