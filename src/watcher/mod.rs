//! Worker-side watch loop.
//!
//! A [`WatchLoop`] holds one client's booked date and drives a
//! [`SchedulingApi`] through an explicit state machine until the target date
//! is reached. Failures never escape the loop; an [`ErrorClassifier`] picks
//! between the long cooldown and an immediate re-initialization.

pub mod classify;
pub mod scheduling;

use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

pub use classify::{ErrorClassifier, FailureKind, NetworkClassifier};
pub use scheduling::{HttpSchedulingApi, HttpSession, SchedulingApi};

use crate::config::{DEFAULT_COOLDOWN, DEFAULT_REFRESH_DELAY_SECS};
use crate::error::WatchError;

/// Parameters for one client's watch loop.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Date currently held.
    pub current_date: NaiveDate,
    /// Stop once the held date is on or before this.
    pub target_date: Option<NaiveDate>,
    /// Never book earlier than this.
    pub min_date: Option<NaiveDate>,
    /// Pause between availability checks.
    pub refresh_delay: Duration,
    /// Pause after a transient connectivity failure.
    pub cooldown: Duration,
    /// Log candidates instead of booking them.
    pub dry_run: bool,
}

impl WatchConfig {
    pub fn new(current_date: NaiveDate) -> Self {
        Self {
            current_date,
            target_date: None,
            min_date: None,
            refresh_delay: Duration::from_secs(DEFAULT_REFRESH_DELAY_SECS),
            cooldown: DEFAULT_COOLDOWN,
            dry_run: false,
        }
    }
}

/// State of the watch loop. `S` is the scheduling session type.
#[derive(Debug)]
pub enum WatchState<S> {
    /// Establishing a session.
    Initializing,
    /// Checking availability with an established session.
    Polling(S),
    /// Attempting to claim `date`.
    Booking { session: S, date: NaiveDate },
    /// A call failed; the kind selects the wait before re-initializing.
    Retrying(FailureKind),
    /// Target reached. Terminal.
    Succeeded,
}

impl<S> WatchState<S> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Polling(_) => "polling",
            Self::Booking { .. } => "booking",
            Self::Retrying(_) => "retrying",
            Self::Succeeded => "succeeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Earliest offered date strictly before `current` and not before `min`.
pub fn select_candidate(
    dates: &[NaiveDate],
    current: NaiveDate,
    min: Option<NaiveDate>,
) -> Option<NaiveDate> {
    dates
        .iter()
        .copied()
        .filter(|d| *d < current)
        .filter(|d| min.is_none_or(|m| *d >= m))
        .min()
}

/// Drives a scheduling API through the watch state machine.
pub struct WatchLoop<A, C> {
    api: A,
    classifier: C,
    config: WatchConfig,
    current: NaiveDate,
}

impl<A, C> WatchLoop<A, C>
where
    A: SchedulingApi,
    C: ErrorClassifier,
{
    pub fn new(api: A, classifier: C, config: WatchConfig) -> Self {
        let current = config.current_date;
        Self {
            api,
            classifier,
            config,
            current,
        }
    }

    /// Date currently held.
    pub fn current_date(&self) -> NaiveDate {
        self.current
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn target_reached(&self) -> bool {
        self.config
            .target_date
            .is_some_and(|target| self.current <= target)
    }

    /// Run until the target date is reached; returns the held date.
    ///
    /// Without a target date this never returns.
    pub async fn run(&mut self) -> NaiveDate {
        let mut state = WatchState::Initializing;
        while !state.is_terminal() {
            state = self.step(state).await;
        }
        self.current
    }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self, state: WatchState<A::Session>) -> WatchState<A::Session> {
        match state {
            WatchState::Initializing => {
                self.announce();
                if self.target_reached() {
                    info!(
                        "Target date reached! Currently booked on {}",
                        self.current
                    );
                    return WatchState::Succeeded;
                }
                match self.api.initialize().await {
                    Ok(session) => {
                        debug!("Session established");
                        WatchState::Polling(session)
                    }
                    Err(e) => self.fail(e),
                }
            }
            WatchState::Polling(session) => match self.api.available_dates(&session).await {
                Ok(dates) => {
                    match select_candidate(&dates, self.current, self.config.min_date) {
                        Some(date) => {
                            info!("Found earlier date {date} (currently {})", self.current);
                            WatchState::Booking { session, date }
                        }
                        None => {
                            debug!(offered = dates.len(), "No earlier date available");
                            tokio::time::sleep(self.config.refresh_delay).await;
                            WatchState::Polling(session)
                        }
                    }
                }
                Err(e) => self.fail(e),
            },
            WatchState::Booking { session, date } => {
                if self.config.dry_run {
                    info!("[DRY RUN] Would book appointment on {date}");
                } else {
                    match self.api.book(&session, date).await {
                        Ok(true) => {
                            info!("Booked appointment on {date} (was {})", self.current);
                            self.current = date;
                            if self.target_reached() {
                                info!(
                                    "Target date reached! Successfully booked appointment on {date}"
                                );
                                return WatchState::Succeeded;
                            }
                        }
                        Ok(false) => warn!("Booking {date} was not accepted"),
                        Err(e) => return self.fail(e),
                    }
                }
                tokio::time::sleep(self.config.refresh_delay).await;
                WatchState::Polling(session)
            }
            WatchState::Retrying(kind) => {
                if kind == FailureKind::Transient {
                    tokio::time::sleep(self.config.cooldown).await;
                }
                WatchState::Initializing
            }
            WatchState::Succeeded => WatchState::Succeeded,
        }
    }

    fn announce(&self) {
        info!("Initializing with current date {}", self.current);
        if self.config.dry_run {
            info!("[DRY RUN MODE] Bot will only log what would be booked without actually booking");
        }
        if let Some(target) = self.config.target_date {
            info!("Target date: {target}");
        }
        if let Some(min) = self.config.min_date {
            info!("Minimum date: {min}");
        }
    }

    fn fail(&self, error: WatchError) -> WatchState<A::Session> {
        let kind = self.classifier.classify(&error);
        match kind {
            FailureKind::Transient => warn!(
                "Socket hangup error: {error}. Trying again after {} seconds...",
                self.config.cooldown.as_secs()
            ),
            FailureKind::Other => {
                warn!("Session/authentication error: {error}. Retrying immediately...")
            }
        }
        WatchState::Retrying(kind)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::ErrorKind;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    type Scripted<T> = Mutex<VecDeque<Result<T, WatchError>>>;

    /// Scheduling API that replays scripted responses.
    #[derive(Default)]
    struct MockApi {
        sessions: Scripted<u32>,
        dates: Scripted<Vec<NaiveDate>>,
        bookings: Scripted<bool>,
        booked: Mutex<Vec<NaiveDate>>,
        init_calls: Mutex<u32>,
    }

    impl MockApi {
        fn with_dates(self, dates: &[&str]) -> Self {
            self.dates
                .try_lock()
                .unwrap()
                .push_back(Ok(dates.iter().map(|d| date(d)).collect()));
            self
        }

        fn with_session_error(self, err: WatchError) -> Self {
            self.sessions.try_lock().unwrap().push_back(Err(err));
            self
        }
    }

    #[async_trait]
    impl SchedulingApi for MockApi {
        type Session = u32;

        async fn initialize(&self) -> Result<u32, WatchError> {
            *self.init_calls.lock().await += 1;
            self.sessions.lock().await.pop_front().unwrap_or(Ok(1))
        }

        async fn available_dates(&self, _session: &u32) -> Result<Vec<NaiveDate>, WatchError> {
            self.dates.lock().await.pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn book(&self, _session: &u32, date: NaiveDate) -> Result<bool, WatchError> {
            let result = self.bookings.lock().await.pop_front().unwrap_or(Ok(true));
            if matches!(result, Ok(true)) {
                self.booked.lock().await.push(date);
            }
            result
        }
    }

    fn config() -> WatchConfig {
        let mut config = WatchConfig::new(date("2024-03-01"));
        config.refresh_delay = Duration::from_secs(3);
        config.cooldown = Duration::from_secs(3600);
        config
    }

    fn hangup() -> WatchError {
        WatchError::Io(std::io::Error::new(ErrorKind::ConnectionReset, "socket hang up"))
    }

    #[test]
    fn candidate_is_earliest_earlier_date_above_minimum() {
        let dates = [
            date("2024-02-20"),
            date("2024-01-05"),
            date("2024-03-15"),
            date("2024-01-20"),
        ];
        let current = date("2024-03-01");

        assert_eq!(select_candidate(&dates, current, None), Some(date("2024-01-05")));
        assert_eq!(
            select_candidate(&dates, current, Some(date("2024-01-10"))),
            Some(date("2024-01-20"))
        );
        assert_eq!(
            select_candidate(&dates, current, Some(date("2024-01-20"))),
            Some(date("2024-01-20"))
        );
        assert_eq!(select_candidate(&dates, date("2024-01-05"), None), None);
        assert_eq!(select_candidate(&[], current, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn books_until_target_reached() {
        let api = MockApi::default()
            .with_dates(&["2024-02-20"])
            .with_dates(&["2024-01-10", "2024-04-01"]);
        let mut cfg = config();
        cfg.target_date = Some(date("2024-01-31"));

        let mut watch = WatchLoop::new(api, NetworkClassifier, cfg);
        let held = watch.run().await;

        assert_eq!(held, date("2024-01-10"));
        assert_eq!(
            *watch.api().booked.lock().await,
            vec![date("2024-02-20"), date("2024-01-10")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn state_transitions() {
        let api = MockApi::default().with_dates(&["2024-02-01"]);
        let mut watch = WatchLoop::new(api, NetworkClassifier, config());

        let state = watch.step(WatchState::Initializing).await;
        assert_eq!(state.name(), "polling");

        let state = watch.step(state).await;
        assert!(matches!(state, WatchState::Booking { date: d, .. } if d == date("2024-02-01")));

        let state = watch.step(state).await;
        assert_eq!(state.name(), "polling");
        assert_eq!(watch.current_date(), date("2024-02-01"));

        // Nothing earlier on offer: sleep the refresh delay and keep polling.
        let before = Instant::now();
        let state = watch.step(state).await;
        assert_eq!(state.name(), "polling");
        assert_eq!(before.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_booking_keeps_current_date() {
        let api = MockApi::default().with_dates(&["2024-02-01"]);
        api.bookings.lock().await.push_back(Ok(false));
        let mut watch = WatchLoop::new(api, NetworkClassifier, config());

        let mut state = WatchState::Initializing;
        for _ in 0..3 {
            state = watch.step(state).await;
        }
        assert_eq!(state.name(), "polling");
        assert_eq!(watch.current_date(), date("2024-03-01"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_waits_for_cooldown() {
        let api = MockApi::default().with_session_error(hangup());
        let mut watch = WatchLoop::new(api, NetworkClassifier, config());

        let state = watch.step(WatchState::Initializing).await;
        assert!(matches!(state, WatchState::Retrying(FailureKind::Transient)));

        let before = Instant::now();
        let state = watch.step(state).await;
        assert_eq!(state.name(), "initializing");
        assert_eq!(before.elapsed(), Duration::from_secs(3600));

        let state = watch.step(state).await;
        assert_eq!(state.name(), "polling");
        assert_eq!(*watch.api().init_calls.lock().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_failure_retries_immediately() {
        let api = MockApi::default().with_session_error(WatchError::Session("expired".into()));
        let mut watch = WatchLoop::new(api, NetworkClassifier, config());

        let state = watch.step(WatchState::Initializing).await;
        assert!(matches!(state, WatchState::Retrying(FailureKind::Other)));

        let before = Instant::now();
        let state = watch.step(state).await;
        assert_eq!(state.name(), "initializing");
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_failure_restarts_session() {
        let api = MockApi::default();
        api.dates.lock().await.push_back(Err(hangup()));
        let mut watch = WatchLoop::new(api, NetworkClassifier, config());

        let state = watch.step(WatchState::Initializing).await;
        let state = watch.step(state).await;
        assert!(matches!(state, WatchState::Retrying(FailureKind::Transient)));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_books_nothing() {
        let api = MockApi::default().with_dates(&["2024-01-15"]);
        let mut cfg = config();
        cfg.dry_run = true;
        let mut watch = WatchLoop::new(api, NetworkClassifier, cfg);

        let mut state = WatchState::Initializing;
        for _ in 0..3 {
            state = watch.step(state).await;
        }
        assert_eq!(state.name(), "polling");
        assert_eq!(watch.current_date(), date("2024-03-01"));
        assert!(watch.api().booked.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn already_at_target_succeeds_without_session() {
        let mut cfg = config();
        cfg.target_date = Some(date("2024-03-01"));
        let mut watch = WatchLoop::new(MockApi::default(), NetworkClassifier, cfg);

        assert_eq!(watch.run().await, date("2024-03-01"));
        assert_eq!(*watch.api().init_calls.lock().await, 0);
    }

    /// Classifier that treats everything as transient.
    struct AlwaysTransient;

    impl ErrorClassifier for AlwaysTransient {
        fn classify(&self, _error: &WatchError) -> FailureKind {
            FailureKind::Transient
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_is_pluggable() {
        let api = MockApi::default().with_session_error(WatchError::Session("expired".into()));
        let mut watch = WatchLoop::new(api, AlwaysTransient, config());

        let state = watch.step(WatchState::Initializing).await;
        assert!(matches!(state, WatchState::Retrying(FailureKind::Transient)));
    }
}
