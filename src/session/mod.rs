//! Browser sessions against bank portals.
//!
//! A [`BankSession`] walks one portal from login to export download as a
//! strict state machine. Every wait is bounded, cancellation is honored
//! at every wait point, and the browser is released on every exit path.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::banks::Bank;
use crate::error::SyncError;
use crate::normalize::RawExport;
use crate::vault::Secret;

mod driver;
#[cfg(test)]
pub(crate) mod fake;
mod flows;
mod remote;
mod selectors;

pub use driver::{BrowserDriver, DriverError, DriverFactory};
pub use remote::RemoteDriverFactory;
pub use selectors::{Selector, Target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Authenticating,
    /// Suspended until the operator supplies an out-of-band code. Gets
    /// its own, much longer timeout since a human is in the loop.
    AwaitingSecondFactor,
    Authenticated,
    Downloading,
    Completed,
    Failed(SyncError),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Authenticating => "authenticating",
            SessionState::AwaitingSecondFactor => "awaiting-second-factor",
            SessionState::Authenticated => "authenticated",
            SessionState::Downloading => "downloading",
            SessionState::Completed => "completed",
            SessionState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}

fn transition_allowed(from: &SessionState, to: &SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Idle, Authenticating)
        | (Authenticating, AwaitingSecondFactor)
        | (Authenticating, Authenticated)
        | (AwaitingSecondFactor, Authenticated)
        | (Authenticated, Downloading)
        | (Downloading, Completed) => true,
        (Completed | Failed(_), _) => false,
        (_, Failed(_)) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Per page interaction.
    pub page: Duration,
    /// For the operator to come back with a second factor.
    pub second_factor: Duration,
    /// Between element lookup attempts.
    pub poll: Duration,
    /// Extra attempts after a retryable failure before giving up.
    pub transient_retries: u32,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            page: Duration::from_secs(30),
            second_factor: Duration::from_secs(300),
            poll: Duration::from_millis(250),
            transient_retries: 2,
        }
    }
}

/// Operator-side handle to a running session: cancel it, read prompts,
/// answer second-factor challenges.
pub struct SessionControl {
    cancel: Option<oneshot::Sender<()>>,
    second_factor: mpsc::Sender<String>,
    prompts: mpsc::Receiver<String>,
}

impl SessionControl {
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Next instruction the session wants relayed to the operator.
    pub async fn next_prompt(&mut self) -> Option<String> {
        self.prompts.recv().await
    }

    pub async fn provide_second_factor(&self, code: String) -> bool {
        self.second_factor.send(code).await.is_ok()
    }
}

/// Wraps the cancel channel so it stays pollable after the control
/// handle goes away. A dropped handle means "never cancelled", not
/// "cancelled".
struct CancelSignal {
    receiver: Option<oneshot::Receiver<()>>,
    fired: bool,
}

impl CancelSignal {
    fn new(receiver: oneshot::Receiver<()>) -> Self {
        Self {
            receiver: Some(receiver),
            fired: false,
        }
    }

    /// Resolves iff the session gets cancelled. Pends forever otherwise.
    async fn wait(&mut self) {
        if self.fired {
            return;
        }
        if let Some(receiver) = &mut self.receiver {
            if receiver.await.is_ok() {
                self.fired = true;
                self.receiver = None;
                return;
            }
            self.receiver = None;
        }
        std::future::pending::<()>().await
    }
}

/// Race a driver operation against cancellation and a deadline.
async fn bounded<T>(
    cancel: &mut CancelSignal,
    duration: Duration,
    what: &str,
    operation: impl std::future::Future<Output = Result<T, DriverError>>,
) -> Result<T, SyncError> {
    tokio::select! {
        _ = cancel.wait() => Err(SyncError::Cancelled),
        result = tokio::time::timeout(duration, operation) => match result {
            Err(_) => Err(SyncError::Timeout(what.to_string())),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SyncError::Transient(err.to_string())),
        },
    }
}

/// Poll until one of the target's strategies matches. Runs under
/// [`bounded`], which supplies the deadline.
async fn locate(
    driver: &mut dyn BrowserDriver,
    target: &Target,
    poll: Duration,
) -> Result<Selector, DriverError> {
    loop {
        for strategy in &target.strategies {
            if driver.is_visible(strategy).await? {
                return Ok(strategy.clone());
            }
        }
        tokio::time::sleep(poll).await;
    }
}

/// Single visibility probe across all strategies, no waiting.
async fn probe(
    driver: &mut dyn BrowserDriver,
    target: &Target,
) -> Result<Option<Selector>, DriverError> {
    for strategy in &target.strategies {
        if driver.is_visible(strategy).await? {
            return Ok(Some(strategy.clone()));
        }
    }
    Ok(None)
}

/// One login-to-download pass against one bank portal. Single use: a
/// session that reached a terminal state cannot be restarted.
pub struct BankSession {
    bank: Bank,
    driver: Box<dyn BrowserDriver>,
    state: SessionState,
    cancel: CancelSignal,
    second_factor: mpsc::Receiver<String>,
    prompts: mpsc::Sender<String>,
    timeouts: SessionTimeouts,
}

impl BankSession {
    pub fn new(bank: Bank, driver: Box<dyn BrowserDriver>) -> (Self, SessionControl) {
        Self::with_timeouts(bank, driver, SessionTimeouts::default())
    }

    pub fn with_timeouts(
        bank: Bank,
        driver: Box<dyn BrowserDriver>,
        timeouts: SessionTimeouts,
    ) -> (Self, SessionControl) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (second_factor_tx, second_factor_rx) = mpsc::channel(1);
        let (prompt_tx, prompt_rx) = mpsc::channel(4);
        let session = Self {
            bank,
            driver,
            state: SessionState::Idle,
            cancel: CancelSignal::new(cancel_rx),
            second_factor: second_factor_rx,
            prompts: prompt_tx,
            timeouts,
        };
        let control = SessionControl {
            cancel: Some(cancel_tx),
            second_factor: second_factor_tx,
            prompts: prompt_rx,
        };
        (session, control)
    }

    pub fn bank(&self) -> Bank {
        self.bank
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drive the portal from login to export download. The browser is
    /// closed before this returns, whatever the outcome.
    pub async fn run(&mut self, credential: &Secret) -> Result<RawExport, SyncError> {
        assert_eq!(
            SessionState::Idle,
            self.state,
            "a session is single-use; launch a new one"
        );
        log::info!("{}: starting portal session...", self.bank);
        self.set_state(SessionState::Authenticating);
        let result = match self.bank {
            Bank::Ibercaja => flows::ibercaja(self, credential).await,
            Bank::IngNomina | Bank::IngNaranja => flows::ing(self, credential).await,
        };
        self.driver.close().await;
        match result {
            Ok(export) => {
                self.set_state(SessionState::Completed);
                log::info!(
                    "{}: starting portal session...done ({} rows downloaded)",
                    self.bank,
                    export.rows.len()
                );
                Ok(export)
            }
            Err(err) => {
                log::warn!("{}: portal session failed: {err}", self.bank);
                self.set_state(SessionState::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn set_state(&mut self, to: SessionState) {
        assert!(
            transition_allowed(&self.state, &to),
            "illegal session transition {} -> {}",
            self.state.name(),
            to.name(),
        );
        log::debug!("{}: session {} -> {}", self.bank, self.state.name(), to.name());
        self.state = to;
    }

    pub(super) fn mark_authenticated(&mut self) {
        self.set_state(SessionState::Authenticated);
    }

    pub(super) fn mark_downloading(&mut self) {
        self.set_state(SessionState::Downloading);
    }

    pub(super) async fn goto(&mut self, url: &str) -> Result<(), SyncError> {
        bounded(
            &mut self.cancel,
            self.timeouts.page,
            url,
            self.driver.goto(url),
        )
        .await
    }

    pub(super) async fn evaluate(&mut self, script: &str) -> Result<(), SyncError> {
        bounded(
            &mut self.cancel,
            self.timeouts.page,
            "script evaluation",
            self.driver.evaluate(script),
        )
        .await
    }

    /// Locate an element that must exist on the current screen. A miss
    /// after the deadline is treated as a markup change and comes back
    /// with page diagnostics attached.
    pub(super) async fn find(&mut self, target: &Target) -> Result<Selector, SyncError> {
        let poll = self.timeouts.poll;
        let result = bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            locate(self.driver.as_mut(), target, poll),
        )
        .await;
        match result {
            Ok(selector) => Ok(selector),
            Err(SyncError::Timeout(_)) => Err(self.structure_changed(target).await),
            Err(err) => Err(err),
        }
    }

    /// Wait for an element that takes its time to appear, e.g. behind a
    /// page load. Retryable failures get a bounded number of fresh
    /// attempts; a final miss is a timeout, not a markup change.
    pub(super) async fn wait_for(&mut self, target: &Target) -> Result<Selector, SyncError> {
        let mut attempt = 0;
        loop {
            let poll = self.timeouts.poll;
            let result = bounded(
                &mut self.cancel,
                self.timeouts.page,
                target.name,
                locate(self.driver.as_mut(), target, poll),
            )
            .await;
            match result {
                Ok(selector) => return Ok(selector),
                Err(err) if err.is_retryable() && attempt < self.timeouts.transient_retries => {
                    attempt += 1;
                    log::warn!(
                        "{}: waiting for {target} failed ({err}), attempt {attempt} of {}",
                        self.bank,
                        self.timeouts.transient_retries,
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub(super) async fn is_present(&mut self, target: &Target) -> Result<bool, SyncError> {
        let selector = bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            probe(self.driver.as_mut(), target),
        )
        .await?;
        Ok(selector.is_some())
    }

    /// Click the target if it is currently on screen. Cookie banners and
    /// similar optional furniture.
    pub(super) async fn click_if_present(&mut self, target: &Target) -> Result<bool, SyncError> {
        let selector = bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            probe(self.driver.as_mut(), target),
        )
        .await?;
        match selector {
            Some(selector) => {
                bounded(
                    &mut self.cancel,
                    self.timeouts.page,
                    target.name,
                    self.driver.click(&selector),
                )
                .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(super) async fn click(&mut self, target: &Target) -> Result<(), SyncError> {
        let selector = self.find(target).await?;
        bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            self.driver.click(&selector),
        )
        .await
    }

    pub(super) async fn fill(&mut self, target: &Target, value: &str) -> Result<(), SyncError> {
        let selector = self.find(target).await?;
        bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            self.driver.fill(&selector, value),
        )
        .await
    }

    pub(super) async fn text_of(&mut self, target: &Target) -> Result<String, SyncError> {
        let selector = self.find(target).await?;
        bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            self.driver.text_of(&selector),
        )
        .await
    }

    pub(super) async fn download(&mut self, target: &Target) -> Result<Vec<u8>, SyncError> {
        let selector = self.find(target).await?;
        bounded(
            &mut self.cancel,
            self.timeouts.page,
            target.name,
            self.driver.download(&selector),
        )
        .await
    }

    /// Keep removing an overlay until it stays gone. Portals re-insert
    /// consent layers from async scripts, so one removal is not enough.
    pub(super) async fn dismiss_overlays(
        &mut self,
        overlay: &Target,
        script: &str,
    ) -> Result<(), SyncError> {
        for _ in 0..3 {
            if !self.is_present(overlay).await? {
                return Ok(());
            }
            self.evaluate(script).await?;
            tokio::time::sleep(self.timeouts.poll).await;
        }
        log::warn!("{}: overlay {overlay} still present after removal attempts", self.bank);
        Ok(())
    }

    /// Suspend until the operator answers the prompt with a code.
    pub(super) async fn request_second_factor(&mut self, prompt: &str) -> Result<String, SyncError> {
        if self.state != SessionState::AwaitingSecondFactor {
            self.set_state(SessionState::AwaitingSecondFactor);
        }
        self.notify_operator(prompt);
        let response = tokio::time::timeout(self.timeouts.second_factor, self.second_factor.recv());
        tokio::select! {
            _ = self.cancel.wait() => Err(SyncError::Cancelled),
            result = response => match result {
                Err(_) => Err(SyncError::Timeout("second factor from operator".to_string())),
                Ok(None) => Err(SyncError::Cancelled),
                Ok(Some(code)) => Ok(code),
            },
        }
    }

    pub(super) fn notify_operator(&mut self, prompt: &str) {
        log::info!("{}: operator action needed: {prompt}", self.bank);
        if self.prompts.try_send(prompt.to_string()).is_err() {
            log::warn!("{}: nobody is listening for session prompts", self.bank);
        }
    }

    /// Wait until the page URL contains the fragment. Used where the
    /// portal redirects on success without a reliable element to wait on.
    pub(super) async fn wait_for_location(
        &mut self,
        fragment: &str,
        duration: Duration,
    ) -> Result<(), SyncError> {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            let location = self.driver.location().await;
            if location.contains(fragment) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::Timeout(format!("navigation to {fragment}")));
            }
            tokio::select! {
                _ = self.cancel.wait() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(self.timeouts.poll) => {}
            }
        }
    }

    pub(super) async fn structure_changed(&mut self, target: &Target) -> SyncError {
        let location = self.driver.location().await;
        let visible_controls = self.driver.visible_controls().await;
        log::warn!(
            "{}: no strategy matched {target} at {location}; the portal markup likely changed",
            self.bank,
        );
        SyncError::StructureChanged {
            location,
            visible_controls,
        }
    }

    pub(super) fn page_timeout(&self) -> Duration {
        self.timeouts.page
    }

    pub(super) fn second_factor_timeout(&self) -> Duration {
        self.timeouts.second_factor
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeDriver;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    const EXPORT: &str = "a,b,c\n1,2,3\n";

    fn fast_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            page: Duration::from_millis(50),
            second_factor: Duration::from_millis(200),
            poll: Duration::from_millis(2),
            transient_retries: 1,
        }
    }

    fn session_with(bank: Bank, driver: FakeDriver) -> (BankSession, SessionControl) {
        BankSession::with_timeouts(bank, Box::new(driver), fast_timeouts())
    }

    #[test]
    fn transition_table() {
        use SessionState::*;
        assert!(transition_allowed(&Idle, &Authenticating));
        assert!(transition_allowed(&Authenticating, &Authenticated));
        assert!(transition_allowed(&Authenticating, &AwaitingSecondFactor));
        assert!(transition_allowed(&AwaitingSecondFactor, &Authenticated));
        assert!(transition_allowed(&Downloading, &Failed(SyncError::Cancelled)));

        assert!(!transition_allowed(&Idle, &Downloading));
        assert!(!transition_allowed(&Authenticated, &AwaitingSecondFactor));
        assert!(!transition_allowed(&Completed, &Authenticating));
        assert!(!transition_allowed(
            &Failed(SyncError::Cancelled),
            &Authenticating
        ));
    }

    #[tokio::test]
    async fn ibercaja_happy_path_completes_and_releases_browser() {
        let driver = FakeDriver::happy(EXPORT);
        let closed = Arc::clone(&driver.closed);
        let (mut session, _control) = session_with(Bank::Ibercaja, driver);

        let export = session
            .run(&Secret::new("user123\nkey456"))
            .await
            .unwrap();
        assert_eq!(2, export.rows.len());
        assert_eq!(&SessionState::Completed, session.state());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[should_panic(expected = "single-use")]
    async fn completed_session_cannot_be_rerun() {
        let (mut session, _control) = session_with(Bank::Ibercaja, FakeDriver::happy(EXPORT));
        let credential = Secret::new("user123\nkey456");
        session.run(&credential).await.unwrap();
        let _ = session.run(&credential).await;
    }

    #[tokio::test]
    async fn malformed_credential_fails_as_authentication() {
        let driver = FakeDriver::happy(EXPORT);
        let closed = Arc::clone(&driver.closed);
        let (mut session, _control) = session_with(Bank::Ibercaja, driver);

        let err = session.run(&Secret::new("only-one-line")).await.unwrap_err();
        assert_eq!(SyncError::Authentication, err);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unmatched_element_reports_structure_change_with_diagnostics() {
        let mut driver = FakeDriver::happy(EXPORT);
        // Hide every strategy of the client access link.
        driver.hidden.push("Acceso clientes");
        driver.hidden.push("login");
        let (mut session, _control) = session_with(Bank::Ibercaja, driver);

        let err = session.run(&Secret::new("user123\nkey456")).await.unwrap_err();
        match &err {
            SyncError::StructureChanged {
                location,
                visible_controls,
            } => {
                assert!(!location.is_empty());
                assert!(visible_controls.contains(&"Inicio".to_string()));
            }
            other => panic!("expected StructureChanged, got {other:?}"),
        }
        assert_eq!(&SessionState::Failed(err), session.state());
    }

    #[tokio::test]
    async fn missing_account_overview_times_out_as_retryable() {
        let mut driver = FakeDriver::happy(EXPORT);
        driver.hidden.push("ui-table");
        driver.hidden.push("tbody");
        let (mut session, _control) = session_with(Bank::Ibercaja, driver);

        let err = session.run(&Secret::new("user123\nkey456")).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn wrong_credentials_surface_as_authentication() {
        let mut driver = FakeDriver::happy(EXPORT);
        driver.hidden.push("ui-table");
        driver.hidden.push("tbody");
        // The login error banner is visible again.
        driver.hidden.retain(|hidden| *hidden != "error");
        let (mut session, _control) = session_with(Bank::Ibercaja, driver);

        let err = session.run(&Secret::new("user123\nbadkey")).await.unwrap_err();
        assert_eq!(SyncError::Authentication, err);
    }

    #[tokio::test]
    async fn cancellation_fails_the_session_and_releases_the_browser() {
        let mut driver = FakeDriver::happy(EXPORT);
        driver.hang_lookups = true;
        let closed = Arc::clone(&driver.closed);
        let (mut session, mut control) = session_with(Bank::Ibercaja, driver);

        let credential = Secret::new("user123\nkey456");
        let run = session.run(&credential);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            control.cancel();
        };
        let (result, ()) = tokio::join!(run, cancel);

        assert_eq!(SyncError::Cancelled, result.unwrap_err());
        assert_eq!(
            &SessionState::Failed(SyncError::Cancelled),
            session.state()
        );
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ing_pinpad_prompts_operator_and_enters_the_digits() {
        let mut driver = FakeDriver::happy(EXPORT);
        driver.pinpad_text = "Introduce las posiciones 2, 4 y 5 de tu clave";
        driver
            .locations
            .push_back("https://ing.ingdirect.es/pfm/#overall-position".to_string());
        let clicks = Arc::clone(&driver.clicks);
        let (mut session, mut control) = session_with(Bank::IngNomina, driver);

        let credential = Secret::new("12345678Z\n07\n03\n1984");
        let run = session.run(&credential);
        let operator = async {
            let prompt = control.next_prompt().await.unwrap();
            assert!(prompt.contains("2, 4, 5"), "prompt was {prompt:?}");
            assert!(control.provide_second_factor("913".to_string()).await);
        };
        let (result, ()) = tokio::join!(run, operator);

        assert!(result.is_ok(), "got {result:?}");
        assert_eq!(&SessionState::Completed, session.state());
        let clicks = clicks.lock().unwrap();
        for digit in ["9", "1", "3"] {
            assert!(
                clicks.iter().any(|click| click.contains(digit)),
                "pin digit {digit} was never clicked: {clicks:?}"
            );
        }
    }

    #[tokio::test]
    async fn second_factor_times_out_when_the_operator_stays_silent() {
        let mut driver = FakeDriver::happy(EXPORT);
        driver.pinpad_text = "posiciones 1, 2 y 3";
        let (mut session, _control) = session_with(Bank::IngNaranja, driver);

        let err = session
            .run(&Secret::new("12345678Z\n07\n03\n1984"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)), "got {err:?}");
    }
}
