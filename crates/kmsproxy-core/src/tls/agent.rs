// Account bootstrap/restore, issuance and renewal timing

use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{AgentError, AuthorityError, StoreError},
};

use super::{
    authority::CertificateAuthority,
    bundle::{AccountState, CertificateBundle},
    handoff::BundlePublisher,
    schedule::{FALLBACK_INTERVAL, RenewalSchedule},
    store::CertificateStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Bootstrapping,
    Serving,
    Renewing,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Bootstrapping => "bootstrapping",
            AgentState::Serving => "serving",
            AgentState::Renewing => "renewing",
            AgentState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Domains to certify, in request order
    pub domains: Vec<String>,
    pub email: String,
    /// Deadline for each certificate authority call
    pub authority_timeout: Duration,
    /// How long a publish may wait for the distributor
    pub handoff_grace: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            domains: config.domains.clone(),
            email: config.email.clone(),
            authority_timeout: config.timeouts.authority(),
            handoff_grace: config.timeouts.handoff(),
        }
    }
}

/// Keeps one certificate for the configured domains valid and published
pub struct CertificateAgent {
    authority: Arc<dyn CertificateAuthority>,
    store: CertificateStore,
    publisher: BundlePublisher,
    settings: AgentSettings,
    state: watch::Sender<AgentState>,
}

impl CertificateAgent {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        store: CertificateStore,
        publisher: BundlePublisher,
        settings: AgentSettings,
    ) -> Self {
        let state = watch::Sender::new(AgentState::Uninitialized);

        Self {
            authority,
            store,
            publisher,
            settings,
            state,
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Certificate agent {previous} -> {state}");
        }
    }

    /// Run until cancelled
    ///
    /// Returns an error only when the agent cannot go on; renewal failures
    /// are logged and retried on the next scheduled check.
    pub async fn run(&self, token: CancellationToken) -> Result<(), AgentError> {
        self.set_state(AgentState::Uninitialized);
        let result = self.run_inner(&token).await;
        self.set_state(AgentState::Stopped);

        if let Err(e) = &result {
            error!("Certificate agent stopped: {e}");
        }

        result
    }

    async fn run_inner(&self, token: &CancellationToken) -> Result<(), AgentError> {
        let started = match self.store.load_state() {
            Ok((account, Some(bundle))) => self.restore(account, bundle, token).await?,
            Ok((account, None)) => self.recover(account, token).await?,
            Err(StoreError::NotFound) => self.bootstrap(token).await?,
            Err(e) => return Err(e.into()),
        };

        let Some((account, mut current)) = started else {
            return Ok(());
        };

        let mut schedule = RenewalSchedule::new();
        schedule.schedule_after(FALLBACK_INTERVAL);
        self.set_state(AgentState::Serving);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = schedule.fired() => {}
            }

            self.set_state(AgentState::Renewing);
            match self.renew(&account, &current, &mut schedule, token).await {
                Ok(Some(bundle)) => current = bundle,
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("{e}, keeping the current certificate");
                    schedule.schedule_after(FALLBACK_INTERVAL);
                }
            }

            if token.is_cancelled() {
                return Ok(());
            }
            self.set_state(AgentState::Serving);
        }
    }

    /// First run: register an account, persist it and obtain the first certificate
    async fn bootstrap(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<(AccountState, CertificateBundle)>, AgentError> {
        self.set_state(AgentState::Bootstrapping);
        info!(
            "No state in {}, registering a new account",
            self.store.root().display()
        );

        let Some(registration) = self.call(token, self.authority.register(&self.settings.email)).await
        else {
            return Ok(None);
        };
        let registration = registration.map_err(AgentError::Bootstrap)?;

        let account = AccountState::new(
            self.settings.email.clone(),
            registration.handle,
            registration.private_key,
        );
        account
            .validate_key()
            .map_err(|e| AgentError::AccountKey(e.to_string()))?;
        self.store.save_account(&account)?;
        info!("Account registered and saved");

        let bundle = self.issue(&account, token, AgentError::Bootstrap).await?;
        Ok(bundle.map(|bundle| (account, bundle)))
    }

    /// Later runs: reuse the persisted account and certificate as they are
    async fn restore(
        &self,
        account: AccountState,
        bundle: CertificateBundle,
        token: &CancellationToken,
    ) -> Result<Option<(AccountState, CertificateBundle)>, AgentError> {
        account
            .validate_key()
            .map_err(|e| AgentError::AccountKey(e.to_string()))?;
        bundle.certified_key()?;

        if !bundle.covers_exactly(&self.settings.domains)? {
            warn!(
                "Persisted certificate is for {:?}, not the configured {:?}, requesting a new one",
                bundle.leaf_domains()?,
                self.settings.domains
            );
            // Non-fatal: the old certificate stays active until this succeeds
            return self.reissue(account, token, AgentError::Renewal).await;
        }

        if !self.resume(&account, token).await? {
            return Ok(None);
        }

        info!("Restored account and certificate for {:?}", bundle.domains);
        Ok(Some((account, bundle)))
    }

    /// An account exists but no certificate was ever persisted
    async fn recover(
        &self,
        account: AccountState,
        token: &CancellationToken,
    ) -> Result<Option<(AccountState, CertificateBundle)>, AgentError> {
        account
            .validate_key()
            .map_err(|e| AgentError::AccountKey(e.to_string()))?;

        warn!("Account found without a certificate, requesting one");
        self.reissue(account, token, AgentError::Bootstrap).await
    }

    /// Resume the account and issue for the configured domains
    async fn reissue(
        &self,
        account: AccountState,
        token: &CancellationToken,
        wrap: fn(AuthorityError) -> AgentError,
    ) -> Result<Option<(AccountState, CertificateBundle)>, AgentError> {
        if !self.resume(&account, token).await? {
            return Ok(None);
        }

        let bundle = self.issue(&account, token, wrap).await?;
        Ok(bundle.map(|bundle| (account, bundle)))
    }

    async fn resume(&self, account: &AccountState, token: &CancellationToken) -> Result<bool, AgentError> {
        match self.call(token, self.authority.resume(account)).await {
            None => Ok(false),
            Some(result) => {
                result.map_err(AgentError::Restore)?;
                Ok(true)
            }
        }
    }

    /// One renewal check, rearming the schedule for the next one
    async fn renew(
        &self,
        account: &AccountState,
        current: &CertificateBundle,
        schedule: &mut RenewalSchedule,
        token: &CancellationToken,
    ) -> Result<Option<CertificateBundle>, AgentError> {
        let leaf = match current.leaf() {
            Ok(leaf) => leaf,
            Err(e) => {
                warn!("Active certificate is unreadable, renewing now: {e}");
                return self.renew_now(account, schedule, token).await;
            }
        };

        let Some(window) = self
            .call(token, self.authority.suggested_renewal(account, leaf.as_ref()))
            .await
        else {
            return Ok(None);
        };

        match window {
            Ok(window) if window.start > Utc::now() => {
                let at = schedule.reschedule_at(window.start);
                info!("Renewal window opens at {}, next check at {at}", window.start);
                return Ok(None);
            }
            Ok(window) => {
                info!("Inside the renewal window ({} - {}), renewing", window.start, window.end);
            }
            Err(e) => {
                warn!("Could not get a renewal window, checking again in {FALLBACK_INTERVAL:?}: {e}");

                let expiring = current
                    .leaf_info()
                    .map(|info| (info.in_final_third(Utc::now()), info.not_after));
                match expiring {
                    Ok((true, not_after)) => {
                        warn!("Certificate expires at {not_after}, renewing without a window");
                    }
                    _ => {
                        schedule.schedule_after(FALLBACK_INTERVAL);
                        return Ok(None);
                    }
                }
            }
        }

        self.renew_now(account, schedule, token).await
    }

    async fn renew_now(
        &self,
        account: &AccountState,
        schedule: &mut RenewalSchedule,
        token: &CancellationToken,
    ) -> Result<Option<CertificateBundle>, AgentError> {
        let bundle = self.issue(account, token, AgentError::Renewal).await?;
        schedule.schedule_after(FALLBACK_INTERVAL);

        Ok(bundle)
    }

    /// Obtain, publish, then persist a new certificate
    ///
    /// `None` means cancellation interrupted it.
    async fn issue(
        &self,
        account: &AccountState,
        token: &CancellationToken,
        wrap: fn(AuthorityError) -> AgentError,
    ) -> Result<Option<CertificateBundle>, AgentError> {
        let domains = &self.settings.domains;

        let Some(issued) = self
            .call(token, self.authority.obtain_certificate(account, domains))
            .await
        else {
            return Ok(None);
        };
        let issued = issued.map_err(wrap)?;

        let bundle = CertificateBundle::new(
            domains.clone(),
            issued.certificate_chain,
            issued.private_key,
            Utc::now(),
        );
        if let Err(e) = bundle.certified_key() {
            return Err(wrap(AuthorityError::Issuance(format!(
                "Authority returned an unusable certificate: {e}"
            ))));
        }

        tokio::select! {
            _ = token.cancelled() => return Ok(None),
            published = self.publisher.publish(bundle.clone(), self.settings.handoff_grace) => published?,
        }
        info!("New certificate for {domains:?} is live");

        if let Err(e) = self.store.save_bundle(&bundle) {
            warn!("Certificate is live but could not be persisted: {e}");
        }

        Ok(Some(bundle))
    }

    /// Bound an authority call by the deadline and by cancellation
    async fn call<T, F>(&self, token: &CancellationToken, call: F) -> Option<Result<T, AuthorityError>>
    where
        F: Future<Output = Result<T, AuthorityError>>,
    {
        let deadline = self.settings.authority_timeout;

        tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(deadline, call) => {
                Some(result.unwrap_or(Err(AuthorityError::Timeout(deadline))))
            }
        }
    }
}
