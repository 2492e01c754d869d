// Runs the long-lived units and restarts the ones that fail

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    server::RpcListener,
    tls::{CertificateAgent, CertificateConsumer},
};

/// A unit of work owned by the [`Supervisor`]
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run until cancelled, or until the unit has nothing left to do
    async fn serve(&self, token: CancellationToken) -> Result<(), Error>;
}

/// Exponential restart delay for failing units
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A unit that ran at least this long starts over from `initial_delay`
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            reset_after: Duration::from_secs(5 * 60),
        }
    }
}

impl RestartPolicy {
    fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }
}

pub struct Supervisor {
    units: Vec<Arc<dyn Service>>,
    policy: RestartPolicy,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_policy(RestartPolicy::default())
    }

    pub fn with_policy(policy: RestartPolicy) -> Self {
        Self {
            units: Vec::new(),
            policy,
        }
    }

    pub fn add<S: Service>(&mut self, unit: Arc<S>) -> &mut Self {
        self.units.push(unit);
        self
    }

    /// Run every unit until all of them have finished
    ///
    /// The first fatal error cancels the remaining units and is returned once
    /// they have stopped.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        let group = token.child_token();
        let mut units = JoinSet::new();

        for unit in &self.units {
            info!("Starting {}", unit.name());
            units.spawn(supervise(Arc::clone(unit), self.policy, group.clone()));
        }

        let mut fatal = None;
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        group.cancel();
                        fatal = Some(e);
                    }
                }
                Err(e) => error!("Supervisor task failed: {e}"),
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn supervise(unit: Arc<dyn Service>, policy: RestartPolicy, token: CancellationToken) -> Result<(), Error> {
    let name = unit.name().to_string();
    let mut delay = policy.initial_delay;

    loop {
        let started = Instant::now();

        // A panic inside the unit is a restartable failure
        let attempt = tokio::spawn({
            let unit = Arc::clone(&unit);
            let token = token.clone();
            async move { unit.serve(token).await }
        });

        let failure = match attempt.await {
            Ok(Ok(())) => {
                debug!("{name} finished");
                return Ok(());
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!("{name} failed and cannot be restarted: {e}");
                return Err(e);
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("task panicked: {e}"),
        };

        if token.is_cancelled() {
            debug!("{name} stopped during shutdown: {failure}");
            return Ok(());
        }

        if started.elapsed() >= policy.reset_after {
            delay = policy.initial_delay;
        }

        warn!("{name} failed: {failure}, restarting in {delay:?}");
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = policy.next_delay(delay);
    }
}

#[async_trait]
impl Service for CertificateAgent {
    fn name(&self) -> &str {
        "certificate agent"
    }

    async fn serve(&self, token: CancellationToken) -> Result<(), Error> {
        Ok(self.run(token).await?)
    }
}

#[async_trait]
impl Service for CertificateConsumer {
    fn name(&self) -> &str {
        "certificate consumer"
    }

    async fn serve(&self, token: CancellationToken) -> Result<(), Error> {
        self.run(token).await;
        Ok(())
    }
}

#[async_trait]
impl Service for RpcListener {
    fn name(&self) -> &str {
        "rpc listener"
    }

    async fn serve(&self, token: CancellationToken) -> Result<(), Error> {
        Ok(self.run(token).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ServerError};
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    fn transient() -> Error {
        Error::Server(ServerError::FailedToAcceptConnection(std::io::Error::other("reset")))
    }

    fn fatal() -> Error {
        Error::Config(ConfigError::Parse("broken".to_string()))
    }

    /// Fails with the scripted errors in order, then succeeds
    struct Scripted {
        failures: Mutex<Vec<Error>>,
        attempts: AtomicUsize,
        started_at: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(mut failures: Vec<Error>) -> Arc<Self> {
            failures.reverse();
            Arc::new(Self {
                failures: Mutex::new(failures),
                attempts: AtomicUsize::new(0),
                started_at: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Service for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn serve(&self, _token: CancellationToken) -> Result<(), Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.started_at.lock().unwrap().push(Instant::now());

            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    /// Runs until cancelled
    struct Idle {
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl Service for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn serve(&self, token: CancellationToken) -> Result<(), Error> {
            token.cancelled().await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_restart_with_backoff() {
        let unit = Scripted::new(vec![transient(), transient(), transient()]);
        let mut supervisor = Supervisor::new();
        supervisor.add(Arc::clone(&unit));

        supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(unit.attempts.load(Ordering::SeqCst), 4);

        let started = unit.started_at.lock().unwrap().clone();
        let gaps: Vec<Duration> = started.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_cancels_siblings() {
        let failing = Scripted::new(vec![fatal()]);
        let idle = Arc::new(Idle {
            stopped: AtomicUsize::new(0),
        });

        let mut supervisor = Supervisor::new();
        supervisor.add(Arc::clone(&failing)).add(Arc::clone(&idle));

        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(idle.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_clean_exit() {
        let idle = Arc::new(Idle {
            stopped: AtomicUsize::new(0),
        });
        let mut supervisor = Supervisor::new();
        supervisor.add(Arc::clone(&idle));

        let token = CancellationToken::new();
        token.cancel();

        supervisor.run(token).await.unwrap();
        assert_eq!(idle.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RestartPolicy::default();
        let mut delay = policy.initial_delay;
        for _ in 0..10 {
            delay = policy.next_delay(delay);
        }
        assert_eq!(delay, Duration::from_secs(60));
    }
}
