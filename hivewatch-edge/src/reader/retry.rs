//! Retries and per-sensor circuit breaking around a [`SensorReader`].
//!
//! A read is attempted up to `1 + max_retries` times. When a sensor keeps
//! failing, its circuit opens and further reads fail fast with
//! [`ReadError::CircuitOpen`] until the cooldown has elapsed. The next read
//! after the cooldown is a single trial: success closes the circuit, failure
//! reopens it with a doubled cooldown, capped at `max_cooldown`.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use dashmap::DashMap;
use hivewatch_core::{Sensor, SensorId, SensorStatus};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ReadError, SensorReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: RetryBackoff,
    /// Upper bound on a single hardware read.
    pub read_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff: RetryBackoff::Exponential,
            read_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delays between the attempts of one read, starting at `retry_delay`.
    pub fn backoff(&self) -> ExponentialBackoff {
        let (multiplier, max_interval) = match self.backoff {
            RetryBackoff::Fixed => (1.0, self.retry_delay),
            RetryBackoff::Exponential => (
                2.0,
                self.retry_delay
                    .saturating_mul(2u32.saturating_pow(self.max_retries)),
            ),
        };
        ExponentialBackoff {
            current_interval: self.retry_delay,
            initial_interval: self.retry_delay,
            max_interval,
            multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failed reads that open the circuit.
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
    Closed,
    Open { until: Instant, cooldown: Duration },
    /// A trial read is running. It is abandoned after `until`, in case the
    /// caller dropped it, and the next read becomes a new trial.
    HalfOpen { until: Instant, cooldown: Duration },
}

impl Circuit {
    fn status(&self) -> CircuitStatus {
        match self {
            Circuit::Closed => CircuitStatus::Closed,
            Circuit::Open { .. } => CircuitStatus::Open,
            Circuit::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }
}

/// Observable health of one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorHealth {
    pub status: SensorStatus,
    pub error_message: Option<String>,
    pub consecutive_failures: u32,
    pub circuit: CircuitStatus,
}

impl Default for SensorHealth {
    fn default() -> Self {
        Self {
            status: SensorStatus::Active,
            error_message: None,
            consecutive_failures: 0,
            circuit: CircuitStatus::Closed,
        }
    }
}

struct SensorState {
    health: SensorHealth,
    circuit: Circuit,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            health: SensorHealth::default(),
            circuit: Circuit::Closed,
        }
    }
}

enum Admission {
    Normal,
    Trial { cooldown: Duration },
}

pub struct RetryingReader<R> {
    inner: R,
    policy: RetryPolicy,
    breaker: BreakerConfig,
    states: DashMap<SensorId, SensorState>,
}

impl<R: SensorReader> RetryingReader<R> {
    pub fn new(inner: R, policy: RetryPolicy, breaker: BreakerConfig) -> Self {
        Self {
            inner,
            policy,
            breaker,
            states: DashMap::new(),
        }
    }

    pub fn health(&self, sensor_id: SensorId) -> SensorHealth {
        self.states
            .get(&sensor_id)
            .map(|s| s.health.clone())
            .unwrap_or_default()
    }

    pub async fn read(&self, sensor: &Sensor) -> Result<f64, ReadError> {
        let admission = self.admit(sensor.id)?;

        let result = match admission {
            Admission::Normal => self.read_with_retries(sensor).await,
            Admission::Trial { .. } => self.read_once(sensor).await,
        };

        match &result {
            Ok(_) => self.record_success(sensor),
            Err(e) => self.record_failure(sensor, e, &admission),
        }
        result
    }

    fn admit(&self, sensor_id: SensorId) -> Result<Admission, ReadError> {
        let mut state = self.states.entry(sensor_id).or_default();
        match state.circuit {
            Circuit::Closed => Ok(Admission::Normal),
            Circuit::Open { until, cooldown } | Circuit::HalfOpen { until, cooldown }
                if Instant::now() >= until =>
            {
                state.circuit = Circuit::HalfOpen {
                    until: Instant::now() + self.policy.read_timeout,
                    cooldown,
                };
                state.health.circuit = CircuitStatus::HalfOpen;
                Ok(Admission::Trial { cooldown })
            }
            // a trial is already running or the cooldown has not elapsed
            Circuit::Open { .. } | Circuit::HalfOpen { .. } => Err(ReadError::CircuitOpen),
        }
    }

    async fn read_with_retries(&self, sensor: &Sensor) -> Result<f64, ReadError> {
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;
        loop {
            match self.read_once(sensor).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = backoff.next_backoff().unwrap_or(self.policy.retry_delay);
                    debug!(sensor_id = %sensor.id, attempt, ?delay, error = %e, "retrying sensor read");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_once(&self, sensor: &Sensor) -> Result<f64, ReadError> {
        match tokio::time::timeout(self.policy.read_timeout, self.inner.read(sensor)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout),
        }
    }

    fn record_success(&self, sensor: &Sensor) {
        let mut state = self.states.entry(sensor.id).or_default();
        if state.health.status == SensorStatus::Error {
            info!(sensor_id = %sensor.id, name = %sensor.name, "sensor recovered");
        }
        state.circuit = Circuit::Closed;
        state.health = SensorHealth::default();
    }

    fn record_failure(&self, sensor: &Sensor, error: &ReadError, admission: &Admission) {
        let mut state = self.states.entry(sensor.id).or_default();
        state.health.status = SensorStatus::Error;
        state.health.error_message = Some(error.to_string());
        state.health.consecutive_failures += 1;

        let reopen_with = match admission {
            Admission::Trial { cooldown } => {
                Some(cooldown.saturating_mul(2).min(self.breaker.max_cooldown))
            }
            Admission::Normal
                if state.health.consecutive_failures >= self.breaker.failure_threshold =>
            {
                Some(self.breaker.cooldown)
            }
            Admission::Normal => None,
        };

        if let Some(cooldown) = reopen_with {
            state.circuit = Circuit::Open {
                until: Instant::now() + cooldown,
                cooldown,
            };
            warn!(
                sensor_id = %sensor.id,
                name = %sensor.name,
                failures = state.health.consecutive_failures,
                ?cooldown,
                error = %error,
                "sensor circuit opened"
            );
        }
        state.health.circuit = state.circuit.status();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use hivewatch_core::{HiveId, SensorKind};
    use ulid::Ulid;

    use super::*;

    /// Plays back scripted results, then keeps returning the fallback.
    struct ScriptedReader {
        script: Mutex<VecDeque<Result<f64, ReadError>>>,
        fallback: Result<f64, ReadError>,
        calls: AtomicU32,
    }

    impl ScriptedReader {
        fn new(script: Vec<Result<f64, ReadError>>, fallback: Result<f64, ReadError>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SensorReader for ScriptedReader {
        async fn read(&self, _sensor: &Sensor) -> Result<f64, ReadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn sensor() -> Sensor {
        Sensor {
            id: SensorId(Ulid::new()),
            hive_id: HiveId(Ulid::new()),
            name: "weight_01".into(),
            kind: SensorKind::Weight,
            valid_range: None,
            calibration: None,
            collection_interval: None,
        }
    }

    fn fail() -> Result<f64, ReadError> {
        Err(ReadError::Hardware("i2c nack".into()))
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(100),
            backoff: RetryBackoff::Exponential,
            read_timeout: Duration::from_secs(1),
        }
    }

    fn delays(policy: RetryPolicy, n: usize) -> Vec<u128> {
        let mut backoff = policy.backoff();
        (0..n)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect()
    }

    #[test]
    fn exponential_delays_double() {
        let p = policy(3);
        assert_eq!(delays(p, 4), vec![100, 200, 400, 800]);

        let fixed = RetryPolicy {
            backoff: RetryBackoff::Fixed,
            ..p
        };
        assert_eq!(delays(fixed, 3), vec![100, 100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_out_the_backoff() {
        let reader = RetryingReader::new(
            ScriptedReader::new(vec![fail(), fail(), fail()], Ok(1.0)),
            policy(3),
            BreakerConfig::default(),
        );
        let started = Instant::now();

        assert_eq!(reader.read(&sensor()).await, Ok(1.0));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(700) && waited < Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_does_not_keep_the_circuit_half_open() {
        struct Hangs;

        #[async_trait]
        impl SensorReader for Hangs {
            async fn read(&self, _sensor: &Sensor) -> Result<f64, ReadError> {
                std::future::pending().await
            }
        }

        let breaker = BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
        };
        let reader = RetryingReader::new(Hangs, policy(0), breaker);
        let s = sensor();
        // first read times out after 1s and opens the circuit
        assert_eq!(reader.read(&s).await, Err(ReadError::Timeout));
        assert_eq!(reader.health(s.id).circuit, CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        // the caller gives up on the trial before its read timeout
        let abandoned = tokio::time::timeout(Duration::from_millis(500), reader.read(&s)).await;
        assert!(abandoned.is_err());
        assert_eq!(reader.health(s.id).circuit, CircuitStatus::HalfOpen);
        assert_eq!(reader.read(&s).await, Err(ReadError::CircuitOpen));

        tokio::time::advance(Duration::from_millis(500)).await;
        // a new trial is admitted and runs into the read timeout
        assert_eq!(reader.read(&s).await, Err(ReadError::Timeout));
        assert_eq!(reader.health(s.id).circuit, CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let reader = RetryingReader::new(
            ScriptedReader::new(vec![fail(), fail()], Ok(42.0)),
            policy(3),
            BreakerConfig::default(),
        );
        let s = sensor();

        assert_eq!(reader.read(&s).await, Ok(42.0));
        assert_eq!(reader.inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(reader.health(s.id), SensorHealth::default());
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_then_half_opens_after_cooldown() {
        let breaker = BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(15),
        };
        let reader = RetryingReader::new(ScriptedReader::new(vec![], fail()), policy(0), breaker);
        let s = sensor();

        assert!(reader.read(&s).await.is_err());
        assert_eq!(reader.health(s.id).circuit, CircuitStatus::Closed);
        assert!(reader.read(&s).await.is_err());

        let health = reader.health(s.id);
        assert_eq!(health.circuit, CircuitStatus::Open);
        assert_eq!(health.status, SensorStatus::Error);
        assert_eq!(health.consecutive_failures, 2);
        assert!(health.error_message.unwrap().contains("i2c nack"));

        // open circuit does not touch the hardware
        assert_eq!(reader.read(&s).await, Err(ReadError::CircuitOpen));
        assert_eq!(reader.inner.calls.load(Ordering::SeqCst), 2);

        // failed trial reopens with a doubled cooldown, capped at 15s
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(reader.read(&s).await, Err(ReadError::Hardware(_))));
        assert_eq!(reader.inner.calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(reader.read(&s).await, Err(ReadError::CircuitOpen));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(reader.read(&s).await, Err(ReadError::Hardware(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes_the_circuit() {
        let breaker = BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
        };
        let reader = RetryingReader::new(
            ScriptedReader::new(vec![fail()], Ok(7.5)),
            policy(0),
            breaker,
        );
        let s = sensor();

        assert!(reader.read(&s).await.is_err());
        assert_eq!(reader.health(s.id).circuit, CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(reader.read(&s).await, Ok(7.5));

        let health = reader.health(s.id);
        assert_eq!(health.circuit, CircuitStatus::Closed);
        assert_eq!(health.status, SensorStatus::Active);
        assert_eq!(health.error_message, None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reads_time_out() {
        struct Stuck;

        #[async_trait]
        impl SensorReader for Stuck {
            async fn read(&self, _sensor: &Sensor) -> Result<f64, ReadError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0.0)
            }
        }

        let reader = RetryingReader::new(Stuck, policy(0), BreakerConfig::default());
        assert_eq!(reader.read(&sensor()).await, Err(ReadError::Timeout));
    }
}
