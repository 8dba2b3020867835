//! Connection-context cache with idle eviction.
//!
//! One live connection is kept per target fingerprint. Callers borrow a
//! handle for the duration of one call; a background sweeper closes handles
//! that have been idle longer than the configured threshold.
//!
//! The map lock is only ever held for bookkeeping. Connecting, liveness
//! checks and closing all happen outside of it.

use crate::constants::{DEFAULT_IDLE_THRESHOLD, DEFAULT_SWEEP_INTERVAL};
use crate::database::{Connection, Driver};
use crate::error::ServerError;
use crate::request::{Fingerprint, RequestConfig};
use crate::shutdown::ShutdownSignal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A cached connection for one target.
pub struct ConnectionHandle {
    fingerprint: Fingerprint,
    connection: Arc<dyn Connection>,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl ConnectionHandle {
    fn new(fingerprint: Fingerprint, connection: Arc<dyn Connection>, now: Instant) -> Self {
        Self {
            fingerprint,
            connection,
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Record a use. Never moves `last_used` backwards.
    pub fn touch(&self, now: Instant) {
        let mut last_used = self.last_used.lock();
        if now > *last_used {
            *last_used = now;
        }
    }

    /// Time since the last use.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        self.idle_for(now) > threshold
    }

    /// Whether the connection can still serve calls.
    pub async fn is_usable(&self) -> bool {
        self.connection.is_alive().await
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.connection.close().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("fingerprint", &self.fingerprint.short())
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used())
            .finish()
    }
}

/// Timing of the idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub sweep_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

impl CacheSettings {
    /// The threshold must exceed the interval, otherwise handles could be
    /// evicted between two uses that are closer together than one tick.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.sweep_interval.is_zero() {
            return Err(ServerError::config("Sweep interval must be greater than zero"));
        }
        if self.idle_threshold <= self.sweep_interval {
            return Err(ServerError::config(format!(
                "Idle threshold ({}s) must be larger than the sweep interval ({}s)",
                self.idle_threshold.as_secs_f64(),
                self.sweep_interval.as_secs_f64()
            )));
        }
        Ok(())
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Acquires served by an existing, live handle.
    pub hits: u64,

    /// Acquires that had to open a connection.
    pub misses: u64,

    /// Connections opened by the driver.
    pub opened: u64,

    /// Handles found dead and replaced.
    pub stale_replaced: u64,

    /// Handles removed by the idle sweep.
    pub evictions: u64,

    /// Closes that reported an error.
    pub close_failures: u64,

    /// Handles currently cached.
    pub entry_count: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cached, {:.1}% hit rate, {} opened, {} stale replaced, {} evicted, {} close failures",
            self.entry_count,
            self.hit_rate(),
            self.opened,
            self.stale_replaced,
            self.evictions,
            self.close_failures
        )
    }
}

/// Fingerprint-keyed cache of live connections.
pub struct ConnectionCache {
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    entries: Mutex<HashMap<Fingerprint, Arc<ConnectionHandle>>>,
    stats: Mutex<CacheStats>,
}

impl ConnectionCache {
    /// Create a cache using the system clock.
    pub fn new(driver: Arc<dyn Driver>, settings: CacheSettings) -> Result<Self, ServerError> {
        settings.validate()?;
        Ok(Self {
            driver,
            clock: Arc::new(SystemClock),
            settings,
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    /// Get the handle for a call's target, opening a connection if needed.
    ///
    /// Connection failures propagate as `ServerError::Connection`; nothing is
    /// retried.
    pub async fn acquire(
        &self,
        config: &RequestConfig,
    ) -> Result<Arc<ConnectionHandle>, ServerError> {
        let fingerprint = config.fingerprint();

        let existing = {
            let entries = self.entries.lock();
            entries.get(fingerprint).map(|handle| {
                handle.touch(self.clock.now());
                Arc::clone(handle)
            })
        };

        if let Some(handle) = existing {
            if handle.is_usable().await {
                self.stats.lock().hits += 1;
                return Ok(handle);
            }

            let removed = {
                let mut entries = self.entries.lock();
                let same = entries
                    .get(fingerprint)
                    .is_some_and(|current| Arc::ptr_eq(current, &handle));
                if same {
                    entries.remove(fingerprint);
                }
                same
            };
            if removed {
                info!("Replacing stale connection {}", fingerprint.short());
                self.stats.lock().stale_replaced += 1;
                self.close_handle(&handle).await;
            }
        }

        self.stats.lock().misses += 1;
        let connection = self
            .driver
            .connect(config.descriptor(), config.options())
            .await?;
        self.stats.lock().opened += 1;

        let now = self.clock.now();
        let fresh = Arc::new(ConnectionHandle::new(fingerprint.clone(), connection, now));

        let (handle, redundant) = {
            let mut entries = self.entries.lock();
            match entries.get(fingerprint).cloned() {
                Some(current) => {
                    current.touch(now);
                    (current, Some(fresh))
                }
                None => {
                    entries.insert(fingerprint.clone(), Arc::clone(&fresh));
                    (fresh, None)
                }
            }
        };

        match redundant {
            Some(extra) => {
                debug!(
                    "Connection {} was opened concurrently, discarding duplicate",
                    fingerprint.short()
                );
                self.close_handle(&extra).await;
            }
            None => info!("Opened connection {}", fingerprint.short()),
        }

        Ok(handle)
    }

    /// Evict and close every handle idle for longer than the threshold.
    ///
    /// Returns the number of evicted handles. Close failures are logged.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let threshold = self.settings.idle_threshold;

        let evicted: Vec<Arc<ConnectionHandle>> = {
            let mut entries = self.entries.lock();
            let idle: Vec<Fingerprint> = entries
                .iter()
                .filter(|(_, handle)| handle.is_idle(now, threshold))
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect();
            idle.iter().filter_map(|fp| entries.remove(fp)).collect()
        };

        for handle in &evicted {
            debug!(
                "Evicting connection {} idle for {:?}",
                handle.fingerprint().short(),
                handle.idle_for(now)
            );
            self.close_handle(handle).await;
        }

        if !evicted.is_empty() {
            self.stats.lock().evictions += evicted.len() as u64;
        }
        evicted.len()
    }

    /// Remove and close every handle.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<ConnectionHandle>> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &drained {
            self.close_handle(handle).await;
        }
        drained.len()
    }

    async fn close_handle(&self, handle: &ConnectionHandle) {
        if let Err(e) = handle.close().await {
            warn!(
                "Failed to close connection {}: {}",
                handle.fingerprint().short(),
                e
            );
            self.stats.lock().close_failures += 1;
        }
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.entry_count = self.len();
        stats
    }
}

/// Shared cache type.
pub type SharedCache = Arc<ConnectionCache>;

/// Start the periodic idle sweep. The task exits when `shutdown` fires.
pub fn spawn_sweeper(cache: SharedCache, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cache.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Idle sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = cache.sweep().await;
                    if evicted > 0 {
                        info!("Idle sweep closed {} connection(s)", evicted);
                    }
                    debug!("Connection cache: {}", cache.stats());
                }
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::test_clock::ManualClock;
    use super::*;
    use crate::database::testing::FakeDriver;
    use crate::request::ConfigSource;
    use crate::shutdown::ShutdownController;

    const SWEEP: Duration = Duration::from_secs(60);
    const IDLE: Duration = Duration::from_secs(600);

    fn request(descriptor: &str) -> RequestConfig {
        let mut vars = HashMap::new();
        vars.insert("DB_URL".to_string(), descriptor.to_string());
        RequestConfig::resolve(ConfigSource::Environment(vars)).unwrap()
    }

    fn cache_with(driver: Arc<FakeDriver>, clock: Arc<ManualClock>) -> ConnectionCache {
        ConnectionCache::new(
            driver,
            CacheSettings {
                sweep_interval: SWEEP,
                idle_threshold: IDLE,
            },
        )
        .unwrap()
        .with_clock(clock)
    }

    #[tokio::test]
    async fn test_repeated_acquire_reuses_handle() {
        let driver = FakeDriver::new();
        let cache = cache_with(driver.clone(), Arc::new(ManualClock::new()));
        let config = request("server=a");

        let first = cache.acquire(&config).await.unwrap();
        let second = cache.acquire(&config).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.opened(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entry_count), (1, 1, 1));
        assert_eq!(stats.hit_rate(), 50.0);
    }

    #[test]
    fn test_stats_summary() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            opened: 1,
            entry_count: 1,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "1 cached, 75.0% hit rate, 1 opened, 0 stale replaced, 0 evicted, 0 close failures"
        );
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_distinct_targets_get_distinct_handles() {
        let driver = FakeDriver::new();
        let cache = cache_with(driver.clone(), Arc::new(ManualClock::new()));

        let a = cache.acquire(&request("server=a")).await.unwrap();
        let b = cache.acquire(&request("server=b")).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(driver.opened(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_handle_is_replaced_and_closed() {
        let driver = FakeDriver::new();
        let cache = cache_with(driver.clone(), Arc::new(ManualClock::new()));
        let config = request("server=a");

        let first = cache.acquire(&config).await.unwrap();
        driver.connections()[0].set_alive(false);

        let second = cache.acquire(&config).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(driver.opened(), 2);
        assert!(driver.connections()[0].is_closed());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().stale_replaced, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_and_caches_nothing() {
        let driver = FakeDriver::new();
        driver.set_fail_connect(true);
        let cache = cache_with(driver.clone(), Arc::new(ManualClock::new()));

        let err = cache.acquire(&request("server=a")).await.unwrap_err();
        assert!(matches!(err, ServerError::Connection { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_and_keeps_touched() {
        let driver = FakeDriver::new();
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(driver.clone(), clock.clone());

        cache.acquire(&request("server=idle")).await.unwrap();
        cache.acquire(&request("server=busy")).await.unwrap();

        clock.advance(Duration::from_secs(400));
        cache.acquire(&request("server=busy")).await.unwrap();
        clock.advance(Duration::from_secs(300));

        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len(), 1);
        assert!(driver.connections()[0].is_closed());
        assert!(!driver.connections()[1].is_closed());

        // the busy handle is idle for exactly 300s, below the threshold
        assert_eq!(cache.sweep().await, 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_idle_exactly_at_threshold_is_kept() {
        let driver = FakeDriver::new();
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(driver, clock.clone());

        cache.acquire(&request("server=a")).await.unwrap();
        clock.advance(IDLE);
        assert_eq!(cache.sweep().await, 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_close_failures() {
        let driver = FakeDriver::new();
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(driver.clone(), clock.clone());

        cache.acquire(&request("server=a")).await.unwrap();
        cache.acquire(&request("server=b")).await.unwrap();
        driver.connections()[0].set_fail_close(true);

        clock.advance(IDLE + Duration::from_secs(1));
        assert_eq!(cache.sweep().await, 2);
        assert!(driver.connections().iter().all(|c| c.is_closed()));
        assert_eq!(cache.stats().close_failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_open_keeps_one_handle() {
        let driver = FakeDriver::new();
        driver.set_connect_delay(Duration::from_millis(20));
        let cache = cache_with(driver.clone(), Arc::new(ManualClock::new()));
        let config = request("server=a");

        let (a, b) = tokio::join!(cache.acquire(&config), cache.acquire(&config));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(driver.opened(), 2);
        assert_eq!(cache.len(), 1);
        let closed = driver.connections().iter().filter(|c| c.is_closed()).count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_close_all_drains() {
        let driver = FakeDriver::new();
        let cache = cache_with(driver.clone(), Arc::new(ManualClock::new()));
        cache.acquire(&request("server=a")).await.unwrap();
        cache.acquire(&request("server=b")).await.unwrap();

        assert_eq!(cache.close_all().await, 2);
        assert!(cache.is_empty());
        assert!(driver.connections().iter().all(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn test_touch_never_moves_backwards() {
        let clock = ManualClock::new();
        let start = clock.now();
        let conn = FakeDriver::new()
            .connect("server=a", &crate::request::DriverOptions::default())
            .await
            .unwrap();
        let handle = ConnectionHandle::new(Fingerprint::of("x"), conn, start);

        handle.touch(start + Duration::from_secs(5));
        handle.touch(start + Duration::from_secs(1));
        assert_eq!(handle.last_used(), start + Duration::from_secs(5));
    }

    #[test]
    fn test_settings_validation() {
        let settings = CacheSettings {
            sweep_interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(60),
        };
        assert!(matches!(settings.validate(), Err(ServerError::Config(_))));
        assert!(CacheSettings::default().validate().is_ok());

        let err = ConnectionCache::new(FakeDriver::new(), settings).err();
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops_on_shutdown() {
        let driver = FakeDriver::new();
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(
            ConnectionCache::new(
                driver.clone(),
                CacheSettings {
                    sweep_interval: Duration::from_millis(10),
                    idle_threshold: Duration::from_millis(20),
                },
            )
            .unwrap()
            .with_clock(clock.clone()),
        );
        cache.acquire(&request("server=a")).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let controller = ShutdownController::new();
        let sweeper = spawn_sweeper(cache.clone(), controller.signal());

        for _ in 0..100 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.is_empty());

        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
