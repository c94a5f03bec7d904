//! Serialized, cached certificate generation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, error};

use super::expiring::{DEFAULT_SWEEP_INTERVAL, ExpiringMap, SweepTask};
use crate::config::CacheConfig;

/// The external operation that signs a leaf certificate for a host set.
///
/// Implementations are free to block and burn CPU; [`CachedSigner`] runs them
/// on the blocking thread pool, one at a time.
pub trait HostSigner: Send + Sync + 'static {
    /// The credential certificates are signed with.
    type Authority: Send + Sync + 'static;
    /// The signed certificate, including its private key.
    type Certificate: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Signs a certificate covering all `hosts`.
    fn sign(
        &self,
        authority: &Self::Authority,
        hosts: &[String],
    ) -> Result<Self::Certificate, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum SignHostError<E: std::error::Error + 'static> {
    #[error("no hostnames given")]
    NoHosts,
    #[error("timed out waiting for the certificate generation slot")]
    SlotTimeout,
    #[error("certificate cache is shut down")]
    Closed,
    #[error("certificate signer panicked")]
    SignerPanicked,
    #[error(transparent)]
    Signing(E),
}

/// Builds the cache key for a host set: the sorted hostnames joined by `;`.
pub fn canonical_key<H: AsRef<str>>(hosts: &[H]) -> String {
    let mut sorted: Vec<&str> = hosts.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.join(";")
}

/// Certificate cache that generates missing certificates one at a time.
///
/// All host sets share a single generation slot: while one certificate is
/// being signed, every other miss waits, whatever hosts it is for. The slot
/// is held across the cache lookup too, so concurrent callers asking for the
/// same hosts sign exactly once.
pub struct CachedSigner<S: HostSigner> {
    signer: Arc<S>,
    cache: ExpiringMap<S::Certificate>,
    slot: Arc<Semaphore>,
    acquire_timeout: Option<Duration>,
    sweeper: Mutex<Option<SweepTask>>,
}

impl<S: HostSigner> CachedSigner<S> {
    /// Creates a signer whose certificates are cached for `ttl`.
    ///
    /// Spawns the background sweeper, so this must be called within a Tokio
    /// runtime. Slot acquisition waits without a bound.
    pub fn new(signer: S, ttl: Duration) -> Self {
        Self::with_options(signer, ttl, DEFAULT_SWEEP_INTERVAL, None)
    }

    /// Creates a signer from the cache configuration.
    pub fn from_config(signer: S, config: &CacheConfig) -> Self {
        Self::with_options(
            signer,
            config.ttl,
            config.sweep_interval,
            config.acquire_timeout,
        )
    }

    fn with_options(
        signer: S,
        ttl: Duration,
        sweep_interval: Duration,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        let cache = ExpiringMap::new(ttl);
        let sweeper = cache.spawn_sweeper(sweep_interval);

        Self {
            signer: Arc::new(signer),
            cache,
            slot: Arc::new(Semaphore::new(1)),
            acquire_timeout,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Bounds how long [`sign_host`](Self::sign_host) waits for the slot.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Returns the underlying certificate store.
    pub fn cache(&self) -> &ExpiringMap<S::Certificate> {
        &self.cache
    }

    /// Returns a cached certificate for `hosts` without waiting for the slot.
    pub fn lookup<H: AsRef<str>>(&self, hosts: &[H]) -> Option<Arc<S::Certificate>> {
        self.cache.load(&canonical_key(hosts))
    }

    /// Returns a certificate for `hosts`, signing one if none is cached.
    ///
    /// Dropping the returned future while it waits for the slot abandons the
    /// request. Once signing has started it runs to completion and its result
    /// is cached even if the caller has gone away.
    pub async fn sign_host(
        &self,
        authority: &Arc<S::Authority>,
        hosts: &[String],
    ) -> Result<Arc<S::Certificate>, SignHostError<S::Error>> {
        let deadline = self.acquire_timeout.map(|timeout| Instant::now() + timeout);
        self.sign_host_inner(authority, hosts, deadline).await
    }

    /// Like [`sign_host`](Self::sign_host), but gives up with
    /// [`SignHostError::SlotTimeout`] if the slot is not free by `deadline`.
    pub async fn sign_host_with_deadline(
        &self,
        authority: &Arc<S::Authority>,
        hosts: &[String],
        deadline: Instant,
    ) -> Result<Arc<S::Certificate>, SignHostError<S::Error>> {
        self.sign_host_inner(authority, hosts, Some(deadline)).await
    }

    async fn sign_host_inner(
        &self,
        authority: &Arc<S::Authority>,
        hosts: &[String],
        deadline: Option<Instant>,
    ) -> Result<Arc<S::Certificate>, SignHostError<S::Error>> {
        if hosts.is_empty() {
            return Err(SignHostError::NoHosts);
        }

        let mut hosts = hosts.to_vec();
        hosts.sort_unstable();
        let key = hosts.join(";");

        let permit = self.acquire_slot(deadline).await?;

        if let Some(cert) = self.cache.load(&key) {
            debug!(key = %key, "returning cached certificate");
            return Ok(cert);
        }

        debug!(key = %key, "generating fresh certificate");

        let signer = Arc::clone(&self.signer);
        let authority = Arc::clone(authority);
        let cache = self.cache.clone();

        // The permit moves into the blocking task so the slot stays taken
        // until signing finishes, even if this future is dropped.
        let task = tokio::task::spawn_blocking(move || -> Result<_, S::Error> {
            let _permit = permit;
            let cert = Arc::new(signer.sign(&authority, &hosts)?);
            cache.store_arc(key, Arc::clone(&cert));
            Ok(cert)
        });

        match task.await {
            Ok(result) => result.map_err(SignHostError::Signing),
            Err(e) if e.is_panic() => {
                error!("certificate signer panicked");
                Err(SignHostError::SignerPanicked)
            }
            Err(_) => Err(SignHostError::Closed),
        }
    }

    async fn acquire_slot(
        &self,
        deadline: Option<Instant>,
    ) -> Result<OwnedSemaphorePermit, SignHostError<S::Error>> {
        let acquire = Arc::clone(&self.slot).acquire_owned();
        let permit = match deadline {
            Some(deadline) => time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| SignHostError::SlotTimeout)?,
            None => acquire.await,
        };
        permit.map_err(|_| SignHostError::Closed)
    }

    /// Stops the background sweeper and rejects further requests.
    ///
    /// A signing operation already in progress still completes.
    pub async fn shutdown(&self) {
        self.slot.close();

        let sweeper = self.sweeper.lock().ok().and_then(|mut guard| guard.take());
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(2);

    #[derive(Debug, thiserror::Error)]
    #[error("signer refused {0}")]
    struct Refused(String);

    /// Signer that records how often and how concurrently it is called.
    #[derive(Default)]
    struct CountingSigner {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        failures_left: AtomicUsize,
        panic: bool,
        delay: Duration,
    }

    impl CountingSigner {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }
    }

    impl HostSigner for CountingSigner {
        type Authority = ();
        type Certificate = Vec<String>;
        type Error = Refused;

        fn sign(&self, _authority: &(), hosts: &[String]) -> Result<Vec<String>, Refused> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic {
                panic!("signer exploded");
            }
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(Refused(hosts.join(",")));
            }
            Ok(hosts.to_vec())
        }
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn calls(signer: &CachedSigner<CountingSigner>) -> usize {
        signer.signer.calls.load(Ordering::SeqCst)
    }

    /// Tests that the cache key ignores input order.
    #[test]
    fn canonical_key_sorts_and_joins() {
        assert_eq!(canonical_key(&["b.com", "a.com"]), "a.com;b.com");
        assert_eq!(
            canonical_key(&["c.com", "a.com", "b.com"]),
            canonical_key(&["b.com", "c.com", "a.com"])
        );
        assert_eq!(canonical_key(&["only.com"]), "only.com");
    }

    /// Tests that a repeated request returns the cached instance
    /// and only signs once.
    #[tokio::test]
    async fn repeat_request_hits_cache() {
        let signer = CachedSigner::new(CountingSigner::default(), TTL);
        let ca = Arc::new(());

        let first = signer.sign_host(&ca, &hosts(&["a.com"])).await.unwrap();
        let second = signer.sign_host(&ca, &hosts(&["a.com"])).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls(&signer), 1);
    }

    /// Walks through expiry: a permuted request hits the cache, and a request
    /// after the TTL has passed signs again.
    #[tokio::test(start_paused = true)]
    async fn permuted_hit_then_expiry() {
        let signer = CachedSigner::new(CountingSigner::default(), TTL);
        let ca = Arc::new(());

        let first = signer
            .sign_host(&ca, &hosts(&["a.com", "b.com"]))
            .await
            .unwrap();
        assert!(signer.cache().load("a.com;b.com").is_some());

        let second = signer
            .sign_host(&ca, &hosts(&["b.com", "a.com"]))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls(&signer), 1);

        time::advance(Duration::from_secs(3)).await;
        assert!(signer.lookup(&["a.com", "b.com"]).is_none());

        let third = signer
            .sign_host(&ca, &hosts(&["a.com", "b.com"]))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(calls(&signer), 2);
    }

    /// Tests that the signer receives the hosts in canonical order.
    #[tokio::test]
    async fn signer_sees_sorted_hosts() {
        let signer = CachedSigner::new(CountingSigner::default(), TTL);
        let cert = signer
            .sign_host(&Arc::new(()), &hosts(&["z.com", "m.com", "a.com"]))
            .await
            .unwrap();
        assert_eq!(*cert, hosts(&["a.com", "m.com", "z.com"]));
    }

    /// Tests that many concurrent requests for a new host set sign once
    /// and all receive the same certificate.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_sign_once() {
        let signer = Arc::new(CachedSigner::new(
            CountingSigner::with_delay(Duration::from_millis(50)),
            TTL,
        ));
        let ca = Arc::new(());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let signer = Arc::clone(&signer);
                let ca = Arc::clone(&ca);
                tokio::spawn(async move { signer.sign_host(&ca, &hosts(&["x.com", "y.com"])).await })
            })
            .collect();

        let mut certs = Vec::new();
        for task in tasks {
            certs.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls(&signer), 1);
        assert!(certs.iter().all(|c| Arc::ptr_eq(c, &certs[0])));
    }

    /// Tests that requests for different host sets never sign concurrently.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_hosts_are_serialized() {
        let signer = Arc::new(CachedSigner::new(
            CountingSigner::with_delay(Duration::from_millis(20)),
            TTL,
        ));
        let ca = Arc::new(());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let signer = Arc::clone(&signer);
                let ca = Arc::clone(&ca);
                let host = format!("host{i}.com");
                tokio::spawn(async move { signer.sign_host(&ca, &[host]).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(calls(&signer), 8);
        assert!(!signer.signer.overlapped.load(Ordering::SeqCst));
    }

    /// Tests that a signing failure is returned unchanged and not cached,
    /// so the next request signs again and succeeds.
    #[tokio::test]
    async fn failure_does_not_poison_cache() {
        let inner = CountingSigner::default();
        inner.failures_left.store(1, Ordering::SeqCst);
        let signer = CachedSigner::new(inner, TTL);
        let ca = Arc::new(());

        let err = signer
            .sign_host(&ca, &hosts(&["bad.com"]))
            .await
            .unwrap_err();
        match err {
            SignHostError::Signing(Refused(hosts)) => assert_eq!(hosts, "bad.com"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(signer.lookup(&["bad.com"]).is_none());

        let cert = signer.sign_host(&ca, &hosts(&["bad.com"])).await.unwrap();
        assert!(Arc::ptr_eq(&cert, &signer.lookup(&["bad.com"]).unwrap()));
        assert_eq!(calls(&signer), 2);
    }

    /// Tests that an empty host list is rejected without signing.
    #[tokio::test]
    async fn empty_hosts_rejected() {
        let signer = CachedSigner::new(CountingSigner::default(), TTL);
        let err = signer.sign_host(&Arc::new(()), &[]).await.unwrap_err();
        assert!(matches!(err, SignHostError::NoHosts));
        assert_eq!(calls(&signer), 0);
    }

    /// Tests that waiting for a busy slot gives up at the configured timeout
    /// and that the slot is usable again afterwards.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_wait_times_out() {
        let signer = Arc::new(
            CachedSigner::new(CountingSigner::with_delay(Duration::from_millis(300)), TTL)
                .with_acquire_timeout(Duration::from_millis(50)),
        );
        let ca = Arc::new(());

        let slow = {
            let signer = Arc::clone(&signer);
            let ca = Arc::clone(&ca);
            tokio::spawn(async move { signer.sign_host(&ca, &hosts(&["slow.com"])).await })
        };
        time::sleep(Duration::from_millis(50)).await;

        let err = signer
            .sign_host(&ca, &hosts(&["other.com"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SignHostError::SlotTimeout));

        slow.await.unwrap().unwrap();
        let far = Instant::now() + Duration::from_secs(5);
        signer
            .sign_host_with_deadline(&ca, &hosts(&["other.com"]), far)
            .await
            .unwrap();
        assert_eq!(calls(&signer), 2);
    }

    /// Tests that abandoning a request mid-signing still caches the result
    /// and keeps the slot held until signing is done.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_still_caches() {
        let signer = Arc::new(CachedSigner::new(
            CountingSigner::with_delay(Duration::from_millis(200)),
            TTL,
        ));
        let ca = Arc::new(());

        let abandoned = {
            let signer = Arc::clone(&signer);
            let ca = Arc::clone(&ca);
            tokio::spawn(async move { signer.sign_host(&ca, &hosts(&["a.com"])).await })
        };
        time::sleep(Duration::from_millis(50)).await;
        abandoned.abort();

        signer.sign_host(&ca, &hosts(&["a.com"])).await.unwrap();
        assert_eq!(calls(&signer), 1);
        assert!(!signer.signer.overlapped.load(Ordering::SeqCst));
    }

    /// Tests that a panicking signer is reported and releases the slot.
    #[tokio::test]
    async fn signer_panic_releases_slot() {
        let inner = CountingSigner {
            panic: true,
            ..Default::default()
        };
        let signer = CachedSigner::new(inner, TTL).with_acquire_timeout(Duration::from_secs(1));
        let ca = Arc::new(());

        for _ in 0..2 {
            let err = signer.sign_host(&ca, &hosts(&["a.com"])).await.unwrap_err();
            assert!(matches!(err, SignHostError::SignerPanicked));
        }
        assert_eq!(calls(&signer), 2);
    }

    /// Tests that requests after shutdown are rejected.
    #[tokio::test]
    async fn shutdown_rejects_requests() {
        let signer = CachedSigner::new(CountingSigner::default(), TTL);
        signer.shutdown().await;

        let err = signer
            .sign_host(&Arc::new(()), &hosts(&["a.com"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SignHostError::Closed));
    }
}
