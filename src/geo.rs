use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;

use crate::models::{GeoResult, ResolvedBy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum spacing between outbound lookups, free-tier friendly.
const CALL_DELAY: Duration = Duration::from_millis(100);

/// Location fields as returned by a provider, before they are tagged with
/// which provider answered.
#[derive(Debug, Clone, Default)]
pub struct GeoFields {
    pub country: String,
    pub region: String,
    pub city: String,
    pub organization: String,
}

/// A geolocation lookup service. Providers are interchangeable behind this
/// signature; any failure (transport, non-2xx, bad payload, quota) is an `Err`.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup(&self, ip: &str) -> anyhow::Result<GeoFields>;
}

/// ipinfo.io, the primary provider.
pub struct IpinfoProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct IpinfoPayload {
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    org: Option<String>,
}

impl IpinfoProvider {
    pub fn new(client: reqwest::Client) -> Self {
        IpinfoProvider {
            client,
            base_url: "https://ipinfo.io".to_string(),
        }
    }
}

#[async_trait]
impl GeoProvider for IpinfoProvider {
    fn name(&self) -> &'static str {
        "ipinfo.io"
    }

    async fn lookup(&self, ip: &str) -> anyhow::Result<GeoFields> {
        let url = format!("{}/{}/json", self.base_url, ip);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            bail!("ipinfo.io returned {}", response.status());
        }
        let payload: IpinfoPayload = response.json().await.context("bad ipinfo.io payload")?;
        Ok(GeoFields {
            country: payload.country.unwrap_or_default(),
            region: payload.region.unwrap_or_default(),
            city: payload.city.unwrap_or_default(),
            organization: payload.org.unwrap_or_default(),
        })
    }
}

/// ipwho.is, the fallback provider. Reports quota and lookup errors inside a
/// 200 response via `success: false`.
pub struct IpwhoisProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct IpwhoisPayload {
    success: bool,
    country_code: Option<String>,
    region: Option<String>,
    city: Option<String>,
    connection: Option<IpwhoisConnection>,
}

#[derive(Deserialize)]
struct IpwhoisConnection {
    isp: Option<String>,
    org: Option<String>,
}

impl IpwhoisProvider {
    pub fn new(client: reqwest::Client) -> Self {
        IpwhoisProvider {
            client,
            base_url: "https://ipwho.is".to_string(),
        }
    }
}

#[async_trait]
impl GeoProvider for IpwhoisProvider {
    fn name(&self) -> &'static str {
        "ipwho.is"
    }

    async fn lookup(&self, ip: &str) -> anyhow::Result<GeoFields> {
        let url = format!("{}/{}", self.base_url, ip);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            bail!("ipwho.is returned {}", response.status());
        }
        let payload: IpwhoisPayload = response.json().await.context("bad ipwho.is payload")?;
        if !payload.success {
            bail!("ipwho.is rejected lookup for {ip}");
        }
        let connection = payload.connection.unwrap_or(IpwhoisConnection {
            isp: None,
            org: None,
        });
        Ok(GeoFields {
            country: payload.country_code.unwrap_or_default(),
            region: payload.region.unwrap_or_default(),
            city: payload.city.unwrap_or_default(),
            organization: connection.isp.or(connection.org).unwrap_or_default(),
        })
    }
}

/// Run-scoped IP resolver: primary provider with fallback, each distinct IP
/// looked up at most once, sequential calls spaced by a fixed delay.
///
/// The cache lives and dies with the resolver; every run starts cold.
pub struct GeoResolver {
    primary: Box<dyn GeoProvider>,
    fallback: Box<dyn GeoProvider>,
    cache: HashMap<String, GeoResult>,
    call_delay: Duration,
    calls_made: u64,
}

impl GeoResolver {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_providers(
            Box::new(IpinfoProvider::new(client.clone())),
            Box::new(IpwhoisProvider::new(client)),
            CALL_DELAY,
        ))
    }

    pub fn with_providers(
        primary: Box<dyn GeoProvider>,
        fallback: Box<dyn GeoProvider>,
        call_delay: Duration,
    ) -> Self {
        GeoResolver {
            primary,
            fallback,
            cache: HashMap::new(),
            call_delay,
            calls_made: 0,
        }
    }

    /// Resolve every IP in the set, in sorted order, returning exactly one
    /// entry per IP. Never fails: unresolvable IPs come back all-empty with
    /// `resolved_by = none`.
    pub async fn resolve_all(&mut self, ips: &BTreeSet<String>) -> BTreeMap<String, GeoResult> {
        let mut results = BTreeMap::new();
        for ip in ips {
            let result = self.resolve(ip).await;
            results.insert(ip.clone(), result);
        }
        results
    }

    /// Resolve one IP through the cache and provider chain. Shares the run's
    /// cache and pacing state with `resolve_all`.
    pub async fn resolve(&mut self, ip: &str) -> GeoResult {
        if !is_lookup_candidate(ip) {
            log::warn!("skipping geolocation for malformed IP {ip:?}");
            return GeoResult::unresolved(ip);
        }
        if let Some(cached) = self.cache.get(ip) {
            return cached.clone();
        }

        self.pace().await;
        let result = match self.primary.lookup(ip).await {
            Ok(fields) => geo_result(ip, fields, ResolvedBy::Primary),
            Err(primary_err) => {
                log::warn!("{} failed for {ip}: {primary_err:#}", self.primary.name());
                self.pace().await;
                match self.fallback.lookup(ip).await {
                    Ok(fields) => geo_result(ip, fields, ResolvedBy::Fallback),
                    Err(fallback_err) => {
                        log::warn!("{} failed for {ip}: {fallback_err:#}", self.fallback.name());
                        GeoResult::unresolved(ip)
                    }
                }
            }
        };

        // Failures are cached too, so a repeating bad IP costs one lookup pair.
        self.cache.insert(ip.to_string(), result.clone());
        result
    }

    /// Space outbound calls; the delay applies whether the previous call
    /// succeeded or failed.
    async fn pace(&mut self) {
        if self.calls_made > 0 && !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        self.calls_made += 1;
    }
}

fn geo_result(ip: &str, fields: GeoFields, resolved_by: ResolvedBy) -> GeoResult {
    GeoResult {
        ip: ip.to_string(),
        country: fields.country,
        region: fields.region,
        city: fields.city,
        organization: fields.organization,
        resolved_by,
    }
}

/// Only well-formed IP addresses go out on the wire.
fn is_lookup_candidate(ip: &str) -> bool {
    ip.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StaticProvider {
        calls: Arc<AtomicUsize>,
        city: &'static str,
    }

    #[async_trait]
    impl GeoProvider for StaticProvider {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn lookup(&self, _ip: &str) -> anyhow::Result<GeoFields> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeoFields {
                country: "US".to_string(),
                region: "Vermont".to_string(),
                city: self.city.to_string(),
                organization: "Example ISP".to_string(),
            })
        }
    }

    struct FailingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GeoProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn lookup(&self, ip: &str) -> anyhow::Result<GeoFields> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("no answer for {ip}")
        }
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    fn ips(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(StaticProvider {
                calls: primary_calls.clone(),
                city: "Burlington",
            }),
            Box::new(FailingProvider {
                calls: fallback_calls.clone(),
            }),
            Duration::ZERO,
        );

        let results = resolver.resolve_all(&ips(&["1.2.3.4"])).await;
        let result = &results["1.2.3.4"];
        assert_eq!(result.resolved_by, ResolvedBy::Primary);
        assert_eq!(result.city, "Burlington");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_ip_is_looked_up_once() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(StaticProvider {
                calls: primary_calls.clone(),
                city: "Burlington",
            }),
            Box::new(FailingProvider {
                calls: fallback_calls,
            }),
            Duration::ZERO,
        );

        resolver.resolve_all(&ips(&["1.2.3.4"])).await;
        let again = resolver.resolve_all(&ips(&["1.2.3.4"])).await;
        assert_eq!(again.len(), 1);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_answers_when_primary_fails() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(FailingProvider {
                calls: primary_calls.clone(),
            }),
            Box::new(StaticProvider {
                calls: fallback_calls.clone(),
                city: "Montpelier",
            }),
            Duration::ZERO,
        );

        let results = resolver.resolve_all(&ips(&["5.6.7.8"])).await;
        let result = &results["5.6.7.8"];
        assert_eq!(result.resolved_by, ResolvedBy::Fallback);
        assert_eq!(result.city, "Montpelier");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn total_failure_degrades_and_is_cached() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(FailingProvider {
                calls: primary_calls.clone(),
            }),
            Box::new(FailingProvider {
                calls: fallback_calls.clone(),
            }),
            Duration::ZERO,
        );

        let results = resolver.resolve_all(&ips(&["9.9.9.9"])).await;
        let result = &results["9.9.9.9"];
        assert_eq!(result.resolved_by, ResolvedBy::None);
        assert!(result.country.is_empty());
        assert!(result.organization.is_empty());

        // The failure is terminal for the run; no re-lookup.
        resolver.resolve_all(&ips(&["9.9.9.9"])).await;
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_ips_never_hit_the_network() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(StaticProvider {
                calls: primary_calls.clone(),
                city: "Burlington",
            }),
            Box::new(FailingProvider {
                calls: fallback_calls,
            }),
            Duration::ZERO,
        );

        let results = resolver
            .resolve_all(&ips(&["", "not-an-ip", "999.0.0.1"]))
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.resolved_by == ResolvedBy::None));
        assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_calls_are_spaced_by_the_delay() {
        let (primary_calls, fallback_calls) = counters();
        let delay = Duration::from_millis(100);
        let mut resolver = GeoResolver::with_providers(
            Box::new(FailingProvider {
                calls: primary_calls.clone(),
            }),
            Box::new(StaticProvider {
                calls: fallback_calls.clone(),
                city: "Barre",
            }),
            delay,
        );

        let started = tokio::time::Instant::now();
        resolver.resolve_all(&ips(&["1.2.3.4", "5.6.7.8"])).await;

        // Four outbound calls (primary then fallback per IP) and three gaps:
        // the spacing applies after failures and carries across IPs.
        assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), delay * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_and_malformed_ips_do_not_pace() {
        let (primary_calls, fallback_calls) = counters();
        let delay = Duration::from_millis(100);
        let mut resolver = GeoResolver::with_providers(
            Box::new(StaticProvider {
                calls: primary_calls,
                city: "Burlington",
            }),
            Box::new(FailingProvider {
                calls: fallback_calls,
            }),
            delay,
        );

        resolver.resolve_all(&ips(&["1.2.3.4"])).await;
        let started = tokio::time::Instant::now();
        resolver.resolve_all(&ips(&["1.2.3.4", "not-an-ip"])).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn single_ip_resolution_shares_the_run_cache() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(StaticProvider {
                calls: primary_calls.clone(),
                city: "Burlington",
            }),
            Box::new(FailingProvider {
                calls: fallback_calls,
            }),
            Duration::ZERO,
        );

        let first = resolver.resolve("1.2.3.4").await;
        assert_eq!(first.resolved_by, ResolvedBy::Primary);

        let results = resolver.resolve_all(&ips(&["1.2.3.4"])).await;
        assert_eq!(results["1.2.3.4"], first);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_entry_per_requested_ip() {
        let (primary_calls, fallback_calls) = counters();
        let mut resolver = GeoResolver::with_providers(
            Box::new(StaticProvider {
                calls: primary_calls,
                city: "Burlington",
            }),
            Box::new(FailingProvider {
                calls: fallback_calls,
            }),
            Duration::ZERO,
        );

        let requested = ips(&["1.1.1.1", "8.8.8.8", "bogus"]);
        let results = resolver.resolve_all(&requested).await;
        assert_eq!(results.len(), requested.len());
        for ip in &requested {
            assert_eq!(results[ip].ip, *ip);
        }
    }
}
