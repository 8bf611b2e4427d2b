//! Runtime egress gate: outbound targets must be allowlisted or private.
//!
//! In restricted mode a hostname passes only if it is allowlisted, loopback,
//! a direct private IP (RFC1918, CGNAT, link-local, ULA), or resolves via
//! DNS to exclusively such addresses. Verdicts are cached per
//! `(target, host)` with a TTL; cached denials re-deny without re-resolving.
//!
//! DNS resolution is the gate's only suspension point and goes through an
//! injected [`HostResolver`] so evaluation stays deterministic under test.

// Lock poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::time::Clock;

/// Default TTL of cached egress verdicts.
pub const DEFAULT_EGRESS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Egress posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    /// Every target passes.
    Allow,
    /// Targets must be allowlisted or private.
    Restricted,
}

/// Egress rules assembled by the enclosing configuration layer.
#[derive(Debug, Clone)]
pub struct EgressRules {
    /// The posture.
    pub mode: EgressMode,
    /// Hostnames allowed in restricted mode, lowercase.
    pub allow_hosts: BTreeSet<String>,
}

impl EgressRules {
    /// Creates permissive rules.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            mode: EgressMode::Allow,
            allow_hosts: BTreeSet::new(),
        }
    }

    /// Creates restricted rules with a hostname allowlist.
    #[must_use]
    pub fn restricted<I: IntoIterator<Item = String>>(allow_hosts: I) -> Self {
        Self {
            mode: EgressMode::Restricted,
            allow_hosts: allow_hosts
                .into_iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }
}

/// An egress denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EgressDeny {
    /// The host is neither allowlisted nor private.
    #[error("host '{host}' is not allowlisted and resolves to a public address")]
    HostNotPermitted {
        /// The denied host.
        host: String,
    },

    /// DNS lookup failed; the gate fails closed.
    #[error("host '{host}' could not be resolved: {detail}")]
    Resolution {
        /// The host whose lookup failed.
        host: String,
        /// The lookup error.
        detail: String,
    },
}

/// Resolves a hostname to its addresses.
pub trait HostResolver: Send + Sync {
    /// Resolves `host` to every address it maps to.
    ///
    /// # Errors
    ///
    /// Returns the lookup error text on failure.
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, String>;
}

/// System DNS resolution via the standard library.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, String> {
        (host, 0u16)
            .to_socket_addrs()
            .map(|addrs| addrs.map(|a| a.ip()).collect())
            .map_err(|err| err.to_string())
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (64..128).contains(&octets[1]))
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    let segments = addr.segments();
    addr.is_loopback()
        // ULA fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // Link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
}

/// Returns `true` if the address is loopback, RFC1918, CGNAT, link-local,
/// or a ULA.
#[must_use]
pub fn is_private_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

#[derive(Debug, Clone)]
struct CachedVerdict {
    denial: Option<EgressDeny>,
    cached_at: DateTime<Utc>,
}

/// The egress gate, with its per-target verdict cache.
pub struct EgressGate {
    rules: EgressRules,
    resolver: Arc<dyn HostResolver>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<(String, String), CachedVerdict>>,
}

impl std::fmt::Debug for EgressGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressGate")
            .field("rules", &self.rules)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl EgressGate {
    /// Creates an egress gate with the default cache TTL.
    #[must_use]
    pub fn new(rules: EgressRules, resolver: Arc<dyn HostResolver>, clock: Arc<dyn Clock>) -> Self {
        Self::with_cache_ttl(rules, resolver, clock, DEFAULT_EGRESS_CACHE_TTL)
    }

    /// Creates an egress gate with a custom cache TTL.
    #[must_use]
    pub fn with_cache_ttl(
        rules: EgressRules,
        resolver: Arc<dyn HostResolver>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            rules,
            resolver,
            clock,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Checks an outbound target.
    ///
    /// `target` identifies the upstream (for cache keying); `host` is the
    /// hostname or address being contacted.
    ///
    /// # Errors
    ///
    /// Returns an [`EgressDeny`] when the host is not permitted or its
    /// lookup fails.
    pub fn check(&self, target: &str, host: &str) -> Result<(), EgressDeny> {
        if self.rules.mode == EgressMode::Allow {
            return Ok(());
        }

        let key = (target.to_string(), host.to_lowercase());
        let now = self.clock.now();

        {
            let cache = self.cache.lock().expect("egress cache lock poisoned");
            if let Some(cached) = cache.get(&key) {
                let age = (now - cached.cached_at).to_std().unwrap_or_default();
                if age < self.cache_ttl {
                    return match &cached.denial {
                        None => Ok(()),
                        Some(denial) => Err(denial.clone()),
                    };
                }
            }
        }

        let verdict = self.evaluate(&key.1);
        let denial = verdict.as_ref().err().cloned();
        self.cache
            .lock()
            .expect("egress cache lock poisoned")
            .insert(
                key,
                CachedVerdict {
                    denial,
                    cached_at: now,
                },
            );
        verdict
    }

    fn evaluate(&self, host: &str) -> Result<(), EgressDeny> {
        if host == "localhost" || self.rules.allow_hosts.contains(host) {
            return Ok(());
        }

        if let Ok(addr) = host.parse::<IpAddr>() {
            if is_private_addr(addr) {
                return Ok(());
            }
            return Err(EgressDeny::HostNotPermitted {
                host: host.to_string(),
            });
        }

        let addrs = self
            .resolver
            .resolve(host)
            .map_err(|detail| EgressDeny::Resolution {
                host: host.to_string(),
                detail,
            })?;
        if !addrs.is_empty() && addrs.iter().all(|a| is_private_addr(*a)) {
            debug!(%host, "egress host resolves to private addresses only");
            return Ok(());
        }

        Err(EgressDeny::HostNotPermitted {
            host: host.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::time::ManualClock;

    struct FixedResolver {
        addrs: Result<Vec<IpAddr>, String>,
        calls: AtomicUsize,
    }

    impl FixedResolver {
        fn new(addrs: Result<Vec<IpAddr>, String>) -> Self {
            Self {
                addrs,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl HostResolver for FixedResolver {
        fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.addrs.clone()
        }
    }

    fn gate(resolver: Arc<FixedResolver>, clock: Arc<ManualClock>) -> EgressGate {
        EgressGate::new(
            EgressRules::restricted(vec!["api.anthropic.com".to_string()]),
            resolver,
            clock,
        )
    }

    #[test]
    fn test_allow_mode_passes_everything() {
        let gate = EgressGate::new(
            EgressRules::allow_all(),
            Arc::new(SystemResolver),
            Arc::new(ManualClock::at_wall_clock()),
        );
        assert!(gate.check("upstream", "evil.example.com").is_ok());
    }

    #[test]
    fn test_allowlisted_host_passes_without_resolution() {
        let resolver = Arc::new(FixedResolver::new(Err("should not resolve".to_string())));
        let gate = gate(Arc::clone(&resolver), Arc::new(ManualClock::at_wall_clock()));
        assert!(gate.check("upstream", "api.anthropic.com").is_ok());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_direct_private_ips_pass() {
        let resolver = Arc::new(FixedResolver::new(Ok(vec![])));
        let gate = gate(resolver, Arc::new(ManualClock::at_wall_clock()));
        for host in ["127.0.0.1", "10.1.2.3", "172.16.0.9", "192.168.1.1", "100.64.0.1", "169.254.0.5", "fd00::1", "fe80::1", "::1"] {
            assert!(gate.check("upstream", host).is_ok(), "{host} should pass");
        }
        assert!(gate.check("upstream", "8.8.8.8").is_err());
        assert!(gate.check("upstream", "100.128.0.1").is_err());
    }

    #[test]
    fn test_dns_private_only_passes() {
        let resolver = Arc::new(FixedResolver::new(Ok(vec![
            "10.0.0.1".parse().unwrap(),
            "192.168.0.2".parse().unwrap(),
        ])));
        let gate = gate(resolver, Arc::new(ManualClock::at_wall_clock()));
        assert!(gate.check("upstream", "internal.service").is_ok());
    }

    #[test]
    fn test_dns_mixed_addresses_denied() {
        let resolver = Arc::new(FixedResolver::new(Ok(vec![
            "10.0.0.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
        ])));
        let gate = gate(resolver, Arc::new(ManualClock::at_wall_clock()));
        let err = gate.check("upstream", "mixed.service").unwrap_err();
        assert!(matches!(err, EgressDeny::HostNotPermitted { .. }));
    }

    #[test]
    fn test_dns_failure_denies_with_lookup_error() {
        let resolver = Arc::new(FixedResolver::new(Err("NXDOMAIN".to_string())));
        let gate = gate(resolver, Arc::new(ManualClock::at_wall_clock()));
        let err = gate.check("upstream", "missing.service").unwrap_err();
        assert!(matches!(err, EgressDeny::Resolution { detail, .. } if detail == "NXDOMAIN"));
    }

    #[test]
    fn test_cached_denial_does_not_re_resolve() {
        let resolver = Arc::new(FixedResolver::new(Ok(vec!["8.8.8.8".parse().unwrap()])));
        let clock = Arc::new(ManualClock::at_wall_clock());
        let gate = gate(Arc::clone(&resolver), Arc::clone(&clock));

        assert!(gate.check("upstream", "public.service").is_err());
        assert!(gate.check("upstream", "public.service").is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // Past the TTL the verdict is re-evaluated.
        clock.advance(DEFAULT_EGRESS_CACHE_TTL + Duration::from_secs(1));
        assert!(gate.check("upstream", "public.service").is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
