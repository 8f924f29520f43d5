use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Country recorded when the visitor's location cannot be determined.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// IP -> country name lookup.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// `None` when the address cannot be located.
    async fn country(&self, ip: &str) -> Option<String>;
}

/// Resolve `ip` to a country name, never taking longer than `timeout`.
/// Missing addresses, lookup failures and timeouts all yield [`UNKNOWN_COUNTRY`].
pub async fn resolve_country(
    locator: &dyn GeoLocator,
    ip: Option<&str>,
    timeout: Duration,
) -> String {
    let Some(ip) = ip else {
        return UNKNOWN_COUNTRY.to_owned();
    };

    match tokio::time::timeout(timeout, locator.country(ip)).await {
        Ok(Some(country)) => country,
        Ok(None) => UNKNOWN_COUNTRY.to_owned(),
        Err(_) => {
            tracing::debug!("geo lookup for {} timed out after {:?}", ip, timeout);
            UNKNOWN_COUNTRY.to_owned()
        }
    }
}

// ── ip-api.com ─────────────────────────────────────────────────────────────

/// How long a lookup answer is reused before asking the endpoint again.
const GEO_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// Most addresses kept in the lookup cache.
const GEO_CACHE_MAX_CAPACITY: u64 = 10_000;

/// Looks addresses up against an ip-api.com compatible JSON endpoint.
///
/// Answers from the endpoint, including "no data for this address", are
/// cached per IP for [`GEO_CACHE_TTL`]. Transport and HTTP errors are not
/// cached, so the next visit from the same address retries.
pub struct IpApiLocator {
    client: reqwest::Client,
    base_url: String,
    cache: Cache<String, Option<String>>,
}

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    country: Option<String>,
}

impl IpApiLocator {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let cache = Cache::builder()
            .time_to_live(GEO_CACHE_TTL)
            .max_capacity(GEO_CACHE_MAX_CAPACITY)
            .build();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            cache,
        })
    }

    async fn fetch_country(&self, ip: &str) -> Result<Option<String>, reqwest::Error> {
        let url = format!("{}/{}?fields=status,country", self.base_url, ip);

        let body: IpApiResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if body.status != "success" {
            tracing::debug!("geo lookup returned non-success status for {}", ip);
            return Ok(None);
        }

        Ok(body.country.filter(|s| !s.is_empty()))
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn country(&self, ip: &str) -> Option<String> {
        if is_private(ip) {
            return None;
        }

        // Concurrent misses for one address share a single request.
        self.cache
            .try_get_with(ip.to_owned(), self.fetch_country(ip))
            .await
            .unwrap_or_else(|e| {
                tracing::debug!("geo lookup failed for {}: {}", ip, e);
                None
            })
    }
}

/// Return `true` for addresses that should never be sent to a public
/// geolocation API: loopback, link-local, private ranges, and IPv6 special
/// addresses.
fn is_private(ip_str: &str) -> bool {
    // Strip IPv6-mapped IPv4 prefix: "::ffff:1.2.3.4" -> "1.2.3.4"
    let ip_str = ip_str.strip_prefix("::ffff:").unwrap_or(ip_str);

    match IpAddr::from_str(ip_str) {
        Ok(IpAddr::V4(addr)) => {
            let octets = addr.octets();
            addr.is_loopback()
                || addr.is_link_local()
                || addr.is_unspecified()
                || addr.is_broadcast()
                || octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
        }
        Ok(IpAddr::V6(addr)) => {
            addr.is_loopback()
                || addr.is_unspecified()
                // fe80::/10  link-local
                || (addr.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7   unique-local
                || (addr.segments()[0] & 0xfe00) == 0xfc00
        }
        Err(_) => true,
    }
}
