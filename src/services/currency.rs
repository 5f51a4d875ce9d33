use crate::{config::default_currency_rates, errors::ServiceError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

/// Currency every rate is quoted against.
pub const BASE_CURRENCY: &str = "CLP";

/// Supplies units of the base currency per unit of each currency.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rates(&self) -> Result<HashMap<String, Decimal>, ServiceError>;
}

/// Fixed rate table, typically loaded from configuration.
#[derive(Debug, Clone)]
pub struct StaticRateSource {
    rates: HashMap<String, Decimal>,
}

impl StaticRateSource {
    pub fn new(rates: HashMap<String, Decimal>) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch_rates(&self) -> Result<HashMap<String, Decimal>, ServiceError> {
        Ok(self.rates.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateTable {
    pub base: String,
    pub rates: HashMap<String, Decimal>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conversion {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub converted_amount: Decimal,
    pub rate: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Converts amounts between supported currencies using cached rates.
pub struct CurrencyService {
    source: Arc<dyn RateSource>,
    ttl: ChronoDuration,
    cache: RwLock<Option<RateTable>>,
}

impl CurrencyService {
    pub fn new(source: Arc<dyn RateSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
            cache: RwLock::new(None),
        }
    }

    pub async fn rates(&self) -> RateTable {
        self.rates_at(Utc::now()).await
    }

    /// Current rate table as of `now`, refreshing it once the TTL has passed.
    pub async fn rates_at(&self, now: DateTime<Utc>) -> RateTable {
        {
            let cache = self.cache.read().await;
            if let Some(table) = cache.as_ref() {
                if now - table.fetched_at < self.ttl {
                    return table.clone();
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(table) = cache.as_ref() {
            if now - table.fetched_at < self.ttl {
                return table.clone();
            }
        }

        match self.source.fetch_rates().await {
            Ok(rates) => {
                let table = RateTable {
                    base: BASE_CURRENCY.to_string(),
                    rates: normalize(rates),
                    fetched_at: now,
                };
                debug!(currencies = table.rates.len(), "Currency rates refreshed");
                *cache = Some(table.clone());
                table
            }
            Err(e) => {
                warn!(error = %e, "Currency rate refresh failed");
                match cache.as_ref() {
                    Some(stale) => stale.clone(),
                    None => RateTable {
                        base: BASE_CURRENCY.to_string(),
                        rates: default_currency_rates(),
                        fetched_at: now,
                    },
                }
            }
        }
    }

    pub async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Conversion, ServiceError> {
        self.convert_at(amount, from, to, Utc::now()).await
    }

    #[instrument(skip(self, now))]
    pub async fn convert_at(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversion, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "amount must be greater than 0".to_string(),
            ));
        }

        let from = from.trim().to_ascii_uppercase();
        let to = to.trim().to_ascii_uppercase();
        let table = self.rates_at(now).await;

        let lookup = |code: &str| {
            table
                .rates
                .get(code)
                .copied()
                .filter(|rate| *rate > Decimal::ZERO)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!("Unsupported currency '{}'", code))
                })
        };
        let from_rate = lookup(&from)?;
        let to_rate = lookup(&to)?;

        let too_large =
            || ServiceError::ValidationError("amount is too large to convert".to_string());
        let rate = from_rate.checked_div(to_rate).ok_or_else(too_large)?;
        let converted = amount.checked_mul(rate).ok_or_else(too_large)?;
        Ok(Conversion {
            converted_amount: converted
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            rate: rate.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero),
            from,
            to,
            amount,
            timestamp: table.fetched_at,
        })
    }
}

fn normalize(rates: HashMap<String, Decimal>) -> HashMap<String, Decimal> {
    rates
        .into_iter()
        .map(|(code, rate)| (code.to_ascii_uppercase(), rate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RateSource for CountingSource {
        async fn fetch_rates(&self) -> Result<HashMap<String, Decimal>, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServiceError::ExternalServiceError("rates down".into()));
            }
            Ok(HashMap::from([
                ("usd".to_string(), dec!(900) + Decimal::from(n)),
                ("CLP".to_string(), dec!(1)),
            ]))
        }
    }

    fn service(fail: bool) -> (Arc<CountingSource>, CurrencyService) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail,
        });
        let svc = CurrencyService::new(source.clone(), Duration::from_secs(3600));
        (source, svc)
    }

    #[tokio::test]
    async fn rates_are_cached_until_ttl_expires() {
        let (source, svc) = service(false);
        let t0 = Utc::now();

        let first = svc.rates_at(t0).await;
        let again = svc.rates_at(t0 + ChronoDuration::minutes(59)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.rates.get("USD"), Some(&dec!(900)));
        assert_eq!(again.rates.get("USD"), Some(&dec!(900)));

        let refreshed = svc.rates_at(t0 + ChronoDuration::minutes(61)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.rates.get("USD"), Some(&dec!(901)));
    }

    #[tokio::test]
    async fn failing_source_falls_back_to_builtin_rates() {
        let (_, svc) = service(true);
        let table = svc.rates().await;
        assert_eq!(table.rates.get("USD"), Some(&dec!(800)));
        assert_eq!(table.rates.get("EUR"), Some(&dec!(900)));
    }

    #[tokio::test]
    async fn converts_through_base_currency() {
        let svc = CurrencyService::new(
            Arc::new(StaticRateSource::new(default_currency_rates())),
            Duration::from_secs(3600),
        );

        let usd_to_clp = svc.convert(dec!(100), "usd", "CLP").await.unwrap();
        assert_eq!(usd_to_clp.converted_amount, dec!(80000));
        assert_eq!(usd_to_clp.rate, dec!(800));

        let clp_to_usd = svc.convert(dec!(1000), "CLP", "USD").await.unwrap();
        assert_eq!(clp_to_usd.converted_amount, dec!(1.25));
        assert_eq!(clp_to_usd.rate, dec!(0.0013));

        let usd_to_eur = svc.convert(dec!(9), "USD", "EUR").await.unwrap();
        assert_eq!(usd_to_eur.converted_amount, dec!(8));
    }

    #[tokio::test]
    async fn rejects_unknown_currency_and_non_positive_amounts() {
        let svc = CurrencyService::new(
            Arc::new(StaticRateSource::new(default_currency_rates())),
            Duration::from_secs(3600),
        );
        assert_matches!(
            svc.convert(dec!(10), "USD", "JPY").await,
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            svc.convert(dec!(0), "USD", "CLP").await,
            Err(ServiceError::ValidationError(_))
        );
    }

    #[tokio::test]
    async fn amounts_beyond_decimal_range_are_rejected() {
        let svc = CurrencyService::new(
            Arc::new(StaticRateSource::new(default_currency_rates())),
            Duration::from_secs(3600),
        );
        assert_matches!(
            svc.convert(Decimal::MAX, "USD", "CLP").await,
            Err(ServiceError::ValidationError(_))
        );
        // Same amount in the other direction shrinks and still converts
        assert!(svc.convert(Decimal::MAX, "CLP", "USD").await.is_ok());
    }
}
