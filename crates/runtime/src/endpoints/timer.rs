use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::registry::{EndpointFactory, Feeder, Source};
use crate::uri::Endpoint;
use crate::Error;

/// `timer://<period>` emits a `{tick_id, timestamp}` message every
/// period, starting one period after the route starts. Source only.
pub struct TimerFactory;

impl EndpointFactory for TimerFactory {
    fn source(&self, endpoint: &Endpoint) -> Result<Box<dyn Source>, Error> {
        let period = parse_period(&endpoint.host)?;
        Ok(Box::new(TimerSource { period }))
    }
}

fn parse_period(authority: &str) -> Result<Duration, Error> {
    let period = humantime::parse_duration(authority)
        .map_err(|err| Error::config(format!("invalid timer period '{authority}': {err}")))?;
    if period.is_zero() {
        return Err(Error::config("timer period must be positive"));
    }
    Ok(period)
}

struct TimerSource {
    period: Duration,
}

#[async_trait]
impl Source for TimerSource {
    async fn run(
        self: Box<Self>,
        feed: Feeder,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        // interval_at fires on the fixed schedule start + n * period, so
        // backpressure stalls do not accumulate drift.
        let start = tokio::time::Instant::now() + self.period;
        let mut interval = tokio::time::interval_at(start, self.period);
        let mut tick_id: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    let mut msg = feed.message();
                    msg.set("tick_id", tick_id.into());
                    tick_id += 1;
                    if feed.feed(msg).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_period_parsing() {
        assert_eq!(parse_period("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_period("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_period("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period("2h").unwrap(), Duration::from_secs(7200));

        assert_eq!(parse_period("0s").unwrap_err().kind(), "config");
        assert_eq!(parse_period("fast").unwrap_err().kind(), "config");
    }
}
