//! HTTP readiness probing
//!
//! A workload that just came up refuses connections for a while before it
//! serves traffic; that window is "not ready yet", not a failure. Which other
//! conditions count as transient is policy, not hard-coded, because the line
//! between "still starting" and "broken" differs per workload.

use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::poll::{Poller, Step};

/// Classification of non-success observations during a probe.
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    /// Keep polling through connection refused/reset
    pub retry_connect_errors: bool,

    /// Keep polling when a request exceeds `request_timeout`
    pub retry_request_timeouts: bool,

    /// Keep polling when the endpoint answers with a different status;
    /// when false the first wrong status fails the probe
    pub retry_unexpected_status: bool,

    /// Per-request timeout, independent of the overall probe deadline
    pub request_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            retry_connect_errors: true,
            retry_request_timeouts: true,
            retry_unexpected_status: true,
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Polls an HTTP endpoint until it answers with an expected status.
pub struct HttpProber {
    client: reqwest::blocking::Client,
    policy: ProbePolicy,
}

impl HttpProber {
    pub fn new() -> Result<Self> {
        Self::with_policy(ProbePolicy::default())
    }

    pub fn with_policy(policy: ProbePolicy) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(policy.request_timeout)
            .build()?;
        Ok(Self { client, policy })
    }

    /// GET `url` every `interval` until it answers `expected_status`, then
    /// return that response's body. Errors the policy does not class as
    /// transient fail the probe immediately; the deadline yields
    /// [`Error::ReadinessTimeout`] carrying the last observation.
    pub fn get_until(
        &self,
        url: &str,
        expected_status: u16,
        timeout: Duration,
        interval: Duration,
    ) -> Result<String> {
        let poller = Poller::new();
        let outcome = poller.poll(timeout, interval, || {
            match self.client.get(url).send() {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == expected_status {
                        match response.text() {
                            Ok(body) => Step::Done(body),
                            Err(err) => Step::Abort(Error::Http(err)),
                        }
                    } else if self.policy.retry_unexpected_status {
                        Step::Retry(format!("status {status} (want {expected_status})"))
                    } else {
                        Step::Abort(Error::ProbeFailed {
                            url: url.to_string(),
                            reason: format!("status {status} (want {expected_status})"),
                        })
                    }
                }
                Err(err) if err.is_connect() && self.policy.retry_connect_errors => {
                    Step::Retry(format!("connection not ready: {err}"))
                }
                Err(err) if err.is_timeout() && self.policy.retry_request_timeouts => {
                    Step::Retry(format!("request timed out: {err}"))
                }
                Err(err) => Step::Abort(Error::Http(err)),
            }
        });

        match outcome {
            Ok((body, elapsed)) => {
                debug!(url, ?elapsed, "endpoint ready");
                Ok(body)
            }
            Err(Error::PollTimeout { waited, last }) => Err(Error::ReadinessTimeout {
                url: url.to_string(),
                waited,
                last,
            }),
            Err(err) => Err(err),
        }
    }
}

/// One-shot probe with the default policy.
pub fn get_until(
    url: &str,
    expected_status: u16,
    timeout: Duration,
    interval: Duration,
) -> Result<String> {
    HttpProber::new()?.get_until(url, expected_status, timeout, interval)
}
