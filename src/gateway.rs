use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use ulid::Ulid;

use crate::model::{Money, PaymentMethod};

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Payment id; a gateway must treat repeats of the same key as one charge.
    pub idempotency_key: Ulid,
    pub amount: Money,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approved { transaction_id: String },
    Declined { reason: String },
}

/// The gateway could not give an answer (transport, outage, malformed reply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError(pub String);

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gateway error: {}", self.0)
    }
}

impl std::error::Error for GatewayError {}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError>;
}

pub fn transaction_id() -> String {
    format!("TXN_{:08X}", rand::random::<u32>())
}

/// Stand-in processor: random latency, then approve with a fixed probability.
pub struct SimulatedGateway {
    approval_rate: f64,
    min_delay: Duration,
    max_delay: Duration,
}

impl SimulatedGateway {
    pub fn new(approval_rate: f64, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            approval_rate: approval_rate.clamp(0.0, 1.0),
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(0.9, Duration::from_secs(1), Duration::from_secs(3))
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        let (delay, approved) = {
            let mut rng = rand::thread_rng();
            let delay = if self.max_delay > self.min_delay {
                rng.gen_range(self.min_delay..=self.max_delay)
            } else {
                self.min_delay
            };
            (delay, rng.gen_bool(self.approval_rate))
        };
        tokio::time::sleep(delay).await;

        tracing::debug!(
            payment_id = %request.idempotency_key,
            amount = request.amount,
            method = request.method.as_str(),
            approved,
            "simulated charge"
        );
        if approved {
            Ok(ChargeOutcome::Approved {
                transaction_id: transaction_id(),
            })
        } else {
            Ok(ChargeOutcome::Declined {
                reason: "card declined by issuing bank".into(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Approve,
    Decline,
    Fail,
    /// Never answer; exercises the caller's timeout.
    Hang,
}

/// Deterministic gateway for tests and forced-outcome deployments.
pub struct ScriptedGateway {
    script: Script,
    delay: Duration,
}

impl ScriptedGateway {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
        }
    }

    pub fn approve() -> Self {
        Self::new(Script::Approve)
    }

    pub fn decline() -> Self {
        Self::new(Script::Decline)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, _request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.script {
            Script::Approve => Ok(ChargeOutcome::Approved {
                transaction_id: transaction_id(),
            }),
            Script::Decline => Ok(ChargeOutcome::Declined {
                reason: "card declined by issuing bank".into(),
            }),
            Script::Fail => Err(GatewayError("processor unavailable".into())),
            Script::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChargeRequest {
        ChargeRequest {
            idempotency_key: Ulid::new(),
            amount: 3000.0,
            method: PaymentMethod::CreditCard,
        }
    }

    #[test]
    fn transaction_ids_have_fixed_shape() {
        let id = transaction_id();
        assert_eq!(id.len(), 12);
        assert!(id.starts_with("TXN_"));
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn simulated_extremes_are_deterministic() {
        let always = SimulatedGateway::new(1.0, Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            always.charge(&request()).await,
            Ok(ChargeOutcome::Approved { .. })
        ));
        let never = SimulatedGateway::new(0.0, Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            never.charge(&request()).await,
            Ok(ChargeOutcome::Declined { .. })
        ));
    }

    #[tokio::test]
    async fn simulated_delay_is_bounded() {
        let gw = SimulatedGateway::new(1.0, Duration::from_millis(20), Duration::from_millis(40));
        let started = std::time::Instant::now();
        gw.charge(&request()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn scripted_failure_is_an_error() {
        let gw = ScriptedGateway::new(Script::Fail);
        assert!(gw.charge(&request()).await.is_err());
    }
}
