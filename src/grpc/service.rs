//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::floodgate::admission::v1::{
    admission_service_server::AdmissionService, AdmissionCode, AdmissionRequest,
    AdmissionResponse, ClaimNonceRequest, ClaimNonceResponse, HeaderValue, RuleStatus,
};
use crate::admission;
use crate::error::FloodgateError;
use crate::nonce::NonceRegistry;
use crate::ratelimit::{Decision, IdentifierBundle, Limiter, Millis};
use crate::store::MAX_TTL;

/// Implementation of the AdmissionService gRPC interface.
pub struct AdmissionServiceImpl {
    limiter: Arc<Limiter>,
    nonces: Arc<NonceRegistry>,
}

impl AdmissionServiceImpl {
    pub fn new(limiter: Arc<Limiter>, nonces: Arc<NonceRegistry>) -> Self {
        Self { limiter, nonces }
    }
}

fn code(allowed: bool) -> AdmissionCode {
    if allowed {
        AdmissionCode::Ok
    } else {
        AdmissionCode::OverLimit
    }
}

fn timestamp(ms: Millis) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: (ms / 1_000) as i64,
        nanos: ((ms % 1_000) * 1_000_000) as i32,
    }
}

fn rule_status(decision: &Decision) -> RuleStatus {
    RuleStatus {
        rule: decision.rule.clone(),
        algorithm: decision.algorithm.to_string(),
        dimension: decision.dimension.to_string(),
        code: code(decision.allowed).into(),
        limit: decision.limit,
        remaining: decision.remaining,
        reset_at: Some(timestamp(decision.reset_at_ms)),
        degraded: decision.degraded,
    }
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    /// Decide whether a request carrying the given identifiers may proceed.
    #[instrument(
        skip(self, request),
        fields(identifier_count = request.get_ref().identifiers.len())
    )]
    async fn should_admit(
        &self,
        request: Request<AdmissionRequest>,
    ) -> Result<Response<AdmissionResponse>, Status> {
        let req = request.into_inner();

        let identifiers = IdentifierBundle::from_named(req.identifiers).map_err(|e| {
            warn!(error = %e, "Rejected admission request");
            match e {
                FloodgateError::UnknownDimension(name) => {
                    Status::invalid_argument(format!("unknown identifier dimension: {name}"))
                }
                other => Status::invalid_argument(other.to_string()),
            }
        })?;

        let decision = self.limiter.evaluate(&identifiers).await;
        let now = decision.evaluated_at_ms;

        let response_headers_to_add = admission::rate_limit_headers(&decision, now)
            .into_iter()
            .map(|(key, value)| HeaderValue {
                key: key.to_string(),
                value,
            })
            .collect();

        let retry_after = admission::retry_after(&decision, now)
            .and_then(|wait| prost_types::Duration::try_from(wait).ok());

        let response = AdmissionResponse {
            code: code(decision.allowed).into(),
            binding: decision.binding.as_ref().map(rule_status),
            statuses: decision.decisions.iter().map(rule_status).collect(),
            degraded: decision.degraded,
            retry_after,
            http_status: u32::from(admission::http_status(&decision)),
            response_headers_to_add,
        };

        debug!(
            allowed = decision.allowed,
            rules = decision.decisions.len(),
            degraded = decision.degraded,
            "Admission decision made"
        );

        Ok(Response::new(response))
    }

    #[instrument(skip(self, request))]
    async fn claim_nonce(
        &self,
        request: Request<ClaimNonceRequest>,
    ) -> Result<Response<ClaimNonceResponse>, Status> {
        let req = request.into_inner();

        if req.nonce.is_empty() {
            return Err(Status::invalid_argument("nonce is required"));
        }
        let ttl = req
            .ttl
            .and_then(|ttl| std::time::Duration::try_from(ttl).ok())
            .filter(|ttl| !ttl.is_zero())
            .ok_or_else(|| Status::invalid_argument("ttl must be positive"))?;
        if ttl > MAX_TTL {
            return Err(Status::invalid_argument(format!(
                "ttl must not exceed {}s",
                MAX_TTL.as_secs()
            )));
        }

        let fresh = self.nonces.claim(&req.nonce, ttl).await.map_err(|e| {
            warn!(error = %e, "Nonce claim failed");
            Status::unavailable(e.to_string())
        })?;

        if !fresh {
            info!("Nonce replay rejected");
        }

        Ok(Response::new(ClaimNonceResponse { fresh }))
    }
}
