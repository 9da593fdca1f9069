//! HTTP member calls.
//!
//! [`HttpInvoker`] posts a [`MemberCall`] as JSON to the target member's
//! `/internal/call` endpoint, resolving the address through gossip membership.
//! [`handle_member_call`] is the receiving side.

use super::backoff::send_with_retry;
use super::protocol::ENDPOINT_MEMBER_CALL;
use super::{CallHandler, MemberCall, MemberId, MemberReply, RemoteInvoker};
use crate::error::FabricError;
use crate::membership::service::MembershipService;

use anyhow::Result;
use async_trait::async_trait;
use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;
use std::time::Duration;

pub struct HttpInvoker {
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(membership: Arc<MembershipService>) -> Self {
        Self {
            membership,
            http_client: reqwest::Client::new(),
        }
    }

    async fn send_call(
        &self,
        member: &MemberId,
        call: MemberCall,
        timeout: Duration,
    ) -> Result<MemberReply> {
        let target = self
            .membership
            .get_member(member)
            .ok_or_else(|| anyhow::anyhow!("Member {} not found", member))?;

        let url = format!("http://{}{}", target.http_addr, ENDPOINT_MEMBER_CALL);
        let attempts = if call.is_idempotent() { 3 } else { 1 };

        let response = send_with_retry(attempts, || {
            self.http_client.post(url.clone()).json(&call).timeout(timeout)
        })
        .await?;
        if !response.status().is_success() {
            return Err(FabricError::RemoteCall {
                member: member.clone(),
                reason: format!("{} returned {}", call.name(), response.status()),
            }
            .into());
        }

        let reply: Option<MemberReply> = response.json().await?;
        reply.ok_or_else(|| anyhow::anyhow!("Empty reply to {} from {}", call.name(), member))
    }
}

#[async_trait]
impl RemoteInvoker for HttpInvoker {
    async fn invoke(
        &self,
        member: &MemberId,
        call: MemberCall,
        timeout: Duration,
    ) -> Result<MemberReply> {
        // The outer bound covers retries and backoff sleeps too.
        match tokio::time::timeout(timeout, self.send_call(member, call, timeout)).await {
            Ok(reply) => reply,
            Err(_) => Err(FabricError::Timeout {
                member: member.clone(),
                after: timeout,
            }
            .into()),
        }
    }
}

pub async fn handle_member_call(
    Extension(handler): Extension<Arc<dyn CallHandler>>,
    Json(call): Json<MemberCall>,
) -> (StatusCode, Json<Option<MemberReply>>) {
    let name = call.name();
    tracing::debug!("Received member call {}", name);

    match handler.handle(call).await {
        Ok(reply) => (StatusCode::OK, Json(Some(reply))),
        Err(e) => {
            tracing::error!("Member call {} failed: {}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}
