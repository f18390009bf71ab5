//! Shim over the view-syncer seam.
//!
//! The IVM query-pipeline hydrator is a separate subsystem; until it is
//! wired in, connections get a baseline poke confirming their cookie and a
//! stream that stays open (pokes arrive once the hydrator feeds it). Query
//! transformation runs for real through the user's get-queries endpoint, so
//! authorization failures surface before hydration.

use std::sync::Arc;

use async_trait::async_trait;
use errors::ProtocolError;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use sync::{
    QueryTransformer,
    TransformerConfig,
};
use sync_types::{
    ChangeDesiredQueriesBody,
    ConnectParams,
    DeleteClientsBody,
    DownstreamMessage,
    InitConnectionBody,
    PokeEndBody,
    PokeStartBody,
    TransformRequestEntry,
    TransformResponse,
};

use crate::config::ZeroConfig;

pub struct BaselineViewSyncer {
    transformer: QueryTransformer,
}

impl BaselineViewSyncer {
    pub fn new(config: &ZeroConfig, fetch: Arc<dyn sync::FetchClient>) -> Arc<Self> {
        let transformer_config: TransformerConfig = config.transformer_config();
        Arc::new(Self {
            transformer: QueryTransformer::new(transformer_config, fetch),
        })
    }

    /// Pull the custom (named) queries out of a desired-queries patch; those
    /// are the ones the user API must rewrite before hydration.
    fn transform_entries(patch: &JsonValue) -> Vec<TransformRequestEntry> {
        let Some(ops) = patch.as_array() else {
            return Vec::new();
        };
        ops.iter()
            .filter(|op| op.get("op").and_then(JsonValue::as_str) == Some("put"))
            .filter_map(|op| {
                let name = op.get("name")?.as_str()?.to_owned();
                let id = op.get("hash")?.as_str()?.to_owned();
                let args = op.get("args").cloned().unwrap_or(JsonValue::Null);
                Some(TransformRequestEntry { id, name, args })
            })
            .collect()
    }

    async fn transform_patch(&self, patch: &JsonValue) -> anyhow::Result<()> {
        let entries = Self::transform_entries(patch);
        if entries.is_empty() {
            return Ok(());
        }
        match self.transformer.transform(None, None, entries).await? {
            Ok(TransformResponse::Transformed(transformed)) => {
                tracing::debug!("Transformed {} queries", transformed.len());
                Ok(())
            },
            Ok(TransformResponse::TransformFailed(body)) | Err(body) => {
                Err(ProtocolError::new(body).into())
            },
        }
    }
}

#[async_trait]
impl sync::ViewSyncer for BaselineViewSyncer {
    async fn init_connection(
        &self,
        params: &ConnectParams,
        body: InitConnectionBody,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<DownstreamMessage>>> {
        if let Some(patch) = &body.desired_queries_patch {
            self.transform_patch(patch).await?;
        }
        let cookie = params.base_cookie.clone().unwrap_or_else(|| "00".to_owned());
        let poke_id = uuid::Uuid::new_v4().to_string();
        let baseline = vec![
            Ok(DownstreamMessage::PokeStart(PokeStartBody {
                poke_id: poke_id.clone(),
                base_cookie: params.base_cookie.clone(),
                schema_versions: None,
            })),
            Ok(DownstreamMessage::PokeEnd(PokeEndBody { poke_id, cookie })),
        ];
        Ok(Box::pin(futures::stream::select(
            futures::stream::iter(baseline),
            futures::stream::pending(),
        )))
    }

    async fn change_desired_queries(
        &self,
        params: &ConnectParams,
        body: ChangeDesiredQueriesBody,
    ) -> anyhow::Result<()> {
        tracing::debug!("Desired-query patch from {}", params.client_id);
        self.transform_patch(&body.desired_queries_patch).await
    }

    async fn delete_clients(
        &self,
        _params: &ConnectParams,
        body: DeleteClientsBody,
    ) -> anyhow::Result<()> {
        tracing::info!("Deleting clients {:?}", body.client_ids);
        Ok(())
    }
}
