//! Store client talking JSON-RPC over HTTP to a map proxy.
use anyhow::Context as _;
use async_trait::async_trait;
use failover_concurrency::{ctx, time};
use failover_harness::store::{Store, StoreError};
use jsonrpsee::{
    core::{client::ClientT as _, ClientError},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};

/// Method writing a key: `map_put(map, key, value) -> Option<String>`.
pub const PUT_METHOD: &str = "map_put";
/// Method reading a key: `map_get(map, key) -> Option<String>`.
pub const GET_METHOD: &str = "map_get";
/// Method listing a map: `map_list(map) -> [[key, value]]`.
pub const LIST_METHOD: &str = "map_list";

/// Store accessed through a JSON-RPC proxy exposing a named map.
#[derive(Debug)]
pub struct RpcStore {
    client: HttpClient,
    map: String,
}

impl RpcStore {
    /// Constructs a client of the proxy at `url`, operating on map `map`.
    /// `request_timeout` bounds every request, independently of the context.
    pub fn new(url: &str, map: &str, request_timeout: time::Duration) -> anyhow::Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(url)
            .with_context(|| format!("HttpClientBuilder::build({url:?})"))?;
        Ok(Self {
            client,
            map: map.to_owned(),
        })
    }

    /// Name of the map.
    pub fn map(&self) -> &str {
        &self.map
    }
}

/// Converts a client error into a store error.
pub fn store_error(method: &str, err: ClientError) -> StoreError {
    match err {
        ClientError::RequestTimeout => StoreError::Timeout,
        err => StoreError::Transient(anyhow::Error::new(err).context(method.to_owned())),
    }
}

#[async_trait]
impl Store for RpcStore {
    async fn put(
        &self,
        ctx: &ctx::Ctx,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError> {
        ctx.wait(
            self.client
                .request(PUT_METHOD, rpc_params![&self.map, key, value]),
        )
        .await?
        .map_err(|err| store_error(PUT_METHOD, err))
    }

    async fn get(&self, ctx: &ctx::Ctx, key: &str) -> Result<Option<String>, StoreError> {
        ctx.wait(self.client.request(GET_METHOD, rpc_params![&self.map, key]))
            .await?
            .map_err(|err| store_error(GET_METHOD, err))
    }

    async fn list(&self, ctx: &ctx::Ctx) -> Result<Vec<(String, String)>, StoreError> {
        ctx.wait(self.client.request(LIST_METHOD, rpc_params![&self.map]))
            .await?
            .map_err(|err| store_error(LIST_METHOD, err))
    }
}
