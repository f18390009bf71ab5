use std::env;

use common::url_pattern::UrlAllowList;
use sync::{
    PusherConfig,
    TransformerConfig,
};

/// Server configuration, read from the environment once at startup and
/// passed to every worker (workers inherit the supervisor's environment).
#[derive(Debug, Clone)]
pub struct ZeroConfig {
    pub listen_addr: String,
    pub replica_path: String,
    pub app_id: String,
    pub upstream_schema: String,
    pub push_url: String,
    pub get_queries_url: String,
    pub api_key: Option<String>,
    pub forward_cookies: bool,
    pub allowed_push_urls: UrlAllowList,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("Missing required environment variable {name}"))
}

impl ZeroConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let push_url = required("ZERO_PUSH_URL")?;
        let allow_list_spec = env::var("ZERO_PUSH_URL_ALLOW_LIST").unwrap_or_default();
        let allowed_push_urls = UrlAllowList::parse(
            allow_list_spec.split(',').filter(|p| !p.is_empty()),
        )?;
        Ok(Self {
            listen_addr: env::var("ZERO_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:4848".to_owned()),
            replica_path: env::var("ZERO_REPLICA_FILE")
                .unwrap_or_else(|_| "zero-replica.db".to_owned()),
            app_id: env::var("ZERO_APP_ID").unwrap_or_else(|_| "zero".to_owned()),
            upstream_schema: env::var("ZERO_UPSTREAM_SCHEMA").unwrap_or_else(|_| "zero_0".to_owned()),
            get_queries_url: env::var("ZERO_GET_QUERIES_URL").unwrap_or_else(|_| push_url.clone()),
            push_url,
            api_key: env::var("ZERO_PUSH_API_KEY").ok(),
            forward_cookies: env::var("ZERO_FORWARD_COOKIES").as_deref() == Ok("true"),
            allowed_push_urls,
        })
    }

    pub fn pusher_config(&self) -> PusherConfig {
        PusherConfig {
            push_url: self.push_url.clone(),
            api_key: self.api_key.clone(),
            app_id: self.app_id.clone(),
            upstream_schema: self.upstream_schema.clone(),
            forward_cookies: self.forward_cookies,
            allowed_push_urls: self.allowed_push_urls.clone(),
        }
    }

    pub fn transformer_config(&self) -> TransformerConfig {
        TransformerConfig {
            get_queries_url: self.get_queries_url.clone(),
            api_key: self.api_key.clone(),
            app_id: self.app_id.clone(),
            upstream_schema: self.upstream_schema.clone(),
        }
    }
}
