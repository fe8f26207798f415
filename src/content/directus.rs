//! Directus REST adapter.
//!
//! Maps each operation onto a `GET /items/<collection>` request. List
//! arguments (`filter`, `limit`, `offset`, `sort`, `fields`, `search`) pass
//! through as query parameters; lookups become a filtered single-item list.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::cache::{EntityType, FetchError, OperationId, OperationKind};
use crate::config::ContentSettings;
use crate::infra::error::InfraError;

use super::ContentSource;

const USER_AGENT: &str = concat!("vellum/", env!("CARGO_PKG_VERSION"));
const ERROR_BODY_LIMIT: usize = 200;

struct CollectionDefaults {
    limit: u64,
    sort: &'static [&'static str],
    fields: &'static [&'static str],
    slug_field: &'static str,
}

fn collection_defaults(entity: EntityType) -> CollectionDefaults {
    match entity {
        EntityType::Posts => CollectionDefaults {
            limit: 10,
            sort: &["-date_created"],
            fields: &["*", "author.*"],
            slug_field: "slug",
        },
        EntityType::Pages => CollectionDefaults {
            limit: 10,
            sort: &["-date_created"],
            fields: &["*", "blocks.*", "blocks.item.*"],
            slug_field: "permalink",
        },
        EntityType::Globals => CollectionDefaults {
            limit: 1,
            sort: &[],
            fields: &["*", "favicon.*", "logo.*", "logo_dark_mode.*"],
            slug_field: "slug",
        },
        EntityType::Navigation => CollectionDefaults {
            limit: 50,
            sort: &["title"],
            fields: &[
                "*",
                "items.*",
                "items.page.*",
                "items.post.*",
                "items.children.*",
            ],
            slug_field: "slug",
        },
        EntityType::Forms => CollectionDefaults {
            limit: 50,
            sort: &["title"],
            fields: &["*", "fields.*"],
            slug_field: "slug",
        },
        EntityType::AiPrompts | EntityType::Redirects => CollectionDefaults {
            limit: 50,
            sort: &[],
            fields: &["*"],
            slug_field: "slug",
        },
        EntityType::FormSubmissions => CollectionDefaults {
            limit: 50,
            sort: &["-timestamp"],
            fields: &["*", "form.*", "values.*", "values.field.*"],
            slug_field: "slug",
        },
    }
}

/// A resolved upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    /// Path segments appended to the base URL.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    /// Unwrap the first element of the list response, or null when empty.
    pub single: bool,
    /// Treat 404 as "no such record" and answer null.
    pub missing_is_null: bool,
}

impl RequestPlan {
    pub fn for_operation(operation: OperationId, args: &Value) -> Result<Self, FetchError> {
        let collection = operation.entity.as_str();
        let defaults = collection_defaults(operation.entity);

        match operation.kind {
            OperationKind::GetAll => Ok(list(collection, &defaults, args, None)),
            OperationKind::GetActive => Ok(list(
                collection,
                &defaults,
                args,
                Some(json!({"is_active": {"_eq": true}})),
            )),
            OperationKind::GetPublished => Ok(list(
                collection,
                &defaults,
                args,
                Some(json!({"status": {"_eq": "published"}})),
            )),
            OperationKind::GetByForm => {
                let form = required(args, "form_id")?;
                Ok(list(
                    collection,
                    &defaults,
                    args,
                    Some(json!({"form": {"_eq": form}})),
                ))
            }
            OperationKind::GetById => {
                let id = required(args, "id")?;
                Ok(Self {
                    segments: vec!["items".to_string(), collection.to_string(), id],
                    query: vec![("fields".to_string(), joined(args.get("fields"), defaults.fields))],
                    single: false,
                    missing_is_null: true,
                })
            }
            OperationKind::GetBySlug => {
                let slug = required(args, "slug")?;
                Ok(lookup(collection, &defaults, defaults.slug_field, slug))
            }
            OperationKind::GetByFromUrl => {
                let from = required(args, "from_url")?;
                Ok(lookup(collection, &defaults, "url_from", from))
            }
            OperationKind::Get => Ok(Self {
                segments: items(collection),
                query: vec![
                    ("limit".to_string(), "1".to_string()),
                    ("fields".to_string(), joined(args.get("fields"), defaults.fields)),
                ],
                single: true,
                missing_is_null: false,
            }),
        }
    }
}

fn items(collection: &str) -> Vec<String> {
    vec!["items".to_string(), collection.to_string()]
}

fn list(
    collection: &str,
    defaults: &CollectionDefaults,
    args: &Value,
    required_filter: Option<Value>,
) -> RequestPlan {
    let mut query = Vec::new();

    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(defaults.limit);
    query.push(("limit".to_string(), limit.to_string()));

    if let Some(offset) = args.get("offset").and_then(Value::as_u64) {
        query.push(("offset".to_string(), offset.to_string()));
    }

    let sort = joined(args.get("sort"), defaults.sort);
    if !sort.is_empty() {
        query.push(("sort".to_string(), sort));
    }

    query.push(("fields".to_string(), joined(args.get("fields"), defaults.fields)));

    let caller_filter = args
        .get("filter")
        .filter(|filter| filter.as_object().is_some_and(|map| !map.is_empty()))
        .cloned();
    let filter = match (required_filter, caller_filter) {
        (Some(required), Some(caller)) => Some(json!({"_and": [required, caller]})),
        (required, caller) => required.or(caller),
    };
    if let Some(filter) = filter {
        query.push(("filter".to_string(), filter.to_string()));
    }

    if let Some(search) = args.get("search").and_then(Value::as_str)
        && !search.is_empty()
    {
        query.push(("search".to_string(), search.to_string()));
    }

    RequestPlan {
        segments: items(collection),
        query,
        single: false,
        missing_is_null: false,
    }
}

fn lookup(collection: &str, defaults: &CollectionDefaults, field: &str, value: String) -> RequestPlan {
    RequestPlan {
        segments: items(collection),
        query: vec![
            ("filter".to_string(), json!({ field: {"_eq": value} }).to_string()),
            ("limit".to_string(), "1".to_string()),
            ("fields".to_string(), joined(None, defaults.fields)),
        ],
        single: true,
        missing_is_null: false,
    }
}

fn required(args: &Value, field: &str) -> Result<String, FetchError> {
    match args.get(field) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        _ => Err(FetchError::invalid_args(format!(
            "missing required argument `{field}`"
        ))),
    }
}

/// Join a list argument into Directus' comma form, falling back to `default`.
fn joined(value: Option<&Value>, default: &[&str]) -> String {
    match value {
        Some(Value::String(single)) => single.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(","),
        _ => default.join(","),
    }
}

fn first_or_null(data: Value) -> Value {
    match data {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    }
}

fn error_message(body: &[u8]) -> String {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    if let Some(message) = parsed
        .as_ref()
        .and_then(|value| value.pointer("/errors/0/message"))
        .and_then(Value::as_str)
    {
        return message.to_string();
    }
    String::from_utf8_lossy(body)
        .chars()
        .take(ERROR_BODY_LIMIT)
        .collect()
}

/// HTTP client for a Directus instance.
#[derive(Clone, Debug)]
pub struct DirectusClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl DirectusClient {
    pub fn new(settings: &ContentSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::http_client(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            base: settings.url.clone(),
            token: settings.token.clone(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, plan: &RequestPlan) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::other("content URL cannot carry a path"))?
            .pop_if_empty()
            .extend(&plan.segments);
        if !plan.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &plan.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ContentSource for DirectusClient {
    #[instrument(skip(self, args), fields(op = %operation))]
    async fn query(&self, operation: OperationId, args: Value) -> Result<Value, FetchError> {
        let plan = RequestPlan::for_operation(operation, &args)?;
        let url = self.url(&plan)?;
        debug!(url = %url, "requesting content");

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        if status == StatusCode::NOT_FOUND && plan.missing_is_null {
            return Ok(Value::Null);
        }
        if !status.is_success() {
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let envelope: Value =
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode(err.to_string()))?;
        let Value::Object(mut envelope) = envelope else {
            return Err(FetchError::Decode("expected a JSON object".to_string()));
        };
        let data = envelope.remove("data").unwrap_or(Value::Null);

        Ok(if plan.single { first_or_null(data) } else { data })
    }
}
