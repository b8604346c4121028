//! RPC method handlers.
//!
//! Each method deserializes its params, calls the engine facade and maps
//! engine errors onto JSON-RPC error codes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::core::{
    EngineError, EngineResult, JobProgress, MirrorEngine, RetentionPolicy, SettingKey,
    TargetUpdate,
};

use super::protocol::{Request, Response};

/// Actor recorded for manual triggers that do not name one.
const DEFAULT_ACTOR: &str = "rpc";

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    engine: MirrorEngine,
}

#[derive(Deserialize)]
struct TargetParams {
    name: String,
}

#[derive(Deserialize)]
struct TargetUpdateParams {
    name: String,
    #[serde(flatten)]
    update: TargetUpdate,
}

#[derive(Deserialize)]
struct TriggerParams {
    name: String,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Deserialize)]
struct JobsListParams {
    target: String,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct JobParams {
    id: String,
}

#[derive(Deserialize, Default)]
struct SettingsGetParams {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Deserialize, Default)]
struct ActivityParams {
    #[serde(default)]
    days: Option<u32>,
}

#[derive(Serialize)]
struct Pruned {
    removed: usize,
}

#[derive(Serialize)]
struct ActiveProgress {
    jobs: Vec<JobProgress>,
    count: usize,
}

impl MethodHandler {
    pub fn new(engine: MirrorEngine) -> Self {
        Self { engine }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => respond(id, self.engine.status().await),
            "targets.list" => respond(id, self.engine.list_targets().await),
            "targets.get" => match parse::<TargetParams>(&id, params) {
                Ok(p) => respond(id, self.engine.get_target(&p.name).await),
                Err(resp) => resp,
            },
            "targets.update" => match parse::<TargetUpdateParams>(&id, params) {
                Ok(p) => respond(id, self.engine.update_target(&p.name, p.update).await),
                Err(resp) => resp,
            },
            "sync.trigger" => match parse::<TriggerParams>(&id, params) {
                Ok(p) => {
                    let actor = p.actor.as_deref().unwrap_or(DEFAULT_ACTOR);
                    respond(id, self.engine.trigger_sync(&p.name, actor).await)
                }
                Err(resp) => resp,
            },
            "jobs.list" => match parse::<JobsListParams>(&id, params) {
                Ok(p) => respond(id, self.engine.list_jobs(&p.target, p.limit).await),
                Err(resp) => resp,
            },
            "jobs.get" => match parse::<JobParams>(&id, params) {
                Ok(p) => respond(id, self.engine.get_job(&p.id).await),
                Err(resp) => resp,
            },
            "jobs.prune" => match parse::<RetentionPolicy>(&id, params) {
                Ok(policy) => respond(
                    id,
                    self.engine
                        .prune_jobs(policy)
                        .await
                        .map(|removed| Pruned { removed }),
                ),
                Err(resp) => resp,
            },
            "settings.get" => match parse::<SettingsGetParams>(&id, params) {
                Ok(p) => self.settings_get(id, p.key).await,
                Err(resp) => resp,
            },
            "settings.update" => match parse::<Map<String, Value>>(&id, params) {
                Ok(values) => self.settings_update(id, values).await,
                Err(resp) => resp,
            },
            "progress.active" => {
                let jobs = self.engine.active_progress().await;
                let count = jobs.len();
                Response::success(id, ActiveProgress { jobs, count })
            }
            "stats.health" => respond(id, self.engine.health().await),
            "stats.summary" => respond(id, self.engine.summary().await),
            "stats.activity" => match parse::<ActivityParams>(&id, params) {
                Ok(p) => respond(id, self.engine.sync_activity(p.days).await),
                Err(resp) => resp,
            },
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn settings_get(&self, id: Value, key: Option<String>) -> Response {
        let settings = match self.engine.get_settings().await {
            Ok(settings) => settings,
            Err(e) => return Response::engine_error(id, &e),
        };

        match key {
            None => Response::success(id, settings),
            Some(key) => {
                if SettingKey::from_key(&key).is_none() {
                    return Response::engine_error(id, &EngineError::validation(key, "unknown setting"));
                }
                match settings.into_iter().find(|s| s.key == key) {
                    Some(setting) => Response::success(id, setting),
                    None => Response::engine_error(
                        id,
                        &EngineError::Precondition(format!("setting `{}` has not been seeded", key)),
                    ),
                }
            }
        }
    }

    /// Params are the settings themselves: `{"sync_timeout": 3600, ...}`.
    /// Numbers and booleans are accepted alongside strings.
    async fn settings_update(&self, id: Value, values: Map<String, Value>) -> Response {
        let mut changes = HashMap::with_capacity(values.len());
        for (key, value) in values {
            let raw = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Response::engine_error(
                        id,
                        &EngineError::validation(key, format!("unsupported value {}", other)),
                    );
                }
            };
            changes.insert(key, raw);
        }

        if changes.is_empty() {
            return Response::invalid_params(id, "no settings given");
        }

        respond(id, self.engine.update_settings(&changes).await)
    }
}

fn respond<T: Serialize>(id: Value, result: EngineResult<T>) -> Response {
    match result {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::engine_error(id, &e),
    }
}

/// Missing params are treated as an empty object.
fn parse<P: DeserializeOwned>(id: &Value, params: Value) -> Result<P, Response> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}
