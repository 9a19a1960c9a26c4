use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::application::services::coordinator::DeployOptions;
use crate::error::{DeployError, DeployResult};
use crate::registry::{Environment, SlotName};
use crate::state::AppContext;

const OPERATOR: &str = "api";

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    json!({})
}

fn default_environment() -> Environment {
    Environment::Production
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DeployParams {
    project_name: String,
    #[serde(default = "default_environment")]
    environment: Environment,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    app_port: Option<u16>,
    #[serde(default)]
    skip_healthcheck: bool,
    #[serde(default)]
    auto_promote: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PromoteParams {
    project_name: String,
    #[serde(default = "default_environment")]
    environment: Environment,
    #[serde(default)]
    target_slot: Option<SlotName>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RollbackParams {
    project_name: String,
    #[serde(default = "default_environment")]
    environment: Environment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SlotListParams {
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    environment: Option<Environment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SlotStatusParams {
    project_name: String,
    #[serde(default = "default_environment")]
    environment: Environment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SlotCleanupParams {
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    environment: Option<Environment>,
    #[serde(default)]
    force: bool,
}

/// POST /tool
///
/// Dynamic `{tool, params}` dispatch. Parameters are validated against
/// the tool's explicit schema before anything runs.
pub async fn call_tool(State(ctx): State<AppContext>, Json(call): Json<ToolCall>) -> Response {
    let trace_id = Uuid::new_v4();
    info!("[{}] POST /tool {}", trace_id, call.tool);

    match dispatch(ctx, &call.tool, call.params).await {
        Ok(result) => {
            info!("[{}] tool {} succeeded", trace_id, call.tool);
            (
                StatusCode::OK,
                Json(json!({"success": true, "tool": call.tool, "result": result})),
            )
                .into_response()
        }
        Err(e) => {
            error!("[{}] tool {} failed: {}", trace_id, call.tool, e);
            (
                e.status(),
                Json(json!({
                    "success": false,
                    "tool": call.tool,
                    "error": e.to_string(),
                    "code": e.kind(),
                })),
            )
                .into_response()
        }
    }
}

/// Run the tool in its own task. If the client disconnects, axum drops
/// the handler future: the drop guard cancels pending probe loops, but
/// the spawned task keeps running, so container lifecycle commands are
/// never interrupted mid-call and a committed operation stays committed.
async fn dispatch(ctx: AppContext, tool: &str, params: Value) -> DeployResult<Value> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let tool = tool.to_string();
    let handle = tokio::spawn(run_tool(ctx, tool, params, cancel));
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(DeployError::Internal(anyhow::anyhow!(
            "tool task aborted: {}",
            e
        ))),
    }
}

async fn run_tool(
    ctx: AppContext,
    tool: String,
    params: Value,
    cancel: CancellationToken,
) -> DeployResult<Value> {
    match tool.as_str() {
        "deploy" => {
            let p: DeployParams = parse(params)?;
            let opts = DeployOptions {
                image: p.image,
                app_port: p.app_port,
                skip_healthcheck: p.skip_healthcheck,
                auto_promote: p.auto_promote,
            };
            let outcome = ctx
                .coordinator
                .deploy(&p.project_name, p.environment, opts, OPERATOR, &cancel)
                .await?;
            to_json(outcome)
        }
        "promote" => {
            let p: PromoteParams = parse(params)?;
            let outcome = ctx
                .coordinator
                .promote(&p.project_name, p.environment, p.target_slot, OPERATOR, &cancel)
                .await?;
            to_json(outcome)
        }
        "rollback" => {
            let p: RollbackParams = parse(params)?;
            let outcome = ctx
                .coordinator
                .rollback(&p.project_name, p.environment, OPERATOR, &cancel)
                .await?;
            to_json(outcome)
        }
        "slot_list" => {
            let p: SlotListParams = parse(params)?;
            let scopes = ctx
                .coordinator
                .list(p.project_name.as_deref(), p.environment)
                .await?;
            to_json(scopes)
        }
        "slot_status" => {
            let p: SlotStatusParams = parse(params)?;
            let status = ctx.coordinator.status(&p.project_name, p.environment).await?;
            to_json(status)
        }
        "slot_cleanup" => {
            let p: SlotCleanupParams = parse(params)?;
            let report = ctx
                .coordinator
                .cleanup(p.project_name.as_deref(), p.environment, p.force, OPERATOR)
                .await?;
            to_json(report)
        }
        other => Err(DeployError::InvalidParams(format!("unknown tool '{}'", other))),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> DeployResult<T> {
    serde_json::from_value(params).map_err(|e| DeployError::InvalidParams(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: T) -> DeployResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| DeployError::Internal(anyhow::anyhow!("response serialization failed: {}", e)))
}
