//! Delegating host API objects: `web`, `config`, `store`, `profile`,
//! `social`, `message`, `promo`, `event`, and (server builds only)
//! `admin`.
//!
//! Each method validates its arguments synchronously, then delegates to
//! the downstream collaborator through the promise bridge. Cacheable reads
//! go through the handler cache under `config:`, `store:` and `profile:`
//! keys.

use std::collections::HashMap;
use std::sync::Arc;

use rquickjs::{Ctx, Function, Object, Value, function::Opt};
use serde_json::{Value as Json, json};

use super::{API_TIMEOUT, ApiDeps, ApiState, host_promise, set_global_object, throw_api};
use crate::bridge::Handler;
use crate::error::ExecResult;
use crate::value::{engine_js_error, js_to_json};

pub(crate) fn install(
    ctx: &Ctx<'_>,
    state: &Arc<ApiState>,
    server_mode: bool,
) -> ExecResult<()> {
    install_web(ctx, state)?;
    install_config(ctx, state)?;
    install_store(ctx, state)?;
    install_profile(ctx, state)?;
    install_social(ctx, state)?;
    install_message(ctx, state)?;
    install_promo(ctx, state)?;
    install_event(ctx, state)?;
    if server_mode {
        install_admin(ctx, state)?;
    }
    Ok(())
}

fn string_arg(value: &Value<'_>) -> Option<String> {
    value.as_string().and_then(|s| s.to_string().ok())
}

fn json_arg(value: &Value<'_>) -> Json {
    js_to_json(value).unwrap_or(Json::Null)
}

fn opt_json(value: &Opt<Value<'_>>) -> Json {
    value.0.as_ref().map(json_arg).unwrap_or(Json::Null)
}

fn opt_string(value: &Opt<Value<'_>>, default: &str) -> Option<String> {
    match value.0.as_ref() {
        None => Some(default.to_string()),
        Some(v) if v.is_undefined() || v.is_null() => Some(default.to_string()),
        Some(v) => string_arg(v),
    }
}

fn opt_bool(value: &Opt<Value<'_>>, default: bool) -> bool {
    value
        .0
        .as_ref()
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

/// One downstream request, optionally read through / written to the
/// handler cache. Failures reject with the upstream code and an
/// `Internal error: `-prefixed body.
async fn delegate(
    deps: Arc<ApiDeps>,
    handler: Arc<Handler>,
    service: &'static str,
    method: &'static str,
    payload: Json,
    cache_key: Option<String>,
) -> ExecResult<Json> {
    if let Some(key) = &cache_key {
        if let Some(hit) = handler.cache_get(key) {
            return Ok(hit);
        }
    }
    let result = deps
        .downstream
        .request(service, method, payload, API_TIMEOUT)
        .await?;
    if let Some(key) = cache_key {
        handler.cache_set(&key, result.clone());
    }
    Ok(result)
}

fn install_web(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let web = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let get = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, url: Value, headers: Opt<Value>| -> rquickjs::Result<Value> {
            let Some(url) = string_arg(&url) else {
                return Err(throw_api(&ctx, 400, "url should be a string"));
            };
            let headers: Option<HashMap<String, String>> = match headers.0.as_ref() {
                None => None,
                Some(v) if v.is_undefined() || v.is_null() => None,
                Some(v) => match js_to_json(v) {
                    Ok(Json::Object(map)) => Some(
                        map.into_iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k, v.to_string())))
                            .collect(),
                    ),
                    _ => return Err(throw_api(&ctx, 400, "headers should be an object")),
                },
            };
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |_handler| async move {
                deps.web.get(url, headers).await
            })
        }
    })
    .map_err(engine_js_error)?;
    web.set("get", get).map_err(engine_js_error)?;

    set_global_object(ctx, "web", web)
}

fn install_config(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let config = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let get = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let app = handler.env.application_name.clone();
                let version = handler.env.application_version.clone();
                let key = format!("config:{app}/{version}");
                delegate(
                    deps,
                    handler,
                    "config",
                    "get_configuration",
                    json!({"app_name": app, "app_version": version}),
                    Some(key),
                )
                .await
            })
        }
    })
    .map_err(engine_js_error)?;
    config.set("get", get).map_err(engine_js_error)?;

    set_global_object(ctx, "config", config)
}

fn install_store(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let store = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let get = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, name: Value| -> rquickjs::Result<Value> {
            let Some(name) = string_arg(&name) else {
                return Err(throw_api(&ctx, 400, "name should be a string"));
            };
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let key = format!("store:{name}");
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "name": name,
                });
                delegate(deps, handler, "store", "get_store", payload, Some(key)).await
            })
        }
    })
    .map_err(engine_js_error)?;
    store.set("get", get).map_err(engine_js_error)?;

    let new_order = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              store: Value,
              item: Value,
              currency: Value,
              amount: Value,
              component: Value|
              -> rquickjs::Result<Value> {
            let order = json!({
                "store": json_arg(&store),
                "item": json_arg(&item),
                "currency": json_arg(&currency),
                "amount": json_arg(&amount),
                "component": json_arg(&component),
            });
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let mut payload = order;
                merge_identity(&mut payload, &handler);
                delegate(deps, handler, "store", "new_order", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    store.set("new_order", new_order).map_err(engine_js_error)?;

    let update_order = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, order_id: Value| -> rquickjs::Result<Value> {
            let order_id = json_arg(&order_id);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let mut payload = json!({"order_id": order_id});
                merge_identity(&mut payload, &handler);
                delegate(deps, handler, "store", "update_order", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    store
        .set("update_order", update_order)
        .map_err(engine_js_error)?;

    let update_orders = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let mut payload = json!({});
                merge_identity(&mut payload, &handler);
                delegate(deps, handler, "store", "update_orders", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    store
        .set("update_orders", update_orders)
        .map_err(engine_js_error)?;

    set_global_object(ctx, "store", store)
}

fn install_profile(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let profile = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let get = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, path: Opt<Value>| -> rquickjs::Result<Value> {
            let Some(path) = opt_string(&path, "") else {
                return Err(throw_api(&ctx, 400, "Path should be a string"));
            };
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let key = format!("profile:{path}");
                let payload = json!({
                    "gamespace_id": handler.env.gamespace_id,
                    "account_id": handler.env.account_id,
                    "path": path,
                });
                delegate(deps, handler, "profile", "get_my_profile", payload, Some(key)).await
            })
        }
    })
    .map_err(engine_js_error)?;
    profile.set("get", get).map_err(engine_js_error)?;

    let update = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              fields: Opt<Value>,
              path: Opt<Value>,
              merge: Opt<Value>|
              -> rquickjs::Result<Value> {
            let Some(path) = opt_string(&path, "") else {
                return Err(throw_api(&ctx, 400, "Path should be a string"));
            };
            let fields = match opt_json(&fields) {
                Json::Null => json!({}),
                other => other,
            };
            let merge = opt_bool(&merge, true);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let key = format!("profile:{path}");
                let payload = json!({
                    "gamespace_id": handler.env.gamespace_id,
                    "account_id": handler.env.account_id,
                    "fields": fields,
                    "path": path,
                    "merge": merge,
                });
                let result = delegate(
                    deps,
                    handler.clone(),
                    "profile",
                    "update_profile",
                    payload,
                    None,
                )
                .await?;
                handler.cache_set(&key, result.clone());
                Ok(result)
            })
        }
    })
    .map_err(engine_js_error)?;
    profile.set("update", update).map_err(engine_js_error)?;

    let query = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, query: Value, limit: Opt<Value>| -> rquickjs::Result<Value> {
            let query = json_arg(&query);
            let limit = opt_json(&limit);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace_id": handler.env.gamespace_id,
                    "query": query,
                    "limit": limit,
                });
                delegate(deps, handler, "profile", "query_profiles", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    profile.set("query", query).map_err(engine_js_error)?;

    set_global_object(ctx, "profile", profile)
}

fn install_social(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let social = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let acquire_name = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, kind: Value, name: Value| -> rquickjs::Result<Value> {
            let kind = json_arg(&kind);
            let Some(name) = string_arg(&name) else {
                return Err(throw_api(&ctx, 400, "name should be a string"));
            };
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "account": handler.env.account_id,
                    "kind": kind,
                    "name": name,
                });
                delegate(deps, handler, "social", "acquire_name", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    social
        .set("acquire_name", acquire_name)
        .map_err(engine_js_error)?;

    let check_name = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, kind: Value, name: Value| -> rquickjs::Result<Value> {
            let kind = json_arg(&kind);
            let Some(name) = string_arg(&name) else {
                return Err(throw_api(&ctx, 400, "name should be a string"));
            };
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "kind": kind,
                    "name": name,
                });
                delegate(deps, handler, "social", "check_name", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    social.set("check_name", check_name).map_err(engine_js_error)?;

    let release_name = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, kind: Value| -> rquickjs::Result<Value> {
            let kind = json_arg(&kind);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "account": handler.env.account_id,
                    "kind": kind,
                });
                delegate(deps, handler, "social", "release_name", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    social
        .set("release_name", release_name)
        .map_err(engine_js_error)?;

    let update_profile = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              group_id: Value,
              fields: Opt<Value>,
              path: Opt<Value>,
              merge: Opt<Value>|
              -> rquickjs::Result<Value> {
            let path = opt_json(&path);
            if !matches!(path, Json::Null | Json::Array(_)) {
                return Err(throw_api(&ctx, 400, "Path should be a list"));
            }
            let group_id = json_arg(&group_id);
            let fields = opt_json(&fields);
            let merge = opt_bool(&merge, true);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "group_id": group_id,
                    "profile": fields,
                    "path": path,
                    "merge": merge,
                });
                delegate(deps, handler, "social", "update_group_profile", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    social
        .set("update_profile", update_profile)
        .map_err(engine_js_error)?;

    let update_group_profiles = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              group_profiles: Value,
              path: Opt<Value>,
              merge: Opt<Value>|
              -> rquickjs::Result<Value> {
            let group_profiles = json_arg(&group_profiles);
            if !group_profiles.is_object() {
                return Err(throw_api(&ctx, 400, "Group profiles should be an object"));
            }
            let path = opt_json(&path);
            if !matches!(path, Json::Null | Json::Array(_)) {
                return Err(throw_api(&ctx, 400, "Path should be a list"));
            }
            let merge = opt_bool(&merge, true);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "group_profiles": group_profiles,
                    "path": path,
                    "merge": merge,
                });
                delegate(
                    deps,
                    handler,
                    "social",
                    "update_group_profiles",
                    payload,
                    None,
                )
                .await
            })
        }
    })
    .map_err(engine_js_error)?;
    social
        .set("update_group_profiles", update_group_profiles)
        .map_err(engine_js_error)?;

    set_global_object(ctx, "social", social)
}

fn install_message(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let message = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let send_batch = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              sender: Value,
              messages: Value,
              authoritative: Opt<Value>|
              -> rquickjs::Result<Value> {
            let sender = json_arg(&sender);
            let messages = json_arg(&messages);
            let authoritative = opt_bool(&authoritative, true);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "sender": sender,
                    "messages": messages,
                    "authoritative": authoritative,
                });
                delegate(deps, handler, "message", "send_batch", payload, None).await?;
                Ok(Json::String("OK".to_string()))
            })
        }
    })
    .map_err(engine_js_error)?;
    message.set("send_batch", send_batch).map_err(engine_js_error)?;

    set_global_object(ctx, "message", message)
}

fn install_promo(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let promo = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let use_code = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, key: Value| -> rquickjs::Result<Value> {
            let Some(key) = string_arg(&key) else {
                return Err(throw_api(&ctx, 400, "key should be a string"));
            };
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "account": handler.env.account_id,
                    "key": key,
                });
                let result = delegate(deps, handler, "promo", "use_code", payload, None).await?;
                Ok(result.get("result").cloned().unwrap_or(Json::Null))
            })
        }
    })
    .map_err(engine_js_error)?;
    promo.set("use_code", use_code).map_err(engine_js_error)?;

    set_global_object(ctx, "promo", promo)
}

fn install_event(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let event = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let list = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              extra_start: Opt<Value>,
              extra_end: Opt<Value>|
              -> rquickjs::Result<Value> {
            let extra_start = opt_json(&extra_start);
            let extra_end = opt_json(&extra_end);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "account": handler.env.account_id,
                    "extra_start": extra_start,
                    "extra_end": extra_end,
                });
                delegate(deps, handler, "event", "list", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    event.set("list", list).map_err(engine_js_error)?;

    let update_event_profile = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              event_id: Value,
              fields: Opt<Value>,
              path: Opt<Value>,
              merge: Opt<Value>|
              -> rquickjs::Result<Value> {
            let event_id = json_arg(&event_id);
            let fields = opt_json(&fields);
            let path = opt_json(&path);
            let merge = opt_bool(&merge, true);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "account": handler.env.account_id,
                    "event_id": event_id,
                    "profile": fields,
                    "path": path,
                    "merge": merge,
                });
                delegate(deps, handler, "event", "update_event_profile", payload, None).await
            })
        }
    })
    .map_err(engine_js_error)?;
    event
        .set("update_event_profile", update_event_profile)
        .map_err(engine_js_error)?;

    set_global_object(ctx, "event", event)
}

fn install_admin(ctx: &Ctx<'_>, state: &Arc<ApiState>) -> ExecResult<()> {
    let admin = Object::new(ctx.clone()).map_err(engine_js_error)?;

    let delete_accounts = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>,
              accounts: Value,
              gamespace_only: Opt<Value>|
              -> rquickjs::Result<Value> {
            let accounts = json_arg(&accounts);
            if !accounts.is_array() {
                return Err(throw_api(&ctx, 400, "accounts should be a list"));
            }
            let gamespace_only = opt_bool(&gamespace_only, true);
            let deps = state.deps.clone();
            host_promise(&ctx, &state, move |handler| async move {
                let payload = json!({
                    "gamespace": handler.env.gamespace_id,
                    "accounts": accounts,
                    "gamespace_only": gamespace_only,
                });
                deps.publisher
                    .publish("exec.delete_accounts", payload)
                    .await?;
                Ok(Json::String("OK".to_string()))
            })
        }
    })
    .map_err(engine_js_error)?;
    admin
        .set("delete_accounts", delete_accounts)
        .map_err(engine_js_error)?;

    set_global_object(ctx, "admin", admin)
}

fn merge_identity(payload: &mut Json, handler: &Handler) {
    if let Json::Object(map) = payload {
        map.insert(
            "gamespace".to_string(),
            Json::String(handler.env.gamespace_id.clone()),
        );
        map.insert(
            "account".to_string(),
            Json::String(handler.env.account_id.clone()),
        );
    }
}
