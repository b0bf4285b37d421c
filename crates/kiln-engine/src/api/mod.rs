//! Host API surface injected into every script context.
//!
//! Registration happens once per context, before stdlib and user code are
//! evaluated. Every async method follows the same protocol: snapshot the
//! current handler, create a deferred promise, run the host coroutine on
//! the host scheduler, and post the completion back to the owning worker as
//! a [`Delivery`].

mod services;
mod web;

pub use web::WebClient;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rquickjs::{Ctx, Function, IntoJs, Object, Persistent, Value};
use serde_json::Value as Json;

use crate::bridge::{Bridge, Handler, error_value};
use crate::collaborators::{Downstream, MessagePublisher};
use crate::error::ExecResult;
use crate::value::{engine_js_error, js_to_json};
use crate::worker::{ContextId, Delivery, DeliveryTx};

/// Downstream timeout applied to every host API delegate.
pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared dependencies of the host API, one set per engine.
pub struct ApiDeps {
    pub downstream: Arc<dyn Downstream>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub web: Arc<WebClient>,
}

/// Per-context state captured by every API closure.
///
/// Holds only the context *id* — never a context handle — so closures owned
/// by the context cannot keep it alive.
pub(crate) struct ApiState {
    pub context: ContextId,
    pub bridge: Arc<Bridge>,
    pub deps: Arc<ApiDeps>,
    pub delivery: DeliveryTx,
    pub host: tokio::runtime::Handle,
}

/// Install the host globals into a fresh context.
pub(crate) fn install_api(
    ctx: &Ctx<'_>,
    context: ContextId,
    bridge: Arc<Bridge>,
    deps: Arc<ApiDeps>,
    delivery: DeliveryTx,
    host: tokio::runtime::Handle,
    server_mode: bool,
) -> ExecResult<()> {
    let state = Arc::new(ApiState {
        context,
        bridge,
        deps,
        delivery,
        host,
    });

    let globals = ctx.globals();

    let log = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, message: Value| {
            let text = display_value(&ctx, &message);
            state.bridge.current().log(&text);
        }
    })
    .map_err(engine_js_error)?;
    globals.set("log", log).map_err(engine_js_error)?;

    let sleep = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>, seconds: f64| -> rquickjs::Result<Value> {
            host_promise(&ctx, &state, move |_handler| async move {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                Ok(Json::Null)
            })
        }
    })
    .map_err(engine_js_error)?;
    globals.set("sleep", sleep).map_err(engine_js_error)?;

    let moment = Function::new(ctx.clone(), {
        let state = state.clone();
        move |ctx: Ctx<'_>| -> rquickjs::Result<Value> {
            host_promise(&ctx, &state, move |_handler| async move {
                tokio::task::yield_now().await;
                Ok(Json::Null)
            })
        }
    })
    .map_err(engine_js_error)?;
    globals.set("moment", moment).map_err(engine_js_error)?;

    services::install(ctx, &state, server_mode)?;

    Ok(())
}

/// Create a deferred promise wired to a host coroutine.
///
/// The handler is bound when the promise is created; the coroutine runs on
/// the host scheduler and its completion is posted to the owning worker,
/// which restores the handler before resolving inside the context.
pub(crate) fn host_promise<'js, F, Fut>(
    ctx: &Ctx<'js>,
    state: &Arc<ApiState>,
    make: F,
) -> rquickjs::Result<Value<'js>>
where
    F: FnOnce(Arc<Handler>) -> Fut,
    Fut: Future<Output = ExecResult<Json>> + Send + 'static,
{
    let handler = state.bridge.current();
    let (promise, resolve, reject) = ctx.promise()?;
    let resolve = Persistent::save(ctx, resolve);
    let reject = Persistent::save(ctx, reject);
    let future = make(handler.clone());

    let delivery = state.delivery.clone();
    let context = state.context;
    let bridge = state.bridge.clone();
    state.host.spawn(async move {
        let result = future.await;
        let _ = delivery.send(Delivery {
            context,
            bridge,
            handler,
            resolve,
            reject,
            result,
        });
    });

    promise.into_js(ctx)
}

/// Throw an APIUserError from a synchronous argument check.
pub(crate) fn throw_api<'js>(ctx: &Ctx<'js>, code: u16, message: &str) -> rquickjs::Error {
    match error_value(ctx, code, message) {
        Ok(value) => ctx.throw(value),
        Err(_) => rquickjs::Error::Exception,
    }
}

/// Render any script value for the log sink.
fn display_value(_ctx: &Ctx<'_>, value: &Value<'_>) -> String {
    match js_to_json(value) {
        Ok(Json::String(text)) => text,
        Ok(json) => json.to_string(),
        Err(_) => "<unprintable>".to_string(),
    }
}

/// Set a frozen object property on the globals.
pub(crate) fn set_global_object<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    object: Object<'js>,
) -> ExecResult<()> {
    ctx.globals().set(name, object).map_err(engine_js_error)
}
