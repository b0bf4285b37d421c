//! Worker threads: each owns one QuickJS isolate and executes jobs from a
//! bounded queue, strictly one at a time.
//!
//! Script execution never leaves the worker thread. Host coroutines run on
//! the host scheduler and come back as [`Delivery`] items on the worker's
//! internal queue; the worker restores the originating handler, resolves or
//! rejects the deferred promise inside the context and drains the microtask
//! queue before touching the next item. Deliveries take priority over new
//! jobs so resolutions land in the order their completions arrived.
//!
//! Contexts are owned by the worker and addressed by [`ContextId`]; host
//! structures and API closures never hold a context handle directly, so
//! dropping a build cannot leave a host↔script reference cycle behind.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rquickjs::{
    AsyncContext, AsyncRuntime, CatchResultExt, Ctx, Function, Object, Persistent, Value,
    async_with,
    context::EvalOptions,
    function::This,
};
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::api::{ApiDeps, install_api};
use crate::bridge::{Bridge, Handler, classify_caught, classify_thrown, error_value};
use crate::collaborators::SourceFile;
use crate::error::{ExecError, ExecResult};
use crate::value::{engine_js_error, js_to_json, json_to_js};

/// Identifies one context on its owning worker.
pub(crate) type ContextId = u64;

/// How a call job reported its result.
pub(crate) enum CallReply {
    /// The function returned a plain value synchronously.
    Immediate(Json),
    /// The function returned a promise; the receiver fires on settlement.
    Pending(oneshot::Receiver<ExecResult<Json>>),
}

/// Visibility rules applied when resolving a call target.
pub(crate) enum Exposure {
    /// External call: the target must carry `allow_call === true`, or match
    /// the legacy entry-function name.
    Public { legacy_name: Option<String> },
    /// Engine-internal call (`released`): no marker required, a missing
    /// method is not an error.
    Internal,
}

/// Completion of a host coroutine, headed back into its context.
pub(crate) struct Delivery {
    pub context: ContextId,
    pub bridge: Arc<Bridge>,
    pub handler: Arc<Handler>,
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
    pub result: ExecResult<Json>,
}

pub(crate) type DeliveryTx = mpsc::UnboundedSender<Delivery>;

/// Jobs accepted by a worker.
pub(crate) enum Job {
    /// Create a fresh context on this worker's isolate.
    CreateContext {
        reply: oneshot::Sender<ExecResult<ContextId>>,
    },
    /// Install host globals, evaluate stdlib and user files in order.
    InitContext {
        context: ContextId,
        bridge: Arc<Bridge>,
        handler: Arc<Handler>,
        deps: Arc<ApiDeps>,
        server_mode: bool,
        files: Vec<SourceFile>,
        reply: oneshot::Sender<ExecResult<()>>,
    },
    /// Invoke a top-level function.
    CallFunction {
        context: ContextId,
        bridge: Arc<Bridge>,
        handler: Arc<Handler>,
        method: String,
        args: Json,
        exposure: Exposure,
        reply: oneshot::Sender<ExecResult<CallReply>>,
    },
    /// Construct a session instance: `new Class(args, env)`.
    Construct {
        context: ContextId,
        bridge: Arc<Bridge>,
        handler: Arc<Handler>,
        class_name: String,
        args: Json,
        env: Json,
        reply: oneshot::Sender<ExecResult<Persistent<Object<'static>>>>,
    },
    /// Invoke a method on a session instance.
    CallMethod {
        context: ContextId,
        bridge: Arc<Bridge>,
        handler: Arc<Handler>,
        instance: Persistent<Object<'static>>,
        method: String,
        args: Json,
        /// Session calls pass the arguments twice (`method(args, args)`).
        args_twice: bool,
        /// A missing method resolves to null instead of failing.
        optional: bool,
        reply: oneshot::Sender<ExecResult<CallReply>>,
    },
    /// Evaluate debug text in the context.
    Eval {
        context: ContextId,
        bridge: Arc<Bridge>,
        handler: Arc<Handler>,
        source: String,
        reply: oneshot::Sender<ExecResult<Json>>,
    },
    /// Destroy a context; pending deliveries for it are discarded.
    DropContext { context: ContextId },
    Shutdown,
}

/// Flags shared between a worker and its handles.
#[derive(Default)]
pub(crate) struct WorkerSignals {
    /// Abort the currently-running script at the next interrupt tick.
    kill: AtomicBool,
    /// Whether the worker is inside a script entry right now.
    busy: AtomicBool,
}

/// Thread-safe handle to one worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    name: Arc<str>,
    jobs: mpsc::Sender<Job>,
    signals: Arc<WorkerSignals>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job; a full queue reports `WorkerBusy`.
    pub fn submit(&self, job: Job) -> ExecResult<()> {
        self.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ExecError::WorkerBusy,
            mpsc::error::TrySendError::Closed(_) => ExecError::engine("worker is gone"),
        })
    }

    /// Submit a job and await its reply.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<ExecResult<T>>) -> Job,
    ) -> ExecResult<T> {
        let (tx, rx) = oneshot::channel();
        self.submit(make(tx))?;
        rx.await
            .map_err(|_| ExecError::engine("worker dropped the reply"))?
    }

    /// Abort the script the worker is currently running; its job completes
    /// with a termination error. A no-op when the worker is not inside a
    /// script entry (the timed-out work was host-side, not wedged JS).
    pub fn terminate(&self) {
        if self.signals.busy.load(Ordering::SeqCst) {
            self.signals.kill.store(true, Ordering::SeqCst);
        }
    }

    /// Queue the poison job; waits for space so shutdown is never dropped.
    pub async fn send_shutdown(&self) {
        let _ = self.jobs.send(Job::Shutdown).await;
    }
}

/// Spawn a worker thread; jobs are accepted until `Job::Shutdown`.
pub(crate) fn spawn_worker(
    name: String,
    queue_capacity: usize,
    micro_timeout: Duration,
    host: tokio::runtime::Handle,
) -> ExecResult<(WorkerHandle, std::thread::JoinHandle<()>)> {
    let (jobs_tx, jobs_rx) = mpsc::channel(queue_capacity.max(1));
    let signals = Arc::new(WorkerSignals::default());

    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn({
            let signals = signals.clone();
            let name = name.clone();
            move || run_worker(name, jobs_rx, signals, micro_timeout, host)
        })
        .map_err(|e| ExecError::engine(format!("failed to spawn worker: {e}")))?;

    let handle = WorkerHandle {
        name: name.into(),
        jobs: jobs_tx,
        signals,
    };
    Ok((handle, thread))
}

fn run_worker(
    name: String,
    mut jobs: mpsc::Receiver<Job>,
    signals: Arc<WorkerSignals>,
    micro_timeout: Duration,
    host: tokio::runtime::Handle,
) {
    let local = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = %name, error = %e, "failed to build worker runtime");
            return;
        }
    };

    local.block_on(async move {
        let runtime = match AsyncRuntime::new() {
            Ok(rt) => rt,
            Err(e) => {
                error!(worker = %name, error = %e, "failed to create isolate");
                return;
            }
        };
        install_interrupt_handler(&runtime, signals.clone(), micro_timeout).await;

        let (delivery_tx, mut deliveries) = mpsc::unbounded_channel();
        let core = WorkerCore {
            name,
            runtime,
            delivery_tx,
            host,
            contexts: RefCell::new(HashMap::new()),
            next_context: RefCell::new(1),
        };
        debug!(worker = %core.name, "worker started");

        loop {
            tokio::select! {
                biased;
                Some(delivery) = deliveries.recv() => {
                    signals.busy.store(true, Ordering::SeqCst);
                    core.deliver(delivery).await;
                }
                job = jobs.recv() => match job {
                    None | Some(Job::Shutdown) => break,
                    Some(job) => {
                        signals.busy.store(true, Ordering::SeqCst);
                        core.run(job).await;
                    }
                },
            }
            core.drain_microtasks().await;
            // A termination aimed at the finished job must not leak into
            // the next one.
            signals.busy.store(false, Ordering::SeqCst);
            signals.kill.store(false, Ordering::SeqCst);
        }

        core.drain_microtasks().await;
        debug!(worker = %core.name, "worker stopped");
    });
}

/// Interrupt handler: fires periodically while JS executes. A continuous
/// synchronous stretch longer than the micro-timeout aborts the script, as
/// does a host-requested termination. Ticks separated by more than the gap
/// threshold mean the engine yielded in between, which starts a new stretch.
async fn install_interrupt_handler(
    runtime: &AsyncRuntime,
    signals: Arc<WorkerSignals>,
    micro_timeout: Duration,
) {
    const STRETCH_GAP: Duration = Duration::from_millis(50);

    let mut stretch_start: Option<Instant> = None;
    let mut last_tick = Instant::now();

    runtime
        .set_interrupt_handler(Some(Box::new(move || {
            if signals.kill.swap(false, Ordering::SeqCst) {
                stretch_start = None;
                return true;
            }
            let now = Instant::now();
            if stretch_start.is_some() && now.duration_since(last_tick) > STRETCH_GAP {
                stretch_start = None;
            }
            let start = *stretch_start.get_or_insert(now);
            last_tick = now;
            if now.duration_since(start) > micro_timeout {
                stretch_start = None;
                return true;
            }
            false
        })))
        .await;
}

struct WorkerCore {
    name: String,
    runtime: AsyncRuntime,
    delivery_tx: DeliveryTx,
    host: tokio::runtime::Handle,
    contexts: RefCell<HashMap<ContextId, AsyncContext>>,
    next_context: RefCell<ContextId>,
}

impl WorkerCore {
    fn context(&self, id: ContextId) -> ExecResult<AsyncContext> {
        self.contexts
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecError::engine("context is gone"))
    }

    /// Run queued JS microtasks to exhaustion.
    async fn drain_microtasks(&self) {
        loop {
            match self.runtime.execute_pending_job().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "pending job failed");
                }
            }
        }
    }

    async fn run(&self, job: Job) {
        match job {
            Job::CreateContext { reply } => {
                let result = self.create_context().await;
                let _ = reply.send(result);
            }
            Job::InitContext {
                context,
                bridge,
                handler,
                deps,
                server_mode,
                files,
                reply,
            } => {
                let result = self
                    .init_context(context, &bridge, &handler, &deps, server_mode, &files)
                    .await;
                let _ = reply.send(result);
            }
            Job::CallFunction {
                context,
                bridge,
                handler,
                method,
                args,
                exposure,
                reply,
            } => {
                let result = self
                    .call_function(context, &bridge, &handler, &method, &args, &exposure)
                    .await;
                let _ = reply.send(result);
            }
            Job::Construct {
                context,
                bridge,
                handler,
                class_name,
                args,
                env,
                reply,
            } => {
                let result = self
                    .construct(context, &bridge, &handler, &class_name, &args, &env)
                    .await;
                let _ = reply.send(result);
            }
            Job::CallMethod {
                context,
                bridge,
                handler,
                instance,
                method,
                args,
                args_twice,
                optional,
                reply,
            } => {
                let result = self
                    .call_method(
                        context, &bridge, &handler, instance, &method, &args, args_twice,
                        optional,
                    )
                    .await;
                let _ = reply.send(result);
            }
            Job::Eval {
                context,
                bridge,
                handler,
                source,
                reply,
            } => {
                let result = self.eval(context, &bridge, &handler, &source).await;
                let _ = reply.send(result);
            }
            Job::DropContext { context } => {
                let dropped = self.contexts.borrow_mut().remove(&context);
                drop(dropped);
            }
            Job::Shutdown => {}
        }
    }

    async fn create_context(&self) -> ExecResult<ContextId> {
        let context = AsyncContext::full(&self.runtime)
            .await
            .map_err(|e| ExecError::engine(format!("creating context: {e}")))?;
        let id = {
            let mut next = self.next_context.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.contexts.borrow_mut().insert(id, context);
        Ok(id)
    }

    async fn init_context(
        &self,
        context: ContextId,
        bridge: &Arc<Bridge>,
        handler: &Arc<Handler>,
        deps: &Arc<ApiDeps>,
        server_mode: bool,
        files: &[SourceFile],
    ) -> ExecResult<()> {
        let context_handle = self.context(context)?;
        bridge.set_current(handler.clone());

        let delivery_tx = self.delivery_tx.clone();
        let host = self.host.clone();
        let bridge = bridge.clone();
        let deps = deps.clone();

        async_with!(context_handle => |ctx| {
            install_api(
                &ctx,
                context,
                bridge.clone(),
                deps,
                delivery_tx,
                host,
                server_mode,
            )?;

            ctx.eval_with_options::<(), _>(crate::STDLIB_JS, eval_options())
                .catch(&ctx)
                .map_err(|e| {
                    let reason = classify_caught(&ctx, e, true).message();
                    ExecError::build(500, format!("compiling stdlib.js: {reason}"))
                })?;

            for file in files {
                ctx.eval_with_options::<(), _>(file.text.as_str(), eval_options())
                    .catch(&ctx)
                    .map_err(|e| {
                        let reason = classify_caught(&ctx, e, true).message();
                        ExecError::build(500, format!("compiling {}: {reason}", file.name))
                    })?;
            }

            Ok(())
        })
        .await
    }

    async fn call_function(
        &self,
        context: ContextId,
        bridge: &Arc<Bridge>,
        handler: &Arc<Handler>,
        method: &str,
        args: &Json,
        exposure: &Exposure,
    ) -> ExecResult<CallReply> {
        let context_handle = self.context(context)?;
        bridge.set_current(handler.clone());
        let debug = handler.debug_enabled();

        async_with!(context_handle => |ctx| {
            let target: Value = ctx.globals().get(method).map_err(engine_js_error)?;
            let Some(function) = target.as_function().cloned() else {
                return if matches!(exposure, Exposure::Internal) {
                    Ok(CallReply::Immediate(Json::Null))
                } else {
                    Err(ExecError::NoSuchMethod)
                };
            };

            if let Exposure::Public { legacy_name } = exposure {
                let allowed: bool = function
                    .get::<_, Option<bool>>("allow_call")
                    .unwrap_or(None)
                    .unwrap_or(false);
                // Standalone functions: legacy rows without markers expose
                // their own name and the conventional `main` entry.
                let name_match = legacy_name.is_some()
                    && (legacy_name.as_deref() == Some(method) || method == "main");
                if !allowed && !name_match {
                    return Err(ExecError::NoSuchMethod);
                }
            }

            let args_js = json_to_js(&ctx, args)?;
            let invoked = function.call::<_, Value>((args_js,)).catch(&ctx);
            classify_invocation(&ctx, invoked, debug)
        })
        .await
    }

    async fn construct(
        &self,
        context: ContextId,
        bridge: &Arc<Bridge>,
        handler: &Arc<Handler>,
        class_name: &str,
        args: &Json,
        env: &Json,
    ) -> ExecResult<Persistent<Object<'static>>> {
        let context_handle = self.context(context)?;
        bridge.set_current(handler.clone());
        let debug = handler.debug_enabled();

        async_with!(context_handle => |ctx| {
            let target: Value = ctx.globals().get(class_name).map_err(engine_js_error)?;
            let Some(class) = target.as_function().cloned() else {
                return Err(ExecError::NoSuchClass);
            };

            let allowed: bool = class
                .get::<_, Option<bool>>("allow_session")
                .unwrap_or(None)
                .unwrap_or(false);
            if !allowed {
                return Err(ExecError::NoSuchClass);
            }

            let trampoline: Function = ctx
                .globals()
                .get("__construct")
                .map_err(engine_js_error)?;
            let args_js = json_to_js(&ctx, args)?;
            let env_js = json_to_js(&ctx, env)?;

            let instance = trampoline
                .call::<_, Value>((class, args_js, env_js))
                .catch(&ctx)
                .map_err(|e| {
                    let reason = classify_caught(&ctx, e, debug).message();
                    ExecError::session(500, format!("Failed to open session: {reason}"))
                })?;

            let object = instance.into_object().ok_or_else(|| {
                ExecError::session(500, "Failed to open session: constructor returned no object")
            })?;
            Ok(Persistent::save(&ctx, object))
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_method(
        &self,
        context: ContextId,
        bridge: &Arc<Bridge>,
        handler: &Arc<Handler>,
        instance: Persistent<Object<'static>>,
        method: &str,
        args: &Json,
        args_twice: bool,
        optional: bool,
    ) -> ExecResult<CallReply> {
        let context_handle = self.context(context)?;
        bridge.set_current(handler.clone());
        let debug = handler.debug_enabled();

        async_with!(context_handle => |ctx| {
            let instance = instance.restore(&ctx).map_err(engine_js_error)?;
            let target: Value = instance.get(method).map_err(engine_js_error)?;
            let Some(function) = target.as_function().cloned() else {
                return if optional {
                    Ok(CallReply::Immediate(Json::Null))
                } else {
                    Err(ExecError::NoSuchMethod)
                };
            };

            let args_js = json_to_js(&ctx, args)?;
            let invoked = if args_twice {
                function
                    .call::<_, Value>((This(instance), args_js.clone(), args_js))
                    .catch(&ctx)
            } else {
                function
                    .call::<_, Value>((This(instance), args_js))
                    .catch(&ctx)
            };
            classify_invocation(&ctx, invoked, debug)
        })
        .await
    }

    async fn eval(
        &self,
        context: ContextId,
        bridge: &Arc<Bridge>,
        handler: &Arc<Handler>,
        source: &str,
    ) -> ExecResult<Json> {
        let context_handle = self.context(context)?;
        bridge.set_current(handler.clone());
        let debug = handler.debug_enabled();

        async_with!(context_handle => |ctx| {
            let value = ctx
                .eval_with_options::<Value, _>(source, eval_options())
                .catch(&ctx)
                .map_err(|e| classify_caught(&ctx, e, debug).into_public())?;
            js_to_json(&value)
        })
        .await
    }

    /// Deliver a host-call completion: restore the handler, then resolve or
    /// reject the deferred promise inside the context. Completions for a
    /// destroyed context are dropped.
    async fn deliver(&self, delivery: Delivery) {
        let Delivery {
            context,
            bridge,
            handler,
            resolve,
            reject,
            result,
        } = delivery;

        let Ok(context_handle) = self.context(context) else {
            debug!(worker = %self.name, "dropping delivery for destroyed context");
            return;
        };

        let outcome: ExecResult<()> = async_with!(context_handle => |ctx| {
            bridge.set_current(handler);
            match result {
                Ok(json) => {
                    let value = json_to_js(&ctx, &json)?;
                    resolve
                        .restore(&ctx)
                        .map_err(engine_js_error)?
                        .call::<_, ()>((value,))
                        .map_err(engine_js_error)
                }
                Err(err) => {
                    let err = err.into_public();
                    let value = error_value(&ctx, err.code(), &err.message())?;
                    reject
                        .restore(&ctx)
                        .map_err(engine_js_error)?
                        .call::<_, ()>((value,))
                        .map_err(engine_js_error)
                }
            }
        })
        .await;

        if let Err(e) = outcome {
            warn!(worker = %self.name, error = %e, "promise delivery failed");
        }
    }
}

/// Shared post-invocation classification: immediate value, promise, or
/// thrown error.
fn classify_invocation<'js>(
    ctx: &Ctx<'js>,
    invoked: Result<Value<'js>, rquickjs::CaughtError<'js>>,
    debug: bool,
) -> ExecResult<CallReply> {
    let value = match invoked {
        Err(caught) => return Err(classify_caught(ctx, caught, debug)),
        Ok(value) => value,
    };

    if value.as_promise().is_some() {
        let Some(promise_obj) = value.as_object().cloned() else {
            return Err(ExecError::engine("promise without object payload"));
        };
        let settled = attach_settlement(ctx, &promise_obj, debug)?;
        return Ok(CallReply::Pending(settled));
    }

    Ok(CallReply::Immediate(js_to_json(&value)?))
}

/// Shared eval options: global, non-strict classic script.
pub(crate) fn eval_options() -> EvalOptions {
    let mut opts = EvalOptions::default();
    opts.global = true;
    opts.strict = false;
    opts.promise = false;
    opts
}

/// Wire native callbacks onto a script promise; the returned receiver fires
/// once with the converted settlement.
fn attach_settlement<'js>(
    ctx: &Ctx<'js>,
    promise: &Object<'js>,
    debug: bool,
) -> ExecResult<oneshot::Receiver<ExecResult<Json>>> {
    let (tx, rx) = oneshot::channel::<ExecResult<Json>>();
    let slot = Arc::new(parking_lot::Mutex::new(Some(tx)));

    let on_resolved = Function::new(ctx.clone(), {
        let slot = slot.clone();
        move |value: Value| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(js_to_json(&value));
            }
        }
    })
    .map_err(engine_js_error)?;

    let on_rejected = Function::new(ctx.clone(), {
        let slot = slot.clone();
        move |ctx: Ctx<'_>, value: Value| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(Err(classify_thrown(&ctx, &value, debug)));
            }
        }
    })
    .map_err(engine_js_error)?;

    let then: Function = promise.get("then").map_err(engine_js_error)?;
    then.call::<_, ()>((This(promise.clone()), on_resolved, on_rejected))
        .map_err(engine_js_error)?;

    Ok(rx)
}
