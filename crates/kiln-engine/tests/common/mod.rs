//! Shared fixtures: an engine wired to in-memory collaborators with a test
//! application bound to one commit.

use std::sync::Arc;
use std::time::Duration;

use kiln_engine::{
    Collaborators, Engine, EngineConfig, Env, LogPublisher, MemoryFunctionRepo,
    MemoryProjectSettings, MemorySourceStore, NullDownstream, SourceFile,
};

pub const GAMESPACE: &str = "1";
pub const ACCOUNT: &str = "100";
pub const APP: &str = "testapp";
pub const VERSION: &str = "0.1";
pub const COMMIT: &str = "f1e2d3";

pub const TEST_JS: &str = r#"
function TestClass() {
}

TestClass.prototype.test_call = async function(args) {
    return "test";
};

TestClass.prototype._test_disallowed = async function(args) {
    return "test";
};

TestClass.allow_session = true;

function TestDisallowedClass() {
}

function SlowSum() {
}

SlowSum.prototype.sum = async function(args) {
    await sleep(0.5);
    return args["a"] + args["b"];
};

SlowSum.allow_session = true;

function Counter() {
    this.count = 0;
}

Counter.prototype.bump = async function(args) {
    this.count += 1;
    return this.count;
};

Counter.allow_session = true;

var released_code = null;

function ReleaseProbe() {
}

ReleaseProbe.prototype.noop = async function(args) {
    return "ok";
};

ReleaseProbe.prototype.released = function(args) {
    released_code = args["code"];
};

ReleaseProbe.allow_session = true;

function get_released_code(args) {
    return released_code;
}

get_released_code.allow_call = true;

function simple_call(args) {
    return "simple_call_test_" + args["arg1"];
}

simple_call.allow_call = true;

function simple_call_sum(args) {
    return args["arg1"] + args["arg2"];
}

simple_call_sum.allow_call = true;

function error_call(args) {
    throw new Error(args["code"], args["message"]);
}

error_call.allow_call = true;

function simple_call_disallowed() {
    return "simple_call_test";
}

function object_call(args) {
    return {"list": [1, 2, 3], "name": "kiln", "nested": {"on": true}};
}

object_call.allow_call = true;

function busy_loop(args) {
    while (true) {
    }
}

busy_loop.allow_call = true;

async function slow_async(args) {
    await sleep(0.05);
    return "done";
}

slow_async.allow_call = true;

async function downstream_code(args) {
    try {
        await store.get("gold");
        return "unexpected";
    } catch (e) {
        return {"code": e.code, "reason": e.reason};
    }
}

downstream_code.allow_call = true;

function admin_visible(args) {
    return typeof admin !== "undefined";
}

admin_visible.allow_call = true;
"#;

pub struct Fixture {
    pub engine: Engine,
    pub sources: Arc<MemorySourceStore>,
    pub settings: Arc<MemoryProjectSettings>,
    pub functions: Arc<MemoryFunctionRepo>,
}

pub fn fixture(config: EngineConfig) -> Fixture {
    let sources = Arc::new(MemorySourceStore::new());
    let settings = Arc::new(MemoryProjectSettings::new());
    let functions = Arc::new(MemoryFunctionRepo::new());

    sources.put(
        GAMESPACE,
        APP,
        COMMIT,
        vec![SourceFile::new("test.js", TEST_JS)],
    );
    settings.bind_version(GAMESPACE, APP, VERSION, COMMIT);

    let collaborators = Collaborators {
        sources: sources.clone(),
        settings: settings.clone(),
        functions: functions.clone(),
        downstream: Arc::new(NullDownstream),
        publisher: Arc::new(LogPublisher),
    };
    let engine = Engine::new(config, collaborators).expect("engine start");

    Fixture {
        engine,
        sources,
        settings,
        functions,
    }
}

pub fn default_fixture() -> Fixture {
    fixture(EngineConfig::default().js_workers(2))
}

pub fn quick_release_fixture() -> Fixture {
    fixture(
        EngineConfig::default()
            .js_workers(2)
            .build_idle_release(Duration::from_millis(200)),
    )
}

pub fn env() -> Env {
    Env::new(GAMESPACE, ACCOUNT).application(APP, VERSION)
}
