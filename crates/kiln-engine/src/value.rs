//! Conversion between script values and host JSON.
//!
//! Script return values are walked into `serde_json::Value`: arrays become
//! sequences, plain objects become string-keyed maps, functions become the
//! literal `"[function Function]"`, primitives pass through and `undefined`
//! collapses to null. The walk keeps its own frame stack, so nesting depth
//! is unbounded. Host values travel the other way through the context's
//! JSON parser.

use rquickjs::{Array, Ctx, Object, Type, Value};
use serde_json::{Map, Number, Value as Json};

use crate::error::{ExecError, ExecResult};

/// Literal substituted for function values in converted results.
pub const FUNCTION_PLACEHOLDER: &str = "[function Function]";

/// The walk is iterative, so nesting depth is bounded by the heap rather
/// than the stack; this guard only exists to halt reference cycles, which
/// would otherwise walk forever. No realistic payload comes near it.
const CYCLE_GUARD_DEPTH: usize = 100_000;

pub(crate) fn engine_js_error(err: rquickjs::Error) -> ExecError {
    ExecError::engine(format!("js: {err}"))
}

enum Frame<'js> {
    Array {
        array: Array<'js>,
        index: usize,
        items: Vec<Json>,
    },
    Object {
        entries: std::vec::IntoIter<(String, Value<'js>)>,
        map: Map<String, Json>,
        pending: Option<String>,
    },
}

enum Step<'js> {
    /// A value still to be converted.
    Value(Value<'js>),
    /// Hand a finished child (or nothing, right after entering a
    /// container) back to the innermost frame.
    Resume(Option<Json>),
}

/// Convert a script value into host JSON.
pub fn js_to_json(value: &Value<'_>) -> ExecResult<Json> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut step = Step::Value(value.clone());

    loop {
        step = match step {
            Step::Value(value) => match value.type_of() {
                Type::Undefined | Type::Null => Step::Resume(Some(Json::Null)),
                Type::Bool => Step::Resume(Some(Json::Bool(value.as_bool().unwrap_or(false)))),
                Type::Int => Step::Resume(Some(Json::from(value.as_int().unwrap_or(0)))),
                Type::Float => {
                    let float = value.as_float().unwrap_or(0.0);
                    Step::Resume(Some(
                        Number::from_f64(float).map(Json::Number).unwrap_or(Json::Null),
                    ))
                }
                Type::String => {
                    let text = value
                        .as_string()
                        .and_then(|s| s.to_string().ok())
                        .unwrap_or_default();
                    Step::Resume(Some(Json::String(text)))
                }
                Type::Function | Type::Constructor => {
                    Step::Resume(Some(Json::String(FUNCTION_PLACEHOLDER.to_string())))
                }
                Type::Array => {
                    let array = value
                        .as_array()
                        .cloned()
                        .ok_or_else(|| ExecError::engine("array value without array payload"))?;
                    guard_depth(stack.len())?;
                    let capacity = array.len();
                    stack.push(Frame::Array {
                        array,
                        index: 0,
                        items: Vec::with_capacity(capacity),
                    });
                    Step::Resume(None)
                }
                // Plain objects and the remaining object-like types walk
                // their own enumerable string keys.
                _ => match value.as_object() {
                    None => Step::Resume(Some(Json::Null)),
                    Some(object) => {
                        guard_depth(stack.len())?;
                        let entries = collect_entries(object)?;
                        stack.push(Frame::Object {
                            entries: entries.into_iter(),
                            map: Map::new(),
                            pending: None,
                        });
                        Step::Resume(None)
                    }
                },
            },
            Step::Resume(done) => {
                let Some(frame) = stack.last_mut() else {
                    return Ok(done.unwrap_or(Json::Null));
                };
                match frame {
                    Frame::Array { array, index, items } => {
                        if let Some(json) = done {
                            items.push(json);
                        }
                        if *index < array.len() {
                            let child: Value =
                                array.get(*index).map_err(engine_js_error)?;
                            *index += 1;
                            Step::Value(child)
                        } else {
                            let items = std::mem::take(items);
                            stack.pop();
                            Step::Resume(Some(Json::Array(items)))
                        }
                    }
                    Frame::Object { entries, map, pending } => {
                        if let Some(json) = done {
                            if let Some(key) = pending.take() {
                                map.insert(key, json);
                            }
                        }
                        if let Some((key, child)) = entries.next() {
                            *pending = Some(key);
                            Step::Value(child)
                        } else {
                            let map = std::mem::take(map);
                            stack.pop();
                            Step::Resume(Some(Json::Object(map)))
                        }
                    }
                }
            }
        };
    }
}

fn guard_depth(depth: usize) -> ExecResult<()> {
    if depth >= CYCLE_GUARD_DEPTH {
        return Err(ExecError::execution(
            500,
            "Script value contains a reference cycle",
        ));
    }
    Ok(())
}

fn collect_entries<'js>(object: &Object<'js>) -> ExecResult<Vec<(String, Value<'js>)>> {
    let mut entries = Vec::new();
    for prop in object.props::<String, Value>() {
        entries.push(prop.map_err(engine_js_error)?);
    }
    Ok(entries)
}

/// Materialize host JSON inside the script context.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Json) -> ExecResult<Value<'js>> {
    let text = serde_json::to_string(value)
        .map_err(|e| ExecError::engine(format!("serializing value: {e}")))?;
    ctx.json_parse(text).map_err(engine_js_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn convert(source: &str) -> ExecResult<Json> {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let value: Value = ctx.eval(source).unwrap();
            js_to_json(&value)
        })
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(convert("42").unwrap(), json!(42));
        assert_eq!(convert("2.5").unwrap(), json!(2.5));
        assert_eq!(convert("true").unwrap(), json!(true));
        assert_eq!(convert("'hi'").unwrap(), json!("hi"));
        assert_eq!(convert("null").unwrap(), Json::Null);
        assert_eq!(convert("undefined").unwrap(), Json::Null);
    }

    #[test]
    fn arrays_and_objects_recurse() {
        assert_eq!(
            convert("([1, 'two', [3], {four: 4}])").unwrap(),
            json!([1, "two", [3], {"four": 4}])
        );
        assert_eq!(
            convert("({a: {b: {c: 'deep'}}})").unwrap(),
            json!({"a": {"b": {"c": "deep"}}})
        );
    }

    #[test]
    fn functions_become_placeholder() {
        assert_eq!(
            convert("(function named() {})").unwrap(),
            json!(FUNCTION_PLACEHOLDER)
        );
        assert_eq!(
            convert("({f: () => 1, x: 2})").unwrap(),
            json!({"f": FUNCTION_PLACEHOLDER, "x": 2})
        );
    }

    #[test]
    fn round_trip_through_context() {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        let original = json!({"list": [1, 2, 3], "name": "kiln", "on": true});
        let back = ctx.with(|ctx| {
            let value = json_to_js(&ctx, &original).unwrap();
            js_to_json(&value).unwrap()
        });
        assert_eq!(back, original);
    }

    #[test]
    fn deep_nesting_converts() {
        // Built with a loop so the depth comes from the data, not the
        // parser.
        let result = convert(
            r#"(function() {
                var v = 1;
                for (var i = 0; i < 5000; i++) {
                    v = [v];
                }
                return v;
            })()"#,
        )
        .unwrap();

        let mut depth = 0;
        let mut cursor = &result;
        while let Json::Array(items) = cursor {
            assert_eq!(items.len(), 1);
            cursor = &items[0];
            depth += 1;
        }
        assert_eq!(depth, 5000);
        assert_eq!(*cursor, json!(1));
    }

    #[test]
    fn cyclic_values_are_rejected() {
        let result = convert(
            r#"(function() {
                var a = [];
                a.push(a);
                return a;
            })()"#,
        );
        assert!(result.is_err());
    }
}
