//! Hand-rolled deserialization of turbo.json from the jsonc CST. Going
//! through the syntax tree instead of serde keeps the byte range of every
//! value, which is what lets validation errors point at the offending spot
//! in the file.

use jsonc_parser::{
    ast::{Array, Object, ObjectProp, Value},
    common::Range,
    CollectOptions, ParseOptions,
};
use miette::NamedSource;
use turborepo_errors::Spanned;

use super::{
    Error, OutputLogsMode, Pipeline, RawRemoteCacheOptions, RawTaskDefinition, RawTurboJson,
    UIMode, CONFIG_FILE,
};
use crate::{cli::EnvMode, task_id::TaskName};

fn source(text: &str) -> NamedSource {
    NamedSource::new(CONFIG_FILE, text.to_string())
}

fn span_of(range: Range) -> Option<miette::SourceSpan> {
    Some((range.start..range.end).into())
}

fn spanned<T>(value: T, range: Range) -> Spanned<T> {
    Spanned::new(value).with_range(range.start..range.end)
}

fn value_range(value: &Value) -> Range {
    match value {
        Value::Object(literal) => literal.range,
        Value::StringLit(literal) => literal.range,
        Value::NumberLit(literal) => literal.range,
        Value::BooleanLit(literal) => literal.range,
        Value::Array(literal) => literal.range,
        Value::NullKeyword(literal) => literal.range,
    }
}

pub fn parse_raw_turbo_json(text: &str) -> Result<RawTurboJson, Error> {
    let parsed = jsonc_parser::parse_to_ast(
        text,
        &CollectOptions {
            comments: false,
            tokens: false,
        },
        &ParseOptions::default(),
    )
    .map_err(|err| Error::Parse {
        message: err.to_string(),
        text: source(text),
        span: None,
    })?;

    let Some(Value::Object(root)) = parsed.value else {
        return Err(Error::UnexpectedType {
            expected: "an object at the top level",
            text: source(text),
            span: None,
        });
    };

    let mut raw = RawTurboJson::default();
    for prop in &root.properties {
        let key = prop.name.as_str();
        match key {
            "$schema" => raw.schema = Some(expect_string(&prop.value, text)?.into_inner()),
            "globalDependencies" => {
                raw.global_dependencies = Some(expect_string_array(&prop.value, text)?)
            }
            "globalEnv" => raw.global_env = Some(expect_string_array(&prop.value, text)?),
            "globalPassThroughEnv" => {
                raw.global_pass_through_env = Some(expect_string_array(&prop.value, text)?)
            }
            "globalCacheKey" => raw.global_cache_key = Some(expect_string(&prop.value, text)?),
            "remoteCache" => raw.remote_cache = Some(parse_remote_cache(&prop.value, text)?),
            "ui" => {
                let value = expect_string(&prop.value, text)?;
                let mode = match value.as_inner().as_str() {
                    "tui" => UIMode::Tui,
                    "stream" => UIMode::Stream,
                    _ => {
                        return Err(Error::UnexpectedType {
                            expected: "\"tui\" or \"stream\"",
                            text: source(text),
                            span: span_of(value_range(&prop.value)),
                        })
                    }
                };
                raw.ui = Some(value.to(mode));
            }
            "envMode" => {
                let value = expect_string(&prop.value, text)?;
                let mode = match value.as_inner().as_str() {
                    "strict" => EnvMode::Strict,
                    "loose" => EnvMode::Loose,
                    _ => {
                        return Err(Error::UnexpectedType {
                            expected: "\"strict\" or \"loose\"",
                            text: source(text),
                            span: span_of(value_range(&prop.value)),
                        })
                    }
                };
                raw.env_mode = Some(value.to(mode));
            }
            "cacheDir" => raw.cache_dir = Some(expect_string(&prop.value, text)?),
            "tasks" => raw.tasks = Some(parse_pipeline(&prop.value, text)?),
            "pipeline" => {
                let pipeline = parse_pipeline(&prop.value, text)?;
                raw.pipeline = Some(spanned(pipeline, prop.range));
            }
            "extends" => {
                let packages = expect_string_array(&prop.value, text)?;
                raw.extends = Some(spanned(packages, prop.range));
            }
            // the conventional comment key
            "//" => {}
            _ => {
                return Err(Error::UnknownKey {
                    key: key.to_string(),
                    text: source(text),
                    span: span_of(prop_name_range(prop)),
                })
            }
        }
    }

    Ok(raw)
}

fn parse_pipeline(value: &Value, text: &str) -> Result<Pipeline, Error> {
    let obj = expect_object(value, text, "a map of task definitions")?;
    let mut pipeline = Pipeline::default();
    for prop in &obj.properties {
        let task_name = TaskName::from(prop.name.as_str().to_string());
        let definition = parse_task_definition(&prop.value, text)?;
        pipeline.0.insert(task_name, spanned(definition, prop.range));
    }
    Ok(pipeline)
}

fn parse_task_definition(value: &Value, text: &str) -> Result<RawTaskDefinition, Error> {
    let obj = expect_object(value, text, "a task definition object")?;
    let mut definition = RawTaskDefinition::default();
    for prop in &obj.properties {
        let key = prop.name.as_str();
        match key {
            "cache" => definition.cache = Some(expect_bool(&prop.value, text)?),
            "dependsOn" => {
                let deps = expect_string_array(&prop.value, text)?;
                definition.depends_on = Some(spanned(deps, value_range(&prop.value)));
            }
            "env" => definition.env = Some(expect_string_array(&prop.value, text)?),
            "inputs" => definition.inputs = Some(expect_string_array(&prop.value, text)?),
            "passThroughEnv" => {
                definition.pass_through_env = Some(expect_string_array(&prop.value, text)?)
            }
            "persistent" => definition.persistent = Some(expect_bool(&prop.value, text)?),
            "interactive" => definition.interactive = Some(expect_bool(&prop.value, text)?),
            "outputs" => definition.outputs = Some(expect_string_array(&prop.value, text)?),
            "outputMode" | "outputLogs" => {
                let value = expect_string(&prop.value, text)?;
                let mode = match value.as_inner().as_str() {
                    "full" => OutputLogsMode::Full,
                    "none" => OutputLogsMode::None,
                    "hash-only" => OutputLogsMode::HashOnly,
                    "new-only" => OutputLogsMode::NewOnly,
                    "errors-only" => OutputLogsMode::ErrorsOnly,
                    _ => {
                        return Err(Error::UnexpectedType {
                            expected:
                                "one of \"full\", \"none\", \"hash-only\", \"new-only\", \"errors-only\"",
                            text: source(text),
                            span: span_of(value_range(&prop.value)),
                        })
                    }
                };
                definition.output_logs = Some(value.to(mode));
            }
            _ => {
                return Err(Error::UnknownKey {
                    key: key.to_string(),
                    text: source(text),
                    span: span_of(prop_name_range(prop)),
                })
            }
        }
    }
    Ok(definition)
}

fn parse_remote_cache(value: &Value, text: &str) -> Result<RawRemoteCacheOptions, Error> {
    let obj = expect_object(value, text, "a remoteCache configuration object")?;
    let mut options = RawRemoteCacheOptions::default();
    for prop in &obj.properties {
        match prop.name.as_str() {
            "teamId" => options.team_id = Some(expect_string(&prop.value, text)?),
            "signature" => options.signature = Some(expect_bool(&prop.value, text)?),
            "preflight" => options.preflight = Some(expect_bool(&prop.value, text)?),
            "enabled" => options.enabled = Some(expect_bool(&prop.value, text)?),
            key => {
                return Err(Error::UnknownKey {
                    key: key.to_string(),
                    text: source(text),
                    span: span_of(prop_name_range(prop)),
                })
            }
        }
    }
    Ok(options)
}

/// The range of just the property name, including its quotes.
fn prop_name_range(prop: &ObjectProp) -> Range {
    let mut range = prop.range;
    range.end = range.start + prop.name.as_str().len() + 2;
    range
}

fn expect_object<'a, 'b>(
    value: &'b Value<'a>,
    text: &str,
    expected: &'static str,
) -> Result<&'b Object<'a>, Error> {
    match value {
        Value::Object(obj) => Ok(obj),
        other => Err(Error::UnexpectedType {
            expected,
            text: source(text),
            span: span_of(value_range(other)),
        }),
    }
}

fn expect_string(value: &Value, text: &str) -> Result<Spanned<String>, Error> {
    match value {
        Value::StringLit(lit) => Ok(spanned(lit.value.to_string(), lit.range)),
        other => Err(Error::UnexpectedType {
            expected: "a string",
            text: source(text),
            span: span_of(value_range(other)),
        }),
    }
}

fn expect_bool(value: &Value, text: &str) -> Result<Spanned<bool>, Error> {
    match value {
        Value::BooleanLit(lit) => Ok(spanned(lit.value, lit.range)),
        other => Err(Error::UnexpectedType {
            expected: "a boolean",
            text: source(text),
            span: span_of(value_range(other)),
        }),
    }
}

fn expect_array<'a, 'b>(value: &'b Value<'a>, text: &str) -> Result<&'b Array<'a>, Error> {
    match value {
        Value::Array(array) => Ok(array),
        other => Err(Error::UnexpectedType {
            expected: "an array",
            text: source(text),
            span: span_of(value_range(other)),
        }),
    }
}

fn expect_string_array(value: &Value, text: &str) -> Result<Vec<Spanned<String>>, Error> {
    let array = expect_array(value, text)?;
    array
        .elements
        .iter()
        .map(|element| expect_string(element, text))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parses_comments_and_trailing_commas() {
        let raw = parse_raw_turbo_json(
            r#"{
                // the build pipeline
                "tasks": {
                    "build": {
                        "outputs": ["dist/**",],
                    },
                },
            }"#,
        )
        .unwrap();
        let tasks = raw.tasks.unwrap();
        let build = tasks.get(&TaskName::from("build")).unwrap();
        assert_eq!(build.outputs.as_ref().unwrap()[0].as_inner(), "dist/**");
    }

    #[test]
    fn test_unknown_root_key_is_an_error() {
        let err = parse_raw_turbo_json(r#"{"globlaEnv": []}"#).unwrap_err();
        match err {
            Error::UnknownKey { key, span, .. } => {
                assert_eq!(key, "globlaEnv");
                assert!(span.is_some());
            }
            other => panic!("expected unknown key error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_task_key_is_an_error() {
        let err = parse_raw_turbo_json(r#"{"tasks": {"build": {"caching": false}}}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownKey { .. }));
    }

    #[test]
    fn test_spans_point_into_source() {
        let text = r#"{"tasks": {"build": {"cache": false}}}"#;
        let raw = parse_raw_turbo_json(text).unwrap();
        let tasks = raw.tasks.unwrap();
        let cache = tasks
            .get(&TaskName::from("build"))
            .unwrap()
            .cache
            .as_ref()
            .unwrap();
        let range = cache.range.clone().unwrap();
        assert_eq!(&text[range], "false");
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = parse_raw_turbo_json("{").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_output_mode_aliases() {
        for key in ["outputMode", "outputLogs"] {
            let raw = parse_raw_turbo_json(&format!(
                r#"{{"tasks": {{"build": {{"{key}": "hash-only"}}}}}}"#
            ))
            .unwrap();
            let tasks = raw.tasks.unwrap();
            let build = tasks.get(&TaskName::from("build")).unwrap();
            assert_eq!(
                build.output_logs.as_ref().map(|mode| *mode.as_inner()),
                Some(OutputLogsMode::HashOnly)
            );
        }
    }
}
