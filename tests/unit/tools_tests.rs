//! Unit tests for the tool registry and built-in toolkits.

use agent_conduit::host::tools::normalize_arguments;
use agent_conduit::host::ToolRegistry;
use agent_conduit::AppError;
use serde_json::{json, Value};

#[tokio::test]
async fn builtin_add_returns_whole_numbers() {
    let registry = ToolRegistry::with_builtins();
    let (toolkit, tool) = registry.find("add", None).expect("add exists");
    assert_eq!(toolkit, "utility");

    let out = tool.execute(json!({"a": 1, "b": 2})).await.expect("add runs");
    assert_eq!(out.to_string(), "3");

    let out = tool.execute(json!({"a": 0.5, "b": 2})).await.expect("add runs");
    assert_eq!(out, json!(2.5));
}

#[tokio::test]
async fn builtin_text_tools() {
    let registry = ToolRegistry::with_builtins();

    let (_, count) = registry.find("word_count", Some("text")).expect("word_count");
    let out = count
        .execute(json!({"text": "one two  three"}))
        .await
        .expect("word_count runs");
    assert_eq!(out, json!(3));

    let (_, echo) = registry.find("echo", None).expect("echo");
    let out = echo.execute(json!({"text": "hi"})).await.expect("echo runs");
    assert_eq!(out, Value::String("hi".into()));
}

/// Missing arguments surface as tool errors rather than panics.
#[tokio::test]
async fn missing_argument_is_tool_error() {
    let registry = ToolRegistry::with_builtins();
    let (_, add) = registry.find("add", None).expect("add exists");

    let err = add.execute(json!({"a": 1})).await.expect_err("b missing");
    assert!(matches!(err, AppError::Tool(msg) if msg.ends_with(": b")));
}

#[test]
fn find_respects_toolkit_filter() {
    let registry = ToolRegistry::with_builtins();

    assert!(registry.find("add", Some("utility")).is_ok());
    assert!(matches!(
        registry.find("add", Some("text")),
        Err(AppError::NotFound(msg)) if msg.contains("text")
    ));
    assert!(matches!(registry.find("nope", None), Err(AppError::NotFound(_))));
}

#[test]
fn agent_scope_limits_visible_tools() {
    let registry = ToolRegistry::with_builtins();
    let text_only = vec!["text".to_owned()];

    assert!(registry.find_in("add", &text_only).is_none());
    assert!(registry.find_in("uppercase", &text_only).is_some());

    let names: Vec<_> = registry
        .tools_for(&text_only)
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["word_count", "uppercase"]);
}

#[test]
fn listings_cover_every_toolkit() {
    let registry = ToolRegistry::with_builtins();

    assert_eq!(registry.toolkit_names(), vec!["utility", "text"]);
    let kits = registry.toolkit_infos();
    assert_eq!(kits[0].tools.len(), 3);
    let tools = registry.tool_infos();
    assert_eq!(tools.len(), 5);
    assert!(tools
        .iter()
        .any(|t| t.name == "word_count" && t.toolkit_name == "text"));
}

/// Arguments sent as a JSON-encoded string are decoded before execution.
#[test]
fn string_arguments_are_decoded() {
    assert_eq!(
        normalize_arguments(Value::String(r#"{"a":1}"#.into())),
        json!({"a": 1})
    );
    assert_eq!(
        normalize_arguments(Value::String("plain".into())),
        Value::String("plain".into())
    );
    assert_eq!(normalize_arguments(Value::Null), json!({}));
    assert_eq!(normalize_arguments(json!({"b": 2})), json!({"b": 2}));
}
