//! Unit tests for host command-line splitting.

use agent_conduit::client::parse_command;

fn split(input: &str) -> Vec<String> {
    parse_command(input)
}

fn words(expected: &[&str]) -> Vec<String> {
    expected.iter().map(|w| (*w).to_owned()).collect()
}

/// Table of inputs and the argument vectors they must produce.
#[test]
fn splits_like_a_shell() {
    let cases: &[(&str, &str, &[&str])] = &[
        ("simple", "ls -la", &["ls", "-la"]),
        ("double quotes", r#"echo "hello world""#, &["echo", "hello world"]),
        ("single quotes", "echo 'hello world'", &["echo", "hello world"]),
        (
            "quotes inside an argument",
            r#"program --name="test value" --other='another value'"#,
            &["program", "--name=test value", "--other=another value"],
        ),
        ("escaped spaces", r"path\ with\ spaces arg2", &["path with spaces", "arg2"]),
        ("repeated spaces", "cmd    arg1     arg2", &["cmd", "arg1", "arg2"]),
        ("tabs", "cmd\targ1\targ2", &["cmd", "arg1", "arg2"]),
        (
            "npx launcher",
            r#"npx ts-node --project "./tsconfig.json" index.ts"#,
            &["npx", "ts-node", "--project", "./tsconfig.json", "index.ts"],
        ),
        ("equals", "env VAR=value cmd", &["env", "VAR=value", "cmd"]),
        ("nested quotes", r#"echo "he said 'hello'""#, &["echo", "he said 'hello'"]),
        ("escaped backslash", r"path\\to\\file", &["path\\to\\file"]),
    ];

    for (name, input, expected) in cases {
        assert_eq!(split(input), words(expected), "case: {name}");
    }
}

/// Empty and whitespace-only input produce no arguments.
#[test]
fn blank_input_is_empty() {
    assert!(split("").is_empty());
    assert!(split("   \t  ").is_empty());
}
