use proptest::prelude::*;
use serde_json::json;
use tracery_expr::{Expression, MAX_DEPTH};
use tracery_types::TraceryError;

fn literal() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z ]{0,6}".prop_map(|s| format!("'{s}'")),
        "[a-z]{0,6}".prop_map(|s| format!("\"{s}\"")),
        any::<i32>().prop_map(|n| n.to_string()),
        (-1000i32..1000, 0u32..100).prop_map(|(a, b)| format!("{a}.{b}")),
        Just("true".to_string()),
        Just("False".to_string()),
        Just("None".to_string()),
        Just("null".to_string()),
    ]
}

fn field() -> impl Strategy<Value = String> {
    let key = "[a-z_]{1,8}";
    prop_oneof![
        key.prop_map(|k| format!("row['{k}']")),
        (key, 0u8..4).prop_map(|(k, i)| format!("row['{k}'][{i}]")),
        (key, key).prop_map(|(a, b)| format!("row[\"{a}\"]['{b}']")),
        key.prop_map(|k| format!("row.get('{k}')")),
        (key, literal()).prop_map(|(k, d)| format!("row.get('{k}', {d})")),
    ]
}

fn list() -> impl Strategy<Value = String> {
    (proptest::collection::vec(literal(), 0..4), any::<bool>()).prop_map(|(items, trailing)| {
        let mut out = items.join(", ");
        if trailing && !items.is_empty() {
            out.push(',');
        }
        format!("[{out}]")
    })
}

fn operator() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("=="),
        Just("!="),
        Just("<"),
        Just("<="),
        Just(">"),
        Just(">="),
        Just("in"),
        Just("not in"),
    ]
}

fn comparison() -> impl Strategy<Value = String> {
    let operand = prop_oneof![literal(), field(), list()].boxed();
    prop_oneof![
        field(),
        (operand.clone(), operator(), operand).prop_map(|(l, op, r)| format!("{l} {op} {r}")),
    ]
}

/// Expressions that the grammar accepts.
fn valid_expression() -> impl Strategy<Value = String> {
    comparison().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("{a} and {b}")),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("{a} or {b}")),
            inner.clone().prop_map(|a| format!("not {a}")),
            inner.clone().prop_map(|a| format!("({a})")),
            (inner, operator(), field()).prop_map(|(a, op, f)| format!("({a}) {op} {f}")),
        ]
    })
}

const FORBIDDEN: &[&str] = &[
    "len(row)",
    "row.x",
    "row.keys()",
    "lambda: 1",
    "[c for c in row]",
    "x := 1",
    "row['a'] if True else 1",
    "{'a': 1}",
    "row[0:1]",
    "row['a'][1:]",
    "row['a'] + 1",
    "row['a'] ** 2",
    "-row['a']",
    "row.get('a').upper()",
    "True.__class__",
    "__import__('os')",
    "eval('1')",
    "open('/etc/passwd')",
    "row['a'] is None",
    "row['a'] == 1 == 2",
    "1 < row['a'] < 5",
    "f'{x}'",
    "*row",
    "not",
    "((row['a'])",
    "row['a'],",
    "row",
    "row[row['a']]",
    "'a'.join(row)",
    "globals()",
    "row['a'] & 1",
    "row['a']; 1",
];

fn combine(valid: &str, fragment: &str, shape: u8) -> String {
    match shape % 5 {
        0 => format!("{valid} and {fragment}"),
        1 => format!("{fragment} or {valid}"),
        2 => format!("({fragment})"),
        3 => format!("not {fragment}"),
        _ => format!("{valid} or not ({fragment})"),
    }
}

fn row() -> tracery_types::RowData {
    json!({
        "a": 1,
        "b": "text",
        "items": [1, 2, 3],
        "nested": {"k": true},
        "confidence": 0.9,
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn valid_grammar_always_parses(src in valid_expression()) {
        let parsed = Expression::parse(&src);
        prop_assert!(parsed.is_ok(), "`{}` was rejected: {:?}", src, parsed.err());
    }

    #[test]
    fn evaluation_never_panics(src in valid_expression()) {
        if let Ok(expr) = Expression::parse(&src) {
            let _ = expr.evaluate("fuzz", &row());
        }
    }

    #[test]
    fn forbidden_constructs_are_rejected(
        valid in valid_expression(),
        idx in 0..FORBIDDEN.len(),
        shape in any::<u8>(),
    ) {
        let src = combine(&valid, FORBIDDEN[idx], shape);
        let result = Expression::parse(&src);
        prop_assert!(
            matches!(result, Err(TraceryError::ExpressionSyntax { .. })),
            "`{}` was accepted",
            src
        );
    }

    #[test]
    fn arbitrary_text_never_panics(src in "\\PC{0,40}") {
        let _ = Expression::parse(&src);
    }
}

#[test]
fn nesting_beyond_the_cap_is_rejected() {
    let src = format!(
        "{}row['a'] == 1{}",
        "(".repeat(MAX_DEPTH + 1),
        ")".repeat(MAX_DEPTH + 1)
    );
    assert!(Expression::parse(&src).is_err());
}

#[test]
fn every_forbidden_fragment_is_rejected_on_its_own() {
    for fragment in FORBIDDEN {
        assert!(
            Expression::parse(fragment).is_err(),
            "`{fragment}` was accepted"
        );
    }
}

#[test]
fn long_connective_chains_evaluate_without_deep_recursion() {
    let conjunction = vec!["row['a'] == 1"; 50_000].join(" and ");
    let expr = Expression::parse(&conjunction).unwrap();
    assert!(expr.evaluate_bool("chain", &row()).unwrap());
    drop(expr);

    let mut clauses = vec!["row['a'] == 2"; 50_000];
    clauses.push("row['b'] == 'text'");
    let disjunction = Expression::parse(&clauses.join(" or ")).unwrap();
    assert!(disjunction.evaluate_bool("chain", &row()).unwrap());
}
