use weft::{Engine, Value};

#[test]
fn test_expressions_interpolate() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ 1 + 2 * 3 }"), "7");
    assert_eq!(engine.render_str("{ (1 + 2) * 3 }"), "9");
    assert_eq!(engine.render_str("{ 7 / 2 }"), "3");
    assert_eq!(engine.render_str("{ 7 % 3 }"), "1");
    assert_eq!(engine.render_str("{ 1 + 2.5 }"), "3.5");
    assert_eq!(engine.render_str("{ -4 }"), "-4");
    assert!(engine.diagnostics().is_empty());
}

#[test]
fn test_text_passes_through() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("plain text"), "plain text");
    assert_eq!(engine.render_str("a{ 'b' }c"), "abc");
    assert_eq!(engine.render_str(""), "");
    assert_eq!(engine.render_str("{# a comment #}left"), "left");
    assert_eq!(engine.render_str("x{# {# nested #} #}y"), "xy");
}

#[test]
fn test_if_follows_truthiness() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ if 0 }yes{ else }no{ end }"), "no");
    assert_eq!(engine.render_str("{ if 'x' }yes{ else }no{ end }"), "yes");
    assert_eq!(engine.render_str("{ if '' }yes{ else }no{ end }"), "no");
    assert_eq!(engine.render_str("{ if [] }yes{ else }no{ end }"), "no");
    assert_eq!(engine.render_str("{ if [0] }yes{ else }no{ end }"), "yes");
    assert_eq!(engine.render_str("{ if {} }yes{ else }no{ end }"), "no");
    assert_eq!(engine.render_str("{ if 0.0 }yes{ else }no{ end }"), "no");
    // No else branch: a false condition renders nothing.
    assert_eq!(engine.render_str("{ if 0 }yes{ end }"), "");
}

#[test]
fn test_else_if_chains() {
    let engine = Engine::new();

    let source = "{ x = 2 }{ if x == 1 }one{ else if x == 2 }two{ else }many{ end }";
    assert_eq!(engine.render_str(source), "two");

    let source = "{ x = 9 }{ if x == 1 }one{ else if x == 2 }two{ else }many{ end }";
    assert_eq!(engine.render_str(source), "many");
}

#[test]
fn test_logical_operators() {
    let engine = Engine::new();

    // `and` yields the right operand when the left is truthy, else nil;
    // `or` yields the left when truthy, else the right.
    assert_eq!(engine.render_str("{ 2 and 3 }"), "3");
    assert_eq!(engine.render_str("{ 0 and 3 }"), "");
    assert_eq!(engine.render_str("{ 2 or 3 }"), "2");
    assert_eq!(engine.render_str("{ 0 or 3 }"), "3");
    assert_eq!(engine.render_str("{ 0 or 0 }"), "0");
    assert_eq!(engine.render_str("{ if not 0 }y{ end }"), "y");
}

#[test]
fn test_string_concatenation() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ 'a' + 'b' }"), "ab");
    assert_eq!(engine.render_str("{ 'n=' + 42 }"), "n=42");
    assert_eq!(engine.render_str("{ 1 + ' item' }"), "1 item");
    // Nil and false vanish in concatenation.
    assert_eq!(engine.render_str("{ '' + x? + 'ok' }"), "ok");
}

#[test]
fn test_interpolated_strings() {
    let engine = Engine::new();

    assert_eq!(engine.render_str(r#"{ s = "a{ 1 + 2 }b" }{ s }"#), "a3b");
    assert_eq!(engine.render_str(r#"{ "{ 'x' }{ 'y' }" }"#), "xy");
    // Escaped braces stay literal.
    assert_eq!(engine.render_str(r#"{ "\{ not code \}" }"#), "{ not code }");
}

#[test]
fn test_verbatim_strings() {
    let engine = Engine::new();

    assert_eq!(engine.render_str(r#"{ """{ raw }\n""" }"#), r"{ raw }\n");
}

#[test]
fn test_statement_separators() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ a = 2; b = 3; a * b }"), "6");
    assert_eq!(engine.render_str("{ a = 2\n b = 3\n a + b }"), "5");
}

#[test]
fn test_script_mode() {
    let engine = Engine::new();

    // The root of a script is a block, so its value is the concatenated
    // output.
    assert_eq!(engine.eval_script_str("a = 6\na * 7"), Value::string("42"));
    assert_eq!(
        engine.eval_script_str("if 1 do 'yes' else 'no' end"),
        Value::string("yes")
    );
    // A multi-statement run concatenates stringifications.
    assert_eq!(engine.eval_script_str("1\n2"), Value::string("12"));
}

#[test]
fn test_equality_is_structural_and_kind_gated() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ if 1 == 1.0 }y{ else }n{ end }"), "n");
    assert_eq!(engine.render_str("{ if [1, 2] == [1, 2] }y{ else }n{ end }"), "y");
    assert_eq!(
        engine.render_str("{ if { a: 1 } == { a: 1 } }y{ else }n{ end }"),
        "y"
    );
    assert_eq!(engine.render_str("{ if 'a' != 'b' }y{ else }n{ end }"), "y");
}

#[test]
fn test_comparisons_are_numeric_only() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ if 1 < 2.5 }y{ end }"), "y");
    assert_eq!(engine.render_str("{ if 3 >= 3 }y{ end }"), "y");

    let _ = engine.render_str("{ 'a' < 'b' }");
    assert!(engine.has_errors());
}

#[test]
fn test_division_by_zero_is_diagnosed() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ 1 / 0 }"), "");
    assert_eq!(engine.render_str("{ 1 % 0 }"), "");
    assert_eq!(engine.diagnostics().len(), 2);
    assert!(engine.has_errors());

    // Float division follows IEEE-754 instead.
    let engine = Engine::new();
    assert_eq!(engine.render_str("{ 1.0 / 0.0 }"), "inf");
    assert!(engine.diagnostics().is_empty());
}

#[test]
fn test_type_errors_yield_nil_and_continue() {
    let engine = Engine::new();

    // The faulty position becomes nil; the rest still renders.
    assert_eq!(engine.render_str("a{ 1 + [] }b"), "ab");
    assert_eq!(engine.diagnostics().len(), 1);
    assert!(engine.has_errors());
}

#[test]
fn test_undefined_variables_are_diagnosed() {
    let engine = Engine::new();

    assert_eq!(engine.render_str("{ missing }"), "");
    let diags = engine.diagnostics();
    assert_eq!(diags.len(), 1);
    let diag = diags.iter().next().expect("one diagnostic");
    assert!(diag.message.contains("undefined variable: missing"));
}

#[test]
fn test_rendering_is_deterministic() {
    let engine = Engine::new();

    let source = "{ o = { b: 2, a: 1 } }{ for k, v in o }{ k }{ v }{ end }";
    let first = engine.render_str(source);
    let second = engine.render_str(source);
    assert_eq!(first, second);
    assert_eq!(first, "b2a1");
}
