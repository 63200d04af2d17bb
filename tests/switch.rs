use weft::Engine;

#[test]
fn test_switch_matches_first_case() {
    let engine = Engine::new();

    let source = "{ x = 2 }{ switch x }{ case 1 }one{ case 2 }two{ case 2 }late{ end }";
    assert_eq!(engine.render_str(source), "two");
}

#[test]
fn test_switch_default() {
    let engine = Engine::new();

    let source = "{ x = 9 }{ switch x }{ case 1 }one{ default }other{ end }";
    assert_eq!(engine.render_str(source), "other");

    // No default, no match: nothing.
    let source = "{ x = 9 }{ switch x }{ case 1 }one{ end }";
    assert_eq!(engine.render_str(source), "");
}

#[test]
fn test_switch_compares_structurally() {
    let engine = Engine::new();

    let source = "{ x = [1, 2] }{ switch x }{ case [9] }a{ case [1, 2] }b{ default }c{ end }";
    assert_eq!(engine.render_str(source), "b");

    let source = "{ switch 'key' }{ case 'key' }hit{ default }miss{ end }";
    assert_eq!(engine.render_str(source), "hit");
}

#[test]
fn test_switch_does_not_cross_numeric_kinds() {
    let engine = Engine::new();

    let source = "{ switch 1 }{ case 1.0 }float{ default }int only{ end }";
    assert_eq!(engine.render_str(source), "int only");
}

#[test]
fn test_switch_case_keys_evaluate_in_order() {
    let engine = Engine::new();

    // The scrutinee is evaluated once, case keys in declaration order.
    let source = "{ n = 1 }{ switch 3 }{ case n + 0 }a{ case n + 2 }b{ end }";
    assert_eq!(engine.render_str(source), "b");
}

#[test]
fn test_inline_switch_in_script_mode() {
    let engine = Engine::new();

    let value = engine.eval_script_str("switch 2 case 1 do 'a' case 2 do 'b' default do 'c' end");
    assert_eq!(value.render_to_string(), "b");
}
