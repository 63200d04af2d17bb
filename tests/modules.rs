use std::path::Path;
use std::rc::Rc;
use weft::sitemap::{self, names, SiteEntry};
use weft::{Arena, Engine, ModuleKind, ParseMode, Value};

fn write(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(&path, contents).expect("write");
    path
}

#[test]
fn test_module_loads_are_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write(dir.path(), "page.html", "hi");

    let engine = Engine::new();
    let first = engine.load_module(&path, ParseMode::Template).expect("load");
    let second = engine.load_module(&path, ParseMode::Template).expect("load");
    assert!(Rc::ptr_eq(&first, &second));
}

#[test]
fn test_parse_errors_are_rereported_per_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write(dir.path(), "broken.html", "{ 1 + }");

    let engine = Engine::new();
    let module = engine.load_module(&path, ParseMode::Template).expect("load");
    assert!(module.parse_error());
    let after_first = engine.diagnostics().len();
    assert!(after_first >= 1);

    let _ = engine.load_module(&path, ParseMode::Template).expect("load");
    assert_eq!(engine.diagnostics().len(), after_first * 2);

    // Evaluation of a broken module is skipped entirely.
    let arena = Arena::new();
    let env = arena.root_env();
    assert_eq!(engine.eval_module(&module, &env), Value::Nil);
}

#[test]
fn test_registered_system_modules_serve_layouts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = write(dir.path(), "page.html", "{ LAYOUT = '/virtual/layout.html' }hi");

    let engine = Engine::new();
    let registered = engine.register_module(
        Path::new("/virtual/layout.html"),
        "<v>{ CONTENT }</v>",
        ParseMode::Template,
    );
    assert_eq!(registered.kind(), ModuleKind::System);

    // Loading the registered path never touches the filesystem.
    let loaded =
        engine.load_module(Path::new("/virtual/layout.html"), ParseMode::Template).expect("cached");
    assert!(Rc::ptr_eq(&registered, &loaded));

    let arena = Arena::new();
    let env = arena.root_env();
    engine.set_global(&env, names::LAYOUT, Value::Nil);
    engine.set_global(&env, names::CONTENT, Value::Nil);

    let output = sitemap::render_page(&engine, &page, &env).expect("render");
    assert_eq!(output, "<v>hi</v>");
    assert!(engine.diagnostics().is_empty(), "{:?}", engine.diagnostics());
}

#[test]
fn test_system_module_errors_report_once() {
    let engine = Engine::new();
    let broken =
        engine.register_module(Path::new("/virtual/broken.html"), "{ 1 + }", ParseMode::Template);
    assert!(broken.parse_error());
    let reported = engine.diagnostics().len();
    assert!(reported >= 1);

    // Unlike file modules, later requests do not repeat the report.
    let _ = engine.load_module(Path::new("/virtual/broken.html"), ParseMode::Template);
    let _ = engine.load_module(Path::new("/virtual/broken.html"), ParseMode::Template);
    assert_eq!(engine.diagnostics().len(), reported);
}

#[test]
fn test_missing_modules_are_diagnosed() {
    let engine = Engine::new();
    let missing = std::path::Path::new("/definitely/not/here.html");
    assert!(engine.load_module(missing, ParseMode::Template).is_none());
    assert!(engine.has_errors());
}

#[test]
fn test_layout_chaining() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = write(dir.path(), "page.html", "{ LAYOUT = 'layout.html' }hi");
    write(dir.path(), "layout.html", "[{ CONTENT }]");

    let engine = Engine::new();
    let arena = Arena::new();
    let env = arena.root_env();
    engine.set_global(&env, names::LAYOUT, Value::Nil);
    engine.set_global(&env, names::CONTENT, Value::Nil);

    let output = sitemap::render_page(&engine, &page, &env).expect("render");
    assert_eq!(output, "[hi]");
    assert!(engine.diagnostics().is_empty());
}

#[test]
fn test_layouts_chain_transitively() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = write(dir.path(), "post.html", "{ LAYOUT = 'inner.html' }body");
    write(dir.path(), "inner.html", "{ LAYOUT = 'outer.html' }<i>{ CONTENT }</i>");
    write(dir.path(), "outer.html", "<o>{ CONTENT }</o>");

    let engine = Engine::new();
    let arena = Arena::new();
    let env = arena.root_env();
    engine.set_global(&env, names::LAYOUT, Value::Nil);
    engine.set_global(&env, names::CONTENT, Value::Nil);

    let output = sitemap::render_page(&engine, &page, &env).expect("render");
    assert_eq!(output, "<o><i>body</i></o>");
}

#[test]
fn test_layouts_resolve_relative_to_the_template() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = write(dir.path(), "posts/entry.html", "{ LAYOUT = '../layout.html' }x");
    write(dir.path(), "layout.html", "({ CONTENT })");

    let engine = Engine::new();
    let arena = Arena::new();
    let env = arena.root_env();
    engine.set_global(&env, names::LAYOUT, Value::Nil);
    engine.set_global(&env, names::CONTENT, Value::Nil);

    let output = sitemap::render_page(&engine, &page, &env).expect("render");
    assert_eq!(output, "(x)");
}

#[test]
fn test_site_map_replay_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("src");
    write(&src, "page.html", "{ LAYOUT = 'layout.html' }Hello from { PATH }");
    write(&src, "layout.html", "<html>{ CONTENT }</html>");

    let mut engine = Engine::new();
    engine.register_native("add_page", 3, Some(4), |ctx, args| {
        let engine = ctx.engine();
        let symbols = ctx.symbols();
        let Some(Value::Array(site_map)) = engine.get_global(ctx.env(), names::SITE_MAP) else {
            ctx.fail("SITE_MAP is not an array");
            return Value::Nil;
        };
        let mut entry = weft::ValueMap::new();
        entry.insert(Value::Symbol(symbols.intern("type")), Value::string("template"));
        entry.insert(Value::Symbol(symbols.intern("src")), args[0].clone());
        entry.insert(Value::Symbol(symbols.intern("dest")), args[1].clone());
        entry.insert(Value::Symbol(symbols.intern("web_path")), args[2].clone());
        if let Some(data) = args.get(3) {
            entry.insert(Value::Symbol(symbols.intern("data")), data.clone());
        }
        site_map.borrow_mut().push(Value::object(entry));
        Value::Nil
    });

    let script_arena = Arena::new();
    let globals = script_arena.root_env();
    sitemap::install_globals(
        &engine,
        &globals,
        &src.display().to_string(),
        &dir.path().join("dist").display().to_string(),
    );

    let script = engine.compile(
        "add_page('page.html', '/page/index.html', '/page/')",
        ParseMode::Script,
    );
    let _ = engine.eval_module(&script, &globals);

    let entries = sitemap::site_map_entries(&engine, &globals);
    assert_eq!(entries.len(), 1);
    match &entries[0] {
        SiteEntry::Template { src, dest, web_path, .. } => {
            assert_eq!(src.to_string(), "page.html");
            assert_eq!(dest.to_string(), "/page/index.html");
            assert_eq!(web_path.to_string(), "/page/");
        }
        other => panic!("expected template entry, got {other:?}"),
    }

    let (dest, output) =
        sitemap::render_entry(&engine, &globals, &entries[0]).expect("rendered");
    assert_eq!(dest.to_string(), "/page/index.html");
    assert_eq!(output, "<html>Hello from /page/</html>");
    assert!(engine.diagnostics().is_empty(), "{:?}", engine.diagnostics());
}

#[test]
fn test_exports_flow_into_layouts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let page = write(dir.path(), "page.html", "{ export title = 'T' }{ LAYOUT = 'l.html' }b");
    write(dir.path(), "l.html", "{ title }:{ CONTENT }");

    let engine = Engine::new();
    let arena = Arena::new();
    let env = arena.root_env();
    engine.set_global(&env, names::LAYOUT, Value::Nil);
    engine.set_global(&env, names::CONTENT, Value::Nil);

    // The layout evaluates in the same environment chain, so exported
    // bindings are visible to it.
    let output = sitemap::render_page(&engine, &page, &env).expect("render");
    assert_eq!(output, "T:b");
}

#[test]
fn test_inherit_exports_across_script_and_page_arenas() {
    let engine = Engine::new();
    let symbols = engine.symbols();

    let script_arena = Arena::new();
    let script_env = script_arena.root_env();
    let script = engine.compile("export nav = ['home', 'about']", ParseMode::Script);
    let _ = engine.eval_module(&script, &script_env);

    let page_arena = Arena::new();
    let page_env = page_arena.root_env();
    sitemap::inherit_exports(&script_env, &page_env);
    script_arena.release();

    let nav = symbols.intern("nav");
    let value = page_env.lookup(&nav).expect("nav inherited");
    assert_eq!(value, Value::array(vec![Value::string("home"), Value::string("about")]));
}
