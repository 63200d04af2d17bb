//! The site-map boundary.
//!
//! A root script accumulates declarative entries in the `SITE_MAP` array;
//! the surrounding build scheduler replays them afterwards. This module is
//! the runtime's half of that contract: the well-known global bindings,
//! decoding of site-map entries, template rendering with layout chaining,
//! and the environment plumbing a replay needs (child environments that
//! inherit exports, explicit cross-arena copies).
//!
//! File I/O itself (copying assets, writing rendered pages) stays with
//! the scheduler.

use crate::arena::Arena;
use crate::engine::Engine;
use crate::module::ParseMode;
use crate::path::SitePath;
use crate::scope::Env;
use crate::value::{copy_value, Value, ValueMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Layout chains deeper than this are cut off with a diagnostic. Cycle
/// freedom is the template author's responsibility; the cap just turns an
/// accidental cycle into a reported error instead of a hang.
const MAX_LAYOUT_DEPTH: usize = 64;

/// The well-known global binding names of the script/scheduler contract.
pub mod names {
    pub const SRC_ROOT: &str = "SRC_ROOT";
    pub const DIST_ROOT: &str = "DIST_ROOT";
    pub const PATH: &str = "PATH";
    pub const LAYOUT: &str = "LAYOUT";
    pub const CONTENT: &str = "CONTENT";
    pub const ROOT_URL: &str = "ROOT_URL";
    pub const ROOT_PATH: &str = "ROOT_PATH";
    pub const SITE_MAP: &str = "SITE_MAP";
    pub const REVERSE_PATHS: &str = "REVERSE_PATHS";
    pub const CONTENT_HANDLERS: &str = "CONTENT_HANDLERS";
    /// Per-page data object handed to a template entry's render.
    pub const DATA: &str = "DATA";
}

/// Seed the host-provided bindings a root script assumes: the source and
/// destination roots, an empty `SITE_MAP`, and empty registries.
pub fn install_globals(engine: &Engine, env: &Env, src_root: &str, dist_root: &str) {
    engine.set_global(env, names::SRC_ROOT, Value::string(src_root));
    engine.set_global(env, names::DIST_ROOT, Value::string(dist_root));
    engine.set_global(env, names::SITE_MAP, Value::array(Vec::new()));
    engine.set_global(env, names::REVERSE_PATHS, Value::object(ValueMap::new()));
    engine.set_global(env, names::CONTENT_HANDLERS, Value::object(ValueMap::new()));
    for name in [names::PATH, names::LAYOUT, names::CONTENT, names::ROOT_URL, names::ROOT_PATH] {
        engine.set_global(env, name, Value::Nil);
    }
}

/// A decoded site-map entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteEntry {
    /// `{ type: 'copy', src: …, dest: … }`: copy a file verbatim.
    Copy { src: SitePath, dest: SitePath },
    /// `{ type: 'template', src: …, dest: …, web_path: …, data: … }`:
    /// render a template into a file.
    Template { src: SitePath, dest: SitePath, web_path: SitePath, data: Value },
}

fn field(engine: &Engine, map: &ValueMap, name: &str) -> Option<Value> {
    let key = Value::Symbol(engine.symbols().intern(name));
    map.get(&key).cloned()
}

fn path_field(engine: &Engine, map: &ValueMap, name: &str) -> Option<SitePath> {
    match field(engine, map, name) {
        Some(Value::Str(s)) => Some(SitePath::parse(&s)),
        _ => None,
    }
}

/// Decode one `SITE_MAP` element. `None` (with a diagnostic) for anything
/// malformed.
#[must_use]
pub fn decode_entry(engine: &Engine, value: &Value) -> Option<SiteEntry> {
    let Value::Object(obj) = value else {
        engine.report_error(format!("invalid site map entry: expected object, found {}", value.type_name()));
        return None;
    };
    let map = obj.borrow();
    let kind = match field(engine, &map, "type") {
        Some(Value::Str(s)) => s.as_str().to_string(),
        _ => {
            engine.report_error("invalid site map entry: missing 'type'");
            return None;
        }
    };
    match kind.as_str() {
        "copy" => {
            let (Some(src), Some(dest)) =
                (path_field(engine, &map, "src"), path_field(engine, &map, "dest"))
            else {
                engine.report_error("invalid copy entry: 'src' and 'dest' must be strings");
                return None;
            };
            Some(SiteEntry::Copy { src, dest })
        }
        "template" => {
            let (Some(src), Some(dest), Some(web_path)) = (
                path_field(engine, &map, "src"),
                path_field(engine, &map, "dest"),
                path_field(engine, &map, "web_path"),
            ) else {
                engine.report_error(
                    "invalid template entry: 'src', 'dest' and 'web_path' must be strings",
                );
                return None;
            };
            let data = field(engine, &map, "data")
                .filter(|v| !v.is_nil())
                .unwrap_or_else(|| Value::object(ValueMap::new()));
            Some(SiteEntry::Template { src, dest, web_path, data })
        }
        other => {
            engine.report_error(format!("invalid site map entry: unknown type '{other}'"));
            None
        }
    }
}

/// Decode the accumulated `SITE_MAP` array. Malformed entries are
/// diagnosed and skipped; the build carries on.
#[must_use]
pub fn site_map_entries(engine: &Engine, env: &Env) -> Vec<SiteEntry> {
    let Some(Value::Array(entries)) = engine.get_global(env, names::SITE_MAP) else {
        engine.report_error("SITE_MAP is not an array");
        return Vec::new();
    };
    let snapshot: Vec<Value> = entries.borrow().clone();
    snapshot.iter().filter_map(|value| decode_entry(engine, value)).collect()
}

/// Copy `from`'s exported bindings into `to`, marking them exported there
/// too. Values are deep-copied: the two environments may belong to
/// different arenas.
pub fn inherit_exports(from: &Env, to: &Env) {
    for (name, value) in from.exports() {
        to.define(name.clone(), copy_value(&value));
        to.add_export(name);
    }
}

/// The environment a template entry renders in: a child of the globals in
/// its own arena, with `PATH` and `DATA` set and the layout slots cleared.
#[must_use]
pub fn page_env(
    engine: &Engine,
    globals: &Env,
    arena: &Arena,
    web_path: &SitePath,
    data: &Value,
) -> Env {
    let env = globals.child_in(arena);
    engine.set_global(&env, names::PATH, Value::string(web_path.to_string()));
    engine.set_global(&env, names::LAYOUT, Value::Nil);
    engine.set_global(&env, names::CONTENT, Value::Nil);
    engine.set_global(&env, names::DATA, copy_value(data));
    env
}

/// Render the template at `path` against `env`, then chain layouts: as
/// long as the environment leaves a string in `LAYOUT`, resolve it
/// relative to the current template's directory, move the rendered output
/// into `CONTENT`, clear `LAYOUT`, and render the layout template.
///
/// `None` only when the initial template cannot be loaded; template
/// errors otherwise surface as diagnostics and partial output.
#[must_use]
pub fn render_page(engine: &Engine, path: &Path, env: &Env) -> Option<String> {
    let module = engine.load_module(path, ParseMode::Template)?;
    let mut current: PathBuf = path.to_path_buf();
    let mut rendered = engine.eval_module(&module, env).render_to_string();

    let mut depth = 0usize;
    loop {
        let layout = match engine.get_global(env, names::LAYOUT) {
            Some(Value::Str(layout)) => layout,
            Some(Value::Nil) | None => break,
            Some(other) => {
                engine.report_warning(format!(
                    "LAYOUT must be a string, found {}",
                    other.type_name()
                ));
                break;
            }
        };
        if depth >= MAX_LAYOUT_DEPTH {
            engine.report_error(format!("layout nesting exceeds {MAX_LAYOUT_DEPTH} levels"));
            break;
        }
        depth += 1;

        let layout_path = current.parent().unwrap_or(Path::new("")).join(layout.as_str());
        engine.set_global(env, names::CONTENT, Value::string(rendered.clone()));
        engine.set_global(env, names::LAYOUT, Value::Nil);
        let Some(layout_module) = engine.load_module(&layout_path, ParseMode::Template) else {
            break;
        };
        debug!(layout = %layout_path.display(), "applying layout");
        rendered = engine.eval_module(&layout_module, env).render_to_string();
        current = layout_path;
    }
    Some(rendered)
}

/// Replay one site-map entry. Template entries render in a fresh arena
/// and return `(dest, output)` for the scheduler to write; copy entries
/// return `None` (the file operation belongs to the scheduler).
#[must_use]
pub fn render_entry(engine: &Engine, globals: &Env, entry: &SiteEntry) -> Option<(SitePath, String)> {
    match entry {
        SiteEntry::Copy { .. } => None,
        SiteEntry::Template { src, dest, web_path, data } => {
            let arena = Arena::new();
            let env = page_env(engine, globals, &arena, web_path, data);
            // Sources are relative to the configured source root.
            let path = match engine.get_global(globals, names::SRC_ROOT) {
                Some(Value::Str(root)) if !src.is_absolute() => {
                    PathBuf::from(root.as_str()).join(src.to_path_buf())
                }
                _ => src.to_path_buf(),
            };
            debug!(src = %path.display(), dest = %dest, "rendering page");
            let output = render_page(engine, &path, &env)?;
            Some((dest.clone(), output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_object(engine: &Engine, fields: &[(&str, Value)]) -> Value {
        let mut map = ValueMap::new();
        for (name, value) in fields {
            map.insert(Value::Symbol(engine.symbols().intern(name)), value.clone());
        }
        Value::object(map)
    }

    #[test]
    fn globals_are_installed() {
        let engine = Engine::new();
        let arena = Arena::new();
        let env = arena.root_env();
        install_globals(&engine, &env, "/src", "/dist");

        assert_eq!(engine.get_global(&env, names::SRC_ROOT), Some(Value::string("/src")));
        assert_eq!(engine.get_global(&env, names::DIST_ROOT), Some(Value::string("/dist")));
        assert!(matches!(engine.get_global(&env, names::SITE_MAP), Some(Value::Array(_))));
        assert_eq!(engine.get_global(&env, names::LAYOUT), Some(Value::Nil));
    }

    #[test]
    fn copy_entries_decode() {
        let engine = Engine::new();
        let value = entry_object(
            &engine,
            &[
                ("type", Value::string("copy")),
                ("src", Value::string("img/a.png")),
                ("dest", Value::string("/dist/img/a.png")),
            ],
        );
        assert_eq!(
            decode_entry(&engine, &value),
            Some(SiteEntry::Copy {
                src: SitePath::parse("img/a.png"),
                dest: SitePath::parse("/dist/img/a.png"),
            })
        );
    }

    #[test]
    fn malformed_entries_are_diagnosed() {
        let engine = Engine::new();
        assert_eq!(decode_entry(&engine, &Value::Int(3)), None);
        let missing_type = entry_object(&engine, &[("src", Value::string("a"))]);
        assert_eq!(decode_entry(&engine, &missing_type), None);
        let bad_kind = entry_object(&engine, &[("type", Value::string("alias"))]);
        assert_eq!(decode_entry(&engine, &bad_kind), None);
        assert_eq!(engine.diagnostics().len(), 3);
        assert!(engine.has_errors());
    }

    #[test]
    fn template_entries_default_their_data() {
        let engine = Engine::new();
        let value = entry_object(
            &engine,
            &[
                ("type", Value::string("template")),
                ("src", Value::string("page.html")),
                ("dest", Value::string("/dist/page.html")),
                ("web_path", Value::string("/page/")),
            ],
        );
        match decode_entry(&engine, &value) {
            Some(SiteEntry::Template { data, .. }) => {
                assert!(matches!(data, Value::Object(_)));
            }
            other => panic!("expected template entry, got {other:?}"),
        }
    }

    #[test]
    fn exports_are_copied_across_arenas() {
        let engine = Engine::new();
        let symbols = engine.symbols();

        let script_arena = Arena::new();
        let script_env = script_arena.root_env();
        let name = symbols.intern("site_title");
        let value = Value::array(vec![Value::string("my site")]);
        script_env.define(name.clone(), value.clone());
        script_env.add_export(name.clone());

        let page_arena = Arena::new();
        let page = page_arena.root_env();
        inherit_exports(&script_env, &page);

        let inherited = page.lookup(&name).expect("inherited");
        assert_eq!(inherited, value);
        // The copy is detached from the script arena's value.
        if let (Value::Array(a), Value::Array(b)) = (&inherited, &value) {
            assert!(!std::rc::Rc::ptr_eq(a, b));
        }
    }
}
