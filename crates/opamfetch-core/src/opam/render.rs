//! Rendering of parsed opam files into [`Manifest`]s.

use super::parser::{self, LogOp, OpamFile, RelOp, SyntaxError, Value};
use super::version::to_range_version;
use crate::manifest::{scoped_name, Command, Manifest, OCAML_PEER};

/// Filter flags that mark a dependency or command as not needed to build.
const SKIPPED_FLAGS: &[&str] = &["test", "doc", "with-test", "with-doc"];

/// Archive location declared by a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlSpec {
    pub url: String,
    /// md5 hex digest, when one is declared.
    pub checksum: Option<String>,
}

/// Output of [`render`].
#[derive(Debug, Clone)]
pub struct RenderedOpam {
    pub manifest: Manifest,
    /// Patch file names, relative to the version's `files/` directory.
    pub patches: Vec<String>,
    /// Location from an inline `url { }` section.
    pub url: Option<UrlSpec>,
}

/// Convert a parsed opam file into a manifest for `name` at `version`.
#[must_use]
pub fn render(name: &str, version: &str, file: &OpamFile) -> RenderedOpam {
    let mut manifest = Manifest::new(name, version);
    let vars = Vars { name, version };

    if let Some(depends) = file.field("depends") {
        for item in depends.items() {
            let Some((dep, range)) = render_dependency(item) else {
                continue;
            };
            if dep == OCAML_PEER {
                merge_range(&mut manifest.peer_dependencies, OCAML_PEER, range);
            } else {
                merge_range(&mut manifest.dependencies, &scoped_name(&dep), range);
            }
        }
    }

    if let Some(available) = file.field("available") {
        if let Some(range) = render_available(available) {
            merge_range(&mut manifest.peer_dependencies, OCAML_PEER, range);
        }
    }

    for field in ["build", "install"] {
        if let Some(commands) = file.field(field) {
            manifest.esy.build.extend(render_commands(commands, &vars));
        }
    }

    let patches = file
        .field("patches")
        .map(|v| {
            v.items()
                .into_iter()
                .filter_map(|p| p.with_filters().0.as_str())
                .map(|p| vars.substitute(p))
                .collect()
        })
        .unwrap_or_default();

    let url = file.section("url").and_then(|section| {
        let url = ["src", "archive", "http"]
            .iter()
            .find_map(|key| section.field(key).and_then(Value::as_str))?;
        Some(UrlSpec {
            url: url.to_string(),
            checksum: section.field("checksum").and_then(md5_checksum),
        })
    });

    RenderedOpam {
        manifest,
        patches,
        url,
    }
}

/// Parse an opam 1.2 `url` file.
///
/// # Errors
/// Returns a [`SyntaxError`] if the file is not valid opam syntax.
pub fn parse_url_file(source: &str) -> Result<Option<UrlSpec>, SyntaxError> {
    let file = parser::parse(source)?;
    let url = ["archive", "http", "src"]
        .iter()
        .find_map(|key| file.field(key).and_then(Value::as_str));
    Ok(url.map(|url| UrlSpec {
        url: url.to_string(),
        checksum: file.field("checksum").and_then(md5_checksum),
    }))
}

/// Pick the md5 digest out of `"<hex>"`, `"md5=<hex>"` or a list of them.
fn md5_checksum(value: &Value) -> Option<String> {
    value.items().into_iter().find_map(|item| {
        let s = item.as_str()?;
        match s.split_once('=') {
            Some(("md5", hex)) => Some(hex.to_string()),
            Some(_) => None,
            None if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Some(s.to_string())
            }
            None => None,
        }
    })
}

fn merge_range(
    map: &mut std::collections::BTreeMap<String, String>,
    name: &str,
    range: String,
) {
    match map.get_mut(name) {
        Some(existing) if existing == "*" => *existing = range,
        Some(existing) if range != "*" => {
            existing.push(' ');
            existing.push_str(&range);
        }
        Some(_) => {}
        None => {
            map.insert(name.to_string(), range);
        }
    }
}

/// `"lwt" {>= "2.0" & build}` -> `("lwt", ">=2.0.0")`.
///
/// Alternatives between packages keep the first one. Test and doc
/// dependencies are dropped.
fn render_dependency(item: &Value) -> Option<(String, String)> {
    match item {
        Value::Logop(LogOp::Or, lhs, _) => render_dependency(lhs),
        Value::Group(items) => items.first().and_then(render_dependency),
        _ => {
            let (name, filters) = item.with_filters();
            let name = name.as_str()?;
            if filters.iter().any(has_skipped_flag) {
                return None;
            }
            let clauses = filters
                .iter()
                .map(|f| dnf(f, &constraint_atom))
                .fold(vec![Vec::new()], |acc, next| product(&acc, &next));
            Some((name.to_string(), render_dnf(&clauses)))
        }
    }
}

/// Opam 1.2 `available: [ocaml-version >= "4.02"]` as an `ocaml` range.
fn render_available(value: &Value) -> Option<String> {
    let items = value.items();
    if !items.iter().any(|v| mentions_ocaml_version(v)) {
        return None;
    }
    let clauses = items
        .into_iter()
        .map(|f| dnf(f, &available_atom))
        .fold(vec![Vec::new()], |acc, next| product(&acc, &next));
    Some(render_dnf(&clauses))
}

fn mentions_ocaml_version(value: &Value) -> bool {
    match value {
        Value::Ident(var) => var == "ocaml-version",
        Value::Logop(_, lhs, rhs) | Value::Relop(_, lhs, rhs) => {
            mentions_ocaml_version(lhs) || mentions_ocaml_version(rhs)
        }
        Value::Group(items) | Value::List(items) => items.iter().any(mentions_ocaml_version),
        Value::Not(inner) | Value::Defined(inner) => mentions_ocaml_version(inner),
        _ => false,
    }
}

type Dnf = Vec<Vec<String>>;

/// Disjunctive normal form of a boolean formula. `atom` maps leaves to a
/// clause; `None` leaves constrain nothing.
fn dnf(value: &Value, atom: &dyn Fn(&Value) -> Option<String>) -> Dnf {
    match value {
        Value::Logop(LogOp::And, lhs, rhs) => product(&dnf(lhs, atom), &dnf(rhs, atom)),
        Value::Logop(LogOp::Or, lhs, rhs) => {
            let mut out = dnf(lhs, atom);
            out.extend(dnf(rhs, atom));
            out
        }
        Value::Group(items) => items
            .iter()
            .map(|v| dnf(v, atom))
            .fold(vec![Vec::new()], |acc, next| product(&acc, &next)),
        leaf => vec![atom(leaf).into_iter().collect()],
    }
}

fn product(a: &Dnf, b: &Dnf) -> Dnf {
    let mut out = Vec::with_capacity(a.len() * b.len());
    for left in a {
        for right in b {
            let mut conj = left.clone();
            conj.extend(right.iter().cloned());
            out.push(conj);
        }
    }
    out
}

fn render_dnf(clauses: &Dnf) -> String {
    if clauses.iter().any(Vec::is_empty) {
        return "*".to_string();
    }
    clauses
        .iter()
        .map(|conj| conj.join(" "))
        .collect::<Vec<_>>()
        .join(" || ")
}

fn constraint_atom(value: &Value) -> Option<String> {
    match value {
        Value::PrefixRelop(op, version) => comparator(*op, version.as_str()?),
        _ => None,
    }
}

fn available_atom(value: &Value) -> Option<String> {
    match value {
        Value::Relop(op, lhs, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
            (Value::Ident(var), Value::String(version)) if var == "ocaml-version" => {
                comparator(*op, version)
            }
            _ => None,
        },
        _ => None,
    }
}

/// `!=` has no range equivalent and is dropped.
fn comparator(op: RelOp, version: &str) -> Option<String> {
    if op == RelOp::Neq {
        return None;
    }
    Some(format!("{}{}", op.as_str(), to_range_version(version)))
}

fn has_skipped_flag(filter: &Value) -> bool {
    match filter {
        Value::Ident(flag) => SKIPPED_FLAGS.contains(&flag.as_str()),
        Value::Logop(_, lhs, rhs) => has_skipped_flag(lhs) || has_skipped_flag(rhs),
        Value::Group(items) => items.iter().any(has_skipped_flag),
        _ => false,
    }
}

fn render_commands(value: &Value, vars: &Vars<'_>) -> Vec<Command> {
    let items = value.items();
    let is_command_list = items
        .iter()
        .all(|item| matches!(item.with_filters().0, Value::List(_)));

    if !is_command_list {
        // `build: ["make" "all"]` is a single command
        return render_command(value, vars).into_iter().collect();
    }
    items
        .into_iter()
        .filter_map(|item| render_command(item, vars))
        .collect()
}

fn render_command(value: &Value, vars: &Vars<'_>) -> Option<Command> {
    let (args, filters) = value.with_filters();
    if filters.iter().any(has_skipped_flag) {
        return None;
    }
    let argv: Vec<String> = args
        .items()
        .into_iter()
        .filter_map(|arg| {
            let (arg, filters) = arg.with_filters();
            if filters.iter().any(has_skipped_flag) {
                return None;
            }
            match arg {
                Value::String(s) => Some(vars.substitute(s)),
                Value::Ident(var) => Some(vars.lookup(var).unwrap_or_else(|| var.clone())),
                _ => None,
            }
        })
        .collect();
    (!argv.is_empty()).then_some(Command::Argv(argv))
}

struct Vars<'a> {
    name: &'a str,
    version: &'a str,
}

impl Vars<'_> {
    fn lookup(&self, var: &str) -> Option<String> {
        let value = match var {
            "name" | "_:name" => self.name.to_string(),
            "version" | "_:version" => self.version.to_string(),
            "make" => "make".to_string(),
            "jobs" => "4".to_string(),
            "ocaml-native" | "ocaml:native" | "ocaml-native-dynlink" | "ocaml:native-dynlink" => {
                "true".to_string()
            }
            "ocaml-version" => "$ocaml__version".to_string(),
            "build" => "$cur__target_dir".to_string(),
            "prefix" => "$cur__install".to_string(),
            "lib" | "bin" | "sbin" | "man" | "doc" | "share" | "etc" | "stublibs"
            | "toplevel" => format!("$cur__{var}"),
            _ => {
                let (pkg, pkg_var) = var.split_once(':')?;
                let pkg = if pkg == "_" { "cur" } else { pkg };
                format!("${}__{}", pkg.replace('-', "_"), pkg_var.replace('-', "_"))
            }
        };
        Some(value)
    }

    /// Expand `%{var}%` occurrences; unknown variables are kept verbatim.
    fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("%{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}%") {
                Some(end) => {
                    let var = &after[..end];
                    match self.lookup(var) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("%{");
                            out.push_str(var);
                            out.push_str("}%");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_str(source: &str) -> RenderedOpam {
        render("lwt", "3.1.0", &parser::parse(source).unwrap())
    }

    fn argv(args: &[&str]) -> Command {
        Command::Argv(args.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_dependencies_and_peer() {
        let rendered = render_str(
            r#"depends: [
  "ocaml" {>= "4.02.0"}
  "ocamlfind" {build}
  "result" {>= "1.0" & < "2.0"}
  "ppx_tools" {= "5.0+4.05.0"}
  "ounit" {test}
  "base-unix" | "base-threads"
  "cppo" {build & != "1.5"}
]"#,
        );
        let m = &rendered.manifest;
        assert_eq!(m.name, "@opam/lwt");
        assert_eq!(m.peer_dependencies["ocaml"], ">=4.2.0");
        assert_eq!(m.dependencies["@opam/ocamlfind"], "*");
        assert_eq!(m.dependencies["@opam/result"], ">=1.0.0 <2.0.0");
        assert_eq!(m.dependencies["@opam/ppx_tools"], "=5.0.0-4.5.0");
        assert_eq!(m.dependencies["@opam/base-unix"], "*");
        assert_eq!(m.dependencies["@opam/cppo"], "*");
        assert!(!m.dependencies.contains_key("@opam/ounit"));
        assert!(!m.dependencies.contains_key("@opam/base-threads"));
        assert!(!m.dependencies.contains_key("@opam/ocaml"));
    }

    #[test]
    fn test_or_constraints() {
        let rendered = render_str(r#"depends: ["a" {< "1.0" | >= "2.0"}]"#);
        assert_eq!(
            rendered.manifest.dependencies["@opam/a"],
            "<1.0.0 || >=2.0.0"
        );
    }

    #[test]
    fn test_available_becomes_peer() {
        let rendered = render_str(
            r#"available: [ocaml-version >= "4.02.0" & ocaml-version < "4.06.0" & os != "windows"]
depends: ["ocaml" {>= "4.01.0"}]"#,
        );
        assert_eq!(
            rendered.manifest.peer_dependencies["ocaml"],
            ">=4.1.0 >=4.2.0 <4.6.0"
        );

        let rendered = render_str(r#"available: [os != "windows"]"#);
        assert!(rendered.manifest.peer_dependencies.is_empty());
    }

    #[test]
    fn test_build_and_install_commands() {
        let rendered = render_str(
            r#"build: [
  ["./configure" "--prefix=%{prefix}%"]
  [make "-j%{jobs}%"]
  [make "test"] {with-test}
  ["ocaml" "setup.ml" "-docdir" "%{doc}%/%{name}%" {with-doc}]
]
install: [make "install" "BINDIR=%{bin}%" "X=%{lwt:lib}%" "Y=%{unknown}%"]"#,
        );
        assert_eq!(
            rendered.manifest.esy.build,
            vec![
                argv(&["./configure", "--prefix=$cur__install"]),
                argv(&["make", "-j4"]),
                argv(&["ocaml", "setup.ml", "-docdir"]),
                argv(&[
                    "make",
                    "install",
                    "BINDIR=$cur__bin",
                    "X=$lwt__lib",
                    "Y=%{unknown}%"
                ]),
            ]
        );
    }

    #[test]
    fn test_patches_and_url_section() {
        let rendered = render_str(
            r#"patches: ["fix-build.patch" "windows.patch" {os = "win32"}]
url {
  src: "https://example.com/lwt-3.1.0.tar.gz"
  checksum: ["sha256=deadbeef" "md5=0123456789abcdef0123456789abcdef"]
}"#,
        );
        assert_eq!(rendered.patches, vec!["fix-build.patch", "windows.patch"]);
        assert_eq!(
            rendered.url,
            Some(UrlSpec {
                url: "https://example.com/lwt-3.1.0.tar.gz".to_string(),
                checksum: Some("0123456789abcdef0123456789abcdef".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_url_file() {
        let spec = parse_url_file(
            "archive: \"https://example.com/a.tbz\"\nchecksum: \"0123456789abcdef0123456789abcdef\"\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(spec.url, "https://example.com/a.tbz");
        assert_eq!(
            spec.checksum.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );

        let spec = parse_url_file("git: \"https://example.com/a.git\"\n").unwrap();
        assert!(spec.is_none());

        let spec = parse_url_file("http: \"https://example.com/b.tar.gz\"\n")
            .unwrap()
            .unwrap();
        assert!(spec.checksum.is_none());
    }
}
