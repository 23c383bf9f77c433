//! OCI runtime hook loading and condition evaluation (§4.12).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Error, ErrorKind};

const SUPPORTED_VERSION: &str = "1.0.0";

/// The OCI hook object itself (`path`, `args`, `env`, `timeout`), carried
/// through unparsed as JSON since its shape is entirely defined by the OCI
/// Runtime Specification and kiln never inspects its fields.
pub type HookDescriptorJson = serde_json::Value;

/// A single `when` condition. All of a hook's conditions must evaluate
/// true for the hook to be active (conjunction, per `OCIHook::isActive`).
#[derive(Debug, Clone)]
pub enum Condition {
    /// A fixed `true`/`false` condition, useful for unconditionally
    /// enabling or disabling a hook file without deleting it.
    Always(bool),
    /// Every `(key_pattern, value_pattern)` must find at least one
    /// matching `(key, value)` in the bundle's annotations; both patterns
    /// are matched against the full string, not merely searched.
    Annotations(Vec<(Regex, Regex)>),
    /// At least one pattern must fully match the resolved command's
    /// `argv[0]`.
    Commands(Vec<Regex>),
    /// Active only when the run did/didn't request any `--mount`s,
    /// depending on `value`.
    HasBindMounts(bool),
}

impl Condition {
    fn evaluate(&self, ctx: &EvalContext) -> bool {
        match self {
            Condition::Always(value) => *value,
            Condition::Annotations(patterns) => patterns.iter().all(|(key_re, value_re)| {
                ctx.annotations
                    .iter()
                    .any(|(k, v)| full_match(key_re, k) && full_match(value_re, v))
            }),
            Condition::Commands(patterns) => {
                let arg0 = ctx.argv.first().map(String::as_str).unwrap_or("");
                patterns.iter().any(|re| full_match(re, arg0))
            }
            Condition::HasBindMounts(value) => *value != ctx.mounts_empty,
        }
    }
}

/// Full-string match, matching `boost::regex_match` rather than Rust
/// `Regex::is_match`'s partial search semantics.
fn full_match(re: &Regex, haystack: &str) -> bool {
    re.find(haystack)
        .is_some_and(|m| m.start() == 0 && m.end() == haystack.len())
}

/// Everything a condition needs to evaluate, resolved once per run.
pub struct EvalContext {
    pub annotations: BTreeMap<String, String>,
    pub argv: Vec<String>,
    pub mounts_empty: bool,
}

/// A loaded, validated hook descriptor.
#[derive(Debug, Clone)]
pub struct Hook {
    pub json_file: PathBuf,
    pub version: String,
    pub hook: HookDescriptorJson,
    pub conditions: Vec<ConditionSource>,
    pub stages: Vec<String>,
}

/// Condition as read from JSON, retained so [`Hook`] stays `Clone` (a
/// compiled [`Regex`] is cheap to rebuild but not worth storing twice).
#[derive(Debug, Clone)]
pub enum ConditionSource {
    Always(bool),
    Annotations(Vec<(String, String)>),
    Commands(Vec<String>),
    HasBindMounts(bool),
}

impl ConditionSource {
    fn compile(&self) -> Result<Condition, Error> {
        match self {
            ConditionSource::Always(v) => Ok(Condition::Always(*v)),
            ConditionSource::Annotations(pairs) => {
                let compiled = pairs
                    .iter()
                    .map(|(k, v)| Ok((compile_regex(k)?, compile_regex(v)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(Condition::Annotations(compiled))
            }
            ConditionSource::Commands(patterns) => {
                let compiled = patterns
                    .iter()
                    .map(|p| compile_regex(p))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(Condition::Commands(compiled))
            }
            ConditionSource::HasBindMounts(v) => Ok(Condition::HasBindMounts(*v)),
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern)
        .map_err(|e| Error::from(ErrorKind::Hook(format!("invalid regex '{pattern}': {e}"))))
}

impl Hook {
    /// Evaluates this hook's `when` conditions. A regex that fails to
    /// compile disables the hook for the run (logged, never fatal) rather
    /// than aborting the whole run — matching §4.12's "a condition-
    /// evaluation failure disables that hook" rule.
    pub fn is_active(&self, ctx: &EvalContext) -> bool {
        for source in &self.conditions {
            let condition = match source.compile() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(hook = %self.json_file.display(), error = %e, "disabling hook: condition failed to compile");
                    return false;
                }
            };
            if !condition.evaluate(ctx) {
                return false;
            }
        }
        true
    }
}

#[derive(serde::Deserialize)]
struct RawHook {
    version: String,
    hook: serde_json::Value,
    when: BTreeMap<String, serde_json::Value>,
    stages: Vec<String>,
}

/// Loads every `*.json` file under `hooks_dir`, in lexicographic filename
/// order — the order hooks run in within a stage when more than one is
/// active.
pub fn load_hooks(hooks_dir: &Path) -> Result<Vec<Hook>, Error> {
    if !hooks_dir.is_dir() {
        return Err(Error::from(ErrorKind::Hook(format!(
            "hooks directory {} is not valid",
            hooks_dir.display()
        ))));
    }

    let mut json_files: Vec<PathBuf> = std::fs::read_dir(hooks_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    json_files.sort();

    json_files.iter().map(|path| load_hook(path)).collect()
}

fn load_hook(json_file: &Path) -> Result<Hook, Error> {
    let data = std::fs::read(json_file)?;
    let raw: RawHook = serde_json::from_slice(&data)
        .map_err(|e| Error::from(ErrorKind::Hook(format!("{}: {e}", json_file.display()))))?;

    if raw.version != SUPPORTED_VERSION {
        return Err(Error::from(ErrorKind::Hook(format!(
            "{}: the only supported hook version is {SUPPORTED_VERSION}, but found {}",
            json_file.display(),
            raw.version
        ))));
    }

    let mut conditions = Vec::with_capacity(raw.when.len());
    for (name, value) in &raw.when {
        conditions.push(parse_condition(json_file, name, value)?);
    }

    Ok(Hook {
        json_file: json_file.to_path_buf(),
        version: raw.version,
        hook: raw.hook,
        conditions,
        stages: raw.stages,
    })
}

fn parse_condition(
    json_file: &Path,
    name: &str,
    value: &serde_json::Value,
) -> Result<ConditionSource, Error> {
    match name {
        "always" => {
            let v = value.as_bool().ok_or_else(|| bad_condition(json_file, name))?;
            Ok(ConditionSource::Always(v))
        }
        "annotations" => {
            let obj = value.as_object().ok_or_else(|| bad_condition(json_file, name))?;
            let pairs = obj
                .iter()
                .map(|(k, v)| {
                    let value_pattern = v.as_str().ok_or_else(|| bad_condition(json_file, name))?;
                    Ok((k.clone(), value_pattern.to_owned()))
                })
                .collect::<Result<Vec<_>, Error>>()?;
            Ok(ConditionSource::Annotations(pairs))
        }
        "commands" => {
            let arr = value.as_array().ok_or_else(|| bad_condition(json_file, name))?;
            let commands = arr
                .iter()
                .map(|v| v.as_str().map(str::to_owned).ok_or_else(|| bad_condition(json_file, name)))
                .collect::<Result<Vec<_>, Error>>()?;
            Ok(ConditionSource::Commands(commands))
        }
        "hasBindMounts" => {
            let v = value.as_bool().ok_or_else(|| bad_condition(json_file, name))?;
            Ok(ConditionSource::HasBindMounts(v))
        }
        other => Err(Error::from(ErrorKind::Hook(format!(
            "{}: unexpected condition \"{other}\" in OCI hook's JSON",
            json_file.display()
        )))),
    }
}

fn bad_condition(json_file: &Path, name: &str) -> Error {
    Error::from(ErrorKind::Hook(format!(
        "{}: malformed \"{name}\" condition",
        json_file.display()
    )))
}

/// Returns hooks active for `stage`, in load order.
pub fn active_hooks_for_stage<'a>(
    hooks: &'a [Hook],
    stage: &str,
    ctx: &EvalContext,
) -> Vec<&'a Hook> {
    hooks
        .iter()
        .filter(|h| h.stages.iter().any(|s| s == stage) && h.is_active(ctx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_hook(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    fn ctx() -> EvalContext {
        EvalContext {
            annotations: BTreeMap::from([("com.hooks.mpi.enabled".to_owned(), "true".to_owned())]),
            argv: vec!["/bin/sh".to_owned()],
            mounts_empty: true,
        }
    }

    #[test]
    fn loads_hooks_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "20-second.json",
            r#"{"version":"1.0.0","hook":{"path":"/b"},"when":{"always":true},"stages":["createRuntime"]}"#,
        );
        write_hook(
            dir.path(),
            "10-first.json",
            r#"{"version":"1.0.0","hook":{"path":"/a"},"when":{"always":true},"stages":["createRuntime"]}"#,
        );

        let hooks = load_hooks(dir.path()).unwrap();
        assert_eq!(hooks.len(), 2);
        assert!(hooks[0].json_file.ends_with("10-first.json"));
        assert!(hooks[1].json_file.ends_with("20-second.json"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "h.json",
            r#"{"version":"2.0.0","hook":{"path":"/a"},"when":{"always":true},"stages":["createRuntime"]}"#,
        );
        assert!(load_hooks(dir.path()).is_err());
    }

    #[test]
    fn always_false_condition_disables_hook() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "h.json",
            r#"{"version":"1.0.0","hook":{"path":"/a"},"when":{"always":false},"stages":["createRuntime"]}"#,
        );
        let hooks = load_hooks(dir.path()).unwrap();
        assert!(!hooks[0].is_active(&ctx()));
    }

    #[test]
    fn annotation_condition_requires_full_match() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "h.json",
            r#"{"version":"1.0.0","hook":{"path":"/a"},"when":{"annotations":{"^com\\.hooks\\.mpi\\.enabled$":"^true$"}},"stages":["createRuntime"]}"#,
        );
        let hooks = load_hooks(dir.path()).unwrap();
        assert!(hooks[0].is_active(&ctx()));
    }

    #[test]
    fn commands_condition_matches_argv0() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "h.json",
            r#"{"version":"1.0.0","hook":{"path":"/a"},"when":{"commands":["^/bin/sh$"]},"stages":["createRuntime"]}"#,
        );
        let hooks = load_hooks(dir.path()).unwrap();
        assert!(hooks[0].is_active(&ctx()));
    }

    #[test]
    fn unknown_condition_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "h.json",
            r#"{"version":"1.0.0","hook":{"path":"/a"},"when":{"bogus":true},"stages":["createRuntime"]}"#,
        );
        assert!(load_hooks(dir.path()).is_err());
    }

    #[test]
    fn active_hooks_for_stage_filters_by_stage_and_condition() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "h.json",
            r#"{"version":"1.0.0","hook":{"path":"/a"},"when":{"hasBindMounts":true},"stages":["createRuntime"]}"#,
        );
        let hooks = load_hooks(dir.path()).unwrap();
        let active = active_hooks_for_stage(&hooks, "createRuntime", &ctx());
        assert!(active.is_empty());
    }
}
