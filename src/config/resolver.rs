//! Layered configuration resolution: inheritance, interpolation, templates,
//! typed conversion and validation.

use super::{
    BoundaryConfig, BoundarySource, CoastalDomain, Config, DownloadConfig, MeteoSource,
    ModelConfig, ModelType, MonitoringConfig, PathConfig, SchismConfig, SfincsConfig,
    SimulationConfig, SlurmConfig,
};
use crate::error::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Key naming the parent document of a configuration file.
pub const INHERIT_KEY: &str = "_base";

const DEFAULT_ROOT_DIR: &str = "/ngen-test/coastal";

/// Derived paths, filled in order when not set explicitly.
const PATH_TEMPLATES: &[(&str, &str)] = &[
    (
        "work_dir",
        "${paths.root_dir}/${model}_${simulation.coastal_domain}_${boundary.source}_${simulation.meteo_source}_${start_pdy}${start_cyc}",
    ),
    ("raw_download_dir", "${paths.work_dir}/raw_data"),
    ("scripts_dir", "${paths.root_dir}/scripts"),
    ("parm_dir", "${paths.root_dir}/parm"),
    ("tpxo_data_dir", "${paths.root_dir}/tpxo"),
];

const SECTIONS: &[&str] = &[
    "slurm",
    "simulation",
    "boundary",
    "paths",
    "monitoring",
    "download",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Resolve a configuration file into a validated [`Config`].
pub fn resolve(path: &Path) -> Result<Config> {
    let merged = load_layered(path, &mut Vec::new())?;
    resolve_tree(merged)
}

/// Resolve an in-memory YAML document. `_base` is relative to the current directory.
pub(crate) fn resolve_str(yaml: &str) -> Result<Config> {
    let origin = Path::new("<inline>");
    let document = parse_document(yaml, false, origin)?;
    let merged = merge_with_base(document, Path::new("."), origin, &mut Vec::new())?;
    resolve_tree(merged)
}

fn resolve_tree(mut merged: Value) -> Result<Config> {
    normalize_sections(&mut merged)?;
    canonicalize_keywords(&mut merged);
    let mut tree = interpolate(&merged)?;
    // Keyword leaves that were filled from tokens
    canonicalize_keywords(&mut tree);
    let template_errors = fill_path_templates(&mut tree);

    let mut errors = Vec::new();
    let raw = RawConfig::read(&tree, &mut errors);
    raw.into_config(errors, template_errors)
}

fn load_error(path: &Path, message: impl ToString) -> Error {
    Error::ConfigLoad {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Load a document and everything it inherits from, child values winning.
fn load_layered(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().map_err(|e| load_error(path, e))?;
    if chain.contains(&canonical) {
        let cycle: Vec<String> = chain
            .iter()
            .chain(std::iter::once(&canonical))
            .map(|p| p.display().to_string())
            .collect();
        return Err(load_error(
            path,
            format!("inheritance cycle: {}", cycle.join(" -> ")),
        ));
    }

    let contents = std::fs::read_to_string(path).map_err(|e| load_error(path, e))?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let document = parse_document(&contents, is_json, path)?;

    chain.push(canonical);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let merged = merge_with_base(document, dir, path, chain);
    chain.pop();
    merged
}

fn parse_document(contents: &str, is_json: bool, path: &Path) -> Result<Mapping> {
    let value: Value = if is_json {
        serde_json::from_str(contents).map_err(|e| load_error(path, e))?
    } else {
        serde_yaml::from_str(contents).map_err(|e| load_error(path, e))?
    };

    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(load_error(path, "top level must be a mapping")),
    }
}

/// Merge one level of `_base` beneath `document`.
fn merge_with_base(
    document: Mapping,
    dir: &Path,
    origin: &Path,
    chain: &mut Vec<PathBuf>,
) -> Result<Value> {
    let base = document.get(INHERIT_KEY).cloned();
    let document: Mapping = document
        .into_iter()
        .filter(|(key, _)| key.as_str() != Some(INHERIT_KEY))
        .collect();

    match base {
        None | Some(Value::Null) => Ok(Value::Mapping(document)),
        Some(Value::String(base_ref)) => {
            let parent = load_layered(&dir.join(base_ref), chain)?;
            Ok(deep_merge(parent, Value::Mapping(document)))
        }
        Some(_) => Err(load_error(
            origin,
            format!("'{INHERIT_KEY}' must be a path string"),
        )),
    }
}

/// Recursively merge `overlay` onto `base`.
///
/// Mappings merge key by key; any other overlay value replaces the base
/// value wholesale, sequences included.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => {
                        let previous = std::mem::take(slot);
                        *slot = deep_merge(previous, value);
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

/// Substitute `${section.field}` tokens in a single pass.
///
/// A leaf that is exactly one token takes the referenced value with its
/// type; embedded tokens are concatenated as text. A token may only refer
/// to a value that holds no tokens itself. A tree without tokens is
/// returned unchanged.
pub fn interpolate(tree: &Value) -> Result<Value> {
    let pseudo = pseudo_variables(tree);
    let mut errors = Vec::new();
    let resolved = substitute_value(tree, tree, &pseudo, "", &mut errors);
    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(Error::ConfigValidation(errors))
    }
}

/// Names available to tokens besides document fields.
fn pseudo_variables(tree: &Value) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();

    let model = match tree.get("model") {
        Some(Value::String(model)) if !model.contains("${") => model.to_ascii_lowercase(),
        _ => ModelType::default().to_string(),
    };
    vars.insert("model", model);

    let start = tree
        .get("simulation")
        .and_then(|s| s.get("start_date"))
        .and_then(Value::as_str)
        .filter(|s| !s.contains("${"))
        .and_then(|s| parse_start_date(s).ok());
    if let Some(start) = start {
        vars.insert("start_pdy", start.format("%Y%m%d").to_string());
        vars.insert("start_cyc", start.format("%H").to_string());
    }

    vars
}

fn substitute_value(
    value: &Value,
    root: &Value,
    pseudo: &BTreeMap<&'static str, String>,
    at: &str,
    errors: &mut Vec<String>,
) -> Value {
    match value {
        Value::String(text) => match substitute_str(text, root, pseudo) {
            Ok(resolved) => resolved,
            Err(message) => {
                errors.push(format!("{at}: {message}"));
                value.clone()
            }
        },
        Value::Mapping(mapping) => Value::Mapping(
            mapping
                .iter()
                .map(|(key, child)| {
                    let name = key_name(key);
                    let child_at = if at.is_empty() {
                        name
                    } else {
                        format!("{at}.{name}")
                    };
                    (
                        key.clone(),
                        substitute_value(child, root, pseudo, &child_at, errors),
                    )
                })
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| substitute_value(item, root, pseudo, &format!("{at}[{i}]"), errors))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn key_name(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

enum Segment {
    Literal(String),
    Token(String),
}

fn parse_template(text: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => name.push(c),
                    None => return Err(format!("unterminated '${{' in '{text}'")),
                }
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Token(name.trim().to_string()));
        } else {
            literal.push(ch);
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn substitute_str(
    text: &str,
    root: &Value,
    pseudo: &BTreeMap<&'static str, String>,
) -> std::result::Result<Value, String> {
    let segments = parse_template(text)?;
    if !segments.iter().any(|s| matches!(s, Segment::Token(_))) {
        return Ok(Value::String(text.to_string()));
    }

    if let [Segment::Token(name)] = segments.as_slice() {
        return lookup(name, root, pseudo);
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Literal(literal) => out.push_str(literal),
            Segment::Token(name) => match lookup(name, root, pseudo)? {
                Value::String(s) => out.push_str(&s),
                Value::Number(n) => out.push_str(&n.to_string()),
                Value::Bool(b) => out.push_str(&b.to_string()),
                _ => return Err(format!("'${{{name}}}' is not a scalar")),
            },
        }
    }
    Ok(Value::String(out))
}

fn lookup(
    name: &str,
    root: &Value,
    pseudo: &BTreeMap<&'static str, String>,
) -> std::result::Result<Value, String> {
    if name.is_empty() {
        return Err("empty interpolation token".to_string());
    }
    if let Some(value) = pseudo.get(name) {
        return Ok(Value::String(value.clone()));
    }

    let mut current = root;
    for part in name.split('.') {
        current = current
            .as_mapping()
            .and_then(|m| m.get(part))
            .ok_or_else(|| format!("'${{{name}}}' refers to an undefined field"))?;
    }

    match current {
        Value::String(s) if s.contains("${") => Err(format!(
            "'${{{name}}}' is a circular or unresolved interpolation"
        )),
        Value::Null => Err(format!("'${{{name}}}' refers to an unset field")),
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(current.clone()),
        _ => Err(format!("'${{{name}}}' is not a scalar")),
    }
}

/// Replace null sections with empty mappings so their defaults apply.
fn normalize_sections(tree: &mut Value) -> Result<()> {
    let root = tree
        .as_mapping_mut()
        .ok_or_else(|| Error::ConfigValidation(vec!["top level must be a mapping".into()]))?;

    let mut errors = Vec::new();
    for section in SECTIONS {
        match root.get(*section) {
            None | Some(Value::Null) => {
                root.insert(Value::from(*section), Value::Mapping(Mapping::new()));
            }
            Some(Value::Mapping(_)) => {}
            Some(_) => errors.push(format!("{section} must be a mapping")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::ConfigValidation(errors))
    }
}

/// Seed defaulted keywords and rewrite parseable ones in canonical form, so
/// tokens and path templates see the values the typed configuration holds.
fn canonicalize_keywords(tree: &mut Value) {
    canonicalize(tree, None, "model", Some(ModelType::default()));
    canonicalize::<CoastalDomain>(tree, Some("simulation"), "coastal_domain", None);
    canonicalize::<MeteoSource>(tree, Some("simulation"), "meteo_source", None);
    canonicalize(tree, Some("boundary"), "source", Some(BoundarySource::default()));
}

fn canonicalize<T: FromStr + std::fmt::Display>(
    tree: &mut Value,
    section: Option<&str>,
    key: &str,
    default: Option<T>,
) {
    let parent = match section {
        Some(section) => tree.get_mut(section),
        None => Some(tree),
    };
    let Some(parent) = parent.and_then(Value::as_mapping_mut) else {
        return;
    };

    let canonical = match parent.get(key) {
        None | Some(Value::Null) => default.map(|d| d.to_string()),
        Some(Value::String(text)) => text.parse::<T>().ok().map(|v| v.to_string()),
        Some(_) => None,
    };
    if let Some(canonical) = canonical {
        parent.insert(Value::from(key), Value::from(canonical));
    }
}

/// Fill unset derived paths from templates, in declaration order.
fn fill_path_templates(tree: &mut Value) -> Vec<String> {
    let mut errors = Vec::new();

    if tree.get("paths").and_then(|p| p.get("root_dir")).map_or(true, Value::is_null) {
        set_path(tree, "root_dir", Value::from(DEFAULT_ROOT_DIR));
    }

    for (field, template) in PATH_TEMPLATES {
        let unset = tree
            .get("paths")
            .and_then(|p| p.get(*field))
            .map_or(true, Value::is_null);
        if !unset {
            continue;
        }

        let pseudo = pseudo_variables(tree);
        match substitute_str(template, tree, &pseudo) {
            Ok(value) => set_path(tree, field, value),
            Err(message) => errors.push(format!("paths.{field} could not be derived: {message}")),
        }
    }

    errors
}

fn set_path(tree: &mut Value, field: &str, value: Value) {
    if let Some(paths) = tree.get_mut("paths").and_then(Value::as_mapping_mut) {
        paths.insert(Value::from(field), value);
    }
}

/// Parse a start date given as a date or a date-time.
pub(crate) fn parse_start_date(text: &str) -> std::result::Result<NaiveDateTime, String> {
    let text = text.trim();
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(parsed);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| {
            format!("'{text}' is not a date (YYYY-MM-DD) or date-time (YYYY-MM-DDTHH:MM:SS)")
        })
}

const SIMULATION_FIELDS: &[&str] = &[
    "start_date",
    "duration_hours",
    "coastal_domain",
    "meteo_source",
    "timestep_seconds",
];
const BOUNDARY_FIELDS: &[&str] = &["source", "stofs_file"];
const PATH_FIELDS: &[&str] = &[
    "root_dir",
    "work_dir",
    "raw_download_dir",
    "scripts_dir",
    "parm_dir",
    "tpxo_data_dir",
    "hot_start_file",
];

/// Document values before typed conversion.
#[derive(Debug, Default)]
struct RawConfig {
    model: Option<String>,
    slurm: SlurmConfig,
    simulation: RawSimulation,
    boundary: RawBoundary,
    paths: RawPaths,
    model_config: Value,
    monitoring: MonitoringConfig,
    download: DownloadConfig,
}

#[derive(Debug, Default)]
struct RawSimulation {
    start_date: Option<String>,
    duration_hours: Option<i64>,
    coastal_domain: Option<String>,
    meteo_source: Option<String>,
    timestep_seconds: Option<u64>,
}

#[derive(Debug, Default)]
struct RawBoundary {
    source: Option<String>,
    stofs_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct RawPaths {
    root_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    raw_download_dir: Option<PathBuf>,
    scripts_dir: Option<PathBuf>,
    parm_dir: Option<PathBuf>,
    tpxo_data_dir: Option<PathBuf>,
    hot_start_file: Option<PathBuf>,
}

/// Deserialize the value at dotted `path`, recording a type error or a
/// missing required value instead of failing.
fn leaf<T: DeserializeOwned>(
    tree: &Value,
    path: &str,
    required: bool,
    errors: &mut Vec<String>,
) -> Option<T> {
    match path.split('.').try_fold(tree, |node, part| node.get(part)) {
        None | Some(Value::Null) => {
            if required {
                errors.push(format!("{path} is required"));
            }
            None
        }
        Some(value) => serde_yaml::from_value(value.clone())
            .map_err(|e| errors.push(format!("{path}: {e}")))
            .ok(),
    }
}

/// Deserialize a whole section, falling back to its defaults on error.
fn section<T: DeserializeOwned + Default>(tree: &Value, name: &str, errors: &mut Vec<String>) -> T {
    match tree.get(name) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_yaml::from_value(value.clone()).unwrap_or_else(|e| {
            errors.push(format!("{name}: {e}"));
            T::default()
        }),
    }
}

fn unknown_fields(tree: &Value, section: &str, known: &[&str], errors: &mut Vec<String>) {
    let Some(mapping) = tree.get(section).and_then(Value::as_mapping) else {
        return;
    };
    for key in mapping.keys() {
        let name = key_name(key);
        if !known.contains(&name.as_str()) {
            errors.push(format!(
                "{section}: unknown field '{name}' (expected one of: {})",
                known.join(", ")
            ));
        }
    }
}

fn parse_keyword<T: FromStr<Err = String>>(
    field: &str,
    value: Option<String>,
    default: Option<T>,
    errors: &mut Vec<String>,
) -> Option<T> {
    match value {
        Some(text) => match text.parse() {
            Ok(parsed) => Some(parsed),
            Err(message) => {
                errors.push(format!("{field}: {message}"));
                None
            }
        },
        None => default,
    }
}

fn parse_model_config(
    model: ModelType,
    value: Value,
    errors: &mut Vec<String>,
) -> Option<ModelConfig> {
    let value = match value {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    };
    let parsed = match model {
        ModelType::Schism => serde_yaml::from_value::<SchismConfig>(value).map(ModelConfig::Schism),
        ModelType::Sfincs => serde_yaml::from_value::<SfincsConfig>(value).map(ModelConfig::Sfincs),
    };
    parsed
        .map_err(|e| errors.push(format!("model_config ({model}): {e}")))
        .ok()
}

impl RawConfig {
    /// Read every section, one value at a time where a bad value must not
    /// hide the rest.
    fn read(tree: &Value, errors: &mut Vec<String>) -> Self {
        unknown_fields(tree, "simulation", SIMULATION_FIELDS, errors);
        unknown_fields(tree, "boundary", BOUNDARY_FIELDS, errors);
        unknown_fields(tree, "paths", PATH_FIELDS, errors);

        Self {
            model: leaf(tree, "model", false, errors),
            slurm: section(tree, "slurm", errors),
            simulation: RawSimulation {
                start_date: leaf(tree, "simulation.start_date", true, errors),
                duration_hours: leaf(tree, "simulation.duration_hours", true, errors),
                coastal_domain: leaf(tree, "simulation.coastal_domain", true, errors),
                meteo_source: leaf(tree, "simulation.meteo_source", true, errors),
                timestep_seconds: leaf(tree, "simulation.timestep_seconds", false, errors),
            },
            boundary: RawBoundary {
                source: leaf(tree, "boundary.source", false, errors),
                stofs_file: leaf(tree, "boundary.stofs_file", false, errors),
            },
            paths: RawPaths {
                root_dir: leaf(tree, "paths.root_dir", false, errors),
                work_dir: leaf(tree, "paths.work_dir", false, errors),
                raw_download_dir: leaf(tree, "paths.raw_download_dir", false, errors),
                scripts_dir: leaf(tree, "paths.scripts_dir", false, errors),
                parm_dir: leaf(tree, "paths.parm_dir", false, errors),
                tpxo_data_dir: leaf(tree, "paths.tpxo_data_dir", false, errors),
                hot_start_file: leaf(tree, "paths.hot_start_file", false, errors),
            },
            model_config: tree.get("model_config").cloned().unwrap_or(Value::Null),
            monitoring: section(tree, "monitoring", errors),
            download: section(tree, "download", errors),
        }
    }

    /// Convert to the typed configuration, collecting every violation.
    fn into_config(self, mut errors: Vec<String>, template_errors: Vec<String>) -> Result<Config> {
        let model = parse_keyword("model", self.model, Some(ModelType::default()), &mut errors);

        let start_date = match self.simulation.start_date.as_deref() {
            None => None,
            Some(text) => match parse_start_date(text) {
                Ok(date) if date.minute() == 0 && date.second() == 0 => Some(date),
                Ok(_) => {
                    errors.push(format!("simulation.start_date '{text}' must fall on the hour"));
                    None
                }
                Err(message) => {
                    errors.push(format!("simulation.start_date: {message}"));
                    None
                }
            },
        };

        let duration_hours = match self.simulation.duration_hours {
            None => None,
            Some(hours) if hours <= 0 => {
                errors.push(format!("simulation.duration_hours must be > 0 (got {hours})"));
                None
            }
            Some(hours) => Some(hours),
        };

        if let (Some(start), Some(hours)) = (start_date, duration_hours) {
            let end = chrono::Duration::try_hours(hours).and_then(|d| start.checked_add_signed(d));
            if end.is_none() {
                errors.push(format!(
                    "simulation.duration_hours {hours} ends the run past the representable date range"
                ));
            }
        }

        let coastal_domain: Option<CoastalDomain> = parse_keyword(
            "simulation.coastal_domain",
            self.simulation.coastal_domain,
            None,
            &mut errors,
        );
        let meteo_source: Option<MeteoSource> = parse_keyword(
            "simulation.meteo_source",
            self.simulation.meteo_source,
            None,
            &mut errors,
        );

        let timestep_seconds = self.simulation.timestep_seconds.unwrap_or(3600);
        if timestep_seconds == 0 {
            errors.push("simulation.timestep_seconds must be > 0".to_string());
        }

        let boundary_source = parse_keyword(
            "boundary.source",
            self.boundary.source,
            Some(BoundarySource::default()),
            &mut errors,
        );

        let model_config = model.and_then(|m| parse_model_config(m, self.model_config, &mut errors));

        let paths = self.paths;
        let root_dir = paths.root_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_DIR));

        // A derived path only fails when one of its inputs is invalid
        if errors.is_empty() {
            errors.extend(template_errors);
        }

        let (
            Some(model),
            Some(start_date),
            Some(duration_hours),
            Some(coastal_domain),
            Some(meteo_source),
            Some(boundary_source),
            Some(model_config),
            Some(work_dir),
            Some(raw_download_dir),
            Some(scripts_dir),
            Some(parm_dir),
            Some(tpxo_data_dir),
        ) = (
            model,
            start_date,
            duration_hours,
            coastal_domain,
            meteo_source,
            boundary_source,
            model_config,
            paths.work_dir,
            paths.raw_download_dir,
            paths.scripts_dir,
            paths.parm_dir,
            paths.tpxo_data_dir,
        )
        else {
            return Err(Error::ConfigValidation(errors));
        };

        if !errors.is_empty() {
            return Err(Error::ConfigValidation(errors));
        }

        let config = Config {
            model,
            slurm: self.slurm,
            simulation: SimulationConfig {
                start_date,
                duration_hours,
                coastal_domain,
                meteo_source,
                timestep_seconds,
            },
            boundary: BoundaryConfig {
                source: boundary_source,
                stofs_file: self.boundary.stofs_file,
            },
            paths: PathConfig {
                root_dir,
                work_dir,
                raw_download_dir,
                scripts_dir,
                parm_dir,
                tpxo_data_dir,
                hot_start_file: paths.hot_start_file,
            },
            model_config,
            monitoring: self.monitoring,
            download: self.download,
        };

        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(Error::ConfigValidation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    const HAWAII: &str = r#"
model: schism
simulation:
  start_date: 2021-06-11
  duration_hours: 24
  coastal_domain: hawaii
  meteo_source: nwm_ana
boundary:
  source: stofs
"#;

    #[test]
    fn test_deep_merge_override_law() {
        let base = yaml(
            r#"
slurm: {partition: base-part, job_name: base}
simulation: {duration_hours: 12, coastal_domain: pacific}
extra: [1, 2, 3]
"#,
        );
        let child = yaml(
            r#"
slurm: {partition: child-part}
simulation: {coastal_domain: hawaii}
extra: [9]
"#,
        );

        let merged = deep_merge(base, child);
        assert_eq!(merged["slurm"]["partition"], Value::from("child-part"));
        assert_eq!(merged["slurm"]["job_name"], Value::from("base"));
        assert_eq!(merged["simulation"]["duration_hours"], Value::from(12));
        assert_eq!(merged["simulation"]["coastal_domain"], Value::from("hawaii"));
        // Sequences are replaced, not concatenated
        assert_eq!(merged["extra"], yaml("[9]"));
    }

    #[test]
    fn test_end_to_end_work_dir() {
        let config = resolve_str(HAWAII).unwrap();

        let work_dir = config.paths.work_dir.to_string_lossy().to_string();
        assert!(work_dir.contains("schism_hawaii_stofs_nwm_ana"));
        assert!(work_dir.ends_with("2021061100"));
        assert_eq!(config.paths.raw_download_dir, config.paths.work_dir.join("raw_data"));
        assert_eq!(config.paths.root_dir, PathBuf::from(DEFAULT_ROOT_DIR));
        assert_eq!(config.slurm.partition, "c5n-18xlarge");
        assert_eq!(config.simulation.timestep_seconds, 3600);
    }

    #[test]
    fn test_work_dir_uses_defaulted_model_and_boundary() {
        let config = resolve_str(
            "simulation: {start_date: 2021-06-11, duration_hours: 24, coastal_domain: hawaii, meteo_source: nwm_ana}",
        )
        .unwrap();

        assert_eq!(config.model, ModelType::Schism);
        assert_eq!(config.boundary.source, BoundarySource::Tpxo);
        assert_eq!(
            config.paths.work_dir,
            PathBuf::from("/ngen-test/coastal/schism_hawaii_tpxo_nwm_ana_2021061100")
        );
    }

    #[test]
    fn test_work_dir_uses_canonical_keywords() {
        let config = resolve_str(
            r#"
model: SCHISM
simulation:
  start_date: 2021-06-11T06:00:00
  duration_hours: 6
  coastal_domain: Hawaii
  meteo_source: NWM_Ana
boundary:
  source: Stofs
"#,
        )
        .unwrap();

        assert_eq!(config.simulation.coastal_domain, CoastalDomain::Hawaii);
        assert_eq!(
            config.paths.work_dir,
            PathBuf::from("/ngen-test/coastal/schism_hawaii_stofs_nwm_ana_2021061106")
        );
    }

    #[test]
    fn test_type_error_does_not_hide_other_violations() {
        let err = resolve_str(
            "simulation: {duration_hours: abc, coastal_domain: gulf, meteo_source: nwm_ana}",
        )
        .unwrap_err();

        let messages = err.messages();
        assert_eq!(messages.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m == "simulation.start_date is required"));
        assert!(messages
            .iter()
            .any(|m| m.starts_with("simulation.duration_hours: invalid type")));
        assert!(messages
            .iter()
            .any(|m| m.contains("unknown coastal domain 'gulf'")));
    }

    #[test]
    fn test_unknown_section_field_reported_with_others() {
        let err = resolve_str(
            r#"
simulation:
  start_date: 2021-06-11
  duration_hours: 24
  coastal_domain: hawaii
  meteo_source: nwm_ana
  duraton_hours: 12
slurm:
  partition: [not, a, string]
"#,
        )
        .unwrap_err();

        let messages = err.messages().join("\n");
        assert!(messages.contains("unknown field 'duraton_hours'"));
        assert!(messages.contains("slurm:"));
    }

    #[test]
    fn test_duration_past_date_range_rejected() {
        let err = resolve_str(&HAWAII.replace("duration_hours: 24", "duration_hours: 1000000000000000"))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
        assert!(err.to_string().contains("past the representable date range"));
    }

    #[test]
    fn test_base_chain_child_wins() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("base.yaml"),
            r#"
slurm:
  partition: compute
  account: coastal
simulation:
  start_date: 2021-06-11T06:00:00
  duration_hours: 48
  coastal_domain: pacific
  meteo_source: nwm_retro
paths:
  root_dir: /data/coastal
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("run.yaml"),
            r#"
_base: base.yaml
simulation:
  duration_hours: 6
  coastal_domain: atlgulf
"#,
        )
        .unwrap();

        let config = resolve(&dir.path().join("run.yaml")).unwrap();
        assert_eq!(config.slurm.partition, "compute");
        assert_eq!(config.slurm.account.as_deref(), Some("coastal"));
        assert_eq!(config.simulation.duration_hours, 6);
        assert_eq!(config.simulation.coastal_domain, CoastalDomain::Atlgulf);
        assert_eq!(
            config.paths.work_dir,
            PathBuf::from("/data/coastal/schism_atlgulf_tpxo_nwm_retro_2021061106")
        );
    }

    #[test]
    fn test_base_cycle_is_load_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yaml"), "_base: b.yaml\n").unwrap();
        fs::write(dir.path().join("b.yaml"), "_base: a.yaml\n").unwrap();

        let err = resolve(&dir.path().join("a.yaml")).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad { .. }));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let err = resolve(Path::new("/nonexistent/run.yaml")).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_json_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{"simulation": {"start_date": "2022-01-01", "duration_hours": 3,
                "coastal_domain": "prvi", "meteo_source": "nwm_retro"}}"#,
        )
        .unwrap();

        let config = resolve(&path).unwrap();
        assert_eq!(config.simulation.coastal_domain, CoastalDomain::Prvi);
    }

    #[test]
    fn test_interpolation_keeps_whole_leaf_type() {
        let tree = yaml(
            r#"
vars: {hours: 36, name: run}
simulation: {duration_hours: "${vars.hours}"}
slurm: {job_name: "calib_${vars.name}_${vars.hours}h"}
"#,
        );

        let resolved = interpolate(&tree).unwrap();
        assert_eq!(resolved["simulation"]["duration_hours"], Value::from(36));
        assert_eq!(resolved["slurm"]["job_name"], Value::from("calib_run_36h"));
    }

    #[test]
    fn test_interpolation_idempotent() {
        let tree = yaml(
            r#"
model: sfincs
vars: {root: /scratch}
paths: {root_dir: "${vars.root}/${model}"}
"#,
        );

        let once = interpolate(&tree).unwrap();
        let twice = interpolate(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once["paths"]["root_dir"], Value::from("/scratch/sfincs"));
    }

    #[test]
    fn test_interpolation_chained_token_rejected() {
        let tree = yaml(
            r#"
a: {x: "${b.y}"}
b: {y: "${c.z}"}
c: {z: value}
"#,
        );

        let err = interpolate(&tree).unwrap_err();
        let messages = err.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("a.x"));
        assert!(messages[0].contains("circular or unresolved"));
    }

    #[test]
    fn test_interpolation_undefined_and_unterminated() {
        let tree = yaml(
            r#"
a: "${missing.field}"
b: "${oops"
"#,
        );

        let messages = interpolate(&tree).unwrap_err().messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("undefined field"));
        assert!(messages[1].contains("unterminated"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let err = resolve_str(
            r#"
simulation:
  duration_hours: 0
  coastal_domain: gulf
  meteo_source: nwm_ana
"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::ConfigValidation(_)));
        let messages = err.messages().join("\n");
        assert!(messages.contains("simulation.start_date is required"));
        assert!(messages.contains("duration_hours must be > 0"));
        assert!(messages.contains("unknown coastal domain 'gulf'"));
    }

    #[test]
    fn test_start_date_must_be_on_the_hour() {
        let err = resolve_str(&HAWAII.replace("2021-06-11", "2021-06-11T06:30:00")).unwrap_err();
        assert!(err.to_string().contains("must fall on the hour"));
    }

    #[test]
    fn test_explicit_work_dir_feeds_derived_paths() {
        let yaml = format!("{HAWAII}paths:\n  work_dir: /scratch/run1\n");
        let config = resolve_str(&yaml).unwrap();
        assert_eq!(config.paths.work_dir, PathBuf::from("/scratch/run1"));
        assert_eq!(config.paths.raw_download_dir, PathBuf::from("/scratch/run1/raw_data"));
    }

    #[test]
    fn test_sfincs_requires_prebuilt_dir() {
        let yaml = HAWAII.replace("model: schism", "model: sfincs");
        let err = resolve_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("prebuilt_dir"));
    }

    #[test]
    fn test_schism_scribes_checked_against_ranks() {
        let yaml = format!("{HAWAII}model_config:\n  nodes: 1\n  ntasks_per_node: 2\n  nscribes: 2\n");
        let err = resolve_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("nscribes"));
    }

    #[test]
    fn test_snapshot_resolves_identically() {
        let dir = TempDir::new().unwrap();
        let config = resolve_str(HAWAII).unwrap();

        let snapshot = dir.path().join("resolved.yaml");
        fs::write(&snapshot, config.to_yaml().unwrap()).unwrap();
        let reloaded = resolve(&snapshot).unwrap();

        assert_eq!(reloaded.paths.work_dir, config.paths.work_dir);
        assert_eq!(reloaded.simulation.start_date, config.simulation.start_date);
        assert_eq!(reloaded.boundary.source, BoundarySource::Stofs);
        assert_eq!(reloaded.to_yaml().unwrap(), config.to_yaml().unwrap());
    }
}
