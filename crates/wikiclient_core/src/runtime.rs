use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{
    DEFAULT_SESSION_COOKIE, DEFAULT_TIMEOUT_MS, DEFAULT_USER_AGENT, WikiConfigPatch,
    lookup_nonempty, patch_wiki_config,
};

pub const STATE_DIR_NAME: &str = ".wikiclient";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const SESSION_FILENAME: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub state_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub session_path: PathBuf,
    pub state_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "state_dir={} ({})\nconfig_path={} ({})\nsession_path={}\nconfig_exists={}\nsession_exists={}",
            normalize_for_display(&self.state_dir),
            self.state_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.session_path),
            self.config_path.exists(),
            self.session_path.exists(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub url: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_state_dir: bool,
    pub wrote_config: bool,
    pub patched_url: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (state_dir, state_source) = if let Some(path) = overrides.state_dir.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_nonempty(&lookup_env, "WIKICLIENT_STATE_DIR") {
        (
            absolutize(Path::new(&value), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.join(STATE_DIR_NAME), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_nonempty(&lookup_env, "WIKICLIENT_CONFIG") {
        (
            absolutize(Path::new(&value), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    if config_path.is_dir() {
        bail!(
            "config path points at a directory: {}",
            normalize_for_display(&config_path)
        );
    }

    Ok(ResolvedPaths {
        session_path: state_dir.join(SESSION_FILENAME),
        state_dir,
        config_path,
        state_source,
        config_source,
    })
}

/// Create the state directory and a commented default config, then record `url` if given.
pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let created_state_dir = if paths.state_dir.exists() {
        false
    } else {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
        true
    };

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_default_config(),
        options.force,
    )?;

    let patched_url = match options.url.as_deref() {
        Some(url) => patch_wiki_config(
            &paths.config_path,
            &WikiConfigPatch {
                set_url: Some(url.to_string()),
                ..WikiConfigPatch::default()
            },
        )?,
        None => false,
    };

    Ok(InitReport {
        created_state_dir,
        wrote_config,
        patched_url,
    })
}

pub fn render_default_config() -> String {
    format!(
        "# wikiclient configuration (written by `wikiclient init`)\n\n[wiki]\n# url = \"https://wiki.example.org\"\n# user_agent = \"{DEFAULT_USER_AGENT}\"\n# session_cookie = \"{DEFAULT_SESSION_COOKIE}\"\n# timeout_ms = {DEFAULT_TIMEOUT_MS}\n\n[search]\ncontent_scan_limit = 50\nbatch_size = 5\nsnippet_radius = 20\nrecent_changes_limit = 20\ncache_ttl_secs = 300\n\n[access]\npublic_namespaces = [\"playground\", \"solutions\"]\n",
    )
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, init_layout,
        resolve_paths_with_lookup,
    };
    use crate::config::load_config;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag-state");
        let overrides = PathOverrides {
            state_dir: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([(
            "WIKICLIENT_STATE_DIR".to_string(),
            temp.path().join("env-state").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.state_dir, from_flag);
        assert_eq!(resolved.state_source, ValueSource::Flag);
        assert_eq!(resolved.config_path, from_flag.join("config.toml"));
        assert_eq!(resolved.session_path, from_flag.join("session.json"));
    }

    #[test]
    fn resolve_paths_uses_env_then_default() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([("WIKICLIENT_CONFIG".to_string(), "custom.toml".to_string())]);

        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve");
        assert_eq!(resolved.state_dir, temp.path().join(".wikiclient"));
        assert_eq!(resolved.state_source, ValueSource::Default);
        assert_eq!(resolved.config_path, temp.path().join("custom.toml"));
        assert_eq!(resolved.config_source, ValueSource::Env);
    }

    #[test]
    fn resolve_paths_ignores_blank_env_values() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([
            ("WIKICLIENT_STATE_DIR".to_string(), "   ".to_string()),
            ("WIKICLIENT_CONFIG".to_string(), String::new()),
        ]);

        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve");
        assert_eq!(resolved.state_dir, temp.path().join(".wikiclient"));
        assert_eq!(resolved.state_source, ValueSource::Default);
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn resolve_paths_rejects_directory_config() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let overrides = PathOverrides {
            config: Some(temp.path().to_path_buf()),
            ..PathOverrides::default()
        };
        let err = resolve_paths_with_lookup(&context, &overrides, |_| None).expect_err("must fail");
        assert!(err.to_string().contains("points at a directory"));
    }

    #[test]
    fn init_layout_writes_loadable_config_and_url() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let paths = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");

        let report = init_layout(
            &paths,
            &InitOptions {
                url: Some("https://wiki.example.org".to_string()),
                force: false,
            },
        )
        .expect("init");
        assert!(report.created_state_dir);
        assert!(report.wrote_config);
        assert!(report.patched_url);

        let config = load_config(&paths.config_path).expect("load");
        assert_eq!(config.wiki.url.as_deref(), Some("https://wiki.example.org"));
        assert_eq!(config.search.batch_size, 5);
    }

    #[test]
    fn init_layout_keeps_existing_config_without_force() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let paths = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        fs::create_dir_all(&paths.state_dir).expect("state dir");
        fs::write(&paths.config_path, "[wiki]\nurl = \"https://old.example\"\n").expect("seed");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert!(!report.created_state_dir);
        assert!(!report.wrote_config);
        let content = fs::read_to_string(&paths.config_path).expect("read");
        assert!(content.contains("old.example"));
    }
}
