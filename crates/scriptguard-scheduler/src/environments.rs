//! Environment registry. Discovers the interpreters tasks can run under.
//!
//! Sources are scanned in order (declared, conda, PATH); the first source to
//! report an id wins. A failing source is skipped with a warning so one broken
//! conda install never hides the rest.

use async_trait::async_trait;
use scriptguard_core::config::{DeclaredEnvironment, DiscoveryConfig};
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::{Environment, EnvironmentKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Something that can produce environments.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    fn name(&self) -> &str;
    async fn scan(&self) -> Result<Vec<Environment>>;
}

// ─── Declared ─────────────────────────────────────────────

/// Environments listed under `[[environments]]` in config.
pub struct DeclaredSource {
    declared: Vec<DeclaredEnvironment>,
}

impl DeclaredSource {
    pub fn new(declared: Vec<DeclaredEnvironment>) -> Self {
        Self { declared }
    }
}

#[async_trait]
impl EnvironmentSource for DeclaredSource {
    fn name(&self) -> &str {
        "declared"
    }

    async fn scan(&self) -> Result<Vec<Environment>> {
        Ok(self
            .declared
            .iter()
            .map(|d| {
                let executable = shellexpand::tilde(&d.executable).to_string();
                let name = d.name.as_deref().unwrap_or(&d.id);
                Environment::detect(&d.id, name, &executable, EnvironmentKind::Declared)
            })
            .collect())
    }
}

// ─── Conda ────────────────────────────────────────────────

/// `conda env list` output.
pub struct CondaSource {
    conda: String,
    timeout: Duration,
}

impl CondaSource {
    pub fn new(conda: &str, timeout: Duration) -> Self {
        Self {
            conda: conda.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl EnvironmentSource for CondaSource {
    fn name(&self) -> &str {
        "conda"
    }

    async fn scan(&self) -> Result<Vec<Environment>> {
        let mut cmd = tokio::process::Command::new(&self.conda);
        cmd.args(["env", "list"])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ScriptGuardError::Process(format!(
                    "`{} env list` timed out after {:?}",
                    self.conda, self.timeout
                ))
            })?
            .map_err(|e| ScriptGuardError::Process(format!("`{} env list`: {e}", self.conda)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScriptGuardError::Process(format!(
                "`{} env list` exited with {}: {}",
                self.conda,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_conda_env_list(&stdout)
            .into_iter()
            .map(|(name, prefix)| {
                let python = conda_python(&prefix);
                Environment::detect(
                    &name,
                    &name,
                    &python.to_string_lossy(),
                    EnvironmentKind::Conda,
                )
            })
            .collect())
    }
}

/// `(name, prefix)` pairs from `conda env list`. Comment lines and unnamed
/// prefix-only entries are skipped; the active-env `*` marker is ignored.
pub fn parse_conda_env_list(output: &str) -> Vec<(String, PathBuf)> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let (name, rest) = line.split_once(char::is_whitespace)?;
            let rest = rest.trim_start();
            let prefix = rest.strip_prefix('*').unwrap_or(rest).trim();
            if prefix.is_empty() {
                return None;
            }
            Some((name.to_string(), PathBuf::from(prefix)))
        })
        .collect()
}

fn conda_python(prefix: &Path) -> PathBuf {
    if cfg!(windows) {
        prefix.join("python.exe")
    } else {
        prefix.join("bin").join("python")
    }
}

// ─── PATH ─────────────────────────────────────────────────

/// Well-known interpreters found on PATH.
pub struct PathSource {
    interpreters: Vec<String>,
}

impl PathSource {
    pub fn new(interpreters: Vec<String>) -> Self {
        Self { interpreters }
    }
}

#[async_trait]
impl EnvironmentSource for PathSource {
    fn name(&self) -> &str {
        "path"
    }

    async fn scan(&self) -> Result<Vec<Environment>> {
        let mut found = Vec::new();
        for name in &self.interpreters {
            match which::which(name) {
                Ok(path) => found.push(Environment::detect(
                    name,
                    name,
                    &path.to_string_lossy(),
                    EnvironmentKind::System,
                )),
                Err(e) => tracing::debug!("PATH scan: {name} not found: {e}"),
            }
        }
        Ok(found)
    }
}

// ─── Registry ─────────────────────────────────────────────

/// Cached, de-duplicated view over all sources.
pub struct EnvironmentRegistry {
    sources: Vec<Box<dyn EnvironmentSource>>,
    cache: RwLock<Option<Vec<Environment>>>,
    scan_lock: Mutex<()>,
}

impl EnvironmentRegistry {
    pub fn new(sources: Vec<Box<dyn EnvironmentSource>>) -> Self {
        Self {
            sources,
            cache: RwLock::new(None),
            scan_lock: Mutex::new(()),
        }
    }

    /// Build the standard source chain from config.
    pub fn from_config(discovery: &DiscoveryConfig, declared: &[DeclaredEnvironment]) -> Self {
        let mut sources: Vec<Box<dyn EnvironmentSource>> =
            vec![Box::new(DeclaredSource::new(declared.to_vec()))];
        if discovery.scan_conda {
            sources.push(Box::new(CondaSource::new(
                &discovery.conda_executable,
                Duration::from_secs(discovery.scan_timeout_secs.max(1)),
            )));
        }
        if discovery.scan_path {
            sources.push(Box::new(PathSource::new(discovery.path_interpreters.clone())));
        }
        Self::new(sources)
    }

    /// Cached list; scans on first use.
    pub async fn list(&self) -> Vec<Environment> {
        if let Some(envs) = self.cache.read().await.as_ref() {
            return envs.clone();
        }
        let _scan = self.scan_lock.lock().await;
        // Another caller may have finished a scan while we waited.
        if let Some(envs) = self.cache.read().await.as_ref() {
            return envs.clone();
        }
        self.scan_into_cache().await
    }

    /// Force a rescan.
    pub async fn refresh(&self) -> Vec<Environment> {
        let _scan = self.scan_lock.lock().await;
        self.scan_into_cache().await
    }

    pub async fn resolve(&self, id: &str) -> Result<Environment> {
        self.list()
            .await
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| ScriptGuardError::not_found("Environment", id))
    }

    async fn scan_into_cache(&self) -> Vec<Environment> {
        let envs = self.scan_all().await;
        *self.cache.write().await = Some(envs.clone());
        envs
    }

    async fn scan_all(&self) -> Vec<Environment> {
        let mut seen = HashSet::new();
        let mut envs = Vec::new();
        for source in &self.sources {
            match source.scan().await {
                Ok(found) => {
                    for env in found {
                        if seen.insert(env.id.clone()) {
                            envs.push(env);
                        } else {
                            tracing::debug!(
                                "Environment '{}' from {} shadowed by an earlier source",
                                env.id,
                                source.name()
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!("⚠️ Environment source '{}' failed: {e}", source.name()),
            }
        }
        tracing::info!("🐍 Environment scan: {} found", envs.len());
        envs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptguard_core::types::EnvironmentStatus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        label: &'static str,
        envs: Vec<Environment>,
        scans: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EnvironmentSource for Fixed {
        fn name(&self) -> &str {
            self.label
        }
        async fn scan(&self) -> Result<Vec<Environment>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(self.envs.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl EnvironmentSource for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn scan(&self) -> Result<Vec<Environment>> {
            Err(ScriptGuardError::Process("boom".into()))
        }
    }

    fn env(id: &str, exe: &str, kind: EnvironmentKind) -> Environment {
        Environment::detect(id, id, exe, kind)
    }

    #[test]
    fn test_parse_conda_env_list() {
        let out = "\
# conda environments:
#
base                  *  /opt/miniconda3
py39                     /opt/miniconda3/envs/py39
ds                       /home/me/envs/ds
/opt/orphan/prefix

";
        let parsed = parse_conda_env_list(out);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], ("base".to_string(), PathBuf::from("/opt/miniconda3")));
        assert_eq!(parsed[1].0, "py39");
        assert_eq!(parsed[1].1, PathBuf::from("/opt/miniconda3/envs/py39"));
        assert_eq!(parsed[2].0, "ds");
    }

    #[tokio::test]
    async fn test_declared_source_checks_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("python");
        std::fs::write(&exe, "").unwrap();

        let source = DeclaredSource::new(vec![
            DeclaredEnvironment {
                id: "py39".into(),
                name: Some("Python 3.9".into()),
                executable: exe.to_string_lossy().into_owned(),
            },
            DeclaredEnvironment {
                id: "gone".into(),
                name: None,
                executable: "/no/such/python".into(),
            },
        ]);
        let envs = source.scan().await.unwrap();
        assert_eq!(envs[0].name, "Python 3.9");
        assert_eq!(envs[0].status, EnvironmentStatus::Discovered);
        assert_eq!(envs[1].name, "gone");
        assert_eq!(envs[1].status, EnvironmentStatus::Missing);
    }

    #[tokio::test]
    async fn test_first_source_wins_and_failures_skipped() {
        let scans = Arc::new(AtomicUsize::new(0));
        let registry = EnvironmentRegistry::new(vec![
            Box::new(Fixed {
                label: "declared",
                envs: vec![env("py39", "/declared/python", EnvironmentKind::Declared)],
                scans: scans.clone(),
            }),
            Box::new(Broken),
            Box::new(Fixed {
                label: "conda",
                envs: vec![
                    env("py39", "/conda/python", EnvironmentKind::Conda),
                    env("base", "/conda/base/python", EnvironmentKind::Conda),
                ],
                scans: scans.clone(),
            }),
        ]);

        let envs = registry.list().await;
        assert_eq!(envs.len(), 2);
        let py39 = registry.resolve("py39").await.unwrap();
        assert_eq!(py39.kind, EnvironmentKind::Declared);
        assert_eq!(py39.executable, "/declared/python");
        assert!(registry.resolve("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cached_until_refresh() {
        let scans = Arc::new(AtomicUsize::new(0));
        let registry = EnvironmentRegistry::new(vec![Box::new(Fixed {
            label: "fixed",
            envs: vec![env("sh", "/bin/sh", EnvironmentKind::System)],
            scans: scans.clone(),
        })]);

        registry.list().await;
        registry.list().await;
        registry.resolve("sh").await.unwrap();
        assert_eq!(scans.load(Ordering::SeqCst), 1);

        registry.refresh().await;
        assert_eq!(scans.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_conda_source_runs_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("conda");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho '# conda environments:'\necho 'base  *  /opt/conda'\necho 'py39     /opt/conda/envs/py39'\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = CondaSource::new(&fake.to_string_lossy(), Duration::from_secs(5));
        let envs = source.scan().await.unwrap();
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[1].id, "py39");
        assert_eq!(envs[1].executable, "/opt/conda/envs/py39/bin/python");
        assert_eq!(envs[1].kind, EnvironmentKind::Conda);
    }

    #[tokio::test]
    async fn test_conda_source_missing_binary_errors() {
        let source = CondaSource::new("/no/such/conda", Duration::from_secs(1));
        assert!(source.scan().await.is_err());
    }
}
