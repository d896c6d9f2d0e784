// src/build/adapter.rs

//! Build-system adapter contract
//!
//! The orchestrator knows nothing about build tools. Given one concrete spec,
//! its stage paths, and the install prefixes of its dependencies, an adapter
//! performs configure/build/install into the stage's install dir and returns
//! the captured log. The subprocess-backed [`CommandBuildSystem`] is the
//! reference implementation; anything else plugs in through [`BuildSystem`].

use crate::build::CancellationToken;
use crate::error::{Error, Result};
use crate::spec::ConcreteSpec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Everything an adapter may consult while building one node
pub struct BuildContext<'a> {
    pub spec: &'a Arc<ConcreteSpec>,
    /// Staged source tree
    pub source_dir: &'a Path,
    /// Stage destdir; the adapter assembles the final tree here
    pub install_dir: &'a Path,
    /// Install prefixes of direct dependencies, keyed by package name
    pub dep_prefixes: &'a BTreeMap<String, PathBuf>,
    /// Parallel-job count the build may use
    pub jobs: usize,
    /// Per-node wall-clock limit, if any
    pub timeout: Option<Duration>,
    pub cancel: &'a CancellationToken,
}

/// Captured output of one build
#[derive(Debug, Clone, Default)]
pub struct BuildLog(pub String);

impl BuildLog {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Contract between the orchestrator and native build tooling
pub trait BuildSystem: Send + Sync {
    fn name(&self) -> &str;

    /// Perform configure/build/install into `ctx.install_dir`.
    /// On error, return the failure with whatever log was captured folded
    /// into the message; the orchestrator records both.
    fn build(&self, ctx: &BuildContext<'_>) -> Result<BuildLog>;
}

/// Reference adapter: runs configured shell phases via `sh -c`.
///
/// Each phase sees the stage through environment variables:
/// `QUARRY_SOURCE`, `QUARRY_PREFIX`, `QUARRY_JOBS`, and one
/// `QUARRY_DEP_<NAME>` per dependency prefix. Phases run in the source
/// directory and their combined output is the build log.
pub struct CommandBuildSystem {
    phases: Vec<String>,
}

impl CommandBuildSystem {
    pub fn new(phases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            phases: phases.into_iter().map(Into::into).collect(),
        }
    }
}

impl BuildSystem for CommandBuildSystem {
    fn name(&self) -> &str {
        "command"
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<BuildLog> {
        let mut log = String::new();

        for phase in &self.phases {
            if ctx.cancel.is_cancelled() {
                return Err(Error::BuildFailed {
                    package: ctx.spec.name.clone(),
                    cause: "build cancelled".to_string(),
                });
            }

            debug!(spec = %ctx.spec, phase = %phase, "running build phase");
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(phase)
                .current_dir(ctx.source_dir)
                .env("QUARRY_SOURCE", ctx.source_dir)
                .env("QUARRY_PREFIX", ctx.install_dir)
                .env("QUARRY_JOBS", ctx.jobs.to_string())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            for (name, prefix) in ctx.dep_prefixes {
                let key = format!("QUARRY_DEP_{}", name.to_uppercase().replace('-', "_"));
                command.env(key, prefix);
            }

            let mut child = command.spawn()?;

            // Drain pipes while waiting so a chatty build cannot fill the
            // pipe buffer and deadlock against our poll loop
            let stdout_reader = child.stdout.take().map(spawn_reader);
            let stderr_reader = child.stderr.take().map(spawn_reader);

            let status = wait_for_phase(&mut child, ctx)?;

            for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
                if let Ok(chunk) = reader.join() {
                    log.push_str(&chunk);
                }
            }

            match status {
                PhaseEnd::Exited(status) if status.success() => {}
                PhaseEnd::Exited(status) => {
                    return Err(Error::BuildFailed {
                        package: ctx.spec.name.clone(),
                        cause: format!("phase '{}' exited with {}: {}", phase, status, log),
                    });
                }
                PhaseEnd::TimedOut => {
                    return Err(Error::BuildFailed {
                        package: ctx.spec.name.clone(),
                        cause: format!("phase '{}' exceeded the build timeout", phase),
                    });
                }
                PhaseEnd::Cancelled => {
                    return Err(Error::BuildFailed {
                        package: ctx.spec.name.clone(),
                        cause: "build cancelled".to_string(),
                    });
                }
            }
        }

        Ok(BuildLog(log))
    }
}

fn spawn_reader<R: std::io::Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = pipe.read_to_string(&mut buffer);
        buffer
    })
}

enum PhaseEnd {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Wait for a phase while polling cancellation and the per-node timeout.
/// Interrupted children are killed, never orphaned.
fn wait_for_phase(child: &mut std::process::Child, ctx: &BuildContext<'_>) -> Result<PhaseEnd> {
    const POLL: Duration = Duration::from_millis(100);
    let started = std::time::Instant::now();

    loop {
        if ctx.cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(PhaseEnd::Cancelled);
        }
        if let Some(limit) = ctx.timeout
            && started.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(PhaseEnd::TimedOut);
        }
        if let Some(status) = child.wait_timeout(POLL)? {
            return Ok(PhaseEnd::Exited(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::CompilerSpec;
    use crate::version::Version;
    use std::collections::BTreeMap as Map;

    fn spec() -> Arc<ConcreteSpec> {
        Arc::new(ConcreteSpec::new(
            "hello".to_string(),
            Version::parse("1.0").unwrap(),
            Map::new(),
            CompilerSpec::new("gcc", Version::parse("12.2").unwrap()),
            "x86_64".to_string(),
            Map::new(),
        ))
    }

    fn context<'a>(
        spec: &'a Arc<ConcreteSpec>,
        source: &'a Path,
        install: &'a Path,
        deps: &'a BTreeMap<String, PathBuf>,
        cancel: &'a CancellationToken,
        timeout: Option<Duration>,
    ) -> BuildContext<'a> {
        BuildContext {
            spec,
            source_dir: source,
            install_dir: install,
            dep_prefixes: deps,
            jobs: 1,
            timeout,
            cancel,
        }
    }

    #[test]
    fn test_phases_install_into_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let install = dir.path().join("install");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&install).unwrap();

        let spec = spec();
        let deps = BTreeMap::new();
        let cancel = CancellationToken::new();
        let adapter = CommandBuildSystem::new([
            "mkdir -p \"$QUARRY_PREFIX/bin\"",
            "printf hello > \"$QUARRY_PREFIX/bin/hello\"",
        ]);

        let log = adapter
            .build(&context(&spec, &source, &install, &deps, &cancel, None))
            .unwrap();
        assert!(install.join("bin/hello").exists());
        assert!(log.as_str().is_empty());
    }

    #[test]
    fn test_failing_phase_reports_cause() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let install = dir.path().join("install");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&install).unwrap();

        let spec = spec();
        let deps = BTreeMap::new();
        let cancel = CancellationToken::new();
        let adapter = CommandBuildSystem::new(["echo compiling...", "exit 3"]);

        let err = adapter
            .build(&context(&spec, &source, &install, &deps, &cancel, None))
            .unwrap_err();
        match err {
            Error::BuildFailed { package, cause } => {
                assert_eq!(package, "hello");
                assert!(cause.contains("exit 3"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills_phase() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let install = dir.path().join("install");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&install).unwrap();

        let spec = spec();
        let deps = BTreeMap::new();
        let cancel = CancellationToken::new();
        let adapter = CommandBuildSystem::new(["sleep 30"]);

        let started = std::time::Instant::now();
        let err = adapter
            .build(&context(
                &spec,
                &source,
                &install,
                &deps,
                &cancel,
                Some(Duration::from_millis(300)),
            ))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, Error::BuildFailed { .. }));
    }

    #[test]
    fn test_dep_prefixes_exported() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let install = dir.path().join("install");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&install).unwrap();

        let spec = spec();
        let mut deps = BTreeMap::new();
        deps.insert("zlib-ng".to_string(), PathBuf::from("/opt/store/zlib-ng"));
        let cancel = CancellationToken::new();
        let adapter =
            CommandBuildSystem::new(["printf '%s' \"$QUARRY_DEP_ZLIB_NG\" > \"$QUARRY_PREFIX/dep\""]);

        adapter
            .build(&context(&spec, &source, &install, &deps, &cancel, None))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(install.join("dep")).unwrap(),
            "/opt/store/zlib-ng"
        );
    }
}
